//! Noise-prediction UNet for denoising diffusion
//!
//! Two resolution levels with skip connections. Every residual block is
//! conditioned on the diffusion timestep through a sinusoidal embedding and
//! a per-block projection. Input height and width must be divisible by 4.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        GroupNorm, GroupNormConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{activation::silu, backend::Backend, Int, Tensor, TensorData},
};

#[derive(Config, Debug)]
pub struct DiffusionUNetConfig {
    #[config(default = "1")]
    pub in_channels: usize,

    #[config(default = "32")]
    pub base_channels: usize,

    #[config(default = "128")]
    pub time_embed_dim: usize,
}

impl DiffusionUNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DiffusionUNet<B> {
        DiffusionUNet::new(self, device)
    }
}

/// Sinusoidal embedding of (possibly fractional) timesteps: `[B]` -> `[B, dim]`
pub fn timestep_embedding<B: Backend>(timesteps: Tensor<B, 1>, dim: usize) -> Tensor<B, 2> {
    let device = timesteps.device();
    let half = (dim / 2).max(1);
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(10_000f64.ln()) * i as f64 / half as f64).exp() as f32)
        .collect();
    let freqs = Tensor::<B, 1>::from_floats(TensorData::new(freqs, [half]), &device);

    let args = timesteps.unsqueeze_dim::<2>(1) * freqs.unsqueeze_dim::<2>(0);
    let emb = Tensor::cat(vec![args.clone().sin(), args.cos()], 1);
    if dim % 2 == 1 {
        let [batch, _] = emb.dims();
        Tensor::cat(vec![emb, Tensor::zeros([batch, 1], &device)], 1)
    } else {
        emb
    }
}

fn group_norm<B: Backend>(channels: usize, device: &B::Device) -> GroupNorm<B> {
    let groups = if channels % 8 == 0 { 8 } else { 1 };
    GroupNormConfig::new(groups, channels).init(device)
}

fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

/// GroupNorm -> SiLU -> Conv, twice, with the timestep added in between
#[derive(Module, Debug)]
pub struct ResBlock<B: Backend> {
    norm1: GroupNorm<B>,
    conv1: Conv2d<B>,
    time_proj: Linear<B>,
    norm2: GroupNorm<B>,
    conv2: Conv2d<B>,
    skip: Option<Conv2d<B>>,
}

impl<B: Backend> ResBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, time_dim: usize, device: &B::Device) -> Self {
        let skip = (in_channels != out_channels)
            .then(|| Conv2dConfig::new([in_channels, out_channels], [1, 1]).init(device));
        Self {
            norm1: group_norm(in_channels, device),
            conv1: conv3x3(in_channels, out_channels, device),
            time_proj: LinearConfig::new(time_dim, out_channels).init(device),
            norm2: group_norm(out_channels, device),
            conv2: conv3x3(out_channels, out_channels, device),
            skip,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, temb: Tensor<B, 2>) -> Tensor<B, 4> {
        let h = self.conv1.forward(silu(self.norm1.forward(x.clone())));

        let [batch, channels, _, _] = h.dims();
        let t = self.time_proj.forward(silu(temb)).reshape([batch, channels, 1, 1]);
        let h = h + t;

        let h = self.conv2.forward(silu(self.norm2.forward(h)));
        let residual = match &self.skip {
            Some(conv) => conv.forward(x),
            None => x,
        };
        h + residual
    }
}

#[derive(Module, Debug)]
pub struct DiffusionUNet<B: Backend> {
    time_fc1: Linear<B>,
    time_fc2: Linear<B>,
    conv_in: Conv2d<B>,
    res1: ResBlock<B>,
    down1: Conv2d<B>,
    res2: ResBlock<B>,
    down2: Conv2d<B>,
    mid: ResBlock<B>,
    up2: ConvTranspose2d<B>,
    res_up2: ResBlock<B>,
    up1: ConvTranspose2d<B>,
    res_up1: ResBlock<B>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2d<B>,
    time_embed_dim: usize,
}

impl<B: Backend> DiffusionUNet<B> {
    pub fn new(config: &DiffusionUNetConfig, device: &B::Device) -> Self {
        let c = config.base_channels;
        let t = config.time_embed_dim;
        let downsample = |channels: usize| {
            Conv2dConfig::new([channels, channels], [3, 3])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        let upsample = |channels: usize| {
            ConvTranspose2dConfig::new([channels, channels], [4, 4])
                .with_stride([2, 2])
                .with_padding([1, 1])
                .init(device)
        };

        Self {
            time_fc1: LinearConfig::new(t, t).init(device),
            time_fc2: LinearConfig::new(t, t).init(device),
            conv_in: conv3x3(config.in_channels, c, device),
            res1: ResBlock::new(c, c, t, device),
            down1: downsample(c),
            res2: ResBlock::new(c, 2 * c, t, device),
            down2: downsample(2 * c),
            mid: ResBlock::new(2 * c, 2 * c, t, device),
            up2: upsample(2 * c),
            res_up2: ResBlock::new(4 * c, 2 * c, t, device),
            up1: upsample(2 * c),
            res_up1: ResBlock::new(3 * c, c, t, device),
            norm_out: group_norm(c, device),
            conv_out: conv3x3(c, config.in_channels, device),
            time_embed_dim: t,
        }
    }

    /// Predict the noise in `x` at `timesteps`: `[B, C, H, W]`, `[B]` -> `[B, C, H, W]`
    pub fn forward(&self, x: Tensor<B, 4>, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 4> {
        let temb = timestep_embedding(timesteps.float(), self.time_embed_dim);
        let temb = self.time_fc2.forward(silu(self.time_fc1.forward(temb)));

        let h = self.conv_in.forward(x);
        let h1 = self.res1.forward(h, temb.clone());
        let h2 = self.res2.forward(self.down1.forward(h1.clone()), temb.clone());
        let h = self.mid.forward(self.down2.forward(h2.clone()), temb.clone());

        let h = Tensor::cat(vec![self.up2.forward(h), h2], 1);
        let h = self.res_up2.forward(h, temb.clone());
        let h = Tensor::cat(vec![self.up1.forward(h), h1], 1);
        let h = self.res_up1.forward(h, temb);

        self.conv_out.forward(silu(self.norm_out.forward(h)))
    }
}
