//! Convolutional classifier for chest X-rays
//!
//! A stack of conv/batch-norm/ReLU/max-pool stages with doubling widths,
//! global average pooling and a two-layer head. Works on grayscale or
//! three-channel input of any size divisible by `2^num_blocks`.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Tensor},
};

#[derive(Config, Debug)]
pub struct CxrClassifierConfig {
    pub num_classes: usize,

    /// 1 for grayscale scans, 3 for replicated or RGB input
    #[config(default = "1")]
    pub in_channels: usize,

    /// Width of the first stage; each later stage doubles it
    #[config(default = "32")]
    pub base_filters: usize,

    #[config(default = "4")]
    pub num_blocks: usize,

    #[config(default = "0.3")]
    pub dropout: f64,

    #[config(default = "256")]
    pub hidden_size: usize,
}

impl CxrClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CxrClassifier<B> {
        CxrClassifier::new(self, device)
    }

    fn stage_widths(&self) -> Vec<usize> {
        (0..self.num_blocks.max(1)).map(|i| self.base_filters << i).collect()
    }
}

/// Conv 3x3 -> BatchNorm -> ReLU -> MaxPool 2x2
#[derive(Module, Debug)]
pub struct ConvStage<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B>,
    activation: Relu,
    pool: MaxPool2d,
}

impl<B: Backend> ConvStage<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            norm: BatchNormConfig::new(out_channels).init(device),
            activation: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        let x = self.activation.forward(x);
        self.pool.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct CxrClassifier<B: Backend> {
    stages: Vec<ConvStage<B>>,
    global_pool: AdaptiveAvgPool2d,
    fc1: Linear<B>,
    dropout: Dropout,
    fc2: Linear<B>,
    activation: Relu,
    num_classes: usize,
}

impl<B: Backend> CxrClassifier<B> {
    pub fn new(config: &CxrClassifierConfig, device: &B::Device) -> Self {
        let widths = config.stage_widths();
        let mut in_channels = config.in_channels;
        let stages = widths
            .iter()
            .map(|&width| {
                let stage = ConvStage::new(in_channels, width, device);
                in_channels = width;
                stage
            })
            .collect();

        Self {
            stages,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(in_channels, config.hidden_size).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
            fc2: LinearConfig::new(config.hidden_size, config.num_classes).init(device),
            activation: Relu::new(),
            num_classes: config.num_classes,
        }
    }

    /// `[batch, channels, height, width]` -> logits `[batch, num_classes]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stages.iter().fold(x, |x, stage| stage.forward(x));
        let x = self.global_pool.forward(x);

        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    /// Class probabilities
    pub fn forward_softmax(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(x), 1)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_classifier_output_shape() {
        let device = Default::default();
        let model = CxrClassifierConfig::new(2)
            .with_base_filters(4)
            .with_hidden_size(8)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::zeros([3, 1, 32, 32], &device);
        assert_eq!(model.forward(input).dims(), [3, 2]);
        assert_eq!(model.num_classes(), 2);
    }

    #[test]
    fn test_rgb_input_and_softmax() {
        let device = Default::default();
        let model = CxrClassifierConfig::new(15)
            .with_in_channels(3)
            .with_base_filters(4)
            .with_num_blocks(2)
            .with_hidden_size(8)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::ones([2, 3, 16, 16], &device);
        let probs = model.forward_softmax(input);
        assert_eq!(probs.dims(), [2, 15]);
        let row_sums: Vec<f32> = probs.sum_dim(1).into_data().to_vec().unwrap();
        assert!(row_sums.iter().all(|s| (s - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_stage_widths_double() {
        let config = CxrClassifierConfig::new(2).with_base_filters(8);
        assert_eq!(config.stage_widths(), vec![8, 16, 32, 64]);
    }
}
