//! Event-driven training engine
//!
//! An `Engine` repeatedly pulls batches from a data source and hands them to
//! a `Process`. Around the loop it fires `Event`s to registered `Handler`s:
//!
//! ```text
//! Started
//!   EpochStarted
//!     IterationCompleted (per batch)
//!   EpochCompleted
//! Completed
//! ```
//!
//! Any handler may call `State::terminate` to stop after the current
//! iteration. If a step or handler fails, `ExceptionRaised` handlers run
//! before the error is returned.

pub mod handlers;

use std::collections::BTreeMap;

use crate::utils::error::Result;

pub use handlers::{Checkpoint, Checkpointable, EarlyStopping, LearningRate, LrSchedulerHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Started,
    EpochStarted,
    IterationCompleted,
    EpochCompleted,
    Completed,
    ExceptionRaised,
}

impl Event {
    /// Counter an `every` filter is applied to
    fn counter(&self, state: &State) -> Option<usize> {
        match self {
            Event::EpochStarted | Event::EpochCompleted => Some(state.epoch),
            Event::IterationCompleted => Some(state.iteration),
            _ => None,
        }
    }
}

/// Mutable run state shared with every handler
#[derive(Debug, Clone, Default)]
pub struct State {
    /// Current epoch, 1-based once the first epoch has started
    pub epoch: usize,
    /// Global iteration count across epochs
    pub iteration: usize,
    /// Iterations completed in the current epoch
    pub epoch_iteration: usize,
    pub max_epochs: usize,
    /// Cap on iterations per epoch
    pub epoch_length: Option<usize>,
    /// Output of the last process step
    pub output: f64,
    /// Metrics written by handlers, e.g. `val_loss`
    pub metrics: BTreeMap<String, f64>,
    /// Message of the error that aborted the run
    pub error: Option<String>,
    should_terminate: bool,
}

impl State {
    fn new(max_epochs: usize, epoch_length: Option<usize>) -> Self {
        Self {
            max_epochs,
            epoch_length,
            ..Default::default()
        }
    }

    /// Stop the run after the current iteration
    pub fn terminate(&mut self) {
        self.should_terminate = true;
    }

    pub fn should_terminate(&self) -> bool {
        self.should_terminate
    }
}

/// One optimisation (or evaluation) step per batch
pub trait Process {
    type Batch;

    fn step(&mut self, state: &State, batch: Self::Batch) -> Result<f64>;
}

pub trait Handler<P> {
    fn handle(&mut self, state: &mut State, process: &mut P) -> Result<()>;
}

impl<P, F> Handler<P> for F
where
    F: FnMut(&mut State, &mut P) -> Result<()>,
{
    fn handle(&mut self, state: &mut State, process: &mut P) -> Result<()> {
        self(state, process)
    }
}

struct Registration<P> {
    event: Event,
    every: Option<usize>,
    handler: Box<dyn Handler<P>>,
}

impl<P> Registration<P> {
    fn triggers(&self, event: Event, state: &State) -> bool {
        if self.event != event {
            return false;
        }
        match (self.every, event.counter(state)) {
            (Some(every), Some(count)) => every > 0 && count % every == 0,
            _ => true,
        }
    }
}

pub struct Engine<P: Process> {
    handlers: Vec<Registration<P>>,
    state: State,
    epoch_length: Option<usize>,
}

impl<P: Process> Default for Engine<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Process> Engine<P> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            state: State::default(),
            epoch_length: None,
        }
    }

    pub fn with_epoch_length(mut self, epoch_length: Option<usize>) -> Self {
        self.epoch_length = epoch_length;
        self
    }

    pub fn add_event_handler<H>(&mut self, event: Event, handler: H) -> &mut Self
    where
        H: Handler<P> + 'static,
    {
        self.handlers.push(Registration {
            event,
            every: None,
            handler: Box::new(handler),
        });
        self
    }

    /// Register a handler that fires on every `every`-th epoch or iteration
    pub fn add_event_handler_every<H>(&mut self, event: Event, every: usize, handler: H) -> &mut Self
    where
        H: Handler<P> + 'static,
    {
        self.handlers.push(Registration {
            event,
            every: Some(every),
            handler: Box::new(handler),
        });
        self
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Run `max_epochs` epochs, calling `data_fn` for a fresh pass each epoch
    pub fn run<I, F>(&mut self, process: &mut P, mut data_fn: F, max_epochs: usize) -> Result<&State>
    where
        F: FnMut() -> I,
        I: IntoIterator<Item = P::Batch>,
    {
        self.state = State::new(max_epochs, self.epoch_length);

        if let Err(e) = self.run_epochs(process, &mut data_fn) {
            tracing::error!("Engine run is terminating due to exception: {}", e);
            self.state.error = Some(e.to_string());
            if let Err(handler_err) = self.fire(Event::ExceptionRaised, process) {
                tracing::error!("Exception handler failed: {}", handler_err);
            }
            return Err(e);
        }
        Ok(&self.state)
    }

    fn run_epochs<I, F>(&mut self, process: &mut P, data_fn: &mut F) -> Result<()>
    where
        F: FnMut() -> I,
        I: IntoIterator<Item = P::Batch>,
    {
        self.fire(Event::Started, process)?;

        while self.state.epoch < self.state.max_epochs && !self.state.should_terminate {
            self.state.epoch += 1;
            self.state.epoch_iteration = 0;
            self.fire(Event::EpochStarted, process)?;

            for batch in data_fn() {
                if self.state.should_terminate {
                    break;
                }
                if self.state.epoch_length.is_some_and(|len| self.state.epoch_iteration >= len) {
                    break;
                }
                self.state.iteration += 1;
                self.state.epoch_iteration += 1;
                self.state.output = process.step(&self.state, batch)?;
                self.fire(Event::IterationCompleted, process)?;
            }

            if self.state.should_terminate {
                tracing::info!("Terminate signaled at epoch {}", self.state.epoch);
                break;
            }
            self.fire(Event::EpochCompleted, process)?;
        }

        self.fire(Event::Completed, process)
    }

    fn fire(&mut self, event: Event, process: &mut P) -> Result<()> {
        for registration in self.handlers.iter_mut() {
            if registration.triggers(event, &self.state) {
                registration.handler.handle(&mut self.state, process)?;
            }
        }
        Ok(())
    }
}
