use tokio::sync::mpsc;

/// One observation published per poll tick.
#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum Sample {
    /// The generator advanced `steps` since the previous good read.
    Reading {
        steps: u64,
        /// Steps per second over the rolling window.
        rate: f64,
        total_steps: u64,
    },
    /// The memory read failed; tracked state is unchanged.
    ReadFailed,
    /// The forward search gave up after `searched` steps and tracking was
    /// realigned to the latest observation.
    Resynced { searched: u64, total_steps: u64 },
    /// The worker stopped on its own after an unrecoverable reader error.
    /// Nothing follows this sample until the tracker is started again.
    Halted,
}

impl Sample {
    pub fn is_failure(&self) -> bool {
        matches!(self, Sample::ReadFailed)
    }
}

/// Receives samples on the tracker's worker task, in the order they were
/// produced. Implementations that touch another context should forward the
/// sample as a message rather than act on it in place.
pub trait SampleListener: Send + 'static {
    fn on_sample(&mut self, sample: Sample);
}

impl SampleListener for mpsc::UnboundedSender<Sample> {
    fn on_sample(&mut self, sample: Sample) {
        if self.send(sample).is_err() {
            tracing::trace!("sample receiver dropped");
        }
    }
}

impl SampleListener for Box<dyn FnMut(Sample) + Send> {
    fn on_sample(&mut self, sample: Sample) {
        self(sample)
    }
}
