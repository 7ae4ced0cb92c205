mod phase;
mod sample;
mod sink;

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub use self::{
    phase::{Command, Event, Phase},
    sample::{Sample, SampleListener},
    sink::{CSV_HEADER, CsvSink, LogRow, SampleSink, unix_timestamp},
};
use crate::{
    client::MemoryReader,
    protocol::{RNG_STATE_ADDR_PAL, RNG_STATE_LEN},
    traits::MealyMachine,
    wichmann_hill::{
        DEFAULT_MAX_SEARCH_STEPS, DEFAULT_SEED, GeneratorState, SearchOutcome, forward_search,
    },
    window::{DEFAULT_WINDOW_DEPTH, RollingWindow},
};

pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const FAILURE_BACKOFF: Duration = Duration::from_millis(100);

// ─── Configuration & errors ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Address of the first of the three generator words.
    pub state_addr: u32,
    pub window_depth: usize,
    pub poll_interval: Duration,
    pub failure_backoff: Duration,
    pub max_search_steps: u64,
    /// State assumed before the first observation.
    pub initial_state: GeneratorState,
    /// Directory for per-run CSV logs; `None` disables logging.
    pub log_dir: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            state_addr: RNG_STATE_ADDR_PAL,
            window_depth: DEFAULT_WINDOW_DEPTH,
            poll_interval: POLL_INTERVAL,
            failure_backoff: FAILURE_BACKOFF,
            max_search_steps: DEFAULT_MAX_SEARCH_STEPS,
            initial_state: DEFAULT_SEED,
            log_dir: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker is already running")]
    AlreadyRunning,
    #[error("tracker worker panicked; the memory reader was lost")]
    WorkerPanicked,
}

// ─── Per-run bookkeeping ────────────────────────────────────────────────────

/// State owned by one polling run. Lives on the worker task.
struct TrackerRun {
    known: GeneratorState,
    window: RollingWindow,
    total_steps: u64,
    started: Instant,
    last_tick: Instant,
    sink: Option<Box<dyn SampleSink>>,
}

impl TrackerRun {
    fn new(config: &TrackerConfig, sink: Option<Box<dyn SampleSink>>) -> Self {
        let now = Instant::now();
        Self {
            known: config.initial_state,
            window: RollingWindow::new(config.window_depth),
            total_steps: 0,
            started: now,
            last_tick: now,
            sink,
        }
    }

    /// Seconds since the previous tick began.
    fn begin_tick(&mut self) -> f64 {
        let now = Instant::now();
        let delta = now.duration_since(self.last_tick);
        self.last_tick = now;
        delta.as_secs_f64()
    }

    fn record(&mut self, observed: GeneratorState, time_delta: f64, steps: u64) -> Sample {
        self.known = observed;
        self.total_steps += steps;
        self.window.append(time_delta, steps);
        let rate = self.window.rate();

        if let Some(sink) = self.sink.as_mut() {
            let row = LogRow {
                timestamp: unix_timestamp().as_secs_f64(),
                runtime: self.started.elapsed().as_secs_f64(),
                time_delta,
                steps,
                rolling_rate: rate,
                total_steps: self.total_steps,
            };
            if let Err(e) = sink.append_row(&row) {
                tracing::warn!(error = %e, "sample log write failed, logging disabled for this run");
                self.sink = None;
            }
        }

        Sample::Reading {
            steps,
            rate,
            total_steps: self.total_steps,
        }
    }

    fn resync(&mut self, observed: GeneratorState, searched: u64) -> Sample {
        tracing::warn!(
            from = %self.known,
            to = %observed,
            searched,
            "generator state not reachable, resynchronizing"
        );
        self.known = observed;
        Sample::Resynced {
            searched,
            total_steps: self.total_steps,
        }
    }
}

// ─── Tracker ────────────────────────────────────────────────────────────────

struct Worker<R, L> {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    /// Receives the reader and listener back when the poll loop ends, whether
    /// it was cancelled or halted on its own.
    parts: oneshot::Receiver<(R, L)>,
}

/// Polls the generator state through `R` on a background task and publishes
/// a [`Sample`] per tick to `L`.
pub struct Tracker<R, L> {
    config: TrackerConfig,
    phase: Phase,
    parts: Option<(R, L)>,
    worker: Option<Worker<R, L>>,
}

impl<R: MemoryReader, L: SampleListener> Tracker<R, L> {
    pub fn new(reader: R, listener: L, config: TrackerConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            parts: Some((reader, listener)),
            worker: None,
        }
    }

    /// Current lifecycle phase. A worker that halted on its own counts as
    /// idle even before the next `start` or `stop` collects it.
    pub fn phase(&self) -> Phase {
        match &self.worker {
            Some(worker) if worker.handle.is_finished() => Phase::Idle,
            _ => self.phase,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Start polling, logging to a CSV file under `log_dir` when configured.
    pub fn start(&mut self) -> Result<(), TrackerError> {
        self.start_inner(None)
    }

    /// Start polling with a caller-provided sink instead of the CSV file.
    pub fn start_with_sink(&mut self, sink: Box<dyn SampleSink>) -> Result<(), TrackerError> {
        self.start_inner(Some(sink))
    }

    fn start_inner(&mut self, provided: Option<Box<dyn SampleSink>>) -> Result<(), TrackerError> {
        self.collect_halted_worker();
        let (phase, commands) = self.phase.transition(Event::StartRequested);
        if commands.is_empty() {
            tracing::debug!(phase = %self.phase, "start ignored");
            return Err(TrackerError::AlreadyRunning);
        }
        let mut parts = Some(self.parts.take().ok_or(TrackerError::WorkerPanicked)?);
        self.log_transition(phase, commands.len());
        self.phase = phase;

        let mut sink = provided;
        for command in commands {
            match command {
                Command::OpenLogSink => {
                    if sink.is_none() {
                        sink = self.open_csv_sink();
                    }
                }
                Command::SpawnWorker => {
                    if let Some((reader, listener)) = parts.take() {
                        self.spawn_worker(reader, listener, sink.take());
                    }
                }
                Command::SignalCancel | Command::AwaitWorker => {}
            }
        }
        Ok(())
    }

    /// Cancel the worker and wait until it has exited. A no-op when idle.
    pub async fn stop(&mut self) -> Result<(), TrackerError> {
        let (phase, commands) = self.phase.transition(Event::StopRequested);
        if commands.is_empty() {
            return Ok(());
        }
        self.log_transition(phase, commands.len());
        self.phase = phase;

        let mut outcome = Ok(());
        for command in commands {
            match command {
                Command::SignalCancel => {
                    if let Some(worker) = &self.worker {
                        worker.cancel.cancel();
                    }
                }
                Command::AwaitWorker => {
                    if let Some(worker) = self.worker.take() {
                        outcome = self.reap(worker).await;
                    }
                }
                Command::OpenLogSink | Command::SpawnWorker => {}
            }
        }

        let (phase, _) = self.phase.transition(Event::WorkerExited);
        self.log_transition(phase, 0);
        self.phase = phase;
        outcome
    }

    /// Stop the tracker and hand the reader back, e.g. to disconnect it.
    pub async fn shutdown(mut self) -> Result<R, TrackerError> {
        self.stop().await?;
        self.parts
            .take()
            .map(|(reader, _)| reader)
            .ok_or(TrackerError::WorkerPanicked)
    }

    fn open_csv_sink(&self) -> Option<Box<dyn SampleSink>> {
        let dir = self.config.log_dir.as_deref()?;
        match CsvSink::create(dir) {
            Ok(sink) => Some(Box::new(sink)),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "could not open sample log, continuing without it");
                None
            }
        }
    }

    fn spawn_worker(&mut self, reader: R, listener: L, sink: Option<Box<dyn SampleSink>>) {
        let cancel = CancellationToken::new();
        let run = TrackerRun::new(&self.config, sink);
        let (parts_tx, parts) = oneshot::channel();
        let poll = poll_loop(reader, listener, run, self.config.clone(), cancel.clone());
        let handle = tokio::spawn(async move {
            let _ = parts_tx.send(poll.await);
        });
        self.worker = Some(Worker {
            cancel,
            handle,
            parts,
        });
    }

    async fn reap(&mut self, worker: Worker<R, L>) -> Result<(), TrackerError> {
        match worker.parts.await {
            Ok(parts) => {
                self.parts = Some(parts);
                Ok(())
            }
            Err(_) => {
                if let Err(e) = worker.handle.await {
                    tracing::error!(error = %e, "tracker worker did not exit cleanly");
                }
                Err(TrackerError::WorkerPanicked)
            }
        }
    }

    /// Take back the parts of a worker that already exited and return to
    /// `Idle`, so a halted tracker can be started again.
    fn collect_halted_worker(&mut self) {
        let Some(mut worker) = self.worker.take_if(|w| w.handle.is_finished()) else {
            return;
        };
        match worker.parts.try_recv() {
            Ok(parts) => self.parts = Some(parts),
            Err(e) => tracing::error!(error = %e, "tracker worker exited without returning its reader"),
        }
        let (phase, _) = self.phase.transition(Event::WorkerExited);
        self.log_transition(phase, 0);
        self.phase = phase;
    }

    fn log_transition(&self, new: Phase, commands: usize) {
        if self.phase != new {
            tracing::info!(old = %self.phase, new = %new, commands, "tracker phase transition");
        }
    }
}

impl<R, L> Drop for Tracker<R, L> {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.cancel.cancel();
        }
    }
}

// ─── Worker loop ────────────────────────────────────────────────────────────

async fn poll_loop<R: MemoryReader, L: SampleListener>(
    mut reader: R,
    mut listener: L,
    mut run: TrackerRun,
    config: TrackerConfig,
    cancel: CancellationToken,
) -> (R, L) {
    let start = config.state_addr;
    let end = start.saturating_add(RNG_STATE_LEN);
    tracing::debug!(start, end, "polling generator state");

    let halted = loop {
        if cancel.is_cancelled() {
            break false;
        }
        let time_delta = run.begin_tick();

        let observed = match reader.read_memory_range(start, end).await {
            Ok(bytes) => match GeneratorState::from_be_bytes(&bytes) {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::debug!(error = %e, "discarding malformed generator state");
                    None
                }
            },
            Err(e) if e.is_transient() => {
                tracing::debug!(error = %e, "generator state read failed");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "memory reader unusable, stopping tracker");
                break true;
            }
        };

        let Some(observed) = observed else {
            listener.on_sample(Sample::ReadFailed);
            if !pause(&cancel, config.failure_backoff).await {
                break false;
            }
            continue;
        };

        let searched = search_off_thread(
            run.known,
            observed,
            config.max_search_steps,
            cancel.clone(),
        )
        .await;
        let sample = match searched {
            Some(SearchOutcome::Found { steps }) => run.record(observed, time_delta, steps),
            Some(SearchOutcome::Exhausted { steps }) => run.resync(observed, steps),
            Some(SearchOutcome::Cancelled { .. }) => break false,
            None => break true,
        };
        listener.on_sample(sample);

        if !pause(&cancel, config.poll_interval).await {
            break false;
        }
    };

    if halted {
        listener.on_sample(Sample::Halted);
    }
    tracing::debug!(total_steps = run.total_steps, halted, "polling stopped");
    (reader, listener)
}

/// The search is CPU-bound, so it runs on the blocking pool and polls the
/// token between steps.
async fn search_off_thread(
    known: GeneratorState,
    target: GeneratorState,
    max_steps: u64,
    cancel: CancellationToken,
) -> Option<SearchOutcome> {
    let result = tokio::task::spawn_blocking(move || {
        let mut known = known;
        forward_search(target, &mut known, max_steps, || !cancel.is_cancelled())
    })
    .await;
    match result {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            tracing::error!(error = %e, "forward search task failed");
            None
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io,
        sync::{Arc, Mutex},
    };

    use tokio::sync::mpsc;

    use super::*;
    use crate::{client::ClientError, test_utils::advanced};

    /// Replays a fixed script of read results, then times out forever.
    struct ScriptedReader {
        script: VecDeque<Result<Vec<u8>, ClientError>>,
    }

    impl ScriptedReader {
        fn new(script: impl IntoIterator<Item = Result<Vec<u8>, ClientError>>) -> Self {
            Self {
                script: script.into_iter().collect(),
            }
        }
    }

    impl MemoryReader for ScriptedReader {
        async fn read_memory_range(&mut self, start: u32, end: u32) -> Result<Vec<u8>, ClientError> {
            assert_eq!(end - start, RNG_STATE_LEN);
            self.script
                .pop_front()
                .unwrap_or(Err(ClientError::TransactionTimeout))
        }
    }

    #[derive(Clone, Default)]
    struct MemorySink(Arc<Mutex<Vec<LogRow>>>);

    impl SampleSink for MemorySink {
        fn append_row(&mut self, row: &LogRow) -> io::Result<()> {
            self.0.lock().expect("sink lock").push(*row);
            Ok(())
        }
    }

    fn fast_config() -> TrackerConfig {
        TrackerConfig {
            poll_interval: Duration::from_millis(1),
            failure_backoff: Duration::from_millis(1),
            ..TrackerConfig::default()
        }
    }

    fn reading(steps: u64) -> Result<Vec<u8>, ClientError> {
        Ok(advanced(DEFAULT_SEED, steps).to_be_bytes().to_vec())
    }

    async fn next_sample(rx: &mut mpsc::UnboundedReceiver<Sample>) -> Sample {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("sample arrives in time")
            .expect("listener channel open")
    }

    async fn next_readings(rx: &mut mpsc::UnboundedReceiver<Sample>, n: usize) -> Vec<Sample> {
        let mut out = Vec::new();
        while out.len() < n {
            let sample = next_sample(rx).await;
            if !sample.is_failure() {
                out.push(sample);
            }
        }
        out
    }

    #[tokio::test]
    async fn failure_then_single_step() {
        let reader = ScriptedReader::new([Err(ClientError::TransactionTimeout), reading(1)]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = Tracker::new(reader, tx, fast_config());
        tracker.start().expect("start");

        assert_eq!(next_sample(&mut rx).await, Sample::ReadFailed);
        match next_sample(&mut rx).await {
            Sample::Reading {
                steps, total_steps, ..
            } => {
                assert_eq!(steps, 1);
                assert_eq!(total_steps, 1);
            }
            other => panic!("expected a reading, got {other:?}"),
        }

        tracker.stop().await.expect("stop");
        assert_eq!(tracker.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn total_is_sum_of_readings() {
        let reader = ScriptedReader::new([
            reading(3),
            reading(8),
            Err(ClientError::ConnectionReset),
            reading(20),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = Tracker::new(reader, tx, fast_config());
        tracker.start().expect("start");

        let readings = next_readings(&mut rx, 3).await;
        let steps: Vec<_> = readings
            .iter()
            .map(|s| match s {
                Sample::Reading { steps, .. } => *steps,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(steps, vec![3, 5, 12]);
        assert!(matches!(
            readings[2],
            Sample::Reading {
                total_steps: 20,
                ..
            }
        ));

        tracker.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn unreachable_state_resyncs() {
        let reader = ScriptedReader::new([reading(50), reading(51)]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = TrackerConfig {
            max_search_steps: 10,
            ..fast_config()
        };
        let mut tracker = Tracker::new(reader, tx, config);
        tracker.start().expect("start");

        assert_eq!(
            next_sample(&mut rx).await,
            Sample::Resynced {
                searched: 10,
                total_steps: 0
            }
        );
        assert!(matches!(
            next_sample(&mut rx).await,
            Sample::Reading {
                steps: 1,
                total_steps: 1,
                ..
            }
        ));
        tracker.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn malformed_state_is_a_failed_read() {
        let reader = ScriptedReader::new([Ok(vec![0xFF; 12]), reading(2)]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = Tracker::new(reader, tx, fast_config());
        tracker.start().expect("start");

        assert_eq!(next_sample(&mut rx).await, Sample::ReadFailed);
        assert!(matches!(
            next_sample(&mut rx).await,
            Sample::Reading { steps: 2, .. }
        ));
        tracker.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut tracker = Tracker::new(ScriptedReader::new([]), tx, fast_config());
        tracker.start().expect("first start");
        assert!(matches!(tracker.start(), Err(TrackerError::AlreadyRunning)));
        assert!(tracker.is_running());
        tracker.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn stop_while_idle_is_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut tracker = Tracker::new(ScriptedReader::new([]), tx, fast_config());
        tracker.stop().await.expect("idle stop");
        assert_eq!(tracker.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = Tracker::new(ScriptedReader::new([]), tx, fast_config());
        tracker.start().expect("start");
        assert_eq!(next_sample(&mut rx).await, Sample::ReadFailed);
        tracker.stop().await.expect("stop");
        tracker.start().expect("restart");
        assert_eq!(next_sample(&mut rx).await, Sample::ReadFailed);
        let reader = tracker.shutdown().await.expect("shutdown");
        assert!(reader.script.is_empty());
    }

    #[tokio::test]
    async fn stop_interrupts_endless_search() {
        // A zero word never becomes non-zero again, so this target is never reached.
        let unreachable = GeneratorState::new([0, 0, 0]).expect("valid words");
        let reader = ScriptedReader::new([Ok(unreachable.to_be_bytes().to_vec())]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = TrackerConfig {
            max_search_steps: u64::MAX,
            ..fast_config()
        };
        let mut tracker = Tracker::new(reader, tx, config);
        tracker.start().expect("start");
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(5), tracker.stop())
            .await
            .expect("stop returns promptly")
            .expect("stop");
        assert_eq!(tracker.phase(), Phase::Idle);
    }

    async fn wait_until_idle(tracker: &Tracker<ScriptedReader, mpsc::UnboundedSender<Sample>>) {
        for _ in 0..500 {
            if tracker.phase() == Phase::Idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tracker still {} after its worker halted", tracker.phase());
    }

    #[tokio::test]
    async fn fatal_reader_error_halts_and_allows_restart() {
        let reader = ScriptedReader::new([Err(ClientError::NotConnected)]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = Tracker::new(reader, tx, fast_config());
        tracker.start().expect("start");

        assert_eq!(next_sample(&mut rx).await, Sample::Halted);
        wait_until_idle(&tracker).await;
        assert!(!tracker.is_running());

        tracker.start().expect("restart after halt");
        assert!(tracker.is_running());
        assert_eq!(next_sample(&mut rx).await, Sample::ReadFailed);
        tracker.stop().await.expect("stop");
        assert_eq!(tracker.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn stop_after_halt_returns_reader() {
        let reader = ScriptedReader::new([Err(ClientError::InvalidRange { start: 1, end: 0 })]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = Tracker::new(reader, tx, fast_config());
        tracker.start().expect("start");
        assert_eq!(next_sample(&mut rx).await, Sample::Halted);

        let reader = tracker.shutdown().await.expect("shutdown after halt");
        assert!(reader.script.is_empty());
    }

    #[tokio::test]
    async fn rows_logged_for_readings_only() {
        let reader = ScriptedReader::new([
            reading(4),
            Err(ClientError::TransactionTimeout),
            reading(10),
        ]);
        let sink = MemorySink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = Tracker::new(reader, tx, fast_config());
        tracker
            .start_with_sink(Box::new(sink.clone()))
            .expect("start");

        next_readings(&mut rx, 2).await;
        tracker.stop().await.expect("stop");

        let rows = sink.0.lock().expect("sink lock").clone();
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].steps, rows[0].total_steps), (4, 4));
        assert_eq!((rows[1].steps, rows[1].total_steps), (6, 10));
        assert!(rows.iter().all(|r| r.time_delta >= 0.0 && r.runtime >= 0.0));
    }

    #[tokio::test]
    async fn csv_log_opened_from_config() {
        let dir = std::env::temp_dir().join(format!(
            "rngcounter-tracker-{}-{}",
            std::process::id(),
            unix_timestamp().as_nanos()
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = TrackerConfig {
            log_dir: Some(dir.clone()),
            ..fast_config()
        };
        let mut tracker = Tracker::new(ScriptedReader::new([reading(7)]), tx, config);
        tracker.start().expect("start");
        next_readings(&mut rx, 1).await;
        tracker.stop().await.expect("stop");

        let file = std::fs::read_dir(&dir)
            .expect("log dir exists")
            .next()
            .expect("one log file")
            .expect("dir entry")
            .path();
        let contents = std::fs::read_to_string(&file).expect("read log");
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        let row: Vec<_> = lines.next().expect("one row").split(',').collect();
        assert_eq!(row.len(), 6);
        assert_eq!(row[3], "7");
        assert_eq!(row[5], "7");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
