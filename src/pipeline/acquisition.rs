//! Background frame acquisition service
//!
//! One thread per `start()`/`stop()` cycle pulls frames from a blocking
//! source and publishes each into the latest-value slot. The caller's
//! context only ever reads the slot, so a stalled network read never holds
//! up rendering.
//!
//! A source that never recovers keeps the loop retrying until `stop()`;
//! there is no circuit breaker. The consecutive failure count in
//! [`AcquisitionService::stats`] is the signal for callers that want one.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{Frame, OpenError, SourceAdapter, SourceHandle, StreamEndpoint};
use crate::pipeline::slot::{AcquisitionStats, LatestSlot};
use crate::pipeline::throughput::ThroughputSample;
use crate::{AcquisitionConfig, CONFIG};

/// Bounds for the transient-failure pause. The lower bound rules out a busy spin
/// against a stalled source.
pub const MIN_FAILURE_PAUSE: Duration = Duration::from_millis(10);
pub const MAX_FAILURE_PAUSE: Duration = Duration::from_millis(500);

/// Shortest throughput window; the published rate never changes more often.
pub const MIN_RATE_WINDOW: Duration = Duration::from_secs(1);

const THREAD_NAME: &str = "argus-acquire";

#[derive(Debug, Error)]
pub enum StartError {
    /// `start` called while a previous run is still active
    #[error("acquisition is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcquisitionState {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

impl AcquisitionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AcquisitionState::Running,
            2 => AcquisitionState::Stopping,
            _ => AcquisitionState::Stopped,
        }
    }
}

/// Tuning for the acquisition loop
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionOptions {
    pub failure_pause: Duration,
    pub rate_window: Duration,
    pub stall_warn_after: u32,
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self::from(&AcquisitionConfig::default())
    }
}

impl From<&AcquisitionConfig> for AcquisitionOptions {
    fn from(config: &AcquisitionConfig) -> Self {
        Self {
            failure_pause: Duration::from_millis(config.failure_pause_ms),
            rate_window: Duration::from_millis(config.rate_window_ms),
            stall_warn_after: config.stall_warn_after,
        }
        .clamped()
    }
}

impl AcquisitionOptions {
    /// Pull every field into its supported range
    pub fn clamped(self) -> Self {
        Self {
            failure_pause: self.failure_pause.clamp(MIN_FAILURE_PAUSE, MAX_FAILURE_PAUSE),
            rate_window: self.rate_window.max(MIN_RATE_WINDOW),
            stall_warn_after: self.stall_warn_after.max(1),
        }
    }
}

/// Where the acquisition loop is between iterations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Pulling,
    /// Waiting out the pause after a failed pull; wakes early on stop
    Pausing,
    Exiting,
}

/// Totals reported when the loop exits
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopSummary {
    pub frames: u64,
    pub failures: u64,
}

/// The pull/publish state machine. `run` drives it on the acquisition
/// thread; `step` advances it by one transition.
pub struct AcquisitionLoop<H> {
    handle: H,
    slot: Arc<LatestSlot>,
    stop_rx: Receiver<()>,
    options: AcquisitionOptions,
    throughput: ThroughputSample,
    state: LoopState,
    summary: LoopSummary,
}

impl<H: SourceHandle> AcquisitionLoop<H> {
    pub fn new(
        handle: H,
        slot: Arc<LatestSlot>,
        stop_rx: Receiver<()>,
        options: AcquisitionOptions,
    ) -> Self {
        Self {
            handle,
            slot,
            stop_rx,
            throughput: ThroughputSample::new(options.rate_window, Instant::now()),
            options,
            state: LoopState::Pulling,
            summary: LoopSummary::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Advance one transition and return the new state.
    pub fn step(&mut self) -> LoopState {
        self.state = match self.state {
            LoopState::Pulling if self.stop_requested() => LoopState::Exiting,
            LoopState::Pulling => self.pull_once(),
            LoopState::Pausing => match self.stop_rx.recv_timeout(self.options.failure_pause) {
                Err(RecvTimeoutError::Timeout) => LoopState::Pulling,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => LoopState::Exiting,
            },
            LoopState::Exiting => LoopState::Exiting,
        };
        self.state
    }

    /// Stop is a message or the sender going away
    fn stop_requested(&self) -> bool {
        !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty))
    }

    fn pull_once(&mut self) -> LoopState {
        match self.handle.pull() {
            Ok(frame) => {
                self.publish(frame);
                self.roll_rate();
                LoopState::Pulling
            }
            Err(e) => {
                self.summary.failures += 1;
                metrics::counter!("acquisition_read_failures_total").increment(1);

                let run = self.slot.record_failure();
                if run == self.options.stall_warn_after {
                    warn!("Source stalled: {} consecutive read failures, last: {}", run, e);
                } else {
                    debug!("Read failed ({} in a row): {}", run, e);
                }
                LoopState::Pausing
            }
        }
    }

    /// Publish the rate once the window has run its length. Only successful
    /// pulls get here, so a stalled source keeps its last rate.
    fn roll_rate(&mut self) {
        if let Some(rate) = self.throughput.roll(Instant::now()) {
            self.slot.publish_rate(rate);
            metrics::gauge!("acquisition_fps").set(rate);
            debug!("Acquisition rate: {:.1} fps", rate);
        }
    }

    fn publish(&mut self, frame: Frame) {
        self.slot.publish_frame(frame);
        self.throughput.record_frame();
        self.summary.frames += 1;
        metrics::counter!("acquisition_frames_total").increment(1);
    }

    /// Drive the loop until stop is observed, then close the source.
    pub fn run(mut self) -> LoopSummary {
        self.throughput = ThroughputSample::new(self.options.rate_window, Instant::now());

        while self.step() != LoopState::Exiting {}

        self.close()
    }

    /// Close the source without pulling again
    fn close(self) -> LoopSummary {
        if let Err(e) = self.handle.close() {
            warn!("Ignoring error while closing source: {}", e);
        }
        self.summary
    }
}

struct Worker {
    stop_tx: Sender<()>,
    thread: JoinHandle<LoopSummary>,
}

type LoopBody = Box<dyn FnOnce() -> LoopSummary + Send>;

fn spawn_loop(body: LoopBody) -> std::io::Result<JoinHandle<LoopSummary>> {
    thread::Builder::new().name(THREAD_NAME.into()).spawn(body)
}

/// Owns the acquisition thread and the latest-value slot.
///
/// `latest`, `current_rate` and `stats` are lock-free snapshot reads and may be
/// called from any thread. `start` and `stop` serialize on an internal mutex
/// that readers never touch.
pub struct AcquisitionService {
    options: AcquisitionOptions,
    slot: Arc<LatestSlot>,
    state: AtomicU8,
    worker: Mutex<Option<Worker>>,
}

impl Default for AcquisitionService {
    /// Options from the active global configuration
    fn default() -> Self {
        Self::new(AcquisitionOptions::from(&CONFIG.load().acquisition))
    }
}

impl AcquisitionService {
    pub fn new(options: AcquisitionOptions) -> Self {
        Self {
            options: options.clamped(),
            slot: Arc::new(LatestSlot::new()),
            state: AtomicU8::new(AcquisitionState::Stopped as u8),
            worker: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &AcquisitionOptions {
        &self.options
    }

    /// Open `endpoint` and spawn the acquisition thread.
    ///
    /// Returns `StartError::AlreadyRunning` if a previous run has not been
    /// stopped. A successful start clears the frame, rate and counters left by
    /// the previous run; a failed one leaves them as they were.
    #[instrument(skip(self, adapter, endpoint), fields(endpoint = %endpoint))]
    pub fn start<A: SourceAdapter>(
        &self,
        adapter: &A,
        endpoint: &StreamEndpoint,
    ) -> Result<(), StartError> {
        self.start_with(adapter, endpoint, spawn_loop)
    }

    fn start_with<A, S>(
        &self,
        adapter: &A,
        endpoint: &StreamEndpoint,
        spawn: S,
    ) -> Result<(), StartError>
    where
        A: SourceAdapter,
        S: FnOnce(LoopBody) -> std::io::Result<JoinHandle<LoopSummary>>,
    {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Err(StartError::AlreadyRunning);
        }

        let handle = adapter.open(endpoint)?;

        let (stop_tx, stop_rx) = flume::bounded(1);
        let acquisition = AcquisitionLoop::new(
            handle,
            Arc::clone(&self.slot),
            stop_rx,
            self.options.clone(),
        );

        // The loop is handed over only once the thread exists, so a failed
        // spawn still leaves the handle here to close.
        let (handoff_tx, handoff_rx) = flume::bounded::<AcquisitionLoop<A::Handle>>(1);
        let thread = match spawn(Box::new(move || {
            handoff_rx
                .recv()
                .map(AcquisitionLoop::run)
                .unwrap_or_default()
        })) {
            Ok(thread) => thread,
            Err(e) => {
                acquisition.close();
                return Err(StartError::Spawn(e));
            }
        };

        self.slot.clear();
        if let Err(flume::SendError(acquisition)) = handoff_tx.send(acquisition) {
            acquisition.close();
            let _ = thread.join();
            return Err(StartError::Spawn(std::io::Error::other(
                "acquisition thread exited before the loop was handed over",
            )));
        }

        *worker = Some(Worker { stop_tx, thread });
        self.set_state(AcquisitionState::Running);
        info!("Acquisition started");
        Ok(())
    }

    /// Most recently published frame, if any. Never blocks.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.slot.latest()
    }

    /// Frames per second over the last completed window; 0 before the first.
    pub fn current_rate(&self) -> f64 {
        self.slot.rate()
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.slot.stats()
    }

    pub fn state(&self) -> AcquisitionState {
        AcquisitionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == AcquisitionState::Running
    }

    /// Signal the loop, wait for it to exit and close the source.
    ///
    /// Idempotent and callable from any thread. Returns once the loop has
    /// observed the signal at its next iteration boundary, so it can wait as
    /// long as one in-flight pull. Afterwards nothing is written to the slot;
    /// `latest` keeps returning the last frame until the next `start`.
    pub fn stop(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(Worker { stop_tx, thread }) = worker.take() else {
            return;
        };

        self.set_state(AcquisitionState::Stopping);
        info!("Stopping acquisition");

        // Full or disconnected both mean the loop will see it
        let _ = stop_tx.try_send(());
        drop(stop_tx);

        match thread.join() {
            Ok(summary) => info!(
                "Acquisition stopped after {} frames, {} failed reads",
                summary.frames, summary.failures
            ),
            Err(_) => error!("Acquisition thread panicked"),
        }

        self.set_state(AcquisitionState::Stopped);
    }

    fn set_state(&self, state: AcquisitionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for AcquisitionService {
    fn drop(&mut self) {
        self.stop();
    }
}
