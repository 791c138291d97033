//! Capture session: one worker thread owning one frame source.
//!
//! ```text
//! Starting ──open+first frame──▶ Running ──N consecutive failures──▶ Reconnecting
//!    │                             ▲  │                                   │
//!    │                             │  └──handle closed───────────────────▶│
//!    │                             └───────────reopened───────────────────┘
//!    └──────────── stop / terminal error (any state) ──────────▶ Stopped
//! ```
//!
//! Reconnect retries forever; only `stop` or a terminal source error (the
//! sensor process exiting) ends the session.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::{
    encode::{self, DEFAULT_JPEG_QUALITY},
    slot::SlotClosed,
    AbortHandle, CameraDescriptor, CameraError, FrameSlot, FrameSource, RawImage, Result,
    RunFlag,
};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Reconnecting,
    Stopped,
}

/// Timing knobs. The defaults are what the kiosk ships with; tests shrink
/// them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionTuning {
    /// Consecutive failed reads that trigger a reconnect.
    pub failure_threshold: u32,
    /// Pause after releasing the handle, and between reopen attempts.
    pub reconnect_backoff: Duration,
    /// Pause after a single failed read.
    pub retry_delay: Duration,
    /// Longest a single device read may block.
    pub read_timeout: Duration,
    /// Granularity of every pause, so `stop` is noticed promptly.
    pub poll_interval: Duration,
    /// How long `stop` waits for the worker.
    pub join_timeout: Duration,
    /// How long `start` waits for the first frame.
    pub startup_timeout: Duration,
    pub jpeg_quality: u8,
}

impl SessionTuning {
    /// How long `stop` waits before aborting: the read in flight, one
    /// check of the run flag, then the join itself.
    pub fn stop_budget(&self) -> Duration {
        self.read_timeout + self.poll_interval + self.join_timeout
    }
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reconnect_backoff: Duration::from_secs(1),
            retry_delay: Duration::from_millis(30),
            read_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            join_timeout: Duration::from_secs(2),
            startup_timeout: Duration::from_secs(20),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Point-in-time view of a session for the status route and logs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub source: String,
    pub state: SessionState,
    pub descriptor: Option<CameraDescriptor>,
    pub frames: u64,
    pub consecutive_failures: u32,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

impl SessionStatus {
    fn new(source: String) -> Self {
        Self {
            source,
            state: SessionState::Starting,
            descriptor: None,
            frames: 0,
            consecutive_failures: 0,
            reconnects: 0,
            last_error: None,
        }
    }
}

/// Consecutive-failure counter. Any good read resets it.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    failures: u32,
    threshold: u32,
}

impl ReconnectState {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: 0,
            threshold: threshold.max(1),
        }
    }

    /// Count one failure; true when the threshold has just been reached.
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        self.failures >= self.threshold
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Debug)]
struct Shared {
    status: Mutex<SessionStatus>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut SessionStatus)) {
        f(&mut self.lock());
    }
}

/// Signals the stopper when the worker exits, even by panic.
struct DoneGuard(Sender<()>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

pub struct CaptureSession {
    run: RunFlag,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    done: Receiver<()>,
    detached: bool,
    abort: Option<AbortHandle>,
    slot: Arc<FrameSlot>,
    epoch: u64,
    tuning: SessionTuning,
}

impl CaptureSession {
    /// Spawn the worker and wait until it has opened the source and
    /// published a first frame (or failed to).
    pub fn start(
        source: Box<dyn FrameSource>,
        slot: Arc<FrameSlot>,
        tuning: SessionTuning,
    ) -> Result<Self> {
        Self::start_with(source, slot, tuning, RunFlag::new())
    }

    /// [`start`](Self::start) with a caller-held flag, so the startup
    /// itself can be cancelled from another thread.
    pub fn start_with(
        source: Box<dyn FrameSource>,
        slot: Arc<FrameSlot>,
        tuning: SessionTuning,
        run: RunFlag,
    ) -> Result<Self> {
        let epoch = slot.begin();
        let name = source.name();
        let shared = Arc::new(Shared {
            status: Mutex::new(SessionStatus::new(name.clone())),
        });
        let abort = source.abort_handle();
        let (ready_tx, ready_rx) = bounded::<Result<CameraDescriptor>>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let worker = Worker {
            name: name.clone(),
            source,
            run: run.clone(),
            shared: shared.clone(),
            slot: slot.clone(),
            epoch,
            tuning,
            failures: ReconnectState::new(tuning.failure_threshold),
        };
        let handle = spawn_worker(&slot, epoch, || {
            thread::Builder::new()
                .name("camera-capture".into())
                .spawn(move || {
                    let _done = DoneGuard(done_tx);
                    worker.run(ready_tx);
                })
        })?;

        let mut session = Self {
            run,
            shared,
            worker: Some(handle),
            done: done_rx,
            detached: false,
            abort,
            slot,
            epoch,
            tuning,
        };

        match ready_rx.recv_timeout(tuning.startup_timeout) {
            Ok(Ok(descriptor)) => {
                info!("{name}: capturing {descriptor}");
                Ok(session)
            }
            Ok(Err(err)) => {
                session.stop();
                Err(err)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("{name}: no frame within {:?}", tuning.startup_timeout);
                session.stop();
                Err(CameraError::StartupTimeout(tuning.startup_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                session.stop();
                Err(CameraError::Read(format!("{name}: capture worker died during startup")))
            }
        }
    }

    /// Ask the worker to finish and wait up to [`SessionTuning::stop_budget`].
    /// Past that the source is aborted and the worker gets one more join
    /// timeout; if it is still stuck it is left detached (see
    /// [`release_signal`](Self::release_signal)). The epoch is closed either
    /// way so it can no longer publish. Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        self.run.clear();

        let budget = self.tuning.stop_budget();
        let mut finished = self.wait_done(budget);
        if !finished {
            warn!("capture worker did not stop within {budget:?}, aborting its source");
            if let Some(abort) = &self.abort {
                abort.abort();
                finished = self.wait_done(self.tuning.join_timeout);
            }
        }

        if finished {
            if handle.join().is_err() {
                error!("capture worker panicked");
            }
        } else {
            error!("capture worker is stuck, leaving it detached");
            self.detached = true;
        }

        self.slot.close(self.epoch, SlotClosed::Stopped);
        self.shared.update(|s| s.state = SessionState::Stopped);
    }

    fn wait_done(&self, timeout: Duration) -> bool {
        !matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    /// After a stop that had to detach the worker: fires (or disconnects)
    /// once that worker has exited and let go of the device.
    pub fn release_signal(&self) -> Option<Receiver<()>> {
        self.detached.then(|| self.done.clone())
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn descriptor(&self) -> Option<CameraDescriptor> {
        self.shared.lock().descriptor
    }

    /// False once stopped, or once the worker ended on its own.
    pub fn is_active(&self) -> bool {
        self.worker.is_some() && self.state() != SessionState::Stopped
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    name: String,
    source: Box<dyn FrameSource>,
    run: RunFlag,
    shared: Arc<Shared>,
    slot: Arc<FrameSlot>,
    epoch: u64,
    tuning: SessionTuning,
    failures: ReconnectState,
}

impl Worker {
    fn run(mut self, ready: Sender<Result<CameraDescriptor>>) {
        if let Err(err) = self.start_up() {
            warn!("{}: failed to start: {err}", self.name);
            let message = err.to_string();
            self.source.close();
            self.slot.close(self.epoch, SlotClosed::Failed(message.clone()));
            self.shared.update(|s| {
                s.state = SessionState::Stopped;
                s.last_error = Some(message);
            });
            let _ = ready.send(Err(err));
            return;
        }
        let descriptor = self.shared.lock().descriptor;
        if let Some(descriptor) = descriptor {
            let _ = ready.send(Ok(descriptor));
        }
        drop(ready);

        let outcome = self.capture_loop();
        self.source.close();
        // an abort during stop surfaces as a read error; that is still a stop
        match outcome {
            Some(err) if self.run.is_set() => {
                self.slot.close(self.epoch, SlotClosed::Failed(err.to_string()));
            }
            _ => self.slot.close(self.epoch, SlotClosed::Stopped),
        }
        self.shared.update(|s| s.state = SessionState::Stopped);
        info!("{}: capture stopped", self.name);
    }

    fn start_up(&mut self) -> Result<()> {
        let descriptor = self.source.open(&self.run)?;
        self.shared.update(|s| s.descriptor = Some(descriptor));
        let frame = self.source.read_frame()?;
        self.publish(frame)?;
        self.shared.update(|s| s.state = SessionState::Running);
        Ok(())
    }

    /// Runs until the flag clears (`None`) or the source fails terminally.
    fn capture_loop(&mut self) -> Option<CameraError> {
        while self.run.is_set() {
            if !self.source.is_open() {
                warn!("{}: handle reports closed", self.name);
                self.reconnect();
                continue;
            }

            let result = match self.source.read_frame() {
                Ok(frame) => self.publish(frame),
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    if self.failures.failures() > 0 {
                        self.failures.reset();
                        self.shared.update(|s| s.consecutive_failures = 0);
                    }
                }
                Err(err) if err.is_terminal() => {
                    error!("{}: {err}", self.name);
                    let message = err.to_string();
                    self.shared.update(|s| s.last_error = Some(message));
                    return Some(err);
                }
                Err(err) => {
                    let reached = self.failures.record_failure();
                    let failures = self.failures.failures();
                    debug!(
                        "{}: read failed ({failures}/{}): {err}",
                        self.name, self.tuning.failure_threshold
                    );
                    let message = err.to_string();
                    self.shared.update(|s| {
                        s.consecutive_failures = failures;
                        s.last_error = Some(message);
                    });
                    if reached {
                        warn!("{}: {failures} consecutive read failures", self.name);
                        self.reconnect();
                    } else {
                        self.pause(self.tuning.retry_delay);
                    }
                }
            }
        }
        None
    }

    /// Release, back off, reopen; repeat until it works or the flag clears.
    fn reconnect(&mut self) {
        self.shared.update(|s| {
            s.state = SessionState::Reconnecting;
            s.reconnects += 1;
        });
        info!("{}: reconnecting", self.name);
        self.source.close();

        let mut attempt = 0u32;
        while self.pause(self.tuning.reconnect_backoff) {
            attempt += 1;
            match self.source.open(&self.run) {
                Ok(descriptor) => {
                    self.failures.reset();
                    self.shared.update(|s| {
                        s.state = SessionState::Running;
                        s.descriptor = Some(descriptor);
                        s.consecutive_failures = 0;
                    });
                    info!("{}: reconnected as {descriptor}", self.name);
                    return;
                }
                Err(err) => {
                    warn!("{}: reconnect attempt {attempt} failed: {err}", self.name);
                    let message = err.to_string();
                    self.shared.update(|s| s.last_error = Some(message));
                }
            }
        }
    }

    fn publish(&mut self, frame: RawImage) -> Result<()> {
        let (width, height) = (frame.width, frame.height);
        let jpeg = encode::to_jpeg(frame, self.tuning.jpeg_quality)?;
        if self.slot.publish(self.epoch, jpeg, width, height).is_some() {
            self.shared.update(|s| s.frames += 1);
        }
        Ok(())
    }

    /// Sleep in poll-sized slices. False if the flag cleared meanwhile.
    fn pause(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while self.run.is_set() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(self.tuning.poll_interval));
        }
        false
    }
}

/// Spawn the worker thread; if that fails, close the epoch it would have
/// written so cursors already waiting on it end.
fn spawn_worker(
    slot: &FrameSlot,
    epoch: u64,
    spawn: impl FnOnce() -> io::Result<JoinHandle<()>>,
) -> Result<JoinHandle<()>> {
    spawn().map_err(|err| {
        error!("failed to spawn capture worker: {err}");
        slot.close(epoch, SlotClosed::Failed(err.to_string()));
        err.into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotPoll;

    #[test]
    fn threshold_is_reached_exactly_once_per_run_of_failures() {
        let mut state = ReconnectState::new(10);
        let hits: Vec<bool> = (0..10).map(|_| state.record_failure()).collect();
        assert_eq!(hits.iter().filter(|h| **h).count(), 1);
        assert!(hits[9]);
        state.reset();
        assert_eq!(state.failures(), 0);
    }

    #[test]
    fn nine_failures_then_success_never_trips() {
        let mut state = ReconnectState::new(10);
        for _ in 0..9 {
            assert!(!state.record_failure());
        }
        state.reset();
        for _ in 0..9 {
            assert!(!state.record_failure());
        }
    }

    #[test]
    fn default_tuning() {
        let t = SessionTuning::default();
        assert_eq!(t.failure_threshold, 10);
        assert_eq!(t.reconnect_backoff, Duration::from_secs(1));
        assert_eq!(t.jpeg_quality, 85);
    }

    #[test]
    fn stop_budget_covers_a_read_in_flight() {
        let t = SessionTuning::default();
        assert_eq!(t.stop_budget(), t.read_timeout + t.poll_interval + t.join_timeout);
        assert!(t.stop_budget() > t.read_timeout);
    }

    #[test]
    fn failed_spawn_closes_the_new_epoch() {
        let slot = FrameSlot::new();
        let epoch = slot.begin();
        let result = spawn_worker(&slot, epoch, || Err(io::Error::other("no threads left")));

        assert!(matches!(result, Err(CameraError::Io(_))));
        assert!(matches!(slot.closed(), Some(SlotClosed::Failed(_))));
        assert!(matches!(slot.poll(epoch, 0), SlotPoll::Closed(SlotClosed::Failed(_))));
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SessionState::Reconnecting).unwrap(),
            "\"reconnecting\""
        );
    }
}
