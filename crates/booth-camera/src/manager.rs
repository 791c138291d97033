//! Session lifecycle: at most one capture session per process.
//!
//! Every start/stop/switch goes through one mutex, so two requests can
//! never race each other into holding two device handles. A switch always
//! stops (and joins) the old session before the new one opens anything.
//! A start that is still probing holds that mutex, so `stop` and `shutdown`
//! first clear the starting session's run flag through a lock of its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    backends, extract::DEFAULT_MAX_BUFFER, probe::DEFAULT_FRAME_RATE, Backend, CameraConfig,
    CameraDescriptor, CameraError, CameraSelector, CaptureSession, DeviceDriver, DeviceSource,
    Frame, FrameSlot, FrameSource, MjpegFrames, ProcessSource, Prober, Resolution, Result,
    RunFlag, SensorCommand, SessionStatus, SessionTuning,
};

/// Which camera to run and how to probe it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureRequest {
    pub camera: CameraSelector,
    pub preferred_backend: Option<Backend>,
    /// Probe ladder, highest first. Empty means the built-in ladder.
    pub resolutions: Vec<Resolution>,
    pub frame_rate: u32,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self::new(CameraSelector::default())
    }
}

impl CaptureRequest {
    pub fn new(camera: CameraSelector) -> Self {
        Self {
            camera,
            preferred_backend: None,
            resolutions: Vec::new(),
            frame_rate: DEFAULT_FRAME_RATE,
        }
    }
}

/// Builds the frame source for a request. The seam tests replace.
pub trait SourceFactory: Send + Sync {
    fn create(&self, request: &CaptureRequest) -> Result<Box<dyn FrameSource>>;

    /// Working USB cameras among indices `0..count`, skipping `busy`,
    /// probed with the ladder, frame rate and backend of `request`.
    fn inventory(
        &self,
        _request: &CaptureRequest,
        _count: u32,
        _busy: Option<u32>,
    ) -> Vec<CameraDescriptor> {
        Vec::new()
    }
}

/// The real thing: compiled-in drivers for USB, `libcamera-vid` for the
/// integrated sensor.
pub struct DriverSources {
    drivers: Vec<Arc<dyn DeviceDriver>>,
    sensor: SensorCommand,
    max_buffer: usize,
}

impl DriverSources {
    pub fn new(drivers: Vec<Arc<dyn DeviceDriver>>, sensor: SensorCommand) -> Self {
        Self {
            drivers,
            sensor,
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    }

    /// Every driver this build was compiled with, in priority order.
    pub fn system(sensor: SensorCommand) -> Self {
        Self::new(backends::system_drivers(), sensor)
    }

    pub fn with_max_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    fn prober(&self, request: &CaptureRequest) -> Prober {
        Prober::new(self.drivers.clone())
            .with_ladder(request.resolutions.clone())
            .with_frame_rate(request.frame_rate)
            .prefer(request.preferred_backend)
    }
}

impl SourceFactory for DriverSources {
    fn create(&self, request: &CaptureRequest) -> Result<Box<dyn FrameSource>> {
        match request.camera {
            CameraSelector::Integrated => Ok(Box::new(ProcessSource::with_max_buffer(
                self.sensor.clone(),
                self.max_buffer,
            ))),
            CameraSelector::Usb(_) if self.drivers.is_empty() => Err(CameraError::NoDriver),
            CameraSelector::Usb(index) => {
                Ok(Box::new(DeviceSource::new(index, self.prober(request))))
            }
        }
    }

    fn inventory(
        &self,
        request: &CaptureRequest,
        count: u32,
        busy: Option<u32>,
    ) -> Vec<CameraDescriptor> {
        let prober = self.prober(request);
        (0..count)
            .filter(|index| Some(*index) != busy)
            .filter_map(|index| prober.probe(index).ok())
            .collect()
    }
}

struct Active {
    request: CaptureRequest,
    session: CaptureSession,
}

pub struct CameraManager {
    factory: Arc<dyn SourceFactory>,
    slot: Arc<FrameSlot>,
    tuning: SessionTuning,
    inventory_size: u32,
    /// Probe settings used by `inventory` when nothing is running.
    defaults: CaptureRequest,
    active: Mutex<Option<Active>>,
    /// Run flag of a start in progress.
    starting: Mutex<Option<RunFlag>>,
    /// Release signals of workers a stop had to leave detached.
    lingering: Mutex<Vec<Receiver<()>>>,
    shut_down: AtomicBool,
}

impl CameraManager {
    pub const DEFAULT_INVENTORY_SIZE: u32 = 10;

    pub fn new(factory: Arc<dyn SourceFactory>, tuning: SessionTuning) -> Self {
        Self {
            factory,
            slot: Arc::new(FrameSlot::new()),
            tuning,
            inventory_size: Self::DEFAULT_INVENTORY_SIZE,
            defaults: CaptureRequest::default(),
            active: Mutex::new(None),
            starting: Mutex::new(None),
            lingering: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// A manager over this build's drivers, configured from `config`.
    pub fn from_config(config: &CameraConfig) -> Self {
        let factory = DriverSources::system(config.sensor.clone())
            .with_max_buffer(config.max_buffer_bytes);
        Self::new(Arc::new(factory), config.tuning())
            .with_inventory_size(config.inventory_size)
            .with_defaults(config.request())
    }

    pub fn with_inventory_size(mut self, count: u32) -> Self {
        self.inventory_size = count;
        self
    }

    pub fn with_defaults(mut self, request: CaptureRequest) -> Self {
        self.defaults = request;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn starting(&self) -> MutexGuard<'_, Option<RunFlag>> {
        self.starting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lingering(&self) -> MutexGuard<'_, Vec<Receiver<()>>> {
        self.lingering.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Interrupt a start that is still probing or waiting for its first frame.
    fn cancel_start(&self) {
        if let Some(run) = self.starting().take() {
            info!("cancelling camera start");
            run.clear();
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(CameraError::ShutDown);
        }
        Ok(())
    }

    pub fn slot(&self) -> Arc<FrameSlot> {
        self.slot.clone()
    }

    /// Start capturing `request`. A no-op when an equivalent session is
    /// already running; any other session is stopped first.
    pub fn start(&self, request: &CaptureRequest) -> Result<SessionStatus> {
        self.check_open()?;
        let mut active = self.lock();
        if let Some(current) = active.as_ref() {
            if current.request == *request && current.session.is_active() {
                return Ok(current.session.status());
            }
        }
        self.stop_locked(&mut active);
        self.launch(&mut active, request)
    }

    /// Replace whatever is running with `request`, even if equivalent.
    pub fn switch(&self, request: &CaptureRequest) -> Result<SessionStatus> {
        self.check_open()?;
        let mut active = self.lock();
        self.stop_locked(&mut active);
        self.launch(&mut active, request)
    }

    /// Stop the running session, if any, and cancel a start in progress.
    /// Idempotent.
    pub fn stop(&self) {
        self.cancel_start();
        self.stop_locked(&mut self.lock());
    }

    /// Stop and refuse every later start. Used on process exit.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            info!("camera manager shutting down");
        }
        self.stop();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.lock().as_ref().map(|a| a.session.status())
    }

    pub fn request(&self) -> Option<CaptureRequest> {
        self.lock().as_ref().map(|a| a.request.clone())
    }

    pub fn is_active(&self) -> bool {
        self.lock().as_ref().is_some_and(|a| a.session.is_active())
    }

    /// Latest frame of the current session, if one has been captured.
    pub fn current_frame(&self) -> Option<Frame> {
        self.slot.read()
    }

    pub fn snapshot(&self) -> Result<Frame> {
        self.slot.snapshot()
    }

    /// A cursor over the current session's frames.
    pub fn viewer(&self) -> MjpegFrames {
        MjpegFrames::new(self.slot.clone())
    }

    /// Working USB cameras. The device the live session holds is reported
    /// from its descriptor rather than re-opened.
    pub fn inventory(&self) -> Vec<CameraDescriptor> {
        let active = self.lock();
        let live = active
            .as_ref()
            .filter(|a| a.session.is_active())
            .and_then(|a| a.session.descriptor())
            .filter(|d| matches!(d.device, CameraSelector::Usb(_)));
        let busy = live.and_then(|d| match d.device {
            CameraSelector::Usb(index) => Some(index),
            CameraSelector::Integrated => None,
        });

        let request = active.as_ref().map_or(&self.defaults, |a| &a.request);
        let mut found = self.factory.inventory(request, self.inventory_size, busy);
        found.extend(live);
        found.sort_by_key(|d| match d.device {
            CameraSelector::Usb(index) => index,
            CameraSelector::Integrated => u32::MAX,
        });
        found
    }

    fn launch(&self, active: &mut Option<Active>, request: &CaptureRequest) -> Result<SessionStatus> {
        let run = RunFlag::new();
        *self.starting() = Some(run.clone());
        // checked after publishing the flag so a concurrent shutdown sees one or the other
        let result = self
            .check_open()
            .and_then(|()| self.launch_with(active, request, &run));
        self.starting().take();
        result
    }

    fn launch_with(
        &self,
        active: &mut Option<Active>,
        request: &CaptureRequest,
        run: &RunFlag,
    ) -> Result<SessionStatus> {
        self.await_released(run)?;
        info!("starting {}", request.camera);
        let source = self.factory.create(request)?;
        let result = CaptureSession::start_with(source, self.slot.clone(), self.tuning, run.clone());
        let mut session = match result {
            Ok(session) => session,
            Err(_) if !run.is_set() => return Err(CameraError::Cancelled),
            Err(err) => {
                warn!("{} failed to start: {err}", request.camera);
                return Err(err);
            }
        };
        if !run.is_set() {
            session.stop();
            self.keep_lingering(&session);
            return Err(CameraError::Cancelled);
        }
        let status = session.status();
        *active = Some(Active {
            request: request.clone(),
            session,
        });
        Ok(status)
    }

    /// Wait for detached workers to let go of their device before a new
    /// session opens one. Gives up after the startup timeout.
    fn await_released(&self, run: &RunFlag) -> Result<()> {
        let mut lingering = self.lingering();
        let deadline = Instant::now() + self.tuning.startup_timeout;
        while let Some(done) = lingering.last() {
            match done.recv_timeout(self.tuning.poll_interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if !run.is_set() {
                        return Err(CameraError::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        warn!("a stopped capture worker still holds its camera");
                        return Err(CameraError::Busy);
                    }
                }
                _ => {
                    lingering.pop();
                }
            }
        }
        Ok(())
    }

    fn keep_lingering(&self, session: &CaptureSession) {
        if let Some(done) = session.release_signal() {
            self.lingering().push(done);
        }
    }

    fn stop_locked(&self, active: &mut Option<Active>) {
        if let Some(mut current) = active.take() {
            info!("stopping {}", current.request.camera);
            current.session.stop();
            self.keep_lingering(&current.session);
        }
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.stop();
    }
}
