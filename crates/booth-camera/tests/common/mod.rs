//! Scriptable fake camera shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use booth_camera::{
    Backend, CameraError, CaptureMode, DeviceDriver, DeviceSource, PixelFormat, Prober, RawImage,
    Result, SessionTuning, VideoDevice,
};

pub const FAKE_JPEG: [u8; 6] = [0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];

/// Knobs and counters shared by every handle a [`MockDriver`] hands out.
#[derive(Debug, Default)]
pub struct MockState {
    /// Indices below this open; the rest do not exist.
    pub devices: AtomicU32,
    pub open_handles: AtomicUsize,
    pub max_open: AtomicUsize,
    pub opens: AtomicUsize,
    /// The next N reads fail.
    pub fail_reads: AtomicU32,
    pub refuse_opens: AtomicBool,
    /// Open handles report themselves invalid.
    pub unplugged: AtomicBool,
    /// Extra time every read blocks for.
    pub read_delay_ms: AtomicU64,
    /// Largest mode the sensor delivers; bigger requests are clamped.
    pub max_width: AtomicU32,
    pub max_height: AtomicU32,
    pub opened: Mutex<Vec<u32>>,
}

impl MockState {
    pub fn new(devices: u32) -> Arc<Self> {
        let state = Self::default();
        state.devices.store(devices, Ordering::SeqCst);
        state.max_width.store(u32::MAX, Ordering::SeqCst);
        state.max_height.store(u32::MAX, Ordering::SeqCst);
        Arc::new(state)
    }

    /// A sensor that silently clamps every mode to `width`x`height`.
    pub fn clamp_to(&self, width: u32, height: u32) {
        self.max_width.store(width, Ordering::SeqCst);
        self.max_height.store(height, Ordering::SeqCst);
    }

    pub fn handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub fn opened_indices(&self) -> Vec<u32> {
        self.opened.lock().unwrap().clone()
    }
}

pub struct MockDriver {
    pub state: Arc<MockState>,
}

impl DeviceDriver for MockDriver {
    fn backend(&self) -> Backend {
        Backend::Auto
    }

    fn open(&self, index: u32) -> Result<Box<dyn VideoDevice>> {
        let s = &self.state;
        if s.refuse_opens.load(Ordering::SeqCst) || index >= s.devices.load(Ordering::SeqCst) {
            return Err(CameraError::Open { device: index, backend: Backend::Auto });
        }
        let now = s.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        s.max_open.fetch_max(now, Ordering::SeqCst);
        s.opens.fetch_add(1, Ordering::SeqCst);
        s.opened.lock().unwrap().push(index);
        Ok(Box::new(MockDevice { state: s.clone(), mode: None, open: true }))
    }
}

struct MockDevice {
    state: Arc<MockState>,
    mode: Option<CaptureMode>,
    open: bool,
}

impl VideoDevice for MockDevice {
    fn configure(&mut self, mode: CaptureMode) -> Result<()> {
        self.mode = Some(mode);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawImage> {
        let delay = self.state.read_delay_ms.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(delay.max(2)));
        let failing = self
            .state
            .fail_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CameraError::Read("scripted failure".into()));
        }
        let mode = self.mode.ok_or(CameraError::Disconnected)?;
        Ok(RawImage {
            width: mode.resolution.width.min(self.state.max_width.load(Ordering::SeqCst)),
            height: mode.resolution.height.min(self.state.max_height.load(Ordering::SeqCst)),
            format: PixelFormat::Jpeg,
            data: FAKE_JPEG.to_vec(),
        })
    }

    fn is_opened(&self) -> bool {
        self.open && !self.state.unplugged.load(Ordering::SeqCst)
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.state.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.release();
    }
}

pub fn drivers(state: &Arc<MockState>) -> Vec<Arc<dyn DeviceDriver>> {
    vec![Arc::new(MockDriver { state: state.clone() })]
}

pub fn usb_source(state: &Arc<MockState>, index: u32) -> Box<DeviceSource> {
    Box::new(DeviceSource::new(index, Prober::new(drivers(state))))
}

/// Real thresholds, short sleeps.
pub fn fast_tuning() -> SessionTuning {
    SessionTuning {
        reconnect_backoff: Duration::from_millis(50),
        retry_delay: Duration::from_millis(1),
        read_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(5),
        startup_timeout: Duration::from_secs(5),
        ..SessionTuning::default()
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
