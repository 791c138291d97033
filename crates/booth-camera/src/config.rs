//! Camera configuration, persisted as JSON next to the kiosk's other
//! settings. Every field has a default, so a partial file (or none) works.

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    encode::DEFAULT_JPEG_QUALITY, extract::DEFAULT_MAX_BUFFER, manager::CameraManager,
    probe::DEFAULT_FRAME_RATE, Backend, CameraSelector, CaptureRequest, Resolution, Result,
    SensorCommand, SessionTuning,
};

/// Configuration for the capture layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Camera to start on boot
    pub camera: CameraSelector,
    /// Backend to try before the others when probing USB cameras
    pub preferred_backend: Option<Backend>,
    /// Probe ladder, highest first; empty uses 1080p, 720p, 480p
    pub resolutions: Vec<Resolution>,
    /// Frame rate requested from USB cameras
    pub frame_rate: u32,
    /// Quality for re-encoding raw frames
    pub jpeg_quality: u8,
    /// How many device indices the inventory scans
    pub inventory_size: u32,
    /// Cap on a partial JPEG from the sensor process
    pub max_buffer_bytes: usize,
    /// Integrated sensor capture process
    pub sensor: SensorCommand,
    /// Reconnect and shutdown timing
    pub session: SessionConfig,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            camera: CameraSelector::Integrated,
            preferred_backend: None,
            resolutions: Vec::new(),
            frame_rate: DEFAULT_FRAME_RATE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            inventory_size: CameraManager::DEFAULT_INVENTORY_SIZE,
            max_buffer_bytes: DEFAULT_MAX_BUFFER,
            sensor: SensorCommand::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Session timing, in milliseconds on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub failure_threshold: u32,
    pub reconnect_backoff_ms: u64,
    pub retry_delay_ms: u64,
    pub read_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub join_timeout_ms: u64,
    pub startup_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let t = SessionTuning::default();
        Self {
            failure_threshold: t.failure_threshold,
            reconnect_backoff_ms: millis(t.reconnect_backoff),
            retry_delay_ms: millis(t.retry_delay),
            read_timeout_ms: millis(t.read_timeout),
            poll_interval_ms: millis(t.poll_interval),
            join_timeout_ms: millis(t.join_timeout),
            startup_timeout_ms: millis(t.startup_timeout),
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().try_into().unwrap_or(u64::MAX)
}

impl CameraConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Load `path`, or fall back to defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("no camera config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// The boot-time capture request.
    pub fn request(&self) -> CaptureRequest {
        CaptureRequest {
            camera: self.camera,
            preferred_backend: self.preferred_backend,
            resolutions: self.resolutions.clone(),
            frame_rate: self.frame_rate,
        }
    }

    pub fn tuning(&self) -> SessionTuning {
        let s = &self.session;
        SessionTuning {
            failure_threshold: s.failure_threshold,
            reconnect_backoff: Duration::from_millis(s.reconnect_backoff_ms),
            retry_delay: Duration::from_millis(s.retry_delay_ms),
            read_timeout: Duration::from_millis(s.read_timeout_ms),
            poll_interval: Duration::from_millis(s.poll_interval_ms.max(1)),
            join_timeout: Duration::from_millis(s.join_timeout_ms),
            startup_timeout: Duration::from_millis(s.startup_timeout_ms),
            jpeg_quality: self.jpeg_quality.clamp(1, 100),
        }
    }
}
