// booth-camera/src/lib.rs
// ============================================================
// Live capture core for the photo booth kiosk
// Picks a working camera backend/resolution, keeps one capture
// session alive across device drop-outs, and fans the latest
// JPEG out to any number of MJPEG viewers.
// ------------------------------------------------------------
// Public API:
//   * Prober::probe()            – first working backend + resolution
//   * FrameExtractor::feed()     – JPEGs out of a raw byte stream
//   * CaptureSession::start()    – background capture worker
//   * FrameSlot::read()          – latest published frame
//   * MjpegFrames / mjpeg_stream – per-viewer multipart chunks
//   * CameraManager              – start / stop / switch / snapshot
// ------------------------------------------------------------
// Build notes
//   * Hardware drivers are opt-in: `--features opencv`,
//     `--features gstreamer`. The integrated-sensor path only
//     needs `libcamera-vid` on the PATH.
// ============================================================

//! Booth – camera capture layer
//!
//! A [`CameraManager`] owns at most one [`CaptureSession`]. The session's
//! worker thread owns the device (a USB camera opened through a
//! [`DeviceDriver`], or the integrated sensor's `libcamera-vid` process),
//! re-encodes every frame to JPEG and publishes it into a shared
//! [`FrameSlot`]. HTTP viewers and the snapshot endpoint only ever read
//! that slot, so capture work is never duplicated per viewer.

use std::time::Duration;

use thiserror::Error;

pub mod backends;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod encode;
pub mod extract;
pub mod manager;
pub mod probe;
pub mod process;
pub mod session;
pub mod slot;
pub mod source;
pub mod stream;

pub use config::CameraConfig;
pub use descriptor::{Backend, CameraDescriptor, CameraSelector, CaptureMode, PixelFormat, RawImage, Resolution};
pub use device::{DeviceDriver, VideoDevice};
pub use extract::FrameExtractor;
pub use manager::{CameraManager, CaptureRequest, DriverSources, SourceFactory};
pub use probe::Prober;
pub use process::{ProcessSource, SensorCommand};
pub use session::{CaptureSession, SessionState, SessionStatus, SessionTuning};
pub use slot::{Frame, FrameSlot, SlotClosed};
pub use source::{AbortHandle, DeviceSource, FrameSource, RunFlag};
pub use stream::{mjpeg_stream, MjpegFrames};

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera {device} unavailable: no backend/resolution combination produced a frame")]
    ProbeFailure { device: u32 },
    #[error("failed to open camera {device} with backend {backend}")]
    Open { device: u32, backend: Backend },
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("camera disconnected")]
    Disconnected,
    #[error("capture process exited: {0}")]
    ProcessExit(String),
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("no frame available yet")]
    NoFrame,
    #[error("capture session did not come up within {0:?}")]
    StartupTimeout(Duration),
    #[error("camera manager is shut down")]
    ShutDown,
    #[error("camera start cancelled by a stop request")]
    Cancelled,
    #[error("previous capture worker still holds the camera")]
    Busy,
    #[error("no capture driver compiled in for USB cameras")]
    NoDriver,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid camera config: {0}")]
    Config(#[from] serde_json::Error),
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[cfg(feature = "gstreamer")]
    #[error("GStreamer init failed: {0}")]
    GstInit(#[source] gst::glib::Error),
    #[cfg(feature = "gstreamer")]
    #[error("Failed to parse pipeline: {0}")]
    ParsePipeline(#[source] gst::glib::Error),
    #[cfg(feature = "gstreamer")]
    #[error("Pipeline is not a gst::Pipeline")]
    NotPipeline,
    #[cfg(feature = "gstreamer")]
    #[error("AppSink element not found")]
    AppSinkNotFound,
    #[cfg(feature = "gstreamer")]
    #[error("Failed to set pipeline to Playing: {0}")]
    StateChange(#[source] gst::StateChangeError),
    #[cfg(feature = "gstreamer")]
    #[error("Sample has no buffer")]
    MissingBuffer,
    #[cfg(feature = "gstreamer")]
    #[error("Sample has no caps")]
    MissingCaps,
    #[cfg(feature = "gstreamer")]
    #[error("Failed to get field value: {0}")]
    FieldError(String),
    #[cfg(feature = "gstreamer")]
    #[error("Buffer map failed: {0}")]
    BufferMap(String),
}

impl CameraError {
    /// Failures that end the session instead of feeding the reconnect loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CameraError::ProcessExit(_) | CameraError::Spawn { .. })
    }
}

pub type Result<T> = std::result::Result<T, CameraError>;
