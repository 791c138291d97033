//! Camera identity and capture-mode types shared by the prober, the
//! sources and the session.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which camera to stream from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraSelector {
    /// The board's own sensor, driven through an external capture process.
    Integrated,
    /// A USB camera by device index.
    Usb(u32),
}

impl Default for CameraSelector {
    fn default() -> Self {
        CameraSelector::Integrated
    }
}

impl fmt::Display for CameraSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSelector::Integrated => f.write_str("integrated sensor"),
            CameraSelector::Usb(index) => write!(f, "usb camera {index}"),
        }
    }
}

/// A native capture API a device can be opened through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Auto,
    DirectShow,
    V4l2,
    GStreamer,
    /// Frames come from an external process's stdout.
    Subprocess,
}

impl Backend {
    /// Probe order for USB devices: generic first, then platform APIs.
    pub const PRIORITY: [Backend; 4] = [
        Backend::Auto,
        Backend::DirectShow,
        Backend::V4l2,
        Backend::GStreamer,
    ];
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Auto => "Auto",
            Backend::DirectShow => "DirectShow",
            Backend::V4l2 => "V4L2",
            Backend::GStreamer => "GStreamer",
            Backend::Subprocess => "Subprocess",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const FULL_HD: Resolution = Resolution::new(1920, 1080);
    pub const HD: Resolution = Resolution::new(1280, 720);
    pub const VGA: Resolution = Resolution::new(640, 480);

    /// Default descending ladder tried by the prober.
    pub const LADDER: [Resolution; 3] = [Self::FULL_HD, Self::HD, Self::VGA];

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when `width`×`height` is at least `ratio` of this resolution on
    /// both axes. Drivers that silently clamp to a smaller mode fail this.
    pub fn covered_by(&self, width: u32, height: u32, ratio: f64) -> bool {
        f64::from(width) >= f64::from(self.width) * ratio
            && f64::from(height) >= f64::from(self.height) * ratio
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// What the prober asks a device for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMode {
    pub resolution: Resolution,
    pub frame_rate: u32,
}

/// The (device, backend, resolution, rate) tuple a probe settled on.
/// Immutable once chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDescriptor {
    pub device: CameraSelector,
    pub backend: Backend,
    pub resolution: Resolution,
    pub frame_rate: u32,
}

impl CameraDescriptor {
    pub fn mode(&self) -> CaptureMode {
        CaptureMode {
            resolution: self.resolution,
            frame_rate: self.frame_rate,
        }
    }
}

impl fmt::Display for CameraDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) - {}@{}fps",
            self.device, self.backend, self.resolution, self.frame_rate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgr8,
    Rgb8,
    /// Already JPEG-encoded (MJPEG devices, the sensor process).
    Jpeg,
}

/// One frame as a driver hands it over, before transport encoding.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_allows_ten_percent_clamp() {
        let hd = Resolution::HD;
        assert!(hd.covered_by(1280, 720, 0.9));
        assert!(hd.covered_by(1152, 648, 0.9));
        assert!(!hd.covered_by(1151, 720, 0.9));
        assert!(!hd.covered_by(640, 480, 0.9));
    }

    #[test]
    fn selector_json_shape() {
        let usb: CameraSelector = serde_json::from_str(r#"{"usb":2}"#).unwrap();
        assert_eq!(usb, CameraSelector::Usb(2));
        let integrated: CameraSelector = serde_json::from_str(r#""integrated""#).unwrap();
        assert_eq!(integrated, CameraSelector::Integrated);
    }
}
