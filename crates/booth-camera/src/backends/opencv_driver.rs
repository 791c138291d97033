//! USB capture through OpenCV's `VideoCapture`, one driver per API
//! preference (any, DirectShow, V4L2, GStreamer).

use ::opencv::{core::Mat, prelude::*, videoio};
use log::debug;

use crate::{Backend, CameraError, CaptureMode, DeviceDriver, PixelFormat, RawImage, Result, VideoDevice};

pub struct OpenCvDriver {
    backend: Backend,
}

impl OpenCvDriver {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    fn api_preference(&self) -> i32 {
        match self.backend {
            Backend::DirectShow => videoio::CAP_DSHOW,
            Backend::V4l2 => videoio::CAP_V4L2,
            Backend::GStreamer => videoio::CAP_GSTREAMER,
            Backend::Auto | Backend::Subprocess => videoio::CAP_ANY,
        }
    }
}

impl DeviceDriver for OpenCvDriver {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn open(&self, index: u32) -> Result<Box<dyn VideoDevice>> {
        let index = i32::try_from(index).map_err(|_| CameraError::Open {
            device: index,
            backend: self.backend,
        })?;
        let cap = videoio::VideoCapture::new(index, self.api_preference())?;
        Ok(Box::new(OpenCvDevice {
            cap,
            frame: Mat::default(),
            released: false,
        }))
    }
}

struct OpenCvDevice {
    cap: videoio::VideoCapture,
    frame: Mat,
    released: bool,
}

impl VideoDevice for OpenCvDevice {
    fn configure(&mut self, mode: CaptureMode) -> Result<()> {
        let CaptureMode { resolution, frame_rate } = mode;
        // drivers that ignore a property just return false
        self.cap.set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(resolution.width))?;
        self.cap.set(videoio::CAP_PROP_FRAME_HEIGHT, f64::from(resolution.height))?;
        if !self.cap.set(videoio::CAP_PROP_FPS, f64::from(frame_rate))? {
            debug!("driver ignored {frame_rate} fps");
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawImage> {
        if !self.cap.read(&mut self.frame)? || self.frame.empty() {
            return Err(CameraError::Read("no frame from VideoCapture".into()));
        }
        if self.frame.channels() != 3 {
            return Err(CameraError::Read(format!(
                "expected 3-channel BGR, got {} channels",
                self.frame.channels()
            )));
        }

        let size = self.frame.size()?;
        let data = if self.frame.is_continuous() {
            self.frame.data_bytes()?.to_vec()
        } else {
            self.frame.try_clone()?.data_bytes()?.to_vec()
        };
        Ok(RawImage {
            width: size.width as u32,
            height: size.height as u32,
            format: PixelFormat::Bgr8,
            data,
        })
    }

    fn is_opened(&self) -> bool {
        !self.released && self.cap.is_opened().unwrap_or(false)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(err) = self.cap.release() {
                debug!("VideoCapture release failed: {err}");
            }
        }
    }
}

impl Drop for OpenCvDevice {
    fn drop(&mut self) {
        self.release();
    }
}
