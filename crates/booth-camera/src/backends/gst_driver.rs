//! Native GStreamer capture: `v4l2src ! videoconvert ! appsink`, RGB out.
//!
//! The caps filter pins the exact size, so a camera that cannot deliver a
//! ladder rung fails negotiation and the read times out, which the prober
//! treats as "not supported".

use std::path::Path;

use gst::prelude::*;

use crate::{Backend, CameraError, CaptureMode, DeviceDriver, PixelFormat, RawImage, Result, VideoDevice};

const PULL_TIMEOUT_SECS: u64 = 2;

pub struct GstDriver;

impl DeviceDriver for GstDriver {
    fn backend(&self) -> Backend {
        Backend::GStreamer
    }

    fn open(&self, index: u32) -> Result<Box<dyn VideoDevice>> {
        gst::init().map_err(CameraError::GstInit)?;

        let node = format!("/dev/video{index}");
        if !Path::new(&node).exists() {
            return Err(CameraError::Open {
                device: index,
                backend: Backend::GStreamer,
            });
        }
        Ok(Box::new(GstDevice {
            node,
            pipeline: None,
            appsink: None,
            released: false,
        }))
    }
}

/// Owns the pipeline and *appsink* for one device node.
struct GstDevice {
    node: String,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
    released: bool,
}

impl GstDevice {
    fn build(&self, mode: CaptureMode) -> Result<(gst::Pipeline, gst_app::AppSink)> {
        let pipe_str = format!(
            "v4l2src device={node} ! videoconvert \
            ! video/x-raw,format=RGB,width={w},height={h},framerate={f}/1 \
            ! queue leaky=2 max-size-buffers=2 ! appsink name=sink max-buffers=1 drop=true sync=false",
            node = self.node,
            w = mode.resolution.width,
            h = mode.resolution.height,
            f = mode.frame_rate
        );

        let pipeline = gst::parse::launch(&pipe_str)
            .map_err(CameraError::ParsePipeline)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CameraError::NotPipeline)?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or(CameraError::AppSinkNotFound)?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CameraError::AppSinkNotFound)?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(CameraError::StateChange)?;

        Ok((pipeline, appsink))
    }

    fn teardown(&mut self) {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }

    /// Copy a packed-RGB `gst::Sample` out, dropping any row padding.
    fn sample_to_frame(sample: gst::Sample) -> Result<RawImage> {
        let buffer = sample.buffer().ok_or(CameraError::MissingBuffer)?;
        let caps = sample.caps().ok_or(CameraError::MissingCaps)?;
        let s = caps.structure(0).ok_or(CameraError::MissingCaps)?;
        let width = s.get::<i32>("width").map_err(|e| CameraError::FieldError(e.to_string()))? as u32;
        let height = s.get::<i32>("height").map_err(|e| CameraError::FieldError(e.to_string()))? as u32;

        let map = buffer.map_readable().map_err(|e| CameraError::BufferMap(e.to_string()))?;
        let row = width as usize * 3;
        let rows = height as usize;
        let stride = if rows == 0 { 0 } else { map.size() / rows };
        if stride < row || rows == 0 {
            return Err(CameraError::FrameSize {
                expected: row * rows,
                actual: map.size(),
            });
        }

        let data = if stride == row {
            map.as_slice()[..row * rows].to_vec()
        } else {
            // GStreamer pads RGB rows to 4 bytes
            let mut bytes = Vec::with_capacity(row * rows);
            for line in map.as_slice().chunks(stride).take(rows) {
                bytes.extend_from_slice(&line[..row]);
            }
            bytes
        };

        Ok(RawImage {
            width,
            height,
            format: PixelFormat::Rgb8,
            data,
        })
    }
}

impl VideoDevice for GstDevice {
    fn configure(&mut self, mode: CaptureMode) -> Result<()> {
        self.teardown();
        let (pipeline, appsink) = self.build(mode)?;
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawImage> {
        let appsink = self.appsink.as_ref().ok_or(CameraError::Disconnected)?;
        match appsink.try_pull_sample(gst::ClockTime::from_seconds(PULL_TIMEOUT_SECS)) {
            Some(sample) => Self::sample_to_frame(sample),
            None if appsink.is_eos() => Err(CameraError::Disconnected),
            None => Err(CameraError::Read("timed out waiting for a sample".into())),
        }
    }

    fn is_opened(&self) -> bool {
        !self.released
            && Path::new(&self.node).exists()
            && !self.appsink.as_ref().is_some_and(|sink| sink.is_eos())
    }

    fn release(&mut self) {
        self.teardown();
        self.released = true;
    }
}

impl Drop for GstDevice {
    fn drop(&mut self) {
        self.teardown();
    }
}
