//! The capability interface the capture worker drives, and its USB variant.
//!
//! The worker only knows `open` / `read_frame` / `close`; whether frames
//! come from a probed USB device or from the sensor process is the source's
//! business. See [`crate::process`] for the other variant.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;

use crate::{CameraDescriptor, CameraError, Prober, RawImage, Result, VideoDevice};

/// Cleared to ask the worker (and anything it is blocked in) to wind down.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Last-resort unblocking of a worker stuck inside a read, used only after
/// the stop timeout has expired.
#[derive(Clone)]
pub struct AbortHandle(Arc<dyn Fn() + Send + Sync>);

impl AbortHandle {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn abort(&self) {
        (self.0)()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AbortHandle")
    }
}

pub trait FrameSource: Send {
    fn name(&self) -> String;

    /// Acquire the handle. Called once on start and again for every
    /// reconnect attempt; `run` going false means give up quickly.
    fn open(&mut self, run: &RunFlag) -> Result<CameraDescriptor>;

    fn read_frame(&mut self) -> Result<RawImage>;

    /// False once the handle is gone or reports itself invalid.
    fn is_open(&self) -> bool;

    /// Release the handle. Idempotent.
    fn close(&mut self);

    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }
}

/// A USB camera opened through the prober. Reconnects re-open the same
/// descriptor, re-probing only if the device comes back different.
pub struct DeviceSource {
    index: u32,
    prober: Prober,
    descriptor: Option<CameraDescriptor>,
    device: Option<Box<dyn VideoDevice>>,
}

impl DeviceSource {
    pub fn new(index: u32, prober: Prober) -> Self {
        Self {
            index,
            prober,
            descriptor: None,
            device: None,
        }
    }

    pub fn descriptor(&self) -> Option<CameraDescriptor> {
        self.descriptor
    }
}

impl FrameSource for DeviceSource {
    fn name(&self) -> String {
        format!("usb camera {}", self.index)
    }

    fn open(&mut self, run: &RunFlag) -> Result<CameraDescriptor> {
        self.close();
        let keep_going = || run.is_set();
        let (descriptor, device) = match &self.descriptor {
            Some(previous) => self.prober.reopen(previous, &keep_going)?,
            None => self.prober.probe_open(self.index, &keep_going)?,
        };
        if self.descriptor.is_some_and(|d| d != descriptor) {
            info!("camera {} came back as {descriptor}", self.index);
        }
        self.descriptor = Some(descriptor);
        self.device = Some(device);
        Ok(descriptor)
    }

    fn read_frame(&mut self) -> Result<RawImage> {
        self.device
            .as_mut()
            .ok_or(CameraError::Disconnected)?
            .read_frame()
    }

    fn is_open(&self) -> bool {
        self.device.as_ref().is_some_and(|d| d.is_opened())
    }

    fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.release();
        }
    }
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        self.close();
    }
}
