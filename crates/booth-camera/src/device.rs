//! Capability traits every capture backend implements.
//!
//! A [`DeviceDriver`] is one entry of the prober's backend list; it knows how
//! to open a device index through one native API. The [`VideoDevice`] it
//! returns is the handle the capture worker owns exclusively.

use crate::{Backend, CaptureMode, RawImage, Result};

pub trait DeviceDriver: Send + Sync {
    fn backend(&self) -> Backend;

    /// Open `index` through this backend. An `Ok` handle may still report
    /// `is_opened() == false` (OpenCV does that instead of failing).
    fn open(&self, index: u32) -> Result<Box<dyn VideoDevice>>;
}

pub trait VideoDevice: Send {
    /// Request a resolution and frame rate. Devices are free to clamp; the
    /// prober checks what a test read actually returns.
    fn configure(&mut self, mode: CaptureMode) -> Result<()>;

    /// Blocking read of the next frame, bounded by the driver's own timeout.
    fn read_frame(&mut self) -> Result<RawImage>;

    fn is_opened(&self) -> bool;

    /// Release the underlying handle. Must be idempotent.
    fn release(&mut self);
}
