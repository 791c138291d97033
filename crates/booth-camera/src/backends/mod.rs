//! Compiled-in USB camera drivers.
//!
//! With neither driver feature enabled the list is empty and only the
//! integrated sensor can be used.

use std::sync::Arc;

use crate::{Backend, DeviceDriver};

#[cfg(feature = "gstreamer")]
pub mod gst_driver;
#[cfg(feature = "opencv")]
pub mod opencv_driver;

/// One driver per available backend, in [`Backend::PRIORITY`] order.
pub fn system_drivers() -> Vec<Arc<dyn DeviceDriver>> {
    Backend::PRIORITY
        .into_iter()
        .filter_map(driver_for)
        .collect()
}

/// The native GStreamer pipeline wins over OpenCV's GStreamer capture
/// when both are built.
#[allow(unreachable_code, unused_variables)]
fn driver_for(backend: Backend) -> Option<Arc<dyn DeviceDriver>> {
    #[cfg(feature = "gstreamer")]
    {
        if backend == Backend::GStreamer {
            return Some(Arc::new(gst_driver::GstDriver));
        }
    }
    #[cfg(feature = "opencv")]
    {
        if backend != Backend::Subprocess {
            return Some(Arc::new(opencv_driver::OpenCvDriver::new(backend)));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drivers_follow_priority_order() {
        let backends: Vec<Backend> = system_drivers().iter().map(|d| d.backend()).collect();
        let mut expected = Backend::PRIORITY.to_vec();
        expected.retain(|b| backends.contains(b));
        assert_eq!(backends, expected);
        assert!(!backends.contains(&Backend::Subprocess));
    }
}
