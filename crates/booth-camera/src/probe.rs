//! Device prober: walk (backend × resolution ladder) until one test read
//! comes back at the requested size.
//!
//! The backend list and ladder are plain data, so adding a backend or a
//! resolution never touches the search loop.

use std::sync::Arc;

use log::{debug, info};

use crate::{
    Backend, CameraDescriptor, CameraError, CameraSelector, CaptureMode, DeviceDriver,
    Resolution, Result, VideoDevice,
};

/// A test frame must reach this share of the requested width and height.
pub const MIN_COVERAGE: f64 = 0.9;
pub const DEFAULT_FRAME_RATE: u32 = 30;

#[derive(Clone)]
pub struct Prober {
    drivers: Vec<Arc<dyn DeviceDriver>>,
    ladder: Vec<Resolution>,
    frame_rate: u32,
}

impl Prober {
    /// `drivers` is taken as the backend priority order.
    pub fn new(drivers: Vec<Arc<dyn DeviceDriver>>) -> Self {
        Self {
            drivers,
            ladder: Resolution::LADDER.to_vec(),
            frame_rate: DEFAULT_FRAME_RATE,
        }
    }

    /// Replace the resolution ladder. An empty ladder keeps the default.
    pub fn with_ladder(mut self, ladder: Vec<Resolution>) -> Self {
        if !ladder.is_empty() {
            self.ladder = ladder;
        }
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    /// Move `backend`'s driver to the front, keeping the rest in order.
    pub fn prefer(mut self, backend: Option<Backend>) -> Self {
        if let Some(backend) = backend {
            if let Some(pos) = self.drivers.iter().position(|d| d.backend() == backend) {
                let driver = self.drivers.remove(pos);
                self.drivers.insert(0, driver);
            }
        }
        self
    }

    pub fn backends(&self) -> Vec<Backend> {
        self.drivers.iter().map(|d| d.backend()).collect()
    }

    pub fn ladder(&self) -> &[Resolution] {
        &self.ladder
    }

    /// Find the first working combination for `index` and release the handle.
    pub fn probe(&self, index: u32) -> Result<CameraDescriptor> {
        let (descriptor, mut device) = self.probe_open(index, &|| true)?;
        device.release();
        Ok(descriptor)
    }

    /// Like [`probe`](Self::probe) but hands back the open, configured handle.
    ///
    /// `keep_going` is polled between attempts so a stop request does not
    /// have to wait for the whole ladder.
    pub fn probe_open(
        &self,
        index: u32,
        keep_going: &dyn Fn() -> bool,
    ) -> Result<(CameraDescriptor, Box<dyn VideoDevice>)> {
        if self.drivers.is_empty() {
            return Err(CameraError::NoDriver);
        }

        for driver in &self.drivers {
            if !keep_going() {
                break;
            }
            let backend = driver.backend();
            let mut device = match self.open_with(driver.as_ref(), index) {
                Some(device) => device,
                None => continue,
            };

            for &resolution in &self.ladder {
                if !keep_going() {
                    break;
                }
                let mode = CaptureMode {
                    resolution,
                    frame_rate: self.frame_rate,
                };
                if accepts(device.as_mut(), mode) {
                    let descriptor = CameraDescriptor {
                        device: CameraSelector::Usb(index),
                        backend,
                        resolution,
                        frame_rate: self.frame_rate,
                    };
                    info!("camera {index}: {descriptor}");
                    return Ok((descriptor, device));
                }
                debug!("camera {index}: {resolution} not supported via {backend}");
            }

            debug!("camera {index}: no working resolution via {backend}");
            device.release();
        }

        Err(CameraError::ProbeFailure { device: index })
    }

    /// Re-open a previously probed device. The exact descriptor is tried
    /// first; if the device came back different, fall back to a full probe.
    pub fn reopen(
        &self,
        descriptor: &CameraDescriptor,
        keep_going: &dyn Fn() -> bool,
    ) -> Result<(CameraDescriptor, Box<dyn VideoDevice>)> {
        let index = match descriptor.device {
            CameraSelector::Usb(index) => index,
            CameraSelector::Integrated => return Err(CameraError::NoDriver),
        };

        if let Some(driver) = self.drivers.iter().find(|d| d.backend() == descriptor.backend) {
            if let Some(mut device) = self.open_with(driver.as_ref(), index) {
                if accepts(device.as_mut(), descriptor.mode()) {
                    return Ok((*descriptor, device));
                }
                device.release();
            }
        }

        debug!("camera {index}: {descriptor} did not come back, re-probing");
        self.probe_open(index, keep_going)
    }

    /// Probe indices `0..count` in order and list the ones that work.
    pub fn inventory(&self, count: u32) -> Vec<CameraDescriptor> {
        info!("scanning {count} camera indices");
        let found: Vec<_> = (0..count)
            .filter_map(|index| match self.probe(index) {
                Ok(descriptor) => Some(descriptor),
                Err(err) => {
                    debug!("camera {index}: {err}");
                    None
                }
            })
            .collect();
        info!("{} working camera(s) found", found.len());
        found
    }

    fn open_with(&self, driver: &dyn DeviceDriver, index: u32) -> Option<Box<dyn VideoDevice>> {
        let backend = driver.backend();
        match driver.open(index) {
            Ok(device) if device.is_opened() => Some(device),
            Ok(mut device) => {
                debug!("camera {index}: {backend} could not open the device");
                device.release();
                None
            }
            Err(err) => {
                debug!("camera {index}: {backend} failed: {err}");
                None
            }
        }
    }
}

/// Request `mode` and check that one test read honours it.
fn accepts(device: &mut dyn VideoDevice, mode: CaptureMode) -> bool {
    if let Err(err) = device.configure(mode) {
        debug!("configure {} failed: {err}", mode.resolution);
        return false;
    }
    match device.read_frame() {
        Ok(frame) => mode.resolution.covered_by(frame.width, frame.height, MIN_COVERAGE),
        Err(err) => {
            debug!("test read at {} failed: {err}", mode.resolution);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PixelFormat, RawImage};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers each requested resolution with a fixed delivered size;
    /// anything not in the table fails the read.
    struct Scripted {
        backend: Backend,
        opens: bool,
        delivers: HashMap<Resolution, (u32, u32)>,
        open_handles: Arc<AtomicUsize>,
    }

    struct ScriptedDevice {
        delivers: HashMap<Resolution, (u32, u32)>,
        mode: Option<CaptureMode>,
        open_handles: Arc<AtomicUsize>,
        open: bool,
    }

    impl DeviceDriver for Scripted {
        fn backend(&self) -> Backend {
            self.backend
        }

        fn open(&self, _index: u32) -> Result<Box<dyn VideoDevice>> {
            if !self.opens {
                return Err(CameraError::Open { device: 0, backend: self.backend });
            }
            self.open_handles.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedDevice {
                delivers: self.delivers.clone(),
                mode: None,
                open_handles: self.open_handles.clone(),
                open: true,
            }))
        }
    }

    impl VideoDevice for ScriptedDevice {
        fn configure(&mut self, mode: CaptureMode) -> Result<()> {
            self.mode = Some(mode);
            Ok(())
        }

        fn read_frame(&mut self) -> Result<RawImage> {
            let requested = self.mode.map(|m| m.resolution).ok_or(CameraError::Disconnected)?;
            let (width, height) = self
                .delivers
                .get(&requested)
                .copied()
                .ok_or_else(|| CameraError::Read("no frame".into()))?;
            Ok(RawImage { width, height, format: PixelFormat::Jpeg, data: vec![0xFF, 0xD8, 0xFF, 0xD9] })
        }

        fn is_opened(&self) -> bool {
            self.open
        }

        fn release(&mut self) {
            if self.open {
                self.open = false;
                self.open_handles.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn driver(
        backend: Backend,
        opens: bool,
        delivers: &[(Resolution, (u32, u32))],
        handles: &Arc<AtomicUsize>,
    ) -> Arc<dyn DeviceDriver> {
        Arc::new(Scripted {
            backend,
            opens,
            delivers: delivers.iter().copied().collect(),
            open_handles: handles.clone(),
        })
    }

    #[test]
    fn picks_highest_rung_that_reads_back_full_size() {
        let handles = Arc::new(AtomicUsize::new(0));
        let prober = Prober::new(vec![driver(
            Backend::Auto,
            true,
            &[
                // clamps 1080p down to 720p: rejected
                (Resolution::FULL_HD, (1280, 720)),
                (Resolution::HD, (1280, 720)),
                (Resolution::VGA, (640, 480)),
            ],
            &handles,
        )]);

        let found = prober.probe(0).unwrap();
        assert_eq!(found.backend, Backend::Auto);
        assert_eq!(found.resolution, Resolution::HD);
        assert_eq!(found.frame_rate, DEFAULT_FRAME_RATE);
        assert_eq!(handles.load(Ordering::SeqCst), 0, "probe must release its handle");
    }

    #[test]
    fn exhausts_ladder_before_next_backend() {
        let handles = Arc::new(AtomicUsize::new(0));
        let prober = Prober::new(vec![
            driver(Backend::Auto, false, &[], &handles),
            driver(Backend::DirectShow, true, &[(Resolution::VGA, (640, 480))], &handles),
            driver(Backend::V4l2, true, &[(Resolution::FULL_HD, (1920, 1080))], &handles),
        ]);

        let found = prober.probe(3).unwrap();
        assert_eq!(found.device, CameraSelector::Usb(3));
        assert_eq!(found.backend, Backend::DirectShow);
        assert_eq!(found.resolution, Resolution::VGA);
    }

    #[test]
    fn nothing_works_is_probe_failure() {
        let handles = Arc::new(AtomicUsize::new(0));
        let prober = Prober::new(vec![
            driver(Backend::Auto, true, &[(Resolution::FULL_HD, (320, 240))], &handles),
            driver(Backend::V4l2, false, &[], &handles),
        ]);

        match prober.probe(1) {
            Err(CameraError::ProbeFailure { device }) => assert_eq!(device, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(handles.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn preferred_backend_goes_first() {
        let handles = Arc::new(AtomicUsize::new(0));
        let all = [(Resolution::HD, (1280, 720))];
        let prober = Prober::new(vec![
            driver(Backend::Auto, true, &all, &handles),
            driver(Backend::V4l2, true, &all, &handles),
        ])
        .prefer(Some(Backend::V4l2));

        assert_eq!(prober.backends(), vec![Backend::V4l2, Backend::Auto]);
        assert_eq!(prober.probe(0).unwrap().backend, Backend::V4l2);
    }

    #[test]
    fn no_drivers_reports_missing_driver() {
        assert!(matches!(Prober::new(Vec::new()).probe(0), Err(CameraError::NoDriver)));
    }

    #[test]
    fn cancelled_probe_gives_up_early() {
        let handles = Arc::new(AtomicUsize::new(0));
        let prober = Prober::new(vec![driver(Backend::Auto, true, &[(Resolution::VGA, (640, 480))], &handles)]);
        assert!(prober.probe_open(0, &|| false).is_err());
        assert_eq!(handles.load(Ordering::SeqCst), 0);
    }
}
