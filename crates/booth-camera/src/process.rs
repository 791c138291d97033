//! Integrated-sensor source: `libcamera-vid` writing MJPEG to stdout.
//!
//! The child's stdout is an undelimited run of JPEGs, so every read goes
//! through a [`FrameExtractor`]. When the process goes away the session is
//! over; restarting it is the manager's call.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    extract::DEFAULT_MAX_BUFFER, AbortHandle, Backend, CameraDescriptor, CameraError,
    CameraSelector, FrameExtractor, FrameSource, PixelFormat, RawImage, Resolution, Result,
    RunFlag,
};

const READ_CHUNK: usize = 4096;
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How to launch the sensor's capture process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorCommand {
    pub program: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Used verbatim instead of the generated `libcamera-vid` arguments.
    pub args: Option<Vec<String>>,
}

impl Default for SensorCommand {
    fn default() -> Self {
        Self {
            program: "libcamera-vid".into(),
            width: 1280,
            height: 720,
            framerate: 15,
            args: None,
        }
    }
}

impl SensorCommand {
    pub fn arguments(&self) -> Vec<String> {
        if let Some(args) = &self.args {
            return args.clone();
        }
        vec![
            "--codec".into(),
            "mjpeg".into(),
            "--width".into(),
            self.width.to_string(),
            "--height".into(),
            self.height.to_string(),
            "--framerate".into(),
            self.framerate.to_string(),
            "--timeout".into(),
            "0".into(),
            "--output".into(),
            "-".into(),
            "--inline".into(),
            "--flush".into(),
            "--nopreview".into(),
        ]
    }

    pub fn descriptor(&self) -> CameraDescriptor {
        CameraDescriptor {
            device: CameraSelector::Integrated,
            backend: Backend::Subprocess,
            resolution: Resolution::new(self.width, self.height),
            frame_rate: self.framerate,
        }
    }
}

pub struct ProcessSource {
    command: SensorCommand,
    extractor: FrameExtractor,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    ready: VecDeque<Vec<u8>>,
    /// 0 while no child is running.
    pid: Arc<AtomicU32>,
}

impl ProcessSource {
    pub fn new(command: SensorCommand) -> Self {
        Self::with_max_buffer(command, DEFAULT_MAX_BUFFER)
    }

    pub fn with_max_buffer(command: SensorCommand, max_buffer: usize) -> Self {
        Self {
            command,
            extractor: FrameExtractor::new(max_buffer),
            child: None,
            stdout: None,
            ready: VecDeque::new(),
            pid: Arc::new(AtomicU32::new(0)),
        }
    }

    fn exit_error(&mut self, err: Option<io::Error>) -> CameraError {
        self.stdout = None;
        let program = &self.command.program;
        let status = self.child.as_mut().and_then(|c| c.try_wait().ok().flatten());
        let detail = match (status, err) {
            (_, Some(err)) => format!("reading from {program} failed: {err}"),
            (Some(status), None) => format!("{program} exited ({status})"),
            (None, None) => format!("{program} closed its output"),
        };
        CameraError::ProcessExit(detail)
    }
}

impl FrameSource for ProcessSource {
    fn name(&self) -> String {
        self.command.program.clone()
    }

    fn open(&mut self, _run: &RunFlag) -> Result<CameraDescriptor> {
        self.close();
        self.extractor.reset();
        self.ready.clear();

        let args = self.command.arguments();
        info!("spawning {} {}", self.command.program, args.join(" "));
        let mut child = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CameraError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            drain_stderr(stderr, self.command.program.clone());
        }
        self.stdout = child.stdout.take();
        self.pid.store(child.id(), Ordering::SeqCst);
        self.child = Some(child);
        Ok(self.command.descriptor())
    }

    fn read_frame(&mut self) -> Result<RawImage> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(jpeg) = self.ready.pop_front() {
                return Ok(RawImage {
                    width: self.command.width,
                    height: self.command.height,
                    format: PixelFormat::Jpeg,
                    data: jpeg,
                });
            }

            let stdout = self.stdout.as_mut().ok_or(CameraError::Disconnected)?;
            let n = match stdout.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.exit_error(Some(err))),
            };
            if n == 0 {
                return Err(self.exit_error(None));
            }
            self.ready.extend(self.extractor.feed(&chunk[..n]));
        }
    }

    fn is_open(&self) -> bool {
        self.stdout.is_some()
    }

    fn close(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            terminate(&mut child, &self.command.program);
        }
        self.pid.store(0, Ordering::SeqCst);
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let pid = self.pid.clone();
        Some(AbortHandle::new(move || {
            let pid = pid.load(Ordering::SeqCst);
            if pid != 0 {
                kill_now(pid);
            }
        }))
    }
}

impl Drop for ProcessSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// SIGTERM, a grace period, then SIGKILL.
fn terminate(child: &mut Child, program: &str) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    // SAFETY: kill(2) on a pid we spawned and have not reaped yet.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = child.kill();

    let deadline = Instant::now() + TERMINATE_GRACE;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("{program} exited ({status})");
                return;
            }
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(_) => break,
        }
    }

    warn!("{program} ignored SIGTERM, killing it");
    let _ = child.kill();
    let _ = child.wait();
}

fn kill_now(pid: u32) {
    #[cfg(unix)]
    // SAFETY: plain kill(2); a stale pid at worst signals nothing we own.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// A full stderr pipe would stall the child, so keep it drained.
fn drain_stderr(stderr: ChildStderr, program: String) {
    let spawned = thread::Builder::new()
        .name("sensor-stderr".into())
        .spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                debug!("{program}: {line}");
            }
        });
    if let Err(err) = spawned {
        warn!("could not start stderr reader: {err}");
    }
}
