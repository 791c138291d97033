// booth-camera/src/stream.rs
//! Per-viewer MJPEG generator over the shared frame slot.
//!
//! Each viewer gets its own cursor; all of them read the same slot, so
//! adding viewers never adds capture work. A viewer only ever gets frames
//! newer than the last one it was sent, and its stream ends when the
//! session it started on ends.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures_core::Stream;
use log::debug;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::slot::{FrameSlot, SlotClosed, SlotPoll};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// How long a cursor waits before looking at the slot again.
pub const IDLE_INTERVAL: Duration = Duration::from_millis(30);

// back-pressure: slot → channel → HTTP body
const DEPTH: usize = 2;

/// One multipart part carrying a JPEG.
pub fn jpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// Final text part telling the viewer why its stream ended.
pub fn diagnostic_part(message: &str) -> Vec<u8> {
    format!("--{BOUNDARY}\r\nContent-Type: text/plain\r\n\r\nCamera error: {message}\r\n")
        .into_bytes()
}

/// Outcome of one look at the slot.
#[derive(Debug)]
pub enum Step {
    Part(Vec<u8>),
    Idle,
    End,
}

#[derive(Debug)]
pub struct MjpegFrames {
    slot: Arc<FrameSlot>,
    epoch: u64,
    last_sent: u64,
    finished: bool,
    idle: Duration,
}

impl MjpegFrames {
    /// A cursor bound to the slot's current session.
    pub fn new(slot: Arc<FrameSlot>) -> Self {
        let epoch = slot.epoch();
        Self {
            slot,
            epoch,
            last_sent: 0,
            finished: false,
            idle: IDLE_INTERVAL,
        }
    }

    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    pub fn step(&mut self) -> Step {
        if self.finished {
            return Step::End;
        }
        match self.slot.poll(self.epoch, self.last_sent) {
            SlotPoll::Frame(frame) => {
                self.last_sent = frame.sequence;
                Step::Part(jpeg_part(&frame.jpeg))
            }
            SlotPoll::Pending => Step::Idle,
            SlotPoll::Closed(SlotClosed::Stopped) => {
                self.finished = true;
                Step::End
            }
            SlotPoll::Closed(SlotClosed::Failed(message)) => {
                self.finished = true;
                Step::Part(diagnostic_part(&message))
            }
        }
    }
}

/// Blocking form: each `next` waits for a newer frame.
impl Iterator for MjpegFrames {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.step() {
                Step::Part(part) => return Some(part),
                Step::Idle => thread::sleep(self.idle),
                Step::End => return None,
            }
        }
    }
}

/// Async form for HTTP bodies. The pump thread exits when the viewer
/// hangs up or the session ends.
pub fn mjpeg_stream(mut frames: MjpegFrames) -> impl Stream<Item = Vec<u8>> {
    let (tx, rx) = mpsc::channel(DEPTH);

    thread::spawn(move || loop {
        match frames.step() {
            Step::Part(part) => {
                if tx.blocking_send(part).is_err() {
                    debug!("viewer disconnected");
                    break;
                }
            }
            Step::Idle => {
                if tx.is_closed() {
                    debug!("viewer disconnected");
                    break;
                }
                thread::sleep(frames.idle);
            }
            Step::End => break,
        }
    });

    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn jpeg_part_layout() {
        let part = jpeg_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let head = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n";
        assert!(part.starts_with(head));
        assert_eq!(&part[head.len()..], &[0xFF, 0xD8, 0xFF, 0xD9, b'\r', b'\n']);
    }

    #[test]
    fn diagnostic_part_layout() {
        let part = diagnostic_part("libcamera-vid exited");
        assert_eq!(
            part,
            b"--frame\r\nContent-Type: text/plain\r\n\r\nCamera error: libcamera-vid exited\r\n"
        );
    }

    #[test]
    fn cursor_never_repeats_a_frame() {
        let slot = Arc::new(FrameSlot::new());
        let epoch = slot.begin();
        let mut frames = MjpegFrames::new(slot.clone());

        assert!(matches!(frames.step(), Step::Idle));
        slot.publish(epoch, vec![1], 1, 1);
        assert!(matches!(frames.step(), Step::Part(_)));
        assert!(matches!(frames.step(), Step::Idle), "same frame is not resent");

        // two publishes between polls: only the newest goes out
        slot.publish(epoch, vec![2], 1, 1);
        slot.publish(epoch, vec![3], 1, 1);
        match frames.step() {
            Step::Part(part) => assert!(part.ends_with(&[3, b'\r', b'\n'])),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stop_ends_stream_silently() {
        let slot = Arc::new(FrameSlot::new());
        let epoch = slot.begin();
        let frames = MjpegFrames::new(slot.clone()).with_idle(Duration::from_millis(1));
        slot.publish(epoch, vec![7], 1, 1);
        slot.close(epoch, SlotClosed::Stopped);
        let parts: Vec<_> = frames.collect();
        assert_eq!(parts.len(), 1, "pending frame, then end");
    }

    #[test]
    fn new_session_ends_old_cursor() {
        let slot = Arc::new(FrameSlot::new());
        slot.begin();
        let mut frames = MjpegFrames::new(slot.clone());
        slot.begin();
        assert!(matches!(frames.step(), Step::End));
    }

    #[tokio::test]
    async fn failure_ends_with_diagnostic() {
        let slot = Arc::new(FrameSlot::new());
        let epoch = slot.begin();
        let stream = mjpeg_stream(MjpegFrames::new(slot.clone()).with_idle(Duration::from_millis(1)));
        slot.publish(epoch, vec![0xFF, 0xD8, 0xFF, 0xD9], 1, 1);
        slot.close(epoch, SlotClosed::Failed("device lost".into()));

        let parts: Vec<Vec<u8>> = stream.collect().await;
        let last = parts.last().expect("at least the diagnostic part");
        assert!(String::from_utf8_lossy(last).contains("Camera error: device lost"));
        assert!(parts.len() <= 2);
    }
}
