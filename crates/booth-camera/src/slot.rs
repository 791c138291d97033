//! Latest-wins frame slot shared between the capture worker and readers.
//!
//! One mutex-guarded cell: the worker overwrites it, any number of viewers
//! and the snapshot route copy it out. There is no queue, so a slow reader
//! skips frames instead of falling behind.
//!
//! Each capture session gets an *epoch*. Publishes carrying a stale epoch
//! are ignored (a worker that outlived its stop timeout cannot clobber the
//! next session), and stream cursors end when the epoch they started on is
//! over.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use crate::{CameraError, Result};

/// One published JPEG. Cloning shares the bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub jpeg: Arc<[u8]>,
    /// Strictly increasing across the slot's lifetime, never reset.
    pub sequence: u64,
    pub captured_at: SystemTime,
    pub width: u32,
    pub height: u32,
}

/// Why the current epoch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotClosed {
    Stopped,
    Failed(String),
}

/// What a cursor sees when it polls the slot.
#[derive(Debug, Clone)]
pub enum SlotPoll {
    /// A frame newer than the one the cursor last saw.
    Frame(Frame),
    /// Nothing new yet.
    Pending,
    /// The epoch is over.
    Closed(SlotClosed),
}

#[derive(Debug, Default)]
struct Inner {
    frame: Option<Frame>,
    last_sequence: u64,
    epoch: u64,
    closed: Option<SlotClosed>,
}

#[derive(Debug)]
pub struct FrameSlot {
    inner: Mutex<Inner>,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    /// A slot with no frame whose epoch 0 is already closed: nothing is
    /// streaming until a session opens one.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                closed: Some(SlotClosed::Stopped),
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // every write leaves Inner consistent, so a poisoned guard is usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new epoch: drop the old frame and reopen. Returns the epoch.
    pub fn begin(&self) -> u64 {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.frame = None;
        inner.closed = None;
        inner.epoch
    }

    /// End `epoch`. A later epoch is left alone.
    pub fn close(&self, epoch: u64, reason: SlotClosed) {
        let mut inner = self.lock();
        if inner.epoch == epoch && inner.closed.is_none() {
            inner.closed = Some(reason);
        }
    }

    /// Overwrite the slot. Returns the new sequence number, or `None` when
    /// `epoch` is no longer current.
    pub fn publish(&self, epoch: u64, jpeg: Vec<u8>, width: u32, height: u32) -> Option<u64> {
        let mut inner = self.lock();
        if inner.epoch != epoch || inner.closed.is_some() {
            return None;
        }
        inner.last_sequence += 1;
        let sequence = inner.last_sequence;
        inner.frame = Some(Frame {
            jpeg: jpeg.into(),
            sequence,
            captured_at: SystemTime::now(),
            width,
            height,
        });
        Some(sequence)
    }

    /// The latest frame, if any has been captured this epoch.
    pub fn read(&self) -> Option<Frame> {
        self.lock().frame.clone()
    }

    /// Like [`read`](Self::read) but "no frame yet" is an explicit error.
    pub fn snapshot(&self) -> Result<Frame> {
        self.read().ok_or(CameraError::NoFrame)
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn closed(&self) -> Option<SlotClosed> {
        self.lock().closed.clone()
    }

    /// Frame newer than `after` in `epoch`, or why there is none.
    pub fn poll(&self, epoch: u64, after: u64) -> SlotPoll {
        let inner = self.lock();
        if inner.epoch != epoch {
            return SlotPoll::Closed(SlotClosed::Stopped);
        }
        match &inner.frame {
            Some(frame) if frame.sequence > after => SlotPoll::Frame(frame.clone()),
            _ => match &inner.closed {
                Some(reason) => SlotPoll::Closed(reason.clone()),
                None => SlotPoll::Pending,
            },
        }
    }
}
