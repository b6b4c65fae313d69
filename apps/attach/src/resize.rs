use attach_proto::GridSize;
use std::time::{Duration, Instant};

/// One display frame at 60 Hz.
pub const RESIZE_FRAME: Duration = Duration::from_millis(16);

/// Batches resize notifications so a drag produces one `resize` frame per
/// display frame, carrying the newest size.
#[derive(Debug, Clone)]
pub struct ResizeCoalescer {
    frame: Duration,
    pending: Option<GridSize>,
    deadline: Option<Instant>,
}

impl Default for ResizeCoalescer {
    fn default() -> Self {
        Self::new(RESIZE_FRAME)
    }
}

impl ResizeCoalescer {
    pub fn new(frame: Duration) -> Self {
        Self {
            frame,
            pending: None,
            deadline: None,
        }
    }

    /// Records a size. The first notification of a batch starts the frame
    /// timer; later ones only replace the pending size.
    pub fn notify(&mut self, size: GridSize, now: Instant) {
        if !size.is_known() {
            return;
        }
        self.pending = Some(size);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.frame);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Releases the batch once its frame has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<GridSize> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.pending.take()
            }
            _ => None,
        }
    }
}
