//! Resize notifications from the window to the frame loop.
//!
//! The window side holds a [`ResizeSender`]; the frame orchestrator owns the
//! [`ResizeEvents`] receiver and drains it once per loop iteration.

use std::sync::mpsc::{self, Receiver, Sender};

use tracing::trace;

/// Sending half, cheap to clone.
#[derive(Clone, Debug)]
pub struct ResizeSender {
    tx: Sender<(u32, u32)>,
}

impl ResizeSender {
    /// Queues a new framebuffer size. Returns `false` once the receiver is gone.
    pub fn notify(&self, width: u32, height: u32) -> bool {
        trace!("Resize event queued: {}x{}", width, height);
        self.tx.send((width, height)).is_ok()
    }
}

/// Receiving half polled by the frame loop.
#[derive(Debug)]
pub struct ResizeEvents {
    rx: Receiver<(u32, u32)>,
}

impl ResizeEvents {
    pub fn channel() -> (ResizeSender, ResizeEvents) {
        let (tx, rx) = mpsc::channel();
        (ResizeSender { tx }, ResizeEvents { rx })
    }

    /// Drains every pending event and returns the latest non-zero size.
    ///
    /// Zero-area sizes (a minimised window) are skipped.
    pub fn latest(&self) -> Option<(u32, u32)> {
        self.rx
            .try_iter()
            .filter(|&(w, h)| w > 0 && h > 0)
            .last()
    }
}
