//! Frame counting and frame-in-flight bookkeeping.

use crate::SLOT_COUNT;

/// Monotonic count of submitted frames.
///
/// The frame-in-flight slot of a frame is `counter % SLOT_COUNT`, so slots
/// are cycled strictly round-robin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameCounter {
    value: u64,
}

impl FrameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Slot of the frame about to be rendered.
    #[inline]
    pub fn slot(&self) -> usize {
        (self.value % SLOT_COUNT as u64) as usize
    }

    /// Moves to the next frame and returns the new value.
    pub fn advance(&mut self) -> u64 {
        self.value += 1;
        self.value
    }
}

/// Which slot last submitted work targeting each swapchain image.
///
/// A new frame must wait for that slot's fence before it reuses the image,
/// since acquisition order does not follow slot order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImagesInFlight {
    owners: Vec<Option<usize>>,
}

impl ImagesInFlight {
    pub fn new(image_count: usize) -> Self {
        Self {
            owners: vec![None; image_count],
        }
    }

    /// Forgets every owner, e.g. after the swapchain was rebuilt.
    pub fn reset(&mut self, image_count: usize) {
        self.owners.clear();
        self.owners.resize(image_count, None);
    }

    /// Slot whose fence must be waited on before `image` is reused, if it is
    /// not the slot about to use it (that fence has just been waited on).
    pub fn blocking_slot(&self, image: u32, slot: usize) -> Option<usize> {
        self.owners
            .get(image as usize)
            .copied()
            .flatten()
            .filter(|&owner| owner != slot)
    }

    /// Records that `slot` submitted work targeting `image`.
    pub fn claim(&mut self, image: u32, slot: usize) {
        if let Some(owner) = self.owners.get_mut(image as usize) {
            *owner = Some(slot);
        }
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
