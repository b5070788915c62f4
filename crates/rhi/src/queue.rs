//! Queue index allocation.
//!
//! Every queue role asks the [`QueueAllocator`] for a slot. Roles that share
//! a family are spread round-robin over that family's queues, so a device
//! with several graphics queues gets distinct queues for graphics, present
//! and compute while a single-queue device hands out index 0 every time.

use std::collections::BTreeMap;

use ash::vk;

use crate::error::{RhiError, RhiResult};
use crate::physical_device::QueueFamilyIndices;

/// What a queue is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Present,
    Compute,
    Transfer,
}

/// A queue handed out by the allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSlot {
    pub family: u32,
    pub index: u32,
}

/// Round-robin queue index allocator, one counter per family.
#[derive(Debug, Clone)]
pub struct QueueAllocator {
    families: QueueFamilyIndices,
    queue_counts: Vec<u32>,
    counters: BTreeMap<u32, u32>,
}

impl QueueAllocator {
    /// `queue_counts[f]` is the number of queues family `f` exposes.
    pub fn new(families: QueueFamilyIndices, queue_counts: Vec<u32>) -> Self {
        Self {
            families,
            queue_counts,
            counters: BTreeMap::new(),
        }
    }

    fn family_of(&self, role: QueueRole) -> Option<u32> {
        match role {
            QueueRole::Graphics => self.families.graphics_family,
            QueueRole::Present => self.families.present_family,
            QueueRole::Compute => self.families.compute_family,
            QueueRole::Transfer => self.families.transfer_family,
        }
    }

    /// Hands out the next queue of the family serving `role`.
    pub fn next(&mut self, role: QueueRole) -> RhiResult<QueueSlot> {
        let family = self
            .family_of(role)
            .ok_or_else(|| RhiError::InvalidHandle(format!("no queue family for {role:?}")))?;
        let count = self
            .queue_counts
            .get(family as usize)
            .copied()
            .filter(|&c| c > 0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("family {family} has no queues")))?;

        let counter = self.counters.entry(family).or_insert(0);
        let index = *counter % count;
        *counter += 1;
        Ok(QueueSlot { family, index })
    }

    /// Number of queues to create per family so that every slot handed out
    /// so far exists.
    pub fn required_queues(&self) -> Vec<(u32, u32)> {
        self.counters
            .iter()
            .map(|(&family, &handed_out)| {
                let available = self.queue_counts[family as usize];
                (family, handed_out.min(available))
            })
            .collect()
    }

    /// Builds `VkDeviceQueueCreateInfo`s for [`required_queues`](Self::required_queues).
    /// `priorities` must hold at least as many entries as the largest family
    /// request.
    pub fn create_infos<'a>(&self, priorities: &'a [f32]) -> Vec<vk::DeviceQueueCreateInfo<'a>> {
        self.required_queues()
            .into_iter()
            .map(|(family, count)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities[..count as usize])
            })
            .collect()
    }
}
