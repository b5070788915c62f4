//! Resource state transitions.
//!
//! Every barrier the renderer records is looked up in a [`BarrierTable`]
//! keyed by an ordered pair of [`ResourceState`]s. The table is written out
//! explicitly, checked against the states' own access/stage/layout triples
//! when it is built, and a pair that is not listed is an error instead of a
//! silent full-pipeline barrier.

use std::collections::HashMap;

use ash::vk;
use tracing::debug;

use crate::command::CommandBuffer;
use crate::error::{RhiError, RhiResult};
use crate::image::COLOR_RANGE;

/// How a resource is being used at a point in the command stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Contents discarded.
    Undefined,
    /// Written by the ray generation stage.
    RayTraceWrite,
    /// Read by the ray generation stage (history reservoirs).
    RayTraceRead,
    /// Sampled by the ray tracing stages (diffuse textures).
    ShaderSampled,
    /// Read by a compute pass.
    ComputeRead,
    /// Written by a compute pass.
    ComputeWrite,
    /// Read and written by the same compute pass (accumulator).
    ComputeReadWrite,
    TransferSrc,
    TransferDst,
    PresentSrc,
    /// Read back on the host after a fence wait.
    HostRead,
}

impl ResourceState {
    /// Access mask of this state.
    pub fn access(self) -> vk::AccessFlags {
        use vk::AccessFlags as A;
        match self {
            ResourceState::Undefined | ResourceState::PresentSrc => A::empty(),
            ResourceState::RayTraceWrite | ResourceState::ComputeWrite => A::SHADER_WRITE,
            ResourceState::RayTraceRead
            | ResourceState::ComputeRead
            | ResourceState::ShaderSampled => A::SHADER_READ,
            ResourceState::ComputeReadWrite => A::SHADER_READ | A::SHADER_WRITE,
            ResourceState::TransferSrc => A::TRANSFER_READ,
            ResourceState::TransferDst => A::TRANSFER_WRITE,
            ResourceState::HostRead => A::HOST_READ,
        }
    }

    /// Pipeline stage of this state.
    pub fn stage(self) -> vk::PipelineStageFlags {
        use vk::PipelineStageFlags as S;
        match self {
            ResourceState::Undefined => S::TOP_OF_PIPE,
            ResourceState::RayTraceWrite
            | ResourceState::RayTraceRead
            | ResourceState::ShaderSampled => S::RAY_TRACING_SHADER_KHR,
            ResourceState::ComputeRead
            | ResourceState::ComputeWrite
            | ResourceState::ComputeReadWrite => S::COMPUTE_SHADER,
            ResourceState::TransferSrc | ResourceState::TransferDst => S::TRANSFER,
            ResourceState::PresentSrc => S::BOTTOM_OF_PIPE,
            ResourceState::HostRead => S::HOST,
        }
    }

    /// Image layout of this state. Buffers ignore it.
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            ResourceState::Undefined => vk::ImageLayout::UNDEFINED,
            ResourceState::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ResourceState::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ResourceState::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
            ResourceState::ShaderSampled => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ResourceState::RayTraceWrite
            | ResourceState::RayTraceRead
            | ResourceState::ComputeRead
            | ResourceState::ComputeWrite
            | ResourceState::ComputeReadWrite
            | ResourceState::HostRead => vk::ImageLayout::GENERAL,
        }
    }
}

/// Masks and layouts of one ordered state pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: ResourceState,
    pub to: ResourceState,
    pub src_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

impl Transition {
    /// Image barrier over the full color range of `image`.
    pub fn image_barrier(&self, image: vk::Image) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(COLOR_RANGE)
    }

    /// Global memory barrier, used for buffers.
    pub fn memory_barrier(&self) -> vk::MemoryBarrier<'static> {
        vk::MemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
    }
}

use vk::AccessFlags as A;
use vk::ImageLayout as L;
use vk::PipelineStageFlags as S;
use ResourceState as R;

const RT: S = S::RAY_TRACING_SHADER_KHR;
const CS: S = S::COMPUTE_SHADER;
const RW: A = A::from_raw(A::SHADER_READ.as_raw() | A::SHADER_WRITE.as_raw());

macro_rules! entry {
    ($from:expr => $to:expr,
     $sa:expr, $ss:expr => $da:expr, $ds:expr,
     $ol:expr => $nl:expr) => {
        Transition {
            from: $from,
            to: $to,
            src_access: $sa,
            src_stage: $ss,
            dst_access: $da,
            dst_stage: $ds,
            old_layout: $ol,
            new_layout: $nl,
        }
    };
}

/// Every transition the frame recordings use.
const STANDARD_TRANSITIONS: [Transition; 18] = [
    // setup: discard, clear, hand to first user
    entry!(R::Undefined => R::TransferDst, A::empty(), S::TOP_OF_PIPE => A::TRANSFER_WRITE, S::TRANSFER, L::UNDEFINED => L::TRANSFER_DST_OPTIMAL),
    entry!(R::TransferDst => R::ComputeRead, A::TRANSFER_WRITE, S::TRANSFER => A::SHADER_READ, CS, L::TRANSFER_DST_OPTIMAL => L::GENERAL),
    entry!(R::TransferDst => R::ComputeWrite, A::TRANSFER_WRITE, S::TRANSFER => A::SHADER_WRITE, CS, L::TRANSFER_DST_OPTIMAL => L::GENERAL),
    entry!(R::TransferDst => R::ComputeReadWrite, A::TRANSFER_WRITE, S::TRANSFER => RW, CS, L::TRANSFER_DST_OPTIMAL => L::GENERAL),
    entry!(R::TransferDst => R::RayTraceWrite, A::TRANSFER_WRITE, S::TRANSFER => A::SHADER_WRITE, RT, L::TRANSFER_DST_OPTIMAL => L::GENERAL),
    // texture upload
    entry!(R::TransferDst => R::ShaderSampled, A::TRANSFER_WRITE, S::TRANSFER => A::SHADER_READ, RT, L::TRANSFER_DST_OPTIMAL => L::SHADER_READ_ONLY_OPTIMAL),
    // presentation and readback
    entry!(R::TransferDst => R::PresentSrc, A::TRANSFER_WRITE, S::TRANSFER => A::empty(), S::BOTTOM_OF_PIPE, L::TRANSFER_DST_OPTIMAL => L::PRESENT_SRC_KHR),
    entry!(R::TransferDst => R::HostRead, A::TRANSFER_WRITE, S::TRANSFER => A::HOST_READ, S::HOST, L::TRANSFER_DST_OPTIMAL => L::GENERAL),
    // generate -> spatial reuse / accumulate / copy-out
    entry!(R::RayTraceWrite => R::ComputeRead, A::SHADER_WRITE, RT => A::SHADER_READ, CS, L::GENERAL => L::GENERAL),
    entry!(R::RayTraceWrite => R::ComputeReadWrite, A::SHADER_WRITE, RT => RW, CS, L::GENERAL => L::GENERAL),
    entry!(R::RayTraceWrite => R::TransferSrc, A::SHADER_WRITE, RT => A::TRANSFER_READ, S::TRANSFER, L::GENERAL => L::TRANSFER_SRC_OPTIMAL),
    entry!(R::RayTraceRead => R::ComputeWrite, A::SHADER_READ, RT => A::SHADER_WRITE, CS, L::GENERAL => L::GENERAL),
    // spatial reuse -> next frame's generate
    entry!(R::ComputeRead => R::RayTraceWrite, A::SHADER_READ, CS => A::SHADER_WRITE, RT, L::GENERAL => L::GENERAL),
    entry!(R::ComputeRead => R::TransferSrc, A::SHADER_READ, CS => A::TRANSFER_READ, S::TRANSFER, L::GENERAL => L::TRANSFER_SRC_OPTIMAL),
    entry!(R::ComputeWrite => R::RayTraceRead, A::SHADER_WRITE, CS => A::SHADER_READ, RT, L::GENERAL => L::GENERAL),
    // accumulator
    entry!(R::ComputeReadWrite => R::ComputeReadWrite, RW, CS => RW, CS, L::GENERAL => L::GENERAL),
    entry!(R::ComputeReadWrite => R::TransferSrc, RW, CS => A::TRANSFER_READ, S::TRANSFER, L::GENERAL => L::TRANSFER_SRC_OPTIMAL),
    // render target back to the ray generation stage after copy-out
    entry!(R::TransferSrc => R::RayTraceWrite, A::TRANSFER_READ, S::TRANSFER => A::SHADER_WRITE, RT, L::TRANSFER_SRC_OPTIMAL => L::GENERAL),
];

/// Lookup table of permitted transitions.
#[derive(Debug, Clone)]
pub struct BarrierTable {
    entries: HashMap<(ResourceState, ResourceState), Transition>,
}

impl BarrierTable {
    /// Builds a table from explicit entries. Duplicate pairs are rejected.
    pub fn from_entries(transitions: &[Transition]) -> RhiResult<Self> {
        let mut entries = HashMap::with_capacity(transitions.len());
        for t in transitions {
            if entries.insert((t.from, t.to), *t).is_some() {
                return Err(RhiError::BarrierError(format!(
                    "duplicate transition {:?} -> {:?}",
                    t.from, t.to
                )));
            }
        }
        Ok(Self { entries })
    }

    /// The renderer's transition table, validated in debug builds.
    pub fn standard() -> RhiResult<Self> {
        let table = Self::from_entries(&STANDARD_TRANSITIONS)?;
        if cfg!(debug_assertions) {
            table.validate()?;
            debug!("Barrier table validated: {} transitions", table.len());
        }
        Ok(table)
    }

    /// Checks every entry against its states: masks, stages and layouts must
    /// match, and no destination stage may be empty.
    pub fn validate(&self) -> RhiResult<()> {
        for t in self.entries.values() {
            let expected = (
                t.from.access(),
                t.from.stage(),
                t.to.access(),
                t.to.stage(),
                t.from.layout(),
                t.to.layout(),
            );
            let actual = (
                t.src_access,
                t.src_stage,
                t.dst_access,
                t.dst_stage,
                t.old_layout,
                t.new_layout,
            );
            if expected != actual {
                return Err(RhiError::BarrierError(format!(
                    "{:?} -> {:?} disagrees with its states: {:?} vs {:?}",
                    t.from, t.to, actual, expected
                )));
            }
            if t.dst_stage.is_empty() || t.src_stage.is_empty() {
                return Err(RhiError::BarrierError(format!(
                    "{:?} -> {:?} has an empty stage mask",
                    t.from, t.to
                )));
            }
            if t.to == ResourceState::Undefined {
                return Err(RhiError::BarrierError(format!(
                    "{:?} -> Undefined discards contents",
                    t.from
                )));
            }
        }
        Ok(())
    }

    /// Looks up a transition. Unknown pairs fail.
    pub fn lookup(&self, from: ResourceState, to: ResourceState) -> RhiResult<&Transition> {
        self.entries.get(&(from, to)).ok_or_else(|| {
            RhiError::BarrierError(format!("no transition from {from:?} to {to:?}"))
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records one pipeline barrier moving every image in `images` from
    /// `from` to `to`.
    pub fn transition_images(
        &self,
        cmd: &CommandBuffer,
        from: ResourceState,
        to: ResourceState,
        images: &[vk::Image],
    ) -> RhiResult<()> {
        let t = self.lookup(from, to)?;
        let barriers: Vec<vk::ImageMemoryBarrier> =
            images.iter().map(|&image| t.image_barrier(image)).collect();
        cmd.pipeline_barrier(t.src_stage, t.dst_stage, &[], &barriers);
        Ok(())
    }

    /// Records a global memory barrier for a buffer transition.
    pub fn transition_memory(
        &self,
        cmd: &CommandBuffer,
        from: ResourceState,
        to: ResourceState,
    ) -> RhiResult<()> {
        let t = self.lookup(from, to)?;
        cmd.pipeline_barrier(t.src_stage, t.dst_stage, &[t.memory_barrier()], &[]);
        Ok(())
    }
}
