//! Pipeline barrier descriptions.
//!
//! Barriers are plain values recorded through
//! [`CommandBuffer::pipeline_barrier`](crate::command::CommandBuffer::pipeline_barrier).

use ash::vk;

/// Access mask and pipeline stage implied by an image layout.
///
/// Used as either side of a layout transition.
pub fn layout_access(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// Global memory dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl MemoryBarrier {
    pub fn new(src_access: vk::AccessFlags, dst_access: vk::AccessFlags) -> Self {
        Self {
            src_access,
            dst_access,
        }
    }

    pub(crate) fn raw(&self) -> vk::MemoryBarrier<'static> {
        vk::MemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
    }
}

/// Dependency on a buffer range, optionally moving queue ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl BufferBarrier {
    /// Barrier over the whole buffer.
    pub fn whole(buffer: vk::Buffer, src_access: vk::AccessFlags, dst_access: vk::AccessFlags) -> Self {
        Self {
            buffer,
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_access,
            dst_access,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    /// Transfer ownership from `src` to `dst` queue family.
    pub fn with_queue_transfer(mut self, src: u32, dst: u32) -> Self {
        if src != dst {
            self.src_queue_family = src;
            self.dst_queue_family = dst;
        }
        self
    }

    /// Override the access masks.
    pub fn with_access(mut self, src: vk::AccessFlags, dst: vk::AccessFlags) -> Self {
        self.src_access = src;
        self.dst_access = dst;
        self
    }

    pub(crate) fn raw(&self) -> vk::BufferMemoryBarrier<'static> {
        vk::BufferMemoryBarrier::default()
            .buffer(self.buffer)
            .offset(self.offset)
            .size(self.size)
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(self.src_queue_family)
            .dst_queue_family_index(self.dst_queue_family)
    }
}

/// Layout transition of an image subresource range.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub range: vk::ImageSubresourceRange,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

impl ImageBarrier {
    /// Transition `old` to `new` with access masks derived from both layouts.
    pub fn transition(
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        Self {
            image,
            range,
            old_layout,
            new_layout,
            src_access: layout_access(old_layout).0,
            dst_access: layout_access(new_layout).0,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    /// Transfer ownership from `src` to `dst` queue family.
    pub fn with_queue_transfer(mut self, src: u32, dst: u32) -> Self {
        if src != dst {
            self.src_queue_family = src;
            self.dst_queue_family = dst;
        }
        self
    }

    /// Override the access masks.
    pub fn with_access(mut self, src: vk::AccessFlags, dst: vk::AccessFlags) -> Self {
        self.src_access = src;
        self.dst_access = dst;
        self
    }

    /// Stages implied by the old and new layouts.
    pub fn stages(&self) -> (vk::PipelineStageFlags, vk::PipelineStageFlags) {
        (
            layout_access(self.old_layout).1,
            layout_access(self.new_layout).1,
        )
    }

    pub(crate) fn raw(&self) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .image(self.image)
            .subresource_range(self.range)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(self.src_queue_family)
            .dst_queue_family_index(self.dst_queue_family)
    }
}

/// A full `vkCmdPipelineBarrier` call.
#[derive(Debug, Clone, Default)]
pub struct PipelineBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dependency: vk::DependencyFlags,
    pub memory: Vec<MemoryBarrier>,
    pub buffers: Vec<BufferBarrier>,
    pub images: Vec<ImageBarrier>,
}

impl PipelineBarrier {
    pub fn new(src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags) -> Self {
        Self {
            src_stage,
            dst_stage,
            ..Self::default()
        }
    }

    /// Single image transition with stages derived from its layouts.
    pub fn image(barrier: ImageBarrier) -> Self {
        let (src_stage, dst_stage) = barrier.stages();
        Self::new(src_stage, dst_stage).with_image(barrier)
    }

    pub fn with_memory(mut self, barrier: MemoryBarrier) -> Self {
        self.memory.push(barrier);
        self
    }

    pub fn with_buffer(mut self, barrier: BufferBarrier) -> Self {
        self.buffers.push(barrier);
        self
    }

    pub fn with_image(mut self, barrier: ImageBarrier) -> Self {
        self.images.push(barrier);
        self
    }

    /// Whether no barrier of any kind is attached.
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.buffers.is_empty() && self.images.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_range() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1)
    }

    #[test]
    fn upload_transition_masks() {
        let barrier = ImageBarrier::transition(
            vk::Image::null(),
            color_range(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(barrier.src_access, vk::AccessFlags::empty());
        assert_eq!(barrier.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(
            barrier.stages(),
            (
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER
            )
        );
    }

    #[test]
    fn same_family_transfer_is_ignored() {
        let barrier = BufferBarrier::whole(
            vk::Buffer::null(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
        )
        .with_queue_transfer(2, 2);
        assert_eq!(barrier.src_queue_family, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.dst_queue_family, vk::QUEUE_FAMILY_IGNORED);

        let moved = barrier.with_queue_transfer(1, 0);
        assert_eq!((moved.src_queue_family, moved.dst_queue_family), (1, 0));
    }

    #[test]
    fn single_image_barrier_uses_layout_stages() {
        let barrier = PipelineBarrier::image(ImageBarrier::transition(
            vk::Image::null(),
            color_range(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ));
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert!(barrier
            .dst_stage
            .contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert!(!barrier.is_empty());
        assert!(PipelineBarrier::default().is_empty());
    }
}
