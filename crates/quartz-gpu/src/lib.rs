//! GPU resource lifecycle and pipeline construction for the Quartz renderer.
//!
//! This crate provides:
//! - Device bring-up with queue selection and capability detection
//! - A two-phase create/destroy contract for every device-bound resource
//! - Buffers, images and samplers backed by gpu-allocator
//! - Bounded staging and queue ownership transfers for uploads
//! - Descriptor layouts, pools and sets
//! - Deduplicated pipeline layouts and validated pipeline assembly
//! - Command recording, submission and synchronization

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod image;
pub mod instance;
pub mod lifecycle;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod render_pass;
pub mod sampler;
pub mod shader_module;
pub mod sync;
pub mod transfer;

pub use buffer::{Buffer, BufferDesc, MappedRange};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{CommandBuffer, CommandBufferState, CommandPool};
pub use descriptors::{
    DescriptorBinding, DescriptorPool, DescriptorPoolDesc, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutDesc,
};
pub use device::{Device, DeviceBuilder, QueueFamilies};
pub use error::{GpuError, Result};
pub use image::{Image, ImageDesc, ImagePayload, ImageView, ImageViewDesc};
pub use lifecycle::{HardwareResource, Lifecycle, LifecycleState};
pub use memory::{DeviceMemory, MemoryAllocator};
pub use pipeline::{
    ComputePipeline, GraphicsPipeline, GraphicsPipelineState, LayoutManager, Pipeline,
    PipelineLayout, PushConstantRange, RenderPassType,
};
pub use queue::{Queue, QueueKind, SemaphoreWait, SubmitBatch};
pub use render_pass::{AttachmentDesc, Framebuffer, RenderPass, RenderPassDesc};
pub use sampler::{Sampler, SamplerDesc};
pub use shader_module::{spirv_words, ShaderModule, ShaderStage, SPIRV_MAGIC};
pub use sync::{Event, Fence, FenceStatus, PipelineBarrier, Semaphore, WAIT_FOREVER};
pub use transfer::{StagingBuffer, TransferConfig, TransferManager};

pub use ash;
pub use ash::vk;
