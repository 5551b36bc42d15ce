//! Pipeline layouts, their deduplicating manager, and pipeline assembly.

mod compute;
mod graphics;
mod layout;
mod layout_manager;
mod state;

use crate::lifecycle::HardwareResource;
use ash::vk;
use std::sync::Arc;

pub use compute::ComputePipeline;
pub use graphics::GraphicsPipeline;
pub use layout::{PipelineLayout, PipelineLayoutKey, PushConstantRange};
pub use layout_manager::{LayoutManager, SharedCache};
pub use state::{
    blend_attachment_for, opaque_blend_attachment, BlendingMode, ColorBlendState, DepthBias,
    DepthStencilState, GraphicsPipelineState, InputAssemblyState, MultisampleState,
    PipelineAspect, RasterizationState, RenderPassType, StateBlock, TessellationState,
    VertexInputState, ViewportState, LIGHT_PASS_DEPTH_BIAS_CLAMP,
    LIGHT_PASS_DEPTH_BIAS_CONSTANT, LIGHT_PASS_DEPTH_BIAS_SLOPE,
};

/// A created pipeline that can be bound into a command buffer.
pub trait Pipeline: HardwareResource {
    fn handle(&self) -> vk::Pipeline;

    fn bind_point(&self) -> vk::PipelineBindPoint;

    fn layout(&self) -> Option<&Arc<PipelineLayout>>;
}
