use super::layout::PipelineLayout;
use super::state::{GraphicsPipelineState, StateBlock, ViewportState};
use super::Pipeline;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::lifecycle::{HardwareResource, Lifecycle};
use crate::render_pass::RenderPass;
use crate::shader_module::{ShaderModule, ShaderStage};
use ash::vk;
use std::sync::Arc;

/// Graphics pipeline assembled from shader stages and fixed-function state.
///
/// Stages and state are collected first, then [`GraphicsPipeline::finalize`]
/// validates that every aspect is decided and creates the pipeline against
/// a render pass and layout.
pub struct GraphicsPipeline {
    device: Arc<Device>,
    stages: Vec<Arc<ShaderModule>>,
    state: GraphicsPipelineState,
    render_pass: Option<Arc<RenderPass>>,
    subpass: u32,
    layout: Option<Arc<PipelineLayout>>,
    uses_tessellation: bool,
    handle: vk::Pipeline,
    lifecycle: Lifecycle,
}

impl GraphicsPipeline {
    pub fn new(device: Arc<Device>, identifier: impl Into<String>) -> Self {
        Self {
            device,
            stages: Vec::new(),
            state: GraphicsPipelineState::new(),
            render_pass: None,
            subpass: 0,
            layout: None,
            uses_tessellation: false,
            handle: vk::Pipeline::null(),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn state(&self) -> &GraphicsPipelineState {
        &self.state
    }

    /// Fixed-function state; changes apply on the next creation.
    pub fn state_mut(&mut self) -> &mut GraphicsPipelineState {
        &mut self.state
    }

    /// Add a stage. A stage of the same kind replaces the previous one.
    pub fn add_shader_stage(&mut self, module: Arc<ShaderModule>) -> &mut Self {
        self.stages.retain(|existing| existing.stage() != module.stage());
        self.stages.push(module);
        self
    }

    pub fn shader_stages(&self) -> impl Iterator<Item = ShaderStage> + '_ {
        self.stages.iter().map(|module| module.stage())
    }

    pub fn with_subpass(mut self, subpass: u32) -> Self {
        self.subpass = subpass;
        self
    }

    pub fn render_pass(&self) -> Option<&Arc<RenderPass>> {
        self.render_pass.as_ref()
    }

    pub fn layout(&self) -> Option<&Arc<PipelineLayout>> {
        self.layout.as_ref()
    }

    /// Validate the collected state and create the pipeline.
    pub fn finalize(
        &mut self,
        render_pass: Arc<RenderPass>,
        layout: Arc<PipelineLayout>,
        uses_tessellation: bool,
    ) -> Result<()> {
        self.render_pass = Some(render_pass);
        self.layout = Some(layout);
        self.uses_tessellation = uses_tessellation;
        self.create_on_hardware()
    }

    /// Rebuild with a viewport covering `extent`, after a resize.
    ///
    /// A dynamic viewport is left alone; only the pipeline is recreated.
    pub fn recreate_with_extent(&mut self, extent: vk::Extent2D) -> Result<()> {
        if let Some(StateBlock::Static(viewport)) = self.state.viewport.as_mut() {
            *viewport = ViewportState::covering(extent);
        }
        self.recreate()
    }

    /// Check the pipeline can be created without touching the device.
    pub fn validate(&self) -> Result<()> {
        let stages: Vec<ShaderStage> = self.shader_stages().collect();
        self.state
            .validate(self.lifecycle.identifier(), &stages, self.uses_tessellation)?;

        if self.render_pass.is_none() {
            return Err(self.missing("render pass"));
        }
        if self.layout.is_none() {
            return Err(self.missing("pipeline layout"));
        }
        Ok(())
    }

    fn missing(&self, aspect: &'static str) -> GpuError {
        GpuError::MissingState {
            pipeline: self.lifecycle.identifier().to_string(),
            aspect,
        }
    }
}

impl Pipeline for GraphicsPipeline {
    fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::GRAPHICS
    }

    fn layout(&self) -> Option<&Arc<PipelineLayout>> {
        self.layout.as_ref()
    }
}

impl HardwareResource for GraphicsPipeline {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.validate().inspect_err(|e| {
            tracing::error!(pipeline = %self.lifecycle.identifier(), "Refusing to create pipeline: {e}");
        })?;
        self.device.ensure_usable()?;

        let (Some(render_pass), Some(layout)) = (&self.render_pass, &self.layout) else {
            return Err(self.missing("render pass"));
        };
        render_pass.lifecycle().ensure_created()?;
        layout.lifecycle().ensure_created()?;
        for module in &self.stages {
            module.lifecycle().ensure_created()?;
        }

        let state = &self.state;
        let stages: Vec<_> = self.stages.iter().map(|module| module.stage_info()).collect();

        let vertex_input_static = state
            .vertex_input
            .as_ref()
            .and_then(StateBlock::as_static)
            .cloned()
            .unwrap_or_default();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_input_static.bindings)
            .vertex_attribute_descriptions(&vertex_input_static.attributes);

        let assembly = state
            .input_assembly
            .as_ref()
            .and_then(StateBlock::as_static)
            .copied()
            .unwrap_or_default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(assembly.topology)
            .primitive_restart_enable(assembly.primitive_restart);

        let patch_control_points = state
            .tessellation
            .as_ref()
            .and_then(StateBlock::as_static)
            .map_or(1, |tessellation| tessellation.patch_control_points);
        let tessellation =
            vk::PipelineTessellationStateCreateInfo::default().patch_control_points(patch_control_points);

        let viewport_static = state
            .viewport
            .as_ref()
            .and_then(StateBlock::as_static)
            .cloned()
            .unwrap_or_default();
        let dynamic_states = state.dynamic_states();
        let (viewport_count, scissor_count) = viewport_counts(&viewport_static, &dynamic_states);
        let mut viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewport_static.viewports)
            .scissors(&viewport_static.scissors);
        viewport.viewport_count = viewport_count;
        viewport.scissor_count = scissor_count;
        let raster = state
            .rasterization
            .as_ref()
            .and_then(StateBlock::as_static)
            .copied()
            .unwrap_or_default();
        let bias = raster.depth_bias.unwrap_or(super::state::DepthBias {
            constant: 0.0,
            slope: 0.0,
            clamp: 0.0,
        });
        let bias_enabled =
            raster.depth_bias.is_some() || dynamic_states.contains(&vk::DynamicState::DEPTH_BIAS);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(raster.depth_clamp)
            .rasterizer_discard_enable(false)
            .polygon_mode(raster.polygon_mode)
            .cull_mode(raster.cull_mode)
            .front_face(raster.front_face)
            .line_width(raster.line_width)
            .depth_bias_enable(bias_enabled)
            .depth_bias_constant_factor(bias.constant)
            .depth_bias_slope_factor(bias.slope)
            .depth_bias_clamp(bias.clamp);

        let samples = state
            .multisample
            .as_ref()
            .and_then(StateBlock::as_static)
            .copied()
            .unwrap_or_default();
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(samples.samples)
            .sample_shading_enable(false);

        let depth = state
            .depth_stencil
            .as_ref()
            .and_then(StateBlock::as_static)
            .copied()
            .unwrap_or_default();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth.depth_test)
            .depth_write_enable(depth.depth_write)
            .depth_compare_op(depth.compare_op)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(depth.stencil_test);

        let blend = state.effective_color_blend();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend.attachments)
            .blend_constants(blend.blend_constants);

        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout.handle())
            .render_pass(render_pass.handle())
            .subpass(self.subpass);
        // Fully dynamic vertex input must not be described statically
        if !dynamic_states.contains(&vk::DynamicState::VERTEX_INPUT_EXT) {
            info = info.vertex_input_state(&vertex_input);
        }
        if self.uses_tessellation {
            info = info.tessellation_state(&tessellation);
        }

        let pipelines = unsafe {
            self.device
                .raw()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_pipelines, e)| {
            tracing::error!(pipeline = %self.lifecycle.identifier(), "Unable to create graphics pipeline: {e}");
            match self.device.observe(e.into()) {
                GpuError::Vulkan(result) => {
                    GpuError::PipelineCreation(format!("{}: {result}", self.lifecycle.identifier()))
                }
                other => other,
            }
        })?;

        self.handle = pipelines.first().copied().unwrap_or_default();
        tracing::debug!(
            pipeline = %self.lifecycle.identifier(),
            stages = self.stages.len(),
            dynamic = dynamic_states.len(),
            "Graphics pipeline created"
        );
        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::Pipeline::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            unsafe { self.device.raw().destroy_pipeline(self.handle, None) };
            self.handle = vk::Pipeline::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

/// Viewport and scissor counts for the create info.
///
/// Dynamic rectangles still need a count of at least one, unless the count
/// itself is dynamic, in which case it must be zero.
fn viewport_counts(viewport: &ViewportState, dynamic_states: &[vk::DynamicState]) -> (u32, u32) {
    let count = |len: usize, with_count: vk::DynamicState| {
        if dynamic_states.contains(&with_count) {
            0
        } else {
            (len as u32).max(1)
        }
    };
    (
        count(viewport.viewports.len(), vk::DynamicState::VIEWPORT_WITH_COUNT),
        count(viewport.scissors.len(), vk::DynamicState::SCISSOR_WITH_COUNT),
    )
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy graphics pipeline: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_counts_follow_dynamic_tokens() {
        let empty = ViewportState::default();
        assert_eq!(viewport_counts(&empty, &[]), (1, 1));
        assert_eq!(
            viewport_counts(&empty, &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]),
            (1, 1)
        );
        assert_eq!(
            viewport_counts(
                &empty,
                &[vk::DynamicState::VIEWPORT_WITH_COUNT, vk::DynamicState::SCISSOR_WITH_COUNT]
            ),
            (0, 0)
        );
        assert_eq!(
            viewport_counts(&empty, &[vk::DynamicState::VIEWPORT_WITH_COUNT, vk::DynamicState::SCISSOR]),
            (0, 1)
        );

        let covering = ViewportState::covering(vk::Extent2D {
            width: 640,
            height: 480,
        });
        assert_eq!(viewport_counts(&covering, &[]), (1, 1));
    }
}
