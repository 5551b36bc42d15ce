use super::layout::PipelineLayout;
use super::Pipeline;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::lifecycle::{HardwareResource, Lifecycle};
use crate::shader_module::{ShaderModule, ShaderStage};
use ash::vk;
use std::sync::Arc;

/// Compute pipeline over a single compute shader.
pub struct ComputePipeline {
    device: Arc<Device>,
    shader: Arc<ShaderModule>,
    layout: Arc<PipelineLayout>,
    handle: vk::Pipeline,
    lifecycle: Lifecycle,
}

impl ComputePipeline {
    pub fn new(
        device: Arc<Device>,
        identifier: impl Into<String>,
        shader: Arc<ShaderModule>,
        layout: Arc<PipelineLayout>,
    ) -> Self {
        Self {
            device,
            shader,
            layout,
            handle: vk::Pipeline::null(),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    /// Describe and create in one step.
    pub fn create(
        device: Arc<Device>,
        identifier: impl Into<String>,
        shader: Arc<ShaderModule>,
        layout: Arc<PipelineLayout>,
    ) -> Result<Self> {
        let mut pipeline = Self::new(device, identifier, shader, layout);
        pipeline.create_on_hardware()?;
        Ok(pipeline)
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn shader(&self) -> &Arc<ShaderModule> {
        &self.shader
    }
}

impl Pipeline for ComputePipeline {
    fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::COMPUTE
    }

    fn layout(&self) -> Option<&Arc<PipelineLayout>> {
        Some(&self.layout)
    }
}

impl HardwareResource for ComputePipeline {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        if self.shader.stage() != ShaderStage::Compute {
            return Err(GpuError::MissingState {
                pipeline: self.lifecycle.identifier().to_string(),
                aspect: "compute shader",
            });
        }
        self.device.ensure_usable()?;
        self.shader.lifecycle().ensure_created()?;
        self.layout.lifecycle().ensure_created()?;

        let info = vk::ComputePipelineCreateInfo::default()
            .stage(self.shader.stage_info())
            .layout(self.layout.handle());

        let pipelines = unsafe {
            self.device
                .raw()
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_pipelines, e)| {
            tracing::error!(pipeline = %self.lifecycle.identifier(), "Unable to create compute pipeline: {e}");
            match self.device.observe(e.into()) {
                GpuError::Vulkan(result) => {
                    GpuError::PipelineCreation(format!("{}: {result}", self.lifecycle.identifier()))
                }
                other => other,
            }
        })?;

        self.handle = pipelines.first().copied().unwrap_or_default();
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

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy compute pipeline: {e}");
        }
    }
}
