use crate::descriptors::{DescriptorSetLayout, DescriptorSetLayoutKey};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::lifecycle::{HardwareResource, Lifecycle};
use ash::vk;
use std::sync::Arc;

/// Push constant block visible to `stages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

impl PushConstantRange {
    pub fn new(stages: vk::ShaderStageFlags, offset: u32, size: u32) -> Self {
        Self {
            stages,
            offset,
            size,
        }
    }

    /// One past the last byte, or `None` when the range overflows `u32`.
    pub fn end(self) -> Option<u32> {
        self.offset.checked_add(self.size)
    }

    /// Whether the range reaches past `max_size` bytes.
    pub fn exceeds(self, max_size: u32) -> bool {
        self.end().map_or(true, |end| end > max_size)
    }

    fn raw(self) -> vk::PushConstantRange {
        vk::PushConstantRange::default()
            .stage_flags(self.stages)
            .offset(self.offset)
            .size(self.size)
    }
}

/// Structural identity of a pipeline layout: ordered set layouts and push
/// constant ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineLayoutKey {
    set_layouts: Vec<DescriptorSetLayoutKey>,
    push_constants: Vec<PushConstantRange>,
}

impl PipelineLayoutKey {
    pub fn new(set_layouts: Vec<DescriptorSetLayoutKey>, push_constants: Vec<PushConstantRange>) -> Self {
        Self {
            set_layouts,
            push_constants,
        }
    }

    /// Key of a layout built from `set_layouts` and `push_constants`.
    pub fn of(set_layouts: &[Arc<DescriptorSetLayout>], push_constants: &[PushConstantRange]) -> Self {
        Self::from_set_keys(set_layouts.iter().map(|layout| layout.key()), push_constants)
    }

    /// Key from set layout keys in set order.
    pub fn from_set_keys(
        set_layouts: impl IntoIterator<Item = DescriptorSetLayoutKey>,
        push_constants: &[PushConstantRange],
    ) -> Self {
        Self::new(set_layouts.into_iter().collect(), push_constants.to_vec())
    }
}

/// Immutable pipeline layout.
pub struct PipelineLayout {
    device: Arc<Device>,
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    push_constants: Vec<PushConstantRange>,
    handle: vk::PipelineLayout,
    lifecycle: Lifecycle,
}

impl PipelineLayout {
    pub fn new(
        device: Arc<Device>,
        identifier: impl Into<String>,
        set_layouts: Vec<Arc<DescriptorSetLayout>>,
        push_constants: Vec<PushConstantRange>,
    ) -> Self {
        Self {
            device,
            set_layouts,
            push_constants,
            handle: vk::PipelineLayout::null(),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    pub fn push_constants(&self) -> &[PushConstantRange] {
        &self.push_constants
    }

    pub fn key(&self) -> PipelineLayoutKey {
        PipelineLayoutKey::of(&self.set_layouts, &self.push_constants)
    }
}

impl HardwareResource for PipelineLayout {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device.ensure_usable()?;

        let limits = self.device.capabilities();
        if self.set_layouts.len() > limits.max_bound_descriptor_sets as usize {
            return Err(GpuError::InvalidState(format!(
                "Pipeline layout '{}' uses {} sets, device allows {}",
                self.lifecycle.identifier(),
                self.set_layouts.len(),
                limits.max_bound_descriptor_sets
            )));
        }
        if let Some(range) = self
            .push_constants
            .iter()
            .find(|range| range.exceeds(limits.max_push_constants_size))
        {
            return Err(GpuError::InvalidState(format!(
                "Pipeline layout '{}' push constants end at {}, device allows {}",
                self.lifecycle.identifier(),
                u64::from(range.offset) + u64::from(range.size),
                limits.max_push_constants_size
            )));
        }

        let set_layouts = self
            .set_layouts
            .iter()
            .map(|layout| {
                layout.lifecycle().ensure_created()?;
                Ok(layout.handle())
            })
            .collect::<Result<Vec<_>>>()?;
        let ranges: Vec<_> = self.push_constants.iter().copied().map(PushConstantRange::raw).collect();

        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges);

        self.handle = unsafe { self.device.raw().create_pipeline_layout(&info, None) }.map_err(|e| {
            tracing::error!(layout = %self.lifecycle.identifier(), "Unable to create pipeline layout: {e}");
            self.device.observe(e.into())
        })?;

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::PipelineLayout::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            unsafe { self.device.raw().destroy_pipeline_layout(self.handle, None) };
            self.handle = vk::PipelineLayout::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy pipeline layout: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constant_end_checks_overflow() {
        let vertex = vk::ShaderStageFlags::VERTEX;
        assert_eq!(PushConstantRange::new(vertex, 64, 64).end(), Some(128));
        assert!(!PushConstantRange::new(vertex, 64, 64).exceeds(128));
        assert!(PushConstantRange::new(vertex, 64, 68).exceeds(128));

        let wrapping = PushConstantRange::new(vertex, u32::MAX, 4);
        assert_eq!(wrapping.end(), None);
        assert!(wrapping.exceeds(u32::MAX));
    }
}
