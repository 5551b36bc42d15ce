use super::layout::DescriptorSetLayout;
use super::pool::DescriptorPool;
use crate::buffer::Buffer;
use crate::error::{GpuError, Result};
use crate::image::ImageView;
use crate::lifecycle::{HardwareResource, Lifecycle};
use crate::sampler::Sampler;
use ash::vk;
use std::sync::Arc;

/// A descriptor set allocated from a pool for one layout.
///
/// Every write requires both the set and the referenced resource to be
/// created and the binding to be declared with a matching type.
pub struct DescriptorSet {
    pool: Arc<DescriptorPool>,
    layout: Arc<DescriptorSetLayout>,
    handle: vk::DescriptorSet,
    lifecycle: Lifecycle,
}

impl DescriptorSet {
    pub fn new(
        pool: Arc<DescriptorPool>,
        layout: Arc<DescriptorSetLayout>,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            layout,
            handle: vk::DescriptorSet::null(),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    /// Allocate in one step.
    pub fn create(
        pool: Arc<DescriptorPool>,
        layout: Arc<DescriptorSetLayout>,
        identifier: impl Into<String>,
    ) -> Result<Self> {
        let mut set = Self::new(pool, layout, identifier);
        set.create_on_hardware()?;
        Ok(set)
    }

    pub fn handle(&self) -> vk::DescriptorSet {
        self.handle
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    fn check_write(
        &self,
        binding: u32,
        expected: vk::DescriptorType,
        resources: &[&Lifecycle],
    ) -> Result<()> {
        if let Err(e) = self.lifecycle.ensure_created() {
            tracing::error!(set = %self.lifecycle.identifier(), binding, "Write to a descriptor set that is not created");
            return Err(e);
        }
        if let Some(missing) = resources.iter().find(|lifecycle| !lifecycle.is_created()) {
            tracing::error!(set = %self.lifecycle.identifier(), binding, resource = %missing.identifier(), "Write references a resource that is not created");
            return Err(GpuError::NotCreated(missing.identifier().to_string()));
        }
        check_binding_type(self.layout.desc().binding(binding).map(|b| b.descriptor_type), expected)
            .map_err(|declared| {
                GpuError::InvalidState(format!(
                    "Binding {binding} of '{}' is {declared}, not {expected:?}",
                    self.layout.identifier()
                ))
            })
    }

    fn write(&self, write: vk::WriteDescriptorSet<'_>) {
        unsafe {
            self.pool
                .device()
                .raw()
                .update_descriptor_sets(&[write.dst_set(self.handle)], &[]);
        }
    }

    fn write_buffer(
        &self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: &Buffer,
        offset: u64,
        range: u64,
    ) -> Result<()> {
        self.check_write(binding, descriptor_type, &[buffer.lifecycle()])?;
        let infos = [buffer.descriptor_info(offset, range)];
        self.write(
            vk::WriteDescriptorSet::default()
                .dst_binding(binding)
                .descriptor_type(descriptor_type)
                .buffer_info(&infos),
        );
        Ok(())
    }

    fn write_image(
        &self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        info: vk::DescriptorImageInfo,
        resources: &[&Lifecycle],
    ) -> Result<()> {
        self.check_write(binding, descriptor_type, resources)?;
        let infos = [info];
        self.write(
            vk::WriteDescriptorSet::default()
                .dst_binding(binding)
                .descriptor_type(descriptor_type)
                .image_info(&infos),
        );
        Ok(())
    }

    pub fn write_uniform_buffer(&self, binding: u32, buffer: &Buffer, offset: u64, range: u64) -> Result<()> {
        self.write_buffer(binding, vk::DescriptorType::UNIFORM_BUFFER, buffer, offset, range)
    }

    /// `range` is the size of one element; the offset is supplied at bind time.
    pub fn write_dynamic_uniform_buffer(&self, binding: u32, buffer: &Buffer, range: u64) -> Result<()> {
        self.write_buffer(binding, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, buffer, 0, range)
    }

    pub fn write_storage_buffer(&self, binding: u32, buffer: &Buffer, offset: u64, range: u64) -> Result<()> {
        self.write_buffer(binding, vk::DescriptorType::STORAGE_BUFFER, buffer, offset, range)
    }

    pub fn write_sampler(&self, binding: u32, sampler: &Sampler) -> Result<()> {
        let info = vk::DescriptorImageInfo::default().sampler(sampler.handle());
        self.write_image(binding, vk::DescriptorType::SAMPLER, info, &[sampler.lifecycle()])
    }

    pub fn write_combined_image_sampler(
        &self,
        binding: u32,
        view: &ImageView,
        sampler: &Sampler,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        let info = vk::DescriptorImageInfo::default()
            .sampler(sampler.handle())
            .image_view(view.handle())
            .image_layout(layout);
        self.write_image(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            info,
            &[view.lifecycle(), sampler.lifecycle()],
        )
    }

    pub fn write_storage_image(&self, binding: u32, view: &ImageView) -> Result<()> {
        let info = vk::DescriptorImageInfo::default()
            .image_view(view.handle())
            .image_layout(vk::ImageLayout::GENERAL);
        self.write_image(binding, vk::DescriptorType::STORAGE_IMAGE, info, &[view.lifecycle()])
    }
}

/// Compare a declared binding type with the one a write needs.
///
/// On mismatch returns a description of what is declared.
fn check_binding_type(
    declared: Option<vk::DescriptorType>,
    expected: vk::DescriptorType,
) -> std::result::Result<(), String> {
    match declared {
        Some(ty) if ty == expected => Ok(()),
        Some(ty) => Err(format!("{ty:?}")),
        None => Err("undeclared".to_string()),
    }
}

impl HardwareResource for DescriptorSet {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.pool.device().ensure_usable()?;

        self.handle = self.pool.allocate_descriptor_set(&self.layout)?;
        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::DescriptorSet::null() {
            // Sets from pools without individual free go back on pool reset.
            if self.pool.desc().free_individual_sets {
                self.pool
                    .device()
                    .wait_idle_before_destroy(self.lifecycle.identifier());
                if let Err(e) = self.pool.free_descriptor_set(self.handle) {
                    tracing::error!(set = %self.lifecycle.identifier(), "Unable to free descriptor set: {e}");
                }
            }
            self.handle = vk::DescriptorSet::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to free descriptor set: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_type_must_match() {
        let uniform = vk::DescriptorType::UNIFORM_BUFFER;
        assert!(check_binding_type(Some(uniform), uniform).is_ok());
        assert_eq!(
            check_binding_type(None, uniform).unwrap_err(),
            "undeclared"
        );
        assert!(check_binding_type(Some(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC), uniform).is_err());
    }
}
