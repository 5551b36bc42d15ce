use super::layout::{DescriptorSetLayout, DescriptorSetLayoutDesc};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::lifecycle::{HardwareResource, Lifecycle};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Capacity of a descriptor pool.
#[derive(Debug, Clone, Default)]
pub struct DescriptorPoolDesc {
    pub max_sets: u32,
    pub sizes: Vec<vk::DescriptorPoolSize>,
    /// Allow returning single sets to the pool.
    pub free_individual_sets: bool,
}

impl DescriptorPoolDesc {
    /// Room for `sets` sets of every layout in `layouts`.
    pub fn for_layouts(layouts: &[&DescriptorSetLayoutDesc], sets: u32) -> Self {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for size in layouts.iter().flat_map(|layout| layout.pool_sizes(sets)) {
            match sizes.iter_mut().find(|s| s.ty == size.ty) {
                Some(existing) => existing.descriptor_count += size.descriptor_count,
                None => sizes.push(size),
            }
        }
        let layout_count = u32::try_from(layouts.len()).unwrap_or(u32::MAX);
        Self {
            max_sets: sets.saturating_mul(layout_count),
            sizes,
            free_individual_sets: true,
        }
    }

    pub fn with_free_individual_sets(mut self, enable: bool) -> Self {
        self.free_individual_sets = enable;
        self
    }

    fn flags(&self) -> vk::DescriptorPoolCreateFlags {
        if self.free_individual_sets {
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
        } else {
            vk::DescriptorPoolCreateFlags::empty()
        }
    }
}

/// Descriptor pool; allocation and free are serialized by a pool mutex.
pub struct DescriptorPool {
    device: Arc<Device>,
    desc: DescriptorPoolDesc,
    handle: vk::DescriptorPool,
    allocation: Mutex<()>,
    lifecycle: Lifecycle,
}

impl DescriptorPool {
    pub fn new(device: Arc<Device>, identifier: impl Into<String>, desc: DescriptorPoolDesc) -> Self {
        Self {
            device,
            desc,
            handle: vk::DescriptorPool::null(),
            allocation: Mutex::new(()),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    /// Describe, create and share a pool.
    pub fn create(
        device: Arc<Device>,
        identifier: impl Into<String>,
        desc: DescriptorPoolDesc,
    ) -> Result<Arc<Self>> {
        let mut pool = Self::new(device, identifier, desc);
        pool.create_on_hardware()?;
        Ok(Arc::new(pool))
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.handle
    }

    pub fn desc(&self) -> &DescriptorPoolDesc {
        &self.desc
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Allocate one set of `layout`.
    pub fn allocate_descriptor_set(&self, layout: &DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        self.lifecycle.ensure_created()?;
        layout.lifecycle().ensure_created()?;

        let layouts = [layout.handle()];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(&layouts);

        let sets = {
            let _allocation = self.allocation.lock();
            unsafe { self.device.raw().allocate_descriptor_sets(&info) }
        }
        .map_err(|e| {
            tracing::error!(pool = %self.lifecycle.identifier(), layout = %layout.identifier(), "Unable to allocate descriptor set: {e}");
            self.device.observe(e.into())
        })?;

        sets.first().copied().ok_or_else(|| {
            GpuError::Other(format!(
                "Pool '{}' returned no descriptor set",
                self.lifecycle.identifier()
            ))
        })
    }

    /// Return one set. Only valid for pools created with individual free.
    pub fn free_descriptor_set(&self, set: vk::DescriptorSet) -> Result<()> {
        self.lifecycle.ensure_created()?;
        if !self.desc.free_individual_sets {
            return Err(GpuError::InvalidState(format!(
                "Pool '{}' does not free individual sets",
                self.lifecycle.identifier()
            )));
        }
        let _allocation = self.allocation.lock();
        unsafe { self.device.raw().free_descriptor_sets(self.handle, &[set]) }
            .map_err(|e| self.device.observe(e.into()))
    }

    /// Return every set allocated from the pool.
    pub fn reset(&self) -> Result<()> {
        self.lifecycle.ensure_created()?;
        let _allocation = self.allocation.lock();
        unsafe {
            self.device
                .raw()
                .reset_descriptor_pool(self.handle, vk::DescriptorPoolResetFlags::empty())
        }
        .map_err(|e| self.device.observe(e.into()))
    }
}

impl HardwareResource for DescriptorPool {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device.ensure_usable()?;

        if self.desc.max_sets == 0 || self.desc.sizes.is_empty() {
            return Err(GpuError::InvalidState(format!(
                "Descriptor pool '{}' has no capacity",
                self.lifecycle.identifier()
            )));
        }

        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(self.desc.flags())
            .max_sets(self.desc.max_sets)
            .pool_sizes(&self.desc.sizes);

        self.handle = unsafe { self.device.raw().create_descriptor_pool(&info, None) }.map_err(|e| {
            tracing::error!(pool = %self.lifecycle.identifier(), "Unable to create descriptor pool: {e}");
            self.device.observe(e.into())
        })?;

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::DescriptorPool::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            unsafe { self.device.raw().destroy_descriptor_pool(self.handle, None) };
            self.handle = vk::DescriptorPool::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy descriptor pool: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_desc_covers_every_layout() {
        let stages = vk::ShaderStageFlags::FRAGMENT;
        let mut frame = DescriptorSetLayoutDesc::new("frame");
        frame.uniform_buffer(0, stages).unwrap();
        let mut material = DescriptorSetLayoutDesc::new("material");
        material.uniform_buffer(0, stages).unwrap();
        material.combined_image_sampler(1, stages).unwrap();

        let desc = DescriptorPoolDesc::for_layouts(&[&frame, &material], 8);
        assert_eq!(desc.max_sets, 16);
        let uniform = desc
            .sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .unwrap();
        assert_eq!(uniform.descriptor_count, 16);
        assert_eq!(desc.flags(), vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
        assert!(desc
            .with_free_individual_sets(false)
            .flags()
            .is_empty());
    }
}
