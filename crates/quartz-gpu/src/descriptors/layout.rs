use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::lifecycle::{HardwareResource, Lifecycle};
use ash::vk;
use std::sync::Arc;

/// One binding slot of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

impl DescriptorBinding {
    pub fn new(binding: u32, descriptor_type: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            descriptor_type,
            count: 1,
            stages,
        }
    }

    /// Array of `count` descriptors.
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    fn raw(&self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.descriptor_type)
            .descriptor_count(self.count)
            .stage_flags(self.stages)
    }
}

/// Structural identity of a layout: flags plus bindings sorted by index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutKey {
    flags: vk::DescriptorSetLayoutCreateFlags,
    bindings: Vec<DescriptorBinding>,
}

/// Binding list of a descriptor set layout, built before creation.
#[derive(Debug, Clone)]
pub struct DescriptorSetLayoutDesc {
    label: String,
    flags: vk::DescriptorSetLayoutCreateFlags,
    bindings: Vec<DescriptorBinding>,
}

macro_rules! typed_binding {
    ($(#[$doc:meta] $name:ident => $ty:ident),* $(,)?) => {
        $(
            #[$doc]
            pub fn $name(&mut self, binding: u32, stages: vk::ShaderStageFlags) -> Result<&mut Self> {
                self.declare(DescriptorBinding::new(binding, vk::DescriptorType::$ty, stages))?;
                Ok(self)
            }
        )*
    };
}

impl DescriptorSetLayoutDesc {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            flags: vk::DescriptorSetLayoutCreateFlags::empty(),
            bindings: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: vk::DescriptorSetLayoutCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn flags(&self) -> vk::DescriptorSetLayoutCreateFlags {
        self.flags
    }

    /// Declared bindings in declaration order.
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    /// Binding declared at `index`, if any.
    pub fn binding(&self, index: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.binding == index)
    }

    /// Add a binding. A second declaration of the same index is rejected
    /// and leaves the list untouched.
    pub fn declare(&mut self, binding: DescriptorBinding) -> Result<()> {
        if self.binding(binding.binding).is_some() {
            return Err(GpuError::DuplicateBinding {
                layout: self.label.clone(),
                binding: binding.binding,
            });
        }
        self.bindings.push(binding);
        Ok(())
    }

    typed_binding! {
        /// `sampler` binding.
        sampler => SAMPLER,
        /// `sampler2D`-style binding.
        combined_image_sampler => COMBINED_IMAGE_SAMPLER,
        /// `texture2D`-style binding.
        sampled_image => SAMPLED_IMAGE,
        /// `image2D` binding.
        storage_image => STORAGE_IMAGE,
        /// `samplerBuffer` binding.
        uniform_texel_buffer => UNIFORM_TEXEL_BUFFER,
        /// `imageBuffer` binding.
        storage_texel_buffer => STORAGE_TEXEL_BUFFER,
        /// Uniform block.
        uniform_buffer => UNIFORM_BUFFER,
        /// Storage block.
        storage_buffer => STORAGE_BUFFER,
        /// Uniform block bound with a dynamic offset.
        dynamic_uniform_buffer => UNIFORM_BUFFER_DYNAMIC,
        /// Storage block bound with a dynamic offset.
        dynamic_storage_buffer => STORAGE_BUFFER_DYNAMIC,
        /// Subpass input.
        input_attachment => INPUT_ATTACHMENT,
    }

    /// Canonical key; declaration order does not matter.
    pub fn key(&self) -> DescriptorSetLayoutKey {
        let mut bindings = self.bindings.clone();
        bindings.sort_unstable();
        DescriptorSetLayoutKey {
            flags: self.flags,
            bindings,
        }
    }

    /// Descriptor count per type, multiplied by `sets`.
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            let count = binding.count.saturating_mul(sets);
            match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += count,
                None => sizes.push(
                    vk::DescriptorPoolSize::default()
                        .ty(binding.descriptor_type)
                        .descriptor_count(count),
                ),
            }
        }
        sizes
    }
}

/// A descriptor set layout on the device.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    desc: DescriptorSetLayoutDesc,
    handle: vk::DescriptorSetLayout,
    lifecycle: Lifecycle,
}

impl DescriptorSetLayout {
    pub fn new(device: Arc<Device>, desc: DescriptorSetLayoutDesc) -> Self {
        let lifecycle = Lifecycle::new(desc.label());
        Self {
            device,
            desc,
            handle: vk::DescriptorSetLayout::null(),
            lifecycle,
        }
    }

    /// Describe and create in one step.
    pub fn create(device: Arc<Device>, desc: DescriptorSetLayoutDesc) -> Result<Self> {
        let mut layout = Self::new(device, desc);
        layout.create_on_hardware()?;
        Ok(layout)
    }

    /// Add a binding before creation.
    pub fn declare(&mut self, binding: DescriptorBinding) -> Result<()> {
        if self.lifecycle.is_created() {
            return Err(GpuError::AlreadyCreated(self.lifecycle.identifier().to_string()));
        }
        self.desc.declare(binding)
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn desc(&self) -> &DescriptorSetLayoutDesc {
        &self.desc
    }

    pub fn key(&self) -> DescriptorSetLayoutKey {
        self.desc.key()
    }
}

impl HardwareResource for DescriptorSetLayout {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device.ensure_usable()?;

        if self.desc.bindings.is_empty() {
            tracing::error!(layout = %self.lifecycle.identifier(), "Descriptor set layout has no bindings");
            return Err(GpuError::InvalidState(format!(
                "Descriptor set layout '{}' must describe at least one binding",
                self.lifecycle.identifier()
            )));
        }

        let bindings: Vec<_> = self.desc.bindings.iter().map(DescriptorBinding::raw).collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(self.desc.flags)
            .bindings(&bindings);

        self.handle = unsafe { self.device.raw().create_descriptor_set_layout(&info, None) }
            .map_err(|e| {
                tracing::error!(layout = %self.lifecycle.identifier(), "Unable to create descriptor set layout: {e}");
                self.device.observe(e.into())
            })?;

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::DescriptorSetLayout::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            unsafe {
                self.device
                    .raw()
                    .destroy_descriptor_set_layout(self.handle, None);
            }
            self.handle = vk::DescriptorSetLayout::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy descriptor set layout: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAGMENT: vk::ShaderStageFlags = vk::ShaderStageFlags::FRAGMENT;

    #[test]
    fn duplicate_binding_is_rejected_without_side_effects() {
        let mut desc = DescriptorSetLayoutDesc::new("material");
        desc.uniform_buffer(0, FRAGMENT).unwrap();
        desc.combined_image_sampler(1, FRAGMENT).unwrap();

        let before = desc.bindings().to_vec();
        let err = desc.storage_buffer(1, FRAGMENT).unwrap_err();

        assert!(matches!(
            err,
            GpuError::DuplicateBinding { binding: 1, ref layout } if layout == "material"
        ));
        assert_eq!(desc.bindings(), before.as_slice());
    }

    #[test]
    fn key_ignores_declaration_order() {
        let mut a = DescriptorSetLayoutDesc::new("a");
        a.uniform_buffer(0, FRAGMENT).unwrap();
        a.sampler(2, FRAGMENT).unwrap();

        let mut b = DescriptorSetLayoutDesc::new("b");
        b.sampler(2, FRAGMENT).unwrap();
        b.uniform_buffer(0, FRAGMENT).unwrap();

        assert_eq!(a.key(), b.key());

        let c = b
            .clone()
            .with_flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL);
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn stage_flags_are_part_of_the_key() {
        let mut a = DescriptorSetLayoutDesc::new("a");
        a.uniform_buffer(0, FRAGMENT).unwrap();
        let mut b = DescriptorSetLayoutDesc::new("a");
        b.uniform_buffer(0, vk::ShaderStageFlags::VERTEX).unwrap();
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn pool_sizes_aggregate_by_type() {
        let mut desc = DescriptorSetLayoutDesc::new("frame");
        desc.uniform_buffer(0, FRAGMENT).unwrap();
        desc.uniform_buffer(1, FRAGMENT).unwrap();
        desc.declare(
            DescriptorBinding::new(2, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, FRAGMENT)
                .with_count(4),
        )
        .unwrap();

        let sizes = desc.pool_sizes(3);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 6);
        assert_eq!(sizes[1].descriptor_count, 12);
    }
}
