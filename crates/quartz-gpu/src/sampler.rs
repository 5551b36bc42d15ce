//! Texture samplers.

use crate::device::Device;
use crate::error::Result;
use crate::lifecycle::{HardwareResource, Lifecycle};
use ash::vk;
use std::sync::Arc;

/// Creation descriptor of a sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
    pub compare_op: Option<vk::CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
            compare_op: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_OPAQUE_BLACK,
        }
    }
}

impl SamplerDesc {
    /// Nearest filtering, clamped to edge.
    pub fn nearest() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            ..Self::default()
        }
    }

    /// Depth comparison sampler for shadow maps.
    pub fn shadow() -> Self {
        Self {
            address_mode: vk::SamplerAddressMode::CLAMP_TO_BORDER,
            compare_op: Some(vk::CompareOp::LESS_OR_EQUAL),
            border_color: vk::BorderColor::FLOAT_OPAQUE_WHITE,
            ..Self::default()
        }
    }

    /// Enable anisotropic filtering.
    pub fn with_anisotropy(mut self, max_anisotropy: f32) -> Self {
        self.max_anisotropy = Some(max_anisotropy);
        self
    }
}

/// A sampler object.
pub struct Sampler {
    device: Arc<Device>,
    desc: SamplerDesc,
    handle: vk::Sampler,
    lifecycle: Lifecycle,
}

impl Sampler {
    /// Describe a sampler.
    pub fn new(device: Arc<Device>, identifier: impl Into<String>, desc: SamplerDesc) -> Self {
        Self {
            device,
            desc,
            handle: vk::Sampler::null(),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    /// Raw sampler handle.
    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }

    /// Creation descriptor.
    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}

impl HardwareResource for Sampler {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device.ensure_usable()?;

        let desc = &self.desc;
        // Anisotropy is silently dropped on hardware without the feature
        let anisotropy = desc
            .max_anisotropy
            .filter(|_| self.device.capabilities().supports_sampler_anisotropy)
            .map(|max| max.min(self.device.capabilities().max_sampler_anisotropy));

        let info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .compare_enable(desc.compare_op.is_some())
            .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod)
            .border_color(desc.border_color)
            .unnormalized_coordinates(false);

        self.handle = unsafe { self.device.raw().create_sampler(&info, None) }.map_err(|e| {
            tracing::error!(sampler = %self.lifecycle.identifier(), "Unable to create sampler: {e}");
            self.device.observe(e.into())
        })?;

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::Sampler::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            unsafe { self.device.raw().destroy_sampler(self.handle, None) };
            self.handle = vk::Sampler::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy sampler: {e}");
        }
    }
}
