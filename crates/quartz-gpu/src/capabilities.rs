//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// Lowest Vulkan version a device must expose. Portability drivers on
/// macOS stop at 1.2.
pub const REQUIRED_API_VERSION: u32 = if cfg!(target_os = "macos") {
    vk::API_VERSION_1_2
} else {
    vk::API_VERSION_1_3
};

/// Whether `api_version` is at least [`REQUIRED_API_VERSION`].
pub fn supports_required_api(api_version: u32) -> bool {
    let version = |v: u32| (vk::api_version_major(v), vk::api_version_minor(v));
    version(api_version) >= version(REQUIRED_API_VERSION)
}

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Device type reported by the driver
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum memory allocation count
    pub max_memory_allocation_count: u32,

    // Binding limits
    /// Maximum descriptor sets bound at once
    pub max_bound_descriptor_sets: u32,
    /// Maximum push constant block size in bytes
    pub max_push_constants_size: u32,
    /// Required alignment of dynamic uniform buffer offsets
    pub min_uniform_buffer_offset_alignment: u64,
    /// Maximum sampler anisotropy
    pub max_sampler_anisotropy: f32,

    // Compute limits
    /// Maximum compute workgroup size
    pub max_compute_workgroup_size: [u32; 3],
    /// Maximum compute workgroup invocations
    pub max_compute_workgroup_invocations: u32,

    // Optional core features
    /// Anisotropic filtering support
    pub supports_sampler_anisotropy: bool,
    /// Tessellation shader support
    pub supports_tessellation: bool,
    /// Geometry shader support
    pub supports_geometry_shader: bool,
    /// Wireframe and point polygon modes
    pub supports_fill_mode_non_solid: bool,
    /// Depth bias clamping
    pub supports_depth_bias_clamp: bool,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let features = unsafe { instance.get_physical_device_features(physical_device) };

        let extensions =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let limits = properties.limits;

        Self {
            vendor,
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            device_local_memory_mb,
            max_memory_allocation_count: limits.max_memory_allocation_count,

            max_bound_descriptor_sets: limits.max_bound_descriptor_sets,
            max_push_constants_size: limits.max_push_constants_size,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            max_sampler_anisotropy: limits.max_sampler_anisotropy,

            max_compute_workgroup_size: limits.max_compute_work_group_size,
            max_compute_workgroup_invocations: limits.max_compute_work_group_invocations,

            supports_sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            supports_tessellation: features.tessellation_shader == vk::TRUE,
            supports_geometry_shader: features.geometry_shader == vk::TRUE,
            supports_fill_mode_non_solid: features.fill_mode_non_solid == vk::TRUE,
            supports_depth_bias_clamp: features.depth_bias_clamp == vk::TRUE,

            available_extensions,
        }
    }

    /// Check if the GPU meets minimum requirements.
    pub fn meets_requirements(&self) -> bool {
        supports_required_api(self.api_version)
    }

    /// Whether the device advertises an extension.
    pub fn has_extension(&self, name: &CStr) -> bool {
        name.to_str()
            .is_ok_and(|name| self.available_extensions.contains(name))
    }

    /// Round `offset` up to the dynamic uniform buffer alignment.
    pub fn align_uniform_offset(&self, offset: u64) -> u64 {
        align_up(offset, self.min_uniform_buffer_offset_alignment)
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

/// Round `value` up to a multiple of `alignment` (zero means unaligned).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn required_api_version_follows_host() {
        assert!(supports_required_api(vk::API_VERSION_1_3));
        assert!(supports_required_api(vk::make_api_version(0, 1, 4, 0)));
        assert!(!supports_required_api(vk::API_VERSION_1_1));
        assert_eq!(supports_required_api(vk::API_VERSION_1_2), cfg!(target_os = "macos"));
    }

    #[test]
    fn alignment_rounds_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(300, 0), 300);
    }
}
