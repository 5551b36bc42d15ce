//! Vulkan instance creation and physical device selection.

use crate::capabilities::{supports_required_api, REQUIRED_API_VERSION};
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

/// Instance extensions required on every platform.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    #[allow(unused_mut)]
    let mut extensions = Vec::new();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME);

    extensions
}

/// Validation layers to enable when requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    extra_extensions: &[&'static CStr],
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;
    let engine_name = c"Quartz";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    let extension_names: Vec<*const std::ffi::c_char> = required_instance_extensions()
        .iter()
        .chain(extra_extensions)
        .map(|ext| ext.as_ptr())
        .collect();

    let requested_layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // Skip layers the loader does not know about instead of failing
    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
    let layers: Vec<&CStr> = requested_layers
        .into_iter()
        .filter(|layer| {
            let found = available_layers.iter().any(|props| {
                let name = unsafe { CStr::from_ptr(props.layer_name.as_ptr()) };
                name == *layer
            });
            if !found {
                tracing::warn!("Validation layer {:?} not available", layer);
            }
            found
        })
        .collect();

    let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None)? };

    Ok(instance)
}

/// Select the best physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    devices
        .into_iter()
        .map(|device| (unsafe { score_physical_device(instance, device) }, device))
        .filter(|(score, _)| *score >= 0)
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Score a physical device for selection. Negative scores are unusable.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i64 {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let memory = unsafe { instance.get_physical_device_memory_properties(device) };

    let heaps: Vec<(vk::MemoryHeapFlags, u64)> = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .map(|heap| (heap.flags, heap.size))
        .collect();

    device_score(properties.api_version, properties.device_type, &heaps)
}

/// Pure scoring rule: the required Vulkan version is mandatory, discrete
/// GPUs and larger device-local heaps win.
pub(crate) fn device_score(
    api_version: u32,
    device_type: vk::PhysicalDeviceType,
    heaps: &[(vk::MemoryHeapFlags, u64)],
) -> i64 {
    if !supports_required_api(api_version) {
        return -1;
    }

    let mut score = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    let vram_gb: u64 = heaps
        .iter()
        .filter(|(flags, _)| flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|(_, size)| size / (1024 * 1024 * 1024))
        .sum();
    score += i64::try_from(vram_gb).unwrap_or(i64::MAX / 2);

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn old_api_versions_are_rejected() {
        let score = device_score(
            vk::API_VERSION_1_1,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            &[(vk::MemoryHeapFlags::DEVICE_LOCAL, 8 * GIB)],
        );
        assert!(score < 0);
    }

    #[test]
    fn discrete_beats_integrated() {
        let heaps = [(vk::MemoryHeapFlags::DEVICE_LOCAL, 4 * GIB)];
        let discrete = device_score(
            vk::API_VERSION_1_3,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            &heaps,
        );
        let integrated = device_score(
            vk::API_VERSION_1_3,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            &heaps,
        );
        assert!(discrete > integrated);
    }

    #[test]
    fn host_heaps_do_not_count_as_vram() {
        let score = device_score(
            vk::API_VERSION_1_3,
            vk::PhysicalDeviceType::CPU,
            &[(vk::MemoryHeapFlags::empty(), 64 * GIB)],
        );
        assert_eq!(score, 0);
    }
}
