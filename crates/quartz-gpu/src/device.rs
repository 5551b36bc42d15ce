//! Logical device: the single point of truth for a GPU context.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::MemoryAllocator;
use crate::queue::{Queue, QueueKind};
use crate::sync::PendingFences;
use ash::vk;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Queue family indices chosen for each kind of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    /// Pick families from the per-family capability flags.
    ///
    /// With `prefer_dedicated`, compute goes to a family without graphics
    /// and transfer to a family without graphics or compute when such
    /// families exist. Missing dedicated families fall back to graphics.
    pub fn select(families: &[vk::QueueFlags], prefer_dedicated: bool) -> Option<Self> {
        let mut graphics = None;
        let mut compute = None;
        let mut transfer = None;

        for (index, flags) in families.iter().enumerate() {
            let index = u32::try_from(index).ok()?;

            if prefer_dedicated
                && flags.contains(vk::QueueFlags::COMPUTE)
                && !flags.contains(vk::QueueFlags::GRAPHICS)
                && compute.is_none()
            {
                compute = Some(index);
            }

            if prefer_dedicated
                && flags.contains(vk::QueueFlags::TRANSFER)
                && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                && transfer.is_none()
            {
                transfer = Some(index);
            }

            if flags.contains(vk::QueueFlags::GRAPHICS) && graphics.is_none() {
                graphics = Some(index);
            }
        }

        let graphics = graphics?;
        let compute = compute.unwrap_or(graphics);
        let transfer = transfer.unwrap_or(graphics);

        Some(Self {
            graphics,
            compute,
            transfer,
        })
    }

    /// Family index serving `kind`.
    pub fn family(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Graphics => self.graphics,
            QueueKind::Compute => self.compute,
            QueueKind::Transfer => self.transfer,
        }
    }

    /// Distinct family indices, sorted.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.compute, self.transfer];
        families.sort_unstable();
        families.dedup();
        families
    }
}

/// Find the first memory type allowed by `type_bits` that has every flag in `flags`.
pub fn find_memory_type_index(
    memory_types: &[vk::MemoryPropertyFlags],
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    memory_types
        .iter()
        .enumerate()
        .take(32)
        .find(|(index, properties)| type_bits & (1 << index) != 0 && properties.contains(flags))
        .and_then(|(index, _)| u32::try_from(index).ok())
}

/// Index of the memory type whose flags are exactly `actual`, among those
/// allowed by `type_bits`.
pub fn memory_type_index_with_flags(
    memory_types: &[vk::MemoryPropertyFlags],
    type_bits: u32,
    actual: vk::MemoryPropertyFlags,
) -> Option<u32> {
    memory_types
        .iter()
        .enumerate()
        .take(32)
        .find(|(index, properties)| type_bits & (1 << index) != 0 && **properties == actual)
        .and_then(|(index, _)| u32::try_from(index).ok())
}

/// Pick the first candidate format whose features for `tiling` include `features`.
pub fn select_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    mut properties: impl FnMut(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        let props = properties(format);
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

/// Read-mostly tables guarded by the device lock.
struct DeviceTables {
    families: QueueFamilies,
    queues: HashMap<u32, vk::Queue>,
    memory_types: Vec<vk::MemoryPropertyFlags>,
    memory_type_cache: HashMap<(u32, vk::MemoryPropertyFlags), u32>,
}

/// Logical device shared by every resource it hosts.
pub struct Device {
    // Entry must be kept alive for the lifetime of the device
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    raw: ash::Device,
    capabilities: GpuCapabilities,
    allocator: Mutex<MemoryAllocator>,
    tables: RwLock<DeviceTables>,
    submission: Mutex<()>,
    pending_fences: Mutex<PendingFences>,
    lost: AtomicBool,
}

impl Device {
    /// Raw `ash` device.
    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    /// Vulkan instance.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Memory allocator.
    pub(crate) fn allocator(&self) -> &Mutex<MemoryAllocator> {
        &self.allocator
    }

    /// Queue family indices.
    pub fn queue_families(&self) -> QueueFamilies {
        self.tables.read().families
    }

    /// Family index serving `kind`.
    pub fn queue_family(&self, kind: QueueKind) -> u32 {
        self.tables.read().families.family(kind)
    }

    /// Queue serving `kind`.
    pub fn queue(self: &Arc<Self>, kind: QueueKind) -> Queue {
        let tables = self.tables.read();
        let family = tables.families.family(kind);
        let handle = tables
            .queues
            .get(&family)
            .copied()
            .unwrap_or_else(vk::Queue::null);
        Queue::new(Arc::clone(self), kind, family, handle)
    }

    /// Whether the device can still host new resources.
    pub fn is_usable(&self) -> bool {
        !self.lost.load(Ordering::Acquire)
    }

    /// Fail with a precondition error if the device is lost.
    pub fn ensure_usable(&self) -> Result<()> {
        if self.is_usable() {
            Ok(())
        } else {
            Err(GpuError::DeviceUnusable("device was lost".to_string()))
        }
    }

    /// Inspect an error and mark the device lost if it reports so.
    pub(crate) fn observe(&self, error: GpuError) -> GpuError {
        if error.is_device_lost() && !self.lost.swap(true, Ordering::AcqRel) {
            tracing::error!("GPU device lost");
        }
        error
    }

    /// Serialize a queue submission.
    pub(crate) fn lock_submission(&self) -> MutexGuard<'_, ()> {
        self.submission.lock()
    }

    /// Resolve a memory type index, memoizing the answer.
    pub fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Result<u32> {
        let key = (type_bits, flags);
        if let Some(index) = self.tables.read().memory_type_cache.get(&key) {
            return Ok(*index);
        }

        let mut tables = self.tables.write();
        let index = find_memory_type_index(&tables.memory_types, type_bits, flags)
            .ok_or(GpuError::NoMemoryType { type_bits, flags })?;
        tables.memory_type_cache.insert(key, index);
        Ok(index)
    }

    /// Memory type an allocation with `actual` flags was served from.
    pub(crate) fn allocated_memory_type(&self, type_bits: u32, actual: vk::MemoryPropertyFlags) -> Option<u32> {
        memory_type_index_with_flags(&self.tables.read().memory_types, type_bits, actual)
    }

    /// Format properties reported by the physical device.
    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// First supported format among `candidates`.
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Result<vk::Format> {
        select_supported_format(candidates, tiling, features, |format| {
            self.format_properties(format)
        })
        .ok_or_else(|| {
            GpuError::Other(format!(
                "None of {candidates:?} supports {features:?} with {tiling:?} tiling"
            ))
        })
    }

    /// Best available depth format.
    pub fn find_depth_format(&self) -> Result<vk::Format> {
        self.find_supported_format(
            &[
                vk::Format::D32_SFLOAT,
                vk::Format::D32_SFLOAT_S8_UINT,
                vk::Format::D24_UNORM_S8_UINT,
            ],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }

    /// Wait for the device to be idle.
    ///
    /// Holds the submission lock so no queue is fed while waiting.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        let _submission = self.lock_submission();
        unsafe { self.raw.device_wait_idle() }.map_err(|e| self.observe(e.into()))
    }

    /// Keep a fence whose work is still in flight until it signals.
    pub(crate) fn park_fence(&self, fence: vk::Fence) {
        let mut pending = self.pending_fences.lock();
        pending.park(fence);
        tracing::debug!(pending = pending.len(), "Fence parked until its work completes");
    }

    /// Destroy parked fences that have signaled.
    pub(crate) fn retire_fences(&self) {
        let mut pending = self.pending_fences.lock();
        // An error status means the work will never finish
        let done = pending.retire(|fence| unsafe { self.raw.get_fence_status(fence) }.unwrap_or(true));
        for fence in done {
            unsafe { self.raw.destroy_fence(fence, None) };
        }
    }

    /// Wait idle before releasing `resource`; failures are logged only.
    pub(crate) fn wait_idle_before_destroy(&self, resource: &str) {
        if let Err(e) = self.wait_idle() {
            tracing::warn!(resource, "Unable to idle device before destruction: {e}");
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.raw.device_wait_idle();

            for fence in self.pending_fences.get_mut().drain() {
                self.raw.destroy_fence(fence, None);
            }

            // Shutdown allocator BEFORE destroying device
            self.allocator.lock().shutdown();

            self.raw.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a device.
pub struct DeviceBuilder {
    app_name: String,
    enable_validation: bool,
    prefer_dedicated_queues: bool,
    instance_extensions: Vec<&'static CStr>,
    device_extensions: Vec<&'static CStr>,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "Quartz".to_string(),
            enable_validation: cfg!(debug_assertions),
            prefer_dedicated_queues: true,
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
        }
    }
}

impl DeviceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Prefer dedicated compute and transfer queue families.
    pub fn prefer_dedicated_queues(mut self, prefer: bool) -> Self {
        self.prefer_dedicated_queues = prefer;
        self
    }

    /// Request an additional instance extension.
    pub fn instance_extension(mut self, name: &'static CStr) -> Self {
        self.instance_extensions.push(name);
        self
    }

    /// Request an additional device extension.
    pub fn device_extension(mut self, name: &'static CStr) -> Self {
        self.device_extensions.push(name);
        self
    }

    /// Build the device.
    pub fn build(self) -> Result<Arc<Device>> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                self.enable_validation,
                &self.instance_extensions,
            )
        }?;

        match unsafe { self.build_on_instance(&instance) } {
            Ok(parts) => Ok(Arc::new(parts.into_device(entry, instance))),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    /// Everything after instance creation; the caller destroys the instance on failure.
    unsafe fn build_on_instance(&self, instance: &ash::Instance) -> Result<DeviceParts> {
        let physical_device = unsafe { select_physical_device(instance) }?;
        let capabilities = unsafe { GpuCapabilities::query(instance, physical_device) };

        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }

        for extension in &self.device_extensions {
            if !capabilities.has_extension(extension) {
                return Err(GpuError::Other(format!(
                    "Required device extension not supported: {extension:?}"
                )));
            }
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let family_flags: Vec<vk::QueueFlags> =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) }
                .iter()
                .map(|family| family.queue_flags)
                .collect();
        let families = QueueFamilies::select(&family_flags, self.prefer_dedicated_queues)
            .ok_or(GpuError::NoSuitableDevice)?;

        tracing::debug!(
            graphics = families.graphics,
            compute = families.compute,
            transfer = families.transfer,
            "Queue families selected"
        );

        let raw = unsafe {
            create_logical_device(
                instance,
                physical_device,
                &capabilities,
                &families,
                &self.device_extensions,
            )
        }?;

        let allocator = match unsafe { MemoryAllocator::new(instance, &raw, physical_device) } {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { raw.destroy_device(None) };
                return Err(e);
            }
        };

        let queues = families
            .unique()
            .into_iter()
            .map(|family| (family, unsafe { raw.get_device_queue(family, 0) }))
            .collect();

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let memory_types = memory_properties
            .memory_types
            .iter()
            .take(memory_properties.memory_type_count as usize)
            .map(|memory_type| memory_type.property_flags)
            .collect();

        Ok(DeviceParts {
            physical_device,
            raw,
            capabilities,
            allocator,
            tables: DeviceTables {
                families,
                queues,
                memory_types,
                memory_type_cache: HashMap::new(),
            },
        })
    }
}

struct DeviceParts {
    physical_device: vk::PhysicalDevice,
    raw: ash::Device,
    capabilities: GpuCapabilities,
    allocator: MemoryAllocator,
    tables: DeviceTables,
}

impl DeviceParts {
    fn into_device(self, entry: ash::Entry, instance: ash::Instance) -> Device {
        Device {
            entry,
            instance,
            physical_device: self.physical_device,
            raw: self.raw,
            capabilities: self.capabilities,
            allocator: Mutex::new(self.allocator),
            tables: RwLock::new(self.tables),
            submission: Mutex::new(()),
            pending_fences: Mutex::new(PendingFences::default()),
            lost: AtomicBool::new(false),
        }
    }
}

/// Create the logical device with one queue per distinct family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    capabilities: &GpuCapabilities,
    families: &QueueFamilies,
    extensions: &[&'static CStr],
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    // Optional features are enabled only where the hardware has them
    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(capabilities.supports_sampler_anisotropy)
        .tessellation_shader(capabilities.supports_tessellation)
        .geometry_shader(capabilities.supports_geometry_shader)
        .fill_mode_non_solid(capabilities.supports_fill_mode_non_solid)
        .depth_bias_clamp(capabilities.supports_depth_bias_clamp);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .map_err(GpuError::from)?;

    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graphics_all() -> vk::QueueFlags {
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER
    }

    #[test]
    fn single_family_serves_everything() {
        let families = QueueFamilies::select(&[graphics_all()], true).unwrap();
        assert_eq!(families.graphics, 0);
        assert_eq!(families.compute, 0);
        assert_eq!(families.transfer, 0);
        assert_eq!(families.unique(), vec![0]);
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let flags = [
            graphics_all(),
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::TRANSFER,
        ];
        let families = QueueFamilies::select(&flags, true).unwrap();
        assert_eq!(families.compute, 1);
        assert_eq!(families.transfer, 2);
        assert_eq!(families.unique(), vec![0, 1, 2]);

        let shared = QueueFamilies::select(&flags, false).unwrap();
        assert_eq!(shared.compute, 0);
        assert_eq!(shared.transfer, 0);
    }

    #[test]
    fn graphics_family_is_required() {
        assert!(QueueFamilies::select(&[vk::QueueFlags::COMPUTE], true).is_none());
    }

    #[test]
    fn memory_type_lookup_honors_filter_and_flags() {
        let types = [
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        ];
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(find_memory_type_index(&types, 0b111, host), Some(1));
        assert_eq!(find_memory_type_index(&types, 0b100, host), Some(2));
        assert_eq!(
            find_memory_type_index(&types, 0b110, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }

    #[test]
    fn allocated_type_is_found_by_exact_flags() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let cached = host | vk::MemoryPropertyFlags::HOST_CACHED;
        let types = [vk::MemoryPropertyFlags::DEVICE_LOCAL, host, cached];

        // A request for `host` may be served from the cached type
        assert_eq!(find_memory_type_index(&types, 0b111, host), Some(1));
        assert_eq!(memory_type_index_with_flags(&types, 0b111, cached), Some(2));
        assert_eq!(memory_type_index_with_flags(&types, 0b011, cached), None);
    }

    #[test]
    fn format_selection_respects_tiling() {
        let props = |format: vk::Format| {
            if format == vk::Format::D32_SFLOAT {
                vk::FormatProperties {
                    linear_tiling_features: vk::FormatFeatureFlags::empty(),
                    optimal_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                    buffer_features: vk::FormatFeatureFlags::empty(),
                }
            } else {
                vk::FormatProperties::default()
            }
        };
        let candidates = [vk::Format::D24_UNORM_S8_UINT, vk::Format::D32_SFLOAT];

        assert_eq!(
            select_supported_format(
                &candidates,
                vk::ImageTiling::OPTIMAL,
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                props
            ),
            Some(vk::Format::D32_SFLOAT)
        );
        assert_eq!(
            select_supported_format(
                &candidates,
                vk::ImageTiling::LINEAR,
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                props
            ),
            None
        );
    }
}
