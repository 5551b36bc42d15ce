//! GPU memory management.
//!
//! Buffers and images each own one [`DeviceMemory`] block. Blocks come from
//! `gpu-allocator` with a dedicated allocation scheme so the binding between
//! a resource and its memory stays one-to-one.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;
use std::sync::Arc;

/// Allocator wrapper owned by the device.
pub struct MemoryAllocator {
    allocator: Option<Allocator>,
}

impl MemoryAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub(crate) unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
    }

    /// Allocate memory.
    pub(crate) fn allocate(&mut self, desc: &AllocationCreateDesc<'_>) -> Result<Allocation> {
        self.inner()?
            .allocate(desc)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Return memory to the allocator.
    pub(crate) fn free(&mut self, allocation: Allocation) -> Result<()> {
        self.inner()?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations are freed and logged as leaks.
    pub(crate) fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Map requested property flags onto an allocator location.
///
/// Host-visible requests land in host-visible coherent memory; cached host
/// memory is used for read-back. Everything else is device-local.
pub fn memory_location(properties: vk::MemoryPropertyFlags) -> MemoryLocation {
    if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        if properties.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
            MemoryLocation::GpuToCpu
        } else {
            MemoryLocation::CpuToGpu
        }
    } else {
        MemoryLocation::GpuOnly
    }
}

/// Host-visible and coherent memory, for staging and uniform data.
pub const HOST_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Device-local memory, for images and high-throughput buffers.
pub const DEVICE_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

/// What a block of memory will be bound to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MemoryOwner {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// Device memory bound to exactly one buffer or image.
pub struct DeviceMemory {
    device: Arc<Device>,
    allocation: Option<Allocation>,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
    memory_type_index: u32,
}

impl DeviceMemory {
    /// Allocate memory satisfying `requirements` with `properties`.
    ///
    /// The allocator picks the memory type; the block records the type it
    /// actually landed in and is rejected unless that type has every
    /// requested flag.
    pub(crate) fn allocate(
        device: &Arc<Device>,
        name: &str,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        owner: MemoryOwner,
    ) -> Result<Self> {
        let type_bits = requirements.memory_type_bits;
        let requested_type = device.find_memory_type(type_bits, properties)?;

        let (linear, allocation_scheme) = match owner {
            MemoryOwner::Buffer(buffer) => (true, AllocationScheme::DedicatedBuffer(buffer)),
            MemoryOwner::Image(image) => (false, AllocationScheme::DedicatedImage(image)),
        };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: memory_location(properties),
            linear,
            allocation_scheme,
        })?;

        let actual = allocation.memory_properties();
        if let Err(e) = check_properties(type_bits, actual, properties) {
            tracing::error!(resource = name, ?actual, requested = ?properties, "Allocation lacks requested memory properties");
            if let Err(free_error) = device.allocator().lock().free(allocation) {
                tracing::error!(resource = name, "Failed to free rejected allocation: {free_error}");
            }
            return Err(e);
        }
        let memory_type_index = device
            .allocated_memory_type(type_bits, actual)
            .unwrap_or(requested_type);

        tracing::trace!(
            resource = name,
            size = requirements.size,
            memory_type_index,
            "Allocated device memory"
        );

        Ok(Self {
            device: Arc::clone(device),
            allocation: Some(allocation),
            requirements,
            properties: actual,
            memory_type_index,
        })
    }

    /// Native memory handle.
    pub fn handle(&self) -> vk::DeviceMemory {
        self.allocation
            .as_ref()
            .map_or_else(vk::DeviceMemory::null, |allocation| unsafe {
                allocation.memory()
            })
    }

    /// Offset of this block inside the native memory object.
    pub fn offset(&self) -> u64 {
        self.allocation.as_ref().map_or(0, Allocation::offset)
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.requirements.size
    }

    /// Required alignment in bytes.
    pub fn alignment(&self) -> u64 {
        self.requirements.alignment
    }

    /// Property flags of the memory type backing the block.
    pub fn properties(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    /// Memory type index the block was allocated from.
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Whether the host can map this memory.
    pub fn is_host_visible(&self) -> bool {
        self.properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Host pointer to the start of the block, if mapped.
    pub(crate) fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(NonNull::cast)
    }

    /// Return the block to the allocator.
    pub(crate) fn free(&mut self) -> Result<()> {
        if let Some(allocation) = self.allocation.take() {
            self.device.allocator().lock().free(allocation)?;
        }
        Ok(())
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            tracing::error!("Failed to free device memory: {e}");
        }
    }
}

/// Fail unless memory with `actual` flags has every `requested` flag.
fn check_properties(
    type_bits: u32,
    actual: vk::MemoryPropertyFlags,
    requested: vk::MemoryPropertyFlags,
) -> Result<()> {
    if actual.contains(requested) {
        Ok(())
    } else {
        Err(GpuError::NoMemoryType {
            type_bits,
            flags: requested,
        })
    }
}

/// Check that `offset..offset + len` lies inside `size`.
pub(crate) fn check_range(offset: u64, len: u64, size: u64) -> Result<()> {
    let end = offset
        .checked_add(len)
        .ok_or(GpuError::OutOfBounds {
            offset,
            end: u64::MAX,
            size,
        })?;
    if end > size {
        return Err(GpuError::OutOfBounds { offset, end, size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locations_follow_property_flags() {
        assert_eq!(memory_location(HOST_MEMORY), MemoryLocation::CpuToGpu);
        assert_eq!(memory_location(DEVICE_MEMORY), MemoryLocation::GpuOnly);
        assert_eq!(
            memory_location(HOST_MEMORY | vk::MemoryPropertyFlags::HOST_CACHED),
            MemoryLocation::GpuToCpu
        );
    }

    #[test]
    fn host_memory_constant_is_visible_and_coherent() {
        assert!(HOST_MEMORY.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        assert!(HOST_MEMORY.contains(vk::MemoryPropertyFlags::HOST_COHERENT));
    }

    #[test]
    fn allocations_must_cover_requested_properties() {
        let coherent = HOST_MEMORY | vk::MemoryPropertyFlags::HOST_CACHED;
        assert!(check_properties(0b11, coherent, HOST_MEMORY).is_ok());
        assert!(check_properties(0b11, DEVICE_MEMORY | HOST_MEMORY, DEVICE_MEMORY).is_ok());
        assert!(matches!(
            check_properties(0b11, vk::MemoryPropertyFlags::HOST_VISIBLE, HOST_MEMORY),
            Err(GpuError::NoMemoryType { type_bits: 0b11, .. })
        ));
    }

    #[test]
    fn range_checks() {
        assert!(check_range(0, 4, 4).is_ok());
        assert!(check_range(60, 4, 64).is_ok());
        assert!(matches!(
            check_range(61, 4, 64),
            Err(GpuError::OutOfBounds { end: 65, .. })
        ));
        assert!(check_range(u64::MAX, 2, 64).is_err());
    }
}
