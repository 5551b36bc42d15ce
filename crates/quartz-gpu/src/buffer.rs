//! Device buffers with host-visible write and read-back paths.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::lifecycle::{HardwareResource, Lifecycle};
use crate::memory::{check_range, DeviceMemory, MemoryOwner, DEVICE_MEMORY, HOST_MEMORY};
use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Creation descriptor of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: vk::MemoryPropertyFlags,
    pub flags: vk::BufferCreateFlags,
}

impl BufferDesc {
    /// Buffer of `size` bytes with the given usage and memory properties.
    pub fn new(size: u64, usage: vk::BufferUsageFlags, memory: vk::MemoryPropertyFlags) -> Self {
        Self {
            size,
            usage,
            memory,
            flags: vk::BufferCreateFlags::empty(),
        }
    }

    /// Host-visible source for transfers.
    pub fn staging(size: u64) -> Self {
        Self::new(size, vk::BufferUsageFlags::TRANSFER_SRC, HOST_MEMORY)
    }

    /// Host-visible uniform buffer.
    pub fn uniform(size: u64) -> Self {
        Self::new(size, vk::BufferUsageFlags::UNIFORM_BUFFER, HOST_MEMORY)
    }

    /// Device-local vertex buffer filled through transfers.
    pub fn vertex(size: u64) -> Self {
        Self::new(
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            DEVICE_MEMORY,
        )
    }

    /// Device-local index buffer filled through transfers.
    pub fn index(size: u64) -> Self {
        Self::new(
            size,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            DEVICE_MEMORY,
        )
    }

    /// Device-local storage buffer.
    pub fn storage(size: u64) -> Self {
        Self::new(
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::TRANSFER_SRC,
            DEVICE_MEMORY,
        )
    }

    /// Replace the memory properties.
    pub fn with_memory(mut self, memory: vk::MemoryPropertyFlags) -> Self {
        self.memory = memory;
        self
    }

    /// Add usage flags.
    pub fn with_usage(mut self, usage: vk::BufferUsageFlags) -> Self {
        self.usage |= usage;
        self
    }
}

/// A device buffer and its dedicated memory.
pub struct Buffer {
    device: Arc<Device>,
    desc: BufferDesc,
    handle: vk::Buffer,
    memory: Option<DeviceMemory>,
    host_lock: Mutex<()>,
    lifecycle: Lifecycle,
}

impl Buffer {
    /// Describe a buffer; nothing is created until [`HardwareResource::create_on_hardware`].
    pub fn new(device: Arc<Device>, identifier: impl Into<String>, desc: BufferDesc) -> Self {
        Self {
            device,
            desc,
            handle: vk::Buffer::null(),
            memory: None,
            host_lock: Mutex::new(()),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    /// Describe and create in one step.
    pub fn create(
        device: Arc<Device>,
        identifier: impl Into<String>,
        desc: BufferDesc,
    ) -> Result<Self> {
        let mut buffer = Self::new(device, identifier, desc);
        buffer.create_on_hardware()?;
        Ok(buffer)
    }

    /// Raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Creation descriptor.
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    /// Device owning this buffer.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Bound memory, once created.
    pub fn memory(&self) -> Option<&DeviceMemory> {
        self.memory.as_ref()
    }

    /// Whether the host can write the buffer directly.
    pub fn is_host_visible(&self) -> bool {
        self.desc
            .memory
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Change the size and rebuild the buffer. Contents are lost.
    pub fn resize(&mut self, size: u64) -> Result<()> {
        self.desc.size = size;
        self.recreate()
    }

    /// Map `len` bytes at `offset` for exclusive host access.
    ///
    /// The returned guard keeps the buffer's host lock until dropped.
    pub fn map_range(&self, offset: u64, len: u64) -> Result<MappedRange<'_>> {
        self.lifecycle.ensure_created()?;
        check_range(offset, len, self.desc.size)?;

        let guard = self.host_lock.lock();
        let base = self
            .memory
            .as_ref()
            .and_then(DeviceMemory::mapped_ptr)
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "Buffer '{}' is not host-visible",
                    self.lifecycle.identifier()
                ))
            })?;

        let len = usize::try_from(len)
            .map_err(|_| GpuError::Other("Mapped range exceeds address space".to_string()))?;
        let offset = usize::try_from(offset)
            .map_err(|_| GpuError::Other("Mapped offset exceeds address space".to_string()))?;

        Ok(MappedRange {
            _guard: guard,
            ptr: unsafe { base.as_ptr().add(offset) },
            len,
        })
    }

    /// Copy `bytes` into the buffer at `offset`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn write_data(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut range = self.map_range(offset, bytes.len() as u64)?;
        range.copy_from_slice(bytes);
        Ok(())
    }

    /// Copy plain-old-data values into the buffer at `offset`.
    pub fn write<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_data(offset, bytemuck::cast_slice(data))
    }

    /// Read `len` bytes back from `offset`.
    pub fn read_data(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let range = self.map_range(offset, len)?;
        Ok(range.to_vec())
    }

    /// Descriptor info covering `range` bytes at `offset`.
    pub fn descriptor_info(&self, offset: u64, range: u64) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.handle)
            .offset(offset)
            .range(range)
    }

    fn release(&mut self) {
        if let Some(mut memory) = self.memory.take() {
            if let Err(e) = memory.free() {
                tracing::error!(buffer = %self.lifecycle.identifier(), "Failed to free memory: {e}");
            }
        }
        if self.handle != vk::Buffer::null() {
            unsafe { self.device.raw().destroy_buffer(self.handle, None) };
            self.handle = vk::Buffer::null();
        }
    }
}

impl HardwareResource for Buffer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device.ensure_usable()?;

        if self.desc.size == 0 {
            return Err(GpuError::InvalidState(format!(
                "Buffer '{}' has zero size",
                self.lifecycle.identifier()
            )));
        }

        let info = vk::BufferCreateInfo::default()
            .size(self.desc.size)
            .usage(self.desc.usage)
            .flags(self.desc.flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        self.handle = unsafe { self.device.raw().create_buffer(&info, None) }.map_err(|e| {
            tracing::error!(buffer = %self.lifecycle.identifier(), "Unable to create buffer: {e}");
            self.device.observe(e.into())
        })?;

        let requirements = unsafe { self.device.raw().get_buffer_memory_requirements(self.handle) };

        let memory = match DeviceMemory::allocate(
            &self.device,
            self.lifecycle.identifier(),
            requirements,
            self.desc.memory,
            MemoryOwner::Buffer(self.handle),
        ) {
            Ok(memory) => memory,
            Err(e) => {
                tracing::error!(buffer = %self.lifecycle.identifier(), "Unable to allocate memory: {e}");
                self.release();
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .raw()
                .bind_buffer_memory(self.handle, memory.handle(), memory.offset())
        };
        self.memory = Some(memory);

        if let Err(e) = bound {
            tracing::error!(buffer = %self.lifecycle.identifier(), "Unable to bind memory: {e}");
            self.release();
            return Err(self.device.observe(e.into()));
        }

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::Buffer::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            self.release();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy buffer: {e}");
        }
    }
}

/// Exclusive host mapping of a buffer range.
///
/// Dereferences to the mapped bytes; the range is unmapped and the buffer's
/// host lock released on drop.
pub struct MappedRange<'a> {
    _guard: MutexGuard<'a, ()>,
    ptr: *mut u8,
    len: usize,
}

impl std::ops::Deref for MappedRange<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl std::ops::DerefMut for MappedRange<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_descriptors() {
        let staging = BufferDesc::staging(256);
        assert!(staging.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert_eq!(staging.memory, HOST_MEMORY);

        let vertex = BufferDesc::vertex(1024);
        assert!(vertex.usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert_eq!(vertex.memory, DEVICE_MEMORY);

        let readback = BufferDesc::storage(64)
            .with_memory(HOST_MEMORY | vk::MemoryPropertyFlags::HOST_CACHED)
            .with_usage(vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER);
        assert!(readback
            .usage
            .contains(vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER));
    }
}
