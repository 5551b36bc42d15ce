use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::lifecycle::{HardwareResource, Lifecycle};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Command pool bound to one queue family.
///
/// Allocation and free go through a pool-local mutex.
pub struct CommandPool {
    device: Arc<Device>,
    queue_family: u32,
    flags: vk::CommandPoolCreateFlags,
    handle: vk::CommandPool,
    allocation: Mutex<()>,
    lifecycle: Lifecycle,
}

impl CommandPool {
    /// Describe a pool for `queue_family`.
    pub fn new(
        device: Arc<Device>,
        identifier: impl Into<String>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Self {
        Self {
            device,
            queue_family,
            flags,
            handle: vk::CommandPool::null(),
            allocation: Mutex::new(()),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    /// Describe, create and share a pool in one step.
    pub fn create(
        device: Arc<Device>,
        identifier: impl Into<String>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Arc<Self>> {
        let mut pool = Self::new(device, identifier, queue_family, flags);
        pool.create_on_hardware()?;
        Ok(Arc::new(pool))
    }

    /// Raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    /// Queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Device owning the pool.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Whether buffers from this pool may be reset one at a time.
    pub fn allows_individual_reset(&self) -> bool {
        self.flags
            .contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
    }

    pub(crate) fn allocate(&self, level: vk::CommandBufferLevel) -> Result<vk::CommandBuffer> {
        self.lifecycle.ensure_created()?;

        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.handle)
            .level(level)
            .command_buffer_count(1);

        let buffers = {
            let _allocation = self.allocation.lock();
            unsafe { self.device.raw().allocate_command_buffers(&info) }
        }
        .map_err(|e| {
            tracing::error!(pool = %self.lifecycle.identifier(), "Unable to allocate command buffer: {e}");
            self.device.observe(e.into())
        })?;

        buffers.first().copied().ok_or_else(|| {
            GpuError::Other(format!(
                "Pool '{}' returned no command buffer",
                self.lifecycle.identifier()
            ))
        })
    }

    pub(crate) fn free(&self, command_buffer: vk::CommandBuffer, owner: &str) {
        if !self.lifecycle.is_created() {
            return;
        }
        self.device.wait_idle_before_destroy(owner);
        let _allocation = self.allocation.lock();
        unsafe {
            self.device
                .raw()
                .free_command_buffers(self.handle, &[command_buffer]);
        }
    }

    /// Reset every buffer allocated from this pool.
    ///
    /// No buffer from the pool may be pending.
    pub fn reset(&self, flags: vk::CommandPoolResetFlags) -> Result<()> {
        self.lifecycle.ensure_created()?;
        let _allocation = self.allocation.lock();
        unsafe { self.device.raw().reset_command_pool(self.handle, flags) }
            .map_err(|e| self.device.observe(e.into()))
    }
}

impl HardwareResource for CommandPool {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device.ensure_usable()?;

        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family)
            .flags(self.flags);

        self.handle = unsafe { self.device.raw().create_command_pool(&info, None) }.map_err(|e| {
            tracing::error!(pool = %self.lifecycle.identifier(), "Unable to create command pool: {e}");
            self.device.observe(e.into())
        })?;

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::CommandPool::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            unsafe { self.device.raw().destroy_command_pool(self.handle, None) };
            self.handle = vk::CommandPool::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy command pool: {e}");
        }
    }
}
