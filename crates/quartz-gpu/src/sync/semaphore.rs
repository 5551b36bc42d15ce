use crate::device::Device;
use crate::error::Result;
use crate::lifecycle::{HardwareResource, Lifecycle};
use ash::vk;
use std::sync::Arc;

/// GPU to GPU ordering primitive with no host-visible state.
pub struct Semaphore {
    device: Arc<Device>,
    handle: vk::Semaphore,
    lifecycle: Lifecycle,
}

impl Semaphore {
    /// Describe a binary semaphore.
    pub fn new(device: Arc<Device>, identifier: impl Into<String>) -> Self {
        Self {
            device,
            handle: vk::Semaphore::null(),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    /// Raw semaphore handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl HardwareResource for Semaphore {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device.ensure_usable()?;

        let info = vk::SemaphoreCreateInfo::default();
        self.handle = unsafe { self.device.raw().create_semaphore(&info, None) }.map_err(|e| {
            tracing::error!(semaphore = %self.lifecycle.identifier(), "Unable to create semaphore: {e}");
            self.device.observe(e.into())
        })?;

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::Semaphore::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            unsafe { self.device.raw().destroy_semaphore(self.handle, None) };
            self.handle = vk::Semaphore::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy semaphore: {e}");
        }
    }
}
