use crate::device::Device;
use crate::error::Result;
use crate::lifecycle::{HardwareResource, Lifecycle};
use ash::vk;
use std::sync::Arc;

/// Binary flag that the host or a command buffer can set and reset.
pub struct Event {
    device: Arc<Device>,
    handle: vk::Event,
    lifecycle: Lifecycle,
}

impl Event {
    /// Describe an event.
    pub fn new(device: Arc<Device>, identifier: impl Into<String>) -> Self {
        Self {
            device,
            handle: vk::Event::null(),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    /// Raw event handle.
    pub fn handle(&self) -> vk::Event {
        self.handle
    }

    /// Set the event from the host.
    pub fn set(&self) -> Result<()> {
        self.lifecycle.ensure_created()?;
        unsafe { self.device.raw().set_event(self.handle) }.map_err(|e| self.device.observe(e.into()))
    }

    /// Reset the event from the host.
    pub fn reset(&self) -> Result<()> {
        self.lifecycle.ensure_created()?;
        unsafe { self.device.raw().reset_event(self.handle) }
            .map_err(|e| self.device.observe(e.into()))
    }

    /// Whether the event is currently set.
    pub fn is_set(&self) -> Result<bool> {
        self.lifecycle.ensure_created()?;
        unsafe { self.device.raw().get_event_status(self.handle) }
            .map_err(|e| self.device.observe(e.into()))
    }
}

impl HardwareResource for Event {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device.ensure_usable()?;

        let info = vk::EventCreateInfo::default();
        self.handle = unsafe { self.device.raw().create_event(&info, None) }.map_err(|e| {
            tracing::error!(event = %self.lifecycle.identifier(), "Unable to create event: {e}");
            self.device.observe(e.into())
        })?;

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::Event::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            unsafe { self.device.raw().destroy_event(self.handle, None) };
            self.handle = vk::Event::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy event: {e}");
        }
    }
}
