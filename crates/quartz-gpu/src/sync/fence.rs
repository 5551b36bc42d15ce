use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::lifecycle::{HardwareResource, Lifecycle};
use ash::vk;
use std::fmt;
use std::sync::Arc;

/// Timeout meaning "wait until signaled".
pub const WAIT_FOREVER: u64 = u64::MAX;

/// Host-visible state of a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// Signaled.
    Ready,
    /// Not signaled yet.
    Busy,
    /// The status query failed.
    Error,
}

impl fmt::Display for FenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Error => "error",
        };
        f.write_str(text)
    }
}

/// GPU to host synchronization primitive.
pub struct Fence {
    device: Arc<Device>,
    signaled: bool,
    handle: vk::Fence,
    lifecycle: Lifecycle,
}

impl Fence {
    /// Describe a fence, optionally created in the signaled state.
    pub fn new(device: Arc<Device>, identifier: impl Into<String>, signaled: bool) -> Self {
        Self {
            device,
            signaled,
            handle: vk::Fence::null(),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    /// Raw fence handle.
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Query the current status without blocking.
    pub fn status(&self) -> FenceStatus {
        if !self.lifecycle.is_created() {
            return FenceStatus::Error;
        }
        match unsafe { self.device.raw().get_fence_status(self.handle) } {
            Ok(true) => FenceStatus::Ready,
            Ok(false) => FenceStatus::Busy,
            Err(e) => {
                tracing::error!(fence = %self.lifecycle.identifier(), "Unable to query fence status: {e}");
                self.device.observe(e.into());
                FenceStatus::Error
            }
        }
    }

    /// Return the fence to the unsignaled state.
    pub fn reset(&self) -> Result<()> {
        self.lifecycle.ensure_created()?;
        unsafe { self.device.raw().reset_fences(&[self.handle]) }
            .map_err(|e| self.device.observe(e.into()))
    }

    /// Block until signaled or until `timeout_ns` elapses.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        self.lifecycle.ensure_created()?;
        let result = unsafe {
            self.device
                .raw()
                .wait_for_fences(&[self.handle], true, timeout_ns)
        };
        wait_outcome(result, timeout_ns).map_err(|e| self.device.observe(e))
    }

    /// Give up ownership of a fence that may still be in use.
    ///
    /// The handle is released without idling the device; whoever takes it
    /// must destroy it once it has signaled.
    pub(crate) fn into_pending(mut self) -> vk::Fence {
        let handle = std::mem::replace(&mut self.handle, vk::Fence::null());
        self.lifecycle.mark_destroyed();
        handle
    }

    /// Wait then reset.
    pub fn wait_and_reset(&self, timeout_ns: u64) -> Result<()> {
        self.wait(timeout_ns)?;
        self.reset()
    }

    /// Block until every fence is signaled.
    pub fn wait_all(fences: &[&Self], timeout_ns: u64) -> Result<()> {
        Self::wait_many(fences, true, timeout_ns)
    }

    /// Block until at least one fence is signaled.
    pub fn wait_any(fences: &[&Self], timeout_ns: u64) -> Result<()> {
        Self::wait_many(fences, false, timeout_ns)
    }

    fn wait_many(fences: &[&Self], wait_all: bool, timeout_ns: u64) -> Result<()> {
        let Some(first) = fences.first() else {
            return Ok(());
        };
        let handles = fences
            .iter()
            .map(|fence| {
                fence.lifecycle.ensure_created()?;
                Ok(fence.handle)
            })
            .collect::<Result<Vec<_>>>()?;

        let device = &first.device;
        let result = unsafe { device.raw().wait_for_fences(&handles, wait_all, timeout_ns) };
        wait_outcome(result, timeout_ns).map_err(|e| device.observe(e))
    }
}

/// Fences whose submission outlived a timed-out wait.
#[derive(Debug, Default)]
pub(crate) struct PendingFences {
    handles: Vec<vk::Fence>,
}

impl PendingFences {
    pub(crate) fn park(&mut self, fence: vk::Fence) {
        if fence != vk::Fence::null() {
            self.handles.push(fence);
        }
    }

    /// Remove and return every fence `is_done` reports as finished.
    pub(crate) fn retire(&mut self, mut is_done: impl FnMut(vk::Fence) -> bool) -> Vec<vk::Fence> {
        let (done, pending): (Vec<_>, Vec<_>) = self.handles.drain(..).partition(|&fence| is_done(fence));
        self.handles = pending;
        done
    }

    /// Remove every fence regardless of state.
    pub(crate) fn drain(&mut self) -> Vec<vk::Fence> {
        std::mem::take(&mut self.handles)
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }
}

/// Translate a fence wait result; a timeout is a failure, never success.
fn wait_outcome(result: ash::prelude::VkResult<()>, timeout_ns: u64) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout(timeout_ns)),
        Err(e) => Err(e.into()),
    }
}

impl HardwareResource for Fence {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device.ensure_usable()?;

        let flags = if self.signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);

        self.handle = unsafe { self.device.raw().create_fence(&info, None) }.map_err(|e| {
            tracing::error!(fence = %self.lifecycle.identifier(), "Unable to create fence: {e}");
            self.device.observe(e.into())
        })?;

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::Fence::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            unsafe { self.device.raw().destroy_fence(self.handle, None) };
            self.handle = vk::Fence::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy fence: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn pending_fences_retire_only_finished_ones() {
        let mut pending = PendingFences::default();
        pending.park(vk::Fence::null());
        assert_eq!(pending.len(), 0);

        for raw in 1..=3 {
            pending.park(vk::Fence::from_raw(raw));
        }
        let retired = pending.retire(|fence| fence.as_raw() != 2);
        assert_eq!(retired, [vk::Fence::from_raw(1), vk::Fence::from_raw(3)]);
        assert_eq!(pending.len(), 1);

        assert!(pending.retire(|_| false).is_empty());
        assert_eq!(pending.drain(), [vk::Fence::from_raw(2)]);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn timeout_is_reported_as_failure() {
        let err = wait_outcome(Err(vk::Result::TIMEOUT), 1_000).unwrap_err();
        assert!(matches!(err, GpuError::Timeout(1_000)));
    }

    #[test]
    fn device_loss_propagates() {
        let err = wait_outcome(Err(vk::Result::ERROR_DEVICE_LOST), 0).unwrap_err();
        assert!(err.is_device_lost());
        assert!(wait_outcome(Ok(()), 0).is_ok());
    }

    #[test]
    fn status_display() {
        assert_eq!(FenceStatus::Busy.to_string(), "busy");
    }
}
