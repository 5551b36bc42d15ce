//! Device queues and work submission.

use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::lifecycle::HardwareResource;
use crate::sync::{Fence, Semaphore};
use ash::vk;
use std::sync::Arc;

/// Kind of work a queue is selected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

/// A semaphore wait with the stages that must not start before it signals.
pub struct SemaphoreWait<'a> {
    pub semaphore: &'a Semaphore,
    pub stages: vk::PipelineStageFlags,
}

/// One batch of work for [`Queue::submit`].
#[derive(Default)]
pub struct SubmitBatch<'a> {
    pub command_buffers: Vec<&'a CommandBuffer>,
    pub wait: Vec<SemaphoreWait<'a>>,
    pub signal: Vec<&'a Semaphore>,
}

impl<'a> SubmitBatch<'a> {
    /// Batch containing a single command buffer.
    pub fn single(command_buffer: &'a CommandBuffer) -> Self {
        Self {
            command_buffers: vec![command_buffer],
            ..Self::default()
        }
    }

    /// Wait on `semaphore` before `stages` run.
    pub fn wait_on(mut self, semaphore: &'a Semaphore, stages: vk::PipelineStageFlags) -> Self {
        self.wait.push(SemaphoreWait { semaphore, stages });
        self
    }

    /// Signal `semaphore` when the batch completes.
    pub fn signal(mut self, semaphore: &'a Semaphore) -> Self {
        self.signal.push(semaphore);
        self
    }
}

/// A device queue.
#[derive(Clone)]
pub struct Queue {
    device: Arc<Device>,
    kind: QueueKind,
    family: u32,
    handle: vk::Queue,
}

impl Queue {
    pub(crate) fn new(device: Arc<Device>, kind: QueueKind, family: u32, handle: vk::Queue) -> Self {
        Self {
            device,
            kind,
            family,
            handle,
        }
    }

    /// Raw queue handle.
    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    /// Queue family index.
    pub fn family(&self) -> u32 {
        self.family
    }

    /// Kind of work this queue was selected for.
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Submit a batch; `fence` is signaled on completion.
    ///
    /// Every command buffer must be executable. Submissions from all threads
    /// go through the device submission lock.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn submit(&self, batch: &SubmitBatch<'_>, fence: Option<&Fence>) -> Result<()> {
        self.device.ensure_usable()?;

        for command_buffer in &batch.command_buffers {
            command_buffer.ensure_executable()?;
        }
        for wait in &batch.wait {
            wait.semaphore.lifecycle().ensure_created()?;
        }
        for semaphore in &batch.signal {
            semaphore.lifecycle().ensure_created()?;
        }
        let fence_handle = match fence {
            Some(fence) => {
                fence.lifecycle().ensure_created()?;
                fence.handle()
            }
            None => vk::Fence::null(),
        };

        let command_buffers: Vec<vk::CommandBuffer> = batch
            .command_buffers
            .iter()
            .map(|command_buffer| command_buffer.handle())
            .collect();
        let wait_semaphores: Vec<vk::Semaphore> =
            batch.wait.iter().map(|wait| wait.semaphore.handle()).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            batch.wait.iter().map(|wait| wait.stages).collect();
        let signal_semaphores: Vec<vk::Semaphore> =
            batch.signal.iter().map(|semaphore| semaphore.handle()).collect();

        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores);

        {
            let _submission = self.device.lock_submission();
            unsafe {
                self.device
                    .raw()
                    .queue_submit(self.handle, &[submit_info], fence_handle)
            }
            .map_err(|e| {
                tracing::error!(queue = ?self.kind, "Queue submission failed: {e}");
                self.device.observe(e.into())
            })?;
        }

        for command_buffer in &batch.command_buffers {
            command_buffer.mark_pending();
        }

        Ok(())
    }

    /// Submit a batch and block until it completes or `timeout_ns` elapses.
    ///
    /// On timeout the command buffers stay pending and the fence is kept by
    /// the device until it signals, so the call never blocks past the
    /// timeout. Call [`CommandBuffer::complete`] once the work is known to
    /// have finished.
    pub fn submit_and_wait(&self, batch: &SubmitBatch<'_>, timeout_ns: u64) -> Result<()> {
        self.device.retire_fences();

        let mut fence = Fence::new(Arc::clone(&self.device), "submit-and-wait", false);
        fence.create_on_hardware()?;

        self.submit(batch, Some(&fence))?;
        match fence.wait(timeout_ns) {
            Ok(()) => {
                for command_buffer in &batch.command_buffers {
                    command_buffer.mark_complete();
                }
                fence.destroy_from_hardware()
            }
            Err(GpuError::Timeout(elapsed)) => {
                tracing::warn!(queue = ?self.kind, timeout_ns, "Submission still running after timeout");
                self.device.park_fence(fence.into_pending());
                Err(GpuError::Timeout(elapsed))
            }
            Err(e) => Err(e),
        }
    }

    /// Block until the queue has no pending work.
    pub fn wait_idle(&self) -> Result<()> {
        let _submission = self.device.lock_submission();
        unsafe { self.device.raw().queue_wait_idle(self.handle) }
            .map_err(|e| self.device.observe(e.into()))
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("kind", &self.kind)
            .field("family", &self.family)
            .field("handle", &self.handle)
            .finish()
    }
}
