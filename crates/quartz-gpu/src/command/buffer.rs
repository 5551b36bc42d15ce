use super::pool::CommandPool;
use super::state::{CommandBufferState, StateEvent};
use crate::buffer::Buffer;
use crate::descriptors::DescriptorSet;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::image::Image;
use crate::lifecycle::{HardwareResource, Lifecycle};
use crate::pipeline::{Pipeline, PipelineLayout};
use crate::queue::{Queue, SubmitBatch};
use crate::render_pass::{Framebuffer, RenderPass};
use crate::sync::{Event, PipelineBarrier, WAIT_FOREVER};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// A primary or secondary command buffer allocated from one pool.
///
/// Recording wrappers check in debug builds that the buffer is recording
/// and every referenced resource is created; a failed check logs an error
/// and records nothing.
pub struct CommandBuffer {
    pool: Arc<CommandPool>,
    level: vk::CommandBufferLevel,
    handle: vk::CommandBuffer,
    state: Mutex<CommandBufferState>,
    lifecycle: Lifecycle,
}

impl CommandBuffer {
    /// Describe a command buffer drawn from `pool`.
    pub fn new(
        pool: Arc<CommandPool>,
        identifier: impl Into<String>,
        level: vk::CommandBufferLevel,
    ) -> Self {
        Self {
            pool,
            level,
            handle: vk::CommandBuffer::null(),
            state: Mutex::new(CommandBufferState::Initial),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    /// Allocate a primary command buffer in one step.
    pub fn primary(pool: Arc<CommandPool>, identifier: impl Into<String>) -> Result<Self> {
        let mut command_buffer = Self::new(pool, identifier, vk::CommandBufferLevel::PRIMARY);
        command_buffer.create_on_hardware()?;
        Ok(command_buffer)
    }

    /// Raw command buffer handle.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Primary or secondary.
    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    /// Pool the buffer was allocated from.
    pub fn pool(&self) -> &Arc<CommandPool> {
        &self.pool
    }

    /// Current recording state.
    pub fn state(&self) -> CommandBufferState {
        *self.state.lock()
    }

    fn device(&self) -> &Arc<Device> {
        self.pool.device()
    }

    fn transition(&self, event: StateEvent) -> Result<()> {
        let mut state = self.state.lock();
        let next = state
            .apply(event, self.pool.allows_individual_reset())
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "Command buffer '{}' cannot {event:?} while {}",
                    self.lifecycle.identifier(),
                    *state
                ))
            })?;
        *state = next;
        Ok(())
    }

    /// Start recording a primary buffer.
    pub fn begin(&self, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        self.begin_with(&info)
    }

    /// Start recording a secondary buffer that continues `subpass` of `render_pass`.
    pub fn begin_secondary(
        &self,
        render_pass: &RenderPass,
        subpass: u32,
        framebuffer: Option<&Framebuffer>,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        render_pass.lifecycle().ensure_created()?;
        let inheritance = vk::CommandBufferInheritanceInfo::default()
            .render_pass(render_pass.handle())
            .subpass(subpass)
            .framebuffer(framebuffer.map_or_else(vk::Framebuffer::null, Framebuffer::handle));
        let info = vk::CommandBufferBeginInfo::default()
            .flags(flags | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE)
            .inheritance_info(&inheritance);
        self.begin_with(&info)
    }

    fn begin_with(&self, info: &vk::CommandBufferBeginInfo<'_>) -> Result<()> {
        self.lifecycle.ensure_created()?;
        self.transition(StateEvent::Begin)?;
        unsafe { self.device().raw().begin_command_buffer(self.handle, info) }.map_err(|e| {
            *self.state.lock() = CommandBufferState::Initial;
            tracing::error!(command_buffer = %self.lifecycle.identifier(), "Unable to begin recording: {e}");
            self.device().observe(e.into())
        })
    }

    /// Finish recording.
    pub fn end(&self) -> Result<()> {
        self.lifecycle.ensure_created()?;
        self.transition(StateEvent::End)?;
        unsafe { self.device().raw().end_command_buffer(self.handle) }.map_err(|e| {
            *self.state.lock() = CommandBufferState::Initial;
            tracing::error!(command_buffer = %self.lifecycle.identifier(), "Unable to end recording: {e}");
            self.device().observe(e.into())
        })
    }

    /// Return to the initial state. The pool must allow individual resets.
    pub fn reset(&self) -> Result<()> {
        self.lifecycle.ensure_created()?;
        self.transition(StateEvent::Reset)?;
        unsafe {
            self.device()
                .raw()
                .reset_command_buffer(self.handle, vk::CommandBufferResetFlags::empty())
        }
        .map_err(|e| self.device().observe(e.into()))
    }

    /// Fail unless the buffer can be submitted.
    pub fn ensure_executable(&self) -> Result<()> {
        self.lifecycle.ensure_created()?;
        let state = self.state();
        if state == CommandBufferState::Executable {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "Command buffer '{}' is {state}, not executable",
                self.lifecycle.identifier()
            )))
        }
    }

    pub(crate) fn mark_pending(&self) {
        if let Err(e) = self.transition(StateEvent::Submit) {
            tracing::warn!("{e}");
        }
    }

    pub(crate) fn mark_complete(&self) {
        if let Err(e) = self.transition(StateEvent::Complete) {
            tracing::warn!("{e}");
        }
    }

    /// Declare that a submission waited on elsewhere has finished.
    pub fn complete(&self) {
        self.mark_complete();
    }

    /// Record with `record`, submit to `queue` and block until done.
    pub fn submit_once<F>(&self, queue: &Queue, record: F) -> Result<()>
    where
        F: FnOnce(&Self) -> Result<()>,
    {
        self.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        if let Err(e) = record(self) {
            self.discard_recording();
            return Err(e);
        }
        self.end()?;
        queue.submit_and_wait(&SubmitBatch::single(self), WAIT_FOREVER)
    }

    /// Close a failed recording and reset it when the pool allows it.
    fn discard_recording(&self) {
        let closed = self.end().and_then(|()| {
            if self.pool.allows_individual_reset() {
                self.reset()
            } else {
                Ok(())
            }
        });
        if let Err(e) = closed {
            tracing::warn!(
                command_buffer = %self.lifecycle.identifier(),
                "Unable to discard failed recording: {e}"
            );
        }
    }

    /// Handle to record into, or `None` after logging why not.
    fn recording(&self, operation: &'static str, resources: &[&Lifecycle]) -> Option<vk::CommandBuffer> {
        if cfg!(debug_assertions) {
            if !self.lifecycle.is_created() {
                tracing::error!(operation, command_buffer = %self.lifecycle.identifier(), "Command buffer is not created");
                return None;
            }
            let state = self.state();
            if state != CommandBufferState::Recording {
                tracing::error!(operation, command_buffer = %self.lifecycle.identifier(), %state, "Command buffer is not recording");
                return None;
            }
            if let Some(missing) = resources.iter().find(|lifecycle| !lifecycle.is_created()) {
                tracing::error!(operation, resource = %missing.identifier(), "Resource is not created");
                return None;
            }
        }
        Some(self.handle)
    }

    // Render passes

    pub fn begin_render_pass(
        &self,
        render_pass: &RenderPass,
        framebuffer: &Framebuffer,
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    ) {
        let Some(cmd) = self.recording(
            "begin_render_pass",
            &[render_pass.lifecycle(), framebuffer.lifecycle()],
        ) else {
            return;
        };
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass.handle())
            .framebuffer(framebuffer.handle())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: framebuffer.extent(),
            })
            .clear_values(clear_values);
        unsafe { self.device().raw().cmd_begin_render_pass(cmd, &info, contents) };
    }

    pub fn next_subpass(&self, contents: vk::SubpassContents) {
        if let Some(cmd) = self.recording("next_subpass", &[]) {
            unsafe { self.device().raw().cmd_next_subpass(cmd, contents) };
        }
    }

    pub fn end_render_pass(&self) {
        if let Some(cmd) = self.recording("end_render_pass", &[]) {
            unsafe { self.device().raw().cmd_end_render_pass(cmd) };
        }
    }

    /// Run secondary buffers inside the current render pass.
    pub fn execute_commands(&self, secondaries: &[&Self]) {
        let lifecycles: Vec<&Lifecycle> = secondaries.iter().map(|cb| &cb.lifecycle).collect();
        let Some(cmd) = self.recording("execute_commands", &lifecycles) else {
            return;
        };
        let handles: Vec<vk::CommandBuffer> = secondaries.iter().map(|cb| cb.handle).collect();
        unsafe { self.device().raw().cmd_execute_commands(cmd, &handles) };
    }

    // Binding

    pub fn bind_pipeline<P: Pipeline>(&self, pipeline: &P) {
        if let Some(cmd) = self.recording("bind_pipeline", &[pipeline.lifecycle()]) {
            unsafe {
                self.device()
                    .raw()
                    .cmd_bind_pipeline(cmd, pipeline.bind_point(), pipeline.handle());
            }
        }
    }

    /// Bind `buffers` with their byte offsets starting at `first_binding`.
    pub fn bind_vertex_buffers(&self, first_binding: u32, buffers: &[(&Buffer, u64)]) {
        let lifecycles: Vec<&Lifecycle> = buffers.iter().map(|(buffer, _)| buffer.lifecycle()).collect();
        let Some(cmd) = self.recording("bind_vertex_buffers", &lifecycles) else {
            return;
        };
        let handles: Vec<vk::Buffer> = buffers.iter().map(|(buffer, _)| buffer.handle()).collect();
        let offsets: Vec<u64> = buffers.iter().map(|(_, offset)| *offset).collect();
        unsafe {
            self.device()
                .raw()
                .cmd_bind_vertex_buffers(cmd, first_binding, &handles, &offsets);
        }
    }

    pub fn bind_index_buffer(&self, buffer: &Buffer, offset: u64, index_type: vk::IndexType) {
        if let Some(cmd) = self.recording("bind_index_buffer", &[buffer.lifecycle()]) {
            unsafe {
                self.device()
                    .raw()
                    .cmd_bind_index_buffer(cmd, buffer.handle(), offset, index_type);
            }
        }
    }

    /// Bind descriptor sets, with one dynamic offset per dynamic binding.
    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: &PipelineLayout,
        first_set: u32,
        sets: &[&DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        let mut lifecycles: Vec<&Lifecycle> = sets.iter().map(|set| set.lifecycle()).collect();
        lifecycles.push(layout.lifecycle());
        let Some(cmd) = self.recording("bind_descriptor_sets", &lifecycles) else {
            return;
        };
        let handles: Vec<vk::DescriptorSet> = sets.iter().map(|set| set.handle()).collect();
        unsafe {
            self.device().raw().cmd_bind_descriptor_sets(
                cmd,
                bind_point,
                layout.handle(),
                first_set,
                &handles,
                dynamic_offsets,
            );
        }
    }

    pub fn push_constants(
        &self,
        layout: &PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        if let Some(cmd) = self.recording("push_constants", &[layout.lifecycle()]) {
            unsafe {
                self.device()
                    .raw()
                    .cmd_push_constants(cmd, layout.handle(), stages, offset, data);
            }
        }
    }

    // Dynamic state

    pub fn set_viewport(&self, viewport: vk::Viewport) {
        if let Some(cmd) = self.recording("set_viewport", &[]) {
            unsafe { self.device().raw().cmd_set_viewport(cmd, 0, &[viewport]) };
        }
    }

    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        if let Some(cmd) = self.recording("set_scissor", &[]) {
            unsafe { self.device().raw().cmd_set_scissor(cmd, 0, &[scissor]) };
        }
    }

    pub fn set_line_width(&self, width: f32) {
        if let Some(cmd) = self.recording("set_line_width", &[]) {
            unsafe { self.device().raw().cmd_set_line_width(cmd, width) };
        }
    }

    pub fn set_depth_bias(&self, constant: f32, clamp: f32, slope: f32) {
        if let Some(cmd) = self.recording("set_depth_bias", &[]) {
            unsafe { self.device().raw().cmd_set_depth_bias(cmd, constant, clamp, slope) };
        }
    }

    pub fn set_blend_constants(&self, constants: [f32; 4]) {
        if let Some(cmd) = self.recording("set_blend_constants", &[]) {
            unsafe { self.device().raw().cmd_set_blend_constants(cmd, &constants) };
        }
    }

    // Draw and dispatch

    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        if let Some(cmd) = self.recording("draw", &[]) {
            unsafe {
                self.device()
                    .raw()
                    .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance);
            }
        }
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        if let Some(cmd) = self.recording("draw_indexed", &[]) {
            unsafe {
                self.device().raw().cmd_draw_indexed(
                    cmd,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                );
            }
        }
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) {
        if let Some(cmd) = self.recording("dispatch", &[]) {
            unsafe { self.device().raw().cmd_dispatch(cmd, x, y, z) };
        }
    }

    // Transfers

    /// Inline update of at most 65536 bytes.
    pub fn update_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) {
        if let Some(cmd) = self.recording("update_buffer", &[buffer.lifecycle()]) {
            unsafe {
                self.device()
                    .raw()
                    .cmd_update_buffer(cmd, buffer.handle(), offset, data);
            }
        }
    }

    pub fn fill_buffer(&self, buffer: &Buffer, offset: u64, size: u64, value: u32) {
        if let Some(cmd) = self.recording("fill_buffer", &[buffer.lifecycle()]) {
            unsafe {
                self.device()
                    .raw()
                    .cmd_fill_buffer(cmd, buffer.handle(), offset, size, value);
            }
        }
    }

    pub fn copy_buffer(&self, src: &Buffer, dst: &Buffer, regions: &[vk::BufferCopy]) {
        if let Some(cmd) = self.recording("copy_buffer", &[src.lifecycle(), dst.lifecycle()]) {
            unsafe {
                self.device()
                    .raw()
                    .cmd_copy_buffer(cmd, src.handle(), dst.handle(), regions);
            }
        }
    }

    pub fn copy_buffer_to_image(
        &self,
        src: &Buffer,
        dst: &Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        if let Some(cmd) = self.recording("copy_buffer_to_image", &[src.lifecycle(), dst.lifecycle()]) {
            unsafe {
                self.device()
                    .raw()
                    .cmd_copy_buffer_to_image(cmd, src.handle(), dst.handle(), layout, regions);
            }
        }
    }

    pub fn copy_image_to_buffer(
        &self,
        src: &Image,
        layout: vk::ImageLayout,
        dst: &Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        if let Some(cmd) = self.recording("copy_image_to_buffer", &[src.lifecycle(), dst.lifecycle()]) {
            unsafe {
                self.device()
                    .raw()
                    .cmd_copy_image_to_buffer(cmd, src.handle(), layout, dst.handle(), regions);
            }
        }
    }

    pub fn copy_image(
        &self,
        src: &Image,
        src_layout: vk::ImageLayout,
        dst: &Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        if let Some(cmd) = self.recording("copy_image", &[src.lifecycle(), dst.lifecycle()]) {
            unsafe {
                self.device().raw().cmd_copy_image(
                    cmd,
                    src.handle(),
                    src_layout,
                    dst.handle(),
                    dst_layout,
                    regions,
                );
            }
        }
    }

    pub fn blit_image(
        &self,
        src: &Image,
        src_layout: vk::ImageLayout,
        dst: &Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        if let Some(cmd) = self.recording("blit_image", &[src.lifecycle(), dst.lifecycle()]) {
            unsafe {
                self.device().raw().cmd_blit_image(
                    cmd,
                    src.handle(),
                    src_layout,
                    dst.handle(),
                    dst_layout,
                    regions,
                    filter,
                );
            }
        }
    }

    pub fn clear_color_image(
        &self,
        image: &Image,
        layout: vk::ImageLayout,
        color: vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        if let Some(cmd) = self.recording("clear_color_image", &[image.lifecycle()]) {
            unsafe {
                self.device()
                    .raw()
                    .cmd_clear_color_image(cmd, image.handle(), layout, &color, ranges);
            }
        }
    }

    pub fn clear_depth_stencil_image(
        &self,
        image: &Image,
        layout: vk::ImageLayout,
        value: vk::ClearDepthStencilValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        if let Some(cmd) = self.recording("clear_depth_stencil_image", &[image.lifecycle()]) {
            unsafe {
                self.device()
                    .raw()
                    .cmd_clear_depth_stencil_image(cmd, image.handle(), layout, &value, ranges);
            }
        }
    }

    // Synchronization

    pub fn pipeline_barrier(&self, barrier: &PipelineBarrier) {
        let Some(cmd) = self.recording("pipeline_barrier", &[]) else {
            return;
        };
        let memory: Vec<_> = barrier.memory.iter().map(|b| b.raw()).collect();
        let buffers: Vec<_> = barrier.buffers.iter().map(|b| b.raw()).collect();
        let images: Vec<_> = barrier.images.iter().map(|b| b.raw()).collect();
        unsafe {
            self.device().raw().cmd_pipeline_barrier(
                cmd,
                barrier.src_stage,
                barrier.dst_stage,
                barrier.dependency,
                &memory,
                &buffers,
                &images,
            );
        }
    }

    pub fn set_event(&self, event: &Event, stage: vk::PipelineStageFlags) {
        if let Some(cmd) = self.recording("set_event", &[event.lifecycle()]) {
            unsafe { self.device().raw().cmd_set_event(cmd, event.handle(), stage) };
        }
    }

    pub fn reset_event(&self, event: &Event, stage: vk::PipelineStageFlags) {
        if let Some(cmd) = self.recording("reset_event", &[event.lifecycle()]) {
            unsafe { self.device().raw().cmd_reset_event(cmd, event.handle(), stage) };
        }
    }

    /// Wait on `events` then apply the barriers carried by `barrier`.
    pub fn wait_events(&self, events: &[&Event], barrier: &PipelineBarrier) {
        let lifecycles: Vec<&Lifecycle> = events.iter().map(|event| event.lifecycle()).collect();
        let Some(cmd) = self.recording("wait_events", &lifecycles) else {
            return;
        };
        let handles: Vec<vk::Event> = events.iter().map(|event| event.handle()).collect();
        let memory: Vec<_> = barrier.memory.iter().map(|b| b.raw()).collect();
        let buffers: Vec<_> = barrier.buffers.iter().map(|b| b.raw()).collect();
        let images: Vec<_> = barrier.images.iter().map(|b| b.raw()).collect();
        unsafe {
            self.device().raw().cmd_wait_events(
                cmd,
                &handles,
                barrier.src_stage,
                barrier.dst_stage,
                &memory,
                &buffers,
                &images,
            );
        }
    }
}

impl HardwareResource for CommandBuffer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device().ensure_usable()?;

        self.handle = self.pool.allocate(self.level).map_err(|e| {
            tracing::error!(command_buffer = %self.lifecycle.identifier(), "Unable to allocate: {e}");
            e
        })?;
        *self.state.lock() = CommandBufferState::Initial;

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::CommandBuffer::null() {
            self.pool.free(self.handle, self.lifecycle.identifier());
            self.handle = vk::CommandBuffer::null();
            *self.state.lock() = CommandBufferState::Initial;
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to free command buffer: {e}");
        }
    }
}
