//! Single-subpass render passes and their framebuffers.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::image::ImageView;
use crate::lifecycle::{HardwareResource, Lifecycle};
use ash::vk;
use std::sync::Arc;

/// One attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl AttachmentDesc {
    /// Cleared color target, sampled afterwards.
    pub fn color(format: vk::Format) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Cleared depth target, discarded afterwards.
    pub fn depth(format: vk::Format) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    }

    /// Keep previous contents instead of clearing.
    pub fn load(mut self, layout: vk::ImageLayout) -> Self {
        self.load_op = vk::AttachmentLoadOp::LOAD;
        self.initial_layout = layout;
        self
    }

    pub fn with_final_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.final_layout = layout;
        self
    }

    fn raw(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::default()
            .format(self.format)
            .samples(self.samples)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
    }
}

/// Attachments of a single-subpass render pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderPassDesc {
    pub color_attachments: Vec<AttachmentDesc>,
    pub depth_attachment: Option<AttachmentDesc>,
}

impl RenderPassDesc {
    pub fn with_color(mut self, attachment: AttachmentDesc) -> Self {
        self.color_attachments.push(attachment);
        self
    }

    pub fn with_depth(mut self, attachment: AttachmentDesc) -> Self {
        self.depth_attachment = Some(attachment);
        self
    }

    /// Total attachments, color first then depth.
    pub fn attachment_count(&self) -> usize {
        self.color_attachments.len() + usize::from(self.depth_attachment.is_some())
    }

    /// Subpass references: color attachments by position, depth last.
    fn references(&self) -> (Vec<vk::AttachmentReference>, Option<vk::AttachmentReference>) {
        let color = (0u32..)
            .take(self.color_attachments.len())
            .map(|attachment| {
                vk::AttachmentReference::default()
                    .attachment(attachment)
                    .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            })
            .collect::<Vec<_>>();
        let depth = self.depth_attachment.map(|_| {
            vk::AttachmentReference::default()
                .attachment(u32::try_from(self.color_attachments.len()).unwrap_or(u32::MAX))
                .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        });
        (color, depth)
    }
}

/// A render pass with one graphics subpass.
pub struct RenderPass {
    device: Arc<Device>,
    desc: RenderPassDesc,
    handle: vk::RenderPass,
    lifecycle: Lifecycle,
}

impl RenderPass {
    pub fn new(device: Arc<Device>, identifier: impl Into<String>, desc: RenderPassDesc) -> Self {
        Self {
            device,
            desc,
            handle: vk::RenderPass::null(),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    pub fn create(device: Arc<Device>, identifier: impl Into<String>, desc: RenderPassDesc) -> Result<Self> {
        let mut render_pass = Self::new(device, identifier, desc);
        render_pass.create_on_hardware()?;
        Ok(render_pass)
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }
}

impl HardwareResource for RenderPass {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device.ensure_usable()?;

        if self.desc.attachment_count() == 0 {
            return Err(GpuError::InvalidState(format!(
                "Render pass '{}' has no attachments",
                self.lifecycle.identifier()
            )));
        }

        let mut attachments: Vec<_> = self.desc.color_attachments.iter().map(AttachmentDesc::raw).collect();
        if let Some(depth) = &self.desc.depth_attachment {
            attachments.push(depth.raw());
        }

        let (color_refs, depth_ref) = self.desc.references();
        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .dst_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let subpasses = [subpass];
        let dependencies = [dependency];
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        self.handle = unsafe { self.device.raw().create_render_pass(&info, None) }.map_err(|e| {
            tracing::error!(render_pass = %self.lifecycle.identifier(), "Unable to create render pass: {e}");
            self.device.observe(e.into())
        })?;

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::RenderPass::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            unsafe { self.device.raw().destroy_render_pass(self.handle, None) };
            self.handle = vk::RenderPass::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy render pass: {e}");
        }
    }
}

/// Image views bound to the attachments of a render pass.
pub struct Framebuffer {
    device: Arc<Device>,
    render_pass: Arc<RenderPass>,
    attachments: Vec<Arc<ImageView>>,
    extent: vk::Extent2D,
    handle: vk::Framebuffer,
    lifecycle: Lifecycle,
}

impl Framebuffer {
    pub fn new(
        render_pass: Arc<RenderPass>,
        identifier: impl Into<String>,
        attachments: Vec<Arc<ImageView>>,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            device: Arc::clone(&render_pass.device),
            render_pass,
            attachments,
            extent,
            handle: vk::Framebuffer::null(),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }

    /// Rebuild for a new size, for example after a resize.
    pub fn resize(&mut self, extent: vk::Extent2D, attachments: Vec<Arc<ImageView>>) -> Result<()> {
        self.extent = extent;
        self.attachments = attachments;
        self.recreate()
    }
}

impl HardwareResource for Framebuffer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device.ensure_usable()?;
        self.render_pass.lifecycle().ensure_created()?;

        if self.attachments.len() != self.render_pass.desc().attachment_count() {
            return Err(GpuError::InvalidState(format!(
                "Framebuffer '{}' has {} views but render pass '{}' expects {}",
                self.lifecycle.identifier(),
                self.attachments.len(),
                self.render_pass.identifier(),
                self.render_pass.desc().attachment_count()
            )));
        }
        let views = self
            .attachments
            .iter()
            .map(|view| {
                view.lifecycle().ensure_created()?;
                Ok(view.handle())
            })
            .collect::<Result<Vec<_>>>()?;

        let info = vk::FramebufferCreateInfo::default()
            .render_pass(self.render_pass.handle())
            .attachments(&views)
            .width(self.extent.width)
            .height(self.extent.height)
            .layers(1);

        self.handle = unsafe { self.device.raw().create_framebuffer(&info, None) }.map_err(|e| {
            tracing::error!(framebuffer = %self.lifecycle.identifier(), "Unable to create framebuffer: {e}");
            self.device.observe(e.into())
        })?;

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::Framebuffer::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            unsafe { self.device.raw().destroy_framebuffer(self.handle, None) };
            self.handle = vk::Framebuffer::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy framebuffer: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_reference_follows_colors() {
        let desc = RenderPassDesc::default()
            .with_color(AttachmentDesc::color(vk::Format::R8G8B8A8_UNORM))
            .with_color(AttachmentDesc::color(vk::Format::R16G16B16A16_SFLOAT))
            .with_depth(AttachmentDesc::depth(vk::Format::D32_SFLOAT));
        assert_eq!(desc.attachment_count(), 3);

        let (color, depth) = desc.references();
        assert_eq!(color.len(), 2);
        assert_eq!(color[1].attachment, 1);
        assert_eq!(depth.map(|d| d.attachment), Some(2));
    }

    #[test]
    fn loaded_attachment_keeps_contents() {
        let attachment = AttachmentDesc::color(vk::Format::B8G8R8A8_SRGB)
            .load(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .with_final_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(attachment.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(attachment.initial_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }
}
