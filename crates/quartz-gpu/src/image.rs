//! Device images and image views.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::lifecycle::{HardwareResource, Lifecycle};
use crate::memory::{DeviceMemory, MemoryOwner, DEVICE_MEMORY};
use crate::transfer::TransferManager;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Creation descriptor of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
    pub memory: vk::MemoryPropertyFlags,
}

impl ImageDesc {
    /// Sampled 2D texture filled through transfers.
    pub fn texture_2d(format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            flags: vk::ImageCreateFlags::empty(),
            memory: DEVICE_MEMORY,
        }
    }

    /// Six-faced cube texture.
    pub fn cubemap(format: vk::Format, size: u32) -> Self {
        Self {
            array_layers: 6,
            flags: vk::ImageCreateFlags::CUBE_COMPATIBLE,
            ..Self::texture_2d(format, size, size)
        }
    }

    /// 2D texture with one layer per frame.
    pub fn texture_array(format: vk::Format, width: u32, height: u32, layers: u32) -> Self {
        Self {
            array_layers: layers,
            ..Self::texture_2d(format, width, height)
        }
    }

    /// Color render target that can also be sampled.
    pub fn color_attachment(format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC,
            ..Self::texture_2d(format, width, height)
        }
    }

    /// Depth render target.
    pub fn depth_attachment(format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            ..Self::texture_2d(format, width, height)
        }
    }

    /// Set the mip level count.
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Add usage flags.
    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    /// Aspect implied by the format.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        format_aspect(self.format)
    }

    /// Subresource range covering every mip level and layer.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(self.aspect())
            .base_mip_level(0)
            .level_count(self.mip_levels)
            .base_array_layer(0)
            .layer_count(self.array_layers)
    }
}

/// Aspect flags implied by `format`.
pub fn format_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Pixel data handed to [`Image::create_with_data`].
#[derive(Debug, Clone, Copy)]
pub enum ImagePayload<'a> {
    /// Contiguous data for a single-layer image.
    Single(&'a [u8]),
    /// One slice per array layer: cubemap faces or movie frames.
    Layers(&'a [&'a [u8]]),
}

impl ImagePayload<'_> {
    /// Total byte count.
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Single(data) => data.len() as u64,
            Self::Layers(layers) => layers.iter().map(|layer| layer.len() as u64).sum(),
        }
    }

    /// Number of layers described.
    pub fn layer_count(&self) -> u32 {
        match self {
            Self::Single(_) => 1,
            Self::Layers(layers) => u32::try_from(layers.len()).unwrap_or(u32::MAX),
        }
    }

    /// Byte offset of each layer when packed back to back.
    pub fn layer_offsets(&self) -> Vec<u64> {
        match self {
            Self::Single(_) => vec![0],
            Self::Layers(layers) => layers
                .iter()
                .scan(0_u64, |offset, layer| {
                    let current = *offset;
                    *offset += layer.len() as u64;
                    Some(current)
                })
                .collect(),
        }
    }
}

/// A device image and its dedicated memory.
pub struct Image {
    device: Arc<Device>,
    desc: ImageDesc,
    handle: vk::Image,
    memory: Option<DeviceMemory>,
    layout: Mutex<vk::ImageLayout>,
    lifecycle: Lifecycle,
}

impl Image {
    /// Describe an image; nothing is created until [`HardwareResource::create_on_hardware`].
    pub fn new(device: Arc<Device>, identifier: impl Into<String>, desc: ImageDesc) -> Self {
        Self {
            device,
            desc,
            handle: vk::Image::null(),
            memory: None,
            layout: Mutex::new(vk::ImageLayout::UNDEFINED),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    /// Create the image then upload `payload` through `transfer`.
    ///
    /// On upload failure the image stays created with undefined contents.
    pub fn create_with_data(
        &mut self,
        transfer: &TransferManager,
        payload: ImagePayload<'_>,
    ) -> Result<()> {
        if payload.layer_count() != self.desc.array_layers {
            return Err(GpuError::InvalidState(format!(
                "Image '{}' has {} layers but payload has {}",
                self.lifecycle.identifier(),
                self.desc.array_layers,
                payload.layer_count()
            )));
        }

        self.create_on_hardware()?;
        self.write_data(transfer, payload)
    }

    /// Upload `payload` into an already created image.
    pub fn write_data(&self, transfer: &TransferManager, payload: ImagePayload<'_>) -> Result<()> {
        self.lifecycle.ensure_created()?;

        let staging = transfer.staging_buffer(payload.bytes())?;
        match payload {
            ImagePayload::Single(data) => staging.write_data(0, data)?,
            ImagePayload::Layers(layers) => {
                for (layer, offset) in layers.iter().zip(payload.layer_offsets()) {
                    staging.write_data(offset, layer)?;
                }
            }
        }

        tracing::trace!(
            image = %self.lifecycle.identifier(),
            bytes = payload.bytes(),
            "Pixel data staged"
        );

        transfer.transfer_to_image(&staging, self, &payload.layer_offsets())
    }

    /// Raw image handle.
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    /// Creation descriptor.
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Image extent.
    pub fn extent(&self) -> vk::Extent3D {
        self.desc.extent
    }

    /// Bound memory, once created.
    pub fn memory(&self) -> Option<&DeviceMemory> {
        self.memory.as_ref()
    }

    /// Last layout recorded for the whole image.
    pub fn layout(&self) -> vk::ImageLayout {
        *self.layout.lock()
    }

    /// Record a layout transition performed by a submitted command buffer.
    pub fn set_layout(&self, layout: vk::ImageLayout) {
        *self.layout.lock() = layout;
    }

    fn release(&mut self) {
        if let Some(mut memory) = self.memory.take() {
            if let Err(e) = memory.free() {
                tracing::error!(image = %self.lifecycle.identifier(), "Failed to free memory: {e}");
            }
        }
        if self.handle != vk::Image::null() {
            unsafe { self.device.raw().destroy_image(self.handle, None) };
            self.handle = vk::Image::null();
        }
        *self.layout.lock() = vk::ImageLayout::UNDEFINED;
    }
}

impl HardwareResource for Image {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device.ensure_usable()?;

        let desc = &self.desc;
        let info = vk::ImageCreateInfo::default()
            .flags(desc.flags)
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        self.handle = unsafe { self.device.raw().create_image(&info, None) }.map_err(|e| {
            tracing::error!(image = %self.lifecycle.identifier(), "Unable to create image: {e}");
            self.device.observe(e.into())
        })?;

        let requirements = unsafe { self.device.raw().get_image_memory_requirements(self.handle) };

        let memory = match DeviceMemory::allocate(
            &self.device,
            self.lifecycle.identifier(),
            requirements,
            self.desc.memory,
            MemoryOwner::Image(self.handle),
        ) {
            Ok(memory) => memory,
            Err(e) => {
                tracing::error!(image = %self.lifecycle.identifier(), "Unable to allocate memory: {e}");
                self.release();
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .raw()
                .bind_image_memory(self.handle, memory.handle(), memory.offset())
        };
        self.memory = Some(memory);

        if let Err(e) = bound {
            tracing::error!(image = %self.lifecycle.identifier(), "Unable to bind memory: {e}");
            self.release();
            return Err(self.device.observe(e.into()));
        }

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::Image::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            self.release();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy image: {e}");
        }
    }
}

/// Creation descriptor of an image view.
#[derive(Debug, Clone, Copy)]
pub struct ImageViewDesc {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub range: vk::ImageSubresourceRange,
}

impl ImageViewDesc {
    /// View covering the whole image, with a view type matching its shape.
    pub fn whole(desc: &ImageDesc) -> Self {
        let view_type = if desc.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE)
            && desc.array_layers == 6
        {
            vk::ImageViewType::CUBE
        } else {
            match (desc.image_type, desc.array_layers) {
                (vk::ImageType::TYPE_1D, 1) => vk::ImageViewType::TYPE_1D,
                (vk::ImageType::TYPE_1D, _) => vk::ImageViewType::TYPE_1D_ARRAY,
                (vk::ImageType::TYPE_3D, _) => vk::ImageViewType::TYPE_3D,
                (_, 1) => vk::ImageViewType::TYPE_2D,
                _ => vk::ImageViewType::TYPE_2D_ARRAY,
            }
        };

        Self {
            view_type,
            format: desc.format,
            range: desc.full_range(),
        }
    }
}

/// A view onto an [`Image`].
pub struct ImageView {
    image: Arc<Image>,
    desc: ImageViewDesc,
    handle: vk::ImageView,
    lifecycle: Lifecycle,
}

impl ImageView {
    /// Describe a view covering all of `image`.
    pub fn new(image: Arc<Image>, identifier: impl Into<String>) -> Self {
        let desc = ImageViewDesc::whole(image.desc());
        Self::with_desc(image, identifier, desc)
    }

    /// Describe a view with an explicit descriptor.
    pub fn with_desc(image: Arc<Image>, identifier: impl Into<String>, desc: ImageViewDesc) -> Self {
        Self {
            image,
            desc,
            handle: vk::ImageView::null(),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    /// Raw view handle.
    pub fn handle(&self) -> vk::ImageView {
        self.handle
    }

    /// Viewed image.
    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    /// Creation descriptor.
    pub fn desc(&self) -> &ImageViewDesc {
        &self.desc
    }
}

impl HardwareResource for ImageView {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.image.device.ensure_usable()?;
        self.image.lifecycle.ensure_created()?;

        let info = vk::ImageViewCreateInfo::default()
            .image(self.image.handle())
            .view_type(self.desc.view_type)
            .format(self.desc.format)
            .subresource_range(self.desc.range);

        self.handle = unsafe { self.image.device.raw().create_image_view(&info, None) }
            .map_err(|e| {
                tracing::error!(view = %self.lifecycle.identifier(), "Unable to create image view: {e}");
                self.image.device.observe(e.into())
            })?;

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::ImageView::null() {
            let device = &self.image.device;
            device.wait_idle_before_destroy(self.lifecycle.identifier());
            unsafe { device.raw().destroy_image_view(self.handle, None) };
            self.handle = vk::ImageView::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy image view: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspects_follow_format() {
        assert_eq!(
            format_aspect(vk::Format::R8G8B8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            format_aspect(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            format_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn cubemap_view_type() {
        let desc = ImageDesc::cubemap(vk::Format::R8G8B8A8_UNORM, 128);
        let view = ImageViewDesc::whole(&desc);
        assert_eq!(view.view_type, vk::ImageViewType::CUBE);
        assert_eq!(view.range.layer_count, 6);

        let frames = ImageDesc::texture_array(vk::Format::R8G8B8A8_UNORM, 64, 64, 12);
        assert_eq!(
            ImageViewDesc::whole(&frames).view_type,
            vk::ImageViewType::TYPE_2D_ARRAY
        );
    }

    #[test]
    fn layered_payload_offsets_are_packed() {
        let face = [0_u8; 16];
        let faces: [&[u8]; 6] = [&face; 6];
        let payload = ImagePayload::Layers(&faces);

        assert_eq!(payload.bytes(), 96);
        assert_eq!(payload.layer_count(), 6);
        assert_eq!(payload.layer_offsets(), vec![0, 16, 32, 48, 64, 80]);

        let single = ImagePayload::Single(&face);
        assert_eq!(single.layer_offsets(), vec![0]);
    }
}
