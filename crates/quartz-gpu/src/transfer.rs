//! Host to device uploads through pooled staging buffers.
//!
//! The [`TransferManager`] owns a bounded pool of host-visible staging
//! buffers. A caller leases one big enough for its payload, writes into it,
//! then hands it back to the manager which records the device-side copy on
//! the transfer queue. A leased buffer belongs to exactly one caller until
//! the lease is dropped; when every buffer is leased and the pool is full,
//! further callers block until a lease is returned.

use crate::buffer::{Buffer, BufferDesc};
use crate::command::{CommandBuffer, CommandPool};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::image::Image;
use crate::lifecycle::HardwareResource;
use crate::queue::{Queue, QueueKind};
use crate::sync::{BufferBarrier, ImageBarrier, PipelineBarrier};
use ash::vk;
use parking_lot::{Condvar, Mutex};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Tuning of the staging pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Upper bound on staging buffers alive at once.
    pub max_staging_buffers: usize,
    /// Smallest staging buffer ever created, in bytes.
    pub min_staging_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_staging_buffers: 4,
            min_staging_size: 64 * 1024,
        }
    }
}

impl TransferConfig {
    pub fn with_max_staging_buffers(mut self, count: usize) -> Self {
        self.max_staging_buffers = count.max(1);
        self
    }

    pub fn with_min_staging_size(mut self, bytes: u64) -> Self {
        self.min_staging_size = bytes;
        self
    }

    /// Size to allocate for a request of `bytes`.
    pub fn staging_size_for(&self, bytes: u64) -> u64 {
        bytes.max(self.min_staging_size).next_power_of_two()
    }
}

/// Something the staging pool can hand out.
pub trait StagingSlot {
    /// Bytes the slot can hold.
    fn capacity(&self) -> u64;

    /// Enlarge the slot to hold at least `bytes`.
    fn grow(&mut self, bytes: u64) -> Result<()>;
}

/// Bounded pool of exclusive staging slots.
pub struct StagingPool<S> {
    // `None` marks a slot that is currently leased.
    slots: Mutex<Vec<Option<S>>>,
    released: Condvar,
    max_slots: usize,
}

impl<S: StagingSlot> StagingPool<S> {
    pub fn new(max_slots: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            released: Condvar::new(),
            max_slots: max_slots.max(1),
        }
    }

    /// Lease a slot holding at least `bytes`.
    ///
    /// Prefers an idle slot that already fits, then grows an idle slot, then
    /// creates a new one with `create` while under the bound, and otherwise
    /// waits for a lease to be returned.
    pub fn acquire<F>(&self, bytes: u64, mut create: F) -> Result<StagingLease<'_, S>>
    where
        F: FnMut(usize) -> Result<S>,
    {
        let mut slots = self.slots.lock();
        loop {
            let fitting = slots
                .iter()
                .position(|slot| slot.as_ref().is_some_and(|s| s.capacity() >= bytes));
            if let Some((index, slot)) = fitting.and_then(|i| slots[i].take().map(|s| (i, s))) {
                return Ok(self.lease(index, slot));
            }

            let idle = slots.iter().position(Option::is_some);
            if let Some((index, mut slot)) = idle.and_then(|i| slots[i].take().map(|s| (i, s))) {
                if let Err(e) = slot.grow(bytes) {
                    slots[index] = Some(slot);
                    return Err(e);
                }
                tracing::debug!(slot = index, bytes, "Grew staging buffer");
                return Ok(self.lease(index, slot));
            }

            if slots.len() < self.max_slots {
                let index = slots.len();
                let slot = create(index)?;
                slots.push(None);
                tracing::debug!(slot = index, bytes, "Created staging buffer");
                return Ok(self.lease(index, slot));
            }

            tracing::trace!(bytes, "Waiting for a staging buffer");
            self.released.wait(&mut slots);
        }
    }

    fn lease(&self, index: usize, slot: S) -> StagingLease<'_, S> {
        StagingLease {
            pool: self,
            index,
            slot: ManuallyDrop::new(slot),
        }
    }

    fn release(&self, index: usize, slot: S) {
        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(index) {
            *entry = Some(slot);
        }
        drop(slots);
        self.released.notify_all();
    }

    /// Slots alive, leased or idle.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive use of one staging slot; returned to the pool on drop.
pub struct StagingLease<'a, S: StagingSlot> {
    pool: &'a StagingPool<S>,
    index: usize,
    slot: ManuallyDrop<S>,
}

impl<S: StagingSlot> Deref for StagingLease<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.slot
    }
}

impl<S: StagingSlot> DerefMut for StagingLease<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.slot
    }
}

impl<S: StagingSlot> Drop for StagingLease<'_, S> {
    fn drop(&mut self) {
        // SAFETY: the slot is taken exactly once, here.
        let slot = unsafe { ManuallyDrop::take(&mut self.slot) };
        self.pool.release(self.index, slot);
    }
}

/// Host-visible buffer used as a transfer source.
pub struct StagingBuffer {
    buffer: Buffer,
}

impl StagingBuffer {
    /// Create a staging buffer of `size` bytes.
    pub fn create(device: Arc<Device>, identifier: impl Into<String>, size: u64) -> Result<Self> {
        let buffer = Buffer::create(device, identifier, BufferDesc::staging(size))?;
        Ok(Self { buffer })
    }

    /// Copy `bytes` in at `offset`.
    pub fn write_data(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.buffer.write_data(offset, bytes)
    }

    /// Underlying buffer.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

impl StagingSlot for StagingBuffer {
    fn capacity(&self) -> u64 {
        self.buffer.size()
    }

    fn grow(&mut self, bytes: u64) -> Result<()> {
        self.buffer.resize(bytes.next_power_of_two())
    }
}

/// Uploads host data into device-local buffers and images.
pub struct TransferManager {
    device: Arc<Device>,
    config: TransferConfig,
    staging: StagingPool<StagingBuffer>,
    transfer_queue: Queue,
    graphics_queue: Queue,
    transfer_commands: CommandBuffer,
    graphics_commands: CommandBuffer,
    // Serializes recording into the two command buffers above.
    transfer_lock: Mutex<()>,
}

impl TransferManager {
    /// Create the manager with its own command pools.
    pub fn new(device: Arc<Device>, config: TransferConfig) -> Result<Self> {
        let flags = vk::CommandPoolCreateFlags::TRANSIENT
            | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;

        let transfer_queue = device.queue(QueueKind::Transfer);
        let graphics_queue = device.queue(QueueKind::Graphics);

        let transfer_pool = CommandPool::create(
            Arc::clone(&device),
            "transfer-pool",
            transfer_queue.family(),
            flags,
        )?;
        let graphics_pool = CommandPool::create(
            Arc::clone(&device),
            "transfer-acquire-pool",
            graphics_queue.family(),
            flags,
        )?;

        let transfer_commands = CommandBuffer::primary(transfer_pool, "transfer-commands")?;
        let graphics_commands = CommandBuffer::primary(graphics_pool, "transfer-acquire-commands")?;

        tracing::debug!(
            transfer_family = transfer_queue.family(),
            graphics_family = graphics_queue.family(),
            max_staging_buffers = config.max_staging_buffers,
            "Transfer manager ready"
        );

        Ok(Self {
            staging: StagingPool::new(config.max_staging_buffers),
            device,
            config,
            transfer_queue,
            graphics_queue,
            transfer_commands,
            graphics_commands,
            transfer_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Lease a staging buffer of at least `bytes`, blocking while none is free.
    pub fn staging_buffer(&self, bytes: u64) -> Result<StagingLease<'_, StagingBuffer>> {
        self.staging.acquire(bytes, |index| {
            StagingBuffer::create(
                Arc::clone(&self.device),
                format!("staging-{index}"),
                self.config.staging_size_for(bytes),
            )
        })
    }

    fn split_families(&self) -> bool {
        self.transfer_queue.family() != self.graphics_queue.family()
    }

    /// Copy `size` bytes from the start of `staging` into `dst` at `dst_offset`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn transfer_to_buffer(
        &self,
        staging: &StagingBuffer,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        dst.lifecycle().ensure_created()?;
        crate::memory::check_range(0, size, staging.capacity())?;
        crate::memory::check_range(dst_offset, size, dst.size())?;

        let release = BufferBarrier::whole(
            dst.handle(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::empty(),
        )
        .with_queue_transfer(self.transfer_queue.family(), self.graphics_queue.family());

        let _transfer = self.transfer_lock.lock();
        self.transfer_commands.submit_once(&self.transfer_queue, |cmd| {
            cmd.copy_buffer(
                staging.buffer(),
                dst,
                &[vk::BufferCopy::default()
                    .src_offset(0)
                    .dst_offset(dst_offset)
                    .size(size)],
            );
            if self.split_families() {
                cmd.pipeline_barrier(
                    &PipelineBarrier::new(
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    )
                    .with_buffer(release),
                );
            }
            Ok(())
        })?;

        if self.split_families() {
            let acquire = release.with_access(vk::AccessFlags::empty(), vk::AccessFlags::MEMORY_READ);
            self.graphics_commands.submit_once(&self.graphics_queue, |cmd| {
                cmd.pipeline_barrier(
                    &PipelineBarrier::new(
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::ALL_COMMANDS,
                    )
                    .with_buffer(acquire),
                );
                Ok(())
            })?;
        }

        tracing::trace!(buffer = %dst.identifier(), size, "Buffer transfer complete");
        Ok(())
    }

    /// Copy layers of `staging` into `image`, one layer per offset.
    ///
    /// The image ends in `SHADER_READ_ONLY_OPTIMAL`, owned by the graphics
    /// queue family.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn transfer_to_image(
        &self,
        staging: &StagingBuffer,
        image: &Image,
        layer_offsets: &[u64],
    ) -> Result<()> {
        image.lifecycle().ensure_created()?;
        let desc = image.desc();
        if layer_offsets.len() != desc.array_layers as usize {
            return Err(GpuError::InvalidState(format!(
                "Image '{}' has {} layers but {} offsets were given",
                image.identifier(),
                desc.array_layers,
                layer_offsets.len()
            )));
        }

        let aspect = desc.aspect();
        let range = desc.full_range();
        let regions: Vec<vk::BufferImageCopy> = (0u32..)
            .zip(layer_offsets)
            .map(|(layer, &offset)| {
                vk::BufferImageCopy::default()
                    .buffer_offset(offset)
                    .image_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(aspect)
                            .mip_level(0)
                            .base_array_layer(layer)
                            .layer_count(1),
                    )
                    .image_extent(image.extent())
            })
            .collect();

        let to_transfer = ImageBarrier::transition(
            image.handle(),
            range,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        let to_shader_read = ImageBarrier::transition(
            image.handle(),
            range,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        let split = self.split_families();

        let _transfer = self.transfer_lock.lock();
        self.transfer_commands.submit_once(&self.transfer_queue, |cmd| {
            cmd.pipeline_barrier(&PipelineBarrier::image(to_transfer));
            cmd.copy_buffer_to_image(
                staging.buffer(),
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            );
            if split {
                let release = to_shader_read
                    .with_queue_transfer(self.transfer_queue.family(), self.graphics_queue.family())
                    .with_access(vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::empty());
                cmd.pipeline_barrier(
                    &PipelineBarrier::new(
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    )
                    .with_image(release),
                );
            } else {
                cmd.pipeline_barrier(&PipelineBarrier::image(to_shader_read));
            }
            Ok(())
        })?;

        if split {
            let acquire = to_shader_read
                .with_queue_transfer(self.transfer_queue.family(), self.graphics_queue.family())
                .with_access(vk::AccessFlags::empty(), vk::AccessFlags::SHADER_READ);
            self.graphics_commands.submit_once(&self.graphics_queue, |cmd| {
                cmd.pipeline_barrier(
                    &PipelineBarrier::new(
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        acquire.stages().1,
                    )
                    .with_image(acquire),
                );
                Ok(())
            })?;
        }

        image.set_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        tracing::trace!(image = %image.identifier(), layers = layer_offsets.len(), "Image transfer complete");
        Ok(())
    }

    /// Stage `bytes` and copy them into `dst` at `offset`.
    pub fn upload_buffer(&self, dst: &Buffer, offset: u64, bytes: &[u8]) -> Result<()> {
        let size = bytes.len() as u64;
        let staging = self.staging_buffer(size)?;
        staging.write_data(0, bytes)?;
        self.transfer_to_buffer(&staging, dst, offset, size)
    }

    /// Staging buffers created so far.
    pub fn staging_buffer_count(&self) -> usize {
        self.staging.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeSlot {
        capacity: u64,
        grown: usize,
    }

    impl StagingSlot for FakeSlot {
        fn capacity(&self) -> u64 {
            self.capacity
        }

        fn grow(&mut self, bytes: u64) -> Result<()> {
            self.capacity = bytes;
            self.grown += 1;
            Ok(())
        }
    }

    fn fake(capacity: u64) -> impl FnMut(usize) -> Result<FakeSlot> {
        move |_| Ok(FakeSlot { capacity, grown: 0 })
    }

    #[test]
    fn idle_slot_is_reused() {
        let pool = StagingPool::new(2);
        {
            let lease = pool.acquire(64, fake(128)).unwrap();
            assert_eq!(lease.capacity(), 128);
        }
        let created = AtomicUsize::new(0);
        let lease = pool
            .acquire(100, |_| {
                created.fetch_add(1, Ordering::SeqCst);
                Ok(FakeSlot {
                    capacity: 100,
                    grown: 0,
                })
            })
            .unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 0);
        assert_eq!(lease.grown, 0);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn small_idle_slot_grows_in_place() {
        let pool = StagingPool::new(2);
        drop(pool.acquire(16, fake(16)).unwrap());

        let lease = pool.acquire(4096, fake(4096)).unwrap();
        assert_eq!(lease.capacity(), 4096);
        assert_eq!(lease.grown, 1);
        drop(lease);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn busy_slots_force_creation_up_to_the_bound() {
        let pool = StagingPool::new(2);
        let first = pool.acquire(8, fake(8)).unwrap();
        let second = pool.acquire(8, fake(8)).unwrap();
        assert_eq!(pool.len(), 2);
        drop(first);
        drop(second);
    }

    #[test]
    fn second_caller_blocks_until_release() {
        let pool = StagingPool::new(1);
        let acquired = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let lease = pool.acquire(32, fake(32)).unwrap();

            let waiter = scope.spawn(|| {
                let lease = pool.acquire(32, fake(32)).unwrap();
                acquired.store(true, Ordering::SeqCst);
                lease.capacity()
            });

            std::thread::sleep(Duration::from_millis(100));
            assert!(!acquired.load(Ordering::SeqCst));

            drop(lease);
            assert_eq!(waiter.join().unwrap(), 32);
        });

        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn failed_growth_keeps_the_slot() {
        struct Rigid;
        impl StagingSlot for Rigid {
            fn capacity(&self) -> u64 {
                4
            }
            fn grow(&mut self, _bytes: u64) -> Result<()> {
                Err(GpuError::AllocationFailed("out of memory".to_string()))
            }
        }

        let pool = StagingPool::new(1);
        drop(pool.acquire(4, |_| Ok(Rigid)).unwrap());
        assert!(pool.acquire(8, |_| Ok(Rigid)).is_err());
        assert!(pool.acquire(4, |_| Ok(Rigid)).is_ok());
    }

    #[test]
    fn staging_sizes_round_up() {
        let config = TransferConfig::default().with_min_staging_size(1024);
        assert_eq!(config.staging_size_for(10), 1024);
        assert_eq!(config.staging_size_for(1500), 2048);
        assert_eq!(TransferConfig::default().with_max_staging_buffers(0).max_staging_buffers, 1);
    }
}
