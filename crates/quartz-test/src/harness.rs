//! Headless device harness for GPU integration tests.
//!
//! Nothing here needs a window: the device is created without a surface
//! and every test submits work through one-shot command buffers.

use std::sync::Arc;

use ash::vk;
use quartz_gpu::{
    CommandBuffer, CommandPool, Device, DeviceBuilder, QueueKind, TransferConfig, TransferManager,
};

use crate::Result;

/// Smallest valid compute module: `void main() {}` with a 1x1x1 workgroup.
pub const NOOP_COMPUTE_SPIRV: &[u32] = &[
    // Header: magic, version 1.0, generator, id bound, schema
    0x0723_0203,
    0x0001_0000,
    0,
    5,
    0,
    // OpCapability Shader
    0x0002_0011,
    1,
    // OpMemoryModel Logical GLSL450
    0x0003_000E,
    0,
    1,
    // OpEntryPoint GLCompute %3 "main"
    0x0005_000F,
    5,
    3,
    0x6E69_616D,
    0,
    // OpExecutionMode %3 LocalSize 1 1 1
    0x0006_0010,
    3,
    17,
    1,
    1,
    1,
    // %1 = OpTypeVoid
    0x0002_0013,
    1,
    // %2 = OpTypeFunction %1
    0x0003_0021,
    2,
    1,
    // %3 = OpFunction %1 None %2
    0x0005_0036,
    1,
    3,
    0,
    2,
    // %4 = OpLabel
    0x0002_00F8,
    4,
    // OpReturn
    0x0001_00FD,
    // OpFunctionEnd
    0x0001_0038,
];

/// A device without a presentation surface plus the helpers tests share.
pub struct HeadlessDevice {
    device: Arc<Device>,
    command_pool: Arc<CommandPool>,
}

impl HeadlessDevice {
    /// Create a validated headless device and a resettable graphics pool.
    pub fn new() -> Result<Self> {
        let device = DeviceBuilder::new()
            .app_name("quartz-test")
            .validation(true)
            .build()?;

        let command_pool = CommandPool::create(
            Arc::clone(&device),
            "HeadlessDevice-CommandPool",
            device.queue_family(QueueKind::Graphics),
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;

        tracing::info!(gpu = %device.capabilities().summary(), "Headless device ready");

        Ok(Self {
            device,
            command_pool,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Fresh primary command buffer from the shared pool.
    pub fn command_buffer(&self, identifier: &str) -> Result<CommandBuffer> {
        Ok(CommandBuffer::primary(Arc::clone(&self.command_pool), identifier)?)
    }

    /// Record `record` into a one-shot buffer on the graphics queue and wait.
    pub fn submit<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&CommandBuffer) -> quartz_gpu::Result<()>,
    {
        let command_buffer = self.command_buffer("HeadlessDevice-OneShot")?;
        let queue = self.device.queue(QueueKind::Graphics);
        command_buffer.submit_once(&queue, record)?;
        Ok(())
    }

    /// Transfer manager with a small staging pool.
    pub fn transfer_manager(&self) -> Result<TransferManager> {
        let config = TransferConfig::default().with_max_staging_buffers(2);
        Ok(TransferManager::new(Arc::clone(&self.device), config)?)
    }
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Failed to idle headless device: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_gpu::memory::HOST_MEMORY;
    use quartz_gpu::{
        Buffer, BufferDesc, ComputePipeline, DescriptorSetLayoutDesc, Fence, GpuError,
        HardwareResource, LayoutManager, PushConstantRange, ShaderModule, ShaderStage,
    };
    use quartz_shaders::compiler::collapse_blank_lines;
    use quartz_shaders::{ShaderCompiler, ShaderManager, ShaderManagerConfig, ShaderSource};

    /// Compiler that ignores the source and always emits the no-op module.
    struct NoopCompiler;

    impl ShaderCompiler for NoopCompiler {
        fn name(&self) -> &str {
            "noop"
        }

        fn preprocess(&self, source: &ShaderSource) -> quartz_shaders::Result<String> {
            Ok(collapse_blank_lines(source.code()))
        }

        fn compile(&self, _source: &ShaderSource, _preprocessed: &str) -> quartz_shaders::Result<Vec<u32>> {
            Ok(NOOP_COMPUTE_SPIRV.to_vec())
        }
    }

    fn headless() -> HeadlessDevice {
        HeadlessDevice::new().expect("Failed to create headless device")
    }

    #[test]
    fn noop_module_is_well_formed() {
        let bytes: Vec<u8> = NOOP_COMPUTE_SPIRV.iter().flat_map(|w| w.to_le_bytes()).collect();
        let words = quartz_gpu::spirv_words(&bytes).unwrap();
        assert_eq!(words.len(), NOOP_COMPUTE_SPIRV.len());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn headless_device_creation() {
        let gpu = headless();
        assert!(gpu.device().is_usable());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn host_visible_buffer_round_trip() {
        let gpu = headless();
        let desc = BufferDesc::new(64 * 64, vk::BufferUsageFlags::STORAGE_BUFFER, HOST_MEMORY);
        let buffer = Buffer::create(Arc::clone(gpu.device()), "Test-HostBuffer", desc).unwrap();

        buffer.write_data(0, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        buffer.write_data(60, &[1, 2, 3, 4]).unwrap();

        assert_eq!(buffer.read_data(0, 4).unwrap(), [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(buffer.read_data(60, 4).unwrap(), [1, 2, 3, 4]);
        assert!(buffer.write_data(64 * 64 - 2, &[0; 4]).is_err());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn fence_wait_respects_signal_state() {
        let gpu = headless();

        let mut signaled = Fence::new(Arc::clone(gpu.device()), "Test-SignaledFence", true);
        signaled.create_on_hardware().unwrap();
        signaled.wait(0).unwrap();

        let mut pending = Fence::new(Arc::clone(gpu.device()), "Test-PendingFence", false);
        pending.create_on_hardware().unwrap();
        assert!(matches!(pending.wait(0), Err(GpuError::Timeout(0))));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn destroy_is_idempotent() {
        let gpu = headless();
        let mut buffer = Buffer::new(Arc::clone(gpu.device()), "Test-Lifecycle", BufferDesc::uniform(256));
        assert!(!buffer.is_created());

        buffer.create_on_hardware().unwrap();
        assert!(buffer.is_created());
        assert_ne!(buffer.handle(), vk::Buffer::null());

        buffer.destroy_from_hardware().unwrap();
        assert_eq!(buffer.handle(), vk::Buffer::null());
        buffer.destroy_from_hardware().unwrap();

        buffer.recreate().unwrap();
        assert!(buffer.is_created());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn staged_upload_reaches_device_buffer() {
        let gpu = headless();
        let transfer = gpu.transfer_manager().unwrap();

        let desc = BufferDesc::new(
            256,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            HOST_MEMORY,
        );
        let target = Buffer::create(Arc::clone(gpu.device()), "Test-UploadTarget", desc).unwrap();

        let payload: Vec<u8> = (0..128).collect();
        transfer.upload_buffer(&target, 64, &payload).unwrap();

        assert_eq!(target.read_data(64, 128).unwrap(), payload);
        assert!(transfer.staging_buffer_count() <= 2);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn fill_buffer_through_one_shot_submit() {
        let gpu = headless();
        let desc = BufferDesc::new(64, vk::BufferUsageFlags::TRANSFER_DST, HOST_MEMORY);
        let buffer = Buffer::create(Arc::clone(gpu.device()), "Test-FillTarget", desc).unwrap();

        gpu.submit(|cmd| {
            cmd.fill_buffer(&buffer, 0, 64, 0x0101_0101);
            Ok(())
        })
        .unwrap();

        assert!(buffer.read_data(0, 64).unwrap().iter().all(|&b| b == 1));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn layout_manager_reuses_identical_layouts() {
        let gpu = headless();
        let layouts = LayoutManager::new(Arc::clone(gpu.device()));

        let describe = || {
            let mut desc = DescriptorSetLayoutDesc::new("Test-Material");
            desc.uniform_buffer(0, vk::ShaderStageFlags::VERTEX).unwrap();
            desc.combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT).unwrap();
            desc
        };

        let first = layouts.descriptor_set_layout(describe()).unwrap();
        let second = layouts.descriptor_set_layout(describe()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let push = [PushConstantRange::new(vk::ShaderStageFlags::VERTEX, 0, 64)];
        let a = layouts.pipeline_layout("Test-LayoutA", &[Arc::clone(&first)], &push).unwrap();
        let b = layouts.pipeline_layout("Test-LayoutB", &[second], &push).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(layouts.live_counts(), (1, 1));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn compute_pipeline_from_noop_module() {
        let gpu = headless();
        let layouts = LayoutManager::new(Arc::clone(gpu.device()));
        let layout = layouts.pipeline_layout("Test-EmptyLayout", &[], &[]).unwrap();

        let mut module = ShaderModule::new(
            Arc::clone(gpu.device()),
            "Test-NoopCompute",
            ShaderStage::Compute,
            NOOP_COMPUTE_SPIRV.to_vec(),
        );
        module.create_on_hardware().unwrap();

        let pipeline = ComputePipeline::create(
            Arc::clone(gpu.device()),
            "Test-NoopPipeline",
            Arc::new(module),
            layout,
        )
        .unwrap();
        assert_ne!(pipeline.handle(), vk::Pipeline::null());

        gpu.submit(|cmd| {
            cmd.bind_pipeline(&pipeline);
            cmd.dispatch(1, 1, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn shader_manager_keeps_modules_loaded() {
        let gpu = headless();
        let cache_root = tempfile::tempdir().unwrap();
        let config = ShaderManagerConfig::default().with_cache_root(cache_root.path());
        let mut manager = ShaderManager::new(config, Box::new(NoopCompiler)).unwrap();

        let source = ShaderSource::new("noop", ShaderStage::Compute, "#version 450\nvoid main() {}\n");
        let first = manager.get_shader_module(gpu.device(), &source).unwrap();
        let second = manager.get_shader_module(gpu.device(), &source).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_created());
        assert_eq!(manager.loaded_count(), 1);
        assert_eq!(manager.cache().binary_count(), 1);
    }
}
