//! Test harness for Quartz.
//!
//! Provides a headless device and canned SPIR-V for integration tests
//! that need real GPU hardware.

pub mod harness;

pub use harness::{HeadlessDevice, NOOP_COMPUTE_SPIRV};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] quartz_gpu::GpuError),
    #[error("Shader error: {0}")]
    Shader(#[from] quartz_shaders::ShaderError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TestError>;
