//! SPIR-V shader modules.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::lifecycle::{HardwareResource, Lifecycle};
use ash::vk;
use std::ffi::{CStr, CString};
use std::fmt;
use std::sync::Arc;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Programmable pipeline stage a module is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub const ALL: [Self; 6] = [
        Self::Vertex,
        Self::TessellationControl,
        Self::TessellationEvaluation,
        Self::Geometry,
        Self::Fragment,
        Self::Compute,
    ];

    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            Self::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            Self::Geometry => vk::ShaderStageFlags::GEOMETRY,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    /// Conventional GLSL file extension.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::TessellationControl => "tesc",
            Self::TessellationEvaluation => "tese",
            Self::Geometry => "geom",
            Self::Fragment => "frag",
            Self::Compute => "comp",
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.extension() == extension)
    }

    pub fn is_tessellation(self) -> bool {
        matches!(self, Self::TessellationControl | Self::TessellationEvaluation)
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Reinterpret a SPIR-V blob as words, checking size and magic number.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(GpuError::InvalidState(format!(
            "SPIR-V blob of {} bytes is not a whole number of words",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    if words[0] != SPIRV_MAGIC {
        return Err(GpuError::InvalidState(format!(
            "Bad SPIR-V magic {:#010x}",
            words[0]
        )));
    }
    Ok(words)
}

/// A shader module bound to one stage and entry point.
pub struct ShaderModule {
    device: Arc<Device>,
    stage: ShaderStage,
    entry_point: CString,
    code: Vec<u32>,
    handle: vk::ShaderModule,
    lifecycle: Lifecycle,
}

impl ShaderModule {
    /// Describe a module from SPIR-V words with entry point `main`.
    pub fn new(
        device: Arc<Device>,
        identifier: impl Into<String>,
        stage: ShaderStage,
        code: Vec<u32>,
    ) -> Self {
        Self {
            device,
            stage,
            entry_point: c"main".to_owned(),
            code,
            handle: vk::ShaderModule::null(),
            lifecycle: Lifecycle::new(identifier),
        }
    }

    /// Validate `bytes`, then describe and create the module.
    pub fn from_spirv_bytes(
        device: Arc<Device>,
        identifier: impl Into<String>,
        stage: ShaderStage,
        bytes: &[u8],
    ) -> Result<Self> {
        let mut module = Self::new(device, identifier, stage, spirv_words(bytes)?);
        module.create_on_hardware()?;
        Ok(module)
    }

    pub fn with_entry_point(mut self, entry_point: CString) -> Self {
        self.entry_point = entry_point;
        self
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn entry_point(&self) -> &CStr {
        &self.entry_point
    }

    pub fn code(&self) -> &[u32] {
        &self.code
    }

    /// Stage description for pipeline creation.
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.flags())
            .module(self.handle)
            .name(&self.entry_point)
    }
}

impl HardwareResource for ShaderModule {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn create_on_hardware(&mut self) -> Result<()> {
        self.lifecycle.ensure_not_created()?;
        self.device.ensure_usable()?;

        let info = vk::ShaderModuleCreateInfo::default().code(&self.code);
        self.handle = unsafe { self.device.raw().create_shader_module(&info, None) }.map_err(|e| {
            tracing::error!(shader = %self.lifecycle.identifier(), stage = %self.stage, "Unable to create shader module: {e}");
            self.device.observe(e.into())
        })?;

        self.lifecycle.mark_created();
        Ok(())
    }

    fn destroy_from_hardware(&mut self) -> Result<()> {
        if self.handle != vk::ShaderModule::null() {
            self.device
                .wait_idle_before_destroy(self.lifecycle.identifier());
            unsafe { self.device.raw().destroy_shader_module(self.handle, None) };
            self.handle = vk::ShaderModule::null();
        }
        self.lifecycle.mark_destroyed();
        Ok(())
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_from_hardware() {
            tracing::error!("Failed to destroy shader module: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_round_trip() {
        for stage in ShaderStage::ALL {
            assert_eq!(ShaderStage::from_extension(stage.extension()), Some(stage));
        }
        assert_eq!(ShaderStage::from_extension("glsl"), None);
        assert!(ShaderStage::TessellationControl.is_tessellation());
        assert!(!ShaderStage::Compute.is_tessellation());
    }

    #[test]
    fn spirv_blobs_are_validated() {
        let mut blob = SPIRV_MAGIC.to_le_bytes().to_vec();
        blob.extend_from_slice(&0x0001_0600u32.to_le_bytes());
        assert_eq!(spirv_words(&blob).unwrap(), vec![SPIRV_MAGIC, 0x0001_0600]);

        assert!(spirv_words(&blob[..6]).is_err());
        assert!(spirv_words(&[]).is_err());
        assert!(spirv_words(&[0, 0, 0, 0]).is_err());
    }
}
