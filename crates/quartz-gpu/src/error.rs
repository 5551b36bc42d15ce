//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// The device was lost or is no longer usable.
    #[error("Device is not usable: {0}")]
    DeviceUnusable(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// No memory type satisfies the requested property flags.
    #[error("No memory type matches bits {type_bits:#x} with {flags:?}")]
    NoMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    /// The resource has not been created on hardware yet.
    #[error("Resource '{0}' is not created")]
    NotCreated(String),

    /// The resource is already created on hardware.
    #[error("Resource '{0}' is already created")]
    AlreadyCreated(String),

    /// A descriptor binding index was declared twice.
    #[error("Binding {binding} is already declared in layout '{layout}'")]
    DuplicateBinding { layout: String, binding: u32 },

    /// A pipeline aspect is neither configured nor dynamic.
    #[error("Pipeline '{pipeline}' is missing {aspect} state")]
    MissingState {
        pipeline: String,
        aspect: &'static str,
    },

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Data does not fit the target range.
    #[error("Range {offset}..{end} exceeds size {size}")]
    OutOfBounds { offset: u64, end: u64, size: u64 },

    /// A wait did not complete before its timeout.
    #[error("Timed out after {0} ns")]
    Timeout(u64),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Whether this error reports a lost device.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::Vulkan(vk::Result::ERROR_DEVICE_LOST))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_detection() {
        assert!(GpuError::from(vk::Result::ERROR_DEVICE_LOST).is_device_lost());
        assert!(!GpuError::Timeout(10).is_device_lost());
    }

    #[test]
    fn diagnostics_name_the_resource() {
        let err = GpuError::DuplicateBinding {
            layout: "material".to_string(),
            binding: 3,
        };
        assert_eq!(
            err.to_string(),
            "Binding 3 is already declared in layout 'material'"
        );
    }
}
