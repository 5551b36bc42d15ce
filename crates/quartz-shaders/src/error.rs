//! Shader error types.

use crate::diagnostics::CompilationFailure;
use quartz_gpu::GpuError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShaderError {
    #[error("IO error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Compilation(Box<CompilationFailure>),

    #[error("Shader compiler unavailable: {0}")]
    CompilerUnavailable(String),

    #[error("Shader '{0}' has no source code")]
    EmptySource(String),

    #[error("Unknown shader stage for '{0}'")]
    UnknownStage(String),

    #[error("Invalid shader binary: {0}")]
    InvalidBinary(String),

    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
}

impl ShaderError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The structured failure of a compilation error.
    pub fn compilation_failure(&self) -> Option<&CompilationFailure> {
        match self {
            Self::Compilation(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<CompilationFailure> for ShaderError {
    fn from(failure: CompilationFailure) -> Self {
        Self::Compilation(Box::new(failure))
    }
}

pub type Result<T> = std::result::Result<T, ShaderError>;
