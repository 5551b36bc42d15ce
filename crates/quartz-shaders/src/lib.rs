//! Shader compilation and caching for the Quartz renderer.
//!
//! GLSL sources are preprocessed, hashed and compiled to SPIR-V through a
//! [`ShaderCompiler`]. Binaries are cached on disk by content hash and
//! loaded modules are kept in memory by the [`ShaderManager`].

pub mod cache;
pub mod compiler;
pub mod diagnostics;
pub mod error;
pub mod limits;
pub mod manager;

pub use cache::{content_hash, ShaderCache};
#[cfg(feature = "shaderc")]
pub use compiler::ShadercCompiler;
pub use compiler::{default_compiler, GlslangCompiler, ShaderCompiler, ShaderSource, TargetEnv};
pub use diagnostics::{annotate_source, parse_log, CompilationFailure, CompilePhase, Diagnostic, Severity};
pub use error::{Result, ShaderError};
pub use limits::ResourceLimits;
pub use manager::{BinaryOrigin, CompiledShader, ShaderManager, ShaderManagerConfig};
