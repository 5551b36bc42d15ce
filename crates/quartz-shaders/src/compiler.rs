//! Shader compiler boundary.
//!
//! Compilation is two steps. [`ShaderCompiler::preprocess`] expands macros
//! and includes; [`ShaderCompiler::compile`] turns the preprocessed text
//! into SPIR-V. Both report failures as [`CompilationFailure`]s located in
//! the text they were given.

use crate::diagnostics::{CompilationFailure, CompilePhase};
use crate::error::{Result, ShaderError};
use crate::limits::ResourceLimits;
use quartz_gpu::capabilities::REQUIRED_API_VERSION;
use quartz_gpu::{spirv_words, vk, ShaderStage};
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// GLSL source of one shader stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    name: String,
    stage: ShaderStage,
    code: String,
}

impl ShaderSource {
    pub fn new(name: impl Into<String>, stage: ShaderStage, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage,
            code: code.into(),
        }
    }

    /// Read a shader file; the extension selects the stage.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stage = path
            .extension()
            .and_then(|extension| extension.to_str())
            .and_then(ShaderStage::from_extension)
            .ok_or_else(|| ShaderError::UnknownStage(path.display().to_string()))?;
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("shader")
            .to_string();
        let code = std::fs::read_to_string(path).map_err(|e| ShaderError::io(path, e))?;
        Ok(Self::new(name, stage, code))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

/// Vulkan environment the produced SPIR-V targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetEnv {
    Vulkan1_2,
    Vulkan1_3,
}

impl TargetEnv {
    /// Target matching the Vulkan version devices are required to expose.
    pub fn host() -> Self {
        Self::for_api_version(REQUIRED_API_VERSION)
    }

    /// Newest target a device exposing `api_version` can load.
    pub fn for_api_version(api_version: u32) -> Self {
        let version = (vk::api_version_major(api_version), vk::api_version_minor(api_version));
        if version >= (1, 3) {
            Self::Vulkan1_3
        } else {
            Self::Vulkan1_2
        }
    }

    pub fn glslang_name(self) -> &'static str {
        match self {
            Self::Vulkan1_2 => "vulkan1.2",
            Self::Vulkan1_3 => "vulkan1.3",
        }
    }
}

/// A GLSL to SPIR-V compiler.
pub trait ShaderCompiler: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Expand macros and includes.
    fn preprocess(&self, source: &ShaderSource) -> Result<String>;

    /// Compile preprocessed text into SPIR-V words.
    fn compile(&self, source: &ShaderSource, preprocessed: &str) -> Result<Vec<u32>>;
}

/// Collapse runs of newlines into one.
pub fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous = None;
    for c in text.chars() {
        if c == '\n' && previous == Some('\n') {
            continue;
        }
        out.push(c);
        previous = Some(c);
    }
    out
}

/// Drives the `glslangValidator` executable.
pub struct GlslangCompiler {
    executable: PathBuf,
    limits: ResourceLimits,
    target: TargetEnv,
}

impl GlslangCompiler {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            executable: PathBuf::from("glslangValidator"),
            limits,
            target: TargetEnv::host(),
        }
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_target(mut self, target: TargetEnv) -> Self {
        self.target = target;
        self
    }

    /// Whether the executable can be launched.
    pub fn is_available(&self) -> bool {
        Command::new(&self.executable)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    fn limits_file(&self) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("quartz-limits")
            .suffix(".conf")
            .tempfile()
            .map_err(|e| ShaderError::io(std::env::temp_dir(), e))?;
        file.write_all(self.limits.to_glslang_config().as_bytes())
            .map_err(|e| ShaderError::io(file.path(), e))?;
        Ok(file)
    }

    /// Run with `input` on stdin; returns stdout on success, the full log otherwise.
    fn run(&self, args: &[&OsStr], input: &str) -> Result<std::result::Result<String, String>> {
        let mut child = Command::new(&self.executable)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ShaderError::CompilerUnavailable(format!("{}: {e}", self.executable.display()))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| ShaderError::io(&self.executable, e))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| ShaderError::io(&self.executable, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(Ok(stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Ok(Err(format!("{stdout}{stderr}")))
        }
    }
}

impl ShaderCompiler for GlslangCompiler {
    fn name(&self) -> &str {
        "glslangValidator"
    }

    fn preprocess(&self, source: &ShaderSource) -> Result<String> {
        let limits = self.limits_file()?;
        let stage = source.stage().extension();
        let args = [
            OsStr::new("-E"),
            OsStr::new("--stdin"),
            OsStr::new("-S"),
            OsStr::new(stage),
            limits.path().as_os_str(),
        ];
        match self.run(&args, source.code())? {
            Ok(text) => Ok(collapse_blank_lines(&text)),
            Err(log) => Err(CompilationFailure::from_log(
                source.name(),
                source.stage(),
                CompilePhase::Preprocess,
                source.code(),
                &log,
            )
            .into()),
        }
    }

    fn compile(&self, source: &ShaderSource, preprocessed: &str) -> Result<Vec<u32>> {
        let limits = self.limits_file()?;
        let output = tempfile::Builder::new()
            .prefix("quartz-shader")
            .suffix(".spv")
            .tempfile()
            .map_err(|e| ShaderError::io(std::env::temp_dir(), e))?;
        let stage = source.stage().extension();
        let args = [
            OsStr::new("-V"),
            OsStr::new("--target-env"),
            OsStr::new(self.target.glslang_name()),
            OsStr::new("--stdin"),
            OsStr::new("-S"),
            OsStr::new(stage),
            OsStr::new("-o"),
            output.path().as_os_str(),
            limits.path().as_os_str(),
        ];
        if let Err(log) = self.run(&args, preprocessed)? {
            return Err(CompilationFailure::from_log(
                source.name(),
                source.stage(),
                CompilePhase::Compile,
                preprocessed,
                &log,
            )
            .into());
        }

        let bytes = std::fs::read(output.path()).map_err(|e| ShaderError::io(output.path(), e))?;
        spirv_words(&bytes).map_err(|e| ShaderError::InvalidBinary(format!("{}: {e}", source.name())))
    }
}

#[cfg(feature = "shaderc")]
pub use self::shaderc_backend::ShadercCompiler;

#[cfg(feature = "shaderc")]
mod shaderc_backend {
    use super::{collapse_blank_lines, ShaderCompiler, ShaderSource, TargetEnv};
    use crate::diagnostics::{CompilationFailure, CompilePhase};
    use crate::error::{Result, ShaderError};
    use crate::limits::ResourceLimits;
    use quartz_gpu::ShaderStage;

    /// In-process compilation through libshaderc.
    pub struct ShadercCompiler {
        limits: ResourceLimits,
        target: TargetEnv,
    }

    impl ShadercCompiler {
        /// Fails when libshaderc cannot be initialized.
        pub fn new(limits: ResourceLimits) -> Result<Self> {
            shaderc::Compiler::new()
                .ok_or_else(|| ShaderError::CompilerUnavailable("libshaderc failed to initialize".to_string()))?;
            Ok(Self {
                limits,
                target: TargetEnv::host(),
            })
        }

        fn compiler() -> Result<shaderc::Compiler> {
            shaderc::Compiler::new()
                .ok_or_else(|| ShaderError::CompilerUnavailable("libshaderc failed to initialize".to_string()))
        }

        fn options(&self) -> Result<shaderc::CompileOptions<'static>> {
            let mut options = shaderc::CompileOptions::new()
                .ok_or_else(|| ShaderError::CompilerUnavailable("libshaderc options unavailable".to_string()))?;
            let (env, spirv) = match self.target {
                TargetEnv::Vulkan1_2 => (shaderc::EnvVersion::Vulkan1_2, shaderc::SpirvVersion::V1_5),
                TargetEnv::Vulkan1_3 => (shaderc::EnvVersion::Vulkan1_3, shaderc::SpirvVersion::V1_6),
            };
            options.set_target_env(shaderc::TargetEnv::Vulkan, env as u32);
            options.set_target_spirv(spirv);
            options.set_optimization_level(shaderc::OptimizationLevel::Performance);
            for (name, value) in self.limits.entries() {
                if let Some(limit) = limit_for(name) {
                    options.set_limit(limit, value);
                }
            }
            Ok(options)
        }
    }

    fn kind(stage: ShaderStage) -> shaderc::ShaderKind {
        match stage {
            ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
            ShaderStage::TessellationControl => shaderc::ShaderKind::TessControl,
            ShaderStage::TessellationEvaluation => shaderc::ShaderKind::TessEvaluation,
            ShaderStage::Geometry => shaderc::ShaderKind::Geometry,
            ShaderStage::Fragment => shaderc::ShaderKind::Fragment,
            ShaderStage::Compute => shaderc::ShaderKind::Compute,
        }
    }

    fn limit_for(name: &str) -> Option<shaderc::Limit> {
        use shaderc::Limit;

        let limit = match name {
            "MaxLights" => Limit::MaxLights,
            "MaxClipPlanes" => Limit::MaxClipPlanes,
            "MaxTextureUnits" => Limit::MaxTextureUnits,
            "MaxTextureCoords" => Limit::MaxTextureCoords,
            "MaxVertexAttribs" => Limit::MaxVertexAttribs,
            "MaxDrawBuffers" => Limit::MaxDrawBuffers,
            "MaxCombinedTextureImageUnits" => Limit::MaxCombinedTextureImageUnits,
            "MaxClipDistances" => Limit::MaxClipDistances,
            "MaxCullDistances" => Limit::MaxCullDistances,
            "MaxComputeWorkGroupCountX" => Limit::MaxComputeWorkGroupCountX,
            "MaxComputeWorkGroupCountY" => Limit::MaxComputeWorkGroupCountY,
            "MaxComputeWorkGroupCountZ" => Limit::MaxComputeWorkGroupCountZ,
            "MaxComputeWorkGroupSizeX" => Limit::MaxComputeWorkGroupSizeX,
            "MaxComputeWorkGroupSizeY" => Limit::MaxComputeWorkGroupSizeY,
            "MaxComputeWorkGroupSizeZ" => Limit::MaxComputeWorkGroupSizeZ,
            "MaxPatchVertices" => Limit::MaxPatchVertices,
            "MaxTessGenLevel" => Limit::MaxTessGenLevel,
            "MaxViewports" => Limit::MaxViewports,
            "MaxSamples" => Limit::MaxSamples,
            _ => return None,
        };
        Some(limit)
    }

    impl ShaderCompiler for ShadercCompiler {
        fn name(&self) -> &str {
            "shaderc"
        }

        fn preprocess(&self, source: &ShaderSource) -> Result<String> {
            let options = self.options()?;
            Self::compiler()?
                .preprocess(source.code(), source.name(), "main", Some(&options))
                .map(|artifact| collapse_blank_lines(&artifact.as_text()))
                .map_err(|e| {
                    CompilationFailure::from_log(
                        source.name(),
                        source.stage(),
                        CompilePhase::Preprocess,
                        source.code(),
                        &e.to_string(),
                    )
                    .into()
                })
        }

        fn compile(&self, source: &ShaderSource, preprocessed: &str) -> Result<Vec<u32>> {
            let options = self.options()?;
            Self::compiler()?
                .compile_into_spirv(
                    preprocessed,
                    kind(source.stage()),
                    source.name(),
                    "main",
                    Some(&options),
                )
                .map(|artifact| artifact.as_binary().to_vec())
                .map_err(|e| {
                    CompilationFailure::from_log(
                        source.name(),
                        source.stage(),
                        CompilePhase::Compile,
                        preprocessed,
                        &e.to_string(),
                    )
                    .into()
                })
        }
    }
}

/// The best compiler available in this build.
pub fn default_compiler(limits: ResourceLimits) -> Box<dyn ShaderCompiler> {
    #[cfg(feature = "shaderc")]
    {
        match ShadercCompiler::new(limits) {
            Ok(compiler) => return Box::new(compiler),
            Err(e) => tracing::warn!("Falling back to glslangValidator: {e}"),
        }
    }
    Box::new(GlslangCompiler::new(limits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_line_runs_collapse() {
        assert_eq!(collapse_blank_lines("a\n\n\nb\n\nc\n"), "a\nb\nc\n");
        assert_eq!(collapse_blank_lines("a\n  \nb"), "a\n  \nb");
        assert_eq!(collapse_blank_lines(""), "");
    }

    #[test]
    fn stage_comes_from_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lighting.frag");
        std::fs::write(&path, "void main() {}\n").unwrap();

        let source = ShaderSource::from_file(&path).unwrap();
        assert_eq!(source.name(), "lighting");
        assert_eq!(source.stage(), ShaderStage::Fragment);

        let unknown = dir.path().join("notes.txt");
        std::fs::write(&unknown, "").unwrap();
        assert!(matches!(
            ShaderSource::from_file(&unknown),
            Err(ShaderError::UnknownStage(_))
        ));
    }

    #[test]
    fn missing_executable_is_reported_as_unavailable() {
        let compiler = GlslangCompiler::new(ResourceLimits::default())
            .with_executable("/nonexistent/glslangValidator");
        assert!(!compiler.is_available());

        let source = ShaderSource::new("quad", ShaderStage::Vertex, "#version 450\nvoid main() {}\n");
        assert!(matches!(
            compiler.preprocess(&source),
            Err(ShaderError::CompilerUnavailable(_))
        ));
    }

    #[test]
    fn host_target_is_pinned() {
        let expected = if cfg!(target_os = "macos") { "vulkan1.2" } else { "vulkan1.3" };
        assert_eq!(TargetEnv::host().glslang_name(), expected);
    }

    #[test]
    fn target_follows_device_requirement() {
        assert_eq!(TargetEnv::for_api_version(vk::API_VERSION_1_2), TargetEnv::Vulkan1_2);
        assert_eq!(TargetEnv::for_api_version(vk::API_VERSION_1_3), TargetEnv::Vulkan1_3);
        assert_eq!(
            TargetEnv::for_api_version(vk::make_api_version(0, 1, 4, 0)),
            TargetEnv::Vulkan1_3
        );
        // Every device that passes the capability check can load host output
        assert_eq!(TargetEnv::host(), TargetEnv::for_api_version(REQUIRED_API_VERSION));
    }
}
