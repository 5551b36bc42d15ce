//! Shader manager: hot cache, disk caches and compilation.
//!
//! A request is served from the first tier that has it:
//! 1. the hot cache of loaded modules, keyed by content hash;
//! 2. the binary cache on disk;
//! 3. the compiler, after which both disk caches are populated.
//!
//! The content hash covers the stage and the source text as given, so the
//! first two tiers never run the preprocessor.
//!
//! Disk cache writes are best effort. Compilation failures are returned to
//! the caller and also broadcast to every subscriber.

use crate::cache::{content_hash, ShaderCache};
use crate::compiler::{default_compiler, ShaderCompiler, ShaderSource};
use crate::diagnostics::{annotate_source, CompilationFailure};
use crate::error::{Result, ShaderError};
use crate::limits::ResourceLimits;
use crossbeam::channel::{self, Receiver, Sender};
use quartz_gpu::{Device, HardwareResource, ShaderModule, ShaderStage};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Shader manager configuration.
#[derive(Debug, Clone)]
pub struct ShaderManagerConfig {
    /// Directory holding the source and binary caches.
    pub cache_root: PathBuf,
    pub source_cache: bool,
    pub binary_cache: bool,
    /// Erase both caches instead of indexing them at startup.
    pub clear_on_start: bool,
    /// Log the preprocessed source of every compiled shader.
    pub log_loaded_source: bool,
}

impl Default for ShaderManagerConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("cache").join("shaders"),
            source_cache: true,
            binary_cache: true,
            clear_on_start: false,
            log_loaded_source: false,
        }
    }
}

impl ShaderManagerConfig {
    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = root.into();
        self
    }

    pub fn with_source_cache(mut self, enabled: bool) -> Self {
        self.source_cache = enabled;
        self
    }

    pub fn with_binary_cache(mut self, enabled: bool) -> Self {
        self.binary_cache = enabled;
        self
    }

    pub fn with_clear_on_start(mut self, clear: bool) -> Self {
        self.clear_on_start = clear;
        self
    }

    pub fn with_log_loaded_source(mut self, log: bool) -> Self {
        self.log_loaded_source = log;
        self
    }
}

/// Where a shader binary came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOrigin {
    BinaryCache,
    Compiled,
}

/// SPIR-V for one shader, with its content hash.
#[derive(Debug, Clone)]
pub struct CompiledShader {
    pub name: String,
    pub stage: ShaderStage,
    pub hash: u64,
    pub spirv: Vec<u32>,
    pub origin: BinaryOrigin,
}

pub struct ShaderManager {
    config: ShaderManagerConfig,
    compiler: Box<dyn ShaderCompiler>,
    cache: ShaderCache,
    loaded: HashMap<u64, Arc<ShaderModule>>,
    subscribers: Vec<Sender<CompilationFailure>>,
}

impl ShaderManager {
    /// Open the caches, then index or clear them.
    pub fn new(config: ShaderManagerConfig, compiler: Box<dyn ShaderCompiler>) -> Result<Self> {
        let mut cache = ShaderCache::open(&config.cache_root)?;
        if config.clear_on_start {
            let removed = cache.clear();
            tracing::info!(removed, "Shader cache cleared on start");
        } else {
            cache.rebuild_index();
        }

        tracing::info!(
            compiler = compiler.name(),
            root = %config.cache_root.display(),
            binaries = cache.binary_count(),
            "Shader manager ready"
        );
        Ok(Self {
            config,
            compiler,
            cache,
            loaded: HashMap::new(),
            subscribers: Vec::new(),
        })
    }

    /// Manager over the best compiler of this build with default limits.
    pub fn with_default_compiler(config: ShaderManagerConfig) -> Result<Self> {
        Self::new(config, default_compiler(ResourceLimits::default()))
    }

    pub fn config(&self) -> &ShaderManagerConfig {
        &self.config
    }

    pub fn cache(&self) -> &ShaderCache {
        &self.cache
    }

    pub fn compiler_name(&self) -> &str {
        self.compiler.name()
    }

    /// Receive every future compilation failure.
    pub fn subscribe(&mut self) -> Receiver<CompilationFailure> {
        let (sender, receiver) = channel::unbounded();
        self.subscribers.push(sender);
        receiver
    }

    /// Log and broadcast compilation failures; other errors pass through.
    fn report(&mut self, error: ShaderError) -> ShaderError {
        if let Some(failure) = error.compilation_failure() {
            tracing::error!(
                shader = %failure.shader,
                "{failure}\n****** START OF ERRONEOUS SHADER CODE ******\n{}****** END OF ERRONEOUS SHADER CODE ******",
                failure.annotated_source
            );
            self.subscribers
                .retain(|subscriber| subscriber.send(failure.clone()).is_ok());
        }
        error
    }

    /// Content hash of a non-empty source.
    fn identify(source: &ShaderSource) -> Result<u64> {
        if source.code().trim().is_empty() {
            tracing::error!(shader = source.name(), "The shader has an empty source code");
            return Err(ShaderError::EmptySource(source.name().to_string()));
        }
        Ok(content_hash(source.stage(), source.code()))
    }

    /// Binary cache, then preprocess and compile.
    fn binary(&mut self, source: &ShaderSource, hash: u64) -> Result<CompiledShader> {
        let compiled = |spirv, origin| CompiledShader {
            name: source.name().to_string(),
            stage: source.stage(),
            hash,
            spirv,
            origin,
        };

        if self.config.binary_cache {
            if let Some(spirv) = self.cache.load_binary(hash) {
                tracing::debug!(shader = source.name(), "Shader loaded from binary cache");
                return Ok(compiled(spirv, BinaryOrigin::BinaryCache));
            }
        }

        if self.config.source_cache {
            if let Err(e) = self.cache.store_source(source, hash) {
                tracing::warn!(shader = source.name(), "Unable to write shader source cache: {e}");
            }
        }

        let preprocessed = self
            .compiler
            .preprocess(source)
            .map_err(|e| self.report(e))?;
        if self.config.log_loaded_source {
            tracing::info!(
                shader = source.name(),
                "\n{}",
                annotate_source(&preprocessed, &[])
            );
        }

        let spirv = self
            .compiler
            .compile(source, &preprocessed)
            .map_err(|e| self.report(e))?;
        tracing::info!(shader = source.name(), words = spirv.len(), "Shader compiled");

        if self.config.binary_cache {
            if let Err(e) = self.cache.store_binary(source.name(), hash, &spirv) {
                tracing::warn!(shader = source.name(), "Unable to write shader binary cache: {e}");
            }
        }
        Ok(compiled(spirv, BinaryOrigin::Compiled))
    }

    /// SPIR-V for `source`, from the binary cache or the compiler.
    pub fn compile_binary(&mut self, source: &ShaderSource) -> Result<CompiledShader> {
        let hash = Self::identify(source)?;
        self.binary(source, hash)
    }

    /// Shader module for `source`, created on `device` unless already loaded.
    pub fn get_shader_module(&mut self, device: &Arc<Device>, source: &ShaderSource) -> Result<Arc<ShaderModule>> {
        let hash = Self::identify(source)?;
        if let Some(module) = self.loaded.get(&hash) {
            tracing::debug!(shader = source.name(), "Shader already loaded");
            return Ok(Arc::clone(module));
        }

        let compiled = self.binary(source, hash)?;
        let mut module = ShaderModule::new(
            Arc::clone(device),
            format!("ShaderManager-{}-ShaderModule", source.name()),
            compiled.stage,
            compiled.spirv,
        );
        module.create_on_hardware().inspect_err(|e| {
            tracing::error!(shader = source.name(), "Unable to create a shader module: {e}");
        })?;

        let module = Arc::new(module);
        self.loaded.insert(hash, Arc::clone(&module));
        Ok(module)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    /// Drop the hot cache. Modules still held elsewhere stay alive.
    pub fn unload_all(&mut self) {
        self.loaded.clear();
    }

    /// Erase both disk caches and the hot cache. Returns the files removed.
    pub fn clear_cache(&mut self) -> usize {
        self.loaded.clear();
        let removed = self.cache.clear();
        tracing::info!(removed, "Shader cache cleared");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::collapse_blank_lines;
    use crate::diagnostics::CompilePhase;
    use quartz_gpu::SPIRV_MAGIC;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Calls {
        preprocesses: AtomicUsize,
        compiles: AtomicUsize,
    }

    impl Calls {
        fn preprocesses(&self) -> usize {
            self.preprocesses.load(Ordering::SeqCst)
        }

        fn compiles(&self) -> usize {
            self.compiles.load(Ordering::SeqCst)
        }
    }

    /// Fake compiler emitting a header plus one word per source byte.
    struct CountingCompiler {
        calls: Arc<Calls>,
    }

    impl ShaderCompiler for CountingCompiler {
        fn name(&self) -> &str {
            "counting"
        }

        fn preprocess(&self, source: &ShaderSource) -> Result<String> {
            self.calls.preprocesses.fetch_add(1, Ordering::SeqCst);
            if source.code().contains("#error") {
                return Err(CompilationFailure::from_log(
                    source.name(),
                    source.stage(),
                    CompilePhase::Preprocess,
                    source.code(),
                    "ERROR: 0:1: '#error' : forced",
                )
                .into());
            }
            Ok(collapse_blank_lines(source.code()))
        }

        fn compile(&self, source: &ShaderSource, preprocessed: &str) -> Result<Vec<u32>> {
            self.calls.compiles.fetch_add(1, Ordering::SeqCst);
            if preprocessed.contains("broken") {
                return Err(CompilationFailure::from_log(
                    source.name(),
                    source.stage(),
                    CompilePhase::Compile,
                    preprocessed,
                    "ERROR: 0:2: 'broken' : undeclared identifier",
                )
                .into());
            }
            let mut words = vec![SPIRV_MAGIC, 0x0001_0600, 0, 1, 0];
            words.extend(preprocessed.bytes().map(u32::from));
            Ok(words)
        }
    }

    fn open_manager(config: ShaderManagerConfig) -> (ShaderManager, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let compiler = CountingCompiler {
            calls: Arc::clone(&calls),
        };
        (ShaderManager::new(config, Box::new(compiler)).unwrap(), calls)
    }

    fn quad() -> ShaderSource {
        ShaderSource::new("quad", ShaderStage::Vertex, "#version 450\n\n\nvoid main() {}\n")
    }

    #[test]
    fn cache_miss_compiles_once_and_next_run_hits_binary_cache() {
        let root = tempfile::tempdir().unwrap();
        let config = ShaderManagerConfig::default().with_cache_root(root.path());

        let (mut first, first_calls) = open_manager(config.clone());
        let compiled = first.compile_binary(&quad()).unwrap();
        assert_eq!(compiled.origin, BinaryOrigin::Compiled);
        assert_eq!(first_calls.preprocesses(), 1);
        assert_eq!(first_calls.compiles(), 1);
        assert!(first.cache().contains_source(compiled.hash));
        assert!(first.cache().contains_binary(compiled.hash));
        drop(first);

        let (mut second, second_calls) = open_manager(config);
        for _ in 0..2 {
            let reloaded = second.compile_binary(&quad()).unwrap();
            assert_eq!(reloaded.origin, BinaryOrigin::BinaryCache);
            assert_eq!(reloaded.hash, compiled.hash);
            assert_eq!(reloaded.spirv, compiled.spirv);
        }
        assert_eq!(second_calls.preprocesses(), 0);
        assert_eq!(second_calls.compiles(), 0);
    }

    /// Compiler that fails every call, standing in for a missing executable.
    struct UnavailableCompiler;

    impl ShaderCompiler for UnavailableCompiler {
        fn name(&self) -> &str {
            "unavailable"
        }

        fn preprocess(&self, _source: &ShaderSource) -> Result<String> {
            Err(ShaderError::CompilerUnavailable("glslangValidator".to_string()))
        }

        fn compile(&self, _source: &ShaderSource, _preprocessed: &str) -> Result<Vec<u32>> {
            Err(ShaderError::CompilerUnavailable("glslangValidator".to_string()))
        }
    }

    #[test]
    fn indexed_binary_loads_without_a_compiler() {
        let root = tempfile::tempdir().unwrap();
        let config = ShaderManagerConfig::default().with_cache_root(root.path());

        let (mut first, _) = open_manager(config.clone());
        let compiled = first.compile_binary(&quad()).unwrap();
        drop(first);

        let mut offline = ShaderManager::new(config, Box::new(UnavailableCompiler)).unwrap();
        let reloaded = offline.compile_binary(&quad()).unwrap();
        assert_eq!(reloaded.origin, BinaryOrigin::BinaryCache);
        assert_eq!(reloaded.spirv, compiled.spirv);

        let fresh = ShaderSource::new("fresh", ShaderStage::Vertex, "void main() {}\n");
        assert!(matches!(
            offline.compile_binary(&fresh),
            Err(ShaderError::CompilerUnavailable(_))
        ));
    }

    #[test]
    fn hash_covers_stage_and_source_text() {
        let root = tempfile::tempdir().unwrap();
        let (mut manager, calls) = open_manager(ShaderManagerConfig::default().with_cache_root(root.path()));
        let spaced = manager.compile_binary(&quad()).unwrap();
        let tight = ShaderSource::new("quad", ShaderStage::Vertex, "#version 450\nvoid main() {}\n");
        let tight = manager.compile_binary(&tight).unwrap();
        let fragment = ShaderSource::new("quad", ShaderStage::Fragment, quad().code());
        let fragment = manager.compile_binary(&fragment).unwrap();

        assert_ne!(spaced.hash, tight.hash);
        assert_ne!(spaced.hash, fragment.hash);
        assert_eq!(tight.origin, BinaryOrigin::Compiled);
        assert_eq!(calls.compiles(), 3);

        let again = manager.compile_binary(&quad()).unwrap();
        assert_eq!(again.hash, spaced.hash);
        assert_eq!(again.origin, BinaryOrigin::BinaryCache);
        assert_eq!(calls.preprocesses(), 3);
    }

    #[test]
    fn failures_are_returned_and_broadcast() {
        let root = tempfile::tempdir().unwrap();
        let (mut manager, _) = open_manager(ShaderManagerConfig::default().with_cache_root(root.path()));
        let failures = manager.subscribe();

        let broken = ShaderSource::new("broken", ShaderStage::Fragment, "#version 450\nbroken = 1;\n");
        let err = manager.compile_binary(&broken).unwrap_err();
        let failure = err.compilation_failure().unwrap();
        assert_eq!(failure.phase, CompilePhase::Compile);
        assert_eq!(failure.diagnostics[0].line, Some(2));
        assert!(failure.annotated_source.contains("^ error: 'broken'"));

        let received = failures.try_recv().unwrap();
        assert_eq!(received.shader, "broken");
        assert_eq!(manager.cache().binary_count(), 0);

        let forced = ShaderSource::new("forced", ShaderStage::Vertex, "#error stop\n");
        assert!(manager.compile_binary(&forced).is_err());
        assert_eq!(failures.try_recv().unwrap().phase, CompilePhase::Preprocess);
    }

    #[test]
    fn dropped_subscribers_are_forgotten() {
        let root = tempfile::tempdir().unwrap();
        let (mut manager, _) = open_manager(ShaderManagerConfig::default().with_cache_root(root.path()));
        drop(manager.subscribe());
        let kept = manager.subscribe();

        let broken = ShaderSource::new("broken", ShaderStage::Fragment, "broken\n");
        assert!(manager.compile_binary(&broken).is_err());
        assert_eq!(manager.subscribers.len(), 1);
        assert!(kept.try_recv().is_ok());
    }

    #[test]
    fn disabled_caches_compile_every_time() {
        let root = tempfile::tempdir().unwrap();
        let config = ShaderManagerConfig::default()
            .with_cache_root(root.path())
            .with_source_cache(false)
            .with_binary_cache(false);
        let (mut manager, calls) = open_manager(config);

        manager.compile_binary(&quad()).unwrap();
        manager.compile_binary(&quad()).unwrap();
        assert_eq!(calls.compiles(), 2);
        assert_eq!(manager.cache().source_count(), 0);
        assert_eq!(manager.cache().binary_count(), 0);
    }

    #[test]
    fn source_cache_write_failure_is_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let (mut manager, _) = open_manager(ShaderManagerConfig::default().with_cache_root(root.path()));
        std::fs::remove_dir_all(manager.cache().source_dir()).unwrap();

        let compiled = manager.compile_binary(&quad()).unwrap();
        assert_eq!(compiled.origin, BinaryOrigin::Compiled);
        assert!(manager.cache().contains_binary(compiled.hash));
    }

    #[test]
    fn clearing_forces_recompilation() {
        let root = tempfile::tempdir().unwrap();
        let config = ShaderManagerConfig::default().with_cache_root(root.path());
        let (mut manager, calls) = open_manager(config.clone());
        manager.compile_binary(&quad()).unwrap();

        assert_eq!(manager.clear_cache(), 2);
        manager.compile_binary(&quad()).unwrap();
        assert_eq!(calls.compiles(), 2);
        drop(manager);

        let (restarted, _) = open_manager(config.with_clear_on_start(true));
        assert_eq!(restarted.cache().binary_count(), 0);
        assert_eq!(restarted.cache().source_count(), 0);
    }

    #[test]
    fn empty_source_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let (mut manager, calls) = open_manager(ShaderManagerConfig::default().with_cache_root(root.path()));
        let empty = ShaderSource::new("empty", ShaderStage::Compute, "  \n");
        assert!(matches!(
            manager.compile_binary(&empty),
            Err(ShaderError::EmptySource(_))
        ));
        assert_eq!(calls.preprocesses(), 0);
        assert_eq!(calls.compiles(), 0);
    }
}
