//! Quartz device and shader cache probe.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p quartz-probe -- caps
//! cargo run -p quartz-probe -- compile shaders/mesh.vert shaders/mesh.frag
//! cargo run -p quartz-probe -- --cache target/shaders cache list
//! cargo run -p quartz-probe -- cache clear
//! ```
//!
//! ## Options
//!
//! - `--cache <DIR>`: Shader cache root (default: cache/shaders)
//! - `--no-binary-cache`: Always invoke the compiler
//! - `--load`: Also create shader modules on the device after compiling
//! - `--validation`: Enable Vulkan validation layers
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use quartz_gpu::{Device, DeviceBuilder};
use quartz_shaders::{ShaderError, ShaderManager, ShaderManagerConfig, ShaderSource};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
enum Command {
    Caps,
    Compile(Vec<PathBuf>),
    CacheList,
    CacheClear,
}

#[derive(Debug)]
struct Options {
    command: Command,
    cache_root: Option<PathBuf>,
    binary_cache: bool,
    load: bool,
    validation: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Some(options) = parse_args(std::env::args().skip(1))? else {
        print_help();
        return Ok(());
    };

    match &options.command {
        Command::Caps => caps(&options),
        Command::Compile(files) => compile(&options, files),
        Command::CacheList => cache_list(&options),
        Command::CacheClear => cache_clear(&options),
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Option<Options>> {
    let mut cache_root = None;
    let mut binary_cache = true;
    let mut load = false;
    let mut validation = false;
    let mut positional = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "--cache" => {
                let dir = args.next().context("--cache expects a directory")?;
                cache_root = Some(PathBuf::from(dir));
            }
            "--no-binary-cache" => binary_cache = false,
            "--load" => load = true,
            "--validation" => validation = true,
            flag if flag.starts_with("--") => bail!("Unknown option '{flag}'"),
            _ => positional.push(arg),
        }
    }

    let command = match positional.first().map(String::as_str) {
        None => return Ok(None),
        Some("caps") => Command::Caps,
        Some("compile") => {
            let files: Vec<PathBuf> = positional[1..].iter().map(PathBuf::from).collect();
            if files.is_empty() {
                bail!("compile expects at least one shader file");
            }
            Command::Compile(files)
        }
        Some("cache") => match positional.get(1).map(String::as_str) {
            Some("list") | None => Command::CacheList,
            Some("clear") => Command::CacheClear,
            Some(other) => bail!("Unknown cache command '{other}'"),
        },
        Some(other) => bail!("Unknown command '{other}'"),
    };

    Ok(Some(Options {
        command,
        cache_root,
        binary_cache,
        load,
        validation,
    }))
}

fn print_help() {
    println!("Quartz probe");
    println!();
    println!("Usage: quartz-probe [OPTIONS] <COMMAND>");
    println!();
    println!("Commands:");
    println!("  caps                 Print the capabilities of the selected GPU");
    println!("  compile <FILES>...   Compile shader files through the shader cache");
    println!("  cache list           List cached sources and binaries");
    println!("  cache clear          Delete every cached file");
    println!();
    println!("Options:");
    println!("      --cache <DIR>        Shader cache root (default: cache/shaders)");
    println!("      --no-binary-cache    Always invoke the compiler");
    println!("      --load               Create shader modules on the device");
    println!("      --validation         Enable Vulkan validation layers");
    println!("  -h, --help               Show this help message");
}

fn device(options: &Options) -> anyhow::Result<Arc<Device>> {
    DeviceBuilder::new()
        .app_name("quartz-probe")
        .validation(options.validation)
        .build()
        .context("Failed to create Vulkan device")
}

fn manager(options: &Options) -> anyhow::Result<ShaderManager> {
    let mut config = ShaderManagerConfig::default().with_binary_cache(options.binary_cache);
    if let Some(root) = &options.cache_root {
        config = config.with_cache_root(root);
    }
    let manager = ShaderManager::with_default_compiler(config)?;
    info!(compiler = manager.compiler_name(), "Shader manager ready");
    Ok(manager)
}

fn caps(options: &Options) -> anyhow::Result<()> {
    let device = device(options)?;
    let caps = device.capabilities();
    println!("{}", caps.summary());
    if !caps.meets_requirements() {
        warn!("Device is below the minimum requirements");
    }
    Ok(())
}

fn compile(options: &Options, files: &[PathBuf]) -> anyhow::Result<()> {
    let mut manager = manager(options)?;
    let device = if options.load { Some(device(options)?) } else { None };

    let mut failures = 0_usize;
    for path in files {
        let source = ShaderSource::from_file(path)?;
        let result = match &device {
            Some(device) => manager
                .get_shader_module(device, &source)
                .map(|module| format!("module {:?}", module.handle())),
            None => manager
                .compile_binary(&source)
                .map(|shader| format!("{} words {:?} hash {:016x}", shader.spirv.len(), shader.origin, shader.hash)),
        };

        match result {
            Ok(summary) => println!("{} ({}): {summary}", source.name(), source.stage()),
            Err(ShaderError::Compilation(failure)) => {
                failures += 1;
                eprintln!("{failure}");
                eprintln!("{}", failure.annotated_source);
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to compile {}", path.display())),
        }
    }

    if failures > 0 {
        bail!("{failures} of {} shaders failed to compile", files.len());
    }
    Ok(())
}

fn cache_list(options: &Options) -> anyhow::Result<()> {
    let manager = manager(options)?;
    let cache = manager.cache();

    println!("Sources ({}):", cache.source_count());
    for (hash, path) in cache.sources() {
        println!("  {hash:016x}  {}", path.display());
    }
    println!("Binaries ({}):", cache.binary_count());
    for (hash, path) in cache.binaries() {
        println!("  {hash:016x}  {}", path.display());
    }
    Ok(())
}

fn cache_clear(options: &Options) -> anyhow::Result<()> {
    let mut manager = manager(options)?;
    let removed = manager.clear_cache();
    println!("Removed {removed} cached files");
    Ok(())
}
