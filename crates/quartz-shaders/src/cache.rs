//! On-disk shader caches.
//!
//! Two directories live under the cache root: one holding generated GLSL
//! sources and one holding compiled SPIR-V. Files are named
//! `<name>_<hash>.<extension>` with the content hash in hexadecimal, which
//! lets the in-memory index be rebuilt from a directory listing alone.

use crate::compiler::ShaderSource;
use crate::error::{Result, ShaderError};
use quartz_gpu::{spirv_words, ShaderStage};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const SOURCE_DIR: &str = "sources";
pub const BINARY_DIR: &str = "binaries";
pub const BINARY_EXTENSION: &str = "bin";

/// Content hash of a shader: stage plus source text.
///
/// Zero is reserved as the invalid hash and never returned.
pub fn content_hash(stage: ShaderStage, code: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(stage.extension().as_bytes());
    hasher.update(&[0]);
    hasher.update(code.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    match u64::from_le_bytes(bytes) {
        0 => 1,
        hash => hash,
    }
}

/// Shader name usable in a cache file name: no `_`, `.` or separators.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '_' | '.' | '/' | '\\' | ':' => '-',
            c if c.is_whitespace() => '-',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "shader".to_string()
    } else {
        cleaned
    }
}

pub fn source_file_name(name: &str, stage: ShaderStage, hash: u64) -> String {
    format!("{}_{hash:016x}.{}", sanitize_name(name), stage.extension())
}

pub fn binary_file_name(name: &str, hash: u64) -> String {
    format!("{}_{hash:016x}.{BINARY_EXTENSION}", sanitize_name(name))
}

/// Hash encoded in a cache file name, if the name is well formed.
pub fn parse_hash(file_name: &str) -> Option<u64> {
    let parts: Vec<&str> = file_name.split('_').collect();
    let [name, rest] = parts.as_slice() else {
        return None;
    };
    let pieces: Vec<&str> = rest.split('.').collect();
    let [hash, extension] = pieces.as_slice() else {
        return None;
    };
    if name.is_empty() || extension.is_empty() {
        return None;
    }
    u64::from_str_radix(hash, 16).ok().filter(|&hash| hash != 0)
}

fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .and_then(ShaderStage::from_extension)
        .is_some()
}

fn is_binary_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|extension| extension == BINARY_EXTENSION)
}

/// Files directly inside `dir` accepted by `filter`.
fn cache_files(dir: &Path, filter: fn(&Path) -> bool) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), "Unable to read cache entry: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && filter(entry.path()))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

fn index(dir: &Path, filter: fn(&Path) -> bool) -> HashMap<u64, PathBuf> {
    let mut entries = HashMap::new();
    for path in cache_files(dir, filter) {
        let hash = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_hash);
        match hash {
            Some(hash) => {
                entries.insert(hash, path);
            }
            None => tracing::error!(file = %path.display(), "The hash from cache file is invalid"),
        }
    }
    entries
}

/// Index of the source and binary cache directories.
#[derive(Debug)]
pub struct ShaderCache {
    source_dir: PathBuf,
    binary_dir: PathBuf,
    sources: HashMap<u64, PathBuf>,
    binaries: HashMap<u64, PathBuf>,
}

impl ShaderCache {
    /// Create both directories under `root` if needed. The index starts empty.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let source_dir = root.join(SOURCE_DIR);
        let binary_dir = root.join(BINARY_DIR);
        for dir in [&source_dir, &binary_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                tracing::error!(dir = %dir.display(), "Unable to create cache directory: {e}");
                ShaderError::io(dir, e)
            })?;
        }
        Ok(Self {
            source_dir,
            binary_dir,
            sources: HashMap::new(),
            binaries: HashMap::new(),
        })
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn binary_dir(&self) -> &Path {
        &self.binary_dir
    }

    /// Rebuild both indices from the directory contents.
    ///
    /// Files with malformed names are logged and skipped.
    pub fn rebuild_index(&mut self) {
        self.sources = index(&self.source_dir, is_source_file);
        self.binaries = index(&self.binary_dir, is_binary_file);
        tracing::debug!(
            sources = self.sources.len(),
            binaries = self.binaries.len(),
            "Shader cache indexed"
        );
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn binary_count(&self) -> usize {
        self.binaries.len()
    }

    pub fn contains_source(&self, hash: u64) -> bool {
        self.sources.contains_key(&hash)
    }

    pub fn contains_binary(&self, hash: u64) -> bool {
        self.binaries.contains_key(&hash)
    }

    /// Indexed source files, in no particular order.
    pub fn sources(&self) -> impl Iterator<Item = (u64, &Path)> {
        self.sources.iter().map(|(hash, path)| (*hash, path.as_path()))
    }

    /// Indexed binary files, in no particular order.
    pub fn binaries(&self) -> impl Iterator<Item = (u64, &Path)> {
        self.binaries.iter().map(|(hash, path)| (*hash, path.as_path()))
    }

    /// Read and validate the binary indexed under `hash`.
    ///
    /// An unreadable or invalid file is dropped from the index and reported
    /// as absent.
    pub fn load_binary(&mut self, hash: u64) -> Option<Vec<u32>> {
        let path = self.binaries.get(&hash)?;
        let loaded = fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| spirv_words(&bytes).map_err(|e| e.to_string()));
        match loaded {
            Ok(words) => Some(words),
            Err(e) => {
                tracing::warn!(file = %path.display(), "Discarding cached shader binary: {e}");
                self.binaries.remove(&hash);
                None
            }
        }
    }

    /// Write the source of `shader` under `hash`.
    pub fn store_source(&mut self, shader: &ShaderSource, hash: u64) -> Result<PathBuf> {
        let path = self
            .source_dir
            .join(source_file_name(shader.name(), shader.stage(), hash));
        fs::write(&path, shader.code()).map_err(|e| ShaderError::io(&path, e))?;
        self.sources.insert(hash, path.clone());
        Ok(path)
    }

    /// Write compiled SPIR-V under `hash`.
    pub fn store_binary(&mut self, name: &str, hash: u64, spirv: &[u32]) -> Result<PathBuf> {
        let path = self.binary_dir.join(binary_file_name(name, hash));
        fs::write(&path, bytemuck::cast_slice::<u32, u8>(spirv)).map_err(|e| ShaderError::io(&path, e))?;
        self.binaries.insert(hash, path.clone());
        Ok(path)
    }

    /// Erase every cache file and empty both indices. Returns the number
    /// of files removed.
    pub fn clear(&mut self) -> usize {
        let mut removed = 0;
        let files = cache_files(&self.source_dir, is_source_file)
            .into_iter()
            .chain(cache_files(&self.binary_dir, is_binary_file));
        for path in files {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::error!(file = %path.display(), "Unable to erase cache file: {e}"),
            }
        }
        self.sources.clear();
        self.binaries.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quartz_gpu::SPIRV_MAGIC;

    fn module() -> Vec<u32> {
        vec![SPIRV_MAGIC, 0x0001_0600, 0, 8, 0]
    }

    #[test]
    fn file_names_round_trip_through_parse() {
        let hash = content_hash(ShaderStage::Fragment, "void main() {}\n");
        let name = source_file_name("deferred_light.pass", ShaderStage::Fragment, hash);
        assert!(name.starts_with("deferred-light-pass_"));
        assert!(name.ends_with(".frag"));
        assert_eq!(parse_hash(&name), Some(hash));
        assert_eq!(parse_hash(&binary_file_name("mesh", hash)), Some(hash));
    }

    #[test]
    fn malformed_names_are_rejected() {
        assert_eq!(parse_hash("mesh.bin"), None);
        assert_eq!(parse_hash("mesh_a_1f.bin"), None);
        assert_eq!(parse_hash("mesh_1f.tar.bin"), None);
        assert_eq!(parse_hash("mesh_zz.bin"), None);
        assert_eq!(parse_hash("mesh_0.bin"), None);
        assert_eq!(parse_hash("_1f.bin"), None);
        assert_eq!(parse_hash("mesh_1f.bin"), Some(0x1f));
    }

    #[test]
    fn hash_depends_on_stage_and_text() {
        let vertex = content_hash(ShaderStage::Vertex, "void main() {}");
        assert_eq!(vertex, content_hash(ShaderStage::Vertex, "void main() {}"));
        assert_ne!(vertex, content_hash(ShaderStage::Fragment, "void main() {}"));
        assert_ne!(vertex, content_hash(ShaderStage::Vertex, "void main() { }"));
        assert_ne!(vertex, 0);
    }

    #[test]
    fn rebuilt_index_finds_stored_files_and_skips_corrupt_names() {
        let root = tempfile::tempdir().unwrap();
        let mut cache = ShaderCache::open(root.path()).unwrap();
        let source = ShaderSource::new("mesh", ShaderStage::Vertex, "void main() {}\n");
        cache.store_source(&source, 7).unwrap();
        cache.store_binary("mesh", 7, &module()).unwrap();
        fs::write(cache.binary_dir().join("broken.bin"), b"junk").unwrap();
        fs::write(cache.source_dir().join("readme.txt"), b"ignored").unwrap();

        let mut reopened = ShaderCache::open(root.path()).unwrap();
        assert_eq!(reopened.binary_count(), 0);
        reopened.rebuild_index();
        assert!(reopened.contains_source(7));
        assert!(reopened.contains_binary(7));
        assert_eq!(reopened.binary_count(), 1);
        assert_eq!(reopened.load_binary(7), Some(module()));
    }

    #[test]
    fn invalid_binary_is_dropped_from_index() {
        let root = tempfile::tempdir().unwrap();
        let mut cache = ShaderCache::open(root.path()).unwrap();
        fs::write(cache.binary_dir().join(binary_file_name("mesh", 9)), [1u8, 2, 3, 4, 5]).unwrap();
        cache.rebuild_index();
        assert!(cache.contains_binary(9));

        assert_eq!(cache.load_binary(9), None);
        assert!(!cache.contains_binary(9));
    }

    #[test]
    fn clear_erases_files_and_indices() {
        let root = tempfile::tempdir().unwrap();
        let mut cache = ShaderCache::open(root.path()).unwrap();
        let source = ShaderSource::new("mesh", ShaderStage::Compute, "void main() {}\n");
        cache.store_source(&source, 3).unwrap();
        cache.store_binary("mesh", 3, &module()).unwrap();
        fs::write(cache.source_dir().join("keep.txt"), b"not a shader").unwrap();

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.source_count(), 0);
        assert_eq!(cache.binary_count(), 0);
        assert!(cache.source_dir().join("keep.txt").exists());

        cache.rebuild_index();
        assert_eq!(cache.binary_count(), 0);
    }
}
