//! Deduplication of descriptor set layouts and pipeline layouts.
//!
//! Requests describing the same structure share one device object. Entries
//! are held weakly: the object is destroyed when its last user drops it and
//! the next request builds a fresh one.

use super::layout::{PipelineLayout, PipelineLayoutKey, PushConstantRange};
use crate::descriptors::{DescriptorSetLayout, DescriptorSetLayoutDesc, DescriptorSetLayoutKey};
use crate::device::Device;
use crate::error::Result;
use crate::lifecycle::HardwareResource;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

/// Map from a structural key to a shared value that dies with its last user.
pub struct SharedCache<K, V> {
    entries: Mutex<HashMap<K, Weak<V>>>,
}

impl<K: Eq + Hash, V> SharedCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Live value for `key`, or one built by `make`.
    ///
    /// The lock is held while building so concurrent requests for the same
    /// key never create two values.
    pub fn get_or_try_insert_with<E, F>(&self, key: K, make: F) -> std::result::Result<Arc<V>, E>
    where
        F: FnOnce() -> std::result::Result<V, E>,
    {
        let mut entries = self.entries.lock();
        if let Some(value) = entries.get(&key).and_then(Weak::upgrade) {
            return Ok(value);
        }
        let value = Arc::new(make()?);
        entries.retain(|_, entry| entry.strong_count() > 0);
        entries.insert(key, Arc::downgrade(&value));
        Ok(value)
    }

    /// Values still alive.
    pub fn live_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }
}

impl<K: Eq + Hash, V> Default for SharedCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds layouts on demand and reuses structurally identical ones.
pub struct LayoutManager {
    device: Arc<Device>,
    set_layouts: SharedCache<DescriptorSetLayoutKey, DescriptorSetLayout>,
    pipeline_layouts: SharedCache<PipelineLayoutKey, PipelineLayout>,
}

impl LayoutManager {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            set_layouts: SharedCache::new(),
            pipeline_layouts: SharedCache::new(),
        }
    }

    /// Descriptor set layout matching `desc`.
    pub fn descriptor_set_layout(&self, desc: DescriptorSetLayoutDesc) -> Result<Arc<DescriptorSetLayout>> {
        self.set_layouts.get_or_try_insert_with(desc.key(), || {
            tracing::debug!(layout = desc.label(), "Creating descriptor set layout");
            DescriptorSetLayout::create(Arc::clone(&self.device), desc)
        })
    }

    /// Pipeline layout over `set_layouts` (in set order) and `push_constants`.
    pub fn pipeline_layout(
        &self,
        identifier: &str,
        set_layouts: &[Arc<DescriptorSetLayout>],
        push_constants: &[PushConstantRange],
    ) -> Result<Arc<PipelineLayout>> {
        let key = PipelineLayoutKey::of(set_layouts, push_constants);
        self.pipeline_layouts.get_or_try_insert_with(key, || {
            tracing::debug!(layout = identifier, "Creating pipeline layout");
            let mut layout = PipelineLayout::new(
                Arc::clone(&self.device),
                identifier,
                set_layouts.to_vec(),
                push_constants.to_vec(),
            );
            layout.create_on_hardware()?;
            Ok(layout)
        })
    }

    /// Live descriptor set layouts and pipeline layouts.
    pub fn live_counts(&self) -> (usize, usize) {
        (self.set_layouts.live_count(), self.pipeline_layouts.live_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use std::cell::Cell;

    fn material_key() -> DescriptorSetLayoutKey {
        let mut desc = DescriptorSetLayoutDesc::new("material");
        desc.uniform_buffer(0, vk::ShaderStageFlags::FRAGMENT).unwrap();
        desc.combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT)
            .unwrap();
        desc.key()
    }

    fn layout_key(push_size: u32) -> PipelineLayoutKey {
        PipelineLayoutKey::new(
            vec![material_key()],
            vec![PushConstantRange::new(vk::ShaderStageFlags::VERTEX, 0, push_size)],
        )
    }

    #[test]
    fn identical_requests_share_one_value() {
        let cache: SharedCache<PipelineLayoutKey, u32> = SharedCache::new();
        let built = Cell::new(0);
        let make = || -> std::result::Result<u32, ()> {
            built.set(built.get() + 1);
            Ok(built.get())
        };

        let first = cache.get_or_try_insert_with(layout_key(64), make).unwrap();
        let second = cache.get_or_try_insert_with(layout_key(64), make).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.get(), 1);
    }

    #[test]
    fn push_constant_size_splits_entries() {
        let cache: SharedCache<PipelineLayoutKey, &str> = SharedCache::new();
        let small = cache
            .get_or_try_insert_with(layout_key(64), || Ok::<_, ()>("small"))
            .unwrap();
        let large = cache
            .get_or_try_insert_with(layout_key(128), || Ok::<_, ()>("large"))
            .unwrap();

        assert!(!Arc::ptr_eq(&small, &large));
        assert_eq!(cache.live_count(), 2);
    }

    #[test]
    fn dropped_values_are_rebuilt() {
        let cache: SharedCache<DescriptorSetLayoutKey, String> = SharedCache::new();
        let value = cache
            .get_or_try_insert_with(material_key(), || Ok::<_, ()>("first".to_string()))
            .unwrap();
        drop(value);
        assert_eq!(cache.live_count(), 0);

        let rebuilt = cache
            .get_or_try_insert_with(material_key(), || Ok::<_, ()>("second".to_string()))
            .unwrap();
        assert_eq!(rebuilt.as_str(), "second");
    }

    #[test]
    fn equal_descriptions_share_a_pipeline_layout_entry() {
        let reordered = {
            let mut desc = DescriptorSetLayoutDesc::new("material-copy");
            desc.combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT)
                .unwrap();
            desc.uniform_buffer(0, vk::ShaderStageFlags::FRAGMENT).unwrap();
            desc.key()
        };
        let other_stage = {
            let mut desc = DescriptorSetLayoutDesc::new("material");
            desc.uniform_buffer(0, vk::ShaderStageFlags::VERTEX).unwrap();
            desc.combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT)
                .unwrap();
            desc.key()
        };
        let push = [PushConstantRange::new(vk::ShaderStageFlags::VERTEX, 0, 64)];

        let a = PipelineLayoutKey::from_set_keys([material_key()], &push);
        let b = PipelineLayoutKey::from_set_keys([reordered], &push);
        let c = PipelineLayoutKey::from_set_keys([other_stage], &push);
        let d = PipelineLayoutKey::from_set_keys([material_key()], &[]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let cache: SharedCache<PipelineLayoutKey, &str> = SharedCache::new();
        let first = cache.get_or_try_insert_with(a, || Ok::<_, ()>("first")).unwrap();
        let shared = cache.get_or_try_insert_with(b.clone(), || Ok::<_, ()>("second")).unwrap();
        assert!(Arc::ptr_eq(&first, &shared));
        assert_eq!(cache.live_count(), 1);

        drop(first);
        drop(shared);
        assert_eq!(cache.live_count(), 0);
        let rebuilt = cache.get_or_try_insert_with(b, || Ok::<_, ()>("rebuilt")).unwrap();
        assert_eq!(*rebuilt, "rebuilt");
    }

    #[test]
    fn failed_builds_are_not_cached() {
        let cache: SharedCache<u8, u8> = SharedCache::new();
        assert!(cache.get_or_try_insert_with(1, || Err("boom")).is_err());
        assert_eq!(*cache.get_or_try_insert_with(1, || Ok::<_, &str>(7)).unwrap(), 7);
    }
}
