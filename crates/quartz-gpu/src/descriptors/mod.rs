//! Descriptor set layouts, pools and sets.

mod layout;
mod pool;
mod set;

pub use layout::{DescriptorBinding, DescriptorSetLayout, DescriptorSetLayoutDesc, DescriptorSetLayoutKey};
pub use pool::{DescriptorPool, DescriptorPoolDesc};
pub use set::DescriptorSet;
