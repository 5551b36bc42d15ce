//! Synchronization primitives.
//!
//! Fences order GPU work against the host, semaphores order GPU work
//! against other GPU work, events are binary flags settable from either
//! side, and barriers declare memory dependencies inside a command buffer.

mod barrier;
mod event;
mod fence;
mod semaphore;

pub use barrier::{layout_access, BufferBarrier, ImageBarrier, MemoryBarrier, PipelineBarrier};
pub use event::Event;
pub use fence::{Fence, FenceStatus, WAIT_FOREVER};
pub(crate) use fence::PendingFences;
pub use semaphore::Semaphore;
