//! Command pools, command buffers and their recording state.

mod buffer;
mod pool;
mod state;

pub use buffer::CommandBuffer;
pub use pool::CommandPool;
pub use state::{CommandBufferState, StateEvent};
