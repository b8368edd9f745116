//! Sandboxed GPU frame renderer with a lock-free shared-memory frame channel.
//!
//! A guest hands command buffers to a [`renderer::Renderer`], which turns
//! each batch into one frame and publishes it to a shared-memory channel.
//! Display consumers attach with [`channel::ChannelReader`] and always see
//! the latest complete frame.
//!
//! # Crate Structure
//!
//! - [`shm`]: POSIX shared-memory segments and the monotonic clock
//! - [`channel`]: Frame buffers, geometry and the seqlock frame channel
//! - [`renderer`]: Renderer facade, backends, sandbox and worker processes

/// Re-export shared-memory types.
pub mod shm {
    pub use framepipe_shm::*;
}

/// Re-export frame channel types.
pub mod channel {
    pub use framepipe_channel::*;
}

/// Re-export renderer types.
pub mod renderer {
    pub use framepipe_renderer::*;
}
