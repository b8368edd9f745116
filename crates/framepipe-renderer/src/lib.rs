//! Renderer facade and backends for framepipe.
//!
//! A [`Renderer`] owns one [`Backend`] (stub or native) and one frame
//! channel writer. Each command batch handed to
//! [`Renderer::process_commands`] is decoded, applied best-effort, turned
//! into exactly one frame, published to the channel and delivered to the
//! registered callbacks.
//!
//! The [`worker`] and [`process`] modules run the same facade inside a
//! separate, optionally namespace-isolated process driven over a small
//! control protocol.

pub mod backend;
pub mod callbacks;
pub mod command;
pub mod config;
pub mod control;
pub mod error;
pub mod process;
pub mod renderer;
pub mod sandbox;
pub mod state;
pub mod stats;
pub mod worker;

pub use backend::{Backend, BackendIdentity, OpStatus, Readiness};
pub use callbacks::{CallbackError, CallbackId};
pub use command::{Batch, Command, Opcode, Skipped};
pub use config::{BackendKind, ChannelSettings, NativeConfig, RendererConfig, Rotation};
pub use error::{BackendError, InitFailure, RendererError, Result};
pub use process::{ProcessConfig, ProcessError, ProcessState, RendererProcess};
pub use renderer::{ProcessOutcome, Renderer, RendererInfo};
pub use sandbox::{SandboxPolicy, SandboxProbe, SandboxReport};
pub use state::RendererState;
pub use stats::{RendererStats, StatsSnapshot};
