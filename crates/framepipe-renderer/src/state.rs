use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a renderer instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RendererState {
    #[default]
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Rendering = 3,
    /// Sticky until `cleanup` or a fresh `initialize`.
    Error = 4,
}

impl RendererState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Rendering => "rendering",
            Self::Error => "error",
        }
    }

    /// States in which command batches, resize and rotation are accepted.
    pub fn accepts_work(self) -> bool {
        matches!(self, Self::Ready | Self::Rendering)
    }

    /// States from which `initialize` may be attempted.
    pub fn accepts_initialize(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Error)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::Rendering,
            4 => Self::Error,
            _ => Self::Uninitialized,
        }
    }
}

impl fmt::Display for RendererState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free state word readable while the writer holds its lock.
#[derive(Debug, Default)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn load(&self) -> RendererState {
        RendererState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `state`, returning the previous one.
    pub fn replace(&self, state: RendererState) -> RendererState {
        RendererState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }
}
