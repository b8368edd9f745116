//! Renderer backends.
//!
//! [`Backend`] is a tagged choice between the deterministic stub and the
//! native translation library. The variant is fixed at construction.

mod native;
mod stub;

pub use native::{NativeBackend, ABI_VERSION};
pub use stub::{render_pattern, StubBackend};

use std::path::PathBuf;

use framepipe_channel::{FrameView, Geometry};
use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::config::{BackendKind, NativeConfig, RendererConfig, Rotation};
use crate::error::BackendError;
use crate::sandbox::check_device_node;

/// Outcome of applying one decoded operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpStatus {
    Applied,
    /// The backend does not implement this operation; it was skipped.
    Unsupported,
}

/// Whether a backend can currently accept work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    #[default]
    Uninitialized,
    Ready,
    /// The context was lost; only a fresh initialize recovers.
    Lost,
}

/// Who is rendering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendIdentity {
    pub kind: BackendKind,
    pub vendor: String,
    pub version: String,
}

/// A renderer backend.
///
/// The optional render device node is checked here for every variant, at
/// initialization and before each batch.
pub struct Backend {
    inner: BackendInner,
    device_node: Option<PathBuf>,
    revoked: bool,
}

enum BackendInner {
    Stub(StubBackend),
    Native(Box<NativeBackend>),
}

impl Backend {
    pub fn new(kind: BackendKind, native: &NativeConfig) -> Self {
        let inner = match kind {
            BackendKind::Stub => BackendInner::Stub(StubBackend::new()),
            BackendKind::Native => {
                BackendInner::Native(Box::new(NativeBackend::new(native.clone())))
            }
        };
        Self {
            inner,
            device_node: None,
            revoked: false,
        }
    }

    /// Require `device` to stay usable for the life of the context.
    pub fn with_device_node(mut self, device: Option<PathBuf>) -> Self {
        self.device_node = device;
        self
    }

    pub fn from_config(config: &RendererConfig) -> Self {
        Self::new(config.backend, &config.native).with_device_node(config.device_node.clone())
    }

    pub fn kind(&self) -> BackendKind {
        match &self.inner {
            BackendInner::Stub(_) => BackendKind::Stub,
            BackendInner::Native(_) => BackendKind::Native,
        }
    }

    /// Bring the backend up at `geometry`.
    pub fn initialize(&mut self, geometry: Geometry, rotation: Rotation) -> Result<(), BackendError> {
        self.revoked = false;
        if let Some(device) = &self.device_node {
            if let Err(err) = check_device_node(device) {
                self.shutdown();
                return Err(BackendError::DeviceUnavailable(err));
            }
        }
        match &mut self.inner {
            BackendInner::Stub(stub) => {
                stub.initialize(geometry, rotation);
                Ok(())
            }
            BackendInner::Native(native) => native.initialize(geometry, rotation),
        }
    }

    /// Re-validate the render device before a batch. A revoked device leaves
    /// the backend `Lost` until the next `initialize`.
    pub fn check_device(&mut self) -> Result<(), BackendError> {
        let Some(device) = &self.device_node else {
            return Ok(());
        };
        check_device_node(device).map_err(|err| {
            self.revoked = true;
            BackendError::DeviceRevoked(err)
        })
    }

    fn usable(&self) -> Result<(), BackendError> {
        if self.revoked {
            return Err(BackendError::ContextLost {
                call: "device check",
                code: -1,
            });
        }
        Ok(())
    }

    /// Apply one operation.
    pub fn process(&mut self, command: &Command) -> Result<OpStatus, BackendError> {
        self.usable()?;
        match &mut self.inner {
            BackendInner::Stub(stub) => stub.process(command),
            BackendInner::Native(native) => native.process(command),
        }
    }

    /// Render the current surface into the working buffer.
    ///
    /// The returned view borrows the buffer until the next call.
    pub fn produce_frame(
        &mut self,
        frame_number: u64,
        timestamp_ns: u64,
    ) -> Result<FrameView<'_>, BackendError> {
        self.usable()?;
        match &mut self.inner {
            BackendInner::Stub(stub) => stub.produce_frame(frame_number, timestamp_ns),
            BackendInner::Native(native) => native.produce_frame(frame_number, timestamp_ns),
        }
    }

    pub fn readiness(&self) -> Readiness {
        if self.revoked {
            return Readiness::Lost;
        }
        match &self.inner {
            BackendInner::Stub(stub) => stub.readiness(),
            BackendInner::Native(native) => native.readiness(),
        }
    }

    pub fn resize(&mut self, geometry: Geometry) -> Result<(), BackendError> {
        match &mut self.inner {
            BackendInner::Stub(stub) => stub.resize(geometry),
            BackendInner::Native(native) => native.resize(geometry),
        }
    }

    pub fn set_rotation(&mut self, rotation: Rotation) -> Result<(), BackendError> {
        match &mut self.inner {
            BackendInner::Stub(stub) => stub.set_rotation(rotation),
            BackendInner::Native(native) => native.set_rotation(rotation),
        }
    }

    /// Release the context and any loaded library. Idempotent.
    pub fn shutdown(&mut self) {
        self.revoked = false;
        match &mut self.inner {
            BackendInner::Stub(stub) => stub.shutdown(),
            BackendInner::Native(native) => native.shutdown(),
        }
    }

    pub fn identity(&self) -> BackendIdentity {
        match &self.inner {
            BackendInner::Stub(stub) => stub.identity(),
            BackendInner::Native(native) => native.identity(),
        }
    }

    /// Geometry the backend currently renders at.
    pub fn geometry(&self) -> Option<Geometry> {
        match &self.inner {
            BackendInner::Stub(stub) => stub.geometry(),
            BackendInner::Native(native) => native.geometry(),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind())
            .field("readiness", &self.readiness())
            .field("geometry", &self.geometry())
            .finish()
    }
}
