//! The renderer facade.
//!
//! One writer at a time drives the backend and the frame channel under the
//! `inner` mutex. Observers (`get_state`, `get_frame`, `get_info`) never take
//! that lock: state is an atomic, the latest frame and the info snapshot sit
//! behind short-lived read locks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use framepipe_channel::{ChannelDescriptor, ChannelReader, ChannelWriter, FrameBuffer, Geometry};
use framepipe_shm::monotonic_ns;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendIdentity, OpStatus, Readiness};
use crate::callbacks::{self, CallbackError, CallbackId, CallbackRegistry};
use crate::command;
use crate::config::{self, RendererConfig, Rotation};
use crate::error::{InitFailure, RendererError, Result};
use crate::state::{RendererState, StateCell};
use crate::stats::{RendererStats, StatsSnapshot};

/// Result of one `process_commands` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    /// Number of the published frame, `None` when the frame was discarded.
    pub frame_number: Option<u64>,
    pub applied: u64,
    pub skipped: u64,
    /// The frame disagreed with the channel geometry and was dropped.
    pub discarded: bool,
}

/// Point-in-time view of a renderer, as returned by `get_info`.
#[derive(Clone, Debug, Serialize)]
pub struct RendererInfo {
    pub state: RendererState,
    pub backend: Option<BackendIdentity>,
    /// Whether the backend can take work; `lost` after a device or context
    /// failure.
    pub readiness: Readiness,
    pub geometry: Option<Geometry>,
    pub rotation: Rotation,
    pub channel: Option<ChannelDescriptor>,
    pub callbacks: usize,
    pub stats: StatsSnapshot,
    /// Message of the fault that last moved the renderer into `Error`.
    pub last_error: Option<String>,
}

/// Writer-side state, only touched under the `inner` lock.
#[derive(Default)]
struct Inner {
    config: Option<RendererConfig>,
    backend: Option<Backend>,
    channel: Option<ChannelWriter>,
    geometry: Option<Geometry>,
    rotation: Rotation,
    next_frame: u64,
}

/// Fields of [`RendererInfo`] that change only on the writer path.
#[derive(Clone, Default)]
struct Published {
    backend: Option<BackendIdentity>,
    readiness: Readiness,
    geometry: Option<Geometry>,
    rotation: Rotation,
    channel: Option<ChannelDescriptor>,
    last_error: Option<String>,
}

/// GPU frame renderer: command batches in, frames out.
///
/// All methods take `&self`; share the renderer across threads with `Arc`.
/// Frame callbacks run on the thread that called `process_commands`, after
/// the writer lock is released, and must not call `process_commands`
/// themselves.
pub struct Renderer {
    state: StateCell,
    inner: Mutex<Inner>,
    latest: RwLock<Option<Arc<FrameBuffer>>>,
    published: RwLock<Published>,
    callbacks: Mutex<CallbackRegistry>,
    // Held from publication until callbacks finish so deliveries keep
    // publication order across concurrent callers.
    delivery: Mutex<()>,
    stats: RendererStats,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    /// New renderer in `Uninitialized`.
    pub fn new() -> Self {
        Self {
            state: StateCell::default(),
            inner: Mutex::new(Inner::default()),
            latest: RwLock::new(None),
            published: RwLock::new(Published::default()),
            callbacks: Mutex::new(CallbackRegistry::default()),
            delivery: Mutex::new(()),
            stats: RendererStats::new(),
        }
    }

    /// Bring up the backend and the frame channel.
    ///
    /// Valid from `Uninitialized`, and from `Error` as a fresh attempt. A
    /// configuration that fails validation leaves the state unchanged.
    pub fn initialize(&self, config: RendererConfig) -> Result<()> {
        let geometry = config.validate()?;

        let mut inner = lock(&self.inner);
        let state = self.state.load();
        if !state.accepts_initialize() {
            return Err(RendererError::AlreadyInitialized(state));
        }
        self.state.replace(RendererState::Initializing);
        self.teardown(&mut inner);

        debug!(backend = %config.backend, %geometry, rotation = %config.rotation, "initializing renderer");

        let mut backend = Backend::from_config(&config);
        if let Err(err) = backend.initialize(geometry, config.rotation) {
            return Err(self.init_failed(err.init_failure(), err.to_string()));
        }

        let channel = match ChannelWriter::create(config.channel.channel_config(), geometry) {
            Ok(channel) => channel,
            Err(err) => {
                backend.shutdown();
                let cause = if err.is_resource_exhaustion() {
                    InitFailure::ResourceExhausted
                } else {
                    InitFailure::DeviceUnavailable
                };
                return Err(self.init_failed(cause, format!("frame channel creation failed: {err}")));
            }
        };

        info!(
            backend = %backend.kind(),
            %geometry,
            channel = channel.name().unwrap_or("anonymous"),
            "renderer ready"
        );

        inner.rotation = config.rotation;
        inner.geometry = Some(geometry);
        inner.next_frame = 0;
        inner.backend = Some(backend);
        inner.channel = Some(channel);
        inner.config = Some(config);

        *write(&self.latest) = None;
        *write(&self.published) = Published {
            last_error: None,
            ..snapshot(&inner)
        };
        self.state.replace(RendererState::Ready);
        Ok(())
    }

    /// Apply one command buffer and publish the resulting frame.
    ///
    /// Malformed and unsupported operations are skipped and counted. A
    /// backend or channel fault moves the renderer into `Error` and is
    /// returned as a fatal error.
    pub fn process_commands(&self, buffer: &[u8]) -> Result<ProcessOutcome> {
        let mut inner = lock(&self.inner);
        let state = self.state.load();
        if !state.accepts_work() {
            return Err(RendererError::NotReady(state));
        }
        self.state.replace(RendererState::Rendering);

        let (outcome, frame) = match self.render_batch(&mut inner, buffer) {
            Ok(rendered) => rendered,
            Err(err) => {
                self.fault(&inner, &err);
                return Err(err);
            }
        };
        self.state.replace(RendererState::Ready);

        let Some(frame) = frame else {
            return Ok(outcome);
        };
        let delivery = lock(&self.delivery);
        drop(inner);

        let handlers = lock(&self.callbacks).snapshot();
        let failures = callbacks::dispatch(&handlers, &frame);
        if failures > 0 {
            self.stats.add_callback_failures(failures);
        }
        drop(delivery);

        Ok(outcome)
    }

    fn render_batch(
        &self,
        inner: &mut Inner,
        buffer: &[u8],
    ) -> Result<(ProcessOutcome, Option<Arc<FrameBuffer>>)> {
        self.stats.inc_batches();

        let Inner {
            backend,
            channel,
            next_frame,
            ..
        } = inner;
        let (Some(backend), Some(channel)) = (backend.as_mut(), channel.as_mut()) else {
            return Err(RendererError::NotReady(self.state.load()));
        };

        let batch = command::decode(buffer);
        for skipped in &batch.skipped {
            debug!(%skipped, "skipping malformed operation");
        }

        backend.check_device().map_err(RendererError::Fatal)?;

        let mut outcome = ProcessOutcome {
            skipped: batch.skipped.len() as u64,
            ..ProcessOutcome::default()
        };
        for command in &batch.commands {
            match backend.process(command).map_err(RendererError::Fatal)? {
                OpStatus::Applied => outcome.applied += 1,
                OpStatus::Unsupported => {
                    debug!(opcode = ?command.opcode(), "operation unsupported by backend");
                    outcome.skipped += 1;
                }
            }
        }
        self.stats.add_commands_applied(outcome.applied);
        self.stats.add_commands_skipped(outcome.skipped);

        let frame_number = *next_frame;
        let view = backend
            .produce_frame(frame_number, monotonic_ns())
            .map_err(RendererError::Fatal)?;

        if view.geometry != channel.geometry() {
            self.stats.inc_frames_discarded();
            warn!(
                frame = %view.geometry,
                channel = %channel.geometry(),
                "discarding frame with stale geometry"
            );
            outcome.discarded = true;
            return Ok((outcome, None));
        }

        channel
            .publish(&view)
            .map_err(RendererError::ChannelFault)?;
        let frame = Arc::new(FrameBuffer::from_view(&view));
        *next_frame += 1;

        self.stats.inc_frames_published();
        *write(&self.latest) = Some(Arc::clone(&frame));
        write(&self.published).channel = Some(channel.descriptor());

        outcome.frame_number = Some(frame_number);
        Ok((outcome, Some(frame)))
    }

    /// Latest published frame, if any.
    pub fn get_frame(&self) -> Option<Arc<FrameBuffer>> {
        read(&self.latest).clone()
    }

    /// Change the surface size. The channel is replaced before any frame at
    /// the new size is published.
    pub fn resize(&self, width: u32, height: u32) -> Result<()> {
        let mut inner = lock(&self.inner);
        let state = self.state.load();
        if !state.accepts_work() {
            return Err(RendererError::NotReady(state));
        }
        let format = inner
            .config
            .as_ref()
            .map(|config| config.format)
            .unwrap_or_default();
        let geometry = config::geometry(width, height, format)?;
        if inner.geometry == Some(geometry) {
            return Ok(());
        }

        if let Err(err) = self.renegotiate(&mut inner, geometry) {
            self.fault(&inner, &err);
            return Err(err);
        }

        inner.geometry = Some(geometry);
        let last_error = read(&self.published).last_error.clone();
        *write(&self.published) = Published {
            last_error,
            ..snapshot(&inner)
        };
        info!(%geometry, "renderer resized");
        Ok(())
    }

    fn renegotiate(&self, inner: &mut Inner, geometry: Geometry) -> Result<()> {
        let (Some(backend), Some(channel)) = (inner.backend.as_mut(), inner.channel.as_mut())
        else {
            return Err(RendererError::NotReady(self.state.load()));
        };
        backend.resize(geometry).map_err(RendererError::Fatal)?;
        if channel
            .renegotiate(geometry)
            .map_err(RendererError::ChannelFault)?
        {
            self.stats.inc_channel_replacements();
        }
        Ok(())
    }

    /// Rotate subsequent frames. `degrees` must be 0, 90, 180 or 270.
    pub fn set_rotation(&self, degrees: u32) -> Result<()> {
        let rotation = Rotation::try_from(degrees)?;

        let mut inner = lock(&self.inner);
        let state = self.state.load();
        if !state.accepts_work() {
            return Err(RendererError::NotReady(state));
        }
        let Some(backend) = inner.backend.as_mut() else {
            return Err(RendererError::NotReady(state));
        };
        if let Err(err) = backend.set_rotation(rotation) {
            let err = RendererError::Fatal(err);
            self.fault(&inner, &err);
            return Err(err);
        }

        inner.rotation = rotation;
        write(&self.published).rotation = rotation;
        debug!(%rotation, "rotation changed");
        Ok(())
    }

    pub fn get_state(&self) -> RendererState {
        self.state.load()
    }

    pub fn get_info(&self) -> RendererInfo {
        let published = read(&self.published).clone();
        RendererInfo {
            state: self.state.load(),
            backend: published.backend,
            readiness: published.readiness,
            geometry: published.geometry,
            rotation: published.rotation,
            channel: published.channel,
            callbacks: lock(&self.callbacks).len(),
            stats: self.stats.snapshot(),
            last_error: published.last_error,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Register `callback` for every published frame.
    pub fn add_frame_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Arc<FrameBuffer>) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    {
        lock(&self.callbacks).add(callback)
    }

    /// Unregister a callback. Returns `false` if it was not registered.
    pub fn remove_frame_callback(&self, id: CallbackId) -> bool {
        lock(&self.callbacks).remove(id)
    }

    /// In-process reader of the current channel, following replacements.
    ///
    /// `None` unless initialized.
    pub fn subscribe(&self) -> Option<ChannelReader> {
        lock(&self.inner).channel.as_ref().map(ChannelWriter::subscribe)
    }

    /// Release the backend, close the channel and drop callbacks.
    ///
    /// Valid from any state; always ends in `Uninitialized`. Counters are
    /// kept.
    pub fn cleanup(&self) {
        let mut inner = lock(&self.inner);
        let had_backend = inner.backend.is_some();
        self.teardown(&mut inner);
        inner.config = None;

        *write(&self.latest) = None;
        *write(&self.published) = Published::default();
        lock(&self.callbacks).clear();
        self.state.replace(RendererState::Uninitialized);
        if had_backend {
            info!("renderer cleaned up");
        }
    }

    /// Shut the backend down and close the channel, if present.
    fn teardown(&self, inner: &mut Inner) {
        if let Some(mut backend) = inner.backend.take() {
            backend.shutdown();
        }
        if let Some(mut channel) = inner.channel.take() {
            if let Err(err) = channel.close() {
                self.stats.inc_cleanup_errors();
                warn!(error = %err, "failed to close frame channel");
            }
        }
        inner.geometry = None;
        inner.rotation = Rotation::Deg0;
        inner.next_frame = 0;
    }

    fn init_failed(&self, cause: InitFailure, message: String) -> RendererError {
        self.stats.inc_init_failures();
        error!(%cause, %message, "renderer initialization failed");
        *write(&self.published) = Published {
            last_error: Some(message.clone()),
            ..Published::default()
        };
        self.state.replace(RendererState::Error);
        RendererError::InitFailed { cause, message }
    }

    fn fault(&self, inner: &Inner, err: &RendererError) {
        if !err.is_fatal() {
            return;
        }
        self.stats.inc_fatal_faults();
        error!(error = %err, "renderer fault; no further frames until re-initialized");
        let mut published = write(&self.published);
        published.last_error = Some(err.to_string());
        published.readiness = readiness(inner);
        drop(published);
        self.state.replace(RendererState::Error);
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("state", &self.state.load())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

fn snapshot(inner: &Inner) -> Published {
    Published {
        backend: inner.backend.as_ref().map(Backend::identity),
        readiness: readiness(inner),
        geometry: inner.geometry,
        rotation: inner.rotation,
        channel: inner.channel.as_ref().map(ChannelWriter::descriptor),
        last_error: None,
    }
}

fn readiness(inner: &Inner) -> Readiness {
    inner
        .backend
        .as_ref()
        .map_or(Readiness::Uninitialized, Backend::readiness)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{encode_batch, Command};
    use framepipe_channel::PixelFormat;

    fn ready(width: u32, height: u32) -> Renderer {
        let renderer = Renderer::new();
        renderer
            .initialize(RendererConfig::stub(width, height))
            .unwrap();
        renderer
    }

    #[test]
    fn starts_uninitialized_and_rejects_work() {
        let renderer = Renderer::new();
        assert_eq!(renderer.get_state(), RendererState::Uninitialized);
        assert!(renderer.get_frame().is_none());
        assert!(matches!(
            renderer.process_commands(&[]),
            Err(RendererError::NotReady(RendererState::Uninitialized))
        ));
        assert!(renderer.subscribe().is_none());
    }

    #[test]
    fn frame_numbers_start_at_zero() {
        let renderer = ready(16, 8);
        let batch = encode_batch(&[Command::Clear { color: 0xFF00_00FF }]);

        let first = renderer.process_commands(&batch).unwrap();
        assert_eq!(first.frame_number, Some(0));
        assert_eq!(first.applied, 1);
        let second = renderer.process_commands(&batch).unwrap();
        assert_eq!(second.frame_number, Some(1));

        let latest = renderer.get_frame().unwrap();
        assert_eq!(latest.frame_number(), 1);
        assert_eq!(renderer.get_state(), RendererState::Ready);
    }

    #[test]
    fn stale_geometry_frames_are_discarded() {
        let renderer = ready(16, 8);
        renderer.process_commands(&[]).unwrap();

        // Move the backend without renegotiating the channel.
        {
            let mut inner = lock(&renderer.inner);
            let geometry = Geometry::new(8, 8, PixelFormat::Bgra8888).unwrap();
            inner.backend.as_mut().unwrap().resize(geometry).unwrap();
        }

        let outcome = renderer.process_commands(&[]).unwrap();
        assert!(outcome.discarded);
        assert_eq!(outcome.frame_number, None);
        assert_eq!(renderer.stats().frames_discarded, 1);
        assert_eq!(renderer.get_frame().unwrap().frame_number(), 0);
        assert_eq!(renderer.get_state(), RendererState::Ready);
    }

    #[test]
    fn info_tracks_geometry_and_rotation() {
        let renderer = ready(16, 8);
        renderer.set_rotation(90).unwrap();
        renderer.resize(8, 16).unwrap();

        let info = renderer.get_info();
        assert_eq!(info.state, RendererState::Ready);
        assert_eq!(info.rotation, Rotation::Deg90);
        assert_eq!(info.geometry.unwrap().width(), 8);
        assert_eq!(info.channel.unwrap().generation, 2);
        assert_eq!(info.stats.channel_replacements, 1);
        assert_eq!(info.backend.unwrap().vendor, "framepipe");
        assert_eq!(info.readiness, Readiness::Ready);
        assert!(info.last_error.is_none());

        renderer.cleanup();
        assert_eq!(renderer.get_info().readiness, Readiness::Uninitialized);
    }

    #[test]
    fn resize_to_same_geometry_keeps_channel() {
        let renderer = ready(16, 8);
        renderer.resize(16, 8).unwrap();
        assert_eq!(renderer.get_info().channel.unwrap().generation, 1);
        assert!(matches!(
            renderer.resize(0, 8),
            Err(RendererError::InvalidArgument(_))
        ));
        assert_eq!(renderer.get_state(), RendererState::Ready);
    }

    #[test]
    fn cleanup_is_idempotent_and_keeps_counters() {
        let renderer = ready(4, 4);
        renderer.add_frame_callback(|_| Ok(()));
        renderer.process_commands(&[]).unwrap();

        renderer.cleanup();
        renderer.cleanup();
        assert_eq!(renderer.get_state(), RendererState::Uninitialized);
        assert!(renderer.get_frame().is_none());

        let info = renderer.get_info();
        assert_eq!(info.callbacks, 0);
        assert!(info.channel.is_none());
        assert_eq!(info.stats.frames_published, 1);
    }
}
