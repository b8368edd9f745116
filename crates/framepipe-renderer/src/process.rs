//! Parent side of an isolated renderer.
//!
//! [`RendererProcess`] spawns `framepipe worker` (optionally under a
//! namespace tool), initializes it over the control protocol and forwards
//! work to it. Frames still flow through the shared channel; only control
//! traffic crosses the pipes.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RendererConfig;
use crate::control::{ControlError, MessageReader, MessageWriter, Request, Status};
use crate::renderer::ProcessOutcome;
use crate::sandbox::{wrap_command, wrap_command_with};

const WAIT_POLL: Duration = Duration::from_millis(20);

/// Lifecycle of the worker process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Errors from managing a worker process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn renderer worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("renderer worker already {0}")]
    AlreadyRunning(ProcessState),

    #[error("renderer worker not running (state {0})")]
    NotRunning(ProcessState),

    /// The worker rejected a request; its renderer state is unchanged.
    #[error("renderer worker rejected request: {0}")]
    Rejected(String),

    /// The worker's renderer hit a fatal fault.
    #[error("renderer worker fault: {0}")]
    Fatal(String),

    #[error("renderer worker control failure: {0}")]
    Control(#[from] ControlError),

    #[error("malformed worker response: {0}")]
    Response(#[from] serde_json::Error),
}

/// How to launch the worker.
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// Worker executable, usually the `framepipe` binary itself.
    pub program: PathBuf,
    /// Arguments selecting worker mode.
    pub args: Vec<OsString>,
    /// Sent with `INIT` once the worker is up.
    pub renderer: RendererConfig,
    /// Launch under `unshare`/`firejail` when one is installed.
    pub isolate: bool,
    /// How long `stop` waits at each escalation step.
    pub stop_timeout: Duration,
}

impl ProcessConfig {
    pub fn new(program: impl Into<PathBuf>, renderer: RendererConfig) -> Self {
        Self {
            program: program.into(),
            args: vec![OsString::from("worker")],
            renderer,
            isolate: true,
            stop_timeout: Duration::from_secs(5),
        }
    }

    /// Re-launch the current executable in worker mode.
    pub fn current_exe(renderer: RendererConfig) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, renderer))
    }
}

struct Worker {
    child: Child,
    reader: MessageReader<ChildStdout>,
    writer: MessageWriter<ChildStdin>,
}

type StateCallback = Box<dyn FnMut(ProcessState, ProcessState) + Send>;

/// A renderer running in a child process.
pub struct RendererProcess {
    config: ProcessConfig,
    state: ProcessState,
    worker: Option<Worker>,
    callbacks: Vec<StateCallback>,
}

impl RendererProcess {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            state: ProcessState::Stopped,
            worker: None,
            callbacks: Vec::new(),
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.worker.as_ref().map(|worker| worker.child.id())
    }

    /// Call `callback(old, new)` on every state transition.
    pub fn add_state_callback<F>(&mut self, callback: F)
    where
        F: FnMut(ProcessState, ProcessState) + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    /// Spawn the worker and initialize its renderer.
    pub fn start(&mut self) -> Result<(), ProcessError> {
        if matches!(self.state, ProcessState::Starting | ProcessState::Running) {
            return Err(ProcessError::AlreadyRunning(self.state));
        }
        self.reap();
        self.set_state(ProcessState::Starting);

        let mut command = if self.config.isolate {
            wrap_command(&self.config.program, &self.config.args)
        } else {
            wrap_command_with(None, &self.config.program, &self.config.args)
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.set_state(ProcessState::Error);
                return Err(ProcessError::Spawn(err));
            }
        };
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            self.set_state(ProcessState::Error);
            return Err(ProcessError::Spawn(io::Error::other("worker pipes unavailable")));
        };
        info!(pid = child.id(), program = %self.config.program.display(), "renderer worker spawned");

        self.worker = Some(Worker {
            child,
            reader: MessageReader::new(stdout),
            writer: MessageWriter::new(stdin),
        });

        let init = Request::Init(self.config.renderer.clone());
        match self.request(&init) {
            Ok(_) => {
                self.set_state(ProcessState::Running);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "renderer worker failed to initialize");
                self.kill();
                self.set_state(ProcessState::Error);
                Err(err)
            }
        }
    }

    /// Forward one command batch to the worker.
    pub fn process_commands(&mut self, buffer: &[u8]) -> Result<ProcessOutcome, ProcessError> {
        let payload = self.running_request(&Request::ProcessCommands(Bytes::copy_from_slice(buffer)))?;
        Ok(serde_json::from_slice(&payload)?)
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), ProcessError> {
        self.running_request(&Request::Resize { width, height })
            .map(drop)
    }

    pub fn set_rotation(&mut self, degrees: u32) -> Result<(), ProcessError> {
        self.running_request(&Request::Rotate(degrees)).map(drop)
    }

    /// The worker renderer's `get_info`, as JSON.
    pub fn info(&mut self) -> Result<serde_json::Value, ProcessError> {
        let payload = self.running_request(&Request::Info)?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Ask the worker to shut down, escalating to SIGTERM and then SIGKILL
    /// if it does not exit within `stop_timeout` at each step. Idempotent.
    pub fn stop(&mut self) -> Result<(), ProcessError> {
        if self.worker.is_none() {
            if self.state != ProcessState::Error {
                self.set_state(ProcessState::Stopped);
            }
            return Ok(());
        }
        self.set_state(ProcessState::Stopping);

        if let Err(err) = self.request(&Request::Shutdown) {
            debug!(error = %err, "worker did not acknowledge shutdown");
        }

        let timeout = self.config.stop_timeout;
        if let Some(mut worker) = self.worker.take() {
            // Closing stdin ends the worker's read loop even if SHUTDOWN was lost.
            drop(worker.writer);
            if !wait_for_exit(&mut worker.child, timeout) {
                warn!(pid = worker.child.id(), "worker ignored shutdown; sending SIGTERM");
                terminate(&worker.child);
                if !wait_for_exit(&mut worker.child, timeout) {
                    warn!(pid = worker.child.id(), "worker ignored SIGTERM; killing");
                    let _ = worker.child.kill();
                    let _ = worker.child.wait();
                }
            }
            info!(pid = worker.child.id(), "renderer worker stopped");
        }

        self.set_state(ProcessState::Stopped);
        Ok(())
    }

    fn running_request(&mut self, request: &Request) -> Result<Bytes, ProcessError> {
        if self.state != ProcessState::Running {
            return Err(ProcessError::NotRunning(self.state));
        }
        self.request(request)
    }

    fn request(&mut self, request: &Request) -> Result<Bytes, ProcessError> {
        let Some(worker) = self.worker.as_mut() else {
            return Err(ProcessError::NotRunning(self.state));
        };

        let response = match worker
            .writer
            .write_request(request)
            .and_then(|()| worker.reader.read_response())
        {
            Ok(response) => response,
            Err(err) => {
                if self.state == ProcessState::Running {
                    self.set_state(ProcessState::Error);
                }
                return Err(err.into());
            }
        };

        match response.status {
            Status::Ok => Ok(response.payload),
            Status::Error => Err(ProcessError::Rejected(response.message())),
            Status::Fatal => {
                if self.state == ProcessState::Running {
                    self.set_state(ProcessState::Error);
                }
                Err(ProcessError::Fatal(response.message()))
            }
        }
    }

    fn kill(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            let _ = worker.child.kill();
            let _ = worker.child.wait();
        }
    }

    /// Collect a worker left over from a failed session.
    fn reap(&mut self) {
        if self.worker.is_some() {
            self.kill();
        }
    }

    fn set_state(&mut self, state: ProcessState) {
        let old = std::mem::replace(&mut self.state, state);
        if old == state {
            return;
        }
        debug!(from = %old, to = %state, "renderer process state");
        for callback in &mut self.callbacks {
            callback(old, state);
        }
    }
}

impl Drop for RendererProcess {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "failed to stop renderer worker");
        }
    }
}

impl std::fmt::Debug for RendererProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererProcess")
            .field("state", &self.state)
            .field("pid", &self.pid())
            .field("program", &self.config.program)
            .finish()
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(%status, "renderer worker exited");
                return true;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(WAIT_POLL),
            Ok(None) => return false,
            Err(err) => {
                warn!(error = %err, "failed to poll renderer worker");
                return false;
            }
        }
    }
}

fn terminate(child: &Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: signalling our own child by pid.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        debug!(error = %io::Error::last_os_error(), "SIGTERM failed");
    }
}
