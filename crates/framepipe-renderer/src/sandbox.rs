//! Process isolation around the renderer.
//!
//! Confinement itself is the host's job. This module covers what the
//! renderer side contributes:
//! - [`enter`] lowers resource limits and sets `no_new_privs` in the worker
//! - [`check_device_node`] validates the single render node the backend may touch
//! - [`wrap_command`] prefixes a worker command with a namespace tool
//! - [`probe`] reports which isolation features the host offers

use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tracing::{debug, info, warn};

const UNSHARE: &str = "/usr/bin/unshare";
const FIREJAIL: &str = "/usr/bin/firejail";

/// Resource limits and privilege settings applied inside the worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxPolicy {
    /// `RLIMIT_AS`, bytes.
    pub max_memory_bytes: Option<u64>,
    /// `RLIMIT_NOFILE`.
    pub max_open_files: Option<u64>,
    /// `RLIMIT_NPROC`. Counted per user, so unset by default.
    pub max_processes: Option<u64>,
    /// Set `PR_SET_NO_NEW_PRIVS` (Linux only).
    pub no_new_privs: bool,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            max_memory_bytes: Some(512 * 1024 * 1024),
            max_open_files: Some(64),
            max_processes: None,
            no_new_privs: true,
        }
    }
}

impl SandboxPolicy {
    /// Policy that changes nothing.
    pub fn none() -> Self {
        Self {
            max_memory_bytes: None,
            max_open_files: None,
            max_processes: None,
            no_new_privs: false,
        }
    }
}

/// What [`enter`] managed to apply.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SandboxReport {
    pub no_new_privs: bool,
    pub limits: Vec<&'static str>,
    pub failures: Vec<String>,
}

impl SandboxReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Apply `policy` to the current process.
///
/// Failures are logged and reported, never fatal: the worker still runs,
/// just with weaker isolation. Limits are only ever lowered.
pub fn enter(policy: &SandboxPolicy) -> SandboxReport {
    let mut report = SandboxReport::default();

    if policy.no_new_privs {
        match set_no_new_privs() {
            Ok(()) => report.no_new_privs = true,
            Err(err) => report.failures.push(format!("no_new_privs: {err}")),
        }
    }

    let limits = [
        ("RLIMIT_AS", libc::RLIMIT_AS, policy.max_memory_bytes),
        ("RLIMIT_NOFILE", libc::RLIMIT_NOFILE, policy.max_open_files),
        ("RLIMIT_NPROC", libc::RLIMIT_NPROC, policy.max_processes),
    ];
    for (name, resource, value) in limits {
        let Some(value) = value else { continue };
        match lower_limit(resource, value) {
            Ok(()) => report.limits.push(name),
            Err(err) => report.failures.push(format!("{name}: {err}")),
        }
    }

    for failure in &report.failures {
        warn!(failure = %failure, "sandbox setting not applied");
    }
    info!(
        no_new_privs = report.no_new_privs,
        limits = ?report.limits,
        "entered renderer sandbox"
    );
    report
}

/// Render device node problems.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("{0} does not exist")]
    Missing(PathBuf),

    #[error("{0} is not a device node")]
    NotADevice(PathBuf),

    #[error("{path} is not accessible: {source}")]
    Inaccessible { path: PathBuf, source: io::Error },
}

/// Check that `path` is a character device (or a regular file standing in
/// for one) that this process can open read-write.
pub fn check_device_node(path: &Path) -> Result<(), DeviceError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(DeviceError::Missing(path.to_path_buf()))
        }
        Err(source) => {
            return Err(DeviceError::Inaccessible {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let file_type = metadata.file_type();
    if !file_type.is_char_device() && !file_type.is_file() {
        return Err(DeviceError::NotADevice(path.to_path_buf()));
    }

    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map(drop)
        .map_err(|source| DeviceError::Inaccessible {
            path: path.to_path_buf(),
            source,
        })
}

/// Namespace tools a worker can be launched under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationTool {
    Unshare,
    Firejail,
}

impl IsolationTool {
    /// First tool installed on this host.
    pub fn detect() -> Option<Self> {
        if Path::new(UNSHARE).exists() {
            Some(Self::Unshare)
        } else if Path::new(FIREJAIL).exists() {
            Some(Self::Firejail)
        } else {
            None
        }
    }

    fn prefix(self) -> (&'static str, &'static [&'static str]) {
        match self {
            Self::Unshare => (UNSHARE, &["--map-root-user", "--net", "--"]),
            Self::Firejail => (FIREJAIL, &["--quiet", "--private-dev", "--net=none", "--"]),
        }
    }
}

/// Build the worker command, prefixed with `tool` when given.
pub fn wrap_command_with(
    tool: Option<IsolationTool>,
    program: &Path,
    args: &[OsString],
) -> Command {
    match tool {
        Some(tool) => {
            let (wrapper, wrapper_args) = tool.prefix();
            debug!(?tool, program = %program.display(), "isolating worker");
            let mut command = Command::new(wrapper);
            command.args(wrapper_args).arg(program).args(args);
            command
        }
        None => {
            let mut command = Command::new(program);
            command.args(args);
            command
        }
    }
}

/// Build the worker command under whichever isolation tool is installed.
pub fn wrap_command(program: &Path, args: &[OsString]) -> Command {
    let tool = IsolationTool::detect();
    if tool.is_none() {
        warn!("no namespace tool found; worker runs without namespace isolation");
    }
    wrap_command_with(tool, program, args)
}

/// Isolation features available on this host.
#[derive(Clone, Debug, Serialize)]
pub struct SandboxProbe {
    pub unshare: bool,
    pub firejail: bool,
    pub user_namespaces: bool,
    pub seccomp: bool,
    pub no_new_privs: bool,
}

pub fn probe() -> SandboxProbe {
    SandboxProbe {
        unshare: Path::new(UNSHARE).exists(),
        firejail: Path::new(FIREJAIL).exists(),
        user_namespaces: user_namespaces_enabled(),
        seccomp: Path::new("/proc/sys/kernel/seccomp").exists(),
        no_new_privs: cfg!(target_os = "linux"),
    }
}

fn user_namespaces_enabled() -> bool {
    fs::read_to_string("/proc/sys/user/max_user_namespaces")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .is_some_and(|max| max > 0)
}

#[cfg(target_os = "linux")]
fn set_no_new_privs() -> io::Result<()> {
    // SAFETY: PR_SET_NO_NEW_PRIVS takes plain integer arguments.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_no_new_privs() -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no_new_privs is Linux-only",
    ))
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

fn lower_limit(resource: Resource, value: u64) -> io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `current` is a valid, writable rlimit.
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let value = value as libc::rlim_t;
    let target = libc::rlimit {
        rlim_cur: value.min(current.rlim_max),
        rlim_max: value.min(current.rlim_max),
    };
    // SAFETY: `target` is a valid rlimit that never raises the hard limit.
    if unsafe { libc::setrlimit(resource, &target) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
