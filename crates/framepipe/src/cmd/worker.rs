use framepipe_renderer::sandbox::{self, SandboxPolicy};
use framepipe_renderer::{worker, Renderer};
use tracing::{info, warn};

use crate::cmd::WorkerArgs;
use crate::exit::{CliError, CliResult, FAILURE, SUCCESS};

const MIB: u64 = 1024 * 1024;

pub fn run(args: WorkerArgs) -> CliResult<i32> {
    if args.no_sandbox {
        warn!("renderer worker running without sandbox");
    } else {
        let report = sandbox::enter(&policy(&args));
        if !report.is_complete() {
            warn!(failures = report.failures.len(), "worker sandbox is partial");
        }
    }

    info!(pid = std::process::id(), "renderer worker ready");
    let renderer = Renderer::new();
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    worker::serve(stdin.lock(), stdout.lock(), &renderer)
        .map_err(|err| CliError::new(FAILURE, format!("control stream failed: {err}")))?;

    Ok(SUCCESS)
}

fn policy(args: &WorkerArgs) -> SandboxPolicy {
    if args.no_sandbox {
        return SandboxPolicy::none();
    }
    let mut policy = SandboxPolicy::default();
    if let Some(mib) = args.max_memory {
        policy.max_memory_bytes = Some(mib.saturating_mul(MIB));
    }
    policy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_sandbox_applies_nothing() {
        let args = WorkerArgs {
            no_sandbox: true,
            max_memory: Some(64),
        };
        assert_eq!(policy(&args), SandboxPolicy::none());
    }

    #[test]
    fn memory_limit_is_in_mebibytes() {
        let args = WorkerArgs {
            no_sandbox: false,
            max_memory: Some(256),
        };
        let policy = policy(&args);
        assert_eq!(policy.max_memory_bytes, Some(256 * MIB));
        assert!(policy.no_new_privs);
    }
}
