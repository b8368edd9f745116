use std::path::{Path, PathBuf};

use framepipe_renderer::sandbox::{self, check_device_node};
use framepipe_renderer::{NativeConfig, Renderer, RendererConfig};
use framepipe_shm::{Access, ShmSegment};
use serde::Serialize;

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::OutputFormat;

const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Info,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    schema_id: &'static str,
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let checks = vec![
        platform_check(),
        shm_roundtrip_check(),
        stub_renderer_check(),
        native_library_check(args.library.as_deref()),
        render_device_check(args.device.as_deref()),
        sandbox_check(),
        compiled_features_check(),
    ];

    let has_fail = checks.iter().any(|c| matches!(c.status, CheckStatus::Fail));
    let overall = if has_fail { "fail" } else { "pass" };

    let output = DoctorOutput {
        schema_id: "framepipe/cli/v1/doctor-report",
        checks,
        overall,
    };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(output).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("framepipe doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<22} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => {
            println!("{}", output.overall);
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Warn => "WARN",
        CheckStatus::Info => "INFO",
        CheckStatus::Skip => "SKIP",
    }
}

fn platform_check() -> CheckResult {
    if cfg!(target_os = "linux") {
        CheckResult::new("platform", CheckStatus::Pass, "linux")
    } else {
        CheckResult::new(
            "platform",
            CheckStatus::Warn,
            format!(
                "{}: POSIX shared memory only, no no_new_privs",
                std::env::consts::OS
            ),
        )
    }
}

fn shm_roundtrip_check() -> CheckResult {
    let name = format!("/framepipe-doctor-{}", std::process::id());
    let result = (|| -> framepipe_shm::Result<()> {
        let writer = ShmSegment::create(&name, 4096)?;
        let outcome = (|| -> framepipe_shm::Result<()> {
            writer.write_bytes(0, b"framepipe")?;
            let reader = ShmSegment::open(&name, Access::ReadOnly)?;
            let mut probe = [0u8; 9];
            reader.read_bytes(0, &mut probe)?;
            if &probe != b"framepipe" {
                return Err(framepipe_shm::ShmError::Io(std::io::Error::other(
                    "read back different bytes",
                )));
            }
            Ok(())
        })();
        writer.unlink()?;
        outcome
    })();

    match result {
        Ok(()) => CheckResult::new("shm_roundtrip", CheckStatus::Pass, "create/open/unlink ok"),
        Err(err) => CheckResult::new("shm_roundtrip", CheckStatus::Fail, err.to_string()),
    }
}

fn stub_renderer_check() -> CheckResult {
    let renderer = Renderer::new();
    let result = renderer
        .initialize(RendererConfig::stub(64, 64))
        .and_then(|()| renderer.process_commands(&[]));
    renderer.cleanup();

    match result {
        Ok(outcome) if outcome.frame_number == Some(0) => {
            CheckResult::new("stub_renderer", CheckStatus::Pass, "published frame 0")
        }
        Ok(outcome) => CheckResult::new(
            "stub_renderer",
            CheckStatus::Fail,
            format!("unexpected outcome {outcome:?}"),
        ),
        Err(err) => CheckResult::new("stub_renderer", CheckStatus::Fail, err.to_string()),
    }
}

fn native_library_check(library: Option<&Path>) -> CheckResult {
    let config = NativeConfig {
        library_path: library.map(Path::to_path_buf),
        ..NativeConfig::default()
    };
    let candidates = config.candidates();
    let found: Vec<&PathBuf> = candidates.iter().filter(|path| path.is_file()).collect();

    match (found.first(), library) {
        (Some(path), _) => CheckResult::new(
            "native_library",
            CheckStatus::Pass,
            format!("found {}", path.display()),
        ),
        (None, Some(path)) => CheckResult::new(
            "native_library",
            CheckStatus::Fail,
            format!("{} not found", path.display()),
        ),
        (None, None) => CheckResult::new(
            "native_library",
            CheckStatus::Warn,
            "no translation library installed; only the stub backend is usable",
        ),
    }
}

fn render_device_check(device: Option<&Path>) -> CheckResult {
    let (path, explicit) = match device {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_RENDER_NODE), false),
    };

    match check_device_node(&path) {
        Ok(()) => CheckResult::new(
            "render_device",
            CheckStatus::Pass,
            format!("{} usable", path.display()),
        ),
        Err(err) if explicit => CheckResult::new("render_device", CheckStatus::Fail, err.to_string()),
        Err(err) => CheckResult::new("render_device", CheckStatus::Skip, err.to_string()),
    }
}

fn sandbox_check() -> CheckResult {
    let probe = sandbox::probe();
    let detail = format!(
        "unshare={} firejail={} user_namespaces={} seccomp={} no_new_privs={}",
        probe.unshare, probe.firejail, probe.user_namespaces, probe.seccomp, probe.no_new_privs
    );
    let status = if probe.unshare || probe.firejail {
        CheckStatus::Pass
    } else {
        CheckStatus::Warn
    };
    CheckResult::new("sandbox", status, detail)
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "cli") {
        features.push("cli");
    }
    features.push(if cfg!(debug_assertions) { "debug" } else { "release" });

    CheckResult::new("compiled_features", CheckStatus::Info, features.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctor_output_has_overall_status() {
        let output = DoctorOutput {
            schema_id: "x",
            checks: vec![CheckResult::new("x", CheckStatus::Pass, "ok")],
            overall: "pass",
        };
        let json = serde_json::to_string(&output).expect("doctor output should serialize");
        assert!(json.contains("\"overall\":\"pass\""));
        assert!(json.contains("\"status\":\"pass\""));
    }

    #[test]
    fn explicit_missing_library_fails() {
        let check = native_library_check(Some(Path::new("/nonexistent/libfprender.so")));
        assert!(matches!(check.status, CheckStatus::Fail));
    }

    #[test]
    fn explicit_missing_device_fails() {
        let check = render_device_check(Some(Path::new("/nonexistent/renderD999")));
        assert!(matches!(check.status, CheckStatus::Fail));
        assert!(check.detail.contains("does not exist"));
    }

    #[test]
    fn local_checks_pass() {
        assert!(matches!(shm_roundtrip_check().status, CheckStatus::Pass));
        assert!(matches!(stub_renderer_check().status, CheckStatus::Pass));
    }
}
