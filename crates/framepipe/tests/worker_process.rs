#![cfg(all(unix, feature = "cli"))]

use std::ffi::OsString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use framepipe_channel::{ChannelError, ChannelReader};
use framepipe_renderer::command::encode_batch;
use framepipe_renderer::{
    Command, ProcessConfig, ProcessError, ProcessState, RendererConfig, RendererProcess,
};
use framepipe_shm::{Access, ShmSegment};

fn unique_channel(tag: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "/fpworker-{tag}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn worker_config(name: &str, width: u32, height: u32) -> ProcessConfig {
    let mut renderer = RendererConfig::stub(width, height);
    renderer.channel.anonymous = false;
    renderer.channel.name = Some(name.to_string());

    let mut config = ProcessConfig::new(env!("CARGO_BIN_EXE_framepipe"), renderer);
    config.args = vec![
        OsString::from("--log-level"),
        OsString::from("warn"),
        OsString::from("worker"),
        OsString::from("--no-sandbox"),
    ];
    config.isolate = false;
    config.stop_timeout = Duration::from_secs(2);
    config
}

fn batch() -> bytes::Bytes {
    encode_batch(&[Command::Clear { color: 0xFF00_00FF }, Command::Flush])
}

#[test]
fn worker_publishes_frames_to_named_channel() {
    let name = unique_channel("frames");
    let mut process = RendererProcess::new(worker_config(&name, 40, 20));

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&transitions);
    process.add_state_callback(move |old, new| log.lock().unwrap().push((old, new)));

    process.start().unwrap();
    assert_eq!(process.state(), ProcessState::Running);
    assert!(process.pid().is_some());

    let mut reader = ChannelReader::open(&name).unwrap();
    for expected in 0..3 {
        let outcome = process.process_commands(&batch()).unwrap();
        assert_eq!(outcome.frame_number, Some(expected));
        assert_eq!(outcome.applied, 2);
    }
    let frame = reader.read_latest().unwrap().unwrap();
    assert_eq!(frame.frame_number(), 2);
    assert_eq!((frame.width(), frame.height()), (40, 20));

    process.resize(20, 40).unwrap();
    process.set_rotation(90).unwrap();
    process.process_commands(&batch()).unwrap();
    let frame = reader.read_latest().unwrap().unwrap();
    assert_eq!((frame.width(), frame.height()), (20, 40));
    assert_eq!(frame.frame_number(), 3);

    let info = process.info().unwrap();
    assert_eq!(info["state"], "ready");
    assert_eq!(info["rotation"], 90);
    assert_eq!(info["channel"]["generation"], 2);

    process.stop().unwrap();
    assert_eq!(process.state(), ProcessState::Stopped);
    assert!(matches!(reader.read_latest(), Err(ChannelError::Closed)));
    assert!(ChannelReader::open(&name).is_err());

    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (ProcessState::Stopped, ProcessState::Starting),
            (ProcessState::Starting, ProcessState::Running),
            (ProcessState::Running, ProcessState::Stopping),
            (ProcessState::Stopping, ProcessState::Stopped),
        ]
    );
}

#[test]
fn rejected_request_keeps_worker_running() {
    let name = unique_channel("reject");
    let mut process = RendererProcess::new(worker_config(&name, 16, 16));
    process.start().unwrap();

    assert!(matches!(
        process.set_rotation(45),
        Err(ProcessError::Rejected(message)) if message.contains("rotation")
    ));
    assert_eq!(process.state(), ProcessState::Running);
    assert_eq!(
        process.process_commands(&batch()).unwrap().frame_number,
        Some(0)
    );
    process.stop().unwrap();
}

#[test]
fn failed_worker_init_moves_process_to_error() {
    let name = unique_channel("fatal");
    let mut config = worker_config(&name, 16, 16);
    config.renderer.backend = framepipe_renderer::BackendKind::Native;
    config.renderer.native.library_path = Some("/nonexistent/libfprender.so".into());
    config.renderer.native.search_paths.clear();

    let mut process = RendererProcess::new(config);
    assert!(matches!(process.start(), Err(ProcessError::Fatal(_))));
    assert_eq!(process.state(), ProcessState::Error);
    assert!(matches!(
        process.process_commands(&batch()),
        Err(ProcessError::NotRunning(ProcessState::Error))
    ));
}

#[test]
fn killed_worker_leaves_last_frame_readable() {
    let name = unique_channel("crash");
    let mut process = RendererProcess::new(worker_config(&name, 24, 12));
    process.start().unwrap();
    process.process_commands(&batch()).unwrap();
    process.process_commands(&batch()).unwrap();

    let mut reader = ChannelReader::open(&name).unwrap();
    let pid = libc::pid_t::try_from(process.pid().unwrap()).unwrap();
    // SAFETY: the worker is our child and still running.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }

    // The writer never got to close the channel.
    let frame = reader.read_latest().unwrap().unwrap();
    assert_eq!(frame.frame_number(), 1);

    let err = process.process_commands(&batch()).unwrap_err();
    assert!(matches!(err, ProcessError::Control(_)), "got {err:?}");
    assert_eq!(process.state(), ProcessState::Error);

    // Nobody unlinked the segment; clear it by name.
    assert!(ShmSegment::remove(&name).unwrap());
    assert!(ShmSegment::open(&name, Access::ReadOnly)
        .unwrap_err()
        .is_not_found());
}
