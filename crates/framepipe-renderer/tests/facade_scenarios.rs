use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use framepipe_channel::{ChannelError, ChannelReader};
use framepipe_renderer::command::{encode_batch, encode_raw};
use framepipe_renderer::{
    BackendError, Command, InitFailure, Readiness, Renderer, RendererConfig, RendererError,
    RendererState, Rotation,
};

fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "/fp-{tag}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn named_config(width: u32, height: u32, name: &str) -> RendererConfig {
    let mut config = RendererConfig::stub(width, height);
    config.channel.anonymous = false;
    config.channel.name = Some(name.to_string());
    config
}

fn clear() -> bytes::Bytes {
    encode_batch(&[Command::Clear { color: 0xFF20_4060 }, Command::Flush])
}

#[test]
fn default_panel_publishes_frames_zero_then_one() {
    let name = unique_name("panel");
    let renderer = Renderer::new();
    renderer
        .initialize(named_config(1080, 1920, &name))
        .unwrap();
    assert_eq!(renderer.get_state(), RendererState::Ready);

    let mut reader = ChannelReader::open(&name).unwrap();
    assert!(reader.read_latest().unwrap().is_none());

    renderer.process_commands(&clear()).unwrap();
    let first = reader.read_latest().unwrap().unwrap();
    assert_eq!(first.frame_number(), 0);
    assert_eq!((first.width(), first.height()), (1080, 1920));
    assert_eq!(first.pixels().len(), first.stride() as usize * 1920);

    renderer.process_commands(&clear()).unwrap();
    let second = reader.read_latest().unwrap().unwrap();
    assert_eq!(second.frame_number(), 1);
    assert!(second.timestamp_ns() >= first.timestamp_ns());

    let latest = renderer.get_frame().unwrap();
    assert_eq!(latest.frame_number(), 1);
    assert_eq!(latest.pixels(), second.pixels());
}

#[test]
fn resize_replaces_channel_before_new_frames() {
    let name = unique_name("resize");
    let renderer = Renderer::new();
    renderer.initialize(named_config(64, 32, &name)).unwrap();
    renderer.process_commands(&clear()).unwrap();

    let mut reader = ChannelReader::open(&name).unwrap();
    assert_eq!(reader.poll_new().unwrap().unwrap().width(), 64);
    assert_eq!(reader.generation(), Some(1));

    renderer.resize(54, 96).unwrap();
    // The new generation exists but holds no frame yet.
    assert!(reader.read_latest().unwrap().is_none());
    assert_eq!(reader.generation(), Some(2));

    renderer.process_commands(&clear()).unwrap();
    let frame = reader.poll_new().unwrap().unwrap();
    assert_eq!((frame.width(), frame.height()), (54, 96));
    assert_eq!(frame.frame_number(), 1);
    assert_eq!(renderer.stats().channel_replacements, 1);
}

#[test]
fn half_size_resize_at_default_panel() {
    let renderer = Renderer::new();
    renderer.initialize(RendererConfig::stub(1080, 1920)).unwrap();
    let mut reader = renderer.subscribe().unwrap();

    renderer.process_commands(&[]).unwrap();
    renderer.resize(540, 960).unwrap();
    renderer.process_commands(&[]).unwrap();

    let frame = reader.read_latest().unwrap().unwrap();
    assert_eq!((frame.width(), frame.height()), (540, 960));
    assert_eq!(reader.generation(), Some(2));
}

#[test]
fn malformed_operation_is_skipped_and_counted() {
    let renderer = Renderer::new();
    renderer.initialize(RendererConfig::stub(32, 32)).unwrap();

    let mut buffer = BytesMut::from(&clear()[..]);
    // CLEAR with a 3-byte payload.
    encode_raw(0x0001, 0, &[1, 2, 3], &mut buffer);
    let outcome = renderer.process_commands(&buffer).unwrap();

    assert_eq!(outcome.applied, 2);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.frame_number, Some(0));
    assert_eq!(renderer.get_state(), RendererState::Ready);

    let info = renderer.get_info();
    assert_eq!(info.stats.commands_skipped, 1);
    assert_eq!(info.stats.frames_published, 1);
    assert!(info.last_error.is_none());
}

#[test]
fn frame_numbers_have_no_gaps() {
    let renderer = Renderer::new();
    renderer.initialize(RendererConfig::stub(8, 8)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    renderer.add_frame_callback(move |frame| {
        log.lock().unwrap().push(frame.frame_number());
        Ok(())
    });

    for round in 0..20u32 {
        if round == 7 {
            renderer.resize(16, 4).unwrap();
        }
        if round == 13 {
            renderer.set_rotation(180).unwrap();
        }
        renderer.process_commands(&[0xFF; 3]).unwrap();
    }

    assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<u64>>());
}

#[test]
fn cleanup_closes_channel_for_readers() {
    let name = unique_name("cleanup");
    let renderer = Renderer::new();
    renderer.initialize(named_config(16, 16, &name)).unwrap();
    renderer.process_commands(&clear()).unwrap();

    let mut named = ChannelReader::open(&name).unwrap();
    let mut local = renderer.subscribe().unwrap();
    assert!(named.read_latest().unwrap().is_some());

    renderer.cleanup();
    assert_eq!(renderer.get_state(), RendererState::Uninitialized);
    assert!(renderer.get_frame().is_none());
    assert!(matches!(named.read_latest(), Err(ChannelError::Closed)));
    assert!(matches!(local.read_latest(), Err(ChannelError::Closed)));
    assert!(ChannelReader::open(&name).is_err());

    // A fresh session restarts numbering.
    renderer.initialize(named_config(16, 16, &name)).unwrap();
    let outcome = renderer.process_commands(&[]).unwrap();
    assert_eq!(outcome.frame_number, Some(0));
}

#[test]
fn rotation_is_validated() {
    let renderer = Renderer::new();
    renderer.initialize(RendererConfig::stub(8, 8)).unwrap();

    for degrees in [0, 90, 180, 270] {
        renderer.set_rotation(degrees).unwrap();
    }
    assert_eq!(renderer.get_info().rotation, Rotation::Deg270);

    for degrees in [45, 360, 89] {
        assert!(matches!(
            renderer.set_rotation(degrees),
            Err(RendererError::InvalidArgument(_))
        ));
    }
    assert_eq!(renderer.get_state(), RendererState::Ready);
    assert_eq!(renderer.get_info().rotation, Rotation::Deg270);
}

#[test]
fn second_initialize_is_rejected() {
    let renderer = Renderer::new();
    renderer.initialize(RendererConfig::stub(8, 8)).unwrap();
    assert!(matches!(
        renderer.initialize(RendererConfig::stub(16, 16)),
        Err(RendererError::AlreadyInitialized(RendererState::Ready))
    ));
    assert_eq!(renderer.get_state(), RendererState::Ready);
    assert_eq!(renderer.get_info().geometry.unwrap().width(), 8);
}

#[test]
fn invalid_config_leaves_state_unchanged() {
    let renderer = Renderer::new();
    assert!(matches!(
        renderer.initialize(RendererConfig::stub(0, 8)),
        Err(RendererError::InvalidArgument(_))
    ));
    assert_eq!(renderer.get_state(), RendererState::Uninitialized);
}

#[test]
fn missing_native_driver_enters_error_and_can_retry() {
    let mut config = RendererConfig::stub(8, 8);
    config.backend = framepipe_renderer::BackendKind::Native;
    config.native.library_path = Some("/nonexistent/libfprender.so".into());
    config.native.search_paths.clear();

    let renderer = Renderer::new();
    match renderer.initialize(config) {
        Err(RendererError::InitFailed { cause, .. }) => {
            assert_eq!(cause, InitFailure::MissingDriver)
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(renderer.get_state(), RendererState::Error);
    assert!(renderer.get_info().last_error.is_some());
    assert!(matches!(
        renderer.process_commands(&[]),
        Err(RendererError::NotReady(RendererState::Error))
    ));

    // Error accepts a fresh attempt.
    renderer.initialize(RendererConfig::stub(8, 8)).unwrap();
    assert_eq!(renderer.get_state(), RendererState::Ready);
    assert_eq!(renderer.stats().init_failures, 1);
}

#[test]
fn failing_callbacks_do_not_affect_publication() {
    let renderer = Renderer::new();
    renderer.initialize(RendererConfig::stub(8, 8)).unwrap();

    let delivered = Arc::new(AtomicU64::new(0));
    renderer.add_frame_callback(|_| Err("consumer went away".into()));
    renderer.add_frame_callback(|_| panic!("consumer bug"));
    let counter = Arc::clone(&delivered);
    let last = renderer.add_frame_callback(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });

    renderer.process_commands(&[]).unwrap();
    renderer.process_commands(&[]).unwrap();
    assert_eq!(delivered.load(Ordering::Relaxed), 2);
    assert_eq!(renderer.stats().callback_failures, 4);
    assert_eq!(renderer.get_state(), RendererState::Ready);

    assert!(renderer.remove_frame_callback(last));
    renderer.process_commands(&[]).unwrap();
    assert_eq!(delivered.load(Ordering::Relaxed), 2);
    assert_eq!(renderer.get_frame().unwrap().frame_number(), 2);
}

#[test]
fn observers_run_while_another_thread_renders() {
    let renderer = Arc::new(Renderer::new());
    renderer.initialize(RendererConfig::stub(64, 64)).unwrap();

    let writer = {
        let renderer = Arc::clone(&renderer);
        std::thread::spawn(move || {
            for _ in 0..200 {
                renderer.process_commands(&clear()).unwrap();
            }
        })
    };

    let mut last = None;
    while !writer.is_finished() {
        let state = renderer.get_state();
        assert!(matches!(state, RendererState::Ready | RendererState::Rendering));
        if let Some(frame) = renderer.get_frame() {
            assert!(last.is_none_or(|previous| frame.frame_number() >= previous));
            last = Some(frame.frame_number());
        }
        let _ = renderer.get_info();
    }
    writer.join().unwrap();
    assert_eq!(renderer.get_frame().unwrap().frame_number(), 199);
}

#[test]
fn overlong_channel_name_is_a_validation_error() {
    let renderer = Renderer::new();
    let name = format!("/{}", "n".repeat(300));
    assert!(matches!(
        renderer.initialize(named_config(8, 8, &name)),
        Err(RendererError::InvalidArgument(_))
    ));
    assert_eq!(renderer.get_state(), RendererState::Uninitialized);
    assert_eq!(renderer.stats().init_failures, 0);
    assert!(renderer.get_info().last_error.is_none());
}

#[test]
fn revoked_device_is_a_sticky_fault_until_reinitialized() {
    let dir = std::env::temp_dir().join(unique_name("device").trim_start_matches('/'));
    std::fs::create_dir_all(&dir).unwrap();
    let device = dir.join("renderD128");
    std::fs::write(&device, b"").unwrap();

    let name = unique_name("revoke");
    let mut config = named_config(16, 8, &name);
    config.device_node = Some(device.clone());

    let renderer = Renderer::new();
    renderer.initialize(config.clone()).unwrap();
    assert_eq!(renderer.get_info().readiness, Readiness::Ready);
    let mut reader = ChannelReader::open(&name).unwrap();

    renderer.process_commands(&clear()).unwrap();
    // A malformed operation is skipped, not fatal.
    let mut malformed = BytesMut::from(&clear()[..]);
    encode_raw(0x0001, 0, &[1], &mut malformed);
    let outcome = renderer.process_commands(&malformed).unwrap();
    assert_eq!((outcome.skipped, outcome.frame_number), (1, Some(1)));

    std::fs::remove_file(&device).unwrap();
    let err = renderer.process_commands(&clear()).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        RendererError::Fatal(BackendError::DeviceRevoked(_))
    ));
    assert_eq!(renderer.get_state(), RendererState::Error);

    let info = renderer.get_info();
    assert_eq!(info.readiness, Readiness::Lost);
    assert!(info.last_error.unwrap().contains("revoked"));
    assert_eq!(info.stats.fatal_faults, 1);

    // The last published frame stays visible to observers and readers.
    assert_eq!(renderer.get_frame().unwrap().frame_number(), 1);
    assert_eq!(reader.read_latest().unwrap().unwrap().frame_number(), 1);

    assert!(matches!(
        renderer.process_commands(&clear()),
        Err(RendererError::NotReady(RendererState::Error))
    ));
    assert!(matches!(
        renderer.resize(32, 32),
        Err(RendererError::NotReady(RendererState::Error))
    ));
    assert!(matches!(
        renderer.set_rotation(90),
        Err(RendererError::NotReady(RendererState::Error))
    ));
    assert_eq!(renderer.stats().fatal_faults, 1);

    std::fs::write(&device, b"").unwrap();
    renderer.cleanup();
    assert!(matches!(reader.read_latest(), Err(ChannelError::Closed)));
    renderer.initialize(config).unwrap();
    assert_eq!(renderer.get_info().readiness, Readiness::Ready);
    let outcome = renderer.process_commands(&clear()).unwrap();
    assert_eq!(outcome.frame_number, Some(0));

    renderer.cleanup();
    std::fs::remove_dir_all(&dir).unwrap();
}
