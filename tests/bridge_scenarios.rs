mod common;

use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use common::{fast_bridge, fast_bridge_with, init_logger, poll_until, track, ScriptedEngine, Step};
use myy_media_bridge::core::{
    AudioFormat, ErrorKind, PixelFormat, PlayerState, TrackKind, VideoFormat,
};
use myy_media_bridge::engine::{EngineCommand, EngineState};
use myy_media_bridge::{
    AudioSink, BridgeConfig, BridgeError, BridgeNotification, MediaBridge, SyntheticOptions,
    VideoSink,
};

const WAIT: Duration = Duration::from_secs(5);

fn record_notifications(bridge: &MediaBridge) -> Arc<Mutex<Vec<BridgeNotification>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bridge.subscribe(move |n| sink.lock().push(n.clone()));
    seen
}

fn transitions(seen: &Mutex<Vec<BridgeNotification>>) -> Vec<(PlayerState, PlayerState)> {
    seen.lock()
        .iter()
        .filter_map(|n| match n {
            BridgeNotification::StateChanged { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

#[test]
fn plays_seeks_and_ends() {
    let bridge = fast_bridge(BridgeConfig::default());
    let seen = record_notifications(&bridge);

    bridge.open("synthetic://clip?duration_ms=10000").unwrap();
    assert_eq!(bridge.state(), PlayerState::Opening);

    let snapshot = poll_until(&bridge, WAIT, |s| s.state == PlayerState::Playing);
    assert_eq!(snapshot.state, PlayerState::Playing);
    assert_eq!(snapshot.duration, Some(Duration::from_secs(10)));

    bridge.pause().unwrap();
    assert_eq!(bridge.state(), PlayerState::Paused);

    bridge.seek(Duration::from_secs(5)).unwrap();
    let position = bridge.get_state().position;
    assert!(position >= Duration::from_secs(5) && position < Duration::from_millis(5500));

    bridge.play().unwrap();
    let snapshot = poll_until(&bridge, WAIT, |s| s.state == PlayerState::Ended);
    assert_eq!(snapshot.state, PlayerState::Ended);
    assert_eq!(snapshot.position, Duration::from_secs(10));

    assert_eq!(
        transitions(&seen),
        vec![
            (PlayerState::Closed, PlayerState::Opening),
            (PlayerState::Opening, PlayerState::Buffering),
            (PlayerState::Buffering, PlayerState::Playing),
            (PlayerState::Playing, PlayerState::Paused),
            (PlayerState::Paused, PlayerState::Playing),
            (PlayerState::Playing, PlayerState::Ended),
        ]
    );
    assert!(seen
        .lock()
        .iter()
        .any(|n| matches!(n, BridgeNotification::EndReached { .. })));
}

#[test]
fn unreachable_source_ends_in_open_failed() {
    let bridge = fast_bridge(BridgeConfig::default());
    let seen = record_notifications(&bridge);

    bridge.open("synthetic://unreachable").unwrap();
    let snapshot = poll_until(&bridge, WAIT, |s| s.state == PlayerState::Error);

    assert_eq!(snapshot.state, PlayerState::Error);
    let error = snapshot.last_error.expect("last error");
    assert_eq!(error.kind, ErrorKind::OpenFailed);
    assert!(!transitions(&seen).iter().any(|(_, to)| *to == PlayerState::Playing));

    // 自动播放的 Play 随会话出错被丢弃
    assert!(seen
        .lock()
        .iter()
        .any(|n| matches!(n, BridgeNotification::CommandDiscarded { command: "play", .. })));
    assert_eq!(bridge.diagnostics().commands_discarded, 1);

    assert!(matches!(bridge.play(), Err(BridgeError::CommandRejectedInState { .. })));
}

#[test]
fn empty_locator_fails_synchronously() {
    let bridge = fast_bridge(BridgeConfig::default());
    assert!(matches!(bridge.open("  "), Err(BridgeError::OpenFailed(_))));
    assert_eq!(bridge.state(), PlayerState::Closed);
}

#[test]
fn commands_issued_while_opening_replay_in_order() {
    init_logger();
    let engine = ScriptedEngine::new(ScriptedEngine::opening_script(vec![
        track(0, TrackKind::Video, true),
        track(1, TrackKind::Audio, true),
    ]));
    let commands = engine.commands.clone();
    let config = BridgeConfig {
        autoplay: false,
        ..BridgeConfig::default()
    };
    let bridge = MediaBridge::new(Arc::new(engine), config).unwrap();

    bridge.open("scripted://clip").unwrap();
    bridge.play().unwrap();
    bridge.seek(Duration::from_secs(3)).unwrap();
    assert!(commands.lock().is_empty());

    let snapshot = poll_until(&bridge, WAIT, |s| s.state == PlayerState::Playing);
    assert_eq!(snapshot.state, PlayerState::Playing);

    let deadline = std::time::Instant::now() + WAIT;
    while commands.lock().len() < 2 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    let names: Vec<_> = commands.lock().iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["play", "seek"]);
}

#[test]
fn close_during_opening_discards_pending_commands() {
    init_logger();
    let engine = ScriptedEngine::new(ScriptedEngine::opening_script(Vec::new()));
    let releases = engine.releases.clone();
    let bridge = MediaBridge::new(Arc::new(engine), BridgeConfig::default()).unwrap();
    let seen = record_notifications(&bridge);

    let id = bridge.open("scripted://clip").unwrap();
    bridge.pause().unwrap();
    bridge.close(id).unwrap();

    assert_eq!(bridge.state(), PlayerState::Closed);
    assert_eq!(*releases.lock(), 1);
    let discarded = seen
        .lock()
        .iter()
        .filter(|n| matches!(n, BridgeNotification::CommandDiscarded { .. }))
        .count();
    // autoplay 的 play + 宿主的 pause
    assert_eq!(discarded, 2);

    // 旧会话的事件不会再影响状态
    thread::sleep(Duration::from_millis(50));
    assert_eq!(bridge.poll().state, PlayerState::Closed);
}

#[test]
fn sessions_get_fresh_ids_and_stale_close_is_a_no_op() {
    let bridge = fast_bridge(BridgeConfig::default());

    let first = bridge.open("synthetic://clip").unwrap();
    poll_until(&bridge, WAIT, |s| s.state == PlayerState::Playing);
    let second = bridge.open("synthetic://clip?duration_ms=2000").unwrap();

    assert_ne!(first, second);
    assert!(second > first);
    assert_eq!(bridge.get_state().session, Some(second));

    bridge.close(first).unwrap();
    assert_eq!(bridge.get_state().session, Some(second));

    bridge.close(second).unwrap();
    bridge.close(second).unwrap();
    assert_eq!(bridge.state(), PlayerState::Closed);
}

#[test]
fn invalid_track_references_are_rejected() {
    let bridge = fast_bridge(BridgeConfig::default());
    assert!(matches!(
        bridge.select_track(0),
        Err(BridgeError::InvalidTrackReference(0))
    ));

    bridge.open("synthetic://clip?audio=2&subs=1").unwrap();
    poll_until(&bridge, WAIT, |s| s.track_generation > 0);

    assert_eq!(bridge.list_tracks(TrackKind::Video).len(), 1);
    assert_eq!(bridge.list_tracks(TrackKind::Audio).len(), 2);
    assert_eq!(bridge.list_tracks(TrackKind::Text).len(), 1);

    for bogus in [-1, 4, 99] {
        assert!(matches!(
            bridge.select_track(bogus),
            Err(BridgeError::InvalidTrackReference(id)) if id == bogus
        ));
    }
}

#[test]
fn pending_selection_applies_when_sink_is_bound() {
    let bridge = fast_bridge(BridgeConfig::default());
    bridge.open("synthetic://clip?audio=2").unwrap();
    let snapshot = poll_until(&bridge, WAIT, |s| s.track_generation > 0);
    assert_eq!(snapshot.selected_tracks.get(&TrackKind::Audio), Some(&1));

    // 还没有音频输出，选择挂起
    bridge.select_track(2).unwrap();
    let snapshot = bridge.get_state();
    assert_eq!(snapshot.pending_tracks.get(&TrackKind::Audio), Some(&2));
    assert_eq!(snapshot.selected_tracks.get(&TrackKind::Audio), Some(&1));

    bridge.bind_audio_sink(Some(AudioSink::new(AudioFormat::default(), 16)));
    let snapshot = bridge.get_state();
    assert!(snapshot.pending_tracks.is_empty());
    assert_eq!(snapshot.selected_tracks.get(&TrackKind::Audio), Some(&2));
}

#[test]
fn video_sink_keeps_latest_frame_and_audio_applies_backpressure() {
    let config = BridgeConfig {
        audio_backpressure_timeout_ms: 2,
        ..BridgeConfig::default()
    };
    let bridge = fast_bridge(config);
    let format = VideoFormat::packed(16, 9, PixelFormat::RGBA);
    let video = VideoSink::new(format);
    let audio = AudioSink::new(AudioFormat::default(), 2);
    bridge.bind_video_sink(Some(video.clone()));
    bridge.bind_audio_sink(Some(audio.clone()));

    bridge.open("synthetic://clip?duration_ms=4000").unwrap();
    poll_until(&bridge, WAIT, |_| video.frames_written() >= 10);

    let size = video.consume(|frame| frame.data.len()).expect("frame");
    assert_eq!(size, format.frame_size());

    // 宿主从不取音频：环满后新块超时丢弃
    let stats = poll_until(&bridge, WAIT, |_| bridge.diagnostics().audio_underruns > 0);
    assert_eq!(stats.state, PlayerState::Playing);
    assert_eq!(audio.len(), audio.capacity());

    let diagnostics = bridge.diagnostics();
    assert!(diagnostics.video_frames_delivered >= 10);
    assert!(diagnostics.video_frames_dropped > 0);
    assert_eq!(diagnostics.audio_chunks_delivered, 2);
}

#[test]
fn hung_teardown_times_out_but_session_closes() {
    let config = BridgeConfig {
        teardown_timeout_ms: 50,
        ..BridgeConfig::default()
    };
    let bridge = fast_bridge_with(
        config,
        SyntheticOptions {
            time_scale: 20.0,
            open_delay: Duration::from_millis(5),
            teardown_delay: Duration::from_millis(400),
        },
    );

    let id = bridge.open("synthetic://clip").unwrap();
    poll_until(&bridge, WAIT, |s| s.state == PlayerState::Playing);

    assert!(matches!(bridge.close(id), Err(BridgeError::TeardownTimeout(50))));
    assert_eq!(bridge.state(), PlayerState::Closed);
    assert_eq!(bridge.diagnostics().teardown_timeouts, 1);

    // 之后仍能打开新会话
    bridge.open("synthetic://clip").unwrap();
    assert_eq!(bridge.state(), PlayerState::Opening);
}

#[test]
fn looping_restarts_instead_of_ending() {
    let bridge = fast_bridge(BridgeConfig::default());
    bridge.set_looping(true);
    let seen = record_notifications(&bridge);

    bridge.open("synthetic://clip?duration_ms=400").unwrap();
    let ends = || {
        seen.lock()
            .iter()
            .filter(|n| matches!(n, BridgeNotification::EndReached { .. }))
            .count()
    };
    let snapshot = poll_until(&bridge, WAIT, |_| ends() >= 2);

    assert!(ends() >= 2);
    assert!(snapshot.looping);
    assert_ne!(snapshot.state, PlayerState::Ended);
    assert!(!transitions(&seen).iter().any(|(_, to)| *to == PlayerState::Ended));
}

#[test]
fn event_flood_keeps_critical_events() {
    init_logger();
    let mut script = vec![Step::State(EngineState::Opening)];
    script.extend((0..200).map(|i| Step::Position(Duration::from_millis(i))));
    script.extend(ScriptedEngine::opening_script(vec![track(0, TrackKind::Video, true)]).into_iter().skip(1));
    let engine = ScriptedEngine::new(script);

    let config = BridgeConfig {
        event_queue_capacity: 4,
        ..BridgeConfig::default()
    };
    let bridge = MediaBridge::new(Arc::new(engine), config).unwrap();
    bridge.open("scripted://flood").unwrap();

    // 先让引擎把事件全部塞进队列
    thread::sleep(Duration::from_millis(150));
    let snapshot = poll_until(&bridge, WAIT, |s| s.state == PlayerState::Playing);

    assert_eq!(snapshot.state, PlayerState::Playing);
    assert_eq!(snapshot.track_generation, 1);
    assert!(snapshot.media_info.is_some());
    assert!(bridge.diagnostics().queue_overflows > 0);
}

#[test]
fn rate_changes_are_validated() {
    let bridge = fast_bridge(BridgeConfig::default());
    bridge.open("synthetic://clip").unwrap();
    poll_until(&bridge, WAIT, |s| s.state == PlayerState::Playing);

    assert!(matches!(bridge.set_rate(-1.0), Err(BridgeError::InvalidArgument(_))));
    assert!(matches!(bridge.set_rate(f32::NAN), Err(BridgeError::InvalidArgument(_))));
    assert!(matches!(bridge.set_rate(11.0), Err(BridgeError::InvalidArgument(_))));

    bridge.set_rate(2.0).unwrap();
    assert_eq!(bridge.get_state().rate, 2.0);

    bridge.set_rate(0.0).unwrap();
    assert_eq!(bridge.state(), PlayerState::Paused);

    bridge.set_rate(1.0).unwrap();
    assert_eq!(bridge.state(), PlayerState::Playing);
}

#[test]
fn live_source_is_not_seekable() {
    let bridge = fast_bridge(BridgeConfig::default());
    bridge.open("synthetic://live").unwrap();
    let snapshot = poll_until(&bridge, WAIT, |s| s.state == PlayerState::Playing);

    assert_eq!(snapshot.duration, None);
    assert!(!bridge.can_control(myy_media_bridge::core::Control::Seek));
    assert!(matches!(
        bridge.seek(Duration::from_secs(1)),
        Err(BridgeError::InvalidArgument(_))
    ));
    assert!(bridge.can_control(myy_media_bridge::core::Control::Pause));
}

#[test]
fn seek_while_playing_keeps_playing_until_the_end() {
    let bridge = fast_bridge(BridgeConfig::default());
    let seen = record_notifications(&bridge);

    bridge.open("synthetic://clip?duration_ms=10000").unwrap();
    poll_until(&bridge, WAIT, |s| s.state == PlayerState::Playing);
    let before = transitions(&seen).len();

    bridge.seek(Duration::from_secs(5)).unwrap();
    assert_eq!(bridge.state(), PlayerState::Playing);
    let position = bridge.get_state().position;
    assert!(position >= Duration::from_secs(5) && position < Duration::from_millis(5500));

    let snapshot = poll_until(&bridge, WAIT, |s| s.state == PlayerState::Ended);
    assert_eq!(snapshot.state, PlayerState::Ended);
    assert_eq!(snapshot.position, Duration::from_secs(10));

    // seek 之后只允许 Playing 与 Buffering 之间往返，最后进入 Ended
    let after = transitions(&seen).split_off(before);
    let (last, detour) = after.split_last().expect("transitions after seek");
    assert_eq!(*last, (PlayerState::Playing, PlayerState::Ended));
    for step in detour {
        assert!(
            matches!(
                step,
                (PlayerState::Playing, PlayerState::Buffering)
                    | (PlayerState::Buffering, PlayerState::Playing)
            ),
            "unexpected transition {:?}",
            step
        );
    }
}

#[test]
fn track_disabled_while_opening_applies_from_first_frame() {
    let open_delay = Duration::from_millis(150);
    let bridge = fast_bridge_with(
        BridgeConfig::default(),
        SyntheticOptions {
            time_scale: 20.0,
            open_delay,
            teardown_delay: Duration::ZERO,
        },
    );
    bridge.bind_video_sink(Some(VideoSink::new(VideoFormat::packed(16, 9, PixelFormat::RGBA))));
    bridge.bind_audio_sink(Some(AudioSink::new(AudioFormat::default(), 64)));

    let started = Instant::now();
    bridge.open("synthetic://clip?duration_ms=2000").unwrap();
    assert_eq!(bridge.state(), PlayerState::Opening);
    bridge.deselect_track(TrackKind::Audio).unwrap();

    let snapshot = poll_until(&bridge, WAIT, |s| s.state == PlayerState::Ended);
    assert_eq!(snapshot.state, PlayerState::Ended);
    // 轨道切换不会让打开提前结束
    assert!(started.elapsed() >= open_delay);
    assert!(!snapshot.selected_tracks.contains_key(&TrackKind::Audio));

    let diagnostics = bridge.diagnostics();
    assert!(diagnostics.video_frames_delivered > 0);
    assert_eq!(diagnostics.audio_chunks_delivered, 0);
}

#[test]
fn concurrent_controls_reach_the_engine_in_transition_order() {
    init_logger();
    let engine = ScriptedEngine::new(ScriptedEngine::opening_script(vec![track(0, TrackKind::Video, true)]));
    let commands = engine.commands.clone();
    let bridge = Arc::new(MediaBridge::new(Arc::new(engine), BridgeConfig::default()).unwrap());
    bridge.open("scripted://controls").unwrap();
    poll_until(&bridge, WAIT, |s| s.state == PlayerState::Playing);

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let bridge = bridge.clone();
            thread::spawn(move || {
                for n in 0..50 {
                    let _ = if (worker + n) % 2 == 0 {
                        bridge.pause()
                    } else {
                        bridge.play()
                    };
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    // 等脚本线程记录完所有命令
    thread::sleep(Duration::from_millis(100));

    let recorded = commands.lock().clone();
    // 每条下发的命令都对应一次迁移，所以 play/pause 严格交替
    for pair in recorded.windows(2) {
        assert_ne!(pair[0], pair[1], "commands out of order: {:?}", recorded);
    }
    let expected = match bridge.state() {
        PlayerState::Playing => EngineCommand::Play,
        PlayerState::Paused => EngineCommand::Pause,
        other => panic!("unexpected state {:?}", other),
    };
    assert_eq!(recorded.last(), Some(&expected));
}

#[test]
fn concurrent_opens_close_every_replaced_session() {
    init_logger();
    let engine = ScriptedEngine::new(ScriptedEngine::opening_script(vec![track(0, TrackKind::Video, true)]));
    let releases = engine.releases.clone();
    let bridge = Arc::new(MediaBridge::new(Arc::new(engine), BridgeConfig::default()).unwrap());
    let seen = record_notifications(&bridge);

    let openers = 6;
    let barrier = Arc::new(Barrier::new(openers));
    let handles: Vec<_> = (0..openers)
        .map(|i| {
            let bridge = bridge.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                bridge.open(&format!("scripted://clip-{}", i)).unwrap()
            })
        })
        .collect();
    let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    bridge.close_current().unwrap();

    let closed: Vec<_> = seen
        .lock()
        .iter()
        .filter_map(|n| match n {
            BridgeNotification::StateChanged {
                session,
                to: PlayerState::Closed,
                ..
            } => Some(*session),
            _ => None,
        })
        .collect();
    for id in &ids {
        assert!(closed.contains(id), "session {} was replaced without closing", id);
    }
    assert_eq!(closed.len(), ids.len());
    assert_eq!(*releases.lock(), ids.len() as u32);
    assert_eq!(bridge.state(), PlayerState::Closed);
}

#[test]
fn byte_stream_sources_open_through_the_engine() {
    let bridge = fast_bridge(BridgeConfig::default());
    bridge
        .open_reader(Cursor::new(vec![0u8; 1024]), "synthetic://clip?duration_ms=1000")
        .unwrap();
    let snapshot = poll_until(&bridge, WAIT, |s| s.state == PlayerState::Playing);
    assert_eq!(snapshot.state, PlayerState::Playing);
    assert_eq!(snapshot.locator.as_deref(), Some("synthetic://clip?duration_ms=1000"));

    assert!(matches!(
        bridge.open_reader(Cursor::new(Vec::new()), ""),
        Err(BridgeError::OpenFailed(_))
    ));

    // 不支持字节流输入的引擎：会话以 OpenFailed 进入 Error
    let engine = ScriptedEngine::new(ScriptedEngine::opening_script(Vec::new()));
    let bridge = MediaBridge::new(Arc::new(engine), BridgeConfig::default()).unwrap();
    bridge.open_reader(Cursor::new(Vec::new()), "memory://clip.mp4").unwrap();
    let snapshot = bridge.get_state();
    assert_eq!(snapshot.state, PlayerState::Error);
    assert_eq!(snapshot.last_error.map(|e| e.kind), Some(ErrorKind::OpenFailed));
}

#[test]
fn track_list_is_queried_when_the_engine_sends_none() {
    init_logger();
    let script = ScriptedEngine::opening_script(Vec::new())
        .into_iter()
        .filter(|step| !matches!(step, Step::Tracks(_)))
        .collect();
    let engine = ScriptedEngine::new(script).with_instance_tracks(vec![
        track(0, TrackKind::Video, true),
        track(3, TrackKind::Audio, true),
    ]);
    let bridge = MediaBridge::new(Arc::new(engine), BridgeConfig::default()).unwrap();
    bridge.open("scripted://silent-tracks").unwrap();

    let snapshot = poll_until(&bridge, WAIT, |s| s.track_generation > 0);
    assert_eq!(snapshot.track_generation, 1);
    assert_eq!(bridge.list_tracks(TrackKind::Audio).len(), 1);
    assert_eq!(snapshot.selected_tracks.get(&TrackKind::Audio), Some(&3));
}
