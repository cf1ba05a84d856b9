#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use myy_media_bridge::core::{
    EngineOptions, MediaInfo, MediaSource, PlayerStateSnapshot, Result, TrackDescriptor,
    TrackFlags, TrackKind,
};
use myy_media_bridge::engine::{
    EngineCallbacks, EngineCommand, EngineInstance, EngineState, NativeEngine, TeardownSignal,
};
use myy_media_bridge::{BridgeConfig, MediaBridge, SyntheticEngine, SyntheticOptions};

pub fn init_logger() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// 比实时快 20 倍、几乎不耗时打开的合成引擎
pub fn fast_bridge(config: BridgeConfig) -> MediaBridge {
    fast_bridge_with(config, SyntheticOptions {
        time_scale: 20.0,
        open_delay: Duration::from_millis(5),
        teardown_delay: Duration::ZERO,
    })
}

pub fn fast_bridge_with(config: BridgeConfig, options: SyntheticOptions) -> MediaBridge {
    init_logger();
    MediaBridge::new(Arc::new(SyntheticEngine::new(options)), config).unwrap()
}

/// 宿主帧循环：不断 poll 直到条件满足或超时
pub fn poll_until(
    bridge: &MediaBridge,
    timeout: Duration,
    mut done: impl FnMut(&PlayerStateSnapshot) -> bool,
) -> PlayerStateSnapshot {
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = bridge.poll();
        if done(&snapshot) || Instant::now() >= deadline {
            return snapshot;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// 脚本引擎的一步
#[derive(Debug, Clone)]
pub enum Step {
    State(EngineState),
    Tracks(Vec<TrackDescriptor>),
    Position(Duration),
    End,
    Error(i32, String),
    Sleep(Duration),
    /// 阻塞到收到指定命令
    AwaitCommand(&'static str),
}

/// 在自己的线程上按脚本触发回调的引擎，并记录收到的命令
pub struct ScriptedEngine {
    script: Vec<Step>,
    /// 实例轨道查询返回的列表
    instance_tracks: Vec<TrackDescriptor>,
    pub commands: Arc<Mutex<Vec<EngineCommand>>>,
    pub releases: Arc<Mutex<u32>>,
}

impl ScriptedEngine {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script,
            instance_tracks: Vec::new(),
            commands: Arc::new(Mutex::new(Vec::new())),
            releases: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_instance_tracks(mut self, tracks: Vec<TrackDescriptor>) -> Self {
        self.instance_tracks = tracks;
        self
    }

    /// 正常打开并缓冲完毕的脚本
    pub fn opening_script(tracks: Vec<TrackDescriptor>) -> Vec<Step> {
        vec![
            Step::State(EngineState::Opening),
            Step::Sleep(Duration::from_millis(20)),
            Step::State(EngineState::Opened(MediaInfo {
                duration: Some(Duration::from_secs(60)),
                seekable: true,
                pausable: true,
                width: Some(32),
                height: Some(18),
                fps: Some(25.0),
            })),
            Step::Tracks(tracks),
            Step::State(EngineState::Buffering),
            Step::AwaitCommand("play"),
            Step::State(EngineState::Playing),
        ]
    }
}

impl NativeEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn initialize(&self, _options: &EngineOptions) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn create_instance(
        &self,
        _source: &MediaSource,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn EngineInstance>> {
        let (tx, rx) = unbounded::<EngineCommand>();
        let script = self.script.clone();
        let commands = self.commands.clone();
        thread::spawn(move || run_script(script, callbacks, rx, commands));
        Ok(Box::new(ScriptedInstance {
            tx,
            tracks: self.instance_tracks.clone(),
            releases: self.releases.clone(),
        }))
    }
}

fn run_script(
    script: Vec<Step>,
    callbacks: EngineCallbacks,
    rx: Receiver<EngineCommand>,
    commands: Arc<Mutex<Vec<EngineCommand>>>,
) {
    for step in script {
        match step {
            Step::State(state) => callbacks.on_state_changed(state),
            Step::Tracks(tracks) => callbacks.on_tracks_changed(tracks),
            Step::Position(position) => callbacks.on_position_changed(position),
            Step::End => callbacks.on_end_reached(),
            Step::Error(code, message) => callbacks.on_error(code, message),
            Step::Sleep(duration) => thread::sleep(duration),
            Step::AwaitCommand(name) => loop {
                match rx.recv() {
                    Ok(command) => {
                        let matched = command.name() == name;
                        commands.lock().push(command);
                        if matched {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            },
        }
    }
    // 脚本结束后继续记录命令
    while let Ok(command) = rx.recv() {
        commands.lock().push(command);
    }
}

struct ScriptedInstance {
    tx: Sender<EngineCommand>,
    tracks: Vec<TrackDescriptor>,
    releases: Arc<Mutex<u32>>,
}

impl EngineInstance for ScriptedInstance {
    fn command(&mut self, command: EngineCommand) -> Result<()> {
        let _ = self.tx.send(command);
        Ok(())
    }

    fn tracks(&self) -> Vec<TrackDescriptor> {
        self.tracks.clone()
    }

    fn release(self: Box<Self>, done: TeardownSignal) {
        *self.releases.lock() += 1;
        done.confirm();
    }
}

pub fn track(id: i32, kind: TrackKind, default: bool) -> TrackDescriptor {
    TrackDescriptor {
        id,
        kind,
        codec: "test".to_string(),
        name: String::new(),
        language: None,
        flags: TrackFlags {
            default,
            forced: false,
        },
    }
}
