//! 合成测试引擎
//!
//! 不解码任何文件，而是在自己的线程上按帧率生成测试图案和正弦音频，
//! 行为与真实引擎一致：异步打开、在自己的线程上触发回调、
//! 轨道切换只在关键帧边界生效。
//!
//! 定位符：
//! ```text
//! synthetic://clip?duration_ms=10000&fps=25&audio=2&subs=1&width=64&height=36
//! synthetic://live            // 无时长、不可 seek
//! synthetic://unreachable     // 打开过程中异步报错
//! ```

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::{
    log_ctx, AudioFormat, BridgeError, EngineLogLevel, EngineOptions, MediaInfo, MediaSource,
    Result, SampleBuffer, SampleFormat, TrackDescriptor, TrackFlags, TrackId, TrackKind,
    VideoFormat,
};
use crate::engine::{
    EngineCallbacks, EngineCommand, EngineInstance, EngineState, MediaStream, NativeEngine,
    TeardownSignal,
};

/// 关键帧间隔（帧）
const KEYFRAME_INTERVAL: u64 = 12;
/// 每隔多少帧上报一次位置
const POSITION_REPORT_FRAMES: u64 = 5;

#[derive(Debug, Clone)]
pub struct SyntheticOptions {
    /// 时间倍率，大于 1 时比实时更快
    pub time_scale: f64,
    /// 打开耗时（按实时计）
    pub open_delay: Duration,
    /// 收到释放请求后延迟多久才确认，用于模拟销毁卡死的插件
    pub teardown_delay: Duration,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            open_delay: Duration::from_millis(30),
            teardown_delay: Duration::ZERO,
        }
    }
}

pub struct SyntheticEngine {
    options: SyntheticOptions,
    log_level: Mutex<Option<EngineLogLevel>>,
}

impl SyntheticEngine {
    pub fn new(options: SyntheticOptions) -> Self {
        Self {
            options,
            log_level: Mutex::new(None),
        }
    }
}

impl Default for SyntheticEngine {
    fn default() -> Self {
        Self::new(SyntheticOptions::default())
    }
}

impl NativeEngine for SyntheticEngine {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn initialize(&self, options: &EngineOptions) -> Result<()> {
        if !(self.options.time_scale.is_finite() && self.options.time_scale > 0.0) {
            return Err(BridgeError::Config(format!(
                "time_scale 无效: {}",
                self.options.time_scale
            )));
        }
        *self.log_level.lock() = Some(options.log_level);
        info!("{} 🧪 合成引擎已初始化 (x{:.1})", log_ctx(), self.options.time_scale);
        Ok(())
    }

    fn shutdown(&self) {
        *self.log_level.lock() = None;
        info!("{} 🧪 合成引擎已关闭", log_ctx());
    }

    fn create_instance(
        &self,
        source: &MediaSource,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn EngineInstance>> {
        let clip = ClipParams::parse(source)?;
        let tracks = clip.tracks();
        let (tx, rx) = unbounded::<Message>();

        let options = self.options.clone();
        let worker_tracks = tracks.clone();
        let thread = thread::Builder::new()
            .name(format!("synthetic-{}", callbacks.session().as_u64()))
            .spawn(move || {
                let mut worker = Worker::new(clip, worker_tracks, options, callbacks, rx);
                worker.run();
            })?;

        Ok(Box::new(SyntheticInstance {
            tx,
            tracks,
            thread: Some(thread),
        }))
    }
    /// 不读取字节流，测试图案仍由 `source` 的参数决定
    fn create_stream_instance(
        &self,
        _stream: Box<dyn MediaStream>,
        source: &MediaSource,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn EngineInstance>> {
        debug!("{} 🧪 [{}] 字节流输入按 {} 生成", log_ctx(), callbacks.session(), source.locator());
        self.create_instance(source, callbacks)
    }
}

enum Message {
    Command(EngineCommand),
    Release(TeardownSignal),
}

struct SyntheticInstance {
    tx: Sender<Message>,
    tracks: Vec<TrackDescriptor>,
    thread: Option<JoinHandle<()>>,
}

impl EngineInstance for SyntheticInstance {
    fn command(&mut self, command: EngineCommand) -> Result<()> {
        self.tx
            .send(Message::Command(command))
            .map_err(|_| BridgeError::EngineUnavailable("合成引擎线程已退出".to_string()))
    }

    fn tracks(&self) -> Vec<TrackDescriptor> {
        self.tracks.clone()
    }

    fn release(mut self: Box<Self>, done: TeardownSignal) {
        // 线程退出时会确认；这里不 join，避免阻塞调用方
        if let Err(e) = self.tx.send(Message::Release(done)) {
            if let Message::Release(done) = e.into_inner() {
                done.confirm();
            }
        }
        self.thread.take();
    }
}

/// 从定位符解析出的测试片段
#[derive(Debug, Clone)]
struct ClipParams {
    duration: Option<Duration>,
    fps: u32,
    audio_tracks: u32,
    text_tracks: u32,
    width: u32,
    height: u32,
    unreachable: bool,
}

impl ClipParams {
    fn parse(source: &MediaSource) -> Result<Self> {
        let locator = source.locator();
        let rest = locator
            .strip_prefix("synthetic://")
            .ok_or_else(|| BridgeError::OpenFailed(format!("合成引擎不支持: {}", locator)))?;
        let (host, query) = rest.split_once('?').unwrap_or((rest, ""));

        let mut clip = ClipParams {
            duration: Some(Duration::from_secs(10)),
            fps: 25,
            audio_tracks: 1,
            text_tracks: 0,
            width: 64,
            height: 36,
            unreachable: host == "unreachable",
        };
        if host == "live" {
            clip.duration = None;
        }

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let number = value
                .parse::<u64>()
                .map_err(|_| BridgeError::OpenFailed(format!("参数 {} 无效: {}", key, value)))?;
            match key {
                "duration_ms" => clip.duration = Some(Duration::from_millis(number)),
                "fps" => clip.fps = number.clamp(1, 240) as u32,
                "audio" => clip.audio_tracks = number.min(8) as u32,
                "subs" => clip.text_tracks = number.min(8) as u32,
                "width" => clip.width = number.clamp(1, 4096) as u32,
                "height" => clip.height = number.clamp(1, 4096) as u32,
                _ => debug!("{} 忽略未知参数 {}", log_ctx(), key),
            }
        }
        Ok(clip)
    }

    fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.fps
    }

    fn tracks(&self) -> Vec<TrackDescriptor> {
        const LANGUAGES: [&str; 8] = ["en", "ja", "zh", "fr", "de", "es", "ko", "it"];

        let mut tracks = vec![TrackDescriptor {
            id: 0,
            kind: TrackKind::Video,
            codec: "synthetic-pattern".to_string(),
            name: format!("{}x{}", self.width, self.height),
            language: None,
            flags: TrackFlags {
                default: true,
                forced: false,
            },
        }];
        let mut next_id: TrackId = 1;
        for i in 0..self.audio_tracks as usize {
            tracks.push(TrackDescriptor {
                id: next_id,
                kind: TrackKind::Audio,
                codec: "pcm".to_string(),
                name: String::new(),
                language: Some(LANGUAGES[i % LANGUAGES.len()].to_string()),
                flags: TrackFlags {
                    default: i == 0,
                    forced: false,
                },
            });
            next_id += 1;
        }
        for i in 0..self.text_tracks as usize {
            tracks.push(TrackDescriptor {
                id: next_id,
                kind: TrackKind::Text,
                codec: "tx3g".to_string(),
                name: String::new(),
                language: Some(LANGUAGES[i % LANGUAGES.len()].to_string()),
                flags: TrackFlags::default(),
            });
            next_id += 1;
        }
        tracks
    }

    fn media_info(&self) -> MediaInfo {
        MediaInfo {
            duration: self.duration,
            seekable: self.duration.is_some(),
            pausable: true,
            width: Some(self.width),
            height: Some(self.height),
            fps: Some(self.fps as f64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// 已缓冲，等待 Play
    Ready,
    Playing,
    Paused,
    Stopped,
    Ended,
}

struct Worker {
    clip: ClipParams,
    tracks: Vec<TrackDescriptor>,
    options: SyntheticOptions,
    callbacks: EngineCallbacks,
    rx: Receiver<Message>,
    phase: Phase,
    frame: u64,
    rate: f32,
    /// 当前生效 / 等待关键帧生效的轨道
    active_tracks: Vec<(TrackKind, Option<TrackId>)>,
    pending_switch: Vec<(TrackKind, Option<TrackId>)>,
    video_buf: Vec<u8>,
    audio_buf: Vec<f32>,
    audio_buf_i16: Vec<i16>,
}

impl Worker {
    fn new(
        clip: ClipParams,
        tracks: Vec<TrackDescriptor>,
        options: SyntheticOptions,
        callbacks: EngineCallbacks,
        rx: Receiver<Message>,
    ) -> Self {
        let active_tracks = tracks
            .iter()
            .filter(|t| t.flags.default)
            .map(|t| (t.kind, Some(t.id)))
            .collect();
        Self {
            clip,
            tracks,
            options,
            callbacks,
            rx,
            phase: Phase::Ready,
            frame: 0,
            rate: 1.0,
            active_tracks,
            pending_switch: Vec::new(),
            video_buf: Vec::new(),
            audio_buf: Vec::new(),
            audio_buf_i16: Vec::new(),
        }
    }

    fn scaled(&self, d: Duration) -> Duration {
        d.div_f64(self.options.time_scale * self.rate.max(0.01) as f64)
    }

    fn position(&self) -> Duration {
        self.clip.frame_duration() * self.frame as u32
    }

    fn run(&mut self) {
        let session = self.callbacks.session();
        info!("{} 🧪 [{}] 合成引擎线程启动", log_ctx(), session);

        self.callbacks.on_state_changed(EngineState::Opening);
        let opened_at = Instant::now() + self.options.open_delay;
        let done = loop {
            match self.rx.recv_deadline(opened_at) {
                Ok(Message::Release(done)) => break Some(done),
                // 打开期间只会收到轨道切换，等第一个关键帧再生效
                Ok(Message::Command(EngineCommand::SelectTrack { kind, id })) => {
                    debug!("{} [{}] 打开期间的轨道切换 {:?} -> {:?}", log_ctx(), session, kind, id);
                    self.queue_switch(kind, id);
                }
                Ok(Message::Command(command)) => {
                    debug!("{} [{}] 打开期间忽略命令 {:?}", log_ctx(), session, command);
                }
                Err(RecvTimeoutError::Timeout) => break None,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        };

        let done = match done {
            Some(done) => Some(done),
            None if self.clip.unreachable => {
                self.callbacks.on_error(-2, "无法连接到 synthetic://unreachable");
                self.wait_for_release()
            }
            None => {
                self.callbacks.on_state_changed(EngineState::Opened(self.clip.media_info()));
                self.callbacks.on_tracks_changed(self.tracks.clone());
                self.callbacks.on_state_changed(EngineState::Buffering);
                self.main_loop()
            }
        };

        self.finish(done);
    }

    /// 出错后只等待释放
    fn wait_for_release(&self) -> Option<TeardownSignal> {
        loop {
            match self.rx.recv() {
                Ok(Message::Release(done)) => return Some(done),
                Ok(Message::Command(_)) => {}
                Err(_) => return None,
            }
        }
    }

    fn main_loop(&mut self) -> Option<TeardownSignal> {
        let mut deadline = Instant::now();

        loop {
            let message = if self.phase == Phase::Playing {
                let now = Instant::now();
                if deadline <= now {
                    self.emit_frame();
                    deadline += self.scaled(self.clip.frame_duration());
                    // 落后太多时不追帧
                    if deadline < now {
                        deadline = now;
                    }
                    continue;
                }
                self.rx.recv_timeout(deadline - now)
            } else {
                self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
            };

            match message {
                Ok(Message::Release(done)) => return Some(done),
                Ok(Message::Command(command)) => {
                    let was_playing = self.phase == Phase::Playing;
                    self.handle_command(command);
                    if self.phase == Phase::Playing && !was_playing {
                        deadline = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn handle_command(&mut self, command: EngineCommand) {
        debug!("{} 🧪 [{}] 命令 {:?}", log_ctx(), self.callbacks.session(), command);
        match command {
            EngineCommand::Play => {
                if matches!(self.phase, Phase::Stopped | Phase::Ended) {
                    self.frame = 0;
                }
                if self.phase != Phase::Playing {
                    self.phase = Phase::Playing;
                    self.callbacks.on_state_changed(EngineState::Playing);
                }
            }
            EngineCommand::Pause => {
                if self.phase == Phase::Playing {
                    self.phase = Phase::Paused;
                    self.callbacks.on_state_changed(EngineState::Paused);
                }
            }
            EngineCommand::Stop => {
                self.frame = 0;
                self.phase = Phase::Stopped;
                self.callbacks.on_state_changed(EngineState::Stopped);
            }
            EngineCommand::Seek(target) => {
                if self.clip.duration.is_none() {
                    return;
                }
                let frame_ms = self.clip.frame_duration().as_secs_f64() * 1000.0;
                self.frame = (target.as_secs_f64() * 1000.0 / frame_ms).round() as u64;
                if self.phase == Phase::Ended {
                    self.phase = Phase::Paused;
                }
                if self.phase == Phase::Playing {
                    self.callbacks.on_state_changed(EngineState::Buffering);
                    self.callbacks.on_position_changed(self.position());
                    self.callbacks.on_state_changed(EngineState::Playing);
                } else {
                    self.callbacks.on_position_changed(self.position());
                }
            }
            EngineCommand::SetRate(rate) => {
                if rate > 0.0 {
                    self.rate = rate;
                }
            }
            EngineCommand::SelectTrack { kind, id } => self.queue_switch(kind, id),
        }
    }

    fn queue_switch(&mut self, kind: TrackKind, id: Option<TrackId>) {
        self.pending_switch.retain(|(k, _)| *k != kind);
        self.pending_switch.push((kind, id));
    }

    fn apply_track_switches(&mut self) {
        if self.pending_switch.is_empty() || self.frame % KEYFRAME_INTERVAL != 0 {
            return;
        }
        for (kind, id) in self.pending_switch.drain(..) {
            self.active_tracks.retain(|(k, _)| *k != kind);
            self.active_tracks.push((kind, id));
            info!(
                "{} 🔀 [{}] 第 {} 帧切换 {} 轨道 -> {:?}",
                log_ctx(),
                self.callbacks.session(),
                self.frame,
                kind.as_str(),
                id
            );
        }
    }

    fn track_enabled(&self, kind: TrackKind) -> bool {
        self.active_tracks
            .iter()
            .any(|(k, id)| *k == kind && id.is_some())
    }

    fn emit_frame(&mut self) {
        if let Some(duration) = self.clip.duration {
            if self.position() >= duration {
                self.callbacks.on_position_changed(duration);
                self.callbacks.on_end_reached();
                self.phase = Phase::Ended;
                return;
            }
        }

        self.apply_track_switches();
        let pts = self.position();
        let frame_duration = self.clip.frame_duration();

        if self.track_enabled(TrackKind::Video) {
            if let Some(format) = self.callbacks.video_format() {
                self.render_video(format);
                let sample = SampleBuffer::video(pts, frame_duration, &self.video_buf, format);
                self.callbacks.on_video_frame(&sample);
            }
        }

        if self.track_enabled(TrackKind::Audio) {
            if let Some(format) = self.callbacks.audio_format() {
                self.render_audio(format, pts, frame_duration);
                let payload: &[u8] = match format.sample_format {
                    SampleFormat::F32 => bytemuck::cast_slice(&self.audio_buf),
                    SampleFormat::I16 => bytemuck::cast_slice(&self.audio_buf_i16),
                };
                let sample = SampleBuffer::audio(pts, payload, format);
                self.callbacks.on_audio_samples(&sample);
            }
        }

        self.frame += 1;
        if self.frame % POSITION_REPORT_FRAMES == 0 {
            self.callbacks.on_position_changed(self.position());
        }
    }

    /// 测试图案：整帧填充帧序号
    fn render_video(&mut self, format: VideoFormat) {
        let size = format.frame_size();
        if self.video_buf.len() != size {
            self.video_buf.resize(size, 0);
        }
        self.video_buf.fill((self.frame % 256) as u8);
    }

    /// 440Hz 正弦波
    fn render_audio(&mut self, format: AudioFormat, pts: Duration, frame_duration: Duration) {
        let frames = (format.sample_rate as f64 * frame_duration.as_secs_f64()).round() as usize;
        let channels = format.channels.max(1) as usize;
        let start = pts.as_secs_f64();

        self.audio_buf.clear();
        for i in 0..frames {
            let t = start + i as f64 / format.sample_rate.max(1) as f64;
            let value = (t * 440.0 * std::f64::consts::TAU).sin() as f32 * 0.2;
            for _ in 0..channels {
                self.audio_buf.push(value);
            }
        }

        if format.sample_format == SampleFormat::I16 {
            self.audio_buf_i16.clear();
            self.audio_buf_i16
                .extend(self.audio_buf.iter().map(|v| (v * i16::MAX as f32) as i16));
        }
    }

    fn finish(&mut self, done: Option<TeardownSignal>) {
        let session = self.callbacks.session();
        if !self.options.teardown_delay.is_zero() {
            warn!(
                "{} 🐢 [{}] 模拟销毁卡顿 {}ms",
                log_ctx(),
                session,
                self.options.teardown_delay.as_millis()
            );
            thread::sleep(self.options.teardown_delay);
        }
        if let Some(done) = done {
            done.confirm();
        }
        info!("{} 🧪 [{}] 合成引擎线程退出", log_ctx(), session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clip_parameters() {
        let source = MediaSource::from_locator("synthetic://clip?duration_ms=2500&fps=50&audio=2&subs=1").unwrap();
        let clip = ClipParams::parse(&source).unwrap();
        assert_eq!(clip.duration, Some(Duration::from_millis(2500)));
        assert_eq!(clip.frame_duration(), Duration::from_millis(20));

        let tracks = clip.tracks();
        let kinds: Vec<_> = tracks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![TrackKind::Video, TrackKind::Audio, TrackKind::Audio, TrackKind::Text]
        );
        let ids: Vec<_> = tracks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn live_clip_is_not_seekable() {
        let source = MediaSource::from_locator("synthetic://live").unwrap();
        let info = ClipParams::parse(&source).unwrap().media_info();
        assert!(info.duration.is_none());
        assert!(!info.seekable);
    }

    #[test]
    fn rejects_foreign_locators() {
        let source = MediaSource::from_locator("/tmp/movie.mkv").unwrap();
        assert!(matches!(ClipParams::parse(&source), Err(BridgeError::OpenFailed(_))));

        let bad = MediaSource::from_locator("synthetic://clip?fps=fast").unwrap();
        assert!(ClipParams::parse(&bad).is_err());
    }
}
