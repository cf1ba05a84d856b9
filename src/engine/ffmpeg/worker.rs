use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use ffmpeg_next as ffmpeg;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::decoder::{AudioDecoder, VideoDecoder};
use super::demuxer::Demuxer;
use crate::core::{
    log_ctx, EngineOptions, MediaSource, PlaybackClock, SampleBuffer, TrackDescriptor, TrackId,
    TrackKind,
};
use crate::engine::{EngineCallbacks, EngineCommand, EngineState, MediaStream, TeardownSignal};

/// 位置上报间隔
const POSITION_REPORT_INTERVAL: Duration = Duration::from_millis(250);
/// 等待帧显示时间时最长的单次阻塞
const MAX_WAIT_SLICE: Duration = Duration::from_millis(10);

pub(super) enum Message {
    Command(EngineCommand),
    Release(TeardownSignal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    Playing,
    Paused,
    Stopped,
    Ended,
}

/// 引擎工作线程入口：异步打开，然后进入解码循环
pub(super) fn run(
    source: MediaSource,
    stream: Option<Box<dyn MediaStream>>,
    options: EngineOptions,
    callbacks: EngineCallbacks,
    shared_tracks: Arc<Mutex<Vec<TrackDescriptor>>>,
    rx: Receiver<Message>,
) {
    let session = callbacks.session();
    info!("{} 🎞️ [{}] FFmpeg 工作线程启动", log_ctx(), session);
    callbacks.on_state_changed(EngineState::Opening);

    let opened = match stream {
        Some(stream) => Demuxer::open_stream(stream, &source),
        None => Demuxer::open(&source, &options),
    };
    let done = match opened {
        Ok(demuxer) => {
            info!("{} ✅ [{}] {}", log_ctx(), session, demuxer.description());
            *shared_tracks.lock() = demuxer.tracks().to_vec();
            callbacks.on_state_changed(EngineState::Opened(demuxer.media_info().clone()));
            callbacks.on_tracks_changed(demuxer.tracks().to_vec());
            callbacks.on_state_changed(EngineState::Buffering);

            let mut playback = Playback::new(demuxer, callbacks.clone(), rx);
            playback.run()
        }
        Err(e) => {
            warn!("{} ❌ [{}] 打开失败: {}", log_ctx(), session, e);
            callbacks.on_error(-1, e.to_string());
            wait_for_release(&rx)
        }
    };

    if let Some(done) = done {
        done.confirm();
    }
    info!("{} 🎞️ [{}] FFmpeg 工作线程退出", log_ctx(), session);
}

fn wait_for_release(rx: &Receiver<Message>) -> Option<TeardownSignal> {
    loop {
        match rx.recv() {
            Ok(Message::Release(done)) => return Some(done),
            Ok(Message::Command(_)) => {}
            Err(_) => return None,
        }
    }
}

struct Playback {
    demuxer: Demuxer,
    callbacks: EngineCallbacks,
    rx: Receiver<Message>,
    inbox: VecDeque<Message>,
    clock: PlaybackClock,
    phase: Phase,
    video_stream: Option<usize>,
    audio_stream: Option<usize>,
    video: Option<VideoDecoder>,
    audio: Option<AudioDecoder>,
    /// 等待关键帧才生效的视频轨切换
    pending_video: Option<Option<TrackId>>,
    last_report: Instant,
}

impl Playback {
    fn new(demuxer: Demuxer, callbacks: EngineCallbacks, rx: Receiver<Message>) -> Self {
        let default_of = |kind: TrackKind| {
            demuxer
                .tracks()
                .iter()
                .find(|t| t.kind == kind && t.flags.default)
                .map(|t| t.id as usize)
        };
        let video_stream = default_of(TrackKind::Video);
        let audio_stream = default_of(TrackKind::Audio);

        let mut playback = Self {
            demuxer,
            callbacks,
            rx,
            inbox: VecDeque::new(),
            clock: PlaybackClock::new(),
            phase: Phase::Ready,
            video_stream: None,
            audio_stream: None,
            video: None,
            audio: None,
            pending_video: None,
            last_report: Instant::now(),
        };
        playback.switch_video(video_stream);
        playback.switch_audio(audio_stream);
        playback
    }

    fn run(&mut self) -> Option<TeardownSignal> {
        loop {
            let message = if let Some(message) = self.inbox.pop_front() {
                Some(message)
            } else if self.phase == Phase::Playing {
                match self.rx.try_recv() {
                    Ok(message) => Some(message),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => return None,
                }
            } else {
                match self.rx.recv() {
                    Ok(message) => Some(message),
                    Err(_) => return None,
                }
            };

            match message {
                Some(Message::Release(done)) => return Some(done),
                Some(Message::Command(command)) => self.handle_command(command),
                None => {
                    if !self.step() {
                        self.reach_end();
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: EngineCommand) {
        debug!("{} 🎞️ [{}] 命令 {:?}", log_ctx(), self.callbacks.session(), command);
        match command {
            EngineCommand::Play => {
                if matches!(self.phase, Phase::Stopped | Phase::Ended) {
                    self.seek_to(Duration::ZERO);
                }
                if self.phase != Phase::Playing {
                    self.phase = Phase::Playing;
                    self.clock.play();
                    self.callbacks.on_state_changed(EngineState::Playing);
                }
            }
            EngineCommand::Pause => {
                if self.phase == Phase::Playing {
                    self.phase = Phase::Paused;
                    self.clock.pause();
                    self.callbacks.on_state_changed(EngineState::Paused);
                }
            }
            EngineCommand::Stop => {
                self.phase = Phase::Stopped;
                self.clock.pause();
                self.callbacks.on_state_changed(EngineState::Stopped);
            }
            EngineCommand::Seek(target) => {
                if !self.demuxer.media_info().seekable {
                    return;
                }
                if self.phase == Phase::Ended {
                    self.phase = Phase::Paused;
                }
                let playing = self.phase == Phase::Playing;
                if playing {
                    self.callbacks.on_state_changed(EngineState::Buffering);
                }
                self.seek_to(target);
                if playing {
                    self.callbacks.on_state_changed(EngineState::Playing);
                }
            }
            EngineCommand::SetRate(rate) => {
                if rate > 0.0 {
                    self.clock.set_rate(rate as f64);
                }
            }
            EngineCommand::SelectTrack { kind, id } => match kind {
                // 视频切换等到下一个关键帧
                TrackKind::Video => self.pending_video = Some(id),
                TrackKind::Audio => self.switch_audio(id.map(|id| id as usize)),
                // 字幕不在此引擎中渲染
                TrackKind::Text => {}
            },
        }
    }

    fn seek_to(&mut self, target: Duration) {
        if let Err(e) = self.demuxer.seek(target) {
            warn!("{} ⚠️ Seek 失败: {}", log_ctx(), e);
            return;
        }
        if let Some(video) = self.video.as_mut() {
            video.flush();
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.flush();
        }
        self.clock.set_time(target);
        self.callbacks.on_position_changed(target);
    }

    fn switch_video(&mut self, stream: Option<usize>) {
        self.video_stream = stream;
        self.video = stream.and_then(|index| {
            let stream = self.demuxer.stream(index)?;
            VideoDecoder::from_stream(stream)
                .map_err(|e| warn!("{} ⚠️ 视频解码器创建失败: {}", log_ctx(), e))
                .ok()
        });
    }

    fn switch_audio(&mut self, stream: Option<usize>) {
        self.audio_stream = stream;
        self.audio = stream.and_then(|index| {
            let stream = self.demuxer.stream(index)?;
            AudioDecoder::from_stream(stream)
                .map_err(|e| warn!("{} ⚠️ 音频解码器创建失败: {}", log_ctx(), e))
                .ok()
        });
    }

    /// 读取并投递一个数据包；返回 false 表示 EOF
    fn step(&mut self) -> bool {
        let Some((index, packet)) = self.demuxer.read_packet() else {
            self.drain_video();
            return false;
        };

        if self.pending_video.is_some() && packet.is_key() {
            if let Some(next) = self.pending_video.take() {
                let next = next.map(|id| id as usize);
                info!(
                    "{} 🔀 [{}] 关键帧处切换视频轨 -> {:?}",
                    log_ctx(),
                    self.callbacks.session(),
                    next
                );
                self.switch_video(next);
            }
        }

        if Some(index) == self.video_stream {
            self.handle_video(&packet);
        } else if Some(index) == self.audio_stream {
            self.handle_audio(&packet);
        }

        if self.last_report.elapsed() >= POSITION_REPORT_INTERVAL {
            self.last_report = Instant::now();
            self.callbacks.on_position_changed(self.clock.now());
        }
        true
    }

    fn handle_video(&mut self, packet: &ffmpeg::Packet) {
        let Some(format) = self.callbacks.video_format() else {
            return;
        };
        let Some(decoder) = self.video.as_mut() else {
            return;
        };
        let frames = match decoder.decode(packet, format) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("{} ⚠️ 视频解码失败: {}", log_ctx(), e);
                return;
            }
        };
        let frame_duration = self
            .demuxer
            .media_info()
            .fps
            .filter(|fps| *fps > 0.0)
            .map(|fps| Duration::from_secs_f64(1.0 / fps))
            .unwrap_or_default();

        for frame in frames {
            if !self.wait_until(frame.pts) {
                break;
            }
            let sample = SampleBuffer::video(frame.pts, frame_duration, &frame.data, format);
            self.callbacks.on_video_frame(&sample);
        }
    }

    fn drain_video(&mut self) {
        let Some(format) = self.callbacks.video_format() else {
            return;
        };
        let Some(decoder) = self.video.as_mut() else {
            return;
        };
        if let Ok(frames) = decoder.finish(format) {
            for frame in frames {
                let sample = SampleBuffer::video(frame.pts, Duration::ZERO, &frame.data, format);
                self.callbacks.on_video_frame(&sample);
            }
        }
    }

    fn handle_audio(&mut self, packet: &ffmpeg::Packet) {
        let Some(format) = self.callbacks.audio_format() else {
            return;
        };
        let Some(decoder) = self.audio.as_mut() else {
            return;
        };
        match decoder.decode(packet, format) {
            Ok(chunks) => {
                // 音频由宿主环形缓冲节流，不按时钟等待
                for chunk in chunks {
                    let sample = SampleBuffer::audio(chunk.pts, &chunk.data, format);
                    self.callbacks.on_audio_samples(&sample);
                }
            }
            Err(e) => warn!("{} ⚠️ 音频解码失败: {}", log_ctx(), e),
        }
    }

    /// 等到时钟走到 `pts`；期间收到消息则放入收件箱并返回 false
    fn wait_until(&mut self, pts: Duration) -> bool {
        loop {
            let now = self.clock.now();
            if now >= pts {
                return true;
            }
            let rate = self.clock.rate().max(0.01);
            let wait = (pts - now).div_f64(rate).min(MAX_WAIT_SLICE);
            match self.rx.recv_timeout(wait) {
                Ok(message) => {
                    self.inbox.push_back(message);
                    return false;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    fn reach_end(&mut self) {
        let end = self
            .demuxer
            .media_info()
            .duration
            .unwrap_or_else(|| self.clock.now());
        info!("{} 🏁 [{}] 播放结束", log_ctx(), self.callbacks.session());
        self.clock.pause();
        self.callbacks.on_position_changed(end);
        self.callbacks.on_end_reached();
        self.phase = Phase::Ended;
    }
}
