//! FFmpeg 解码引擎（`ffmpeg` feature）
//!
//! 每个实例一个工作线程：解封装、解码、按时钟节拍投递到宿主 sink。
//! 输入可以是定位符，也可以是宿主提供的字节流（自定义 AVIO）。
//! 字幕流会出现在轨道列表中，但不做渲染。

mod avio;
mod decoder;
mod demuxer;
mod worker;

use crossbeam_channel::{unbounded, Sender};
use ffmpeg_next as ffmpeg;
use log::info;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

use self::worker::Message;
use crate::core::{log_ctx, BridgeError, EngineLogLevel, EngineOptions, MediaSource, Result, TrackDescriptor};
use crate::engine::{
    EngineCallbacks, EngineCommand, EngineInstance, MediaStream, NativeEngine, TeardownSignal,
};

pub struct FfmpegEngine {
    options: Mutex<Option<EngineOptions>>,
}

impl FfmpegEngine {
    pub fn new() -> Self {
        Self {
            options: Mutex::new(None),
        }
    }
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEngine for FfmpegEngine {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn initialize(&self, options: &EngineOptions) -> Result<()> {
        ffmpeg::init()?;
        ffmpeg::util::log::set_level(match options.log_level {
            EngineLogLevel::Error => ffmpeg::util::log::Level::Error,
            EngineLogLevel::Warning => ffmpeg::util::log::Level::Warning,
            EngineLogLevel::Debug => ffmpeg::util::log::Level::Debug,
        });
        *self.options.lock() = Some(options.clone());
        info!("{} 🎞️ FFmpeg 引擎已初始化", log_ctx());
        Ok(())
    }

    fn shutdown(&self) {
        *self.options.lock() = None;
        info!("{} 🎞️ FFmpeg 引擎已关闭", log_ctx());
    }

    fn create_instance(
        &self,
        source: &MediaSource,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn EngineInstance>> {
        self.spawn(source, None, callbacks)
    }

    /// 字节流通过自定义 AVIO 读取
    fn create_stream_instance(
        &self,
        stream: Box<dyn MediaStream>,
        source: &MediaSource,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn EngineInstance>> {
        self.spawn(source, Some(stream), callbacks)
    }
}

impl FfmpegEngine {
    fn spawn(
        &self,
        source: &MediaSource,
        stream: Option<Box<dyn MediaStream>>,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn EngineInstance>> {
        let options = self
            .options
            .lock()
            .clone()
            .ok_or_else(|| BridgeError::EngineUnavailable("FFmpeg 引擎未初始化".to_string()))?;

        let (tx, rx) = unbounded::<Message>();
        let tracks = Arc::new(Mutex::new(Vec::new()));
        let worker_tracks = tracks.clone();
        let source = source.clone();

        thread::Builder::new()
            .name(format!("ffmpeg-{}", callbacks.session().as_u64()))
            .spawn(move || worker::run(source, stream, options, callbacks, worker_tracks, rx))?;

        Ok(Box::new(FfmpegInstance { tx, tracks }))
    }
}

struct FfmpegInstance {
    tx: Sender<Message>,
    tracks: Arc<Mutex<Vec<TrackDescriptor>>>,
}

impl EngineInstance for FfmpegInstance {
    fn command(&mut self, command: EngineCommand) -> Result<()> {
        self.tx
            .send(Message::Command(command))
            .map_err(|_| BridgeError::EngineUnavailable("FFmpeg 工作线程已退出".to_string()))
    }

    fn tracks(&self) -> Vec<TrackDescriptor> {
        self.tracks.lock().clone()
    }

    fn release(self: Box<Self>, done: TeardownSignal) {
        if let Err(e) = self.tx.send(Message::Release(done)) {
            if let Message::Release(done) = e.into_inner() {
                done.confirm();
            }
        }
    }
}
