//! 原生解码引擎接口
//!
//! 桥接层只通过这里的 trait 与引擎交互：
//! - `NativeEngine`：进程级上下文（初始化、关闭、创建实例）
//! - `EngineInstance`：一次播放对应的实例（命令、轨道查询、释放）
//! - `MediaStream`：宿主提供的字节流输入，引擎通过读取/定位回调取数据
//!
//! 引擎在自己的线程上通过 `EngineCallbacks` 上报事件和解码帧，
//! 回调里只允许入队/拷贝，绝不能同步回调引擎。

pub mod context;
pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::{Read, Seek};
use std::time::Duration;

use crate::core::{
    BridgeError, EngineOptions, MediaInfo, MediaSource, Result, TrackDescriptor, TrackId, TrackKind,
};

pub use crate::player::events::EngineCallbacks;
pub use context::{EngineContext, EngineHandle};
pub use synthetic::{SyntheticEngine, SyntheticOptions};

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegEngine;

/// 发往引擎实例的命令（非阻塞，效果异步体现）
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Play,
    Pause,
    Stop,
    Seek(Duration),
    SetRate(f32),
    /// `id` 为 None 表示禁用该类型的轨道
    SelectTrack {
        kind: TrackKind,
        id: Option<TrackId>,
    },
}

impl EngineCommand {
    pub fn name(&self) -> &'static str {
        match self {
            EngineCommand::Play => "play",
            EngineCommand::Pause => "pause",
            EngineCommand::Stop => "stop",
            EngineCommand::Seek(_) => "seek",
            EngineCommand::SetRate(_) => "set_rate",
            EngineCommand::SelectTrack { .. } => "select_track",
        }
    }
}

/// 引擎上报的状态
#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    Opening,
    /// 媒体已打开，携带媒体信息
    Opened(MediaInfo),
    Buffering,
    /// 缓冲完成，开始出帧
    Playing,
    Paused,
    Stopped,
}

/// 宿主提供的可定位字节流
pub trait MediaStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> MediaStream for T {}

/// 原生引擎的进程级入口
pub trait NativeEngine: Send + Sync {
    fn name(&self) -> &str;

    /// 进程级初始化，由 `EngineContext` 在创建时调用一次
    fn initialize(&self, options: &EngineOptions) -> Result<()>;

    /// 进程级关闭，由 `EngineContext` 在所有实例释放后调用
    fn shutdown(&self);

    /// 创建播放实例；打开过程是异步的，结果通过回调上报
    fn create_instance(
        &self,
        source: &MediaSource,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn EngineInstance>>;

    /// 从宿主字节流创建播放实例；`source` 是流的原始地址，用于日志和格式探测
    fn create_stream_instance(
        &self,
        _stream: Box<dyn MediaStream>,
        source: &MediaSource,
        _callbacks: EngineCallbacks,
    ) -> Result<Box<dyn EngineInstance>> {
        Err(BridgeError::OpenFailed(format!(
            "{} 引擎不支持字节流输入: {}",
            self.name(),
            source.locator()
        )))
    }
}

/// 一次播放的引擎实例
pub trait EngineInstance: Send {
    /// 下发命令，必须立即返回
    fn command(&mut self, command: EngineCommand) -> Result<()>;

    /// 当前的轨道列表
    fn tracks(&self) -> Vec<TrackDescriptor>;

    /// 释放实例。引擎在资源真正回收后调用 `done.confirm()`（或直接丢弃它）。
    fn release(self: Box<Self>, done: TeardownSignal);
}

/// 引擎确认销毁完成的信号
pub struct TeardownSignal(Sender<()>);

impl TeardownSignal {
    pub(crate) fn channel() -> (TeardownSignal, Receiver<()>) {
        let (tx, rx) = bounded(1);
        (TeardownSignal(tx), rx)
    }

    pub fn confirm(self) {
        let _ = self.0.try_send(());
    }
}
