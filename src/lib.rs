//! 原生媒体解码引擎的播放桥接层
//!
//! - `core`：数据模型、错误、配置、播放时钟
//! - `engine`：原生引擎接口与内置引擎
//! - `player`：事件桥、状态机、轨道协商、样本投递，以及宿主使用的 `MediaBridge`

pub mod core;
pub mod engine;
pub mod player;

pub use crate::core::{BridgeConfig, BridgeError, PlayerState, PlayerStateSnapshot, Result};
pub use crate::engine::{NativeEngine, SyntheticEngine, SyntheticOptions};
pub use crate::player::{AudioSink, BridgeNotification, MediaBridge, VideoSink};
