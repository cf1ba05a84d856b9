use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::PlayerState;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// 媒体源无法访问或格式不支持
    #[error("无法打开媒体源: {0}")]
    OpenFailed(String),

    /// 原生引擎已报告致命错误（或实例已释放），不可再调用
    #[error("原生引擎不可用: {0}")]
    EngineUnavailable(String),

    #[error("无效的轨道引用: {0}")]
    InvalidTrackReference(i32),

    #[error("命令 {command} 在状态 {state:?} 下不被接受")]
    CommandRejectedInState {
        command: &'static str,
        state: PlayerState,
    },

    /// 仅用于诊断，不会中断播放
    #[error("事件队列溢出，已丢弃 {0} 个事件")]
    QueueOverflow(u64),

    /// 仅用于诊断：引擎未在超时内确认销毁，资源已强制释放
    #[error("引擎销毁超时（{0}ms），已强制释放资源")]
    TeardownTimeout(u64),

    #[error("参数无效: {0}")]
    InvalidArgument(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg 错误: {0}")]
    FFmpeg(#[from] ffmpeg_next::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// 错误种类（可序列化，供状态快照与通知使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    OpenFailed,
    EngineUnavailable,
    InvalidTrackReference,
    CommandRejectedInState,
    QueueOverflow,
    TeardownTimeout,
    InvalidArgument,
    Config,
    Io,
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::OpenFailed(_) => ErrorKind::OpenFailed,
            BridgeError::EngineUnavailable(_) => ErrorKind::EngineUnavailable,
            BridgeError::InvalidTrackReference(_) => ErrorKind::InvalidTrackReference,
            BridgeError::CommandRejectedInState { .. } => ErrorKind::CommandRejectedInState,
            BridgeError::QueueOverflow(_) => ErrorKind::QueueOverflow,
            BridgeError::TeardownTimeout(_) => ErrorKind::TeardownTimeout,
            BridgeError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BridgeError::Config(_) | BridgeError::Json(_) => ErrorKind::Config,
            BridgeError::Io(_) => ErrorKind::Io,
            #[cfg(feature = "ffmpeg")]
            BridgeError::FFmpeg(_) => ErrorKind::EngineUnavailable,
        }
    }

    pub(crate) fn rejected(command: &'static str, state: PlayerState) -> Self {
        BridgeError::CommandRejectedInState { command, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            BridgeError::OpenFailed("x".into()).kind(),
            ErrorKind::OpenFailed
        );
        assert_eq!(
            BridgeError::rejected("seek", PlayerState::Closed).kind(),
            ErrorKind::CommandRejectedInState
        );
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert_eq!(BridgeError::from(json_err).kind(), ErrorKind::Config);
    }

    #[test]
    fn rejected_message_names_command_and_state() {
        let msg = BridgeError::rejected("pause", PlayerState::Ended).to_string();
        assert!(msg.contains("pause"));
        assert!(msg.contains("Ended"));
    }
}
