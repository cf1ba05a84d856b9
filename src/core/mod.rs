// 核心数据结构和类型定义

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use types::*;

use std::process;
use std::thread;

/// 日志上下文前缀：区分宿主控制线程与引擎回调线程
pub(crate) fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}
