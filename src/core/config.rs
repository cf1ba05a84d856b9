//! 桥接层配置
//!
//! 所有策略阈值（事件队列容量、音频背压超时、销毁超时等）都从这里读取，
//! 不在代码中写死。配置文件为 JSON，缺省字段使用默认值。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::error::{BridgeError, Result};
use crate::core::types::CachingClass;

/// 原生引擎日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineLogLevel {
    Error,
    Warning,
    Debug,
}

impl EngineLogLevel {
    pub fn as_filter(&self) -> log::LevelFilter {
        match self {
            EngineLogLevel::Error => log::LevelFilter::Error,
            EngineLogLevel::Warning => log::LevelFilter::Warn,
            EngineLogLevel::Debug => log::LevelFilter::Debug,
        }
    }
}

/// 传给原生引擎全局上下文的选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// 本地文件缓存时长（毫秒）
    pub file_caching_ms: u64,
    /// 网络资源缓存时长（毫秒）
    pub network_caching_ms: u64,
    /// 光盘介质缓存时长（毫秒）
    pub disc_caching_ms: u64,
    /// 摄像头、麦克风等采集设备缓存时长（毫秒）
    pub live_caching_ms: u64,
    pub log_level: EngineLogLevel,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            file_caching_ms: 300,
            network_caching_ms: 1000,
            disc_caching_ms: 300,
            live_caching_ms: 300,
            log_level: EngineLogLevel::Warning,
        }
    }
}

impl EngineOptions {
    pub fn caching_for(&self, class: CachingClass) -> Duration {
        let ms = match class {
            CachingClass::File => self.file_caching_ms,
            CachingClass::Network => self.network_caching_ms,
            CachingClass::Disc => self.disc_caching_ms,
            CachingClass::Live => self.live_caching_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// 事件队列容量（超出后按丢弃策略处理）
    pub event_queue_capacity: usize,
    /// 音频背压时阻塞原生回调线程的最长时间（毫秒）
    pub audio_backpressure_timeout_ms: u64,
    /// close() 等待引擎确认销毁的最长时间（毫秒）
    pub teardown_timeout_ms: u64,
    /// 过渡状态下最多挂起的命令数
    pub max_pending_commands: usize,
    /// open 后自动播放
    pub autoplay: bool,
    /// 播放结束后从头循环
    pub looping: bool,
    /// 允许的最大播放速率
    pub max_rate: f32,
    pub engine: EngineOptions,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 256,
            audio_backpressure_timeout_ms: 20,
            teardown_timeout_ms: 3000,
            max_pending_commands: 16,
            autoplay: true,
            looping: false,
            max_rate: 10.0,
            engine: EngineOptions::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_queue_capacity == 0 {
            return Err(BridgeError::Config("event_queue_capacity 必须大于 0".to_string()));
        }
        if self.teardown_timeout_ms == 0 {
            return Err(BridgeError::Config("teardown_timeout_ms 必须大于 0".to_string()));
        }
        if self.max_pending_commands == 0 {
            return Err(BridgeError::Config("max_pending_commands 必须大于 0".to_string()));
        }
        if !(self.max_rate.is_finite() && self.max_rate > 0.0) {
            return Err(BridgeError::Config(format!("max_rate 无效: {}", self.max_rate)));
        }
        Ok(())
    }

    pub fn audio_backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_backpressure_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}
