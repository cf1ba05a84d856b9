use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 播放时钟 - 在引擎两次位置上报之间推算当前位置
#[derive(Clone)]
pub struct PlaybackClock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    base_pts: i64,              // 基准 PTS（毫秒）
    base_instant: Instant,      // 基准时刻
    playback_rate: f64,         // 播放速率（1.0 = 正常）
    paused: bool,
    paused_at: i64,             // 暂停时的位置
}

impl ClockInner {
    fn now(&self) -> i64 {
        if self.paused {
            self.paused_at
        } else {
            let elapsed = self.base_instant.elapsed().as_millis() as i64;
            self.base_pts + (elapsed as f64 * self.playback_rate) as i64
        }
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                base_pts: 0,
                base_instant: Instant::now(),
                playback_rate: 1.0,
                paused: true,
                paused_at: 0,
            })),
        }
    }

    /// 获取当前播放时间（毫秒）
    pub fn now_ms(&self) -> i64 {
        self.inner.lock().now()
    }

    pub fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms().max(0) as u64)
    }

    /// 设置播放位置
    pub fn set_time(&self, position: Duration) {
        let pts = position.as_millis() as i64;
        let mut inner = self.inner.lock();
        inner.base_pts = pts;
        inner.base_instant = Instant::now();
        inner.paused_at = pts;
    }

    /// 开始走时
    pub fn play(&self) {
        let mut inner = self.inner.lock();
        if inner.paused {
            inner.base_pts = inner.paused_at;
            inner.base_instant = Instant::now();
            inner.paused = false;
        }
    }

    /// 冻结时钟
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            inner.paused_at = inner.now();
            inner.paused = true;
        }
    }

    /// 设置播放速率
    pub fn set_rate(&self, rate: f64) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            let current_time = inner.now();
            inner.base_pts = current_time;
            inner.base_instant = Instant::now();
        }
        inner.playback_rate = rate;
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().playback_rate
    }

    /// 是否暂停
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// 重置到 0 并暂停
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.base_pts = 0;
        inner.paused_at = 0;
        inner.base_instant = Instant::now();
        inner.paused = true;
        inner.playback_rate = 1.0;
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}
