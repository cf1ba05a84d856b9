//! 事件桥
//!
//! 引擎在自己的线程上触发回调，回调只做一件事：构造 `BridgeEvent` 并压入
//! 有界的多生产者/单消费者队列。状态机在宿主线程 `poll()` 时统一取出处理，
//! 回调里永远不会回调引擎，也不会拿状态机的锁。

use log::{debug, log_enabled, warn, Level};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{log_ctx, AudioFormat, SampleBuffer, SessionId, TrackDescriptor, VideoFormat};
use crate::engine::EngineState;
use crate::player::diagnostics::Diagnostics;
use crate::player::sinks::{DeliveryOutcome, SampleDelivery};

/// 引擎回调转换出的事件，按接收顺序被状态机消费且仅消费一次
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    StateChanged(EngineState),
    TrackListChanged(Vec<TrackDescriptor>),
    EndReached,
    Error { code: i32, message: String },
    PositionChanged(Duration),
    DurationChanged(Duration),
}

impl BridgeEvent {
    /// Error 与 EndReached 永不丢弃
    pub fn is_critical(&self) -> bool {
        matches!(self, BridgeEvent::Error { .. } | BridgeEvent::EndReached)
    }

    pub fn is_position(&self) -> bool {
        matches!(self, BridgeEvent::PositionChanged(_))
    }
}

/// 有界事件队列
///
/// 队列满时只丢位置事件：
/// 1. 队列里有 PositionChanged 时丢最早的一个
/// 2. 否则新到的 PositionChanged 本身被丢弃
/// 3. 其它事件超额接纳，状态迁移与错误不会丢失
pub struct EventQueue {
    events: Mutex<VecDeque<BridgeEvent>>,
    capacity: usize,
    diagnostics: Arc<Diagnostics>,
}

impl EventQueue {
    pub fn new(capacity: usize, diagnostics: Arc<Diagnostics>) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            diagnostics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// 压入一个事件；返回 false 表示有事件被丢弃（可能是新事件本身）
    pub fn push(&self, event: BridgeEvent) -> bool {
        let mut events = self.events.lock();
        if events.len() < self.capacity {
            events.push_back(event);
            return true;
        }

        if let Some(index) = events.iter().position(BridgeEvent::is_position) {
            events.remove(index);
            events.push_back(event);
        } else if event.is_position() {
            // 新的位置事件直接丢弃
        } else {
            events.push_back(event);
            if log_enabled!(Level::Debug) {
                debug!("{} 事件队列超额: {}/{}", log_ctx(), events.len(), self.capacity);
            }
            return true;
        }
        drop(events);

        self.diagnostics.record_queue_overflow();
        false
    }

    /// 按顺序取出全部事件
    pub fn drain(&self) -> Vec<BridgeEvent> {
        let mut events = self.events.lock();
        events.drain(..).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// 交给引擎实例的回调集合
///
/// 可以克隆到引擎的任意线程。会话关闭后 `detach()`，之后所有回调都是空操作。
#[derive(Clone)]
pub struct EngineCallbacks {
    session: SessionId,
    queue: Arc<EventQueue>,
    delivery: Arc<SampleDelivery>,
    attached: Arc<AtomicBool>,
    fatal: Arc<AtomicBool>,
}

impl EngineCallbacks {
    pub(crate) fn new(session: SessionId, queue: Arc<EventQueue>, delivery: Arc<SampleDelivery>) -> Self {
        Self {
            session,
            queue,
            delivery,
            attached: Arc::new(AtomicBool::new(true)),
            fatal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// 引擎是否已报告致命错误
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    fn push(&self, event: BridgeEvent) {
        if !self.is_attached() {
            return;
        }
        if log_enabled!(Level::Debug) && !event.is_position() {
            debug!("{} 📨 [{}] 引擎事件: {:?}", log_ctx(), self.session, event);
        }
        if !self.queue.push(event) && log_enabled!(Level::Debug) {
            debug!("{} ⚠️ [{}] 事件队列已满", log_ctx(), self.session);
        }
    }

    pub fn on_state_changed(&self, state: EngineState) {
        self.push(BridgeEvent::StateChanged(state));
    }

    pub fn on_tracks_changed(&self, tracks: Vec<TrackDescriptor>) {
        self.push(BridgeEvent::TrackListChanged(tracks));
    }

    pub fn on_end_reached(&self) {
        self.push(BridgeEvent::EndReached);
    }

    /// 致命错误：之后对该实例的命令全部返回 EngineUnavailable
    pub fn on_error(&self, code: i32, message: impl Into<String>) {
        let message = message.into();
        if self.is_attached() {
            warn!("{} ❌ [{}] 引擎错误 {}: {}", log_ctx(), self.session, code, message);
        }
        self.fatal.store(true, Ordering::Release);
        self.push(BridgeEvent::Error { code, message });
    }

    pub fn on_position_changed(&self, position: Duration) {
        self.push(BridgeEvent::PositionChanged(position));
    }

    pub fn on_duration_changed(&self, duration: Duration) {
        self.push(BridgeEvent::DurationChanged(duration));
    }

    pub fn on_video_frame(&self, sample: &SampleBuffer<'_>) -> DeliveryOutcome {
        if !self.is_attached() {
            return DeliveryOutcome::Detached;
        }
        self.delivery.deliver(sample)
    }

    pub fn on_audio_samples(&self, sample: &SampleBuffer<'_>) -> DeliveryOutcome {
        if !self.is_attached() {
            return DeliveryOutcome::Detached;
        }
        self.delivery.deliver(sample)
    }

    /// 宿主绑定的视频格式，引擎据此直接按宿主格式渲染
    pub fn video_format(&self) -> Option<VideoFormat> {
        self.delivery.video_format()
    }

    pub fn audio_format(&self) -> Option<AudioFormat> {
        self.delivery.audio_format()
    }
}
