use log::{debug, info, warn};
use parking_lot::Mutex;
use std::io::{Read, Seek};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{
    log_ctx, BridgeConfig, BridgeError, Control, MediaSource, PlayerState, PlayerStateSnapshot,
    Result, SampleKind, SessionHandle, SessionId, TrackDescriptor, TrackId, TrackKind,
};
use crate::engine::{
    EngineCallbacks, EngineCommand, EngineContext, EngineHandle, MediaStream, NativeEngine,
};
use crate::player::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::player::events::{BridgeEvent, EventQueue};
use crate::player::sinks::{AudioSink, SampleDelivery, VideoSink};
use crate::player::state_machine::{
    supported_rates, BridgeNotification, Effects, PlaybackSession,
};

pub type SubscriptionId = u64;

type Subscriber = Arc<dyn Fn(&BridgeNotification) + Send + Sync>;

struct ActiveSession {
    session: PlaybackSession,
    queue: Arc<EventQueue>,
}

struct Core {
    active: Option<ActiveSession>,
    /// 新会话继承的循环设置
    looping: bool,
}

/// 宿主使用的播放桥接器
///
/// 锁的划分：
/// - `core`：会话状态，只在一次迁移期间持有，持有期间从不调用引擎
/// - `engine`：引擎句柄，串行化所有原生调用
///
/// 需要同时使用时总是先拿 `engine` 再拿 `core`。一次迁移和它产生的引擎命令
/// 在同一次 `engine` 锁内完成，引擎收到命令的顺序与迁移顺序一致。
/// 订阅者回调在所有锁释放后、在调用方线程上执行。
pub struct MediaBridge {
    config: BridgeConfig,
    context: Arc<EngineContext>,
    core: Mutex<Core>,
    engine: Mutex<Option<EngineHandle>>,
    delivery: Arc<SampleDelivery>,
    diagnostics: Arc<Diagnostics>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
}

impl MediaBridge {
    pub fn new(engine: Arc<dyn NativeEngine>, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let context = EngineContext::init(engine, config.engine.clone())?;
        Self::with_context(context, config)
    }

    /// 多个桥接器共享同一个引擎上下文
    pub fn with_context(context: Arc<EngineContext>, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "{} 🎮 创建播放桥接器 (引擎 {}, 事件队列 {})",
            log_ctx(),
            context.engine_name(),
            config.event_queue_capacity
        );

        let diagnostics = Arc::new(Diagnostics::new());
        let delivery = Arc::new(SampleDelivery::new(
            config.audio_backpressure_timeout(),
            diagnostics.clone(),
        ));

        Ok(Self {
            core: Mutex::new(Core {
                active: None,
                looping: config.looping,
            }),
            config,
            context,
            engine: Mutex::new(None),
            delivery,
            diagnostics,
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn engine_name(&self) -> &str {
        self.context.engine_name()
    }

    /// 打开媒体源；已有会话时先 stop 再关闭它
    ///
    /// 只有定位符为空时同步失败。引擎侧的打开失败会让新会话进入 Error
    /// （last_error 为 OpenFailed），而不是从这里返回错误。
    pub fn open(&self, locator: &str) -> Result<SessionHandle> {
        let source = MediaSource::from_locator(locator)?;
        self.open_input(source, None)
    }

    /// 从宿主提供的字节流打开，`original_locator` 是流的原始地址
    ///
    /// 引擎通过读取/定位回调取数据；不支持字节流的引擎让会话以 OpenFailed 进入 Error。
    pub fn open_reader(
        &self,
        reader: impl Read + Seek + Send + 'static,
        original_locator: &str,
    ) -> Result<SessionHandle> {
        let source = MediaSource::from_locator(original_locator)?;
        self.open_input(source, Some(Box::new(reader)))
    }

    fn open_input(&self, source: MediaSource, stream: Option<Box<dyn MediaStream>>) -> Result<SessionHandle> {
        let id = SessionId::next();
        let queue = Arc::new(EventQueue::new(
            self.config.event_queue_capacity,
            self.diagnostics.clone(),
        ));
        let mut fx = Effects::default();

        // 隐式关闭与新会话的创建在同一次 engine 锁内完成
        let mut engine = self.engine.lock();
        if let Err(e) = self.close_locked(&mut engine, None, &mut fx) {
            warn!("{} ⚠️ 关闭上一个会话时出错: {}", log_ctx(), e);
        }

        let begun = {
            let mut core = self.core.lock();
            let mut session = PlaybackSession::new(id, source.locator(), &self.config);
            session.set_looping(core.looping);
            let begun = session.begin_open(self.config.autoplay, &mut fx);
            if begun.is_ok() {
                core.active = Some(ActiveSession {
                    session,
                    queue: queue.clone(),
                });
            }
            begun
        };
        if let Err(e) = begun {
            drop(engine);
            self.settle(fx);
            return Err(e);
        }

        let callbacks = EngineCallbacks::new(id, queue.clone(), self.delivery.clone());
        let timeout = self.config.teardown_timeout();
        let opened = match stream {
            Some(stream) => EngineHandle::open_stream(
                &self.context,
                stream,
                &source,
                callbacks,
                timeout,
                self.diagnostics.clone(),
            ),
            None => EngineHandle::open(&self.context, &source, callbacks, timeout, self.diagnostics.clone()),
        };
        match opened {
            Ok(handle) => *engine = Some(handle),
            Err(e) => {
                warn!("{} ❌ [{}] 引擎拒绝打开 {}: {}", log_ctx(), id, source.locator(), e);
                let mut core = self.core.lock();
                if let Some(active) = core.active.as_mut().filter(|a| a.session.id() == id) {
                    active.session.fail_open(e.to_string(), &mut fx);
                }
            }
        }

        self.dispatch(&mut engine, id, &queue, &mut fx);
        drop(engine);
        self.settle(fx);
        Ok(id)
    }

    /// 关闭指定会话；句柄已失效时是空操作
    ///
    /// 阻塞到引擎确认销毁，最多 teardown_timeout。超时返回
    /// `TeardownTimeout`，此时会话同样已经关闭。
    pub fn close(&self, handle: SessionHandle) -> Result<()> {
        self.close_active(Some(handle))
    }

    /// 关闭当前会话（如果有）
    pub fn close_current(&self) -> Result<()> {
        self.close_active(None)
    }

    fn close_active(&self, expected: Option<SessionId>) -> Result<()> {
        let mut fx = Effects::default();
        let result = {
            let mut engine = self.engine.lock();
            self.close_locked(&mut engine, expected, &mut fx)
        };
        self.settle(fx);
        result
    }

    /// 在已持有 engine 锁的前提下关闭会话并销毁引擎实例
    fn close_locked(
        &self,
        engine: &mut Option<EngineHandle>,
        expected: Option<SessionId>,
        fx: &mut Effects,
    ) -> Result<()> {
        let (id, queue) = {
            let mut core = self.core.lock();
            let Some(active) = core.active.as_mut() else {
                return Ok(());
            };
            let id = active.session.id();
            if expected.is_some_and(|wanted| wanted != id) {
                debug!("{} {:?} 已不是当前会话，忽略 close", log_ctx(), expected);
                return Ok(());
            }
            active.session.begin_close(fx);
            let queue = active.queue.clone();
            core.active = None;
            (id, queue)
        };

        info!("{} 🛑 [{}] 关闭会话", log_ctx(), id);
        if let Some(handle) = engine.as_mut().filter(|h| h.session() == id) {
            for command in fx.commands.drain(..) {
                if let Err(e) = handle.issue_command(command) {
                    debug!("{} [{}] 关闭前的 stop 未执行: {}", log_ctx(), id, e);
                }
            }
        }
        let result = match engine.take() {
            Some(mut handle) if handle.session() == id => handle.close(),
            other => {
                *engine = other;
                Ok(())
            }
        };
        queue.clear();
        result
    }

    /// 在当前会话上执行一次迁移
    ///
    /// engine 锁覆盖迁移和命令下发，多个控制线程的命令按迁移顺序到达引擎。
    fn with_session<T>(
        &self,
        command: &'static str,
        f: impl FnOnce(&mut PlaybackSession, &mut Effects) -> Result<T>,
    ) -> Result<T> {
        let mut engine = self.engine.lock();
        let mut fx = Effects::default();
        let (value, id, queue) = {
            let mut core = self.core.lock();
            let active = core
                .active
                .as_mut()
                .ok_or_else(|| BridgeError::rejected(command, PlayerState::Closed))?;
            let value = f(&mut active.session, &mut fx)?;
            (value, active.session.id(), active.queue.clone())
        };
        self.dispatch(&mut engine, id, &queue, &mut fx);
        drop(engine);
        self.settle(fx);
        Ok(value)
    }

    /// 下发引擎命令（调用方持有 engine 锁，core 锁已释放）
    fn dispatch(
        &self,
        engine: &mut Option<EngineHandle>,
        session: SessionId,
        queue: &EventQueue,
        fx: &mut Effects,
    ) {
        if fx.commands.is_empty() && !fx.query_tracks {
            return;
        }
        let Some(handle) = engine.as_mut().filter(|h| h.session() == session) else {
            debug!("{} [{}] 没有可用的引擎实例，跳过命令", log_ctx(), session);
            fx.commands.clear();
            return;
        };

        for command in fx.commands.drain(..) {
            match handle.issue_command(command) {
                Ok(()) => {}
                // 致命错误事件已在队列里
                Err(BridgeError::EngineUnavailable(msg)) => {
                    debug!("{} [{}] 引擎不可用: {}", log_ctx(), session, msg)
                }
                // 引擎命令失败一律异步上报
                Err(e) => {
                    warn!("{} ❌ [{}] 引擎命令失败: {}", log_ctx(), session, e);
                    queue.push(BridgeEvent::Error {
                        code: -1,
                        message: e.to_string(),
                    });
                }
            }
        }

        if fx.query_tracks {
            match handle.tracks() {
                Ok(tracks) if !tracks.is_empty() => {
                    debug!("{} [{}] 主动查询到 {} 条轨道", log_ctx(), session, tracks.len());
                    queue.push(BridgeEvent::TrackListChanged(tracks));
                }
                Ok(_) => {}
                Err(e) => debug!("{} [{}] 轨道查询失败: {}", log_ctx(), session, e),
            }
        }
    }

    /// 所有锁释放后：计数并通知订阅者
    fn settle(&self, fx: Effects) {
        for _ in 0..fx.discarded {
            self.diagnostics.record_command_discarded();
        }
        self.notify(&fx.notifications);
    }

    fn notify(&self, notifications: &[BridgeNotification]) {
        if notifications.is_empty() {
            return;
        }
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        for notification in notifications {
            for subscriber in &subscribers {
                (subscriber.as_ref())(notification);
            }
        }
    }

    /// 处理队列中的引擎事件并返回最新快照（宿主每帧调用一次）
    pub fn poll(&self) -> PlayerStateSnapshot {
        let mut fx = Effects::default();
        let mut engine = self.engine.lock();
        let dispatched = {
            let mut core = self.core.lock();
            match core.active.as_mut() {
                Some(active) => {
                    for event in active.queue.drain() {
                        self.diagnostics.record_event_dispatched();
                        active.session.handle_event(event, &mut fx);
                    }
                    fx.query_tracks = active.session.take_track_query();
                    Some((active.session.id(), active.queue.clone()))
                }
                None => None,
            }
        };

        if let Some((id, queue)) = dispatched {
            self.dispatch(&mut engine, id, &queue, &mut fx);
        }
        drop(engine);
        self.settle(fx);
        self.get_state()
    }

    /// 当前状态的不可变快照
    pub fn get_state(&self) -> PlayerStateSnapshot {
        let core = self.core.lock();
        match &core.active {
            Some(active) => active.session.snapshot(),
            None => {
                let mut snapshot = PlayerStateSnapshot::closed();
                snapshot.looping = core.looping;
                snapshot
            }
        }
    }

    pub fn state(&self) -> PlayerState {
        self.core
            .lock()
            .active
            .as_ref()
            .map_or(PlayerState::Closed, |a| a.session.state())
    }

    pub fn play(&self) -> Result<()> {
        self.with_session("play", |s, fx| s.command(EngineCommand::Play, fx)).map(|_| ())
    }

    pub fn pause(&self) -> Result<()> {
        self.with_session("pause", |s, fx| s.command(EngineCommand::Pause, fx)).map(|_| ())
    }

    pub fn stop(&self) -> Result<()> {
        self.with_session("stop", |s, fx| s.command(EngineCommand::Stop, fx)).map(|_| ())
    }

    pub fn seek(&self, position: Duration) -> Result<()> {
        self.with_session("seek", |s, fx| s.command(EngineCommand::Seek(position), fx))
            .map(|_| ())
    }

    /// 设置播放速率；0 等同暂停，暂停中设置正速率会恢复播放
    pub fn set_rate(&self, rate: f32) -> Result<()> {
        self.with_session("set_rate", |s, fx| s.command(EngineCommand::SetRate(rate), fx))
            .map(|_| ())
    }

    pub fn set_looping(&self, looping: bool) {
        let mut core = self.core.lock();
        core.looping = looping;
        if let Some(active) = core.active.as_mut() {
            active.session.set_looping(looping);
        }
    }

    pub fn is_looping(&self) -> bool {
        self.core.lock().looping
    }

    pub fn list_tracks(&self, kind: TrackKind) -> Vec<TrackDescriptor> {
        self.core
            .lock()
            .active
            .as_ref()
            .map(|a| a.session.tracks().list(kind))
            .unwrap_or_default()
    }

    /// 选择轨道；对应输出未绑定时记为挂起
    pub fn select_track(&self, id: TrackId) -> Result<()> {
        if self.state() == PlayerState::Closed {
            return Err(BridgeError::InvalidTrackReference(id));
        }
        let delivery = self.delivery.clone();
        self.with_session("select_track", move |s, fx| {
            s.select_track(id, |kind| delivery.has_sink(kind), fx)
        })
        .map(|_| ())
    }

    pub fn deselect_track(&self, kind: TrackKind) -> Result<()> {
        self.with_session("deselect_track", |s, fx| s.deselect_track(kind, fx))
            .map(|_| ())
    }

    /// 绑定（或以 None 解绑）视频输出
    pub fn bind_video_sink(&self, sink: Option<Arc<VideoSink>>) {
        let bound = sink.is_some();
        if let Some(sink) = &sink {
            info!("{} 🖼️ 绑定视频输出: {:?}", log_ctx(), sink.format());
        }
        self.delivery.bind_video(sink);
        if bound {
            self.apply_pending_selections(SampleKind::Video);
        }
    }

    pub fn bind_audio_sink(&self, sink: Option<Arc<AudioSink>>) {
        let bound = sink.is_some();
        if let Some(sink) = &sink {
            info!("{} 🔊 绑定音频输出: {:?}", log_ctx(), sink.format());
        }
        self.delivery.bind_audio(sink);
        if bound {
            self.apply_pending_selections(SampleKind::Audio);
        }
    }

    fn apply_pending_selections(&self, kind: SampleKind) {
        if self.state() == PlayerState::Closed {
            return;
        }
        if let Err(e) = self.with_session("bind_sink", |s, fx| {
            s.on_sink_bound(kind, fx);
            Ok(())
        }) {
            debug!("{} {:?} 输出绑定后没有可应用的轨道选择: {}", log_ctx(), kind, e);
        }
    }

    pub fn can_control(&self, control: Control) -> bool {
        self.core
            .lock()
            .active
            .as_ref()
            .is_some_and(|a| a.session.can_control(control))
    }

    pub fn supported_rates(&self, thinned: bool) -> RangeInclusive<f32> {
        supported_rates(self.config.max_rate, thinned)
    }

    pub fn subscribe(&self, callback: impl Fn(&BridgeNotification) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let subscriber: Subscriber = Arc::new(callback);
        self.subscribers.lock().push((id, subscriber));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// 轨道信息文本
    pub fn info(&self) -> String {
        let core = self.core.lock();
        match &core.active {
            Some(active) => {
                let snapshot = active.session.snapshot();
                let mut out = format!("Source: {}\n", snapshot.locator.unwrap_or_default());
                if let Some(duration) = snapshot.duration {
                    out.push_str(&format!("Duration: {:.3}s\n", duration.as_secs_f64()));
                }
                out.push('\n');
                out.push_str(&active.session.tracks().info());
                out
            }
            None => String::new(),
        }
    }

    /// 诊断统计文本
    pub fn stats(&self) -> String {
        self.diagnostics.snapshot().render()
    }
}

impl Drop for MediaBridge {
    fn drop(&mut self) {
        if let Err(e) = self.close_active(None) {
            warn!("{} ⚠️ 销毁桥接器时关闭会话出错: {}", log_ctx(), e);
        }
        info!("{} ✅ 播放桥接器已销毁", log_ctx());
    }
}
