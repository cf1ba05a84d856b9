use crossbeam_channel::RecvTimeoutError;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{log_ctx, BridgeError, EngineOptions, MediaSource, Result, SessionId, TrackDescriptor};
use crate::engine::{
    EngineCallbacks, EngineCommand, EngineInstance, MediaStream, NativeEngine, TeardownSignal,
};
use crate::player::diagnostics::Diagnostics;

/// 原生引擎的进程级上下文
///
/// 显式持有而不是全局变量：创建时初始化引擎，最后一个引用释放时关闭引擎。
/// 每个 `EngineHandle` 都持有一份 `Arc<EngineContext>`，
/// 因此上下文一定晚于所有实例销毁。
pub struct EngineContext {
    engine: Arc<dyn NativeEngine>,
    options: EngineOptions,
    live_instances: AtomicUsize,
}

impl EngineContext {
    pub fn init(engine: Arc<dyn NativeEngine>, options: EngineOptions) -> Result<Arc<Self>> {
        info!(
            "{} 🚀 初始化原生引擎: {} (日志级别 {:?})",
            log_ctx(),
            engine.name(),
            options.log_level
        );
        engine.initialize(&options)?;

        Ok(Arc::new(Self {
            engine,
            options,
            live_instances: AtomicUsize::new(0),
        }))
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// 尚未释放的实例数
    pub fn live_instances(&self) -> usize {
        self.live_instances.load(Ordering::Acquire)
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        info!("{} 🛑 关闭原生引擎: {}", log_ctx(), self.engine.name());
        self.engine.shutdown();
    }
}

/// 一个引擎实例的句柄，保证恰好一次销毁
pub struct EngineHandle {
    context: Arc<EngineContext>,
    session: SessionId,
    instance: Option<Box<dyn EngineInstance>>,
    callbacks: EngineCallbacks,
    teardown_timeout: Duration,
    diagnostics: Arc<Diagnostics>,
}

impl EngineHandle {
    /// 创建实例并开始异步打开；同步失败统一映射为 OpenFailed
    pub fn open(
        context: &Arc<EngineContext>,
        source: &MediaSource,
        callbacks: EngineCallbacks,
        teardown_timeout: Duration,
        diagnostics: Arc<Diagnostics>,
    ) -> Result<Self> {
        info!(
            "{} 📂 [{}] 打开媒体: {} (缓存 {:?})",
            log_ctx(),
            callbacks.session(),
            source.locator(),
            context.options.caching_for(source.caching_class())
        );
        let instance = context.engine.create_instance(source, callbacks.clone());
        Self::adopt(context, instance, callbacks, teardown_timeout, diagnostics)
    }

    /// 以宿主字节流为输入创建实例，`source` 为流的原始地址
    pub fn open_stream(
        context: &Arc<EngineContext>,
        stream: Box<dyn MediaStream>,
        source: &MediaSource,
        callbacks: EngineCallbacks,
        teardown_timeout: Duration,
        diagnostics: Arc<Diagnostics>,
    ) -> Result<Self> {
        info!(
            "{} 📂 [{}] 打开字节流: {}",
            log_ctx(),
            callbacks.session(),
            source.locator()
        );
        let instance = context
            .engine
            .create_stream_instance(stream, source, callbacks.clone());
        Self::adopt(context, instance, callbacks, teardown_timeout, diagnostics)
    }

    fn adopt(
        context: &Arc<EngineContext>,
        instance: Result<Box<dyn EngineInstance>>,
        callbacks: EngineCallbacks,
        teardown_timeout: Duration,
        diagnostics: Arc<Diagnostics>,
    ) -> Result<Self> {
        let instance = instance.map_err(|e| match e {
            BridgeError::OpenFailed(msg) => BridgeError::OpenFailed(msg),
            other => BridgeError::OpenFailed(other.to_string()),
        })?;

        context.live_instances.fetch_add(1, Ordering::AcqRel);

        Ok(Self {
            context: Arc::clone(context),
            session: callbacks.session(),
            instance: Some(instance),
            callbacks,
            teardown_timeout,
            diagnostics,
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn is_released(&self) -> bool {
        self.instance.is_none()
    }

    /// 下发命令；致命错误之后不会再碰原生实例
    pub fn issue_command(&mut self, command: EngineCommand) -> Result<()> {
        if self.callbacks.is_fatal() {
            return Err(BridgeError::EngineUnavailable(format!(
                "{} 已报告致命错误，拒绝 {}",
                self.session,
                command.name()
            )));
        }
        let instance = self.instance.as_mut().ok_or_else(|| {
            BridgeError::EngineUnavailable(format!("{} 已释放", self.session))
        })?;

        debug!("{} ▶️ [{}] 引擎命令: {:?}", log_ctx(), self.session, command);
        instance.command(command)
    }

    pub fn tracks(&self) -> Result<Vec<TrackDescriptor>> {
        if self.callbacks.is_fatal() {
            return Err(BridgeError::EngineUnavailable(self.session.to_string()));
        }
        match &self.instance {
            Some(instance) => Ok(instance.tracks()),
            None => Err(BridgeError::EngineUnavailable(format!("{} 已释放", self.session))),
        }
    }

    /// 释放实例并等待引擎确认，最多等待 teardown_timeout
    ///
    /// 重复调用是空操作。致命错误之后仍会执行这唯一一次释放。
    /// 超时后回调已解绑，引擎线程即便继续运行也不会再触达宿主。
    pub fn close(&mut self) -> Result<()> {
        let Some(instance) = self.instance.take() else {
            return Ok(());
        };

        self.callbacks.detach();
        let (signal, confirmed) = TeardownSignal::channel();
        let started = Instant::now();
        instance.release(signal);
        self.context.live_instances.fetch_sub(1, Ordering::AcqRel);

        match confirmed.recv_timeout(self.teardown_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!(
                    "{} 🧹 [{}] 引擎实例已销毁 ({}ms)",
                    log_ctx(),
                    self.session,
                    started.elapsed().as_millis()
                );
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                self.diagnostics.record_teardown_timeout();
                let ms = self.teardown_timeout.as_millis() as u64;
                error!(
                    "{} ⏱️ [{}] 引擎销毁超时 {}ms，强制释放",
                    log_ctx(),
                    self.session,
                    ms
                );
                Err(BridgeError::TeardownTimeout(ms))
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.instance.is_some() {
            warn!("{} ⚠️ [{}] 句柄未显式关闭，自动释放", log_ctx(), self.session);
            let _ = self.close();
        }
    }
}
