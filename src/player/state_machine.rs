//! 播放状态机
//!
//! `PlaybackSession` 是会话状态的唯一写入者。这里只做纯粹的状态迁移：
//! 每次迁移把需要下发给引擎的命令和需要通知宿主的消息收集进 `Effects`，
//! 由调用方在释放锁之后再执行，因此持锁期间永远不会调用原生引擎。
//!
//! 迁移表：
//! ```text
//! Closed --open--> Opening --[opened]--> Buffering --[buffered]--> Playing
//! Playing --pause--> Paused --play--> Playing
//! {Playing, Paused, Buffering} --stop--> Stopped
//! {Playing, Buffering} --[end-of-stream]--> Ended
//! 任意状态 --[fatal error]--> Error
//! {Stopped, Ended, Error} --close--> Closed
//! ```

use log::{debug, info};
use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::core::{
    log_ctx, BridgeConfig, BridgeError, Control, ErrorKind, LastError, MediaInfo, PlaybackClock,
    PlayerState, PlayerStateSnapshot, Result, SampleKind, SessionId, TrackId, TrackKind,
};
use crate::engine::{EngineCommand, EngineState};
use crate::player::events::BridgeEvent;
use crate::player::tracks::{Selection, TrackNegotiator};

/// 推送给订阅者的通知
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeNotification {
    StateChanged {
        session: SessionId,
        from: PlayerState,
        to: PlayerState,
    },
    TracksChanged {
        session: SessionId,
        generation: u64,
    },
    DurationChanged {
        session: SessionId,
        duration: Duration,
    },
    EndReached {
        session: SessionId,
    },
    Error {
        session: SessionId,
        kind: ErrorKind,
        code: i32,
        message: String,
    },
    /// 挂起的命令没有机会执行就被丢弃
    CommandDiscarded {
        session: SessionId,
        command: &'static str,
        reason: String,
    },
}

/// 一次迁移产生的副作用，在锁外执行
#[derive(Debug, Default)]
pub struct Effects {
    pub commands: Vec<EngineCommand>,
    pub notifications: Vec<BridgeNotification>,
    pub discarded: u64,
    /// 向引擎查询轨道列表
    pub query_tracks: bool,
}

/// 命令的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// 当前处于过渡状态，命令已挂起
    Deferred,
    /// 已经处于目标状态
    Unchanged,
}

pub struct PlaybackSession {
    id: SessionId,
    locator: String,
    state: PlayerState,
    duration: Option<Duration>,
    position: Duration,
    rate: f32,
    looping: bool,
    media_info: Option<MediaInfo>,
    last_error: Option<LastError>,
    tracks: TrackNegotiator,
    clock: PlaybackClock,
    pending: VecDeque<EngineCommand>,
    max_pending: usize,
    max_rate: f32,
    replaying: bool,
    /// 宿主 play/pause 已生效，等待引擎回报的同名状态
    echoes: VecDeque<PlayerState>,
    /// 已打开但还没收到轨道列表
    awaiting_tracks: bool,
}

impl PlaybackSession {
    pub fn new(id: SessionId, locator: impl Into<String>, config: &BridgeConfig) -> Self {
        Self {
            id,
            locator: locator.into(),
            state: PlayerState::Closed,
            duration: None,
            position: Duration::ZERO,
            rate: 1.0,
            looping: config.looping,
            media_info: None,
            last_error: None,
            tracks: TrackNegotiator::new(),
            clock: PlaybackClock::new(),
            pending: VecDeque::with_capacity(config.max_pending_commands),
            max_pending: config.max_pending_commands,
            max_rate: config.max_rate,
            replaying: false,
            echoes: VecDeque::new(),
            awaiting_tracks: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn tracks(&self) -> &TrackNegotiator {
        &self.tracks
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 当前位置：两次上报之间按时钟推算，并钳制在时长以内
    pub fn position(&self) -> Duration {
        let now = self.clock.now();
        match self.duration {
            Some(duration) => now.min(duration),
            None => now,
        }
    }

    pub fn snapshot(&self) -> PlayerStateSnapshot {
        PlayerStateSnapshot {
            session: Some(self.id),
            locator: Some(self.locator.clone()),
            state: self.state,
            duration: self.duration,
            position: self.position(),
            rate: self.rate,
            looping: self.looping,
            selected_tracks: self.tracks.selected().clone(),
            pending_tracks: self.tracks.pending().clone(),
            track_generation: self.tracks.generation(),
            media_info: self.media_info.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn transition(&mut self, to: PlayerState, fx: &mut Effects) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!("{} 🔄 [{}] {:?} -> {:?}", log_ctx(), self.id, from, to);

        if to == PlayerState::Playing {
            self.clock.play();
        } else {
            self.clock.pause();
        }

        fx.notifications.push(BridgeNotification::StateChanged {
            session: self.id,
            from,
            to,
        });

        // seek 引起的 Buffering 不影响尚未回报的 play/pause
        if to.discards_pending() {
            self.echoes.clear();
            self.discard_pending(&format!("会话进入 {:?}", to), fx);
        } else if to.is_stable() {
            self.replay_pending(fx);
        }
    }

    fn discard_pending(&mut self, reason: &str, fx: &mut Effects) {
        for command in self.pending.drain(..) {
            debug!("{} 🗑️ [{}] 丢弃挂起命令 {}: {}", log_ctx(), self.id, command.name(), reason);
            fx.discarded += 1;
            fx.notifications.push(BridgeNotification::CommandDiscarded {
                session: self.id,
                command: command.name(),
                reason: reason.to_string(),
            });
        }
    }

    /// 进入稳定状态时按原顺序重放挂起命令，仍不适用的继续挂起
    fn replay_pending(&mut self, fx: &mut Effects) {
        if self.replaying || self.pending.is_empty() {
            return;
        }
        self.replaying = true;

        let queued = std::mem::take(&mut self.pending);
        for command in queued {
            if self.state.discards_pending() {
                fx.discarded += 1;
                fx.notifications.push(BridgeNotification::CommandDiscarded {
                    session: self.id,
                    command: command.name(),
                    reason: format!("会话进入 {:?}", self.state),
                });
                continue;
            }
            let name = command.name();
            if let Err(e) = self.apply(command, fx) {
                fx.discarded += 1;
                fx.notifications.push(BridgeNotification::CommandDiscarded {
                    session: self.id,
                    command: name,
                    reason: e.to_string(),
                });
            }
        }

        self.replaying = false;
    }

    fn defer(&mut self, command: EngineCommand) -> Result<Outcome> {
        if self.pending.len() >= self.max_pending {
            return Err(BridgeError::rejected(command.name(), self.state));
        }
        debug!("{} ⏳ [{}] 挂起命令 {:?} (状态 {:?})", log_ctx(), self.id, command, self.state);
        self.pending.push_back(command);
        Ok(Outcome::Deferred)
    }

    // ===== 宿主命令 =====

    /// Closed -> Opening
    pub fn begin_open(&mut self, autoplay: bool, fx: &mut Effects) -> Result<()> {
        if self.state != PlayerState::Closed {
            return Err(BridgeError::rejected("open", self.state));
        }
        self.transition(PlayerState::Opening, fx);
        if autoplay {
            self.defer(EngineCommand::Play)?;
        }
        Ok(())
    }

    /// 同步打开失败（引擎拒绝创建实例）
    pub fn fail_open(&mut self, message: String, fx: &mut Effects) {
        self.record_error(ErrorKind::OpenFailed, -1, message, fx);
    }

    pub fn command(&mut self, command: EngineCommand, fx: &mut Effects) -> Result<Outcome> {
        if let EngineCommand::SetRate(rate) = command {
            self.validate_rate(rate)?;
        }
        self.apply(command, fx)
    }

    fn apply(&mut self, command: EngineCommand, fx: &mut Effects) -> Result<Outcome> {
        use PlayerState::*;

        match command {
            EngineCommand::Play => match self.state {
                Paused => {
                    fx.commands.push(EngineCommand::Play);
                    self.transition(Playing, fx);
                    self.echoes.push_back(Playing);
                    Ok(Outcome::Applied)
                }
                Buffering => {
                    fx.commands.push(EngineCommand::Play);
                    Ok(Outcome::Applied)
                }
                Playing => Ok(Outcome::Unchanged),
                Opening => self.defer(command),
                state => Err(BridgeError::rejected("play", state)),
            },
            EngineCommand::Pause => match self.state {
                Playing => {
                    fx.commands.push(EngineCommand::Pause);
                    self.transition(Paused, fx);
                    self.echoes.push_back(Paused);
                    Ok(Outcome::Applied)
                }
                Opening | Buffering => self.defer(command),
                Paused => Ok(Outcome::Unchanged),
                state => Err(BridgeError::rejected("pause", state)),
            },
            EngineCommand::Stop => match self.state {
                Playing | Paused | Buffering => {
                    fx.commands.push(EngineCommand::Stop);
                    self.position = Duration::ZERO;
                    self.clock.set_time(Duration::ZERO);
                    self.transition(Stopped, fx);
                    Ok(Outcome::Applied)
                }
                Opening => self.defer(command),
                Stopped => Ok(Outcome::Unchanged),
                state => Err(BridgeError::rejected("stop", state)),
            },
            EngineCommand::Seek(target) => match self.state {
                Playing | Paused | Buffering => {
                    if self.media_info.as_ref().is_some_and(|info| !info.seekable) {
                        return Err(BridgeError::InvalidArgument("当前媒体不支持 seek".to_string()));
                    }
                    let target = match self.duration {
                        Some(duration) => target.min(duration),
                        None => target,
                    };
                    self.position = target;
                    self.clock.set_time(target);
                    fx.commands.push(EngineCommand::Seek(target));
                    Ok(Outcome::Applied)
                }
                Opening => self.defer(command),
                state => Err(BridgeError::rejected("seek", state)),
            },
            EngineCommand::SetRate(rate) if rate == 0.0 => {
                // 速率 0 等同暂停
                match self.state {
                    Playing | Paused | Buffering | Opening => self.apply(EngineCommand::Pause, fx),
                    state => Err(BridgeError::rejected("set_rate", state)),
                }
            }
            EngineCommand::SetRate(rate) => match self.state {
                Playing | Buffering => {
                    self.set_rate_now(rate, fx);
                    Ok(Outcome::Applied)
                }
                Paused => {
                    self.set_rate_now(rate, fx);
                    self.apply(EngineCommand::Play, fx)
                }
                Opening => self.defer(command),
                state => Err(BridgeError::rejected("set_rate", state)),
            },
            EngineCommand::SelectTrack { .. } => match self.state {
                Closed | Error => Err(BridgeError::rejected("select_track", self.state)),
                _ => {
                    fx.commands.push(command);
                    Ok(Outcome::Applied)
                }
            },
        }
    }

    fn set_rate_now(&mut self, rate: f32, fx: &mut Effects) {
        self.rate = rate;
        self.clock.set_rate(rate as f64);
        fx.commands.push(EngineCommand::SetRate(rate));
    }

    fn validate_rate(&self, rate: f32) -> Result<()> {
        if !rate.is_finite() || rate < 0.0 || rate > self.max_rate {
            return Err(BridgeError::InvalidArgument(format!(
                "播放速率 {} 不在 0..={} 范围内",
                rate, self.max_rate
            )));
        }
        Ok(())
    }

    pub fn select_track(
        &mut self,
        id: TrackId,
        sink_bound: impl Fn(SampleKind) -> bool,
        fx: &mut Effects,
    ) -> Result<Selection> {
        if matches!(self.state, PlayerState::Closed | PlayerState::Error) {
            return Err(BridgeError::rejected("select_track", self.state));
        }
        let selection = self.tracks.select(id, sink_bound)?;
        if let Selection::Apply { kind, id } = selection {
            self.apply(EngineCommand::SelectTrack { kind, id }, fx)?;
        }
        Ok(selection)
    }

    pub fn deselect_track(&mut self, kind: TrackKind, fx: &mut Effects) -> Result<Selection> {
        if matches!(self.state, PlayerState::Closed | PlayerState::Error) {
            return Err(BridgeError::rejected("deselect_track", self.state));
        }
        let selection = self.tracks.deselect(kind);
        if let Selection::Apply { kind, id } = selection {
            self.apply(EngineCommand::SelectTrack { kind, id }, fx)?;
        }
        Ok(selection)
    }

    /// 宿主绑定了输出：挂起的轨道选择在这里生效
    pub fn on_sink_bound(&mut self, sink: SampleKind, fx: &mut Effects) {
        if matches!(self.state, PlayerState::Closed | PlayerState::Error) {
            return;
        }
        for selection in self.tracks.on_sink_bound(sink) {
            if let Selection::Apply { kind, id } = selection {
                fx.commands.push(EngineCommand::SelectTrack { kind, id });
            }
        }
    }

    /// 关闭：活动状态先隐式 stop，然后进入 Closed
    pub fn begin_close(&mut self, fx: &mut Effects) {
        use PlayerState::*;
        match self.state {
            Playing | Paused | Buffering => {
                fx.commands.push(EngineCommand::Stop);
                self.transition(Stopped, fx);
                self.transition(Closed, fx);
            }
            Closed => {}
            _ => self.transition(Closed, fx),
        }
    }

    // ===== 引擎事件 =====

    pub fn handle_event(&mut self, event: BridgeEvent, fx: &mut Effects) {
        use PlayerState::*;

        if self.state == Closed {
            return;
        }

        match event {
            BridgeEvent::StateChanged(engine_state) if self.take_echo(&engine_state) => {
                debug!("{} [{}] 引擎确认 {:?}", log_ctx(), self.id, engine_state);
            }
            BridgeEvent::StateChanged(engine_state) => match (engine_state, self.state) {
                (EngineState::Opened(info), state) => {
                    if let Some(duration) = info.duration {
                        self.set_duration(duration, fx);
                    }
                    self.media_info = Some(info);
                    self.awaiting_tracks = self.tracks.generation() == 0;
                    if state == Opening {
                        self.transition(Buffering, fx);
                    }
                }
                (EngineState::Buffering, Opening | Playing) => self.transition(Buffering, fx),
                (EngineState::Playing, Buffering) => self.transition(Playing, fx),
                (EngineState::Paused, Playing) => self.transition(Paused, fx),
                (EngineState::Stopped, Playing | Paused | Buffering) => {
                    self.transition(Stopped, fx)
                }
                (engine_state, state) => {
                    debug!(
                        "{} [{}] 忽略引擎状态 {:?} (当前 {:?})",
                        log_ctx(),
                        self.id,
                        engine_state,
                        state
                    );
                }
            },
            BridgeEvent::TrackListChanged(list) => {
                self.awaiting_tracks = false;
                let generation = self.tracks.publish(list);
                fx.notifications.push(BridgeNotification::TracksChanged {
                    session: self.id,
                    generation,
                });
            }
            BridgeEvent::EndReached => {
                if !matches!(self.state, Playing | Buffering) {
                    return;
                }
                fx.notifications.push(BridgeNotification::EndReached { session: self.id });
                if self.looping {
                    info!("{} 🔁 [{}] 循环播放，回到开头", log_ctx(), self.id);
                    self.position = Duration::ZERO;
                    self.clock.set_time(Duration::ZERO);
                    fx.commands.push(EngineCommand::Seek(Duration::ZERO));
                    fx.commands.push(EngineCommand::Play);
                } else {
                    if let Some(duration) = self.duration {
                        self.position = duration;
                        self.clock.set_time(duration);
                    }
                    self.transition(Ended, fx);
                }
            }
            BridgeEvent::Error { code, message } => {
                let kind = if self.state == Opening {
                    ErrorKind::OpenFailed
                } else {
                    ErrorKind::EngineUnavailable
                };
                self.record_error(kind, code, message, fx);
            }
            BridgeEvent::PositionChanged(position) => {
                let position = match self.duration {
                    Some(duration) => position.min(duration),
                    None => position,
                };
                self.position = position;
                self.clock.set_time(position);
            }
            BridgeEvent::DurationChanged(duration) => self.set_duration(duration, fx),
        }
    }

    /// 一批事件处理完后仍没有轨道列表时，改为主动向引擎查询（只查一次）
    pub fn take_track_query(&mut self) -> bool {
        std::mem::take(&mut self.awaiting_tracks)
    }

    /// 引擎对宿主 play/pause 的回报不再触发迁移
    fn take_echo(&mut self, engine_state: &EngineState) -> bool {
        let echoed = match engine_state {
            EngineState::Playing => PlayerState::Playing,
            EngineState::Paused => PlayerState::Paused,
            _ => return false,
        };
        if self.echoes.front() != Some(&echoed) {
            return false;
        }
        self.echoes.pop_front();
        // 缓冲中收到的回报同时结束缓冲，仍按迁移表处理
        self.state != PlayerState::Buffering
    }

    fn set_duration(&mut self, duration: Duration, fx: &mut Effects) {
        if self.duration == Some(duration) {
            return;
        }
        self.duration = Some(duration);
        fx.notifications.push(BridgeNotification::DurationChanged {
            session: self.id,
            duration,
        });
    }

    fn record_error(&mut self, kind: ErrorKind, code: i32, message: String, fx: &mut Effects) {
        self.last_error = Some(LastError {
            kind,
            code,
            message: message.clone(),
        });
        fx.notifications.push(BridgeNotification::Error {
            session: self.id,
            kind,
            code,
            message,
        });
        self.transition(PlayerState::Error, fx);
    }

    // ===== 能力查询 =====

    pub fn can_control(&self, control: Control) -> bool {
        use PlayerState::*;
        let info = self.media_info.as_ref();
        match control {
            Control::Pause => self.state == Playing && info.map_or(true, |i| i.pausable),
            Control::Resume => self.state == Paused,
            Control::Seek | Control::Scrub => {
                matches!(self.state, Playing | Paused | Buffering) && info.map_or(false, |i| i.seekable)
            }
        }
    }

    pub fn supported_rates(&self, thinned: bool) -> RangeInclusive<f32> {
        supported_rates(self.max_rate, thinned)
    }
}

/// 抽帧播放（thinned）支持到 max_rate，逐帧播放只支持到 1 倍速
pub fn supported_rates(max_rate: f32, thinned: bool) -> RangeInclusive<f32> {
    if thinned {
        0.0..=max_rate
    } else {
        0.0..=1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TrackDescriptor, TrackFlags};

    fn session() -> PlaybackSession {
        PlaybackSession::new(SessionId::next(), "synthetic://clip", &BridgeConfig::default())
    }

    fn info(seekable: bool) -> MediaInfo {
        MediaInfo {
            duration: Some(Duration::from_secs(10)),
            seekable,
            pausable: true,
            ..MediaInfo::default()
        }
    }

    fn opened(s: &mut PlaybackSession, autoplay: bool) -> Effects {
        let mut fx = Effects::default();
        s.begin_open(autoplay, &mut fx).unwrap();
        s.handle_event(BridgeEvent::StateChanged(EngineState::Opened(info(true))), &mut fx);
        fx
    }

    fn playing(s: &mut PlaybackSession) -> Effects {
        let mut fx = opened(s, true);
        s.handle_event(BridgeEvent::StateChanged(EngineState::Playing), &mut fx);
        fx
    }

    fn states(fx: &Effects) -> Vec<PlayerState> {
        fx.notifications
            .iter()
            .filter_map(|n| match n {
                BridgeNotification::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn open_reaches_playing_through_buffering() {
        let mut s = session();
        let fx = playing(&mut s);
        assert_eq!(
            states(&fx),
            vec![PlayerState::Opening, PlayerState::Buffering, PlayerState::Playing]
        );
        // 自动播放在 Buffering 时下发
        assert_eq!(fx.commands, vec![EngineCommand::Play]);
        assert_eq!(s.snapshot().duration, Some(Duration::from_secs(10)));
    }

    #[test]
    fn play_while_opening_is_queued() {
        let mut s = session();
        let mut fx = Effects::default();
        s.begin_open(false, &mut fx).unwrap();

        assert_eq!(s.command(EngineCommand::Play, &mut fx).unwrap(), Outcome::Deferred);
        assert!(fx.commands.is_empty());

        s.handle_event(BridgeEvent::StateChanged(EngineState::Opened(info(true))), &mut fx);
        assert_eq!(s.state(), PlayerState::Buffering);
        assert_eq!(fx.commands, vec![EngineCommand::Play]);
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn pause_during_buffering_waits_for_playing() {
        let mut s = session();
        let mut fx = opened(&mut s, false);
        assert_eq!(s.command(EngineCommand::Pause, &mut fx).unwrap(), Outcome::Deferred);
        s.command(EngineCommand::Play, &mut fx).unwrap();
        s.handle_event(BridgeEvent::StateChanged(EngineState::Playing), &mut fx);
        assert_eq!(s.state(), PlayerState::Paused);
    }

    #[test]
    fn late_engine_echoes_do_not_undo_host_commands() {
        let mut s = session();
        let mut fx = playing(&mut s);

        // 宿主在两次 poll 之间 pause 又 play
        s.command(EngineCommand::Pause, &mut fx).unwrap();
        s.command(EngineCommand::Play, &mut fx).unwrap();
        assert_eq!(s.state(), PlayerState::Playing);

        let mut fx = Effects::default();
        s.handle_event(BridgeEvent::StateChanged(EngineState::Paused), &mut fx);
        s.handle_event(BridgeEvent::StateChanged(EngineState::Playing), &mut fx);
        assert_eq!(s.state(), PlayerState::Playing);
        assert!(states(&fx).is_empty());

        // 引擎自发的暂停仍然生效
        s.handle_event(BridgeEvent::StateChanged(EngineState::Paused), &mut fx);
        assert_eq!(s.state(), PlayerState::Paused);
    }

    #[test]
    fn echoes_survive_the_buffering_of_an_own_seek() {
        let engine_orders = [
            // 引擎先完成 seek 的缓冲，再处理 pause/play
            vec![EngineState::Buffering, EngineState::Playing, EngineState::Paused, EngineState::Playing],
            // 引擎在缓冲期间处理 pause，play 同时结束缓冲
            vec![EngineState::Buffering, EngineState::Paused, EngineState::Playing],
        ];

        for reports in engine_orders {
            let mut s = session();
            let mut fx = playing(&mut s);
            s.command(EngineCommand::Seek(Duration::from_secs(2)), &mut fx).unwrap();
            s.command(EngineCommand::Pause, &mut fx).unwrap();
            s.command(EngineCommand::Play, &mut fx).unwrap();

            for report in reports {
                s.handle_event(BridgeEvent::StateChanged(report), &mut fx);
            }
            assert_eq!(s.state(), PlayerState::Playing);
        }
    }

    #[test]
    fn opened_without_track_list_asks_for_a_query() {
        let mut s = session();
        opened(&mut s, false);
        assert!(s.take_track_query());
        assert!(!s.take_track_query());

        let mut s = session();
        let mut fx = opened(&mut s, false);
        s.handle_event(BridgeEvent::TrackListChanged(Vec::new()), &mut fx);
        assert!(!s.take_track_query());
    }

    #[test]
    fn pending_commands_discarded_on_error() {
        let mut s = session();
        let mut fx = Effects::default();
        s.begin_open(true, &mut fx).unwrap();
        s.command(EngineCommand::Seek(Duration::from_secs(3)), &mut fx).unwrap();

        s.handle_event(
            BridgeEvent::Error {
                code: 404,
                message: "unreachable".into(),
            },
            &mut fx,
        );

        assert_eq!(s.state(), PlayerState::Error);
        assert_eq!(fx.discarded, 2);
        let last = s.snapshot().last_error.unwrap();
        assert_eq!(last.kind, ErrorKind::OpenFailed);
        assert_eq!(last.code, 404);
    }

    #[test]
    fn commands_rejected_in_terminal_states() {
        let mut s = session();
        let mut fx = playing(&mut s);
        s.handle_event(BridgeEvent::EndReached, &mut fx);
        assert_eq!(s.state(), PlayerState::Ended);

        for cmd in [EngineCommand::Play, EngineCommand::Pause, EngineCommand::Stop] {
            let err = s.command(cmd, &mut fx).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CommandRejectedInState);
        }
    }

    #[test]
    fn seek_clamps_to_duration() {
        let mut s = session();
        let mut fx = playing(&mut s);
        s.command(EngineCommand::Seek(Duration::from_secs(60)), &mut fx).unwrap();
        assert_eq!(fx.commands.last(), Some(&EngineCommand::Seek(Duration::from_secs(10))));
        assert!(s.position() <= Duration::from_secs(10));
    }

    #[test]
    fn rate_zero_pauses_and_positive_rate_resumes() {
        let mut s = session();
        let mut fx = playing(&mut s);
        s.command(EngineCommand::SetRate(0.0), &mut fx).unwrap();
        assert_eq!(s.state(), PlayerState::Paused);
        s.command(EngineCommand::SetRate(2.0), &mut fx).unwrap();
        assert_eq!(s.state(), PlayerState::Playing);
        assert_eq!(s.snapshot().rate, 2.0);

        for bad in [f32::NAN, -1.0, 11.0] {
            let err = s.command(EngineCommand::SetRate(bad), &mut fx).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
    }

    #[test]
    fn looping_restarts_instead_of_ending() {
        let mut s = session();
        s.set_looping(true);
        let mut fx = playing(&mut s);
        fx.commands.clear();

        s.handle_event(BridgeEvent::EndReached, &mut fx);
        assert_eq!(s.state(), PlayerState::Playing);
        assert_eq!(fx.commands, vec![EngineCommand::Seek(Duration::ZERO), EngineCommand::Play]);
        assert!(fx
            .notifications
            .iter()
            .any(|n| matches!(n, BridgeNotification::EndReached { .. })));
    }

    #[test]
    fn close_from_playing_stops_first() {
        let mut s = session();
        let mut fx = playing(&mut s);
        fx.notifications.clear();
        s.begin_close(&mut fx);
        assert_eq!(states(&fx), vec![PlayerState::Stopped, PlayerState::Closed]);

        let mut s = session();
        let mut fx = Effects::default();
        s.begin_open(true, &mut fx).unwrap();
        fx.notifications.clear();
        s.begin_close(&mut fx);
        assert_eq!(states(&fx), vec![PlayerState::Closed]);
        assert_eq!(fx.discarded, 1);
    }

    #[test]
    fn every_command_sequence_stays_in_known_states() {
        // 简单的确定性伪随机序列
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..50 {
            let mut s = session();
            let mut fx = Effects::default();
            s.begin_open(next() % 2 == 0, &mut fx).unwrap();
            for _ in 0..40 {
                match next() % 10 {
                    0 => drop(s.command(EngineCommand::Play, &mut fx)),
                    1 => drop(s.command(EngineCommand::Pause, &mut fx)),
                    2 => drop(s.command(EngineCommand::Stop, &mut fx)),
                    3 => drop(s.command(EngineCommand::Seek(Duration::from_secs(2)), &mut fx)),
                    4 => s.handle_event(BridgeEvent::StateChanged(EngineState::Opened(info(true))), &mut fx),
                    5 => s.handle_event(BridgeEvent::StateChanged(EngineState::Playing), &mut fx),
                    6 => s.handle_event(BridgeEvent::StateChanged(EngineState::Buffering), &mut fx),
                    7 => s.handle_event(BridgeEvent::EndReached, &mut fx),
                    8 => drop(s.command(EngineCommand::SetRate(0.5), &mut fx)),
                    _ => s.handle_event(
                        BridgeEvent::PositionChanged(Duration::from_millis(next() % 20_000)),
                        &mut fx,
                    ),
                }
                assert!(PlayerState::ALL.contains(&s.state()));
                if let Some(duration) = s.snapshot().duration {
                    assert!(s.position() <= duration);
                }
            }
            // 从未出现 Closed -> Playing 的直接跳转
            for n in &fx.notifications {
                if let BridgeNotification::StateChanged { from, to, .. } = n {
                    assert!(!(*from == PlayerState::Closed && *to == PlayerState::Playing));
                }
            }
        }
    }

    #[test]
    fn track_selection_forwards_to_engine() {
        let mut s = session();
        let mut fx = playing(&mut s);
        s.handle_event(
            BridgeEvent::TrackListChanged(vec![TrackDescriptor {
                id: 7,
                kind: TrackKind::Audio,
                codec: "aac".into(),
                name: String::new(),
                language: None,
                flags: TrackFlags::default(),
            }]),
            &mut fx,
        );
        fx.commands.clear();

        let selection = s.select_track(7, |_| true, &mut fx).unwrap();
        assert_eq!(selection, Selection::Apply { kind: TrackKind::Audio, id: Some(7) });
        assert_eq!(
            fx.commands,
            vec![EngineCommand::SelectTrack { kind: TrackKind::Audio, id: Some(7) }]
        );
        assert!(matches!(
            s.select_track(8, |_| true, &mut fx),
            Err(BridgeError::InvalidTrackReference(8))
        ));
    }
}
