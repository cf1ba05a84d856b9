//! 轨道协商
//!
//! 保存引擎最近一次发布的轨道列表，并把宿主的选择绑定到输出。
//! 某类型还没有绑定输出时，选择只记为挂起，绑定输出后再生效。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::core::{BridgeError, Result, SampleKind, TrackDescriptor, TrackId, TrackKind};

/// 一次选择的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// 需要下发给引擎（None 表示禁用该类型）
    Apply { kind: TrackKind, id: Option<TrackId> },
    /// 对应输出尚未绑定，已记为挂起
    Pending { kind: TrackKind, id: TrackId },
    /// 与当前选择相同
    Unchanged,
}

/// 轨道类型对应的输出类型（文本由引擎叠加进视频输出）
pub fn sink_kind_for(kind: TrackKind) -> SampleKind {
    match kind {
        TrackKind::Audio => SampleKind::Audio,
        TrackKind::Video | TrackKind::Text => SampleKind::Video,
    }
}

#[derive(Debug, Default)]
pub struct TrackNegotiator {
    tracks: Vec<TrackDescriptor>,
    generation: u64,
    selected: BTreeMap<TrackKind, TrackId>,
    pending: BTreeMap<TrackKind, TrackId>,
    /// 宿主显式禁用的类型，不再沿用默认轨道
    disabled: BTreeSet<TrackKind>,
}

impl TrackNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发布新的轨道列表，旧列表立即失效；返回新的列表代数
    pub fn publish(&mut self, tracks: Vec<TrackDescriptor>) -> u64 {
        let contains = |id: &TrackId, kind: &TrackKind| {
            tracks.iter().any(|t| t.id == *id && t.kind == *kind)
        };
        self.selected.retain(|kind, id| contains(&*id, kind));
        self.pending.retain(|kind, id| contains(&*id, kind));

        // 没有显式选择的类型沿用引擎的默认轨道
        for track in tracks.iter().filter(|t| t.flags.default) {
            if !self.pending.contains_key(&track.kind) && !self.disabled.contains(&track.kind) {
                self.selected.entry(track.kind).or_insert(track.id);
            }
        }

        self.tracks = tracks;
        self.generation += 1;
        self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn all(&self) -> &[TrackDescriptor] {
        &self.tracks
    }

    /// 某类型的轨道，保持引擎给出的顺序
    pub fn list(&self, kind: TrackKind) -> Vec<TrackDescriptor> {
        self.tracks.iter().filter(|t| t.kind == kind).cloned().collect()
    }

    pub fn find(&self, id: TrackId) -> Option<&TrackDescriptor> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// 选择轨道；id 必须属于最近一次发布的列表
    pub fn select(&mut self, id: TrackId, sink_bound: impl Fn(SampleKind) -> bool) -> Result<Selection> {
        let kind = self
            .find(id)
            .map(|t| t.kind)
            .ok_or(BridgeError::InvalidTrackReference(id))?;

        if !sink_bound(sink_kind_for(kind)) {
            self.pending.insert(kind, id);
            return Ok(Selection::Pending { kind, id });
        }

        self.pending.remove(&kind);
        self.disabled.remove(&kind);
        if self.selected.get(&kind) == Some(&id) {
            return Ok(Selection::Unchanged);
        }
        self.selected.insert(kind, id);
        Ok(Selection::Apply { kind, id: Some(id) })
    }

    pub fn deselect(&mut self, kind: TrackKind) -> Selection {
        self.disabled.insert(kind);
        let had_pending = self.pending.remove(&kind).is_some();
        match self.selected.remove(&kind) {
            Some(_) => Selection::Apply { kind, id: None },
            None if had_pending => Selection::Unchanged,
            None => Selection::Apply { kind, id: None },
        }
    }

    /// 输出绑定后，把对应的挂起选择转为生效
    pub fn on_sink_bound(&mut self, sink: SampleKind) -> Vec<Selection> {
        let ready: Vec<TrackKind> = self
            .pending
            .keys()
            .copied()
            .filter(|kind| sink_kind_for(*kind) == sink)
            .collect();

        let mut applied = Vec::new();
        for kind in ready {
            if let Some(id) = self.pending.remove(&kind) {
                self.disabled.remove(&kind);
                self.selected.insert(kind, id);
                applied.push(Selection::Apply { kind, id: Some(id) });
            }
        }
        applied
    }

    pub fn selected(&self) -> &BTreeMap<TrackKind, TrackId> {
        &self.selected
    }

    pub fn pending(&self) -> &BTreeMap<TrackKind, TrackId> {
        &self.pending
    }

    /// 宿主信息面板使用的轨道描述
    pub fn info(&self) -> String {
        let mut out = String::new();
        for kind in [TrackKind::Audio, TrackKind::Video, TrackKind::Text] {
            for (index, track) in self.tracks.iter().filter(|t| t.kind == kind).enumerate() {
                let _ = writeln!(out, "Stream {}", track.id);
                let _ = writeln!(out, "    Type: {}", kind.as_str());
                let _ = writeln!(out, "    Codec: {}", track.codec);
                let _ = writeln!(out, "    Name: {}", track.display_name(index));
                if let Some(lang) = &track.language {
                    let _ = writeln!(out, "    Language: {}", lang);
                }
                if self.selected.get(&kind) == Some(&track.id) {
                    let _ = writeln!(out, "    Selected");
                }
                let _ = writeln!(out);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TrackFlags;

    fn track(id: TrackId, kind: TrackKind, default: bool) -> TrackDescriptor {
        TrackDescriptor {
            id,
            kind,
            codec: "test".into(),
            name: String::new(),
            language: Some("en".into()),
            flags: TrackFlags {
                default,
                forced: false,
            },
        }
    }

    fn sample_list() -> Vec<TrackDescriptor> {
        vec![
            track(0, TrackKind::Video, true),
            track(1, TrackKind::Audio, true),
            track(2, TrackKind::Audio, false),
            track(3, TrackKind::Text, false),
        ]
    }

    #[test]
    fn unknown_ids_are_rejected_for_every_kind() {
        let mut negotiator = TrackNegotiator::new();
        negotiator.publish(sample_list());
        for id in [4, 99, -1] {
            let err = negotiator.select(id, |_| true).unwrap_err();
            assert!(matches!(err, BridgeError::InvalidTrackReference(bad) if bad == id));
        }
    }

    #[test]
    fn stale_ids_fail_after_republish() {
        let mut negotiator = TrackNegotiator::new();
        negotiator.publish(sample_list());
        assert_eq!(
            negotiator.select(2, |_| true).unwrap(),
            Selection::Apply { kind: TrackKind::Audio, id: Some(2) }
        );

        let generation = negotiator.publish(vec![track(10, TrackKind::Video, true), track(11, TrackKind::Audio, true)]);
        assert_eq!(generation, 2);
        for id in [0, 1, 2, 3] {
            assert!(negotiator.select(id, |_| true).is_err());
        }
        // 旧选择失效后沿用新的默认轨道
        assert_eq!(negotiator.selected().get(&TrackKind::Audio), Some(&11));
    }

    #[test]
    fn selection_without_sink_is_pending_until_bound() {
        let mut negotiator = TrackNegotiator::new();
        negotiator.publish(sample_list());

        let selection = negotiator.select(3, |kind| kind == SampleKind::Audio).unwrap();
        assert_eq!(selection, Selection::Pending { kind: TrackKind::Text, id: 3 });
        assert_eq!(negotiator.pending().get(&TrackKind::Text), Some(&3));

        assert!(negotiator.on_sink_bound(SampleKind::Audio).is_empty());
        let applied = negotiator.on_sink_bound(SampleKind::Video);
        assert_eq!(applied, vec![Selection::Apply { kind: TrackKind::Text, id: Some(3) }]);
        assert!(negotiator.pending().is_empty());
    }

    #[test]
    fn list_keeps_engine_order_and_info_names_streams() {
        let mut negotiator = TrackNegotiator::new();
        negotiator.publish(sample_list());
        let audio: Vec<_> = negotiator.list(TrackKind::Audio).iter().map(|t| t.id).collect();
        assert_eq!(audio, vec![1, 2]);

        let info = negotiator.info();
        assert!(info.contains("Audio Track 1"));
        assert!(info.contains("Caption Track 0"));
    }

    #[test]
    fn deselect_emits_disable() {
        let mut negotiator = TrackNegotiator::new();
        negotiator.publish(sample_list());
        assert_eq!(
            negotiator.deselect(TrackKind::Audio),
            Selection::Apply { kind: TrackKind::Audio, id: None }
        );
        assert!(negotiator.selected().get(&TrackKind::Audio).is_none());
    }

    #[test]
    fn disabled_kind_ignores_later_defaults() {
        let mut negotiator = TrackNegotiator::new();
        // 列表到达之前禁用
        negotiator.deselect(TrackKind::Audio);
        negotiator.publish(sample_list());
        assert!(negotiator.selected().get(&TrackKind::Audio).is_none());
        assert_eq!(negotiator.selected().get(&TrackKind::Video), Some(&0));

        negotiator.select(2, |_| true).unwrap();
        negotiator.publish(sample_list());
        assert_eq!(negotiator.selected().get(&TrackKind::Audio), Some(&2));
    }
}
