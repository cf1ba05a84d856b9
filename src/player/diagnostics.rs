//! 桥接层诊断计数器
//!
//! 所有计数器都是原子量，可以在引擎回调线程上无锁递增；
//! 宿主通过 `snapshot()` 拿到一份可序列化的快照。

use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Diagnostics {
    events_dispatched: AtomicU64,
    queue_overflows: AtomicU64,
    video_frames_delivered: AtomicU64,
    video_frames_dropped: AtomicU64,
    audio_chunks_delivered: AtomicU64,
    audio_underruns: AtomicU64,
    samples_without_sink: AtomicU64,
    format_mismatches: AtomicU64,
    commands_discarded: AtomicU64,
    teardown_timeouts: AtomicU64,
}

/// 计数器快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub events_dispatched: u64,
    pub queue_overflows: u64,
    pub video_frames_delivered: u64,
    pub video_frames_dropped: u64,
    pub audio_chunks_delivered: u64,
    pub audio_underruns: u64,
    pub samples_without_sink: u64,
    pub format_mismatches: u64,
    pub commands_discarded: u64,
    pub teardown_timeouts: u64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        #[inline]
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_event_dispatched, events_dispatched);
    counter!(record_queue_overflow, queue_overflows);
    counter!(record_video_delivered, video_frames_delivered);
    counter!(record_video_dropped, video_frames_dropped);
    counter!(record_audio_delivered, audio_chunks_delivered);
    counter!(record_audio_underrun, audio_underruns);
    counter!(record_sample_without_sink, samples_without_sink);
    counter!(record_format_mismatch, format_mismatches);
    counter!(record_command_discarded, commands_discarded);
    counter!(record_teardown_timeout, teardown_timeouts);

    pub fn queue_overflows(&self) -> u64 {
        self.queue_overflows.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            video_frames_delivered: self.video_frames_delivered.load(Ordering::Relaxed),
            video_frames_dropped: self.video_frames_dropped.load(Ordering::Relaxed),
            audio_chunks_delivered: self.audio_chunks_delivered.load(Ordering::Relaxed),
            audio_underruns: self.audio_underruns.load(Ordering::Relaxed),
            samples_without_sink: self.samples_without_sink.load(Ordering::Relaxed),
            format_mismatches: self.format_mismatches.load(Ordering::Relaxed),
            commands_discarded: self.commands_discarded.load(Ordering::Relaxed),
            teardown_timeouts: self.teardown_timeouts.load(Ordering::Relaxed),
        }
    }
}

impl DiagnosticsSnapshot {
    /// 渲染成宿主统计面板使用的多行文本
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Bridge");
        let _ = writeln!(out, "    Events dispatched: {}", self.events_dispatched);
        let _ = writeln!(out, "    Queue overflows: {}", self.queue_overflows);
        let _ = writeln!(out, "    Commands discarded: {}", self.commands_discarded);
        let _ = writeln!(out, "    Teardown timeouts: {}", self.teardown_timeouts);
        let _ = writeln!(out);
        let _ = writeln!(out, "Video");
        let _ = writeln!(out, "    Frames delivered: {}", self.video_frames_delivered);
        let _ = writeln!(out, "    Frames dropped: {}", self.video_frames_dropped);
        let _ = writeln!(out);
        let _ = writeln!(out, "Audio");
        let _ = writeln!(out, "    Chunks delivered: {}", self.audio_chunks_delivered);
        let _ = writeln!(out, "    Underruns: {}", self.audio_underruns);
        let _ = writeln!(out);
        let _ = writeln!(out, "Samples");
        let _ = writeln!(out, "    Without sink: {}", self.samples_without_sink);
        let _ = writeln!(out, "    Format mismatches: {}", self.format_mismatches);
        out
    }
}
