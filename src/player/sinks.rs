//! 解码帧投递路径
//!
//! 引擎的渲染回调每次交付一个 `SampleBuffer`，负载只在回调期间有效，
//! 这里必须在回调返回前把它拷贝进宿主持有的缓冲区：
//! - 视频：单槽位，新帧覆盖未消费的旧帧（时效优先）
//! - 音频：固定槽位的环形缓冲，满时阻塞回调线程至多一个超时，超时即丢弃并记一次欠载

use log::{debug, log_enabled, trace, Level};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{
    log_ctx, AudioFormat, SampleBuffer, SampleFormatDescriptor, SampleKind, VideoFormat,
};
use crate::player::diagnostics::Diagnostics;

/// 一次投递的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// 宿主还没消费上一帧，旧帧被覆盖
    ReplacedStale,
    /// 音频背压超时，本块被丢弃
    DroppedTimeout,
    /// 该类型没有绑定输出
    NoSink,
    FormatMismatch,
    /// 会话已关闭，回调已失效
    Detached,
}

/// 宿主读到的视频帧
#[derive(Debug, Clone, Default)]
pub struct VideoFrame {
    pub pts: Duration,
    pub duration: Duration,
    /// 按宿主格式（含行跨度）排列的像素数据
    pub data: Vec<u8>,
}

struct VideoSlots {
    latest: VideoFrame,
    fresh: bool,
    written: u64,
}

/// 视频输出：只保留最新一帧
pub struct VideoSink {
    format: VideoFormat,
    slots: Mutex<VideoSlots>,
    front: Mutex<VideoFrame>,
}

impl VideoSink {
    pub fn new(format: VideoFormat) -> Arc<Self> {
        let size = format.frame_size();
        Arc::new(Self {
            format,
            slots: Mutex::new(VideoSlots {
                latest: VideoFrame {
                    data: vec![0; size],
                    ..VideoFrame::default()
                },
                fresh: false,
                written: 0,
            }),
            front: Mutex::new(VideoFrame {
                data: vec![0; size],
                ..VideoFrame::default()
            }),
        })
    }

    pub fn format(&self) -> VideoFormat {
        self.format
    }

    /// 拷贝一帧（引擎回调线程调用）
    fn write(&self, sample: &SampleBuffer<'_>, source: &VideoFormat) -> DeliveryOutcome {
        let mut slots = self.slots.lock();
        let replaced = slots.fresh;

        copy_rows(source, sample.payload, &self.format, &mut slots.latest.data);
        slots.latest.pts = sample.pts;
        slots.latest.duration = sample.duration;
        slots.fresh = true;
        slots.written += 1;

        if replaced {
            DeliveryOutcome::ReplacedStale
        } else {
            DeliveryOutcome::Delivered
        }
    }

    /// 累计写入的帧数
    pub fn frames_written(&self) -> u64 {
        self.slots.lock().written
    }

    /// 消费最新帧；没有新帧时返回 None
    ///
    /// 回调运行期间生产者可以继续写入下一帧，两者不争用同一块缓冲。
    pub fn consume<R>(&self, f: impl FnOnce(&VideoFrame) -> R) -> Option<R> {
        let mut front = self.front.lock();
        {
            let mut slots = self.slots.lock();
            if !slots.fresh {
                return None;
            }
            std::mem::swap(&mut *front, &mut slots.latest);
            slots.fresh = false;
        }
        Some(f(&front))
    }

    pub fn take_latest(&self) -> Option<VideoFrame> {
        self.consume(|frame| frame.clone())
    }
}

/// 按源/目标行跨度逐平面、逐行拷贝
fn copy_rows(src_format: &VideoFormat, src: &[u8], dst_format: &VideoFormat, dst: &mut Vec<u8>) {
    let dst_size = dst_format.frame_size();
    if dst.len() != dst_size {
        dst.resize(dst_size, 0);
    }

    if src_format.stride == dst_format.stride {
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        return;
    }

    for (from, to) in src_format.planes().iter().zip(dst_format.planes()) {
        let row_len = from.row_len.min(to.row_len);
        for row in 0..from.rows.min(to.rows) {
            let s = from.offset + row * from.stride;
            let d = to.offset + row * to.stride;
            if s + row_len > src.len() || d + row_len > dst.len() {
                break;
            }
            dst[d..d + row_len].copy_from_slice(&src[s..s + row_len]);
        }
    }
}

/// 宿主读到的音频块
#[derive(Debug, Clone, Default)]
pub struct AudioChunk {
    pub pts: Duration,
    pub duration: Duration,
    pub data: Vec<u8>,
}

struct AudioRing {
    slots: Vec<AudioChunk>,
    head: usize,
    len: usize,
}

/// 音频输出：固定槽位数的环形缓冲
pub struct AudioSink {
    format: AudioFormat,
    ring: Mutex<AudioRing>,
    not_full: Condvar,
}

impl AudioSink {
    pub fn new(format: AudioFormat, slot_count: usize) -> Arc<Self> {
        let slot_count = slot_count.max(1);
        Arc::new(Self {
            format,
            ring: Mutex::new(AudioRing {
                slots: vec![AudioChunk::default(); slot_count],
                head: 0,
                len: 0,
            }),
            not_full: Condvar::new(),
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().slots.len()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 拷贝一块音频；环满时最多等待 `timeout`
    fn write(&self, sample: &SampleBuffer<'_>, timeout: Duration) -> DeliveryOutcome {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock();

        while ring.len == ring.slots.len() {
            if self.not_full.wait_until(&mut ring, deadline).timed_out()
                && ring.len == ring.slots.len()
            {
                return DeliveryOutcome::DroppedTimeout;
            }
        }

        let capacity = ring.slots.len();
        let index = (ring.head + ring.len) % capacity;
        let slot = &mut ring.slots[index];
        slot.data.clear();
        slot.data.extend_from_slice(sample.payload);
        slot.pts = sample.pts;
        slot.duration = sample.duration;
        ring.len += 1;

        DeliveryOutcome::Delivered
    }

    /// 取出最早的一块（宿主音频线程调用）
    pub fn pop(&self) -> Option<AudioChunk> {
        let mut ring = self.ring.lock();
        if ring.len == 0 {
            return None;
        }
        let head = ring.head;
        let chunk = std::mem::take(&mut ring.slots[head]);
        ring.head = (head + 1) % ring.slots.len();
        ring.len -= 1;
        drop(ring);

        self.not_full.notify_one();
        Some(chunk)
    }

    /// 丢弃所有未消费的块（例如 seek 之后）
    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.head = 0;
        ring.len = 0;
        drop(ring);
        self.not_full.notify_all();
    }
}

/// 按类型把样本路由到宿主绑定的输出
pub struct SampleDelivery {
    video: RwLock<Option<Arc<VideoSink>>>,
    audio: RwLock<Option<Arc<AudioSink>>>,
    audio_timeout: Duration,
    diagnostics: Arc<Diagnostics>,
}

impl SampleDelivery {
    pub fn new(audio_timeout: Duration, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            video: RwLock::new(None),
            audio: RwLock::new(None),
            audio_timeout,
            diagnostics,
        }
    }

    pub fn bind_video(&self, sink: Option<Arc<VideoSink>>) {
        *self.video.write() = sink;
    }

    pub fn bind_audio(&self, sink: Option<Arc<AudioSink>>) {
        *self.audio.write() = sink;
    }

    pub fn video_format(&self) -> Option<VideoFormat> {
        self.video.read().as_ref().map(|sink| sink.format())
    }

    pub fn audio_format(&self) -> Option<AudioFormat> {
        self.audio.read().as_ref().map(|sink| sink.format())
    }

    pub fn has_sink(&self, kind: SampleKind) -> bool {
        match kind {
            SampleKind::Video => self.video.read().is_some(),
            SampleKind::Audio => self.audio.read().is_some(),
        }
    }

    /// 投递一个样本；返回前负载已拷贝完毕
    pub fn deliver(&self, sample: &SampleBuffer<'_>) -> DeliveryOutcome {
        let outcome = match sample.format {
            SampleFormatDescriptor::Video(ref format) => {
                // 克隆 Arc 后立即释放读锁，拷贝不在锁内进行
                let sink = self.video.read().clone();
                match sink {
                    None => DeliveryOutcome::NoSink,
                    Some(sink) if !sink.format().same_layout(format) => {
                        DeliveryOutcome::FormatMismatch
                    }
                    Some(sink) => sink.write(sample, format),
                }
            }
            SampleFormatDescriptor::Audio(ref format) => {
                let sink = self.audio.read().clone();
                match sink {
                    None => DeliveryOutcome::NoSink,
                    Some(sink) if sink.format() != *format => DeliveryOutcome::FormatMismatch,
                    Some(sink) => sink.write(sample, self.audio_timeout),
                }
            }
        };

        self.record(sample.kind(), outcome);
        outcome
    }

    fn record(&self, kind: SampleKind, outcome: DeliveryOutcome) {
        match (kind, outcome) {
            (SampleKind::Video, DeliveryOutcome::Delivered) => {
                self.diagnostics.record_video_delivered()
            }
            (SampleKind::Video, DeliveryOutcome::ReplacedStale) => {
                self.diagnostics.record_video_delivered();
                self.diagnostics.record_video_dropped();
            }
            (SampleKind::Audio, DeliveryOutcome::Delivered) => {
                self.diagnostics.record_audio_delivered()
            }
            (SampleKind::Audio, DeliveryOutcome::DroppedTimeout) => {
                self.diagnostics.record_audio_underrun();
                debug!("{} 🔇 音频背压超时，丢弃一块", log_ctx());
            }
            (_, DeliveryOutcome::NoSink) => self.diagnostics.record_sample_without_sink(),
            (_, DeliveryOutcome::FormatMismatch) => {
                self.diagnostics.record_format_mismatch();
                if log_enabled!(Level::Debug) {
                    debug!("{} ⚠️ {:?} 样本格式与输出不一致，已丢弃", log_ctx(), kind);
                }
            }
            _ => {
                trace!("{:?} -> {:?}", kind, outcome);
            }
        }
    }
}
