use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::core::error::{BridgeError, ErrorKind, Result};

// 会话 ID 在整个进程生命周期内单调递增，永不复用
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 播放会话标识（同时作为宿主侧的 SessionHandle）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

pub type SessionHandle = SessionId;

impl SessionId {
    pub(crate) fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// 媒体源类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// 本地文件路径
    LocalFile(PathBuf),

    /// 网络流 URL（传输由原生引擎负责）
    NetworkStream {
        url: String,
        protocol: StreamProtocol,
    },

    /// 光盘、采集设备或引擎自定义协议（如 synthetic://）
    Other(String),
}

impl MediaSource {
    /// 从定位符字符串解析媒体源
    pub fn from_locator(locator: &str) -> Result<Self> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(BridgeError::OpenFailed("媒体定位符为空".to_string()));
        }

        if let Some(path) = locator.strip_prefix("file://") {
            if path.is_empty() {
                return Err(BridgeError::OpenFailed(format!("无效的文件 URL: {}", locator)));
            }
            return Ok(MediaSource::LocalFile(PathBuf::from(path)));
        }

        let protocol = if locator.starts_with("rtsp://") {
            Some(StreamProtocol::RTSP)
        } else if locator.starts_with("rtmp://") {
            Some(StreamProtocol::RTMP)
        } else if locator.ends_with(".m3u8") || locator.contains("/hls/") {
            Some(StreamProtocol::HLS)
        } else if locator.starts_with("http://") || locator.starts_with("https://") {
            Some(StreamProtocol::HTTP)
        } else {
            None
        };

        if let Some(protocol) = protocol {
            return Ok(MediaSource::NetworkStream {
                url: locator.to_string(),
                protocol,
            });
        }

        if locator.contains("://") {
            Ok(MediaSource::Other(locator.to_string()))
        } else {
            // 默认当作本地文件
            Ok(MediaSource::LocalFile(PathBuf::from(locator)))
        }
    }

    /// 原始定位符
    pub fn locator(&self) -> String {
        match self {
            MediaSource::LocalFile(path) => path.to_string_lossy().to_string(),
            MediaSource::NetworkStream { url, .. } => url.clone(),
            MediaSource::Other(locator) => locator.clone(),
        }
    }

    /// URL 协议部分（本地文件为 "file"）
    pub fn scheme(&self) -> &str {
        match self {
            MediaSource::LocalFile(_) => "file",
            MediaSource::NetworkStream { url, .. } | MediaSource::Other(url) => {
                url.split("://").next().unwrap_or_default()
            }
        }
    }

    /// 判断是否为网络流
    pub fn is_network_stream(&self) -> bool {
        matches!(self, MediaSource::NetworkStream { .. })
    }

    /// 缓存策略分类（对应引擎的 file/network/disc/live caching 选项）
    pub fn caching_class(&self) -> CachingClass {
        match self {
            MediaSource::LocalFile(_) => CachingClass::File,
            MediaSource::NetworkStream { .. } => CachingClass::Network,
            MediaSource::Other(_) => match self.scheme() {
                "dvd" | "bluray" | "cdda" | "vcd" => CachingClass::Disc,
                "v4l2" | "dshow" | "screen" | "alsa" | "avcapture" => CachingClass::Live,
                _ => CachingClass::File,
            },
        }
    }
}

/// 流媒体协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    /// RTSP - 实时流协议（监控摄像头）
    RTSP,
    /// RTMP - 实时消息协议（直播流）
    RTMP,
    /// HLS - HTTP Live Streaming
    HLS,
    /// HTTP - 普通 HTTP 流
    HTTP,
}

impl StreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProtocol::RTSP => "RTSP",
            StreamProtocol::RTMP => "RTMP",
            StreamProtocol::HLS => "HLS",
            StreamProtocol::HTTP => "HTTP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingClass {
    File,
    Network,
    Disc,
    Live,
}

/// 播放器状态（全部八种，不存在其它取值）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Closed,
    Opening,
    Buffering,
    Playing,
    Paused,
    Stopped,
    Ended,
    Error,
}

impl PlayerState {
    pub const ALL: [PlayerState; 8] = [
        PlayerState::Closed,
        PlayerState::Opening,
        PlayerState::Buffering,
        PlayerState::Playing,
        PlayerState::Paused,
        PlayerState::Stopped,
        PlayerState::Ended,
        PlayerState::Error,
    ];

    /// 稳定状态：挂起的命令在进入这些状态时重放
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            PlayerState::Buffering | PlayerState::Playing | PlayerState::Paused
        )
    }

    /// 终止状态：挂起的命令在进入这些状态时被丢弃
    pub fn discards_pending(&self) -> bool {
        matches!(
            self,
            PlayerState::Closed | PlayerState::Stopped | PlayerState::Ended | PlayerState::Error
        )
    }
}

/// 轨道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
    Text,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "Audio",
            TrackKind::Video => "Video",
            TrackKind::Text => "Caption",
        }
    }
}

/// 轨道 ID（由原生引擎分配，会话内稳定）
pub type TrackId = i32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackFlags {
    pub default: bool,
    pub forced: bool,
}

/// 一条可选择的音频/视频/文本轨道，枚举后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub id: TrackId,
    pub kind: TrackKind,
    pub codec: String,
    pub name: String,
    pub language: Option<String>,
    pub flags: TrackFlags,
}

impl TrackDescriptor {
    /// 宿主界面显示名（引擎未提供名称时按序号生成）
    pub fn display_name(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("{} Track {}", self.kind.as_str(), index)
        } else {
            self.name.clone()
        }
    }
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    BGRA,
    RGB,
    YUV420P,
    NV12,
}

impl PixelFormat {
    /// 打包格式的每像素字节数（平面格式返回亮度平面的字节数）
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::RGBA | PixelFormat::BGRA => 4,
            PixelFormat::RGB => 3,
            PixelFormat::YUV420P | PixelFormat::NV12 => 1,
        }
    }
}

/// 音频采样格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    F32,
    I16,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::I16 => 2,
        }
    }
}

/// 一个平面的位置：起始偏移、行跨度、行数与每行有效字节数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    pub stride: usize,
    pub rows: usize,
    pub row_len: usize,
}

/// 视频输出格式（像素布局与行跨度）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    /// 每行字节数
    pub stride: usize,
    pub pixel_format: PixelFormat,
}

impl VideoFormat {
    /// 紧凑排列（stride = width * bpp）的格式
    pub fn packed(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            stride: width as usize * pixel_format.bytes_per_pixel(),
            pixel_format,
        }
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.pixel_format.bytes_per_pixel()
    }

    /// 一帧所需的字节数（按行跨度，包含所有平面）
    pub fn frame_size(&self) -> usize {
        self.planes()
            .last()
            .map_or(0, |plane| plane.offset + plane.stride * plane.rows)
    }

    /// 各平面在连续帧内存中的排列
    ///
    /// YUV420P 的 U/V 平面行跨度为 `stride` 的一半（向上取整），
    /// NV12 的 UV 交错平面与亮度平面共用行跨度。
    pub fn planes(&self) -> Vec<PlaneLayout> {
        let width = self.width as usize;
        let height = self.height as usize;
        let luma = PlaneLayout {
            offset: 0,
            stride: self.stride,
            rows: height,
            row_len: self.row_bytes().min(self.stride),
        };
        let chroma_rows = height.div_ceil(2);
        let chroma_width = width.div_ceil(2);

        match self.pixel_format {
            PixelFormat::YUV420P => {
                let chroma_stride = self.stride.div_ceil(2);
                let u = PlaneLayout {
                    offset: self.stride * height,
                    stride: chroma_stride,
                    rows: chroma_rows,
                    row_len: chroma_width.min(chroma_stride),
                };
                let v = PlaneLayout {
                    offset: u.offset + chroma_stride * chroma_rows,
                    ..u
                };
                vec![luma, u, v]
            }
            PixelFormat::NV12 => vec![
                luma,
                PlaneLayout {
                    offset: self.stride * height,
                    stride: self.stride,
                    rows: chroma_rows,
                    row_len: (chroma_width * 2).min(self.stride),
                },
            ],
            _ => vec![luma],
        }
    }

    /// 与另一格式的可见像素布局是否一致（行跨度可以不同）
    pub fn same_layout(&self, other: &VideoFormat) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.pixel_format == other.pixel_format
    }
}

/// 音频输出格式（采样率与声道布局）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    /// 每个交织帧（所有声道各一个采样）的字节数
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.sample_format.bytes_per_sample()
    }

    /// 指定帧数对应的时长
    pub fn duration_of(&self, frames: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(frames as u64 * 1_000_000 / self.sample_rate as u64)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::F32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    Video,
    Audio,
}

/// 采样格式描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormatDescriptor {
    Video(VideoFormat),
    Audio(AudioFormat),
}

/// 一个解码后的音频或视频帧
///
/// 负载借用自原生引擎的缓冲区，仅在渲染回调期间有效，
/// 回调返回前必须拷贝进宿主缓冲区。
#[derive(Debug, Clone, Copy)]
pub struct SampleBuffer<'a> {
    /// 显示时间戳（原样透传）
    pub pts: Duration,
    pub duration: Duration,
    pub payload: &'a [u8],
    pub format: SampleFormatDescriptor,
}

impl<'a> SampleBuffer<'a> {
    pub fn video(pts: Duration, duration: Duration, payload: &'a [u8], format: VideoFormat) -> Self {
        Self {
            pts,
            duration,
            payload,
            format: SampleFormatDescriptor::Video(format),
        }
    }

    pub fn audio(pts: Duration, payload: &'a [u8], format: AudioFormat) -> Self {
        let frames = if format.frame_bytes() == 0 {
            0
        } else {
            payload.len() / format.frame_bytes()
        };
        Self {
            pts,
            duration: format.duration_of(frames),
            payload,
            format: SampleFormatDescriptor::Audio(format),
        }
    }

    pub fn kind(&self) -> SampleKind {
        match self.format {
            SampleFormatDescriptor::Video(_) => SampleKind::Video,
            SampleFormatDescriptor::Audio(_) => SampleKind::Audio,
        }
    }
}

/// 媒体信息（引擎在打开完成时报告）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// 总时长，直播流等未知时为 None
    pub duration: Option<Duration>,
    pub seekable: bool,
    pub pausable: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
}

/// 宿主可查询的控制能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Pause,
    Resume,
    Seek,
    Scrub,
}

/// 最近一次错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub code: i32,
    pub message: String,
}

/// 播放会话的不可变快照，每次查询生成一份
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStateSnapshot {
    pub session: Option<SessionId>,
    pub locator: Option<String>,
    pub state: PlayerState,
    pub duration: Option<Duration>,
    pub position: Duration,
    pub rate: f32,
    pub looping: bool,
    pub selected_tracks: BTreeMap<TrackKind, TrackId>,
    pub pending_tracks: BTreeMap<TrackKind, TrackId>,
    pub track_generation: u64,
    pub media_info: Option<MediaInfo>,
    pub last_error: Option<LastError>,
}

impl PlayerStateSnapshot {
    pub fn closed() -> Self {
        Self {
            session: None,
            locator: None,
            state: PlayerState::Closed,
            duration: None,
            position: Duration::ZERO,
            rate: 0.0,
            looping: false,
            selected_tracks: BTreeMap::new(),
            pending_tracks: BTreeMap::new(),
            track_generation: 0,
            media_info: None,
            last_error: None,
        }
    }
}
