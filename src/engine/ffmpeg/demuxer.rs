use ffmpeg_next as ffmpeg;
use ffmpeg_next::{format, media};
use log::{debug, info};
use std::time::Duration;

use super::avio::StreamIo;
use crate::core::{
    log_ctx, BridgeError, EngineOptions, MediaInfo, MediaSource, Result, StreamProtocol,
    TrackDescriptor, TrackFlags, TrackKind,
};
use crate::engine::MediaStream;

/// 解封装器 - 读取媒体源并枚举所有音视频/字幕流
pub struct Demuxer {
    input_ctx: format::context::Input,
    /// 字节流输入的 AVIO，必须在 input_ctx 之后释放
    _io: Option<StreamIo>,
    tracks: Vec<TrackDescriptor>,
    media_info: MediaInfo,
    locator: String,
}

impl Demuxer {
    /// 打开媒体源（阻塞，只在引擎工作线程上调用）
    pub fn open(source: &MediaSource, options: &EngineOptions) -> Result<Self> {
        let locator = source.locator();
        info!("{} 📂 FFmpeg 打开: {}", log_ctx(), locator);

        let caching = options.caching_for(source.caching_class());
        let input_ctx = match source {
            MediaSource::NetworkStream { protocol, .. } => {
                info!("{} 🌐 网络流 ({}), 缓存 {:?}", log_ctx(), protocol.as_str(), caching);
                let mut dict = ffmpeg::Dictionary::new();

                // 丢弃损坏帧并补齐 PTS
                dict.set("fflags", "+discardcorrupt+genpts");
                dict.set("timeout", "15000000");
                dict.set("rw_timeout", "8000000");
                dict.set("max_delay", &(caching.as_micros() as u64).to_string());
                dict.set("reconnect", "1");
                dict.set("reconnect_streamed", "1");
                dict.set("reconnect_delay_max", "4");

                match protocol {
                    StreamProtocol::RTSP => dict.set("rtsp_transport", "tcp"),
                    StreamProtocol::HLS => {
                        dict.set("live_start_index", "-1");
                        dict.set("http_persistent", "1");
                    }
                    StreamProtocol::RTMP | StreamProtocol::HTTP => {}
                }

                format::input_with_dictionary(&locator, dict)
                    .map_err(|e| BridgeError::OpenFailed(format!("无法打开网络流 {}: {}", locator, e)))?
            }
            _ => format::input(&locator)
                .map_err(|e| BridgeError::OpenFailed(format!("无法打开 {}: {}", locator, e)))?,
        };

        Self::from_input(None, input_ctx, source)
    }

    /// 通过自定义 AVIO 从宿主字节流打开
    pub fn open_stream(stream: Box<dyn MediaStream>, source: &MediaSource) -> Result<Self> {
        let locator = source.locator();
        info!("{} 📦 FFmpeg 打开字节流: {}", log_ctx(), locator);
        let (input_ctx, io) = StreamIo::open(stream, &locator)?;
        Self::from_input(Some(io), input_ctx, source)
    }

    /// 参数按逆序释放：出错返回时 input_ctx 先于 io 关闭
    fn from_input(
        io: Option<StreamIo>,
        input_ctx: format::context::Input,
        source: &MediaSource,
    ) -> Result<Self> {
        let locator = source.locator();
        let tracks = Self::enumerate_tracks(&input_ctx);
        if tracks.is_empty() {
            return Err(BridgeError::OpenFailed(format!("{} 中没有可播放的流", locator)));
        }

        let media_info = Self::extract_media_info(&input_ctx, source);
        debug!("{} 轨道: {:?}", log_ctx(), tracks);

        Ok(Self {
            input_ctx,
            _io: io,
            tracks,
            media_info,
            locator,
        })
    }

    fn enumerate_tracks(input_ctx: &format::context::Input) -> Vec<TrackDescriptor> {
        let best_video = input_ctx.streams().best(media::Type::Video).map(|s| s.index());
        let best_audio = input_ctx.streams().best(media::Type::Audio).map(|s| s.index());

        input_ctx
            .streams()
            .filter_map(|stream| {
                let params = stream.parameters();
                let kind = match params.medium() {
                    media::Type::Video => TrackKind::Video,
                    media::Type::Audio => TrackKind::Audio,
                    media::Type::Subtitle => TrackKind::Text,
                    _ => return None,
                };
                let index = stream.index();
                let metadata = stream.metadata();
                let disposition = stream.disposition();

                let default = match kind {
                    TrackKind::Video => Some(index) == best_video,
                    TrackKind::Audio => Some(index) == best_audio,
                    TrackKind::Text => disposition.contains(format::stream::Disposition::DEFAULT),
                };

                Some(TrackDescriptor {
                    id: index as i32,
                    kind,
                    codec: params.id().name().to_string(),
                    name: metadata.get("title").unwrap_or_default().to_string(),
                    language: metadata.get("language").map(|l| l.to_string()),
                    flags: TrackFlags {
                        default,
                        forced: disposition.contains(format::stream::Disposition::FORCED),
                    },
                })
            })
            .collect()
    }

    fn extract_media_info(input_ctx: &format::context::Input, source: &MediaSource) -> MediaInfo {
        // 微秒；直播流为负值或 AV_NOPTS_VALUE
        let duration = input_ctx.duration();
        let duration = (duration > 0).then(|| Duration::from_micros(duration as u64));

        let video = input_ctx.streams().best(media::Type::Video);
        let (width, height, fps) = match &video {
            Some(stream) => {
                let (w, h) = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                    .ok()
                    .and_then(|ctx| ctx.decoder().video().ok())
                    .map(|d| (Some(d.width()), Some(d.height())))
                    .unwrap_or((None, None));
                let rate = stream.avg_frame_rate();
                let fps = (rate.denominator() != 0)
                    .then(|| rate.numerator() as f64 / rate.denominator() as f64);
                (w, h, fps)
            }
            None => (None, None, None),
        };

        MediaInfo {
            duration,
            seekable: duration.is_some() && !matches!(
                source,
                MediaSource::NetworkStream { protocol: StreamProtocol::RTSP | StreamProtocol::RTMP, .. }
            ),
            pausable: true,
            width,
            height,
            fps,
        }
    }

    pub fn tracks(&self) -> &[TrackDescriptor] {
        &self.tracks
    }

    pub fn media_info(&self) -> &MediaInfo {
        &self.media_info
    }

    pub fn stream(&self, index: usize) -> Option<format::stream::Stream<'_>> {
        self.input_ctx.stream(index)
    }

    /// 读取下一个数据包，返回 (流索引, 包)；None 表示 EOF
    pub fn read_packet(&mut self) -> Option<(usize, ffmpeg::Packet)> {
        self.input_ctx
            .packets()
            .next()
            .map(|(stream, packet)| (stream.index(), packet))
    }

    pub fn seek(&mut self, position: Duration) -> Result<()> {
        let timestamp = position.as_micros() as i64;
        self.input_ctx.seek(timestamp, ..timestamp)?;
        Ok(())
    }

    pub fn description(&self) -> String {
        format!("FFmpeg Demuxer: {}", self.locator)
    }
}
