use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, software, util};
use log::{debug, warn};
use std::time::Duration;

use crate::core::{log_ctx, AudioFormat, PixelFormat, Result, SampleFormat, VideoFormat};

fn time_base_of(stream: &format::stream::Stream) -> f64 {
    let tb = stream.time_base();
    if tb.denominator() == 0 {
        0.0
    } else {
        tb.numerator() as f64 / tb.denominator() as f64
    }
}

fn pts_of(timestamp: Option<i64>, time_base: f64) -> Duration {
    let seconds = timestamp.unwrap_or(0) as f64 * time_base;
    Duration::from_secs_f64(seconds.max(0.0))
}

fn ffmpeg_pixel(format: PixelFormat) -> util::format::Pixel {
    match format {
        PixelFormat::RGBA => util::format::Pixel::RGBA,
        PixelFormat::BGRA => util::format::Pixel::BGRA,
        PixelFormat::RGB => util::format::Pixel::RGB24,
        PixelFormat::YUV420P => util::format::Pixel::YUV420P,
        PixelFormat::NV12 => util::format::Pixel::NV12,
    }
}

/// 解码后的一帧，已转换为宿主格式
pub struct DecodedVideo {
    pub pts: Duration,
    pub data: Vec<u8>,
}

/// 视频解码器：解码并缩放到宿主输出格式
pub struct VideoDecoder {
    decoder: codec::decoder::Video,
    scaler: Option<(software::scaling::Context, VideoFormat)>,
    time_base: f64,
}

impl VideoDecoder {
    pub fn from_stream(stream: format::stream::Stream) -> Result<Self> {
        let context = codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = context.decoder().video()?;
        let time_base = time_base_of(&stream);

        debug!(
            "{} 视频解码器: {}x{}, 格式: {:?}",
            log_ctx(),
            decoder.width(),
            decoder.height(),
            decoder.format()
        );

        Ok(Self {
            decoder,
            scaler: None,
            time_base,
        })
    }

    /// 解码数据包，输出按 `target` 排列的帧
    pub fn decode(&mut self, packet: &ffmpeg::Packet, target: VideoFormat) -> Result<Vec<DecodedVideo>> {
        match self.decoder.send_packet(packet) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                self.decoder.flush();
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        }
        self.drain(target)
    }

    /// 送入 EOF 并取出剩余帧
    pub fn finish(&mut self, target: VideoFormat) -> Result<Vec<DecodedVideo>> {
        self.decoder.send_eof()?;
        let frames = self.drain(target)?;
        self.decoder.flush();
        Ok(frames)
    }

    /// seek 之后丢弃解码器内部缓存
    pub fn flush(&mut self) {
        self.decoder.flush();
    }

    fn drain(&mut self, target: VideoFormat) -> Result<Vec<DecodedVideo>> {
        let mut frames = Vec::new();
        loop {
            let mut decoded = util::frame::Video::empty();
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => frames.push(self.convert(&decoded, target)?),
                Err(ffmpeg::Error::Other { errno: 11 }) | Err(ffmpeg::Error::Eof) => break,
                Err(e) => {
                    // 个别损坏帧直接跳过
                    warn!("{} 视频解码错误（已跳过）: {}", log_ctx(), e);
                    break;
                }
            }
        }
        Ok(frames)
    }

    fn convert(&mut self, frame: &util::frame::Video, target: VideoFormat) -> Result<DecodedVideo> {
        let rebuild = match &self.scaler {
            Some((_, current)) => *current != target,
            None => true,
        };
        if rebuild {
            let scaler = software::scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                ffmpeg_pixel(target.pixel_format),
                target.width,
                target.height,
                software::scaling::Flags::BILINEAR,
            )?;
            self.scaler = Some((scaler, target));
        }

        let mut scaled = util::frame::Video::empty();
        if let Some((scaler, _)) = self.scaler.as_mut() {
            scaler.run(frame, &mut scaled)?;
        }

        Ok(DecodedVideo {
            pts: pts_of(frame.timestamp(), self.time_base),
            data: pack_planes(&scaled, &target),
        })
    }
}

/// 把 FFmpeg 帧的各个平面按目标行跨度拷贝成连续内存
fn pack_planes(frame: &util::frame::Video, target: &VideoFormat) -> Vec<u8> {
    let mut out = vec![0u8; target.frame_size()];

    for (index, plane) in target.planes().iter().enumerate().take(frame.planes()) {
        let src = frame.data(index);
        let src_stride = frame.stride(index);
        let row_len = plane.row_len.min(src_stride);
        for row in 0..plane.rows {
            let s = row * src_stride;
            let d = plane.offset + row * plane.stride;
            if s + row_len > src.len() || d + row_len > out.len() {
                break;
            }
            out[d..d + row_len].copy_from_slice(&src[s..s + row_len]);
        }
    }
    out
}

/// 音频解码器：解码并重采样到宿主输出格式
pub struct AudioDecoder {
    decoder: codec::decoder::Audio,
    resampler: Option<(software::resampling::Context, AudioFormat)>,
    time_base: f64,
}

pub struct DecodedAudio {
    pub pts: Duration,
    pub data: Vec<u8>,
}

impl AudioDecoder {
    pub fn from_stream(stream: format::stream::Stream) -> Result<Self> {
        let context = codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = context.decoder().audio()?;
        let time_base = time_base_of(&stream);

        debug!(
            "{} 音频解码器: {} Hz, {} 声道, 格式: {:?}",
            log_ctx(),
            decoder.rate(),
            decoder.channels(),
            decoder.format()
        );

        Ok(Self {
            decoder,
            resampler: None,
            time_base,
        })
    }

    pub fn decode(&mut self, packet: &ffmpeg::Packet, target: AudioFormat) -> Result<Vec<DecodedAudio>> {
        match self.decoder.send_packet(packet) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                self.decoder.flush();
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        }

        let mut chunks = Vec::new();
        loop {
            let mut decoded = util::frame::Audio::empty();
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => chunks.push(self.convert(&decoded, target)?),
                Err(ffmpeg::Error::Other { errno: 11 }) | Err(ffmpeg::Error::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(chunks)
    }

    pub fn flush(&mut self) {
        self.decoder.flush();
    }

    fn convert(&mut self, frame: &util::frame::Audio, target: AudioFormat) -> Result<DecodedAudio> {
        let rebuild = match &self.resampler {
            Some((_, current)) => *current != target,
            None => true,
        };
        if rebuild {
            let layout = match target.channels {
                1 => util::channel_layout::ChannelLayout::MONO,
                6 => util::channel_layout::ChannelLayout::_5POINT1,
                _ => util::channel_layout::ChannelLayout::STEREO,
            };
            let sample = match target.sample_format {
                SampleFormat::F32 => util::format::Sample::F32(util::format::sample::Type::Packed),
                SampleFormat::I16 => util::format::Sample::I16(util::format::sample::Type::Packed),
            };
            debug!(
                "{} 🔧 音频重采样: {}Hz/{}ch → {}Hz/{}ch {:?}",
                log_ctx(),
                frame.rate(),
                frame.channels(),
                target.sample_rate,
                target.channels,
                target.sample_format
            );
            let resampler = software::resampling::Context::get(
                frame.format(),
                frame.channel_layout(),
                frame.rate(),
                sample,
                layout,
                target.sample_rate,
            )?;
            self.resampler = Some((resampler, target));
        }

        let mut resampled = util::frame::Audio::empty();
        if let Some((resampler, _)) = self.resampler.as_mut() {
            resampler.run(frame, &mut resampled)?;
        }

        // data(0) 可能带对齐填充，只取有效部分
        let bytes = resampled.samples() * target.frame_bytes();
        let plane = resampled.data(0);
        let data = plane[..bytes.min(plane.len())].to_vec();

        Ok(DecodedAudio {
            pts: pts_of(frame.timestamp(), self.time_base),
            data,
        })
    }
}
