use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use myy_media_bridge::core::{AudioFormat, PixelFormat, PlayerState, VideoFormat};
use myy_media_bridge::engine::{NativeEngine, SyntheticEngine, SyntheticOptions};
use myy_media_bridge::player::{AudioSink, BridgeNotification, MediaBridge, VideoSink};
use myy_media_bridge::BridgeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    /// 内置测试图案引擎
    Synthetic,
    /// FFmpeg 解码引擎（需要 `ffmpeg` feature）
    Ffmpeg,
}

#[derive(Parser, Debug)]
#[command(name = "myy_media_bridge", version)]
struct Args {
    /// 媒体定位符，例如 synthetic://clip?duration_ms=5000 或本地文件路径
    locator: String,

    #[arg(long, value_enum, default_value_t = EngineKind::Synthetic)]
    engine: EngineKind,

    /// JSON 配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 最多播放多少秒
    #[arg(long, default_value_t = 15.0)]
    seconds: f64,

    /// 循环播放
    #[arg(long = "loop")]
    looping: bool,
}

fn build_engine(kind: EngineKind) -> Result<Arc<dyn NativeEngine>> {
    match kind {
        EngineKind::Synthetic => Ok(Arc::new(SyntheticEngine::new(SyntheticOptions::default()))),
        #[cfg(feature = "ffmpeg")]
        EngineKind::Ffmpeg => Ok(Arc::new(myy_media_bridge::engine::FfmpegEngine::new())),
        #[cfg(not(feature = "ffmpeg"))]
        EngineKind::Ffmpeg => Err(anyhow!("未启用 ffmpeg feature，请使用 --features ffmpeg 重新编译")),
    }
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    info!("🎬 MYY Media Bridge 启动: {}", args.locator);

    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    config.looping |= args.looping;

    let engine = build_engine(args.engine)?;
    let bridge = MediaBridge::new(engine, config)?;

    bridge.subscribe(|notification| match notification {
        BridgeNotification::StateChanged { session, from, to } => {
            println!("[{}] {:?} -> {:?}", session, from, to)
        }
        BridgeNotification::TracksChanged { session, generation } => {
            println!("[{}] 轨道列表更新 (第 {} 版)", session, generation)
        }
        BridgeNotification::Error { session, kind, code, message } => {
            println!("[{}] 错误 {:?} ({}): {}", session, kind, code, message)
        }
        other => println!("{:?}", other),
    });

    let video = VideoSink::new(VideoFormat::packed(640, 360, PixelFormat::RGBA));
    let audio = AudioSink::new(AudioFormat::default(), 32);
    bridge.bind_video_sink(Some(video.clone()));
    bridge.bind_audio_sink(Some(audio.clone()));

    let session = bridge.open(&args.locator)?;

    let deadline = Instant::now() + Duration::from_secs_f64(args.seconds.max(0.0));
    let mut frames = 0u64;
    let mut chunks = 0u64;
    let mut printed_info = false;

    while Instant::now() < deadline {
        let snapshot = bridge.poll();

        // 充当宿主的渲染/音频线程：消费样本
        if video.consume(|_frame| ()).is_some() {
            frames += 1;
        }
        while audio.pop().is_some() {
            chunks += 1;
        }

        if !printed_info && snapshot.track_generation > 0 {
            print!("{}", bridge.info());
            printed_info = true;
        }

        if matches!(snapshot.state, PlayerState::Ended | PlayerState::Error) {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }

    let snapshot = bridge.get_state();
    println!(
        "状态 {:?}，位置 {:.2}s，消费视频帧 {}，音频块 {}",
        snapshot.state,
        snapshot.position.as_secs_f64(),
        frames,
        chunks
    );

    if let Err(e) = bridge.close(session) {
        eprintln!("关闭会话: {}", e);
    }
    print!("{}", bridge.stats());

    match snapshot.last_error {
        Some(err) => Err(anyhow!("播放失败: {}", err.message)),
        None => Ok(()),
    }
}
