//! 宿主字节流的自定义 AVIO
//!
//! FFmpeg 通过 `read_packet` / `seek` 两个回调从 `MediaStream` 取数据。
//! `StreamIo` 持有 AVIO 上下文和流本身，必须晚于使用它的 `Input` 释放。

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::format;
use std::ffi::CString;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::raw::{c_int, c_void};
use std::ptr;

use crate::core::{BridgeError, Result};
use crate::engine::MediaStream;

const IO_BUFFER_SIZE: usize = 64 * 1024;
const AVSEEK_SIZE: c_int = 0x10000;
const AVSEEK_FORCE: c_int = 0x20000;
const AVFMT_FLAG_CUSTOM_IO: c_int = 0x0080;

pub struct StreamIo {
    avio: *mut ffi::AVIOContext,
    opaque: *mut Box<dyn MediaStream>,
}

// 只在引擎工作线程上使用
unsafe impl Send for StreamIo {}

impl StreamIo {
    /// 以字节流打开输入；`hint` 是流的原始地址，参与格式探测
    pub fn open(stream: Box<dyn MediaStream>, hint: &str) -> Result<(format::context::Input, StreamIo)> {
        let url = CString::new(hint)
            .map_err(|_| BridgeError::OpenFailed(format!("地址中包含 NUL: {}", hint)))?;

        unsafe {
            let buffer = ffi::av_malloc(IO_BUFFER_SIZE as _) as *mut u8;
            if buffer.is_null() {
                return Err(BridgeError::OpenFailed("AVIO 缓冲分配失败".to_string()));
            }

            let opaque = Box::into_raw(Box::new(stream));
            let avio = ffi::avio_alloc_context(
                buffer,
                IO_BUFFER_SIZE as c_int,
                0,
                opaque as *mut c_void,
                Some(read_packet),
                None,
                Some(seek_stream),
            );
            if avio.is_null() {
                ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(opaque));
                return Err(BridgeError::OpenFailed("AVIO 上下文分配失败".to_string()));
            }
            // 之后的失败路径都交给 Drop 回收
            let io = StreamIo { avio, opaque };

            let mut ctx = ffi::avformat_alloc_context();
            if ctx.is_null() {
                return Err(BridgeError::OpenFailed("AVFormatContext 分配失败".to_string()));
            }
            (*ctx).pb = avio;
            (*ctx).flags |= AVFMT_FLAG_CUSTOM_IO;

            // 失败时 FFmpeg 会释放 ctx，但不会碰自定义的 pb
            let ret = ffi::avformat_open_input(&mut ctx, url.as_ptr(), ptr::null(), ptr::null_mut());
            if ret < 0 {
                return Err(BridgeError::OpenFailed(format!(
                    "无法打开字节流 {}: {}",
                    hint,
                    ffmpeg::Error::from(ret)
                )));
            }

            let input = format::context::Input::wrap(ctx);
            let ret = ffi::avformat_find_stream_info(ctx, ptr::null_mut());
            if ret < 0 {
                return Err(BridgeError::OpenFailed(format!(
                    "无法读取流信息 {}: {}",
                    hint,
                    ffmpeg::Error::from(ret)
                )));
            }

            Ok((input, io))
        }
    }
}

impl Drop for StreamIo {
    fn drop(&mut self) {
        unsafe {
            if !self.avio.is_null() {
                // 缓冲区可能已被 FFmpeg 重新分配，按上下文里的指针释放
                ffi::av_freep(&mut (*self.avio).buffer as *mut *mut u8 as *mut c_void);
                ffi::avio_context_free(&mut self.avio);
            }
            drop(Box::from_raw(self.opaque));
        }
    }
}

unsafe extern "C" fn read_packet(opaque: *mut c_void, buf: *mut u8, size: c_int) -> c_int {
    let stream = &mut *(opaque as *mut Box<dyn MediaStream>);
    let out = std::slice::from_raw_parts_mut(buf, size.max(0) as usize);
    loop {
        match stream.read(out) {
            Ok(0) => return ffmpeg::Error::Eof.into(),
            Ok(n) => return n as c_int,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return ffmpeg::Error::Unknown.into(),
        }
    }
}

unsafe extern "C" fn seek_stream(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let stream = &mut *(opaque as *mut Box<dyn MediaStream>);
    let result = match whence & !AVSEEK_FORCE {
        AVSEEK_SIZE => stream_len(stream),
        0 => stream.seek(SeekFrom::Start(offset.max(0) as u64)),
        1 => stream.seek(SeekFrom::Current(offset)),
        2 => stream.seek(SeekFrom::End(offset)),
        _ => return -1,
    };
    result.map_or(-1, |pos| pos as i64)
}

fn stream_len(stream: &mut Box<dyn MediaStream>) -> io::Result<u64> {
    let current = stream.stream_position()?;
    let end = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(current))?;
    Ok(end)
}
