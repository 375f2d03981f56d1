//! FFmpeg-backed decoder (libavformat/libavcodec via `ffmpeg-next`).

use std::{path::Path, sync::OnceLock};

use ffmpeg_next as ffmpeg;
use ffmpeg::{
   codec, format,
   media::Type,
   software::scaling::{context::Context as Scaler, flag::Flags},
   util::{format::Pixel, frame::video::Video},
};
use image::RgbImage;

use super::{VideoBackend, VideoDecoder, VideoInfo, cursor::FrameCursor};
use crate::error::QueryError;

static INIT: OnceLock<Result<(), String>> = OnceLock::new();

fn ensure_init() -> Result<(), QueryError> {
   INIT
      .get_or_init(|| ffmpeg::init().map_err(|e| e.to_string()))
      .clone()
      .map_err(|e| QueryError::handler(format!("failed to initialize ffmpeg: {e}")))
}

fn av_err(context: &str, e: ffmpeg::Error) -> QueryError {
   QueryError::handler(format!("{context}: {e}"))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegBackend;

impl VideoBackend for FfmpegBackend {
   fn open(&self, path: &Path) -> Result<Box<dyn VideoDecoder>, QueryError> {
      ensure_init()?;
      Ok(Box::new(FfmpegDecoder::open(path)?))
   }
}

pub struct FfmpegDecoder {
   input:        format::context::Input,
   decoder:      codec::decoder::Video,
   scaler:       Scaler,
   stream_index: usize,
   time_base:    f64,
   start_pts:    i64,
   info:         VideoInfo,
   cursor:       FrameCursor,
   eof_sent:     bool,
}

impl FfmpegDecoder {
   fn open(path: &Path) -> Result<Self, QueryError> {
      let input = format::input(&path).map_err(|e| {
         av_err(&format!("Could not open video file {}", path.display()), e)
      })?;

      let stream = input
         .streams()
         .best(Type::Video)
         .ok_or_else(|| QueryError::handler(format!("No video stream in {}", path.display())))?;
      let stream_index = stream.index();

      let rate = stream.avg_frame_rate();
      let fps = if rate.1 > 0 {
         f64::from(rate.0) / f64::from(rate.1)
      } else {
         0.0
      };
      let tb = stream.time_base();
      let time_base = if tb.1 > 0 {
         f64::from(tb.0) / f64::from(tb.1)
      } else {
         0.0
      };
      let start_pts = match stream.start_time() {
         ts if ts == ffmpeg::ffi::AV_NOPTS_VALUE => 0,
         ts => ts,
      };

      let mut frame_count = u64::try_from(stream.frames()).unwrap_or(0);
      if frame_count == 0 && fps > 0.0 && input.duration() > 0 {
         let seconds = input.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE);
         frame_count = (seconds * fps).round() as u64;
      }

      let context = codec::context::Context::from_parameters(stream.parameters())
         .map_err(|e| av_err("Failed to read codec parameters", e))?;
      let decoder = context
         .decoder()
         .video()
         .map_err(|e| av_err("Failed to open video decoder", e))?;

      let (width, height) = (decoder.width(), decoder.height());
      let scaler = Scaler::get(
         decoder.format(),
         width,
         height,
         Pixel::RGB24,
         width,
         height,
         Flags::BILINEAR,
      )
      .map_err(|e| av_err("Failed to create scaler", e))?;

      Ok(Self {
         input,
         decoder,
         scaler,
         stream_index,
         time_base,
         start_pts,
         info: VideoInfo { width, height, fps, frame_count },
         cursor: FrameCursor::new(),
         eof_sent: false,
      })
   }

   /// Timestamps map to frame indices only with a known rate and time base.
   fn timed(&self) -> bool {
      self.info.fps > 0.0 && self.time_base > 0.0
   }

   /// Frame index implied by a decoded frame's timestamp.
   fn frame_index(&self, frame: &Video) -> Option<u64> {
      if !self.timed() {
         return None;
      }
      let ts = frame.timestamp()?;
      let seconds = (ts - self.start_pts) as f64 * self.time_base;
      Some((seconds * self.info.fps).round().max(0.0) as u64)
   }

   fn to_rgb(&mut self, frame: &Video) -> Result<RgbImage, QueryError> {
      let mut rgb = Video::empty();
      self
         .scaler
         .run(frame, &mut rgb)
         .map_err(|e| av_err("Failed to convert frame", e))?;

      let (width, height) = (rgb.width(), rgb.height());
      let row_bytes = width as usize * 3;
      let stride = rgb.stride(0);
      let data = rgb.data(0);

      let mut pixels = Vec::with_capacity(row_bytes * height as usize);
      for row in 0..height as usize {
         let start = row * stride;
         pixels.extend_from_slice(&data[start..start + row_bytes]);
      }

      RgbImage::from_raw(width, height, pixels)
         .ok_or_else(|| QueryError::handler("decoded frame has unexpected size"))
   }
}

impl VideoDecoder for FfmpegDecoder {
   fn info(&self) -> VideoInfo {
      self.info
   }

   fn seek(&mut self, frame: u64) -> Result<(), QueryError> {
      if self.cursor.is_at(frame) {
         return Ok(());
      }
      if !self.timed() {
         return self.cursor.skip_to(frame);
      }

      let seconds = frame as f64 / self.info.fps;
      let ts = (seconds * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
      self
         .input
         .seek(ts, ..ts)
         .map_err(|e| av_err("Failed to seek", e))?;
      self.decoder.flush();
      self.eof_sent = false;
      self.cursor.reposition(frame);
      Ok(())
   }

   fn next_frame(&mut self) -> Result<Option<RgbImage>, QueryError> {
      let mut decoded = Video::empty();
      loop {
         if self.decoder.receive_frame(&mut decoded).is_ok() {
            let stamped = self.frame_index(&decoded);
            if !self.cursor.admit(stamped)? {
               continue;
            }
            return self.to_rgb(&decoded).map(Some);
         }

         if self.eof_sent {
            return Ok(None);
         }

         let mut packet = ffmpeg::Packet::empty();
         match packet.read(&mut self.input) {
            Ok(()) => {
               if packet.stream() != self.stream_index {
                  continue;
               }
               if let Err(e) = self.decoder.send_packet(&packet) {
                  tracing::debug!("skipping undecodable packet: {e}");
               }
            },
            Err(ffmpeg::Error::Eof) => {
               self
                  .decoder
                  .send_eof()
                  .map_err(|e| av_err("Failed to flush decoder", e))?;
               self.eof_sent = true;
            },
            Err(e) => return Err(av_err("Failed to read packet", e)),
         }
      }
   }
}
