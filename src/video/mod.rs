//! Video metadata and windowed frame extraction.
//!
//! Frames are returned as a run of independently encoded JPEG images,
//! concatenated with no separators, length prefixes or count header. A
//! consumer finds the boundaries by parsing each JPEG (SOI .. EOI); see
//! [`crate::client::split_jpeg_frames`]. The `frame_sizes` list in the
//! `get_video_frames` result object carries the same information for
//! consumers that prefer not to parse.
//!
//! Decoding sits behind [`VideoBackend`]. The FFmpeg implementation is
//! compiled with the `ffmpeg` feature; without it [`default_backend`] reports
//! that video support is unavailable.

#[cfg_attr(not(feature = "ffmpeg"), allow(dead_code, reason = "only the ffmpeg decoder seeks"))]
mod cursor;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use std::{path::Path, sync::Arc};

use image::{RgbImage, codecs::jpeg::JpegEncoder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
   error::QueryError,
   service::{QueryContext, Service, ServiceReply},
};

/// Stream metadata reported by `get_video_info`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
   pub width:       u32,
   pub height:      u32,
   pub fps:         f64,
   pub frame_count: u64,
}

/// Opens video files for decoding
pub trait VideoBackend: Send + Sync {
   fn open(&self, path: &Path) -> Result<Box<dyn VideoDecoder>, QueryError>;
}

/// An open video stream. Dropping it releases the container and codec.
pub trait VideoDecoder {
   fn info(&self) -> VideoInfo;

   /// Positions the stream so the next frame returned is `frame`.
   fn seek(&mut self, frame: u64) -> Result<(), QueryError>;

   /// Next decoded frame, or `None` once the stream is exhausted.
   fn next_frame(&mut self) -> Result<Option<RgbImage>, QueryError>;
}

/// Backend used when the crate is built without a decoder
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableBackend;

impl VideoBackend for UnavailableBackend {
   fn open(&self, path: &Path) -> Result<Box<dyn VideoDecoder>, QueryError> {
      Err(QueryError::handler(format!(
         "cannot decode {}: video support requires building rtcshare with the `ffmpeg` feature",
         path.display()
      )))
   }
}

pub fn default_backend() -> Arc<dyn VideoBackend> {
   #[cfg(feature = "ffmpeg")]
   {
      Arc::new(ffmpeg::FfmpegBackend)
   }
   #[cfg(not(feature = "ffmpeg"))]
   {
      Arc::new(UnavailableBackend)
   }
}

/// Concatenated JPEG blobs plus the size of each one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameRun {
   pub payload:     Vec<u8>,
   pub frame_sizes: Vec<usize>,
}

impl FrameRun {
   fn push(&mut self, blob: &[u8]) {
      self.payload.extend_from_slice(blob);
      self.frame_sizes.push(blob.len());
   }

   pub fn len(&self) -> usize {
      self.frame_sizes.len()
   }

   pub fn is_empty(&self) -> bool {
      self.frame_sizes.is_empty()
   }
}

/// Reads stream metadata and releases the handle.
pub fn get_info(backend: &dyn VideoBackend, path: &Path) -> Result<VideoInfo, QueryError> {
   tracing::info!("getting video info from {}", path.display());
   let decoder = backend.open(path)?;
   Ok(decoder.info())
}

/// Decodes frames `[start, end)` and re-encodes each as JPEG at `quality`.
///
/// Stops early, without error, when the stream runs out before `end`.
pub fn get_frames(
   backend: &dyn VideoBackend,
   path: &Path,
   start: i64,
   end: i64,
   quality: i64,
) -> Result<FrameRun, QueryError> {
   let quality = jpeg_quality(quality)?;
   let mut decoder = backend.open(path)?;
   let frame_count = decoder.info().frame_count;

   if start < 0 || start >= end || end as u64 > frame_count {
      return Err(QueryError::InvalidRange(format!(
         "Invalid frame range: [{start}, {end}) for {frame_count} frames"
      )));
   }
   let (start, end) = (start as u64, end as u64);

   tracing::info!("getting frames from {} ({start} - {end})", path.display());
   decoder.seek(start)?;

   let mut run = FrameRun::default();
   for index in start..end {
      let Some(frame) = decoder.next_frame()? else {
         tracing::debug!("stream ended at frame {index}, before requested end {end}");
         break;
      };
      run.push(&encode_jpeg(&frame, quality)?);
   }

   Ok(run)
}

fn jpeg_quality(quality: i64) -> Result<u8, QueryError> {
   match u8::try_from(quality) {
      Ok(q) if q <= 100 => Ok(q.max(1)),
      _ => Err(QueryError::InvalidRange(format!("Invalid quality: {quality} (expected 0-100)"))),
   }
}

/// Encodes one frame as a standalone JPEG image
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, QueryError> {
   let mut buf = Vec::new();
   JpegEncoder::new_with_quality(&mut buf, quality)
      .encode_image(frame)
      .map_err(|e| QueryError::handler(format!("Failed to encode frame as JPG: {e}")))?;
   Ok(buf)
}

/// Queries accepted by the built-in `video` service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VideoQuery {
   GetVideoInfo {
      path: String,
   },
   GetVideoFrames {
      path:        String,
      start_frame: i64,
      end_frame:   i64,
      quality:     i64,
   },
}

/// Built-in `video` service
pub struct VideoService {
   backend: Arc<dyn VideoBackend>,
}

impl VideoService {
   pub fn new(backend: Arc<dyn VideoBackend>) -> Self {
      Self { backend }
   }
}

impl Service for VideoService {
   fn handle_query(&self, query: &Value, ctx: &QueryContext<'_>) -> Result<ServiceReply, QueryError> {
      let query: VideoQuery = serde_json::from_value(query.clone())
         .map_err(|e| QueryError::handler(format!("Invalid video query: {e}")))?;

      match query {
         VideoQuery::GetVideoInfo { path } => {
            let path = ctx.resolve(&path)?;
            let info = get_info(self.backend.as_ref(), &path)?;
            Ok(ServiceReply::result(json!({ "info": info })))
         },
         VideoQuery::GetVideoFrames { path, start_frame, end_frame, quality } => {
            let path = ctx.resolve(&path)?;
            let run = get_frames(self.backend.as_ref(), &path, start_frame, end_frame, quality)?;
            let result = json!({
               "success": true,
               "num_frames": run.len(),
               "frame_sizes": run.frame_sizes,
            });
            Ok(ServiceReply::new(result, run.payload))
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use image::Rgb;

   use super::*;

   /// Solid-color frames whose red channel encodes the frame index.
   struct Synthetic {
      advertised: u64,
      actual:     u64,
   }

   struct SyntheticDecoder {
      advertised: u64,
      actual:     u64,
      next:       u64,
   }

   impl VideoBackend for Synthetic {
      fn open(&self, _path: &Path) -> Result<Box<dyn VideoDecoder>, QueryError> {
         Ok(Box::new(SyntheticDecoder { advertised: self.advertised, actual: self.actual, next: 0 }))
      }
   }

   impl VideoDecoder for SyntheticDecoder {
      fn info(&self) -> VideoInfo {
         VideoInfo { width: 16, height: 8, fps: 30.0, frame_count: self.advertised }
      }

      fn seek(&mut self, frame: u64) -> Result<(), QueryError> {
         self.next = frame;
         Ok(())
      }

      fn next_frame(&mut self) -> Result<Option<RgbImage>, QueryError> {
         if self.next >= self.actual {
            return Ok(None);
         }
         let shade = (self.next * 20 % 256) as u8;
         self.next += 1;
         Ok(Some(RgbImage::from_pixel(16, 8, Rgb([shade, 0, 0]))))
      }
   }

   fn backend(advertised: u64, actual: u64) -> Synthetic {
      Synthetic { advertised, actual }
   }

   #[test]
   fn returns_requested_window() {
      let run = get_frames(&backend(10, 10), Path::new("v"), 2, 5, 80).unwrap();
      assert_eq!(run.len(), 3);
      assert_eq!(run.frame_sizes.iter().sum::<usize>(), run.payload.len());

      let mut offset = 0;
      for size in &run.frame_sizes {
         let blob = &run.payload[offset..offset + size];
         assert_eq!(&blob[..2], &[0xFF, 0xD8]);
         assert_eq!(&blob[size - 2..], &[0xFF, 0xD9]);
         offset += size;
      }
   }

   #[test]
   fn stops_early_when_stream_is_short() {
      let run = get_frames(&backend(10, 4), Path::new("v"), 2, 8, 50).unwrap();
      assert_eq!(run.len(), 2);
   }

   #[test]
   fn rejects_bad_ranges() {
      let b = backend(10, 10);
      for (s, e) in [(-1, 3), (3, 3), (5, 2), (0, 11)] {
         let err = get_frames(&b, Path::new("v"), s, e, 50).unwrap_err();
         assert_eq!(err.kind(), "InvalidRange", "range {s}..{e}");
      }
   }

   #[test]
   fn rejects_out_of_range_quality() {
      let err = get_frames(&backend(10, 10), Path::new("v"), 0, 1, 101).unwrap_err();
      assert_eq!(err.kind(), "InvalidRange");
   }

   #[test]
   fn each_blob_decodes_independently() {
      let run = get_frames(&backend(6, 6), Path::new("v"), 0, 6, 90).unwrap();
      let mut offset = 0;
      for size in &run.frame_sizes {
         let img = image::load_from_memory(&run.payload[offset..offset + size]).unwrap();
         assert_eq!((img.width(), img.height()), (16, 8));
         offset += size;
      }
   }

   #[test]
   fn unavailable_backend_is_a_handler_failure() {
      let err = get_info(&UnavailableBackend, Path::new("clip.mp4")).unwrap_err();
      assert_eq!(err.kind(), "HandlerFailure");
   }

   #[test]
   fn parses_frame_query() {
      let q: VideoQuery = serde_json::from_value(json!({
         "type": "get_video_frames",
         "path": "rtcshare://a.mp4",
         "start_frame": 0,
         "end_frame": 10,
         "quality": 70
      }))
      .unwrap();
      assert!(matches!(q, VideoQuery::GetVideoFrames { end_frame: 10, .. }));
   }
}
