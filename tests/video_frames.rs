use std::{fs, path::Path, sync::Arc};

use image::{Rgb, RgbImage};
use rtcshare::{
   QueryError,
   client::split_jpeg_frames,
   path::PathResolver,
   service::{QueryContext, Service},
   video::{VideoBackend, VideoDecoder, VideoInfo, VideoService},
};
use serde_json::json;
use tempfile::TempDir;

/// Gradient frames; the frame index is encoded in the blue channel.
struct Gradient {
   frames: u64,
}

struct GradientDecoder {
   frames: u64,
   next:   u64,
}

impl VideoBackend for Gradient {
   fn open(&self, path: &Path) -> Result<Box<dyn VideoDecoder>, QueryError> {
      assert!(path.is_absolute());
      Ok(Box::new(GradientDecoder { frames: self.frames, next: 0 }))
   }
}

impl VideoDecoder for GradientDecoder {
   fn info(&self) -> VideoInfo {
      VideoInfo { width: 32, height: 24, fps: 25.0, frame_count: self.frames }
   }

   fn seek(&mut self, frame: u64) -> Result<(), QueryError> {
      self.next = frame;
      Ok(())
   }

   fn next_frame(&mut self) -> Result<Option<RgbImage>, QueryError> {
      if self.next >= self.frames {
         return Ok(None);
      }
      let blue = (self.next * 40).min(255) as u8;
      self.next += 1;
      Ok(Some(RgbImage::from_fn(32, 24, |x, y| Rgb([(x * 8) as u8, (y * 10) as u8, blue]))))
   }
}

fn setup(frames: u64) -> (TempDir, PathResolver, VideoService) {
   let tmp = TempDir::new().unwrap();
   fs::create_dir_all(tmp.path().join("rec")).unwrap();
   fs::write(tmp.path().join("rec/session.avi"), b"stub").unwrap();
   let paths = PathResolver::new(tmp.path()).unwrap();
   (tmp, paths, VideoService::new(Arc::new(Gradient { frames })))
}

#[test]
fn info_query_wraps_metadata() {
   let (_tmp, paths, service) = setup(12);
   let ctx = QueryContext { dir: "rtcshare://rec", user_id: None, paths: &paths };
   let reply = service
      .handle_query(&json!({"type": "get_video_info", "path": "$dir/session.avi"}), &ctx)
      .unwrap();
   assert_eq!(
      reply.result,
      json!({"info": {"width": 32, "height": 24, "fps": 25.0, "frame_count": 12}})
   );
   assert!(reply.payload.is_empty());
}

#[test]
fn frames_query_returns_parseable_jpeg_run() {
   let (_tmp, paths, service) = setup(12);
   let ctx = QueryContext { dir: "", user_id: None, paths: &paths };
   let query = json!({
      "type": "get_video_frames",
      "path": "rtcshare://rec/session.avi",
      "start_frame": 3,
      "end_frame": 7,
      "quality": 60
   });
   let reply = service.handle_query(&query, &ctx).unwrap();
   assert_eq!(reply.result["success"], json!(true));
   assert_eq!(reply.result["num_frames"], json!(4));

   let frames = split_jpeg_frames(&reply.payload).unwrap();
   assert_eq!(frames.len(), 4);
   let sizes: Vec<usize> = frames.iter().map(|f| f.len()).collect();
   assert_eq!(reply.result["frame_sizes"], json!(sizes));

   for (offset, frame) in frames.iter().enumerate() {
      let img = image::load_from_memory(frame).unwrap().to_rgb8();
      assert_eq!(img.dimensions(), (32, 24));
      let expected_blue = ((3 + offset as u64) * 40).min(255) as i32;
      let got_blue = i32::from(img.get_pixel(16, 12)[2]);
      assert!((got_blue - expected_blue).abs() < 24, "frame {offset}: blue {got_blue}");
   }
}

#[test]
fn window_past_the_end_is_invalid_range() {
   let (_tmp, paths, service) = setup(5);
   let ctx = QueryContext { dir: "", user_id: None, paths: &paths };
   let query = json!({
      "type": "get_video_frames",
      "path": "rtcshare://rec/session.avi",
      "start_frame": 2,
      "end_frame": 9,
      "quality": 60
   });
   let err = service.handle_query(&query, &ctx).unwrap_err();
   assert!(matches!(err, QueryError::InvalidRange(_)));
}

#[test]
fn unknown_query_type_is_handler_failure() {
   let (_tmp, paths, service) = setup(5);
   let ctx = QueryContext { dir: "", user_id: None, paths: &paths };
   let err = service
      .handle_query(&json!({"type": "transcode", "path": "rtcshare://rec/session.avi"}), &ctx)
      .unwrap_err();
   assert_eq!(err.kind(), "HandlerFailure");
}

#[test]
fn path_checks_run_before_decoding() {
   let (_tmp, paths, service) = setup(5);
   let ctx = QueryContext { dir: "", user_id: None, paths: &paths };
   let err = service
      .handle_query(&json!({"type": "get_video_info", "path": "rtcshare://rec/../rec/session.avi"}), &ctx)
      .unwrap_err();
   assert!(matches!(err, QueryError::InvalidPath(_)));
}
