//! Requesting side of the protocol, used by `rtcshare query` and the tests.

use crate::{
   Result,
   config::Framing,
   ipc::{self, ReplyFrame, Request},
   socket::Stream,
};

/// Upper bound on a single reply frame in length-prefixed mode.
pub const MAX_REPLY_FRAME: usize = 1 << 30;

/// Connects to the broker on `port`, sends `request` and reads the whole reply.
pub async fn send_request(port: u16, framing: Framing, request: &Request) -> Result<ReplyFrame> {
   let mut stream = Stream::connect(port).await?;
   ipc::write_request(&mut stream, framing, request).await?;
   ipc::read_reply(&mut stream, framing, MAX_REPLY_FRAME).await
}

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;

/// Splits a run of concatenated JPEG images at their EOI markers.
///
/// Walks the marker segments of each image, then scans the entropy-coded data
/// after SOS, skipping stuffed `FF 00` bytes and restart markers, until EOI.
/// Returns `None` if the run is not a sequence of complete JPEG images.
pub fn split_jpeg_frames(data: &[u8]) -> Option<Vec<&[u8]>> {
   let mut frames = Vec::new();
   let mut pos = 0;
   while pos < data.len() {
      let len = jpeg_len(&data[pos..])?;
      frames.push(&data[pos..pos + len]);
      pos += len;
   }
   Some(frames)
}

/// Length of the JPEG image at the start of `data`.
fn jpeg_len(data: &[u8]) -> Option<usize> {
   if data.get(..2)? != [0xFF, SOI] {
      return None;
   }
   let mut pos = 2;

   loop {
      if *data.get(pos)? != 0xFF {
         return None;
      }
      let mut marker = *data.get(pos + 1)?;
      // fill bytes
      while marker == 0xFF {
         pos += 1;
         marker = *data.get(pos + 1)?;
      }
      pos += 2;

      match marker {
         EOI => return Some(pos),
         0xD0..=0xD7 | 0x01 => {},
         _ => {
            let seg_len = usize::from(u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]));
            pos += seg_len;
            if marker == SOS {
               pos = skip_entropy_data(data, pos)?;
            }
         },
      }
   }
}

/// Position of the next marker that ends entropy-coded data.
fn skip_entropy_data(data: &[u8], mut pos: usize) -> Option<usize> {
   loop {
      let offset = memchr::memchr(0xFF, data.get(pos..)?)?;
      pos += offset;
      match *data.get(pos + 1)? {
         0x00 | 0xD0..=0xD7 => pos += 2,
         _ => return Some(pos),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn tiny_jpeg(shade: u8) -> Vec<u8> {
      let img = image::RgbImage::from_pixel(9, 7, image::Rgb([shade, 255 - shade, 40]));
      crate::video::encode_jpeg(&img, 75).unwrap()
   }

   #[test]
   fn splits_concatenated_images() {
      let blobs: Vec<Vec<u8>> = [0u8, 90, 180].iter().map(|&s| tiny_jpeg(s)).collect();
      let run = blobs.concat();
      let frames = split_jpeg_frames(&run).unwrap();
      assert_eq!(frames.len(), 3);
      for (frame, blob) in frames.iter().zip(&blobs) {
         assert_eq!(*frame, blob.as_slice());
      }
   }

   #[test]
   fn empty_run_has_no_frames() {
      assert_eq!(split_jpeg_frames(&[]).unwrap().len(), 0);
   }

   #[test]
   fn truncated_image_is_rejected() {
      let blob = tiny_jpeg(10);
      assert!(split_jpeg_frames(&blob[..blob.len() - 1]).is_none());
   }
}
