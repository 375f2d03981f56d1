//! Chunk decompression: zlib, gzip and the Blosc container.

use std::io::Read;

use flate2::read::{GzDecoder, ZlibDecoder};

use super::meta::Compressor;
use crate::error::QueryError;

const BLOSC_HEADER_LEN: usize = 16;
const BLOSC_DOSHUFFLE: u8 = 0x1;
const BLOSC_MEMCPYED: u8 = 0x2;
const BLOSC_DOBITSHUFFLE: u8 = 0x4;
const BLOSC_DONT_SPLIT: u8 = 0x10;
const BLOSC_MAX_SPLITS: usize = 16;
const BLOSC_MIN_BUFFERSIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BloscCodec {
   BloscLz,
   Lz4,
   Snappy,
   Zlib,
   Zstd,
}

impl BloscCodec {
   fn from_flags(flags: u8) -> Result<Self, QueryError> {
      match (flags >> 5) & 0x7 {
         0 => Ok(Self::BloscLz),
         1 => Ok(Self::Lz4),
         2 => Ok(Self::Snappy),
         3 => Ok(Self::Zlib),
         4 => Ok(Self::Zstd),
         other => Err(QueryError::handler(format!("unknown blosc codec {other}"))),
      }
   }
}

/// Decompresses a stored chunk to exactly `expected` bytes.
pub fn decode_chunk(compressor: &Compressor, raw: Vec<u8>, expected: usize) -> Result<Vec<u8>, QueryError> {
   let decoded = match compressor {
      Compressor::None => raw,
      Compressor::Zlib => inflate(ZlibDecoder::new(raw.as_slice()), expected)?,
      Compressor::Gzip => inflate(GzDecoder::new(raw.as_slice()), expected)?,
      Compressor::Blosc => blosc_decompress(&raw, expected)?,
   };

   if decoded.len() != expected {
      return Err(QueryError::handler(format!(
         "decoded chunk has {} bytes, expected {expected}",
         decoded.len()
      )));
   }
   Ok(decoded)
}

fn inflate(reader: impl Read, expected: usize) -> Result<Vec<u8>, QueryError> {
   let mut out = Vec::with_capacity(expected);
   // one byte past `expected` is enough to report a size mismatch
   reader
      .take(expected as u64 + 1)
      .read_to_end(&mut out)
      .map_err(|e| QueryError::handler(format!("failed to decompress chunk: {e}")))?;
   Ok(out)
}

fn corrupt(what: &str) -> QueryError {
   QueryError::handler(format!("corrupt blosc chunk: {what}"))
}

fn read_u32(src: &[u8], at: usize) -> Result<usize, QueryError> {
   src.get(at..at + 4)
      .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
      .ok_or_else(|| corrupt("truncated"))
}

/// Decodes a Blosc 1.x frame whose header must declare `expected` bytes.
pub fn blosc_decompress(src: &[u8], expected: usize) -> Result<Vec<u8>, QueryError> {
   if src.len() < BLOSC_HEADER_LEN {
      return Err(corrupt("header too short"));
   }
   let flags = src[2];
   let typesize = usize::from(src[3]).max(1);
   let nbytes = read_u32(src, 4)?;
   let blocksize = read_u32(src, 8)?;
   let cbytes = read_u32(src, 12)?;
   if cbytes > src.len() {
      return Err(corrupt("cbytes exceeds buffer"));
   }
   if nbytes != expected {
      return Err(corrupt(&format!("nbytes mismatch: header says {nbytes}, chunk holds {expected}")));
   }

   if flags & BLOSC_MEMCPYED != 0 {
      return src
         .get(BLOSC_HEADER_LEN..BLOSC_HEADER_LEN + nbytes)
         .map(<[u8]>::to_vec)
         .ok_or_else(|| corrupt("truncated memcpy payload"));
   }
   if flags & BLOSC_DOBITSHUFFLE != 0 {
      return Err(QueryError::handler("unsupported blosc filter: bitshuffle"));
   }
   if nbytes == 0 {
      return Ok(Vec::new());
   }
   if blocksize == 0 {
      return Err(corrupt("zero blocksize"));
   }

   let codec = BloscCodec::from_flags(flags)?;
   let nblocks = nbytes.div_ceil(blocksize);
   let leftover = nbytes % blocksize;
   let shuffled = flags & BLOSC_DOSHUFFLE != 0 && typesize > 1;

   let mut out = vec![0u8; nbytes];
   let mut scratch = Vec::new();
   for block in 0..nblocks {
      let is_leftover = leftover > 0 && block == nblocks - 1;
      let bsize = if is_leftover { leftover } else { blocksize };
      let start = read_u32(src, BLOSC_HEADER_LEN + block * 4)?;

      let nstreams = if flags & BLOSC_DONT_SPLIT == 0
         && typesize <= BLOSC_MAX_SPLITS
         && blocksize / typesize >= BLOSC_MIN_BUFFERSIZE
         && !is_leftover
      {
         typesize
      } else {
         1
      };

      let dest = &mut out[block * blocksize..block * blocksize + bsize];
      if shuffled {
         scratch.resize(bsize, 0);
         decode_block(codec, src, start, nstreams, &mut scratch)?;
         unshuffle(typesize, &scratch, dest);
      } else {
         decode_block(codec, src, start, nstreams, dest)?;
      }
   }

   Ok(out)
}

fn decode_block(
   codec: BloscCodec,
   src: &[u8],
   mut pos: usize,
   nstreams: usize,
   dest: &mut [u8],
) -> Result<(), QueryError> {
   let neblock = dest.len() / nstreams;
   for stream in 0..nstreams {
      let csize = read_u32(src, pos)?;
      pos += 4;
      let data = src.get(pos..pos + csize).ok_or_else(|| corrupt("truncated stream"))?;
      pos += csize;

      let target = &mut dest[stream * neblock..(stream + 1) * neblock];
      if csize == neblock {
         target.copy_from_slice(data);
         continue;
      }

      let decoded = match codec {
         BloscCodec::Lz4 => lz4::block::decompress(data, Some(neblock as i32))
            .map_err(|e| QueryError::handler(format!("lz4 decompression failed: {e}")))?,
         BloscCodec::Zlib => inflate(ZlibDecoder::new(data), neblock)?,
         other => {
            return Err(QueryError::handler(format!("unsupported blosc codec: {other:?}")));
         },
      };
      if decoded.len() != neblock {
         return Err(corrupt("stream size mismatch"));
      }
      target.copy_from_slice(&decoded);
   }
   Ok(())
}

/// Inverse of Blosc's byte shuffle. Trailing bytes that do not fill a whole
/// element are stored unshuffled.
fn unshuffle(typesize: usize, src: &[u8], dest: &mut [u8]) {
   let neblem = src.len() / typesize;
   for i in 0..neblem {
      for j in 0..typesize {
         dest[i * typesize + j] = src[j * neblem + i];
      }
   }
   let tail = neblem * typesize;
   dest[tail..].copy_from_slice(&src[tail..]);
}
