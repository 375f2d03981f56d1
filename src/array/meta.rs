//! `.zarray` metadata (Zarr v2).

use std::{fs, io, path::Path};

use serde::Deserialize;
use serde_json::Value;

use crate::error::QueryError;

pub const METADATA_FILE: &str = ".zarray";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
   Little,
   Big,
   /// Single-byte types (`|`).
   NotApplicable,
}

impl ByteOrder {
   pub const fn needs_swap(self) -> bool {
      match self {
         Self::Little => cfg!(target_endian = "big"),
         Self::Big => cfg!(target_endian = "little"),
         Self::NotApplicable => false,
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DTypeKind {
   Bool,
   Int,
   UInt,
   Float,
   Complex,
}

/// Element type parsed from a NumPy typestr such as `<f4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DType {
   pub order:    ByteOrder,
   pub kind:     DTypeKind,
   pub itemsize: usize,
}

impl DType {
   pub fn parse(typestr: &str) -> Result<Self, QueryError> {
      let unsupported = || QueryError::handler(format!("unsupported dtype: {typestr}"));

      let mut chars = typestr.chars();
      let order = match chars.next() {
         Some('<') => ByteOrder::Little,
         Some('>') => ByteOrder::Big,
         Some('|') => ByteOrder::NotApplicable,
         _ => return Err(unsupported()),
      };
      let kind = match chars.next() {
         Some('b') => DTypeKind::Bool,
         Some('i') => DTypeKind::Int,
         Some('u') => DTypeKind::UInt,
         Some('f') => DTypeKind::Float,
         Some('c') => DTypeKind::Complex,
         _ => return Err(unsupported()),
      };
      let itemsize: usize = chars.as_str().parse().map_err(|_| unsupported())?;

      let valid = match kind {
         DTypeKind::Bool => itemsize == 1,
         DTypeKind::Int | DTypeKind::UInt => matches!(itemsize, 1 | 2 | 4 | 8),
         DTypeKind::Float => matches!(itemsize, 2 | 4 | 8),
         DTypeKind::Complex => matches!(itemsize, 8 | 16),
      };
      if !valid {
         return Err(unsupported());
      }

      Ok(Self { order, kind, itemsize })
   }

   /// NumPy name of the type (`float32`, `uint8`, `bool`, ...).
   pub fn numpy_name(&self) -> String {
      let bits = self.itemsize * 8;
      match self.kind {
         DTypeKind::Bool => "bool".to_string(),
         DTypeKind::Int => format!("int{bits}"),
         DTypeKind::UInt => format!("uint{bits}"),
         DTypeKind::Float => format!("float{bits}"),
         DTypeKind::Complex => format!("complex{bits}"),
      }
   }

   /// Width of the unit that gets byte-swapped; complex values swap each half.
   const fn swap_width(&self) -> usize {
      match self.kind {
         DTypeKind::Complex => self.itemsize / 2,
         _ => self.itemsize,
      }
   }

   /// Converts stored-order element bytes to native order in place.
   pub fn to_native(&self, bytes: &mut [u8]) {
      let width = self.swap_width();
      if width > 1 && self.order.needs_swap() {
         for unit in bytes.chunks_exact_mut(width) {
            unit.reverse();
         }
      }
   }

   /// Native-order bytes of one element holding `fill_value`.
   pub fn fill_bytes(&self, fill_value: &Value) -> Result<Vec<u8>, QueryError> {
      let bad = || QueryError::handler(format!("unsupported fill_value {fill_value} for {}", self.numpy_name()));

      if fill_value.is_null() {
         return Ok(vec![0; self.itemsize]);
      }

      match self.kind {
         DTypeKind::Bool => {
            let v = match fill_value {
               Value::Bool(b) => *b,
               Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
               _ => return Err(bad()),
            };
            Ok(vec![u8::from(v)])
         },
         DTypeKind::Int => {
            let v = fill_value.as_i64().ok_or_else(bad)?;
            Ok(v.to_ne_bytes()[native_low_range(self.itemsize)].to_vec())
         },
         DTypeKind::UInt => {
            let v = fill_value.as_u64().ok_or_else(bad)?;
            Ok(v.to_ne_bytes()[native_low_range(self.itemsize)].to_vec())
         },
         DTypeKind::Float => float_bytes(self.itemsize, float_value(fill_value).ok_or_else(bad)?)
            .ok_or_else(bad),
         DTypeKind::Complex => {
            let half = self.itemsize / 2;
            let (re, im) = match fill_value {
               Value::Array(parts) if parts.len() == 2 => (
                  float_value(&parts[0]).ok_or_else(bad)?,
                  float_value(&parts[1]).ok_or_else(bad)?,
               ),
               other => (float_value(other).ok_or_else(bad)?, 0.0),
            };
            let mut out = float_bytes(half, re).ok_or_else(bad)?;
            out.extend(float_bytes(half, im).ok_or_else(bad)?);
            Ok(out)
         },
      }
   }
}

/// Byte range holding the low `size` bytes of a native-endian `u64`.
const fn native_low_range(size: usize) -> std::ops::Range<usize> {
   if cfg!(target_endian = "little") { 0..size } else { 8 - size..8 }
}

fn float_value(v: &Value) -> Option<f64> {
   match v {
      Value::Number(n) => n.as_f64(),
      Value::String(s) => match s.as_str() {
         "NaN" => Some(f64::NAN),
         "Infinity" => Some(f64::INFINITY),
         "-Infinity" => Some(f64::NEG_INFINITY),
         _ => None,
      },
      _ => None,
   }
}

fn float_bytes(size: usize, v: f64) -> Option<Vec<u8>> {
   match size {
      4 => Some((v as f32).to_ne_bytes().to_vec()),
      8 => Some(v.to_ne_bytes().to_vec()),
      // half precision fills other than zero are not supported
      2 if v == 0.0 => Some(vec![0; 2]),
      _ => None,
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOrder {
   C,
   F,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compressor {
   None,
   Zlib,
   Gzip,
   Blosc,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
   zarr_format:         u8,
   shape:               Vec<usize>,
   chunks:              Vec<usize>,
   dtype:               Value,
   compressor:          Option<Value>,
   #[serde(default)]
   fill_value:          Value,
   order:               String,
   #[serde(default)]
   filters:             Option<Vec<Value>>,
   #[serde(default)]
   dimension_separator: Option<String>,
}

/// Parsed and validated array metadata
#[derive(Debug, Clone)]
pub struct ArrayMetadata {
   pub shape:      Vec<usize>,
   pub chunks:     Vec<usize>,
   pub dtype:      DType,
   pub compressor: Compressor,
   /// Native-order bytes of one fill element.
   pub fill:       Vec<u8>,
   pub order:      MemoryOrder,
   pub separator:  String,
}

impl ArrayMetadata {
   /// Reads `<dir>/.zarray`. A missing file means the array does not exist.
   pub fn load(dir: &Path, name: &str) -> Result<Self, QueryError> {
      let raw = match fs::read(dir.join(METADATA_FILE)) {
         Ok(raw) => raw,
         Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(QueryError::NotFound(format!("Array does not exist: {name}")));
         },
         Err(e) => return Err(QueryError::handler(format!("failed to read metadata for {name}: {e}"))),
      };
      Self::parse(&raw)
   }

   pub fn parse(raw: &[u8]) -> Result<Self, QueryError> {
      let raw: RawMetadata = serde_json::from_slice(raw)
         .map_err(|e| QueryError::handler(format!("invalid {METADATA_FILE}: {e}")))?;

      if raw.zarr_format != 2 {
         return Err(QueryError::handler(format!("unsupported zarr_format: {}", raw.zarr_format)));
      }
      if raw.shape.len() != raw.chunks.len() {
         return Err(QueryError::handler("shape and chunks have different ranks"));
      }
      if raw.chunks.contains(&0) {
         return Err(QueryError::handler("chunk extents must be positive"));
      }
      if raw.filters.as_ref().is_some_and(|f| !f.is_empty()) {
         return Err(QueryError::handler("unsupported metadata: filters"));
      }

      let dtype = match &raw.dtype {
         Value::String(s) => DType::parse(s)?,
         other => return Err(QueryError::handler(format!("unsupported dtype: {other}"))),
      };

      let order = match raw.order.as_str() {
         "C" => MemoryOrder::C,
         "F" => MemoryOrder::F,
         other => return Err(QueryError::handler(format!("unsupported order: {other}"))),
      };

      let compressor = match &raw.compressor {
         None | Some(Value::Null) => Compressor::None,
         Some(spec) => match spec.get("id").and_then(Value::as_str) {
            Some("zlib") => Compressor::Zlib,
            Some("gzip") => Compressor::Gzip,
            Some("blosc") => Compressor::Blosc,
            Some(id) => return Err(QueryError::handler(format!("unsupported compressor: {id}"))),
            None => return Err(QueryError::handler("compressor without id")),
         },
      };

      let separator = raw.dimension_separator.unwrap_or_else(|| ".".to_string());
      if separator != "." && separator != "/" {
         return Err(QueryError::handler(format!("unsupported dimension_separator: {separator}")));
      }

      let fill = dtype.fill_bytes(&raw.fill_value)?;

      Ok(Self {
         shape: raw.shape,
         chunks: raw.chunks,
         dtype,
         compressor,
         fill,
         order,
         separator,
      })
   }

   pub fn rank(&self) -> usize {
      self.shape.len()
   }

   /// Bytes in one decoded chunk.
   pub fn chunk_bytes(&self) -> usize {
      self.chunks.iter().product::<usize>() * self.dtype.itemsize
   }

   /// Store key of the chunk at grid position `index`.
   pub fn chunk_key(&self, index: &[usize]) -> String {
      if index.is_empty() {
         return "0".to_string();
      }
      index
         .iter()
         .map(usize::to_string)
         .collect::<Vec<_>>()
         .join(&self.separator)
   }
}
