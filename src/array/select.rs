//! Slice normalization and chunk-wise assembly of the selected region.

use std::{fs, io, path::Path};

use ndarray::{ArrayD, ArrayViewD, IxDyn, ShapeBuilder, Slice};
use serde::{Deserialize, Serialize};

use super::{
   codec::decode_chunk,
   meta::{ArrayMetadata, MemoryOrder},
};
use crate::error::QueryError;

/// One dimension of a selection, with Python slice semantics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
   #[serde(default)]
   pub start: Option<i64>,
   #[serde(default)]
   pub stop:  Option<i64>,
   #[serde(default)]
   pub step:  Option<i64>,
}

impl SliceSpec {
   pub const fn new(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Self {
      Self { start, stop, step }
   }

   /// The whole dimension
   pub const fn full() -> Self {
      Self { start: None, stop: None, step: None }
   }

   /// Clamps against a dimension of length `len`.
   pub fn normalize(&self, len: usize) -> Result<DimSelection, QueryError> {
      let step = self.step.unwrap_or(1);
      if step < 1 {
         return Err(QueryError::InvalidRange(format!("slice step must be positive, got {step}")));
      }

      let len = len as i64;
      let clamp = |bound: Option<i64>, default: i64| -> i64 {
         match bound {
            None => default,
            Some(v) if v < 0 => (v + len).max(0),
            Some(v) => v.min(len),
         }
      };
      let start = clamp(self.start, 0);
      let stop = clamp(self.stop, len);
      let count = if stop > start { (stop - start - 1) / step + 1 } else { 0 };

      Ok(DimSelection { first: start as usize, step: step as usize, count: count as usize })
   }
}

/// Selected elements along one dimension: `first + k * step` for `k < count`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimSelection {
   pub first: usize,
   pub step:  usize,
   pub count: usize,
}

impl DimSelection {
   fn last(&self) -> usize {
      self.first + (self.count - 1) * self.step
   }

   /// Output positions `[lo, hi)` that fall inside `[begin, end)` of the
   /// source dimension.
   fn overlap(&self, begin: usize, end: usize) -> (usize, usize) {
      let lo = if begin > self.first {
         (begin - self.first).div_ceil(self.step)
      } else {
         0
      };
      let hi = (end.saturating_sub(self.first)).div_ceil(self.step).min(self.count);
      (lo, hi)
   }
}

/// Row-major, native-endian bytes of the selected sub-array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
   pub shape: Vec<usize>,
   pub bytes: Vec<u8>,
}

/// Reads the region selected by `slices` from the array stored in `dir`.
pub fn read_selection(dir: &Path, meta: &ArrayMetadata, slices: &[SliceSpec]) -> Result<Selection, QueryError> {
   if slices.len() != meta.rank() {
      return Err(QueryError::InvalidRange(format!(
         "expected {} slices for a rank-{} array, got {}",
         meta.rank(),
         meta.rank(),
         slices.len()
      )));
   }

   let dims = slices
      .iter()
      .zip(&meta.shape)
      .map(|(spec, &len)| spec.normalize(len))
      .collect::<Result<Vec<_>, _>>()?;
   let out_shape: Vec<usize> = dims.iter().map(|d| d.count).collect();
   let itemsize = meta.dtype.itemsize;

   let total = out_shape
      .iter()
      .try_fold(itemsize, |acc, &n| acc.checked_mul(n))
      .ok_or_else(|| QueryError::InvalidRange("selection is too large".to_string()))?;

   let mut out = ArrayD::<u8>::zeros(IxDyn(&with_item_axis(&out_shape, itemsize)));
   if total > 0 {
      let grid: Vec<(usize, usize)> = dims
         .iter()
         .zip(&meta.chunks)
         .map(|(d, &c)| (d.first / c, d.last() / c))
         .collect();

      let mut visited = 0usize;
      for_each_index(&grid, |chunk_index| {
         visited += 1;
         copy_chunk(dir, meta, &dims, chunk_index, &mut out)
      })?;
      tracing::debug!("assembled {total} bytes from {visited} chunks");
   }

   if !out.is_standard_layout() {
      out = out.as_standard_layout().into_owned();
   }
   let (bytes, _) = out.into_raw_vec_and_offset();
   Ok(Selection { shape: out_shape, bytes })
}

fn with_item_axis(shape: &[usize], itemsize: usize) -> Vec<usize> {
   let mut dims = shape.to_vec();
   dims.push(itemsize);
   dims
}

/// Visits every index in the inclusive per-axis ranges of `grid`, last axis
/// fastest. A rank-0 grid yields one empty index.
fn for_each_index(
   grid: &[(usize, usize)],
   mut f: impl FnMut(&[usize]) -> Result<(), QueryError>,
) -> Result<(), QueryError> {
   let mut index: Vec<usize> = grid.iter().map(|&(lo, _)| lo).collect();
   loop {
      f(&index)?;

      let mut axis = grid.len();
      loop {
         if axis == 0 {
            return Ok(());
         }
         axis -= 1;
         if index[axis] < grid[axis].1 {
            index[axis] += 1;
            break;
         }
         index[axis] = grid[axis].0;
      }
   }
}

fn copy_chunk(
   dir: &Path,
   meta: &ArrayMetadata,
   dims: &[DimSelection],
   chunk_index: &[usize],
   out: &mut ArrayD<u8>,
) -> Result<(), QueryError> {
   let rank = dims.len();

   // (output lo, output hi, offset of first selected element inside the chunk)
   let mut spans = Vec::with_capacity(rank);
   for ((dim, &c), &ci) in dims.iter().zip(&meta.chunks).zip(chunk_index) {
      let begin = ci * c;
      let (lo, hi) = dim.overlap(begin, begin + c);
      if lo >= hi {
         return Ok(());
      }
      spans.push((lo, hi, dim.first + lo * dim.step - begin));
   }

   let bytes = load_chunk(dir, meta, chunk_index)?;
   let itemsize = meta.dtype.itemsize;
   let shape = with_item_axis(&meta.chunks, itemsize);
   let strides = chunk_strides(&meta.chunks, itemsize, meta.order);
   let view = ArrayViewD::from_shape(IxDyn(&shape).strides(IxDyn(&strides)), &bytes)
      .map_err(|e| QueryError::handler(format!("chunk layout mismatch: {e}")))?;

   let src = view.slice_each_axis(|desc| {
      let axis = desc.axis.index();
      if axis == rank {
         return Slice::from(..);
      }
      let (lo, hi, offset) = spans[axis];
      let step = dims[axis].step;
      let end = offset + (hi - lo - 1) * step + 1;
      Slice::new(offset as isize, Some(end as isize), step as isize)
   });

   let mut dst = out.slice_each_axis_mut(|desc| {
      let axis = desc.axis.index();
      if axis == rank {
         return Slice::from(..);
      }
      let (lo, hi, _) = spans[axis];
      Slice::new(lo as isize, Some(hi as isize), 1)
   });
   dst.assign(&src);
   Ok(())
}

/// Byte strides of a chunk viewed as `chunks + [itemsize]`.
fn chunk_strides(chunks: &[usize], itemsize: usize, order: MemoryOrder) -> Vec<usize> {
   let mut strides = vec![0; chunks.len() + 1];
   strides[chunks.len()] = 1;
   match order {
      MemoryOrder::C => {
         let mut acc = itemsize;
         for axis in (0..chunks.len()).rev() {
            strides[axis] = acc;
            acc *= chunks[axis];
         }
      },
      MemoryOrder::F => {
         let mut acc = itemsize;
         for axis in 0..chunks.len() {
            strides[axis] = acc;
            acc *= chunks[axis];
         }
      },
   }
   strides
}

/// Decoded, native-order bytes of one chunk. Absent chunks are filled.
fn load_chunk(dir: &Path, meta: &ArrayMetadata, chunk_index: &[usize]) -> Result<Vec<u8>, QueryError> {
   let key = meta.chunk_key(chunk_index);
   let expected = meta.chunk_bytes();

   match fs::read(dir.join(&key)) {
      Ok(raw) => {
         let mut bytes = decode_chunk(&meta.compressor, raw, expected)
            .map_err(|e| QueryError::handler(format!("chunk {key}: {e}")))?;
         meta.dtype.to_native(&mut bytes);
         Ok(bytes)
      },
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
         tracing::trace!("chunk {key} missing, using fill value");
         Ok(meta.fill.repeat(expected / meta.dtype.itemsize))
      },
      Err(e) => Err(QueryError::handler(format!("failed to read chunk {key}: {e}"))),
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn sel(start: Option<i64>, stop: Option<i64>, step: Option<i64>, len: usize) -> DimSelection {
      SliceSpec::new(start, stop, step).normalize(len).unwrap()
   }

   #[test]
   fn python_slice_defaults() {
      assert_eq!(sel(None, None, None, 10), DimSelection { first: 0, step: 1, count: 10 });
      assert_eq!(sel(Some(-3), None, None, 10), DimSelection { first: 7, step: 1, count: 3 });
      assert_eq!(sel(Some(2), Some(100), Some(3), 10), DimSelection { first: 2, step: 3, count: 3 });
      assert_eq!(sel(Some(5), Some(2), None, 10).count, 0);
      assert_eq!(sel(Some(-20), Some(-8), None, 10), DimSelection { first: 0, step: 1, count: 2 });
   }

   #[test]
   fn huge_step_selects_first_element() {
      assert_eq!(sel(None, None, Some(i64::MAX), 10), DimSelection { first: 0, step: i64::MAX as usize, count: 1 });
      assert_eq!(sel(Some(3), None, Some(11), 10), DimSelection { first: 3, step: 11, count: 1 });
      assert_eq!(sel(Some(-1), Some(i64::MAX), Some(i64::MAX), 10).count, 1);
      assert_eq!(sel(Some(i64::MIN), Some(i64::MIN), Some(i64::MAX), 10).count, 0);
   }

   #[test]
   fn non_positive_step_is_invalid_range() {
      for step in [0, -1] {
         let err = SliceSpec::new(None, None, Some(step)).normalize(4).unwrap_err();
         assert_eq!(err.kind(), "InvalidRange");
      }
   }

   #[test]
   fn overlap_with_step() {
      // elements 1, 4, 7, 10 against chunks of 4
      let d = DimSelection { first: 1, step: 3, count: 4 };
      assert_eq!(d.overlap(0, 4), (0, 1));
      assert_eq!(d.overlap(4, 8), (1, 3));
      assert_eq!(d.overlap(8, 12), (3, 4));
   }

   #[test]
   fn chunk_strides_by_order() {
      assert_eq!(chunk_strides(&[2, 3], 4, MemoryOrder::C), vec![12, 4, 1]);
      assert_eq!(chunk_strides(&[2, 3], 4, MemoryOrder::F), vec![4, 8, 1]);
   }

   #[test]
   fn index_walk_covers_grid() {
      let mut seen = Vec::new();
      for_each_index(&[(0, 1), (2, 3)], |i| {
         seen.push(i.to_vec());
         Ok(())
      })
      .unwrap();
      assert_eq!(seen, vec![vec![0, 2], vec![0, 3], vec![1, 2], vec![1, 3]]);

      let mut calls = 0;
      for_each_index(&[], |_| {
         calls += 1;
         Ok(())
      })
      .unwrap();
      assert_eq!(calls, 1);
   }
}
