//! Chunked on-disk array extraction (Zarr v2 directory stores).
//!
//! A group directory holds arrays addressed by (possibly nested) names; each
//! array directory carries `.zarray` metadata and one file per chunk. Only the
//! chunks touched by a selection are read. Returned bytes are row-major and
//! native-endian with no header.

pub mod codec;
pub mod meta;
pub mod select;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub use self::{
   meta::{ArrayMetadata, DType},
   select::{Selection, SliceSpec},
};
use crate::{
   error::QueryError,
   path::PathResolver,
   service::{QueryContext, Service, ServiceReply},
};

/// Element type and full shape of an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayInfo {
   pub dtype: String,
   pub shape: Vec<usize>,
}

/// An array opened from a group directory
#[derive(Debug)]
pub struct ZarrArray {
   dir:  PathBuf,
   meta: ArrayMetadata,
}

impl ZarrArray {
   /// Opens `name` inside `group`. An empty name addresses the group path
   /// itself.
   pub fn open(paths: &PathResolver, group: &Path, name: &str) -> Result<Self, QueryError> {
      let dir = if name.is_empty() {
         group.to_path_buf()
      } else {
         paths.resolve_member(group, name).map_err(|e| match e {
            QueryError::NotFound(_) => QueryError::NotFound(format!("Array does not exist: {name}")),
            other => other,
         })?
      };
      let meta = ArrayMetadata::load(&dir, name)?;
      Ok(Self { dir, meta })
   }

   pub fn info(&self) -> ArrayInfo {
      ArrayInfo { dtype: self.meta.dtype.numpy_name(), shape: self.meta.shape.clone() }
   }

   pub fn read(&self, slices: &[SliceSpec]) -> Result<Selection, QueryError> {
      select::read_selection(&self.dir, &self.meta, slices)
   }
}

/// Reads metadata only.
pub fn get_info(paths: &PathResolver, group: &Path, name: &str) -> Result<ArrayInfo, QueryError> {
   Ok(ZarrArray::open(paths, group, name)?.info())
}

/// Reads the selected region of an array.
pub fn get_chunk(
   paths: &PathResolver,
   group: &Path,
   name: &str,
   slices: &[SliceSpec],
) -> Result<(ArrayInfo, Selection), QueryError> {
   let array = ZarrArray::open(paths, group, name)?;
   tracing::info!("reading {} slices from array {name} in {}", slices.len(), group.display());
   let selection = array.read(slices)?;
   Ok((array.info(), selection))
}

/// Queries accepted by the built-in `array` service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArrayQuery {
   GetArrayInfo {
      path: String,
      #[serde(default)]
      name: String,
   },
   GetArrayChunk {
      path:   String,
      #[serde(default)]
      name:   String,
      slices: Vec<SliceSpec>,
   },
}

/// Built-in `array` service
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrayService;

impl Service for ArrayService {
   fn handle_query(&self, query: &Value, ctx: &QueryContext<'_>) -> Result<ServiceReply, QueryError> {
      let query: ArrayQuery = serde_json::from_value(query.clone())
         .map_err(|e| QueryError::handler(format!("Invalid array query: {e}")))?;

      match query {
         ArrayQuery::GetArrayInfo { path, name } => {
            let group = ctx.resolve(&path)?;
            let info = get_info(ctx.paths, &group, &name)?;
            Ok(ServiceReply::result(json!({
               "success": true,
               "dtype": info.dtype,
               "shape": info.shape,
            })))
         },
         ArrayQuery::GetArrayChunk { path, name, slices } => {
            let group = ctx.resolve(&path)?;
            let (info, selection) = get_chunk(ctx.paths, &group, &name, &slices)?;
            let result = json!({
               "success": true,
               "dtype": info.dtype,
               "shape": info.shape,
               "slice_shape": selection.shape,
            });
            Ok(ServiceReply::new(result, selection.bytes))
         },
      }
   }
}
