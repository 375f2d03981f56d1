//! Resource reference resolution and sandboxing.
//!
//! Every handler that touches the filesystem goes through [`PathResolver`].
//! A reference looks like `rtcshare://relative/path`, optionally starting with
//! the `$dir` macro which expands to the request's working directory. The
//! relative component is checked for `..` segments before any filesystem
//! access, then canonicalized and required to stay under the shared root.

use std::{
   fs, io,
   path::{Component, Path, PathBuf},
};

use crate::error::{ConfigError, QueryError, Result};

/// Scheme prefix marking a path inside the shared root.
pub const SCHEME: &str = "rtcshare://";

/// Placeholder substituted with the request's working directory.
pub const DIR_MACRO: &str = "$dir";

#[derive(Debug, Clone)]
pub struct PathResolver {
   root: PathBuf,
}

impl PathResolver {
   /// Creates a resolver for `root`, which must be an existing directory.
   pub fn new(root: impl AsRef<Path>) -> Result<Self> {
      let root = root.as_ref();
      let canonical = fs::canonicalize(root).map_err(|e| ConfigError::SharedRoot {
         path:   root.display().to_string(),
         reason: e.to_string(),
      })?;
      if !canonical.is_dir() {
         return Err(
            ConfigError::SharedRoot {
               path:   root.display().to_string(),
               reason: "not a directory".to_string(),
            }
            .into(),
         );
      }
      Ok(Self { root: canonical })
   }

   /// Canonical shared root.
   pub fn root(&self) -> &Path {
      &self.root
   }

   /// Resolves `reference` to an existing path under the shared root.
   pub fn resolve(&self, reference: &str, working_dir: &str) -> Result<PathBuf, QueryError> {
      let expanded = expand_dir_macro(reference, working_dir);
      let Some(rest) = expanded.strip_prefix(SCHEME) else {
         return Err(QueryError::InvalidPath(expanded));
      };

      let relative = rest.trim_start_matches(['/', '\\']);
      if has_parent_segment(relative) {
         return Err(QueryError::InvalidPath(expanded));
      }

      self.contain(self.root.join(relative), &expanded)
   }

   /// Resolves a member name (e.g. an array inside a group) below an already
   /// resolved directory, with the same traversal and containment rules.
   pub fn resolve_member(&self, base: &Path, name: &str) -> Result<PathBuf, QueryError> {
      let relative = name.trim_start_matches(['/', '\\']);
      if has_parent_segment(relative) || Path::new(relative).is_absolute() {
         return Err(QueryError::InvalidPath(name.to_string()));
      }
      self.contain(base.join(relative), name)
   }

   fn contain(&self, candidate: PathBuf, reference: &str) -> Result<PathBuf, QueryError> {
      if candidate
         .components()
         .any(|c| matches!(c, Component::ParentDir))
      {
         return Err(QueryError::InvalidPath(reference.to_string()));
      }

      let real = match fs::canonicalize(&candidate) {
         Ok(p) => p,
         Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(QueryError::NotFound(format!("File does not exist: {reference}")));
         },
         Err(e) => {
            tracing::debug!("canonicalize failed for {}: {e}", candidate.display());
            return Err(QueryError::InvalidPath(reference.to_string()));
         },
      };

      if !real.starts_with(&self.root) {
         tracing::warn!(
            "rejecting out-of-root reference (resolved to {}): {reference}",
            real.display()
         );
         return Err(QueryError::InvalidPath(reference.to_string()));
      }

      Ok(real)
   }
}

/// Expands a leading `$dir` macro. Anything else is returned unchanged.
pub fn expand_dir_macro(reference: &str, working_dir: &str) -> String {
   match reference.strip_prefix(DIR_MACRO) {
      Some(rest) => format!("{working_dir}/{rest}"),
      None => reference.to_string(),
   }
}

/// True when any `/`- or `\`-separated segment is exactly `..`.
pub fn has_parent_segment(relative: &str) -> bool {
   relative.split(['/', '\\']).any(|seg| seg == "..")
}
