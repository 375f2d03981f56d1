//! Decode-position bookkeeping shared by seeking decoders.

use crate::error::QueryError;

/// Tracks which frame index the decoder will hand out next and which frames
/// to drop while catching up to a seek target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameCursor {
   /// Index of the next decoded frame, when known.
   position: Option<u64>,
   /// Frames before this index are dropped.
   target:   Option<u64>,
}

impl Default for FrameCursor {
   fn default() -> Self {
      Self::new()
   }
}

impl FrameCursor {
   pub const fn new() -> Self {
      Self { position: Some(0), target: None }
   }

   /// The next decoded frame is already `frame`.
   pub fn is_at(&self, frame: u64) -> bool {
      self.target.is_none() && self.position == Some(frame)
   }

   /// Catches up to `frame` by counting decoded frames, without a container
   /// seek. Only possible forward from a known position.
   pub fn skip_to(&mut self, frame: u64) -> Result<(), QueryError> {
      match self.position {
         Some(pos) if pos <= frame => {
            self.target = (frame > pos).then_some(frame);
            Ok(())
         },
         _ => Err(QueryError::handler(format!(
            "cannot seek to frame {frame} in a stream without a usable frame rate"
         ))),
      }
   }

   /// After a container seek the position is unknown until a timestamped
   /// frame arrives.
   pub fn reposition(&mut self, frame: u64) {
      self.position = None;
      self.target = Some(frame);
   }

   /// Accounts for one decoded frame whose timestamp maps to `stamped`, and
   /// returns whether it belongs to the output.
   pub fn admit(&mut self, stamped: Option<u64>) -> Result<bool, QueryError> {
      let index = stamped.or(self.position);
      self.position = index.map(|i| i + 1);

      match (self.target, index) {
         (None, _) => Ok(true),
         (Some(target), Some(i)) if i < target => Ok(false),
         (Some(_), Some(_)) => {
            self.target = None;
            Ok(true)
         },
         (Some(target), None) => Err(QueryError::handler(format!(
            "cannot locate frame {target}: decoded frame carries no timestamp"
         ))),
      }
   }
}
