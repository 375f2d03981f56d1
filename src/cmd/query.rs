//! `rtcshare query`: send one service query to a running broker.

use std::path::PathBuf;

use console::style;
use serde_json::Value;

use crate::{
   Error, Result,
   client::{self, split_jpeg_frames},
   config::Framing,
   error::ConfigError,
   ipc::{ReplyFrame, Request},
};

#[derive(Debug, Clone)]
pub struct QueryOptions {
   pub port:    u16,
   pub framing: Framing,
   pub service: String,
   pub query:   String,
   pub dir:     String,
   pub user_id: Option<String>,
   /// Where to write the binary payload. Printed as a size summary otherwise.
   pub out:     Option<PathBuf>,
}

pub async fn execute(opts: QueryOptions) -> Result<()> {
   let query: Value = serde_json::from_str(&opts.query)
      .map_err(|e| ConfigError::Invalid(format!("--query is not valid JSON: {e}")))?;
   let request = Request::service_query(opts.service.as_str(), query, opts.dir, opts.user_id);

   let reply = client::send_request(opts.port, opts.framing, &request).await?;
   let (result, payload) = match reply {
      ReplyFrame::Result { result, payload } => (result, payload),
      ReplyFrame::Failure(message) => return Err(Error::Broker(message)),
   };

   println!("{}", serde_json::to_string_pretty(&result)?);

   if result.get("success") == Some(&Value::Bool(false)) {
      eprintln!("{}", style("query failed").red());
   }

   if payload.is_empty() {
      return Ok(());
   }

   if let Some(path) = opts.out {
      std::fs::write(&path, &payload)?;
      println!("Wrote {} bytes to {}", payload.len(), style(path.display()).cyan());
   } else if opts.service == "video" && let Some(frames) = split_jpeg_frames(&payload) {
      println!("Payload: {} bytes, {} JPEG frames", payload.len(), style(frames.len()).cyan());
   } else {
      println!("Payload: {} bytes", payload.len());
   }
   Ok(())
}
