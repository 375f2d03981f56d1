//! Connection server: accept loop and one-request-per-connection handling.

use std::{net::SocketAddr, time::Duration};

use tokio::{
   io::{AsyncRead, AsyncWrite, AsyncWriteExt},
   sync::watch,
   task::JoinHandle,
};
use tracing::Instrument;

use crate::{
   config::{Config, Framing},
   dispatch::{Dispatcher, Reply},
   error::{IpcError, QueryError},
   ipc::{self, FrameLimits, SocketBuffer},
   socket::{Listener, Stream},
};

/// Per-connection settings
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
   pub framing: Framing,
   pub limits:  FrameLimits,
}

impl Default for ServerOptions {
   fn default() -> Self {
      Self::from_config(&Config::default())
   }
}

impl ServerOptions {
   pub const fn from_config(cfg: &Config) -> Self {
      Self {
         framing: cfg.framing,
         limits:  FrameLimits {
            read_chunk_bytes:  cfg.read_chunk_bytes,
            max_request_bytes: cfg.max_request_bytes,
         },
      }
   }
}

/// Request timeout from configuration; `0` disables it.
pub fn request_timeout(cfg: &Config) -> Option<Duration> {
   (cfg.request_timeout_ms > 0).then(|| Duration::from_millis(cfg.request_timeout_ms))
}

/// Spawns the accept loop. It runs until `shutdown` flips to `true` or its
/// sender is dropped, then drops the listener. Connection tasks are detached.
pub fn spawn(
   listener: Listener,
   dispatcher: Dispatcher,
   options: ServerOptions,
   mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      loop {
         tokio::select! {
            result = listener.accept() => {
               match result {
                  Ok((stream, peer)) => {
                     let dispatcher = dispatcher.clone();
                     let span = tracing::info_span!("conn", %peer, service = tracing::field::Empty);
                     tokio::spawn(handle_connection(stream, peer, dispatcher, options).instrument(span));
                  }
                  Err(e) => {
                     tracing::error!("Accept error: {}", e);
                  }
               }
            }
            changed = shutdown.changed() => {
               if changed.is_err() || *shutdown.borrow() {
                  break;
               }
            }
         }
      }
      tracing::debug!("accept loop stopped on port {}", listener.port());
   })
}

async fn handle_connection(mut stream: Stream, peer: SocketAddr, dispatcher: Dispatcher, options: ServerOptions) {
   tracing::trace!("accepted {peer}");
   if let Err(e) = serve_one(&mut stream, &dispatcher, options).await {
      tracing::debug!("connection error: {}", e);
   }
   let _ = stream.shutdown().await;
}

/// Reads one request from `io`, answers it and flushes. Generic over the
/// transport so it can run against in-memory pipes.
pub async fn serve_one<S>(io: &mut S, dispatcher: &Dispatcher, options: ServerOptions) -> crate::Result<()>
where
   S: AsyncRead + AsyncWrite + Unpin,
{
   let mut buffer = SocketBuffer::new();

   let reply = match buffer.recv_request(io, options.framing, options.limits).await {
      Ok(Some(body)) => dispatcher.handle(body).await,
      Ok(None) => {
         tracing::trace!("peer closed without sending a request");
         return Ok(());
      },
      Err(crate::Error::Ipc(e @ (IpcError::UnexpectedEof(_) | IpcError::MessageTooLarge(_)))) => {
         let err = QueryError::MalformedRequest(e.to_string());
         tracing::warn!("{err}");
         Reply::FramingError(err.to_string())
      },
      Err(e) => return Err(e),
   };

   match reply {
      Reply::Result(reply) => {
         ipc::write_reply(io, options.framing, &reply.result, &reply.payload).await?;
      },
      Reply::FramingError(message) => {
         ipc::write_failure(io, options.framing, &message).await?;
      },
   }

   io.shutdown().await.map_err(IpcError::Write)?;
   Ok(())
}
