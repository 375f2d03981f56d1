//! Loopback TCP listener and stream for the collaborator link.
//!
//! The broker binds an ephemeral port on 127.0.0.1; the chosen port is handed
//! to the collaborator through its environment.

use std::{
   io,
   net::{Ipv4Addr, SocketAddr},
   pin::Pin,
   task::{self, Poll},
};

use tokio::{
   io::ReadBuf,
   net::{TcpListener as TokioTcpListener, TcpStream as TokioTcpStream},
};

use crate::Result;

/// Errors that can occur during socket operations
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
   #[error("failed to connect: {0}")]
   Connect(#[source] io::Error),

   #[error("failed to bind: {0}")]
   Bind(#[source] io::Error),

   #[error("accept failed: {0}")]
   Accept(#[source] io::Error),
}

/// TCP listener bound to the loopback interface
pub struct Listener {
   inner: TokioTcpListener,
   port:  u16,
}

impl Listener {
   /// Binds to `port` on localhost; `0` picks an ephemeral port
   pub async fn bind(port: u16) -> Result<Self> {
      let inner = TokioTcpListener::bind((Ipv4Addr::LOCALHOST, port))
         .await
         .map_err(SocketError::Bind)?;

      let port = inner.local_addr().map_err(SocketError::Bind)?.port();

      Ok(Self { inner, port })
   }

   /// Accepts an incoming connection
   pub async fn accept(&self) -> Result<(Stream, SocketAddr)> {
      let (stream, peer) = self.inner.accept().await.map_err(SocketError::Accept)?;
      Ok((Stream { inner: stream }, peer))
   }

   /// Port the listener is bound to
   pub const fn port(&self) -> u16 {
      self.port
   }

   /// Returns the local address and port as a string
   pub fn local_addr(&self) -> String {
      format!("127.0.0.1:{}", self.port)
   }
}

/// TCP stream wrapper implementing async I/O
#[repr(transparent)]
pub struct Stream {
   inner: TokioTcpStream,
}

impl Stream {
   /// Connects to a broker listening on `port` on localhost
   pub async fn connect(port: u16) -> Result<Self> {
      let inner = TokioTcpStream::connect((Ipv4Addr::LOCALHOST, port))
         .await
         .map_err(SocketError::Connect)?;

      Ok(Self { inner })
   }
}

impl tokio::io::AsyncRead for Stream {
   fn poll_read(
      mut self: Pin<&mut Self>,
      cx: &mut task::Context<'_>,
      buf: &mut ReadBuf<'_>,
   ) -> Poll<io::Result<()>> {
      Pin::new(&mut self.inner).poll_read(cx, buf)
   }
}

impl tokio::io::AsyncWrite for Stream {
   fn poll_write(
      mut self: Pin<&mut Self>,
      cx: &mut task::Context<'_>,
      buf: &[u8],
   ) -> Poll<io::Result<usize>> {
      Pin::new(&mut self.inner).poll_write(cx, buf)
   }

   fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
      Pin::new(&mut self.inner).poll_flush(cx)
   }

   fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
      Pin::new(&mut self.inner).poll_shutdown(cx)
   }
}
