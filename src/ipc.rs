//! IPC protocol between the broker and its collaborator process.
//!
//! Two framings share the same message types:
//!
//! - [`Framing::Line`] (legacy, default): the request is one JSON object
//!   terminated by `\n`. The reply is the JSON result object, `\n`, then the
//!   raw payload until the connection closes. A framing-level failure is an
//!   empty first line followed by plain text.
//! - [`Framing::LengthPrefixed`]: every frame carries a `u32` little-endian
//!   length. A reply is two frames (result JSON, payload); a framing-level
//!   failure is an empty first frame followed by the message frame.

use memchr::memchr;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use crate::config::Framing;
use crate::{Result, error::IpcError, error::QueryError};

pub const TERMINATOR: u8 = b'\n';

/// Inbound request envelope, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
   #[serde(rename = "serviceQuery")]
   ServiceQuery(ServiceQuery),
}

impl Request {
   /// Decodes a request body. Any failure breaks the framing contract.
   pub fn decode(bytes: &[u8]) -> Result<Self, QueryError> {
      serde_json::from_slice(bytes).map_err(|e| QueryError::MalformedRequest(e.to_string()))
   }

   pub fn service_query(
      service_name: impl Into<String>,
      query: Value,
      dir: impl Into<String>,
      user_id: Option<String>,
   ) -> Self {
      Self::ServiceQuery(ServiceQuery {
         service_name: service_name.into(),
         query,
         dir: dir.into(),
         user_id,
      })
   }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceQuery {
   pub service_name: String,
   pub query:        Value,
   pub dir:          String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub user_id:      Option<String>,
}

/// Size limits applied while reading a request
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
   pub read_chunk_bytes:  usize,
   pub max_request_bytes: usize,
}

impl Default for FrameLimits {
   fn default() -> Self {
      let cfg = crate::config::Config::default();
      Self {
         read_chunk_bytes:  cfg.read_chunk_bytes,
         max_request_bytes: cfg.max_request_bytes,
      }
   }
}

/// Reply as seen by the requesting side
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyFrame {
   Result { result: Value, payload: Vec<u8> },
   /// Framing-level failure text (empty first line / frame)
   Failure(String),
}

/// Stack-allocated buffer for socket I/O operations
pub struct SocketBuffer {
   buf: SmallVec<[u8; 2048]>,
}

impl Default for SocketBuffer {
   fn default() -> Self {
      Self::new()
   }
}

impl SocketBuffer {
   pub fn new() -> Self {
      Self { buf: SmallVec::new() }
   }

   /// Reads one request body using `framing`.
   ///
   /// Returns `Ok(None)` when the peer closed without sending anything.
   pub async fn recv_request<R>(
      &mut self,
      reader: &mut R,
      framing: Framing,
      limits: FrameLimits,
   ) -> Result<Option<&[u8]>>
   where
      R: AsyncRead + Unpin,
   {
      match framing {
         Framing::Line => self.recv_line(reader, limits).await,
         Framing::LengthPrefixed => self.recv_frame_or_close(reader, limits.max_request_bytes).await,
      }
   }

   /// Accumulates fixed-size reads until the buffer ends with `\n`.
   ///
   /// The terminator is only checked at read boundaries, so a request must
   /// not contain a raw newline before its end.
   pub async fn recv_line<R>(&mut self, reader: &mut R, limits: FrameLimits) -> Result<Option<&[u8]>>
   where
      R: AsyncRead + Unpin,
   {
      self.buf.clear();
      let mut chunk = vec![0u8; limits.read_chunk_bytes.max(1)];

      loop {
         let n = reader.read(&mut chunk).await.map_err(IpcError::Read)?;
         if n == 0 {
            if self.buf.is_empty() {
               return Ok(None);
            }
            return Err(IpcError::UnexpectedEof(self.buf.len()).into());
         }

         self.buf.extend_from_slice(&chunk[..n]);
         if self.buf.len() > limits.max_request_bytes {
            return Err(IpcError::MessageTooLarge(self.buf.len()).into());
         }
         if self.buf.last() == Some(&TERMINATOR) {
            break;
         }
      }

      let len = self.buf.len() - 1;
      Ok(Some(&self.buf[..len]))
   }

   /// Receives one length-prefixed frame
   pub async fn recv_frame<R>(&mut self, reader: &mut R, max_len: usize) -> Result<&[u8]>
   where
      R: AsyncRead + Unpin,
   {
      match self.recv_frame_or_close(reader, max_len).await? {
         Some(frame) => Ok(frame),
         None => Err(IpcError::UnexpectedEof(0).into()),
      }
   }

   /// Like [`Self::recv_frame`], but a peer that closes before the first
   /// length byte yields `Ok(None)`.
   async fn recv_frame_or_close<R>(&mut self, reader: &mut R, max_len: usize) -> Result<Option<&[u8]>>
   where
      R: AsyncRead + Unpin,
   {
      let mut len_buf = [0u8; 4];
      match read_full(reader, &mut len_buf).await? {
         0 => return Ok(None),
         4 => {},
         got => return Err(IpcError::UnexpectedEof(got).into()),
      }
      let len = u32::from_le_bytes(len_buf) as usize;
      if len > max_len {
         return Err(IpcError::MessageTooLarge(len).into());
      }

      self.buf.resize(len, 0u8);
      let got = read_full(reader, self.buf.as_mut_slice()).await?;
      if got < len {
         return Err(IpcError::UnexpectedEof(len_buf.len() + got).into());
      }
      Ok(Some(&self.buf))
   }
}

/// Reads until `buf` is full or the peer closes; returns the bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
   R: AsyncRead + Unpin,
{
   let mut filled = 0;
   while filled < buf.len() {
      let n = reader.read(&mut buf[filled..]).await.map_err(IpcError::Read)?;
      if n == 0 {
         break;
      }
      filled += n;
   }
   Ok(filled)
}

async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
   W: AsyncWrite + Unpin,
{
   let len = u32::try_from(bytes.len()).map_err(|_| IpcError::MessageTooLarge(bytes.len()))?;
   writer
      .write_all(&len.to_le_bytes())
      .await
      .map_err(IpcError::Write)?;
   writer.write_all(bytes).await.map_err(IpcError::Write)?;
   Ok(())
}

/// Writes a result object and its binary payload
pub async fn write_reply<W>(
   writer: &mut W,
   framing: Framing,
   result: &Value,
   payload: &[u8],
) -> Result<()>
where
   W: AsyncWrite + Unpin,
{
   let json = serde_json::to_vec(result).map_err(IpcError::Serialize)?;
   match framing {
      Framing::Line => {
         writer.write_all(&json).await.map_err(IpcError::Write)?;
         writer
            .write_all(&[TERMINATOR])
            .await
            .map_err(IpcError::Write)?;
         writer.write_all(payload).await.map_err(IpcError::Write)?;
      },
      Framing::LengthPrefixed => {
         write_frame(writer, &json).await?;
         write_frame(writer, payload).await?;
      },
   }
   writer.flush().await.map_err(IpcError::Write)?;
   Ok(())
}

/// Writes the framing-level failure signal followed by `message`
pub async fn write_failure<W>(writer: &mut W, framing: Framing, message: &str) -> Result<()>
where
   W: AsyncWrite + Unpin,
{
   match framing {
      Framing::Line => {
         writer
            .write_all(&[TERMINATOR])
            .await
            .map_err(IpcError::Write)?;
         writer
            .write_all(message.as_bytes())
            .await
            .map_err(IpcError::Write)?;
      },
      Framing::LengthPrefixed => {
         write_frame(writer, &[]).await?;
         write_frame(writer, message.as_bytes()).await?;
      },
   }
   writer.flush().await.map_err(IpcError::Write)?;
   Ok(())
}

/// Serializes and sends a request
pub async fn write_request<W>(writer: &mut W, framing: Framing, request: &Request) -> Result<()>
where
   W: AsyncWrite + Unpin,
{
   let json = serde_json::to_vec(request).map_err(IpcError::Serialize)?;
   match framing {
      Framing::Line => {
         writer.write_all(&json).await.map_err(IpcError::Write)?;
         writer
            .write_all(&[TERMINATOR])
            .await
            .map_err(IpcError::Write)?;
      },
      Framing::LengthPrefixed => write_frame(writer, &json).await?,
   }
   writer.flush().await.map_err(IpcError::Write)?;
   Ok(())
}

/// Reads a complete reply. In line framing the payload runs until EOF.
pub async fn read_reply<R>(reader: &mut R, framing: Framing, max_len: usize) -> Result<ReplyFrame>
where
   R: AsyncRead + Unpin,
{
   match framing {
      Framing::Line => {
         let mut data = Vec::new();
         reader
            .read_to_end(&mut data)
            .await
            .map_err(IpcError::Read)?;
         parse_line_reply(data)
      },
      Framing::LengthPrefixed => {
         let mut buffer = SocketBuffer::new();
         let head = buffer.recv_frame(reader, max_len).await?.to_vec();
         let tail = buffer.recv_frame(reader, max_len).await?.to_vec();
         if head.is_empty() {
            return Ok(ReplyFrame::Failure(String::from_utf8_lossy(&tail).into_owned()));
         }
         let result = serde_json::from_slice(&head).map_err(IpcError::Deserialize)?;
         Ok(ReplyFrame::Result { result, payload: tail })
      },
   }
}

/// Splits a line-framed reply into result object and payload.
pub fn parse_line_reply(mut data: Vec<u8>) -> Result<ReplyFrame> {
   let Some(idx) = memchr(TERMINATOR, &data) else {
      return Err(IpcError::InvalidReply("no newline found").into());
   };
   if idx == 0 {
      return Ok(ReplyFrame::Failure(String::from_utf8_lossy(&data[1..]).into_owned()));
   }

   let payload = data.split_off(idx + 1);
   let result = serde_json::from_slice(&data[..idx]).map_err(IpcError::Deserialize)?;
   Ok(ReplyFrame::Result { result, payload })
}
