use std::io;

use thiserror::Error;

use crate::socket::SocketError;

/// Main error type for the rtcshare broker.
///
/// Covers process-level failures: socket setup, framing I/O, configuration,
/// collaborator supervision. Per-request failures are [`QueryError`] and are
/// reported back to the peer instead of bubbling up here.
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error occurred during file or network operations.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// JSON serialization or deserialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// Configuration-related error occurred.
   #[error("config error: {0}")]
   Config(#[from] ConfigError),

   /// Inter-process communication error occurred.
   #[error("ipc error: {0}")]
   Ipc(#[from] IpcError),

   /// Socket communication error occurred.
   #[error("socket error: {0}")]
   Socket(#[from] SocketError),

   /// A request-level failure surfaced outside the dispatcher.
   #[error("query error: {0}")]
   Query(#[from] QueryError),

   /// Service registration failed.
   #[error("registry error: {0}")]
   Registry(#[from] RegistryError),

   /// Failed to spawn the collaborator process.
   #[error("failed to spawn collaborator: {0}")]
   CollaboratorSpawn(#[source] io::Error),

   /// The broker reported a framing-level failure for a request.
   #[error("broker error: {0}")]
   Broker(String),

   /// Server error occurred during a specific operation.
   #[error("server error during {op}: {reason}")]
   Server { op: &'static str, reason: String },
}

impl Error {
   pub const fn exit_code(&self) -> i32 {
      match self {
         Self::Config(_) => 2,
         Self::Socket(_) => 3,
         Self::CollaboratorSpawn(_) => 4,
         _ => 1,
      }
   }
}

/// Request-level failures.
///
/// Every variant except [`QueryError::MalformedRequest`] is recoverable: the
/// dispatcher converts it into a `success: false` result object and the
/// connection completes normally. `MalformedRequest` means the framing
/// contract was broken and is answered on the framing-error channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
   #[error("malformed request: {0}")]
   MalformedRequest(String),

   #[error("Invalid path: {0}")]
   InvalidPath(String),

   #[error("{0}")]
   NotFound(String),

   #[error("{0}")]
   InvalidRange(String),

   #[error("No such service: {0}")]
   UnknownService(String),

   /// Anything else raised by a handler, message passed through verbatim.
   #[error("{0}")]
   HandlerFailure(String),
}

impl QueryError {
   /// Stable name of the taxonomy kind, reported as `kind` in failure results.
   pub const fn kind(&self) -> &'static str {
      match self {
         Self::MalformedRequest(_) => "MalformedRequest",
         Self::InvalidPath(_) => "InvalidPath",
         Self::NotFound(_) => "NotFound",
         Self::InvalidRange(_) => "InvalidRange",
         Self::UnknownService(_) => "UnknownService",
         Self::HandlerFailure(_) => "HandlerFailure",
      }
   }

   pub fn handler(msg: impl std::fmt::Display) -> Self {
      Self::HandlerFailure(msg.to_string())
   }
}

/// Errors that can occur during inter-process communication (IPC).
///
/// These errors are related to message framing, serialization, and I/O when
/// exchanging requests with the collaborator process.
#[derive(Debug, Error)]
pub enum IpcError {
   /// The message size exceeds the maximum allowed size.
   #[error("message too large: {0} bytes")]
   MessageTooLarge(usize),

   /// The peer closed the stream before a complete request arrived.
   #[error("connection closed before the request was complete ({0} bytes received)")]
   UnexpectedEof(usize),

   /// Failed to serialize a message for IPC transmission.
   #[error("failed to serialize: {0}")]
   Serialize(#[source] serde_json::Error),

   /// Failed to deserialize a message received via IPC.
   #[error("failed to deserialize: {0}")]
   Deserialize(#[source] serde_json::Error),

   /// Failed to read data from the IPC channel.
   #[error("failed to read: {0}")]
   Read(#[source] io::Error),

   /// Failed to write data to the IPC channel.
   #[error("failed to write: {0}")]
   Write(#[source] io::Error),

   /// A reply did not follow the response envelope layout.
   #[error("invalid reply: {0}")]
   InvalidReply(&'static str),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
   /// Failed to retrieve user directories (e.g., home directory).
   #[error("failed to get user directories")]
   GetUserDirectories,

   /// Configuration sources could not be merged or extracted.
   #[error("invalid configuration: {0}")]
   Invalid(String),

   /// The shared root is missing or not a directory.
   #[error("shared directory {path} is not usable: {reason}")]
   SharedRoot { path: String, reason: String },
}

/// Errors raised while building the service registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
   /// A service with this name is already registered.
   #[error("service already registered: {0}")]
   DuplicateName(String),
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
