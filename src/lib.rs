//! Local IPC broker that exposes a sandboxed directory tree, plus video and
//! array extraction over files in it, to a front-end collaborator process.

pub mod array;
pub mod client;
pub mod cmd;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod path;
pub mod server;
pub mod service;
pub mod socket;
pub mod video;

pub use error::{Error, QueryError, Result};
