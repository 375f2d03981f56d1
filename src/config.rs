//! Broker configuration: framing, limits, timeouts and the collaborator
//! command.

use std::{
   path::{Path, PathBuf},
   sync::OnceLock,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub const MAX_REQUEST_BYTES_CAP: usize = 64 * 1024 * 1024;
pub const MAX_READ_CHUNK_BYTES: usize = 1024 * 1024;

/// Wire framing used on accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
   /// JSON line in, `result\npayload` out; payload runs until close.
   #[default]
   Line,
   /// `u32` little-endian length prefix on every frame.
   LengthPrefixed,
}

/// Application configuration loaded from config file and environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   pub framing:            Framing,
   pub port:               u16,
   pub read_chunk_bytes:   usize,
   pub max_request_bytes:  usize,
   pub request_timeout_ms: u64,
   pub shutdown_grace_ms:  u64,

   /// Program and arguments of the front-end collaborator. `{dir}` and
   /// `{port}` are substituted before launch. Empty runs the broker alone.
   pub collaborator_command: Vec<String>,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         framing:              Framing::Line,
         port:                 0,
         read_chunk_bytes:     1024,
         max_request_bytes:    1_048_576,
         request_timeout_ms:   0,
         shutdown_grace_ms:    2000,
         collaborator_command: Vec::new(),
      }
   }
}

impl Config {
   pub fn load() -> Result<Self> {
      Self::load_from(None)
   }

   /// Layers defaults, the global config file (or `explicit` when given) and
   /// `RTCSHARE_*` environment variables.
   pub fn load_from(explicit: Option<&Path>) -> Result<Self> {
      let file = match explicit {
         Some(path) => path.to_path_buf(),
         None => config_file_path()?,
      };

      let cfg: Self = Figment::from(Serialized::defaults(Self::default()))
         .merge(Toml::file(file))
         .merge(Env::prefixed("RTCSHARE_").lowercase(true).only(&ENV_KEYS))
         .extract()
         .map_err(|e| ConfigError::Invalid(e.to_string()))?;

      cfg.validate()?;
      Ok(cfg)
   }

   pub fn validate(&self) -> Result<()> {
      if self.read_chunk_bytes == 0 || self.read_chunk_bytes > MAX_READ_CHUNK_BYTES {
         return Err(
            ConfigError::Invalid(format!(
               "read_chunk_bytes must be between 1 and {MAX_READ_CHUNK_BYTES}, got {}",
               self.read_chunk_bytes
            ))
            .into(),
         );
      }
      if self.max_request_bytes == 0 || self.max_request_bytes > MAX_REQUEST_BYTES_CAP {
         return Err(
            ConfigError::Invalid(format!(
               "max_request_bytes must be between 1 and {MAX_REQUEST_BYTES_CAP}, got {}",
               self.max_request_bytes
            ))
            .into(),
         );
      }
      Ok(())
   }
}

// RTCSHARE_DIR and RTCSHARE_SOCKET_PORT belong to the collaborator contract,
// not to this config.
const ENV_KEYS: [&str; 7] = [
   "framing",
   "port",
   "read_chunk_bytes",
   "max_request_bytes",
   "request_timeout_ms",
   "shutdown_grace_ms",
   "collaborator_command",
];

/// Installs the process-wide configuration. Later calls keep the first value.
pub fn init(cfg: Config) -> &'static Config {
   CONFIG.get_or_init(|| cfg)
}

/// Returns the global configuration instance
pub fn get() -> &'static Config {
   CONFIG.get_or_init(|| {
      Config::load()
         .inspect_err(|e| tracing::warn!("failed to load config, using defaults: {e}"))
         .unwrap_or_default()
   })
}

/// Returns the base directory for rtcshare configuration
pub fn base_dir() -> Result<PathBuf> {
   BaseDirs::new()
      .map(|d| d.home_dir().join(".rtcshare"))
      .or_else(|| {
         std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".rtcshare"))
      })
      .ok_or_else(|| ConfigError::GetUserDirectories.into())
}

pub fn config_file_path() -> Result<PathBuf> {
   Ok(base_dir()?.join("config.toml"))
}
