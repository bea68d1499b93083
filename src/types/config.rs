//! Configuration structures.
//!
//! Every section and every field has a default, so a partial document
//! deserializes cleanly.

use crate::rpc::codec::{CodecType, DEFAULT_MAX_FRAME_BYTES};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Client configuration.
    #[serde(default)]
    pub client: ClientConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address used by `Server::serve`.
    pub listen_addr: String,

    /// Maximum concurrent connections. Connections accepted beyond this
    /// limit are dropped immediately.
    pub max_connections: usize,

    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9999".to_string(),
            max_connections: 1000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Codec requested during the handshake.
    pub codec_type: CodecType,

    /// Capacity of the done queue created by `Client::go_default`.
    pub done_capacity: usize,

    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            codec_type: CodecType::default(),
            done_capacity: 10,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    /// Default configuration with a specific codec.
    pub fn with_codec(codec_type: CodecType) -> Self {
        Self {
            codec_type,
            ..Self::default()
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error), used when
    /// `RUST_LOG` is unset.
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
