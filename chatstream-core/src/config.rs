use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerCfg {
    /// Address the service binds to, e.g. 127.0.0.1:8080
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Interval of `: ping` comment frames on idle streams (0 disables).
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            keepalive_ms: default_keepalive_ms(),
        }
    }
}

impl ServerCfg {
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_ms > 0).then(|| Duration::from_millis(self.keepalive_ms))
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_keepalive_ms() -> u64 {
    15_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamCfg {
    /// Longest wait for the next event before the stream times out (None = wait forever).
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: Option<u64>,
    /// Largest partial frame the decoder buffers before giving up.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Server-side queue between the encoder and the response body.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl StreamCfg {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

fn default_idle_timeout_ms() -> Option<u64> {
    Some(30_000)
}
fn default_max_frame_bytes() -> usize {
    crate::decoder::DEFAULT_MAX_FRAME_BYTES
}
fn default_channel_capacity() -> usize {
    16
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GeneratorCfg {
    /// Model name the service answers to.
    #[serde(default = "default_model")]
    pub model: String,
    /// Artificial pause before each echoed fragment.
    #[serde(default)]
    pub fragment_delay_ms: u64,
}

impl Default for GeneratorCfg {
    fn default() -> Self {
        Self {
            model: default_model(),
            fragment_delay_ms: 0,
        }
    }
}

fn default_model() -> String {
    "echo".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerCfg,
    /// HTTP client configuration (timeouts, pooling). Missing in older configs → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub stream: StreamCfg,
    #[serde(default)]
    pub generator: GeneratorCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::ChatStreamError::from)?;
        let s = std::str::from_utf8(&bytes)
            .map_err(|e| crate::error::ChatStreamError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::ChatStreamError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::ChatStreamError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::ChatStreamError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s)
                        .map_err(|e| crate::error::ChatStreamError::Other(e.into()))
                })?,
        };
        Ok(cfg)
    }
}
