//! Server configuration schema.
//!
//! Deserializes from YAML or JSON; loading and layering of config files is
//! the caller's concern.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::throttle::ConfigDuration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GrpcServerConfig {
    /// TCP listen address, e.g. `"0.0.0.0:50051"`. Ignored when
    /// `unixSocketPath` is set.
    pub address: String,
    pub unix_socket_path: Option<PathBuf>,
    pub tls: TlsConfig,
    pub timeouts: TimeoutsConfig,
    pub keepalive: KeepaliveConfig,
    pub limits: LimitsConfig,
    pub log: LogConfig,
}

impl GrpcServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() && self.unix_socket_path.is_none() {
            return Err(ConfigError::MissingAddress);
        }
        if self.tls.enabled
            && (self.tls.certificate.as_os_str().is_empty() || self.tls.key.as_os_str().is_empty())
        {
            return Err(ConfigError::InvalidTls);
        }
        if let (Some(min_time), Some(time)) = (self.keepalive.min_time, self.keepalive.time) {
            if min_time.0 > time.0 {
                return Err(ConfigError::InvalidKeepalive);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsConfig {
    pub enabled: bool,
    #[serde(alias = "cert")]
    pub certificate: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutsConfig {
    /// How long a graceful stop may take before the server is stopped hard.
    pub shutdown: ConfigDuration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            shutdown: ConfigDuration(std::time::Duration::from_secs(5)),
        }
    }
}

/// HTTP/2 keepalive settings. `minTime` is validated against `time` but the
/// transport exposes no enforcement-policy knob, so it is informational.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepaliveConfig {
    pub time: Option<ConfigDuration>,
    pub timeout: Option<ConfigDuration>,
    pub min_time: Option<ConfigDuration>,
}

/// Transport limits. Zero always means "unlimited"/"transport default".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
    pub max_concurrent_streams: u32,
    /// Applied by service builders; exposed here so one config block covers
    /// the whole server.
    pub max_recv_message_size: usize,
    pub max_send_message_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    pub call_start: bool,
    pub excluded_methods: Vec<String>,
    pub slow_call_threshold: ConfigDuration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            call_start: false,
            excluded_methods: Vec::new(),
            slow_call_threshold: ConfigDuration(std::time::Duration::from_secs(1)),
        }
    }
}
