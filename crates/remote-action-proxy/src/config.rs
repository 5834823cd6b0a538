// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for remote-action-proxy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default provider API base URL.
pub const DEFAULT_PROVIDER_URL: &str = "https://console.vast.ai";

/// Default relay buffer capacity (10 MiB).
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// How the SSH client decides whether to trust the remote host key.
///
/// Defaults to [`HostKeyPolicy::Insecure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any host key.
    Insecure,
    /// Accept only a host key whose SHA-256 fingerprint (base64, no padding)
    /// matches.
    Pinned(String),
    /// Check the host key against an OpenSSH known_hosts file.
    KnownHosts(PathBuf),
}

impl FromStr for HostKeyPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("insecure") {
            return Ok(Self::Insecure);
        }
        if let Some(fingerprint) = s.strip_prefix("sha256:").or_else(|| s.strip_prefix("SHA256:")) {
            let fingerprint = fingerprint.trim_end_matches('=');
            if fingerprint.is_empty() {
                return Err(ConfigError::InvalidHostKeyPolicy(s.to_string()));
            }
            return Ok(Self::Pinned(fingerprint.to_string()));
        }
        if let Some(path) = s.strip_prefix("known-hosts:") {
            if path.is_empty() {
                return Err(ConfigError::InvalidHostKeyPolicy(s.to_string()));
            }
            return Ok(Self::KnownHosts(PathBuf::from(path)));
        }
        Err(ConfigError::InvalidHostKeyPolicy(s.to_string()))
    }
}

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address
    pub bind_addr: SocketAddr,
    /// Debug mode: allows re-initialization and raises the log level
    pub debug: bool,
    /// Report init failures through the captured output streams instead of the response
    pub log_init_error: bool,
    /// Compiler program run during init (None skips compilation)
    pub compiler: Option<String>,
    /// Local base directory for extracted artifacts
    pub action_dir: PathBuf,
    /// Provider API base URL used for instance lookups
    pub provider_url: String,
    /// Remote login user
    pub remote_user: String,
    /// Remote directory the run command changes into
    pub remote_workdir: String,
    /// Remote entry point invoked with the run payload
    pub remote_entrypoint: String,
    /// Deadline for every remote operation (None waits forever)
    pub remote_timeout: Option<Duration>,
    /// HTTP timeout for the provider lookup
    pub provider_timeout: Duration,
    /// Host key verification policy
    pub host_key_policy: HostKeyPolicy,
    /// Largest remote output relayed to the caller
    pub max_response_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            debug: false,
            log_init_error: false,
            compiler: None,
            action_dir: PathBuf::from("./action"),
            provider_url: DEFAULT_PROVIDER_URL.to_string(),
            remote_user: "root".to_string(),
            remote_workdir: "/action".to_string(),
            remote_entrypoint: "python3 __main__.py".to_string(),
            remote_timeout: Some(Duration::from_secs(600)),
            provider_timeout: Duration::from_secs(30),
            host_key_policy: HostKeyPolicy::Insecure,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        // OpenWhisk toggles are "set" when non-empty, whatever the value
        let flag = |key: &str| lookup(key).map(|v| !v.is_empty()).unwrap_or(false);
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port: u16 = match non_empty("OW_PORT") {
            Some(v) => v.trim().parse().map_err(|_| ConfigError::InvalidPort(v))?,
            None => defaults.bind_addr.port(),
        };

        let remote_timeout = match non_empty("OW_REMOTE_TIMEOUT_SECS") {
            Some(v) => match parse_secs("OW_REMOTE_TIMEOUT_SECS", &v)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            None => defaults.remote_timeout,
        };

        let provider_timeout = match non_empty("OW_PROVIDER_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(parse_secs("OW_PROVIDER_TIMEOUT_SECS", &v)?),
            None => defaults.provider_timeout,
        };

        let host_key_policy = match non_empty("OW_SSH_HOST_KEY") {
            Some(v) => v.parse()?,
            None => defaults.host_key_policy,
        };

        let max_response_bytes = match non_empty("OW_MAX_RESPONSE_BYTES") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("OW_MAX_RESPONSE_BYTES", v))?,
            None => defaults.max_response_bytes,
        };

        Ok(Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            debug: flag("OW_DEBUG"),
            log_init_error: flag("OW_LOG_INIT_ERROR"),
            compiler: non_empty("OW_COMPILER"),
            action_dir: non_empty("OW_ACTION_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.action_dir),
            provider_url: non_empty("OW_PROVIDER_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.provider_url),
            remote_user: non_empty("OW_REMOTE_USER").unwrap_or(defaults.remote_user),
            remote_workdir: non_empty("OW_REMOTE_WORKDIR").unwrap_or(defaults.remote_workdir),
            remote_entrypoint: non_empty("OW_REMOTE_ENTRYPOINT")
                .unwrap_or(defaults.remote_entrypoint),
            remote_timeout,
            provider_timeout,
            host_key_policy,
            max_response_bytes,
        })
    }
}

fn parse_secs(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber(key, value.to_string()))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The port number is invalid.
    #[error("Invalid port number: {0}")]
    InvalidPort(String),
    /// A numeric variable could not be parsed.
    #[error("Invalid value for {0}: {1}")]
    InvalidNumber(&'static str, String),
    /// The host key policy is not one of the supported forms.
    #[error("Invalid host key policy '{0}' (expected insecure, sha256:<fingerprint> or known-hosts:<path>)")]
    InvalidHostKeyPolicy(String),
}
