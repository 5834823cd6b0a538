// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote node trait definitions.
//!
//! Defines the abstract interface for reaching the remote node: opening an
//! authenticated session, running shell commands and copying files.

use std::fmt;
use std::io::Read;
use std::time::Duration;

use thiserror::Error;

use super::shell::ShellCommand;

/// Errors from remote node operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemoteError {
    /// The provider lookup request could not be sent or returned an error status.
    #[error("Provider request failed: {0}")]
    ProviderRequest(String),

    /// The provider answered, but without the fields needed to reach the node.
    #[error("Malformed provider response: {0}")]
    MalformedProviderResponse(String),

    /// The private key could not be parsed or was refused by the node.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// The TCP connection or SSH handshake failed.
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// Address that was dialed.
        address: String,
        /// Failure reason.
        reason: String,
    },

    /// The node presented a host key the configured policy does not accept.
    #[error("Host key for {address} rejected: {reason}")]
    HostKeyRejected {
        /// Address that was dialed.
        address: String,
        /// Failure reason.
        reason: String,
    },

    /// A sub-channel could not be opened or driven on an established session.
    #[error("SSH session error: {0}")]
    Session(String),

    /// A remote command ran but exited unsuccessfully.
    #[error("Remote command exited with status {exit_status}: {stderr}")]
    CommandFailed {
        /// Exit status reported by the node.
        exit_status: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// The local archive could not be written.
    #[error("Failed to write archive {path}: {reason}")]
    ArchiveWrite {
        /// Archive path.
        path: String,
        /// Failure reason.
        reason: String,
    },

    /// The local archive could not be opened for transfer.
    #[error("Failed to open archive {path}: {source}")]
    ArchiveOpen {
        /// Archive path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Copying the archive to the node failed.
    #[error("Failed to copy archive to {destination}: {reason}")]
    Copy {
        /// Remote destination path.
        destination: String,
        /// Failure reason.
        reason: String,
    },

    /// The operation did not finish before the configured deadline.
    #[error("Remote operation timed out after {0:?}")]
    Timeout(Duration),

    /// The blocking task running the operation panicked or was cancelled.
    #[error("Remote task failed: {0}")]
    Task(String),
}

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Caller-declared credentials identifying a rented instance.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteInstanceRef {
    /// Provider API key
    pub api_key: String,
    /// Provider instance id
    pub instance_id: String,
}

impl fmt::Debug for RemoteInstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteInstanceRef")
            .field("api_key", &"<redacted>")
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

/// Host and port of the node's forwarded SSH service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddress {
    /// Public host name or IP address
    pub host: String,
    /// Forwarded SSH port
    pub port: String,
}

impl RemoteAddress {
    /// Create an address from its parts.
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }

    /// Parse a `host:port` string as stored in the proxy environment.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.trim().rsplit_once(':')?;
        if host.is_empty() || port.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Captured result of a remote command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output bytes
    pub stdout: Vec<u8>,
    /// Standard error bytes
    pub stderr: Vec<u8>,
    /// Exit status (0 on success)
    pub exit_status: i32,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Standard error as lossy UTF-8.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim_end().to_string()
    }

    /// Turn a non-zero exit status into [`RemoteError::CommandFailed`].
    pub fn check(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(RemoteError::CommandFailed {
                exit_status: self.exit_status,
                stderr: self.stderr_lossy(),
            })
        }
    }
}

/// Opens authenticated sessions to a remote node.
///
/// Implementations are blocking; callers run them on the blocking pool.
pub trait Connector: Send + Sync {
    /// Connector type identifier (e.g., "ssh", "mock")
    fn connector_type(&self) -> &'static str;

    /// Open a session to `address` authenticated with `private_key` (PEM/OpenSSH text).
    fn connect(&self, address: &RemoteAddress, private_key: &str) -> Result<Box<dyn RemoteSession>>;
}

/// An authenticated session to a remote node.
///
/// A session belongs to exactly one logical operation and is closed when it
/// is dropped, so every exit path of the owning operation releases it.
pub trait RemoteSession: Send {
    /// Run a shell command on a fresh sub-channel, capturing stdout and stderr.
    ///
    /// Returns the output even when the exit status is non-zero; an `Err` means
    /// the command could not be run at all.
    fn exec(&mut self, command: &ShellCommand) -> Result<CommandOutput>;

    /// Copy `size` bytes from `source` to `destination` on the node.
    fn upload(
        &mut self,
        source: &mut dyn Read,
        size: u64,
        destination: &str,
        mode: i32,
    ) -> Result<()>;
}
