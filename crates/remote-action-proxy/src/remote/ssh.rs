// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SSH connector built on libssh2.
//!
//! Commands run on an `exec` sub-channel; files are copied with SCP over the
//! same authenticated connection. Both are blocking, so callers drive them
//! from the blocking pool.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ssh2::{CheckResult, HashType, KnownHostFileKind, Session};
use tracing::{debug, warn};

use super::shell::ShellCommand;
use super::traits::{CommandOutput, Connector, RemoteAddress, RemoteError, RemoteSession, Result};
use crate::config::HostKeyPolicy;

/// Connector that authenticates with a private key as a fixed remote user.
#[derive(Debug, Clone)]
pub struct SshConnector {
    user: String,
    host_key_policy: HostKeyPolicy,
    timeout: Option<Duration>,
}

impl SshConnector {
    /// Create a connector logging in as `user`.
    pub fn new(user: impl Into<String>, host_key_policy: HostKeyPolicy) -> Self {
        Self {
            user: user.into(),
            host_key_policy,
            timeout: None,
        }
    }

    /// Bound the TCP dial and every blocking libssh2 call.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn dial(&self, address: &RemoteAddress) -> Result<TcpStream> {
        let target = address.to_string();
        let failed = |reason: String| RemoteError::ConnectionFailed {
            address: target.clone(),
            reason,
        };

        let candidates: Vec<_> = (address.host.as_str(), parse_port(address)?)
            .to_socket_addrs()
            .map_err(|e| failed(format!("cannot resolve host: {}", e)))?
            .collect();

        let mut last_error = None;
        for candidate in candidates {
            let attempt = match self.timeout {
                Some(timeout) => TcpStream::connect_timeout(&candidate, timeout),
                None => TcpStream::connect(candidate),
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }

        Err(failed(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "host resolved to no addresses".to_string()),
        ))
    }

    fn verify_host_key(&self, session: &Session, address: &RemoteAddress) -> Result<()> {
        let rejected = |reason: String| RemoteError::HostKeyRejected {
            address: address.to_string(),
            reason,
        };

        match &self.host_key_policy {
            HostKeyPolicy::Insecure => {
                debug!(address = %address, "Host key verification disabled");
                Ok(())
            }
            HostKeyPolicy::Pinned(expected) => {
                let hash = session
                    .host_key_hash(HashType::Sha256)
                    .ok_or_else(|| rejected("server did not present a host key".to_string()))?;
                let actual = STANDARD_NO_PAD.encode(hash);
                if &actual == expected {
                    Ok(())
                } else {
                    Err(rejected(format!("fingerprint SHA256:{} is not pinned", actual)))
                }
            }
            HostKeyPolicy::KnownHosts(path) => {
                let (key, _) = session
                    .host_key()
                    .ok_or_else(|| rejected("server did not present a host key".to_string()))?;
                let mut known_hosts = session
                    .known_hosts()
                    .map_err(|e| rejected(format!("cannot load known hosts: {}", e)))?;
                known_hosts
                    .read_file(path, KnownHostFileKind::OpenSSH)
                    .map_err(|e| rejected(format!("cannot read {}: {}", path.display(), e)))?;
                match known_hosts.check_port(&address.host, parse_port(address)?, key) {
                    CheckResult::Match => Ok(()),
                    CheckResult::Mismatch => Err(rejected("host key mismatch".to_string())),
                    CheckResult::NotFound => Err(rejected("host not in known hosts".to_string())),
                    CheckResult::Failure => Err(rejected("known hosts check failed".to_string())),
                }
            }
        }
    }
}

impl Connector for SshConnector {
    fn connector_type(&self) -> &'static str {
        "ssh"
    }

    fn connect(&self, address: &RemoteAddress, private_key: &str) -> Result<Box<dyn RemoteSession>> {
        let private_key = normalize_private_key(private_key)?;
        debug!(address = %address, user = %self.user, "Connecting over SSH");

        let tcp = self.dial(address)?;
        let mut session = Session::new().map_err(|e| RemoteError::ConnectionFailed {
            address: address.to_string(),
            reason: format!("failed to create SSH session: {}", e),
        })?;
        session.set_tcp_stream(tcp);
        if let Some(timeout) = self.timeout {
            session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        }

        session
            .handshake()
            .map_err(|e| RemoteError::ConnectionFailed {
                address: address.to_string(),
                reason: format!("SSH handshake failed: {}", e),
            })?;

        self.verify_host_key(&session, address)?;

        session
            .userauth_pubkey_memory(&self.user, None, &private_key, None)
            .map_err(|e| {
                warn!(address = %address, error = %e, "Private key authentication failed");
                RemoteError::InvalidCredential(format!("private key authentication failed: {}", e))
            })?;
        if !session.authenticated() {
            return Err(RemoteError::InvalidCredential(
                "SSH authentication failed".to_string(),
            ));
        }

        debug!(address = %address, "SSH session established");
        Ok(Box::new(SshSession {
            session,
            address: address.to_string(),
        }))
    }
}

/// An authenticated libssh2 session, disconnected on drop.
pub struct SshSession {
    session: Session,
    address: String,
}

impl RemoteSession for SshSession {
    fn exec(&mut self, command: &ShellCommand) -> Result<CommandOutput> {
        let line = command.as_line();
        let mut channel = self.session.channel_session().map_err(session_error)?;
        channel.exec(&line).map_err(session_error)?;

        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout).map_err(io_error)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr).map_err(io_error)?;

        channel.wait_close().map_err(session_error)?;
        let exit_status = channel.exit_status().map_err(session_error)?;

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_status,
        })
    }

    fn upload(
        &mut self,
        source: &mut dyn Read,
        size: u64,
        destination: &str,
        mode: i32,
    ) -> Result<()> {
        let copy_failed = |reason: String| RemoteError::Copy {
            destination: destination.to_string(),
            reason,
        };

        let mut channel = self
            .session
            .scp_send(Path::new(destination), mode, size, None)
            .map_err(|e| copy_failed(e.to_string()))?;

        let copied = std::io::copy(source, &mut channel).map_err(|e| copy_failed(e.to_string()))?;
        if copied != size {
            return Err(copy_failed(format!("sent {} of {} bytes", copied, size)));
        }

        channel.send_eof().map_err(|e| copy_failed(e.to_string()))?;
        channel.wait_eof().map_err(|e| copy_failed(e.to_string()))?;
        channel.close().map_err(|e| copy_failed(e.to_string()))?;
        channel.wait_close().map_err(|e| copy_failed(e.to_string()))?;
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if let Err(e) = self.session.disconnect(None, "operation complete", None) {
            debug!(address = %self.address, error = %e, "SSH disconnect failed");
        } else {
            debug!(address = %self.address, "SSH session closed");
        }
    }
}

fn parse_port(address: &RemoteAddress) -> Result<u16> {
    address
        .port
        .parse()
        .map_err(|_| RemoteError::ConnectionFailed {
            address: address.to_string(),
            reason: format!("invalid port '{}'", address.port),
        })
}

/// Check that `key` looks like PEM/OpenSSH private key material and make
/// sure it ends with a newline, which libssh2 requires.
pub(crate) fn normalize_private_key(key: &str) -> Result<String> {
    let trimmed = key.trim();
    if !(trimmed.starts_with("-----BEGIN") && trimmed.contains("PRIVATE KEY-----")) {
        return Err(RemoteError::InvalidCredential(
            "SSH key is not a PEM or OpenSSH private key".to_string(),
        ));
    }
    Ok(format!("{}\n", trimmed))
}

fn session_error(e: ssh2::Error) -> RemoteError {
    RemoteError::Session(e.to_string())
}

fn io_error(e: std::io::Error) -> RemoteError {
    RemoteError::Session(e.to_string())
}
