// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock connector for testing.
//!
//! Records every session, command and upload without touching the network,
//! and counts how many sessions were closed so tests can check that each
//! operation releases what it opened.

use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};

use super::shell::ShellCommand;
use super::traits::{CommandOutput, Connector, RemoteAddress, RemoteError, RemoteSession, Result};

/// How a mock connection attempt should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockConnectFailure {
    /// Fail with [`RemoteError::InvalidCredential`].
    InvalidCredential,
    /// Fail with [`RemoteError::ConnectionFailed`].
    ConnectionFailed,
}

/// A file copied through a mock session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockUpload {
    /// Remote destination path
    pub destination: String,
    /// Bytes received
    pub bytes: Vec<u8>,
    /// Requested file mode
    pub mode: i32,
}

#[derive(Debug, Default)]
struct MockState {
    connects: usize,
    closes: usize,
    addresses: Vec<String>,
    commands: Vec<String>,
    uploads: Vec<MockUpload>,
    connect_failure: Option<MockConnectFailure>,
    responses: Vec<(String, CommandOutput)>,
    broken_commands: Vec<String>,
    fail_uploads: bool,
}

/// Mock connector for testing.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    /// Create a mock connector where every command succeeds with empty output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock connector whose connection attempts fail.
    pub fn refusing(failure: MockConnectFailure) -> Self {
        let mock = Self::new();
        mock.lock().connect_failure = Some(failure);
        mock
    }

    /// Answer commands containing `needle` with `output`.
    ///
    /// Rules are checked in registration order; the first match wins.
    pub fn respond_to(&self, needle: &str, output: CommandOutput) {
        self.lock().responses.push((needle.to_string(), output));
    }

    /// Answer commands containing `needle` with the given stdout and status 0.
    pub fn respond_with_stdout(&self, needle: &str, stdout: &[u8]) {
        self.respond_to(
            needle,
            CommandOutput {
                stdout: stdout.to_vec(),
                ..Default::default()
            },
        );
    }

    /// Make commands containing `needle` fail to run at all.
    pub fn break_command(&self, needle: &str) {
        self.lock().broken_commands.push(needle.to_string());
    }

    /// Make every upload fail.
    pub fn fail_uploads(&self) {
        self.lock().fail_uploads = true;
    }

    /// Number of sessions opened.
    pub fn connections(&self) -> usize {
        self.lock().connects
    }

    /// Number of sessions closed.
    pub fn closed(&self) -> usize {
        self.lock().closes
    }

    /// Addresses dialed, in order.
    pub fn addresses(&self) -> Vec<String> {
        self.lock().addresses.clone()
    }

    /// Command lines run, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Files copied, in order.
    pub fn uploads(&self) -> Vec<MockUpload> {
        self.lock().uploads.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Connector for MockConnector {
    fn connector_type(&self) -> &'static str {
        "mock"
    }

    fn connect(&self, address: &RemoteAddress, private_key: &str) -> Result<Box<dyn RemoteSession>> {
        let mut state = self.lock();
        state.addresses.push(address.to_string());

        if private_key.trim().is_empty() {
            return Err(RemoteError::InvalidCredential("empty private key".to_string()));
        }
        match state.connect_failure {
            Some(MockConnectFailure::InvalidCredential) => Err(RemoteError::InvalidCredential(
                "mock refused the key".to_string(),
            )),
            Some(MockConnectFailure::ConnectionFailed) => Err(RemoteError::ConnectionFailed {
                address: address.to_string(),
                reason: "mock refused the connection".to_string(),
            }),
            None => {
                state.connects += 1;
                Ok(Box::new(MockSession {
                    state: Arc::clone(&self.state),
                }))
            }
        }
    }
}

/// Session handed out by [`MockConnector`].
struct MockSession {
    state: Arc<Mutex<MockState>>,
}

impl RemoteSession for MockSession {
    fn exec(&mut self, command: &ShellCommand) -> Result<CommandOutput> {
        let line = command.as_line();
        let mut state = lock(&self.state);
        state.commands.push(line.clone());

        if state.broken_commands.iter().any(|needle| line.contains(needle)) {
            return Err(RemoteError::Session("mock channel failure".to_string()));
        }

        Ok(state
            .responses
            .iter()
            .find(|(needle, _)| line.contains(needle))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }

    fn upload(
        &mut self,
        source: &mut dyn Read,
        size: u64,
        destination: &str,
        mode: i32,
    ) -> Result<()> {
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).map_err(|e| RemoteError::Copy {
            destination: destination.to_string(),
            reason: e.to_string(),
        })?;

        let mut state = lock(&self.state);
        if state.fail_uploads {
            return Err(RemoteError::Copy {
                destination: destination.to_string(),
                reason: "mock upload failure".to_string(),
            });
        }
        if bytes.len() as u64 != size {
            return Err(RemoteError::Copy {
                destination: destination.to_string(),
                reason: format!("sent {} of {} bytes", bytes.len(), size),
            });
        }
        state.uploads.push(MockUpload {
            destination: destination.to_string(),
            bytes,
            mode,
        });
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        lock(&self.state).closes += 1;
    }
}
