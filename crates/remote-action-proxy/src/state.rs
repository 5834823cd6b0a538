// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide proxy state.
//!
//! The state has two transitions: [`ProxyState::try_initialize`], which hands
//! out the only [`InitGuard`] able to change anything, and
//! [`ProxyState::read_environment`] for the run path. Inits are serialized by
//! an async mutex, so a duplicate init waits for the one in flight and is then
//! rejected if that one succeeded.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{ProxyError, Result};

/// Environment variable carrying the provider API key.
pub const API_KEY_VAR: &str = "OPS_VASTAI_API_KEY";
/// Environment variable carrying the provider instance id.
pub const INSTANCE_ID_VAR: &str = "OPS_VASTAI_INSTANCE_ID";
/// Environment variable carrying the SSH private key.
pub const SSH_KEY_VAR: &str = "OPS_VASTAI_SSH_KEY";
/// Environment entry holding the resolved `host:port` of the node.
pub const SSH_URL_VAR: &str = "VASTAI_SSH_URL";

/// Credential variables seeded from the process environment at startup.
pub const CREDENTIAL_VARS: [&str; 3] = [API_KEY_VAR, INSTANCE_ID_VAR, SSH_KEY_VAR];

/// Location of the most recently extracted artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    /// Action base directory
    pub base_dir: PathBuf,
    /// Numbered directory of this artifact
    pub current_dir: u32,
    /// `bin/exec` path
    pub binary_path: PathBuf,
}

#[derive(Debug, Default)]
struct Inner {
    initialized: bool,
    environment: HashMap<String, String>,
    artifact: Option<ArtifactRecord>,
}

/// Shared lifecycle state of the proxy.
#[derive(Debug)]
pub struct ProxyState {
    debug: bool,
    init_lock: Mutex<()>,
    inner: RwLock<Inner>,
}

impl ProxyState {
    /// Create an uninitialized state with a starting environment.
    ///
    /// In debug mode init may be repeated.
    pub fn new(debug: bool, environment: HashMap<String, String>) -> Self {
        Self {
            debug,
            init_lock: Mutex::new(()),
            inner: RwLock::new(Inner {
                environment,
                ..Default::default()
            }),
        }
    }

    /// Start an init.
    ///
    /// Fails with [`ProxyError::AlreadyInitialized`] once an init has
    /// completed, unless debug mode is on.
    pub async fn try_initialize(&self) -> Result<InitGuard<'_>> {
        if self.is_initialized() && !self.debug {
            return Err(ProxyError::AlreadyInitialized);
        }
        let lock = self.init_lock.lock().await;
        // an init that held the lock may have finished meanwhile
        if self.is_initialized() && !self.debug {
            return Err(ProxyError::AlreadyInitialized);
        }
        Ok(InitGuard {
            state: self,
            _lock: lock,
        })
    }

    /// Whether an init has completed.
    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    /// Snapshot of the environment.
    pub fn read_environment(&self) -> HashMap<String, String> {
        self.read().environment.clone()
    }

    /// Location of the last extracted artifact.
    pub fn artifact(&self) -> Option<ArtifactRecord> {
        self.read().artifact.clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive right to mutate the state during one init.
///
/// Dropping the guard without calling [`InitGuard::complete`] leaves the
/// state uninitialized; environment changes made through it are kept.
pub struct InitGuard<'a> {
    state: &'a ProxyState,
    _lock: MutexGuard<'a, ()>,
}

impl InitGuard<'_> {
    /// Merge an init request's `env` into the environment.
    pub fn merge_env(&self, env: &Map<String, Value>) {
        let mut inner = self.state.write();
        for (key, value) in env {
            inner.environment.insert(key.clone(), env_value_to_string(value));
        }
        debug!(count = env.len(), "Merged action environment");
    }

    /// Set one environment entry.
    pub fn set_env(&self, key: &str, value: impl Into<String>) {
        self.state
            .write()
            .environment
            .insert(key.to_string(), value.into());
    }

    /// Read one environment entry.
    pub fn env(&self, key: &str) -> Option<String> {
        self.state.read().environment.get(key).cloned()
    }

    /// Remember where the artifact of this init lives.
    pub fn record_artifact(&self, artifact: ArtifactRecord) {
        self.state.write().artifact = Some(artifact);
    }

    /// Mark the proxy initialized.
    pub fn complete(self) {
        self.state.write().initialized = true;
    }
}

/// Strings are stored verbatim, anything else as compact JSON.
pub fn env_value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Credential entries present in the process environment.
pub fn credentials_from_process_env() -> HashMap<String, String> {
    CREDENTIAL_VARS
        .iter()
        .filter_map(|name| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (name.to_string(), v))
        })
        .collect()
}
