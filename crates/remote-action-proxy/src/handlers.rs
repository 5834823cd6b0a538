// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action protocol handlers.
//!
//! `handle_init` turns an init request into a provisioned remote node;
//! `handle_run` forwards an activation to it. Both are transport agnostic and
//! return [`ProxyError`] values that the HTTP layer maps to responses.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::artifact::{
    ActionExtractor, ArtifactError, ArtifactLayout, CommandCompiler, Compiler, Extractor,
    extract_and_compile,
};
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::invoke::{Invocation, validate_output};
use crate::provision::{RemoteTarget, provision};
use crate::remote::{
    AddressResolver, Connector, RemoteAddress, RemoteError, RemoteInstanceRef, SshConnector,
    VastAiResolver,
};
use crate::state::{
    API_KEY_VAR, ArtifactRecord, INSTANCE_ID_VAR, InitGuard, ProxyState, SSH_KEY_VAR, SSH_URL_VAR,
    credentials_from_process_env,
};

/// Marker written to both captured streams after an init error report.
pub const OUTPUT_GUARD: &str = "XXX_THE_END_OF_A_WHISK_ACTIVATION_XXX\n";

/// Entry point used when the init request names none.
pub const DEFAULT_MAIN: &str = "main";

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Captured output and error streams of the action.
#[derive(Clone)]
pub struct OutputSinks {
    out: Sink,
    err: Sink,
}

impl OutputSinks {
    /// Use custom writers.
    pub fn new(out: impl Write + Send + 'static, err: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
            err: Arc::new(Mutex::new(Box::new(err))),
        }
    }

    /// Process stdout and stderr.
    pub fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr())
    }

    /// Report an init failure: the message on the error stream, then the
    /// guard on both streams.
    pub fn report_init_error(&self, message: &str) {
        let mut err = self.err.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let written = writeln!(err, "{}", message)
            .and_then(|_| out.write_all(OUTPUT_GUARD.as_bytes()))
            .and_then(|_| err.write_all(OUTPUT_GUARD.as_bytes()))
            .and_then(|_| out.flush())
            .and_then(|_| err.flush());
        if let Err(e) = written {
            warn!(error = %e, "Failed to write init error to captured streams");
        }
    }
}

/// Shared state for action handlers.
pub struct ActionHandlerState {
    /// Runtime configuration
    pub config: Config,
    /// Lifecycle state and action environment
    pub proxy: ProxyState,
    /// Unpacks init payloads
    pub extractor: Arc<dyn Extractor>,
    /// Optional compilation step
    pub compiler: Option<Arc<dyn Compiler>>,
    /// Provider lookup of the node address
    pub resolver: Arc<dyn AddressResolver>,
    /// Session factory for the node
    pub connector: Arc<dyn Connector>,
    /// Streams used for init error reports
    pub output: OutputSinks,
}

impl ActionHandlerState {
    /// Create handler state from configuration and remote collaborators.
    ///
    /// The environment starts empty; see [`ActionHandlerState::with_environment`].
    pub fn new(
        config: Config,
        resolver: Arc<dyn AddressResolver>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let compiler = config
            .compiler
            .as_ref()
            .map(|program| Arc::new(CommandCompiler::new(program.clone())) as Arc<dyn Compiler>);
        Self {
            proxy: ProxyState::new(config.debug, HashMap::new()),
            extractor: Arc::new(ActionExtractor::new(config.action_dir.clone())),
            compiler,
            resolver,
            connector,
            output: OutputSinks::stdio(),
            config,
        }
    }

    /// Create handler state talking to the real provider over SSH, with
    /// credentials seeded from the process environment.
    pub fn from_config(config: Config) -> std::result::Result<Self, RemoteError> {
        let resolver = VastAiResolver::new(config.provider_url.clone(), config.provider_timeout)?;
        let connector = SshConnector::new(config.remote_user.clone(), config.host_key_policy.clone())
            .with_timeout(config.remote_timeout);
        Ok(Self::new(config, Arc::new(resolver), Arc::new(connector))
            .with_environment(credentials_from_process_env()))
    }

    /// Replace the starting environment.
    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.proxy = ProxyState::new(self.config.debug, environment);
        self
    }

    /// Replace the extractor.
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Replace the compiler.
    pub fn with_compiler(mut self, compiler: Option<Arc<dyn Compiler>>) -> Self {
        self.compiler = compiler;
        self
    }

    /// Replace the captured output streams.
    pub fn with_output(mut self, output: OutputSinks) -> Self {
        self.output = output;
        self
    }

    fn invocation(&self) -> Invocation {
        Invocation {
            workdir: self.config.remote_workdir.clone(),
            entrypoint: self.config.remote_entrypoint.clone(),
            deadline: self.config.remote_timeout,
        }
    }
}

// ============================================================================
// Init
// ============================================================================

/// Init request body.
#[derive(Debug, Default, Deserialize)]
pub struct InitRequest {
    /// Action definition
    #[serde(default)]
    pub value: Option<InitValue>,
}

/// Action definition carried by an init request.
#[derive(Debug, Default, Deserialize)]
pub struct InitValue {
    /// Source text or base64 payload
    #[serde(default)]
    pub code: Option<String>,
    /// Whether `code` is base64
    #[serde(default)]
    pub binary: bool,
    /// Entry point name
    #[serde(default)]
    pub main: Option<String>,
    /// Environment entries to merge
    #[serde(default)]
    pub env: Option<Map<String, Value>>,
}

/// Handle an init request.
///
/// Rejects a repeated init, merges the environment, builds the artifact,
/// checks credentials, resolves the node address and provisions it. The
/// proxy only becomes initialized when every step succeeds.
pub async fn handle_init(state: &ActionHandlerState, body: &[u8]) -> Result<()> {
    let guard = state.proxy.try_initialize().await?;

    if let Some(compiler) = &state.config.compiler {
        debug!(compiler = %compiler, "Compiler configured");
    }
    debug!(bytes = body.len(), "Init request received");

    let request: InitRequest = serde_json::from_slice(body)
        .map_err(|e| ProxyError::BadRequest(format!("Error unmarshaling request: {}", e)))?;
    let value = request.value.unwrap_or_default();

    let code = match value.code {
        Some(code) if !code.is_empty() => code,
        _ => return Err(ProxyError::MissingCode),
    };

    if let Some(env) = &value.env {
        guard.merge_env(env);
    }

    let main = value
        .main
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| DEFAULT_MAIN.to_string());

    let payload = if value.binary {
        debug!("Decoding binary payload");
        STANDARD
            .decode(code.as_bytes())
            .map_err(|e| ProxyError::BadRequest(format!("cannot decode the request: {}", e)))?
    } else {
        debug!("Using plain text payload");
        code.into_bytes()
    };

    let binary = match extract_and_compile(
        Arc::clone(&state.extractor),
        state.compiler.clone(),
        payload,
        &main,
    )
    .await
    {
        Ok(binary) => binary,
        Err(e) => return Err(init_failure(state, e)),
    };
    record_artifact(&guard, &binary)?;
    info!(binary = %binary.display(), main = %main, "Action artifact ready");

    let instance = RemoteInstanceRef {
        api_key: required(&guard, API_KEY_VAR, "Vast.ai API key")?,
        instance_id: required(&guard, INSTANCE_ID_VAR, "Vast.ai Instance ID")?,
    };
    let private_key = required(&guard, SSH_KEY_VAR, "Vast.ai SSH key")?;

    let address = state
        .resolver
        .resolve(&instance)
        .await
        .map_err(ProxyError::ProviderLookup)?;
    guard.set_env(SSH_URL_VAR, address.to_string());
    info!(instance_id = %instance.instance_id, address = %address, "Remote node resolved");

    let target = RemoteTarget {
        address,
        private_key,
    };
    provision(
        Arc::clone(&state.connector),
        &target,
        binary,
        state.config.remote_timeout,
    )
    .await?;

    guard.complete();
    info!("Action initialized");
    Ok(())
}

fn init_failure(state: &ActionHandlerState, err: ArtifactError) -> ProxyError {
    error!(error = %err, "Failed to build action artifact");
    if state.config.log_init_error {
        state.output.report_init_error(&err.to_string());
        ProxyError::ArtifactLogged
    } else {
        ProxyError::Artifact(err)
    }
}

fn record_artifact(guard: &InitGuard<'_>, binary: &std::path::Path) -> Result<()> {
    let layout = ArtifactLayout::from_binary(binary)?;
    let base_dir = match layout.root.parent() {
        Some(parent) => parent.to_path_buf(),
        None => {
            debug!(root = %layout.root.display(), "Artifact root has no parent");
            std::path::PathBuf::new()
        }
    };
    let current_dir = numbered_dir(&layout.root).unwrap_or_else(|| {
        debug!(
            root = %layout.root.display(),
            "Artifact root is not a numbered directory, recording 0"
        );
        0
    });
    guard.record_artifact(ArtifactRecord {
        base_dir,
        current_dir,
        binary_path: binary.to_path_buf(),
    });
    Ok(())
}

/// The `<n>` of an artifact root `<base>/<n>`.
fn numbered_dir(root: &std::path::Path) -> Option<u32> {
    root.file_name()?.to_str()?.parse().ok()
}

fn required(guard: &InitGuard<'_>, name: &'static str, description: &'static str) -> Result<String> {
    guard
        .env(name)
        .filter(|v| !v.is_empty())
        .ok_or(ProxyError::MissingCredential { name, description })
}

// ============================================================================
// Run
// ============================================================================

/// Handle a run request and return the remote output to relay.
///
/// The body is forwarded as-is apart from newline removal; only output that
/// is a JSON object or array is returned.
pub async fn handle_run(state: &ActionHandlerState, body: &[u8]) -> Result<Vec<u8>> {
    if !state.proxy.is_initialized() {
        return Err(ProxyError::NotInitialized);
    }
    debug!(bytes = body.len(), "Run request received");
    let payload = std::str::from_utf8(body)
        .map_err(|e| ProxyError::BadRequest(format!("Error reading request body: {}", e)))?;

    let environment = state.proxy.read_environment();
    let address = environment
        .get(SSH_URL_VAR)
        .and_then(|url| RemoteAddress::parse(url))
        .ok_or(ProxyError::NotInitialized)?;
    let private_key = environment
        .get(SSH_KEY_VAR)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or(ProxyError::MissingCredential {
            name: SSH_KEY_VAR,
            description: "Vast.ai SSH key",
        })?;
    let target = RemoteTarget {
        address,
        private_key,
    };

    let output = state
        .invocation()
        .invoke(&state.connector, &target, payload)
        .await?;

    if let Err(e) = validate_output(&output) {
        warn!(bytes = output.len(), "Remote action output is not a JSON object or array");
        return Err(e);
    }
    Ok(output)
}
