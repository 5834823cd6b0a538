// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote Action Proxy - OpenWhisk action runtime backed by a rented GPU node
//!
//! This crate implements the OpenWhisk action protocol (`POST /init`,
//! `POST /run`) but executes the action on a Vast.ai instance instead of
//! locally. Init builds the artifact, resolves the instance's forwarded SSH
//! address through the provider API and ships the artifact over SSH; run
//! forwards each activation payload to the node and relays its JSON output.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       OpenWhisk invoker                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                     │ POST /init            │ POST /run
//!                     ▼                       ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 remote-action-proxy (This Crate)                         │
//! │                         Port 8080                                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │  Artifact   │  │   Proxy     │  │  Provision  │  │   Invoke    │     │
//! │  │  (extract,  │  │   State     │  │ (mkdir, scp,│  │ (exec, JSON │     │
//! │  │   compile)  │  │  (env, once)│  │   unzip)    │  │   check)    │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │ HTTPS (instance lookup)                  │ SSH
//!           ▼                                          ▼
//! ┌───────────────────────────┐          ┌─────────────────────────────────┐
//! │   Vast.ai provider API    │          │     Rented remote node          │
//! │   /api/v0/instances/<id>  │          │  (unpacked artifact, runtime)   │
//! └───────────────────────────┘          └─────────────────────────────────┘
//! ```
//!
//! # Endpoints
//!
//! | Route | Success | Description |
//! |-------|---------|-------------|
//! | `POST /init` | `{"ok":true}` | Build and provision the action (once) |
//! | `POST /run` | remote output | Run the action on the node |
//! | anything else | 404 | `{"error":"invalid request"}` |
//!
//! # Action Credentials
//!
//! Supplied through the init `env` (or the process environment):
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `OPS_VASTAI_API_KEY` | Provider API key |
//! | `OPS_VASTAI_INSTANCE_ID` | Rented instance id |
//! | `OPS_VASTAI_SSH_KEY` | Private key authorized on the instance |
//!
//! # Configuration
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `OW_PORT` | HTTP listen port | `8080` |
//! | `OW_DEBUG` | Allow repeated init, debug logging | unset |
//! | `OW_LOG_INIT_ERROR` | Report init failures on the captured streams | unset |
//! | `OW_COMPILER` | Compiler run during init | unset |
//! | `OW_ACTION_DIR` | Local artifact directory | `./action` |
//! | `OW_PROVIDER_URL` | Provider API base URL | `https://console.vast.ai` |
//! | `OW_REMOTE_USER` | SSH login user | `root` |
//! | `OW_REMOTE_WORKDIR` | Remote directory for run | `/action` |
//! | `OW_REMOTE_ENTRYPOINT` | Remote entry point | `python3 __main__.py` |
//! | `OW_REMOTE_TIMEOUT_SECS` | Deadline per remote operation (0 disables) | `600` |
//! | `OW_PROVIDER_TIMEOUT_SECS` | Provider lookup timeout | `30` |
//! | `OW_SSH_HOST_KEY` | `insecure`, `sha256:<fp>` or `known-hosts:<path>` | `insecure` |
//! | `OW_MAX_RESPONSE_BYTES` | Largest relayed output | `10485760` |

pub mod artifact;
pub mod config;
pub mod error;
pub mod handlers;
pub mod invoke;
pub mod provision;
pub mod remote;
pub mod server;
pub mod state;

pub use config::Config;
pub use error::{ProxyError, Result};
pub use handlers::{ActionHandlerState, OutputSinks, handle_init, handle_run};
pub use server::{router, serve};
pub use state::ProxyState;
