// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for remote-action-proxy.
//!
//! Every variant maps to an HTTP status: 4xx for caller input, 502 for
//! anything that depends on the remote node or the provider, 500 for local
//! failures while answering.

use std::fmt;

use axum::http::StatusCode;
use thiserror::Error;

use crate::artifact::ArtifactError;
use crate::remote::RemoteError;

/// Provisioning step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    /// Remote directory creation and local archive packaging.
    CreateFolders,
    /// Archive copy to the node.
    Transfer,
    /// Remote unpack.
    Unpack,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CreateFolders => "creating action folder on",
            Self::Transfer => "transferring action to",
            Self::Unpack => "unpacking action on",
        })
    }
}

/// Action proxy errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// Init was called after a successful init outside debug mode.
    #[error("Cannot initialize the action more than once.")]
    AlreadyInitialized,

    /// Run was called before a successful init.
    #[error("no action defined yet")]
    NotInitialized,

    /// The request body could not be read, parsed or decoded.
    #[error("{0}")]
    BadRequest(String),

    /// Init carried no code.
    #[error("Missing main/no code to execute.")]
    MissingCode,

    /// A remote-node credential is absent from the action environment.
    #[error("{description} not found (use -p {name} <value> when creating the action.)")]
    MissingCredential {
        /// Environment variable name.
        name: &'static str,
        /// Human-readable credential name.
        description: &'static str,
    },

    /// Extraction or compilation failed.
    #[error("{0}")]
    Artifact(#[from] ArtifactError),

    /// Extraction or compilation failed and the details went to the captured logs.
    #[error("The action failed to generate or locate a binary. See logs for details.")]
    ArtifactLogged,

    /// The provider lookup failed or returned an unusable document.
    #[error("Error looking up the remote instance: {0}")]
    ProviderLookup(#[source] RemoteError),

    /// The node could not be reached or refused the credentials.
    #[error("Error connecting to the remote node: {0}")]
    Connection(#[source] RemoteError),

    /// A provisioning step failed.
    #[error("Error {step} the remote node: {source}")]
    RemoteProvisioningFailed {
        /// Failed step.
        step: ProvisionStep,
        /// Underlying failure.
        #[source]
        source: RemoteError,
    },

    /// The remote entry point could not be run or exited unsuccessfully.
    #[error("Error running the action on the remote node: {0}")]
    RemoteExecutionFailed(#[source] RemoteError),

    /// The remote entry point printed something other than a JSON object or array.
    #[error("The action did not return a dictionary or array.")]
    InvalidRemoteOutput,

    /// The relayed response could not be written completely.
    #[error("{0}")]
    ResponseWriteFailed(String),
}

/// Result type using [`ProxyError`].
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// HTTP status reported to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AlreadyInitialized | Self::MissingCode => StatusCode::FORBIDDEN,
            Self::BadRequest(_) | Self::MissingCredential { .. } => StatusCode::BAD_REQUEST,
            Self::NotInitialized | Self::ResponseWriteFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Artifact(_)
            | Self::ArtifactLogged
            | Self::ProviderLookup(_)
            | Self::Connection(_)
            | Self::RemoteProvisioningFailed { .. }
            | Self::RemoteExecutionFailed(_)
            | Self::InvalidRemoteOutput => StatusCode::BAD_GATEWAY,
        }
    }
}
