// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote node module - address lookup, sessions and shell commands.

pub mod mock;
pub mod provider;
pub mod shell;
pub mod ssh;
mod traits;

pub use mock::{MockConnectFailure, MockConnector};
pub use provider::{AddressResolver, VastAiResolver};
pub use shell::ShellCommand;
pub use ssh::SshConnector;
pub use traits::*;
