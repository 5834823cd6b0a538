// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote shell command construction.
//!
//! Every value that reaches the remote shell (directory names, archive
//! paths, the run payload) goes through [`quote`], so shell metacharacters in
//! user data are never interpreted. Only operator-configured fragments such as
//! the entry point are inserted verbatim via [`ShellCommand::raw`].

use std::borrow::Cow;
use std::fmt;

use shell_escape::unix::escape;

/// Quote a single argument for a POSIX shell.
pub fn quote(arg: &str) -> String {
    escape(Cow::Borrowed(arg)).into_owned()
}

/// A shell command line built from quoted arguments.
///
/// Commands can be chained with [`ShellCommand::and_then`], which joins them
/// with `&&`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellCommand {
    parts: Vec<String>,
}

impl ShellCommand {
    /// Start a command with a program name.
    pub fn new(program: &str) -> Self {
        Self {
            parts: vec![quote(program)],
        }
    }

    /// Start a command from a trusted, pre-formed shell fragment.
    pub fn raw(fragment: impl Into<String>) -> Self {
        Self {
            parts: vec![fragment.into()],
        }
    }

    /// `cd <dir>`
    pub fn cd(dir: &str) -> Self {
        Self::new("cd").arg(dir)
    }

    /// Append a quoted argument.
    pub fn arg(mut self, arg: &str) -> Self {
        self.parts.push(quote(arg));
        self
    }

    /// Run `next` only if this command succeeds.
    pub fn and_then(mut self, next: ShellCommand) -> Self {
        self.parts.push("&&".to_string());
        self.parts.extend(next.parts);
        self
    }

    /// The command line as sent to the remote shell.
    pub fn as_line(&self) -> String {
        self.parts.join(" ")
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_line())
    }
}
