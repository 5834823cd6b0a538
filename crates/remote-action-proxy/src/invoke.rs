// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote invocation and output validation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::provision::{RemoteTarget, open_session, with_deadline};
use crate::remote::{Connector, ShellCommand};

/// Longest prefix of remote output shown in debug logs.
pub const DEBUG_LIMIT: usize = 120;

/// Remove every newline so the payload is a single line.
pub fn normalize_payload(body: &str) -> String {
    body.replace('\n', "")
}

/// `cd <workdir> && <entrypoint> <quoted payload>`
pub fn run_command(workdir: &str, entrypoint: &str, payload: &str) -> ShellCommand {
    ShellCommand::cd(workdir).and_then(ShellCommand::raw(entrypoint).arg(payload))
}

/// How the entry point is run on the node.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Remote working directory
    pub workdir: String,
    /// Entry point command, inserted verbatim
    pub entrypoint: String,
    /// Deadline for connecting and for running
    pub deadline: Option<Duration>,
}

impl Invocation {
    /// Run the entry point with `payload` on a fresh session and return its stdout.
    ///
    /// Remote stderr is logged, never relayed.
    pub async fn invoke(
        &self,
        connector: &Arc<dyn Connector>,
        target: &RemoteTarget,
        payload: &str,
    ) -> Result<Vec<u8>> {
        let payload = normalize_payload(payload);
        let command = run_command(&self.workdir, &self.entrypoint, &payload);

        let mut session = open_session(connector, target, self.deadline).await?;
        let output = with_deadline(self.deadline, move || session.exec(&command))
            .await
            .map_err(ProxyError::RemoteExecutionFailed)?;

        if !output.stderr.is_empty() {
            warn!(
                address = %target.address,
                stderr = %output.stderr_lossy(),
                "Remote action wrote to stderr"
            );
        }
        let output = output.check().map_err(ProxyError::RemoteExecutionFailed)?;

        debug!(
            bytes = output.stdout.len(),
            received = %truncate_for_log(&output.stdout),
            "Remote action finished"
        );
        Ok(output.stdout)
    }
}

/// Accept only output that parses as a JSON object or array.
pub fn validate_output(output: &[u8]) -> Result<()> {
    match serde_json::from_slice::<Value>(output) {
        Ok(Value::Object(_)) | Ok(Value::Array(_)) => Ok(()),
        _ => Err(ProxyError::InvalidRemoteOutput),
    }
}

fn truncate_for_log(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    match text.char_indices().nth(DEBUG_LIMIT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CommandOutput, MockConnector, RemoteAddress, RemoteError};

    fn target() -> RemoteTarget {
        RemoteTarget {
            address: RemoteAddress::new("10.0.0.7", "40022"),
            private_key: "key".to_string(),
        }
    }

    fn invocation() -> Invocation {
        Invocation {
            workdir: "/action".to_string(),
            entrypoint: "python3 __main__.py".to_string(),
            deadline: None,
        }
    }

    #[test]
    fn test_normalize_payload() {
        assert_eq!(normalize_payload("{\n\"a\": 1\n}\n"), "{\"a\": 1}");
        assert_eq!(normalize_payload("\r\n"), "\r");

        let body = "{\"s\":\"\u{e9}t\u{e9}\"}\n\n";
        let newlines = body.matches('\n').count();
        assert_eq!(normalize_payload(body).len(), body.len() - newlines);
    }

    #[test]
    fn test_run_command_quotes_payload() {
        let cmd = run_command("/action", "python3 __main__.py", r#"{"value":{"name":"o'neil"}}"#);
        assert_eq!(
            cmd.as_line(),
            r#"cd /action && python3 __main__.py '{"value":{"name":"o'\''neil"}}'"#
        );
    }

    #[test]
    fn test_validate_output() {
        assert!(validate_output(br#"{"ok":true}"#).is_ok());
        assert!(validate_output(b"[1,2]").is_ok());
        assert!(validate_output(b"  {}\n").is_ok());
        assert!(matches!(
            validate_output(b"hello"),
            Err(ProxyError::InvalidRemoteOutput)
        ));
        assert!(validate_output(b"42").is_err());
        assert!(validate_output(b"\"text\"").is_err());
        assert!(validate_output(b"").is_err());
    }

    #[test]
    fn test_truncate_for_log() {
        let long = "x".repeat(DEBUG_LIMIT + 10);
        let shown = truncate_for_log(long.as_bytes());
        assert_eq!(shown.len(), DEBUG_LIMIT + 3);
        assert_eq!(truncate_for_log(b"short"), "short");
    }

    #[tokio::test]
    async fn test_invoke_returns_stdout() {
        let mock = MockConnector::new();
        mock.respond_with_stdout("__main__.py", br#"{"greeting":"hi"}"#);
        let connector: Arc<dyn Connector> = Arc::new(mock.clone());

        let stdout = invocation()
            .invoke(&connector, &target(), "{\"value\":\n{}}")
            .await
            .unwrap();

        assert_eq!(stdout, br#"{"greeting":"hi"}"#.to_vec());
        assert_eq!(
            mock.commands(),
            vec![r#"cd /action && python3 __main__.py '{"value":{}}'"#]
        );
        assert_eq!(mock.connections(), 1);
        assert_eq!(mock.closed(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_execution_failure() {
        let mock = MockConnector::new();
        mock.respond_to(
            "__main__.py",
            CommandOutput {
                stdout: b"{}".to_vec(),
                stderr: b"Traceback".to_vec(),
                exit_status: 1,
            },
        );
        let connector: Arc<dyn Connector> = Arc::new(mock.clone());

        let err = invocation()
            .invoke(&connector, &target(), "{}")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProxyError::RemoteExecutionFailed(RemoteError::CommandFailed { exit_status: 1, .. })
        ));
        assert_eq!(mock.closed(), 1);
    }

    #[tokio::test]
    async fn test_channel_failure_is_execution_failure() {
        let mock = MockConnector::new();
        mock.break_command("__main__.py");
        let connector: Arc<dyn Connector> = Arc::new(mock.clone());

        let err = invocation()
            .invoke(&connector, &target(), "{}")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProxyError::RemoteExecutionFailed(RemoteError::Session(_))
        ));
        assert_eq!(mock.closed(), 1);
    }
}
