// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance address lookup against the provider's instance-status API.
//!
//! The provider answers `GET /api/v0/instances/<id>?owner=me&api_key=<key>`
//! with a document shaped like:
//!
//! ```text
//! {
//!   "instances": {
//!     "public_ipaddr": "203.0.113.7",
//!     "ports": { "22/tcp": [ { "HostIp": "0.0.0.0", "HostPort": "41022" } ] }
//!   }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, warn};

use super::traits::{RemoteAddress, RemoteError, RemoteInstanceRef, Result};

/// Port key under which the provider reports the forwarded SSH port.
pub const SSH_PORT_KEY: &str = "22/tcp";

/// Resolves the reachable SSH address of a rented instance.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Look up the public host and forwarded SSH port of `instance`.
    async fn resolve(&self, instance: &RemoteInstanceRef) -> Result<RemoteAddress>;
}

/// [`AddressResolver`] backed by the provider's REST API.
#[derive(Debug, Clone)]
pub struct VastAiResolver {
    client: reqwest::Client,
    base_url: String,
}

impl VastAiResolver {
    /// Create a resolver against `base_url` (e.g. `https://console.vast.ai`).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::ProviderRequest(format!("failed to build client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn instance_url(&self, instance: &RemoteInstanceRef) -> Result<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            RemoteError::ProviderRequest(format!("invalid provider URL '{}': {}", self.base_url, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                RemoteError::ProviderRequest(format!(
                    "provider URL '{}' cannot be a base",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(["api", "v0", "instances", instance.instance_id.as_str()]);
        url.query_pairs_mut()
            .append_pair("owner", "me")
            .append_pair("api_key", &instance.api_key);
        Ok(url)
    }
}

#[async_trait]
impl AddressResolver for VastAiResolver {
    async fn resolve(&self, instance: &RemoteInstanceRef) -> Result<RemoteAddress> {
        let url = self.instance_url(instance)?;
        debug!(instance_id = %instance.instance_id, "Looking up instance address");

        // the URL carries the API key, keep it out of errors and logs
        let response = self.client.get(url).send().await.map_err(|e| {
            let e = e.without_url();
            warn!(instance_id = %instance.instance_id, error = %e, "Instance lookup failed");
            RemoteError::ProviderRequest(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(instance_id = %instance.instance_id, %status, "Provider returned error status");
            return Err(RemoteError::ProviderRequest(format!(
                "provider returned status {}",
                status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RemoteError::ProviderRequest(e.without_url().to_string()))?;
        let document: Value = serde_json::from_slice(&body).map_err(|e| {
            RemoteError::MalformedProviderResponse(format!("response is not JSON: {}", e))
        })?;

        let address = parse_instance_address(&document)?;
        debug!(
            instance_id = %instance.instance_id,
            host = %address.host,
            port = %address.port,
            "Resolved instance address"
        );
        Ok(address)
    }
}

/// Extract the SSH address from an instance-status document.
///
/// Every level of nesting is checked and reported separately.
pub fn parse_instance_address(document: &Value) -> Result<RemoteAddress> {
    let instance = document
        .get("instances")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("missing instance record"))?;

    let ports = instance
        .get("ports")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("missing port map"))?;

    let bindings = ports
        .get(SSH_PORT_KEY)
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("no forwarded SSH port (22/tcp)"))?;

    let binding = bindings
        .first()
        .ok_or_else(|| malformed("empty host binding list for 22/tcp"))?;

    let port = match binding.get("HostPort") {
        Some(Value::String(port)) if !port.trim().is_empty() => port.trim().to_string(),
        Some(Value::Number(port)) => port.to_string(),
        _ => return Err(malformed("missing HostPort in 22/tcp binding")),
    };

    let host = instance
        .get("public_ipaddr")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| malformed("missing public_ipaddr"))?;

    Ok(RemoteAddress::new(host, port))
}

fn malformed(reason: &str) -> RemoteError {
    RemoteError::MalformedProviderResponse(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reason(document: Value) -> String {
        match parse_instance_address(&document) {
            Err(RemoteError::MalformedProviderResponse(reason)) => reason,
            other => panic!("expected malformed response, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_complete_document() {
        let document = json!({
            "instances": {
                "public_ipaddr": "203.0.113.7\n",
                "ports": {"22/tcp": [{"HostIp": "0.0.0.0", "HostPort": "41022"}]}
            }
        });
        let address = parse_instance_address(&document).unwrap();
        assert_eq!(address, RemoteAddress::new("203.0.113.7", "41022"));
    }

    #[test]
    fn test_numeric_host_port() {
        let document = json!({
            "instances": {
                "public_ipaddr": "203.0.113.7",
                "ports": {"22/tcp": [{"HostPort": 41022}]}
            }
        });
        assert_eq!(parse_instance_address(&document).unwrap().port, "41022");
    }

    #[test]
    fn test_each_missing_level_is_distinct() {
        assert_eq!(reason(json!({})), "missing instance record");
        assert_eq!(reason(json!({"instances": null})), "missing instance record");
        assert_eq!(reason(json!({"instances": {}})), "missing port map");
        assert_eq!(
            reason(json!({"instances": {"ports": {"8080/tcp": []}}})),
            "no forwarded SSH port (22/tcp)"
        );
        assert_eq!(
            reason(json!({"instances": {"ports": {"22/tcp": []}}})),
            "empty host binding list for 22/tcp"
        );
        assert_eq!(
            reason(json!({"instances": {"ports": {"22/tcp": [{"HostIp": "0.0.0.0"}]}}})),
            "missing HostPort in 22/tcp binding"
        );
        assert_eq!(
            reason(json!({"instances": {"ports": {"22/tcp": [{"HostPort": "41022"}]}}})),
            "missing public_ipaddr"
        );
    }

    #[test]
    fn test_instance_url_encodes_query() {
        let resolver = VastAiResolver::new("https://console.example.com/", Duration::from_secs(1)).unwrap();
        let url = resolver
            .instance_url(&RemoteInstanceRef {
                api_key: "k&y".to_string(),
                instance_id: "12345".to_string(),
            })
            .unwrap();
        assert_eq!(url.path(), "/api/v0/instances/12345");
        assert_eq!(url.query(), Some("owner=me&api_key=k%26y"));
    }
}
