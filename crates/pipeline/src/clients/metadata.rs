//! HTTP / IPFS metadata client.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use super::MetadataSource;

/// Fetches token metadata over HTTP, resolving `ipfs://` through a gateway.
#[derive(Clone)]
pub struct HttpMetadataSource {
    client: Client,
    ipfs_gateway: String,
    max_bytes: usize,
}

impl HttpMetadataSource {
    /// Build a client with explicit settings.
    pub fn new(ipfs_gateway: String, max_bytes: usize, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("spinsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build metadata HTTP client")?;

        let ipfs_gateway = if ipfs_gateway.ends_with('/') {
            ipfs_gateway
        } else {
            format!("{}/", ipfs_gateway)
        };

        Ok(Self {
            client,
            ipfs_gateway,
            max_bytes,
        })
    }

    /// Turn a token URI into a fetchable URL.
    pub fn resolve_uri(&self, uri: &str) -> Option<String> {
        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return None;
        }

        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Some(trimmed.to_string());
        }

        ipfs_path(trimmed).map(|path| format!("{}{}", self.ipfs_gateway, path))
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch_json(&self, uri: &str) -> Result<Value> {
        if let Some(inline) = uri.trim().strip_prefix("data:application/json,") {
            return serde_json::from_str(inline).context("Invalid inline metadata JSON");
        }

        let Some(resolved) = self.resolve_uri(uri) else {
            bail!("Unsupported metadata URI: {}", uri);
        };

        let response = self
            .client
            .get(&resolved)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", resolved))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Metadata request to {} returned {}", resolved, status);
        }

        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                bail!("Metadata at {} is {} bytes, limit is {}", resolved, len, self.max_bytes);
            }
        }

        let bytes = response.bytes().await.context("Failed to read metadata")?;
        if bytes.len() > self.max_bytes {
            bail!(
                "Metadata at {} is {} bytes, limit is {}",
                resolved,
                bytes.len(),
                self.max_bytes
            );
        }

        serde_json::from_slice(&bytes).context("Invalid metadata JSON")
    }
}

/// Gateway-relative path of an IPFS URI (`ipfs://<cid>/...` or a gateway URL
/// containing `/ipfs/<cid>`).
pub fn ipfs_path(uri: &str) -> Option<&str> {
    let trimmed = uri.trim();
    let path = match trimmed.strip_prefix("ipfs://") {
        Some(rest) => rest.strip_prefix("ipfs/").unwrap_or(rest),
        None => {
            let idx = trimmed.find("/ipfs/")?;
            &trimmed[idx + "/ipfs/".len()..]
        }
    };

    let path = path.trim_start_matches('/');
    (!path.is_empty()).then_some(path)
}

/// Content hash (CID) of an IPFS URI.
pub fn ipfs_hash(uri: &str) -> Option<&str> {
    ipfs_path(uri)
        .and_then(|path| path.split(['/', '?', '#']).next())
        .filter(|cid| !cid.is_empty())
}
