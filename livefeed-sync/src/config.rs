//! Connection configuration.

use std::time::Duration;

use reqwest::Url;

use crate::chunk::AssemblyPolicy;
use crate::error::ConfigError;

/// Query flag asking upstream for `BASE64/GZIP:` envelopes.
pub const ACCEPT_GZIP_PARAM: &str = "accept-b64-gzip";
/// Query flag asking upstream to split large messages into fragments.
pub const ACCEPT_CHUNKS_PARAM: &str = "accept-sse-chunks";

/// Sync configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Upstream SSE endpoint (required)
    pub endpoint: String,
    /// Fixed delay before each reconnect attempt
    pub reconnect_delay: Duration,
    /// Timeout for establishing the HTTP connection
    pub connect_timeout: Duration,
    /// Negotiate compressed envelopes
    pub accept_compressed: bool,
    /// Negotiate chunked messages
    pub accept_chunks: bool,
    /// Bounds for incomplete fragment sequences
    pub assembly: AssemblyPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            accept_compressed: true,
            accept_chunks: true,
            assembly: AssemblyPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Check the endpoint and return the URL actually requested, with the
    /// negotiation flags appended.
    pub fn resolved_endpoint(&self) -> Result<String, ConfigError> {
        let raw = self.endpoint.trim();
        if raw.is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        let invalid = |reason: String| ConfigError::InvalidEndpoint {
            endpoint: raw.to_string(),
            reason,
        };

        let mut url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }

        if self.accept_compressed {
            append_flag(&mut url, ACCEPT_GZIP_PARAM);
        }
        if self.accept_chunks {
            append_flag(&mut url, ACCEPT_CHUNKS_PARAM);
        }
        Ok(url.into())
    }
}

/// Append `param=true` unless the query already sets `param`.
fn append_flag(url: &mut Url, param: &str) {
    if url.query_pairs().any(|(key, _)| key == param) {
        return;
    }
    url.query_pairs_mut().append_pair(param, "true");
}
