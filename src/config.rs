//! Service configuration.

use std::time::Duration;

use serde::Deserialize;

/// Default size of one resumable-upload chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Default number of buffered writes an upload stream holds before
/// `poll_write` returns pending.
pub const DEFAULT_UPLOAD_BUFFER_CHUNKS: usize = 4;

/// Per-service settings. Every field has a default, so a config can be
/// deserialized from a partial document.
///
/// # Example
///
/// ```
/// use gdata::ServiceConfig;
///
/// let config = ServiceConfig::new("my-app-1.0")
///     .with_api_version("3.0")
///     .with_locale("en_GB");
/// assert!(config.user_agent().starts_with("gdata/"));
/// assert!(config.user_agent().contains("my-app-1.0"));
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Application identifier appended to the user agent.
    pub client_id: String,
    /// Value of the `GData-Version` header.
    pub api_version: String,
    /// Sent as the `hl` query parameter.
    pub locale: Option<String>,
    /// Per-request timeout. None by default; callers use cancellation.
    pub timeout_secs: Option<u64>,
    /// Permit plain `http://` URIs. Only the test server needs this.
    pub allow_insecure_http: bool,
    pub resumable_chunk_size: usize,
    pub upload_buffer_chunks: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            api_version: "2".to_string(),
            locale: None,
            timeout_secs: None,
            allow_insecure_http: false,
            resumable_chunk_size: DEFAULT_CHUNK_SIZE,
            upload_buffer_chunks: DEFAULT_UPLOAD_BUFFER_CHUNKS,
        }
    }
}

impl ServiceConfig {
    #[must_use]
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_api_version(mut self, version: &str) -> Self {
        self.api_version = version.to_string();
        self
    }

    #[must_use]
    pub fn with_locale(mut self, locale: &str) -> Self {
        self.locale = Some(locale.to_string());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    #[must_use]
    pub fn with_insecure_http(mut self, allow: bool) -> Self {
        self.allow_insecure_http = allow;
        self
    }

    /// Resumable chunk size, rounded up to a multiple of 256 KiB as the
    /// upload protocol requires for every chunk but the last.
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        const GRANULE: usize = 256 * 1024;
        self.resumable_chunk_size = size.max(1).div_ceil(GRANULE) * GRANULE;
        self
    }

    #[must_use]
    pub fn with_upload_buffer_chunks(mut self, chunks: usize) -> Self {
        self.upload_buffer_chunks = chunks.max(1);
        self
    }

    /// `gdata/<version> <client id> (gzip)`.
    #[must_use]
    pub fn user_agent(&self) -> String {
        let version = env!("CARGO_PKG_VERSION");
        if self.client_id.is_empty() {
            format!("gdata/{version} (gzip)")
        } else {
            format!("gdata/{version} {} (gzip)", self.client_id)
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Rewrite `http://` to `https://` unless insecure HTTP is allowed.
    #[must_use]
    pub(crate) fn secure_uri(&self, uri: &str) -> String {
        match uri.strip_prefix("http://") {
            Some(rest) if !self.allow_insecure_http => format!("https://{rest}"),
            _ => uri.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.api_version, "2");
        assert_eq!(config.resumable_chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.timeout().is_none());
        assert!(!config.allow_insecure_http);
    }

    #[test]
    fn test_partial_deserialize() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"client_id": "app", "locale": "fr"}"#).unwrap();
        assert_eq!(config.client_id, "app");
        assert_eq!(config.locale.as_deref(), Some("fr"));
        assert_eq!(config.api_version, "2");
    }

    #[test]
    fn test_chunk_size_rounded() {
        let config = ServiceConfig::default().with_chunk_size(1);
        assert_eq!(config.resumable_chunk_size, 256 * 1024);
        let config = ServiceConfig::default().with_chunk_size(1024 * 1024);
        assert_eq!(config.resumable_chunk_size, 1024 * 1024);
    }

    #[test]
    fn test_secure_uri() {
        let config = ServiceConfig::default();
        assert_eq!(config.secure_uri("http://example.com/f"), "https://example.com/f");
        assert_eq!(config.secure_uri("https://example.com/f"), "https://example.com/f");

        let config = config.with_insecure_http(true);
        assert_eq!(config.secure_uri("http://127.0.0.1/f"), "http://127.0.0.1/f");
    }
}
