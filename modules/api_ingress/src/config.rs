use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// `modules.api_ingress` configuration section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiIngressConfig {
    /// `host:port`; empty means "use the server section".
    pub bind_addr: String,
    /// Per-request deadline covering middleware and handler; 0 disables it.
    pub request_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub max_header_bytes: usize,
    /// Serve the generated route description at `/openapi.json`.
    pub enable_docs: bool,
    pub cors: CorsConfig,
}

impl Default for ApiIngressConfig {
    fn default() -> Self {
        Self {
            bind_addr: String::new(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            enable_docs: false,
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// `None` answers with `*`.
    pub allowed_origin: Option<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origin: None,
            allowed_methods: ["GET", "HEAD", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
                .into_iter()
                .map(String::from)
                .collect(),
            allowed_headers: ["Content-Type", "Authorization"]
                .into_iter()
                .map(String::from)
                .collect(),
            allow_credentials: false,
        }
    }
}

impl CorsConfig {
    pub fn origin(&self) -> &str {
        self.allowed_origin.as_deref().unwrap_or("*")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngressConfigError {
    #[error("cors: allow_credentials cannot be combined with a wildcard origin")]
    CredentialsWithWildcard,
    #[error("cors: unknown method '{0}' in allowed_methods")]
    UnknownCorsMethod(String),
    #[error("max_body_bytes must be greater than 0")]
    ZeroBodyLimit,
    #[error("max_header_bytes must be greater than 0")]
    ZeroHeaderLimit,
    #[error("invalid bind address '{addr}': {reason}")]
    BindAddr { addr: String, reason: String },
}

impl ApiIngressConfig {
    pub fn validate(&self) -> Result<(), IngressConfigError> {
        if self.cors.allow_credentials && self.cors.origin() == "*" {
            return Err(IngressConfigError::CredentialsWithWildcard);
        }
        for m in &self.cors.allowed_methods {
            if http::Method::from_bytes(m.to_ascii_uppercase().as_bytes()).is_err() {
                return Err(IngressConfigError::UnknownCorsMethod(m.clone()));
            }
        }
        if self.max_body_bytes == 0 {
            return Err(IngressConfigError::ZeroBodyLimit);
        }
        if self.max_header_bytes == 0 {
            return Err(IngressConfigError::ZeroHeaderLimit);
        }
        if !self.bind_addr.is_empty() {
            self.bind_addr
                .parse::<std::net::SocketAddr>()
                .map_err(|e| IngressConfigError::BindAddr {
                    addr: self.bind_addr.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<std::time::Duration> {
        (self.request_timeout_ms > 0).then(|| std::time::Duration::from_millis(self.request_timeout_ms))
    }
}
