use crate::config::CorsConfig;
use crate::request::Response;

/// Pre-rendered CORS response headers.
#[derive(Debug, Clone)]
pub struct Cors {
    origin: String,
    methods: String,
    headers: String,
    credentials: bool,
}

impl Default for Cors {
    fn default() -> Self {
        Self::new(&CorsConfig::default())
    }
}

impl Cors {
    pub fn new(cfg: &CorsConfig) -> Self {
        Self {
            origin: cfg.origin().to_string(),
            methods: cfg
                .allowed_methods
                .iter()
                .map(|m| m.to_ascii_uppercase())
                .collect::<Vec<_>>()
                .join(", "),
            headers: cfg.allowed_headers.join(", "),
            credentials: cfg.allow_credentials,
        }
    }

    /// Set on every response before any middleware or handler runs.
    pub fn apply(&self, res: &mut Response) {
        res.header("Access-Control-Allow-Origin", &self.origin)
            .header("Access-Control-Allow-Methods", &self.methods)
            .header("Access-Control-Allow-Headers", &self.headers);
        if self.credentials {
            res.header("Access-Control-Allow-Credentials", "true");
        }
        if self.origin != "*" {
            res.header("Vary", "Origin");
        }
    }
}
