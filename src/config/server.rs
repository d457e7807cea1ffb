//! Server and networking configuration types.

use serde::Deserialize;

/// HTTP ingress configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port for the HTTP ingress.
    pub port: u16,
    /// Run the direct endpoint through the writer's retry loop.
    pub direct_retry: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7071,
            direct_retry: false,
        }
    }
}
