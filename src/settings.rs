//! Environment-driven configuration for the controller.

use std::path::PathBuf;

/// Runtime settings, sourced from environment variables with defaults that
/// match a stock nginx container layout.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path the rendered nginx configuration is committed to
    pub nginx_config_path: PathBuf,

    /// nginx binary used for the child process and `-t` validation
    pub nginx_binary: String,

    /// Docker daemon endpoint (unix:// or tcp://); None means bollard defaults
    pub docker_host: Option<String>,

    /// Directory for cached snippet and FastCGI parameter files
    pub snippet_cache_dir: PathBuf,

    /// Path to the output template (subject to the search order in render)
    pub template_path: PathBuf,

    /// Directory holding TLS certificate/key pairs referenced by server blocks
    pub ssl_dir: PathBuf,

    /// Loopback port for the health HTTP endpoints
    pub health_port: u16,

    /// When true, a Critical error terminates the process (exit code 1)
    pub strict_errors: bool,
}

impl Settings {
    /// Build settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            nginx_config_path: env_or("NGINX_CONFIG_PATH", "/etc/nginx/conf.d/docker-ingress.conf").into(),
            nginx_binary: env_or("NGINX_BINARY", "nginx"),
            docker_host: std::env::var("DOCKER_HOST").ok().filter(|v| !v.is_empty()),
            snippet_cache_dir: env_or("SNIPPET_CACHE_DIR", "/tmp/nginx-ingress-snippets").into(),
            template_path: env_or("TEMPLATE_PATH", "templates/nginx.conf.tmpl").into(),
            ssl_dir: env_or("SSL_DIR", "/etc/nginx/ssl").into(),
            health_port: std::env::var("HEALTH_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            strict_errors: std::env::var("STRICT_ERRORS")
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
                .unwrap_or(false),
        }
    }

    /// Default certificate/key pair emitted at startup.
    pub fn default_cert_path(&self) -> PathBuf {
        self.ssl_dir.join("default.crt")
    }

    pub fn default_key_path(&self) -> PathBuf {
        self.ssl_dir.join("default.key")
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            nginx_config_path: "/etc/nginx/conf.d/docker-ingress.conf".into(),
            nginx_binary: "nginx".to_string(),
            docker_host: None,
            snippet_cache_dir: "/tmp/nginx-ingress-snippets".into(),
            template_path: "templates/nginx.conf.tmpl".into(),
            ssl_dir: "/etc/nginx/ssl".into(),
            health_port: 8080,
            strict_errors: false,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}
