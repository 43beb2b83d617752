//! Label-driven route configuration.
//!
//! Containers opt into routing by carrying labels under the `nginx.ingress.`
//! prefix. This module turns a label map into a validated [`RouteConfig`];
//! one malformed container yields a typed error the reconciler downgrades to
//! a warning without touching the rest of the batch.

use std::collections::HashMap;

/// Reserved label prefix.
pub const LABEL_PREFIX: &str = "nginx.ingress";

pub const LABEL_ENABLE: &str = "nginx.ingress.enable";
pub const LABEL_HOST: &str = "nginx.ingress.host";
pub const LABEL_PORT: &str = "nginx.ingress.port";
pub const LABEL_PATH: &str = "nginx.ingress.path";
pub const LABEL_PROTOCOL: &str = "nginx.ingress.protocol";
pub const LABEL_PRIORITY: &str = "nginx.ingress.priority";
pub const LABEL_RULE: &str = "nginx.ingress.rule";
pub const LABEL_TLS: &str = "nginx.ingress.tls";
pub const LABEL_CERT_NAME: &str = "nginx.ingress.tls.certname";
pub const LABEL_LB_METHOD: &str = "nginx.ingress.loadbalancer.method";
pub const LABEL_HEALTHCHECK: &str = "nginx.ingress.healthcheck";
pub const LABEL_HEALTHCHECK_PATH: &str = "nginx.ingress.healthcheck.path";
pub const LABEL_AUTH: &str = "nginx.ingress.auth";
pub const LABEL_CORS: &str = "nginx.ingress.cors";
pub const LABEL_CORS_ORIGINS: &str = "nginx.ingress.cors.origins";
pub const LABEL_CORS_METHODS: &str = "nginx.ingress.cors.methods";
pub const LABEL_CONFIGURATION_SNIPPET: &str = "nginx.ingress.configuration-snippet";
pub const LABEL_SERVER_SNIPPET: &str = "nginx.ingress.server-snippet";
pub const LABEL_BACKEND_PROTOCOL: &str = "nginx.ingress.backend-protocol";
pub const LABEL_FASTCGI_INDEX: &str = "nginx.ingress.fastcgi-index";
pub const LABEL_FASTCGI_PARAMS: &str = "nginx.ingress.fastcgi-params";
pub const LABEL_FASTCGI_PARAMS_FILE: &str = "nginx.ingress.fastcgi-params-file";

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_PATH: &str = "/";
pub const DEFAULT_PROTOCOL: &str = "http";
pub const DEFAULT_PRIORITY: i32 = 100;
pub const DEFAULT_HEALTHCHECK_PATH: &str = "/health";
pub const DEFAULT_LB_METHOD: &str = "round_robin";

/// Extraction failures, downgraded per-container by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("label {0} is required when ingress is enabled")]
    MissingField(&'static str),
    #[error("label {label}: invalid value '{value}': {reason}")]
    InvalidValue {
        label: &'static str,
        value: String,
        reason: String,
    },
}

/// Load balancing configuration for an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerConfig {
    /// round_robin, least_conn or ip_hash
    pub method: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            method: DEFAULT_LB_METHOD.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: DEFAULT_HEALTHCHECK_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    pub enabled: bool,
    /// basic or digest, stored verbatim
    pub auth_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FastCgiConfig {
    /// True iff backend-protocol equals FCGI (case-insensitive)
    pub enabled: bool,
    pub index: String,
    pub params: HashMap<String, String>,
    /// In-container path to a parameter file
    pub params_file: String,
}

/// Validated routing configuration derived from one container's labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub container_id: String,
    pub container_name: String,
    pub address: String,

    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub protocol: String,
    pub priority: i32,
    /// Free-form advanced rule, passed through to the rendered location
    pub rule: String,

    pub tls: bool,
    pub cert_name: String,

    pub load_balancer: LoadBalancerConfig,
    pub healthcheck: HealthCheckConfig,
    pub auth: AuthConfig,
    pub cors: CorsConfig,

    /// In-container path of a location-scope fragment
    pub configuration_snippet: String,
    /// In-container path of a server-scope fragment
    pub server_snippet: String,

    pub fastcgi: FastCgiConfig,
}

impl RouteConfig {
    fn disabled(container_id: String, container_name: String, address: String) -> Self {
        Self {
            container_id,
            container_name,
            address,
            enabled: false,
            host: String::new(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            priority: DEFAULT_PRIORITY,
            rule: String::new(),
            tls: false,
            cert_name: String::new(),
            load_balancer: LoadBalancerConfig::default(),
            healthcheck: HealthCheckConfig::default(),
            auth: AuthConfig::default(),
            cors: CorsConfig::default(),
            configuration_snippet: String::new(),
            server_snippet: String::new(),
            fastcgi: FastCgiConfig::default(),
        }
    }
}

/// True when any label key lives under the reserved prefix.
pub fn has_ingress_labels(labels: &HashMap<String, String>) -> bool {
    labels.keys().any(|key| key.starts_with(LABEL_PREFIX))
}

/// Permissive boolean: true, 1, yes, on (any case) are true; all else false.
pub fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Extract and validate the route configuration for one container.
///
/// A container whose `.enable` label is absent or falsy comes back with
/// `enabled: false` and no further validation.
pub fn extract_route(
    container_id: &str,
    container_name: &str,
    address: &str,
    labels: &HashMap<String, String>,
) -> Result<RouteConfig, LabelError> {
    let mut route = RouteConfig::disabled(
        container_id.to_string(),
        container_name.to_string(),
        address.to_string(),
    );

    match labels.get(LABEL_ENABLE) {
        Some(value) if parse_bool(value) => route.enabled = true,
        _ => return Ok(route),
    }

    let host = labels
        .get(LABEL_HOST)
        .ok_or(LabelError::MissingField(LABEL_HOST))?;
    validate_hostname(host).map_err(|reason| LabelError::InvalidValue {
        label: LABEL_HOST,
        value: host.clone(),
        reason,
    })?;
    route.host = host.clone();

    if let Some(port) = labels.get(LABEL_PORT) {
        route.port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| LabelError::InvalidValue {
                label: LABEL_PORT,
                value: port.clone(),
                reason: "expected an integer in 1..65535".to_string(),
            })?;
    }

    if let Some(protocol) = labels.get(LABEL_PROTOCOL) {
        if protocol != "http" && protocol != "https" {
            return Err(LabelError::InvalidValue {
                label: LABEL_PROTOCOL,
                value: protocol.clone(),
                reason: "must be http or https".to_string(),
            });
        }
        route.protocol = protocol.clone();
    }

    if let Some(path) = labels.get(LABEL_PATH) {
        if !path.starts_with('/') {
            return Err(LabelError::InvalidValue {
                label: LABEL_PATH,
                value: path.clone(),
                reason: "must start with '/'".to_string(),
            });
        }
        route.path = path.clone();
    }

    // Malformed priority silently falls back to the default
    if let Some(priority) = labels.get(LABEL_PRIORITY) {
        if let Ok(value) = priority.parse::<i32>() {
            route.priority = value;
        }
    }

    if let Some(rule) = labels.get(LABEL_RULE) {
        route.rule = rule.clone();
    }

    route.tls = labels.get(LABEL_TLS).is_some_and(|v| parse_bool(v));
    if let Some(cert_name) = labels.get(LABEL_CERT_NAME) {
        route.cert_name = cert_name.clone();
    }

    // Unknown load balancing methods fall back to round_robin
    if let Some(method) = labels.get(LABEL_LB_METHOD) {
        if matches!(method.as_str(), "round_robin" | "least_conn" | "ip_hash") {
            route.load_balancer.method = method.clone();
        }
    }

    route.healthcheck.enabled = labels.get(LABEL_HEALTHCHECK).is_some_and(|v| parse_bool(v));
    if let Some(path) = labels.get(LABEL_HEALTHCHECK_PATH) {
        route.healthcheck.path = path.clone();
    }

    if let Some(auth_type) = labels.get(LABEL_AUTH) {
        route.auth.enabled = true;
        route.auth.auth_type = auth_type.clone();
    }

    if labels.get(LABEL_CORS).is_some_and(|v| parse_bool(v)) {
        route.cors.enabled = true;
        if let Some(origins) = labels.get(LABEL_CORS_ORIGINS) {
            route.cors.allow_origins = split_csv(origins);
        }
        if let Some(methods) = labels.get(LABEL_CORS_METHODS) {
            route.cors.allow_methods = split_csv(methods);
        }
    }

    if let Some(snippet) = labels.get(LABEL_CONFIGURATION_SNIPPET) {
        route.configuration_snippet = snippet.clone();
    }
    if let Some(snippet) = labels.get(LABEL_SERVER_SNIPPET) {
        route.server_snippet = snippet.clone();
    }

    if let Some(backend_protocol) = labels.get(LABEL_BACKEND_PROTOCOL) {
        route.fastcgi.enabled = backend_protocol.eq_ignore_ascii_case("FCGI");
    }
    if let Some(index) = labels.get(LABEL_FASTCGI_INDEX) {
        route.fastcgi.index = index.clone();
    }
    if let Some(params) = labels.get(LABEL_FASTCGI_PARAMS) {
        route.fastcgi.params = parse_inline_params(params);
    }
    if let Some(params_file) = labels.get(LABEL_FASTCGI_PARAMS_FILE) {
        route.fastcgi.params_file = params_file.clone();
    }

    Ok(route)
}

/// Parse `K=V,K=V` label values, trimming whitespace and stripping a single
/// layer of surrounding quotes.
pub fn parse_inline_params(value: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in value.split(',') {
        let Some((key, val)) = pair.trim().split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        params.insert(key.to_string(), strip_quotes(val.trim()).to_string());
    }
    params
}

/// Strip one layer of matching single or double quotes.
pub fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

/// DNS-shape validation: non-empty, at most 253 chars, no empty labels,
/// labels at most 63 chars, no leading or trailing dot.
pub fn validate_hostname(hostname: &str) -> Result<(), String> {
    if hostname.is_empty() {
        return Err("hostname cannot be empty".to_string());
    }
    if hostname.len() > 253 {
        return Err("hostname too long (max 253 characters)".to_string());
    }
    if hostname.starts_with('.') || hostname.ends_with('.') {
        return Err("hostname cannot start or end with a dot".to_string());
    }
    for part in hostname.split('.') {
        if part.is_empty() {
            return Err("hostname cannot have empty parts".to_string());
        }
        if part.len() > 63 {
            return Err(format!("hostname part '{}' too long (max 63 characters)", part));
        }
    }
    Ok(())
}

/// Sanitize a container name for use inside nginx upstream names.
pub fn sanitize_container_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if matches!(c, '-' | '.' | '/') { '_' } else { c })
        .collect();
    let trimmed = sanitized.trim_matches('_');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}
