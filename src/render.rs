//! Rendering of the nginx configuration.
//!
//! Generation maps the current set of enabled routes (plus any pre-fetched
//! snippet and FastCGI inputs) to an [`NginxConfig`] model, then substitutes
//! the emitted upstream and server blocks into a template file. For identical
//! input the output is byte-identical: hosts, group members and parameter
//! maps are all emitted in sorted order, and the `Generated` timestamp never
//! reaches the rendered text.

use crate::labels::{sanitize_container_name, RouteConfig};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Pre-fetched per-container inputs the generator splices in.
#[derive(Debug, Clone, Default)]
pub struct RouteExtras {
    pub configuration_snippet: Option<String>,
    pub server_snippet: Option<String>,
    pub fastcgi_params: Option<BTreeMap<String, String>>,
}

/// The complete rendered-configuration model.
#[derive(Debug, Clone, PartialEq)]
pub struct NginxConfig {
    pub generated: DateTime<Utc>,
    pub upstreams: Vec<Upstream>,
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upstream {
    pub name: String,
    /// round_robin emits no directive; least_conn and ip_hash do
    pub method: String,
    pub servers: Vec<UpstreamServer>,
    pub healthcheck: bool,
    pub health_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamServer {
    pub address: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Server {
    pub server_name: String,
    pub listen: Vec<String>,
    pub ssl: Option<SslConfig>,
    pub server_snippet: String,
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SslConfig {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub protocols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub path: String,
    pub upstream: String,
    pub priority: i32,
    /// Empty for FastCGI locations
    pub proxy_pass: String,
    pub rule: String,
    pub auth_enabled: bool,
    pub auth_type: String,
    pub cors_enabled: bool,
    pub cors_origins: Vec<String>,
    pub cors_methods: Vec<String>,
    pub proxy_headers: Vec<(String, String)>,
    pub configuration_snippet: String,
    pub fastcgi: Option<FastCgiLocation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FastCgiLocation {
    pub pass: String,
    pub index: String,
    pub params: BTreeMap<String, String>,
}

/// Build the configuration model from enabled routes.
///
/// Pure given its inputs; the reconciler fetches snippets and FastCGI
/// parameter sets beforehand and hands them in through `extras`.
pub fn generate(
    routes: &[RouteConfig],
    extras: &HashMap<String, RouteExtras>,
    ssl_dir: &Path,
) -> NginxConfig {
    let mut config = NginxConfig {
        generated: Utc::now(),
        upstreams: Vec::new(),
        servers: Vec::new(),
    };

    // Deterministic host grouping, members ordered by (name, id)
    let mut host_groups: BTreeMap<&str, Vec<&RouteConfig>> = BTreeMap::new();
    for route in routes.iter().filter(|r| r.enabled) {
        host_groups.entry(route.host.as_str()).or_default().push(route);
    }
    for group in host_groups.values_mut() {
        group.sort_by(|a, b| {
            (a.container_name.as_str(), a.container_id.as_str())
                .cmp(&(b.container_name.as_str(), b.container_id.as_str()))
        });
    }

    for (host, group) in &host_groups {
        let mut server = Server {
            server_name: host.to_string(),
            listen: vec!["80".to_string()],
            ssl: None,
            server_snippet: String::new(),
            locations: Vec::new(),
        };

        if group.iter().any(|r| r.tls) {
            server.listen.push("443 ssl".to_string());
            // First declared certname in group order wins; default pair otherwise
            let cert_name = group
                .iter()
                .filter(|r| r.tls)
                .map(|r| r.cert_name.as_str())
                .find(|name| !name.is_empty())
                .unwrap_or("default");
            server.ssl = Some(SslConfig {
                certificate: ssl_dir.join(format!("{}.crt", cert_name)),
                private_key: ssl_dir.join(format!("{}.key", cert_name)),
                protocols: vec!["TLSv1.2".to_string(), "TLSv1.3".to_string()],
            });
        }

        // First route in the group with a fetched server snippet wins
        for route in group.iter() {
            if route.server_snippet.is_empty() {
                continue;
            }
            if let Some(content) = extras
                .get(&route.container_id)
                .and_then(|e| e.server_snippet.as_deref())
            {
                server.server_snippet = content.to_string();
            }
            break;
        }

        for route in group.iter() {
            let upstream_name = format!(
                "backend_{}_{}",
                host.replace('.', "_"),
                sanitize_container_name(&route.container_name)
            );

            config.upstreams.push(Upstream {
                name: upstream_name.clone(),
                method: route.load_balancer.method.clone(),
                servers: vec![UpstreamServer {
                    address: format!("{}:{}", route.address, route.port),
                    weight: 1,
                }],
                healthcheck: route.healthcheck.enabled,
                health_path: route.healthcheck.path.clone(),
            });

            let route_extras = extras.get(&route.container_id);
            let configuration_snippet = route_extras
                .and_then(|e| e.configuration_snippet.as_deref())
                .unwrap_or_default()
                .to_string();

            let short_id = &route.container_id[..route.container_id.len().min(12)];
            let mut location = Location {
                path: route.path.clone(),
                upstream: upstream_name.clone(),
                priority: route.priority,
                proxy_pass: format!("http://{}", upstream_name),
                rule: route.rule.clone(),
                auth_enabled: route.auth.enabled,
                auth_type: route.auth.auth_type.clone(),
                cors_enabled: route.cors.enabled,
                cors_origins: route.cors.allow_origins.clone(),
                cors_methods: route.cors.allow_methods.clone(),
                proxy_headers: vec![
                    ("X-Container-Name".to_string(), route.container_name.clone()),
                    ("X-Container-ID".to_string(), short_id.to_string()),
                ],
                configuration_snippet,
                fastcgi: None,
            };

            if route.fastcgi.enabled {
                let params = route_extras
                    .and_then(|e| e.fastcgi_params.clone())
                    .unwrap_or_else(|| {
                        crate::snippets::default_fastcgi_params()
                            .into_iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect()
                    });
                location.fastcgi = Some(FastCgiLocation {
                    pass: format!("{}:{}", route.address, route.port),
                    index: route.fastcgi.index.clone(),
                    params,
                });
                location.proxy_pass = String::new();
            }

            server.locations.push(location);
        }

        sort_locations(&mut server.locations);
        config.servers.push(server);
    }

    config
}

/// Order locations so higher priority, then longer (more specific) paths,
/// are matched first.
pub fn sort_locations(locations: &mut [Location]) {
    locations.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.path.len().cmp(&a.path.len()))
    });
}

/// Structural validation of the generated model.
pub fn validate(config: &NginxConfig) -> anyhow::Result<()> {
    let mut upstream_names = std::collections::HashSet::new();
    for upstream in &config.upstreams {
        if !upstream_names.insert(upstream.name.as_str()) {
            anyhow::bail!("duplicate upstream name: {}", upstream.name);
        }
        if upstream.servers.is_empty() {
            anyhow::bail!("upstream {} has no servers", upstream.name);
        }
    }

    let mut server_names = std::collections::HashSet::new();
    for server in &config.servers {
        if !server_names.insert(server.server_name.as_str()) {
            anyhow::bail!("duplicate server name: {}", server.server_name);
        }
        if server.listen.is_empty() {
            anyhow::bail!("server {} has no listen directives", server.server_name);
        }
    }

    Ok(())
}

/// Locate the template: absolute path, then alongside the executable, then
/// the working directory, then the conventional install locations.
pub fn load_template(template_path: &Path) -> anyhow::Result<String> {
    if template_path.is_absolute() {
        if let Ok(content) = std::fs::read_to_string(template_path) {
            return Ok(content);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Ok(content) = std::fs::read_to_string(dir.join(template_path)) {
                return Ok(content);
            }
        }
    }

    if let Ok(content) = std::fs::read_to_string(template_path) {
        return Ok(content);
    }

    const COMMON_PATHS: [&str; 4] = [
        "/app/templates/nginx.conf.tmpl",
        "/etc/nginx-ingress/templates/nginx.conf.tmpl",
        "templates/nginx.conf.tmpl",
        "../templates/nginx.conf.tmpl",
    ];
    for path in COMMON_PATHS {
        if let Ok(content) = std::fs::read_to_string(path) {
            return Ok(content);
        }
    }

    anyhow::bail!("template file not found: {}", template_path.display())
}

/// Substitute the emitted blocks into the template.
pub fn render(config: &NginxConfig, template: &str) -> String {
    template
        .replace("{{upstreams}}", &emit_upstreams(config))
        .replace("{{servers}}", &emit_servers(config))
}

fn emit_upstreams(config: &NginxConfig) -> String {
    let mut out = String::new();
    for upstream in &config.upstreams {
        let _ = writeln!(out, "upstream {} {{", upstream.name);
        if upstream.method != "round_robin" {
            let _ = writeln!(out, "    {};", upstream.method);
        }
        if upstream.healthcheck {
            let _ = writeln!(out, "    # healthcheck: {}", upstream.health_path);
        }
        for server in &upstream.servers {
            let _ = writeln!(out, "    server {} weight={};", server.address, server.weight);
        }
        let _ = writeln!(out, "}}\n");
    }
    out
}

fn emit_servers(config: &NginxConfig) -> String {
    let mut out = String::new();
    for server in &config.servers {
        let _ = writeln!(out, "server {{");
        for listen in &server.listen {
            let _ = writeln!(out, "    listen {};", listen);
        }
        let _ = writeln!(out, "    server_name {};", server.server_name);

        if let Some(ssl) = &server.ssl {
            let _ = writeln!(out);
            let _ = writeln!(out, "    ssl_certificate {};", ssl.certificate.display());
            let _ = writeln!(out, "    ssl_certificate_key {};", ssl.private_key.display());
            let _ = writeln!(out, "    ssl_protocols {};", ssl.protocols.join(" "));
        }

        if !server.server_snippet.is_empty() {
            let _ = writeln!(out);
            for line in server.server_snippet.lines() {
                let _ = writeln!(out, "    {}", line);
            }
        }

        for location in &server.locations {
            let _ = writeln!(out);
            emit_location(&mut out, location);
        }

        let _ = writeln!(out, "}}\n");
    }
    out
}

fn emit_location(out: &mut String, location: &Location) {
    let _ = writeln!(out, "    location {} {{", location.path);

    if !location.rule.is_empty() {
        let _ = writeln!(out, "        # rule: {}", location.rule);
    }

    if location.auth_enabled {
        if location.auth_type == "basic" {
            let _ = writeln!(out, "        auth_basic \"Restricted\";");
            let _ = writeln!(out, "        auth_basic_user_file /etc/nginx/auth/.htpasswd;");
        } else {
            let _ = writeln!(out, "        # auth: {}", location.auth_type);
        }
    }

    if location.cors_enabled {
        if !location.cors_origins.is_empty() {
            let _ = writeln!(
                out,
                "        add_header Access-Control-Allow-Origin \"{}\" always;",
                location.cors_origins.join(", ")
            );
        }
        if !location.cors_methods.is_empty() {
            let _ = writeln!(
                out,
                "        add_header Access-Control-Allow-Methods \"{}\" always;",
                location.cors_methods.join(", ")
            );
        }
    }

    if !location.configuration_snippet.is_empty() {
        for line in location.configuration_snippet.lines() {
            let _ = writeln!(out, "        {}", line);
        }
    }

    if let Some(fastcgi) = &location.fastcgi {
        let _ = writeln!(out, "        fastcgi_pass {};", fastcgi.pass);
        if !fastcgi.index.is_empty() {
            let _ = writeln!(out, "        fastcgi_index {};", fastcgi.index);
        }
        for (key, value) in &fastcgi.params {
            let _ = writeln!(out, "        fastcgi_param {} \"{}\";", key, value);
        }
    } else {
        for (name, value) in &location.proxy_headers {
            let _ = writeln!(out, "        proxy_set_header {} \"{}\";", name, value);
        }
        let _ = writeln!(out, "        proxy_set_header Host $host;");
        let _ = writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;");
        let _ = writeln!(
            out,
            "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
        );
        let _ = writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;");
        let _ = writeln!(out, "        proxy_pass {};", location.proxy_pass);
    }

    let _ = writeln!(out, "    }}");
}
