//! Snippet and FastCGI parameter loading.
//!
//! Configuration fragments live inside the routed containers. The store
//! fetches them through the runtime's file-copy capability (a tar stream),
//! caches them on disk keyed by container and path hash, and refuses paths
//! that traverse, point into system directories or carry an unexpected
//! suffix, before any runtime call is made.

use crate::runtime::RuntimeClient;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// File suffixes the store will fetch.
const ALLOWED_SUFFIXES: [&str; 3] = [".conf", ".txt", ".params"];

/// FastCGI parameters every location must carry.
const REQUIRED_FASTCGI_PARAMS: [&str; 2] = ["SCRIPT_FILENAME", "REQUEST_METHOD"];

#[derive(Debug, thiserror::Error)]
pub enum SnippetError {
    /// Rejected before any runtime call
    #[error("invalid snippet path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("required FastCGI parameter {0} is missing")]
    MissingParam(&'static str),
    #[error("snippet fetch failed: {0}")]
    Fetch(#[from] anyhow::Error),
}

/// Downloaded fragment with provenance.
#[derive(Debug, Clone)]
pub struct Snippet {
    pub content: String,
    pub source_path: String,
}

/// Fetches and caches in-container files.
pub struct SnippetStore {
    runtime: Arc<dyn RuntimeClient>,
    cache_dir: PathBuf,
}

impl SnippetStore {
    pub fn new(runtime: Arc<dyn RuntimeClient>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            cache_dir: cache_dir.into(),
        }
    }

    /// Reject traversal, reserved system roots and non-allowlisted suffixes.
    pub fn validate_path(path: &str) -> Result<(), SnippetError> {
        if path.contains("..") {
            return Err(SnippetError::InvalidPath {
                path: path.to_string(),
                reason: "path traversal not allowed",
            });
        }
        if path.starts_with("/etc/") || path.starts_with("/var/") {
            return Err(SnippetError::InvalidPath {
                path: path.to_string(),
                reason: "system directories not allowed",
            });
        }
        if !ALLOWED_SUFFIXES.iter().any(|suffix| path.ends_with(suffix)) {
            return Err(SnippetError::InvalidPath {
                path: path.to_string(),
                reason: "only .conf, .txt and .params files allowed",
            });
        }
        Ok(())
    }

    /// Fetch a file from a container, serving from the cache when present.
    pub async fn fetch(&self, container_id: &str, path: &str) -> Result<Snippet, SnippetError> {
        Self::validate_path(path)?;

        let cache_file = self.cache_file(container_id, path);
        if let Ok(content) = tokio::fs::read_to_string(&cache_file).await {
            debug!(container = container_id, path, "snippet cache hit");
            return Ok(Snippet {
                content,
                source_path: path.to_string(),
            });
        }

        let archive = self
            .runtime
            .copy_file(container_id, path)
            .await
            .map_err(|e| anyhow::anyhow!("copy {} from container {}: {}", path, container_id, e))?;

        let filename = Path::new(path)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        let content = extract_file_from_tar(&archive, &filename)?;

        if let Err(e) = self.save_to_cache(&cache_file, &content).await {
            warn!(cache = %cache_file.display(), error = %e, "failed to cache snippet");
        }

        Ok(Snippet {
            content,
            source_path: path.to_string(),
        })
    }

    /// Load the effective FastCGI parameter map for a route.
    ///
    /// Precedence: baseline defaults, overridden by inline label parameters,
    /// overridden by the parameter file.
    pub async fn load_fastcgi_params(
        &self,
        container_id: &str,
        label_params: &HashMap<String, String>,
        params_file: &str,
    ) -> Result<BTreeMap<String, String>, SnippetError> {
        let mut params: BTreeMap<String, String> = label_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if !params_file.is_empty() {
            let snippet = self.fetch(container_id, params_file).await?;
            for (key, value) in parse_params_file(&snippet.content) {
                params.insert(key, value);
            }
        }

        for (key, value) in default_fastcgi_params() {
            params.entry(key.to_string()).or_insert_with(|| value.to_string());
        }

        validate_fastcgi_params(&params)?;
        Ok(params)
    }

    fn cache_file(&self, container_id: &str, path: &str) -> PathBuf {
        let short_id = &container_id[..container_id.len().min(12)];
        let digest = Sha256::digest(path.as_bytes());
        let hash = hex_prefix(&digest, 12);
        self.cache_dir.join(format!("{}_{}.conf", short_id, hash))
    }

    async fn save_to_cache(&self, cache_file: &Path, content: &str) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.cache_dir, std::fs::Permissions::from_mode(0o755))
                .await?;
        }
        tokio::fs::write(cache_file, content).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(cache_file, std::fs::Permissions::from_mode(0o644)).await?;
        }
        Ok(())
    }
}

fn hex_prefix(digest: &[u8], len: usize) -> String {
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex.truncate(len);
    hex
}

/// Pull one regular file out of a ustar archive by basename.
fn extract_file_from_tar(archive: &[u8], filename: &str) -> anyhow::Result<String> {
    let mut offset = 0;
    while offset + 512 <= archive.len() {
        let header = &archive[offset..offset + 512];
        if header.iter().all(|&b| b == 0) {
            break;
        }

        let name_end = header[..100].iter().position(|&b| b == 0).unwrap_or(100);
        let entry_name = String::from_utf8_lossy(&header[..name_end]).into_owned();
        let size = parse_octal(&header[124..136])?;
        let type_flag = header[156];

        let data_start = offset + 512;
        let data_end = data_start + size;
        if data_end > archive.len() {
            anyhow::bail!("truncated tar archive");
        }

        let is_regular = type_flag == b'0' || type_flag == 0;
        let basename = Path::new(&entry_name)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        if is_regular && basename == filename {
            return Ok(String::from_utf8_lossy(&archive[data_start..data_end]).into_owned());
        }

        offset = data_start + size.div_ceil(512) * 512;
    }
    anyhow::bail!("file '{}' not found in archive", filename)
}

fn parse_octal(field: &[u8]) -> anyhow::Result<usize> {
    let text = String::from_utf8_lossy(field);
    let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if trimmed.is_empty() {
        return Ok(0);
    }
    usize::from_str_radix(trimmed, 8).map_err(|e| anyhow::anyhow!("bad tar size field: {}", e))
}

/// Parse a FastCGI parameter file.
///
/// Recognized line forms, after skipping blanks and `#` comments:
/// `fastcgi_param KEY VALUE[;]` and `KEY=VALUE`, both with surrounding
/// quote stripping.
pub fn parse_params_file(content: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("fastcgi_param ") {
            let mut fields = rest.split_whitespace();
            let Some(key) = fields.next() else { continue };
            let value = fields.collect::<Vec<_>>().join(" ");
            if value.is_empty() {
                continue;
            }
            let value = value.trim_end_matches(';');
            params.insert(
                key.to_string(),
                crate::labels::strip_quotes(value).to_string(),
            );
        } else if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            params.insert(
                key.to_string(),
                crate::labels::strip_quotes(value.trim()).to_string(),
            );
        }
    }
    params
}

/// Baseline parameters injected for any key the user did not set.
pub fn default_fastcgi_params() -> [(&'static str, &'static str); 20] {
    [
        ("SCRIPT_FILENAME", "$document_root$fastcgi_script_name"),
        ("QUERY_STRING", "$query_string"),
        ("REQUEST_METHOD", "$request_method"),
        ("CONTENT_TYPE", "$content_type"),
        ("CONTENT_LENGTH", "$content_length"),
        ("SCRIPT_NAME", "$fastcgi_script_name"),
        ("REQUEST_URI", "$request_uri"),
        ("DOCUMENT_URI", "$document_uri"),
        ("DOCUMENT_ROOT", "$document_root"),
        ("SERVER_PROTOCOL", "$server_protocol"),
        ("REQUEST_SCHEME", "$scheme"),
        ("HTTPS", "$https if_not_empty"),
        ("GATEWAY_INTERFACE", "CGI/1.1"),
        ("SERVER_SOFTWARE", "nginx/$nginx_version"),
        ("REMOTE_ADDR", "$remote_addr"),
        ("REMOTE_PORT", "$remote_port"),
        ("SERVER_ADDR", "$server_addr"),
        ("SERVER_PORT", "$server_port"),
        ("SERVER_NAME", "$server_name"),
        ("REDIRECT_STATUS", "200"),
    ]
}

/// Ensure the merged parameter map carries the keys nginx cannot do without.
pub fn validate_fastcgi_params(params: &BTreeMap<String, String>) -> Result<(), SnippetError> {
    for required in REQUIRED_FASTCGI_PARAMS {
        if !params.contains_key(required) {
            return Err(SnippetError::MissingParam(required));
        }
    }
    Ok(())
}
