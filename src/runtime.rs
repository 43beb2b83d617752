//! Container runtime access.
//!
//! The controller talks to the runtime only through the [`RuntimeClient`]
//! capability trait so the watcher and snippet loader can be exercised against
//! a programmable fake. The production implementation targets the local
//! Docker daemon via bollard.

use async_trait::async_trait;
use bollard::container::{DownloadFromContainerOptions, InspectContainerOptions, ListContainersOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Runtime failures the callers route on.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The container vanished; callers drop these silently
    #[error("container not found: {0}")]
    NotFound(String),
    /// Anything else (transport, daemon, decoding); retriable
    #[error("runtime error: {0}")]
    Transport(#[source] anyhow::Error),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    fn from_bollard(id: &str, err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => RuntimeError::NotFound(id.to_string()),
            other => RuntimeError::Transport(other.into()),
        }
    }
}

/// Summary row from enumeration; labels are enough to pre-filter.
#[derive(Debug, Clone)]
pub struct ContainerBrief {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// Full view of one container after inspection.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    /// Network-reachable address, per the non-bridge-first selection rule
    pub address: String,
    /// Name of the network the address belongs to
    pub network: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

/// Lifecycle actions the watcher reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Stop,
    Die,
    Destroy,
    Other(String),
}

impl EventAction {
    fn parse(action: &str) -> Self {
        match action {
            "start" => EventAction::Start,
            "stop" => EventAction::Stop,
            "die" => EventAction::Die,
            "destroy" => EventAction::Destroy,
            other => EventAction::Other(other.to_string()),
        }
    }
}

/// A single container lifecycle event.
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub action: EventAction,
    pub container_id: String,
    pub container_name: String,
}

pub type EventStream = BoxStream<'static, Result<ContainerEvent, RuntimeError>>;

/// What the controller needs from a container runtime.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Enumerate currently running containers.
    async fn list_running(&self) -> Result<Vec<ContainerBrief>, RuntimeError>;

    /// Inspect one container for address, network and labels.
    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

    /// Open a long-lived subscription to container lifecycle events.
    async fn subscribe_events(&self) -> Result<EventStream, RuntimeError>;

    /// Stream a single file out of a container as a tar archive.
    async fn copy_file(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError>;

    /// Liveness check against the runtime itself.
    async fn ping(&self) -> Result<(), RuntimeError>;
}

/// Production runtime client over the local Docker daemon.
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon, preferring an explicit endpoint, then the
    /// platform socket defaults.
    pub fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = match docker_host {
            Some(host) if host.starts_with("unix://") => {
                let socket = host.trim_start_matches("unix://");
                Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| anyhow::anyhow!("cannot connect to unix socket '{}': {}", socket, e))?
            }
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| anyhow::anyhow!("cannot connect to endpoint '{}': {}", host, e))?
            }
            Some(host) => {
                anyhow::bail!(
                    "invalid DOCKER_HOST '{}': expected unix:///path or tcp://host:port",
                    host
                )
            }
            None => Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("cannot connect to Docker daemon: {}", e))?,
        };
        Ok(Self { client })
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerBrief>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Transport(e.into()))?;

        let briefs = summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                Some(ContainerBrief {
                    id,
                    name,
                    labels: summary.labels.unwrap_or_default(),
                })
            })
            .collect();
        Ok(briefs)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let response = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| RuntimeError::from_bollard(id, e))?;

        let name = response
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        let labels = response
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let running = response
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let (address, network) = select_address(&response);

        Ok(ContainerDetails {
            id: id.to_string(),
            name,
            address,
            network,
            labels,
            running,
        })
    }

    async fn subscribe_events(&self) -> Result<EventStream, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec![
                "start".to_string(),
                "stop".to_string(),
                "die".to_string(),
                "destroy".to_string(),
            ],
        );

        // The bollard stream borrows its client, so a forwarder task owns a
        // clone and feeds a channel the caller can hold indefinitely
        let client = self.client.clone();
        let (tx, rx) = futures::channel::mpsc::unbounded();
        tokio::spawn(async move {
            let mut stream = client.events(Some(EventsOptions::<String> {
                filters,
                ..Default::default()
            }));
            while let Some(item) = stream.next().await {
                let mapped = match item {
                    Ok(message) => {
                        let actor = message.actor.unwrap_or_default();
                        let container_id = actor.id.unwrap_or_default();
                        let container_name = actor
                            .attributes
                            .as_ref()
                            .and_then(|attrs| attrs.get("name"))
                            .cloned()
                            .unwrap_or_default();
                        let action = EventAction::parse(message.action.as_deref().unwrap_or(""));
                        Ok(ContainerEvent {
                            action,
                            container_id,
                            container_name,
                        })
                    }
                    Err(e) => Err(RuntimeError::Transport(e.into())),
                };
                if tx.unbounded_send(mapped).is_err() {
                    return;
                }
            }
            // Sender drops here; the consumer observes end-of-stream
        });

        Ok(rx.boxed())
    }

    async fn copy_file(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.client.download_from_container(id, Some(options));
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| RuntimeError::from_bollard(id, e))?;
            archive.extend_from_slice(&bytes);
        }
        debug!(container = id, path, bytes = archive.len(), "downloaded archive");
        Ok(archive)
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Transport(e.into()))
    }
}

/// Pick the container address, preferring non-bridge networks and breaking
/// ties by the smallest network name so the choice is stable across passes.
fn select_address(response: &bollard::models::ContainerInspectResponse) -> (String, String) {
    if let Some(networks) = response
        .network_settings
        .as_ref()
        .and_then(|ns| ns.networks.as_ref())
    {
        let mut candidates: Vec<(&String, &String)> = networks
            .iter()
            .filter_map(|(name, endpoint)| {
                endpoint
                    .ip_address
                    .as_ref()
                    .filter(|ip| !ip.is_empty())
                    .map(|ip| (name, ip))
            })
            .collect();
        candidates.sort_by_key(|(name, _)| (*name == "bridge", (*name).clone()));

        if let Some((name, ip)) = candidates.first() {
            return (ip.to_string(), name.to_string());
        }
    }

    // Legacy top-level address, bridge-attached by definition
    if let Some(ip) = response
        .network_settings
        .as_ref()
        .and_then(|ns| ns.ip_address.as_ref())
        .filter(|ip| !ip.is_empty())
    {
        return (ip.clone(), "bridge".to_string());
    }

    (String::new(), String::new())
}

/// TCP dial probe against a backend address, bounded at 5 seconds.
pub async fn probe_port(address: &str, port: u16) -> bool {
    let target = format!("{}:{}", address, port);
    matches!(
        tokio::time::timeout(Duration::from_secs(5), tokio::net::TcpStream::connect(&target)).await,
        Ok(Ok(_))
    )
}
