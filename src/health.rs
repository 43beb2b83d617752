//! Component health monitoring and the HTTP health surface.
//!
//! Components register a probe and an interval; a background task per
//! component runs the probe and folds results into {Healthy, Degraded,
//! Unhealthy}. The overall state is the worst of any component and is served
//! on the loopback health port.

use crate::errors::ErrorHandler;
use crate::resilience::spawn_guarded;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Failures before a component is considered unhealthy.
const UNHEALTHY_THRESHOLD: u32 = 5;
/// Failures before a component is considered degraded.
const DEGRADED_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Point-in-time view of one component.
#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub error_count: u32,
    pub last_check: DateTime<Utc>,
}

/// Async probe returning Ok when the component is fine.
pub type ProbeFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct ComponentEntry {
    status: HealthStatus,
    error_count: u32,
    last_check: DateTime<Utc>,
}

/// Registry of probed components plus the HTTP surface over them.
pub struct HealthMonitor {
    components: DashMap<String, ComponentEntry>,
    handler: Arc<ErrorHandler>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthMonitor {
    pub fn new(handler: Arc<ErrorHandler>, shutdown_rx: watch::Receiver<bool>) -> Arc<Self> {
        Arc::new(Self {
            components: DashMap::new(),
            handler,
            shutdown_rx,
        })
    }

    /// Register a component and start probing it on `interval`.
    pub fn register(self: &Arc<Self>, name: &str, interval: Duration, probe: ProbeFn) {
        self.components.insert(
            name.to_string(),
            ComponentEntry {
                status: HealthStatus::Healthy,
                error_count: 0,
                last_check: Utc::now(),
            },
        );

        let monitor = Arc::clone(self);
        let component = name.to_string();
        let mut shutdown_rx = self.shutdown_rx.clone();
        spawn_guarded("health-probe", Arc::clone(&self.handler), async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!(component, "health probe stopping");
                            return;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        let result = probe().await;
                        monitor.record_probe_result(&component, result);
                    }
                }
            }
        });
        info!(component = name, interval_secs = interval.as_secs(), "health probe registered");
    }

    /// Fold one probe result into the component state.
    pub fn record_probe_result(&self, name: &str, result: anyhow::Result<()>) {
        let Some(mut entry) = self.components.get_mut(name) else {
            return;
        };
        entry.last_check = Utc::now();

        match result {
            Ok(()) => {
                if entry.error_count > 0 {
                    info!(component = name, "health check recovered");
                }
                entry.error_count = 0;
                entry.status = HealthStatus::Healthy;
            }
            Err(e) => {
                entry.error_count += 1;
                if entry.error_count >= UNHEALTHY_THRESHOLD {
                    entry.status = HealthStatus::Unhealthy;
                } else if entry.error_count >= DEGRADED_THRESHOLD {
                    entry.status = HealthStatus::Degraded;
                }
                warn!(
                    component = name,
                    errors = entry.error_count,
                    error = %e,
                    "health check failed"
                );
            }
        }
    }

    pub fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.components.get(name).map(|entry| ComponentHealth {
            name: name.to_string(),
            status: entry.status,
            error_count: entry.error_count,
            last_check: entry.last_check,
        })
    }

    /// All components, sorted by name for stable output.
    pub fn components(&self) -> Vec<ComponentHealth> {
        let mut all: Vec<ComponentHealth> = self
            .components
            .iter()
            .map(|entry| ComponentHealth {
                name: entry.key().clone(),
                status: entry.status,
                error_count: entry.error_count,
                last_check: entry.last_check,
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Worst status across all registered components.
    pub fn overall(&self) -> HealthStatus {
        self.components
            .iter()
            .map(|entry| entry.status)
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }

    /// Serve `/health` and `/health/detailed` on the loopback interface.
    pub async fn serve(self: Arc<Self>, port: u16) -> anyhow::Result<()> {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "health endpoints listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let monitor = Arc::clone(&self);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let monitor = Arc::clone(&monitor);
                                    async move {
                                        Ok::<_, hyper::Error>(
                                            monitor.respond(req.method(), req.uri().path()),
                                        )
                                    }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(peer = %peer, error = %e, "health connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept health connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("health server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn respond(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        match (method, path) {
            (&Method::GET, "/health") => {
                let overall = self.overall();
                let status = match overall {
                    HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::OK,
                };
                let body = serde_json::json!({ "status": overall }).to_string();
                json_response(status, body)
            }
            (&Method::GET, "/health/detailed") => {
                let components: Vec<serde_json::Value> = self
                    .components()
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "name": c.name,
                            "status": c.status,
                            "error_count": c.error_count,
                            "last_check": c.last_check.to_rfc3339(),
                        })
                    })
                    .collect();
                let body = serde_json::json!({
                    "overall_status": self.overall(),
                    "components": components,
                })
                .to_string();
                json_response(StatusCode::OK, body)
            }
            _ => json_response(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#.to_string()),
        }
    }
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static header")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> (Arc<HealthMonitor>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (HealthMonitor::new(Arc::new(ErrorHandler::new(false)), rx), tx)
    }

    fn seed(m: &Arc<HealthMonitor>, name: &str) {
        m.components.insert(
            name.to_string(),
            ComponentEntry {
                status: HealthStatus::Healthy,
                error_count: 0,
                last_check: Utc::now(),
            },
        );
    }

    #[test]
    fn test_transitions_follow_thresholds() {
        let (m, _shutdown_tx) = monitor();
        seed(&m, "docker");

        m.record_probe_result("docker", Err(anyhow::anyhow!("down")));
        assert_eq!(m.component("docker").unwrap().status, HealthStatus::Healthy);

        m.record_probe_result("docker", Err(anyhow::anyhow!("down")));
        assert_eq!(m.component("docker").unwrap().status, HealthStatus::Degraded);

        for _ in 0..3 {
            m.record_probe_result("docker", Err(anyhow::anyhow!("down")));
        }
        let health = m.component("docker").unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.error_count, 5);
    }

    #[test]
    fn test_success_resets_errors() {
        let (m, _shutdown_tx) = monitor();
        seed(&m, "nginx");

        for _ in 0..4 {
            m.record_probe_result("nginx", Err(anyhow::anyhow!("down")));
        }
        assert_eq!(m.component("nginx").unwrap().status, HealthStatus::Degraded);

        m.record_probe_result("nginx", Ok(()));
        let health = m.component("nginx").unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.error_count, 0);
    }

    #[test]
    fn test_overall_is_worst_component() {
        let (m, _shutdown_tx) = monitor();
        seed(&m, "a");
        seed(&m, "b");
        assert_eq!(m.overall(), HealthStatus::Healthy);

        m.record_probe_result("a", Err(anyhow::anyhow!("x")));
        m.record_probe_result("a", Err(anyhow::anyhow!("x")));
        assert_eq!(m.overall(), HealthStatus::Degraded);

        for _ in 0..5 {
            m.record_probe_result("b", Err(anyhow::anyhow!("x")));
        }
        assert_eq!(m.overall(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_overall_with_no_components_is_healthy() {
        let (m, _shutdown_tx) = monitor();
        assert_eq!(m.overall(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_health_endpoint_bodies() {
        let (m, _shutdown_tx) = monitor();
        seed(&m, "docker");

        let response = m.respond(&Method::GET, "/health");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert_eq!(body, r#"{"status":"healthy"}"#);

        for _ in 0..5 {
            m.record_probe_result("docker", Err(anyhow::anyhow!("down")));
        }
        let response = m.respond(&Method::GET, "/health");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_string(response).await;
        assert_eq!(body, r#"{"status":"unhealthy"}"#);
    }

    #[tokio::test]
    async fn test_detailed_endpoint_lists_components() {
        let (m, _shutdown_tx) = monitor();
        seed(&m, "docker");
        seed(&m, "nginx");
        m.record_probe_result("nginx", Err(anyhow::anyhow!("down")));
        m.record_probe_result("nginx", Err(anyhow::anyhow!("down")));

        let response = m.respond(&Method::GET, "/health/detailed");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();

        assert_eq!(parsed["overall_status"], "degraded");
        let components = parsed["components"].as_array().unwrap();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0]["name"], "docker");
        assert_eq!(components[1]["name"], "nginx");
        assert_eq!(components[1]["status"], "degraded");
        assert_eq!(components[1]["error_count"], 2);
        assert!(components[1]["last_check"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let (m, _shutdown_tx) = monitor();
        let response = m.respond(&Method::GET, "/metrics");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        use http_body_util::BodyExt;
        let collected = response.into_body().collect().await.unwrap();
        String::from_utf8(collected.to_bytes().to_vec()).unwrap()
    }
}
