//! Container set maintenance.
//!
//! The watcher owns the authoritative set of eligible containers: it
//! bootstraps from a full enumeration, then keeps the set consistent by
//! applying the runtime's lifecycle events. Whenever the set changes it
//! publishes a reconciliation tick through a single-slot channel, so any
//! burst of events coalesces into at most one pending pass.

use crate::errors::ErrorHandler;
use crate::labels::has_ingress_labels;
use crate::resilience::RetryPolicy;
use crate::runtime::{ContainerEvent, EventAction, RuntimeClient};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pause before re-subscribing after the event stream fails.
const EVENT_STREAM_COOLDOWN: Duration = Duration::from_secs(5);

/// One eligible container as last observed.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub address: String,
    pub network: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

/// Watches the runtime and maintains the eligible-container set.
pub struct Watcher {
    runtime: Arc<dyn RuntimeClient>,
    containers: RwLock<HashMap<String, ContainerRecord>>,
    tick_tx: watch::Sender<u64>,
    subscribe_retry: RetryPolicy,
    inspect_retry: RetryPolicy,
    handler: Arc<ErrorHandler>,
}

impl Watcher {
    /// Returns the watcher and the tick receiver the reconciler listens on.
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        handler: Arc<ErrorHandler>,
    ) -> (Arc<Self>, watch::Receiver<u64>) {
        let (tick_tx, tick_rx) = watch::channel(0u64);
        let watcher = Arc::new(Self {
            runtime,
            containers: RwLock::new(HashMap::new()),
            tick_tx,
            subscribe_retry: RetryPolicy::default(),
            inspect_retry: RetryPolicy::new(2, Duration::from_millis(500)),
            handler,
        });
        (watcher, tick_rx)
    }

    /// Consistent copy of the current set.
    pub fn snapshot(&self) -> Vec<ContainerRecord> {
        self.containers.read().values().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.containers.read().contains_key(id)
    }

    /// Enumerate running containers and keep those carrying ingress labels.
    pub async fn bootstrap(&self) -> anyhow::Result<usize> {
        let briefs = self
            .runtime
            .list_running()
            .await
            .map_err(|e| anyhow::anyhow!("failed to list containers: {}", e))?;

        let mut records = HashMap::new();
        for brief in briefs {
            if !has_ingress_labels(&brief.labels) {
                continue;
            }
            match self.inspect_eligible(&brief.id).await {
                Ok(Some(record)) => {
                    records.insert(record.id.clone(), record);
                }
                Ok(None) => {}
                Err(e) => {
                    self.handler.warning(
                        "watcher",
                        format!("failed to inspect container {} during bootstrap", brief.id),
                        e,
                    );
                }
            }
        }

        let count = records.len();
        *self.containers.write() = records;
        info!(containers = count, "container set bootstrapped");
        self.mark_dirty();
        Ok(count)
    }

    /// Process lifecycle events until shutdown; re-subscribes with a
    /// cool-down when the stream fails, giving up only after the retry
    /// budget is exhausted.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let stream = self
                .subscribe_retry
                .run("subscribing to runtime events", || async {
                    self.runtime
                        .subscribe_events()
                        .await
                        .map_err(anyhow::Error::from)
                })
                .await;

            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    // The set freezes but the last good config keeps serving
                    self.handler.critical(
                        "watcher",
                        "event subscription failed after retries, watcher stopping",
                        e,
                    );
                    return;
                }
            };
            debug!("subscribed to runtime events");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("watcher shutting down");
                            return;
                        }
                    }
                    item = stream.next() => match item {
                        Some(Ok(event)) => self.handle_event(event).await,
                        Some(Err(e)) => {
                            self.handler.error("watcher", "event stream error", e.into());
                            break;
                        }
                        None => {
                            warn!("event stream ended, re-subscribing");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(EVENT_STREAM_COOLDOWN) => {}
            }
        }
    }

    async fn handle_event(&self, event: ContainerEvent) {
        match event.action {
            EventAction::Start => {
                match self.inspect_eligible(&event.container_id).await {
                    Ok(Some(record)) => {
                        debug!(
                            container = %record.name,
                            id = %record.id,
                            "container joined the set"
                        );
                        self.containers.write().insert(record.id.clone(), record);
                        self.mark_dirty();
                    }
                    // Vanished mid-event or not eligible
                    Ok(None) => {}
                    Err(e) => {
                        // Dropped; the next full reconcile covers it
                        self.handler.warning(
                            "watcher",
                            format!(
                                "failed to inspect container {} after start event",
                                event.container_id
                            ),
                            e,
                        );
                    }
                }
            }
            EventAction::Stop | EventAction::Die | EventAction::Destroy => {
                let removed = self.containers.write().remove(&event.container_id);
                if removed.is_some() {
                    debug!(
                        container = %event.container_name,
                        id = %event.container_id,
                        "container left the set"
                    );
                    self.mark_dirty();
                }
            }
            EventAction::Other(_) => {}
        }
    }

    /// Inspect with retry; `Ok(None)` means gone or not eligible.
    async fn inspect_eligible(&self, id: &str) -> anyhow::Result<Option<ContainerRecord>> {
        let details = self
            .inspect_retry
            .run("inspecting container", || async {
                match self.runtime.inspect(id).await {
                    Ok(details) => Ok(Some(details)),
                    Err(e) if e.is_not_found() => Ok(None),
                    Err(e) => Err(anyhow::Error::from(e)),
                }
            })
            .await?;

        let Some(details) = details else {
            return Ok(None);
        };
        if !details.running || !has_ingress_labels(&details.labels) {
            return Ok(None);
        }
        Ok(Some(ContainerRecord {
            id: details.id,
            name: details.name,
            address: details.address,
            network: details.network,
            labels: details.labels,
            running: details.running,
        }))
    }

    fn mark_dirty(&self) {
        self.tick_tx.send_modify(|generation| *generation += 1);
    }
}
