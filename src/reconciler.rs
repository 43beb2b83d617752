//! The reconciliation pipeline.
//!
//! One pass takes a snapshot of the container set, derives route
//! configurations, loads snippets and FastCGI parameters, renders the nginx
//! configuration, commits it atomically (temp file then rename), validates it
//! out-of-process and finally asks the supervisor to reload (or start) the
//! child. Passes are serialized; ticks arriving mid-pass coalesce into at
//! most one follow-up. Three consecutive validate or reload failures push the
//! reconciler into a degraded backoff during which ticks only accumulate.

use crate::errors::{ControllerError, ErrorHandler, ErrorKind, Severity};
use crate::labels::{extract_route, RouteConfig};
use crate::nginx::ProxyHandle;
use crate::render::{self, RouteExtras};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::settings::Settings;
use crate::snippets::{SnippetError, SnippetStore};
use crate::watcher::Watcher;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Consecutive validate/reload failures before backing off.
const DEGRADED_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    Rendering,
    Committing,
    Reloading,
    DegradedBackoff,
}

/// Orchestrates snapshot, render, commit, validate and reload.
pub struct Reconciler {
    watcher: Arc<Watcher>,
    snippets: SnippetStore,
    proxy: Box<dyn ProxyHandle>,
    settings: Settings,
    handler: Arc<ErrorHandler>,
    retry: RetryPolicy,
    /// Guards the reload/start path against a persistently broken child
    reload_breaker: CircuitBreaker,
    degraded_backoff: Duration,
    state: Mutex<ReconcilerState>,
    /// Bytes currently live on disk, for skip-if-unchanged and restore
    last_committed: Mutex<Option<String>>,
    consecutive_failures: AtomicU32,
    passes_completed: AtomicU64,
}

impl Reconciler {
    pub fn new(
        watcher: Arc<Watcher>,
        snippets: SnippetStore,
        proxy: Box<dyn ProxyHandle>,
        settings: Settings,
        handler: Arc<ErrorHandler>,
    ) -> Self {
        Self {
            watcher,
            snippets,
            proxy,
            settings,
            handler,
            retry: RetryPolicy::default(),
            reload_breaker: CircuitBreaker::default(),
            degraded_backoff: Duration::from_secs(30),
            state: Mutex::new(ReconcilerState::Idle),
            last_committed: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            passes_completed: AtomicU64::new(0),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_degraded_backoff(mut self, backoff: Duration) -> Self {
        self.degraded_backoff = backoff;
        self
    }

    pub fn state(&self) -> ReconcilerState {
        *self.state.lock()
    }

    /// Completed passes, short-circuited ones included.
    pub fn passes(&self) -> u64 {
        self.passes_completed.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ReconcilerState) {
        *self.state.lock() = state;
    }

    /// Serve ticks until shutdown. The watch channel is the coalescing
    /// primitive: any number of ticks during a pass leaves exactly one
    /// changed marker behind, so at most one follow-up pass runs.
    pub async fn run(
        self: Arc<Self>,
        mut tick_rx: watch::Receiver<u64>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reconciler shutting down");
                        return;
                    }
                }
                changed = tick_rx.changed() => {
                    if changed.is_err() {
                        debug!("tick channel closed, reconciler stopping");
                        return;
                    }
                    if let Err(e) = self.reconcile_once().await {
                        warn!(error = %e, "reconcile pass failed");
                    }

                    if self.consecutive_failures.load(Ordering::SeqCst) >= DEGRADED_THRESHOLD {
                        self.set_state(ReconcilerState::DegradedBackoff);
                        warn!(
                            backoff_secs = self.degraded_backoff.as_secs(),
                            "entering degraded backoff after repeated failures"
                        );
                        tokio::select! {
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    return;
                                }
                            }
                            _ = tokio::time::sleep(self.degraded_backoff) => {}
                        }
                        self.consecutive_failures.store(0, Ordering::SeqCst);
                        self.set_state(ReconcilerState::Idle);
                        // The failed model is still unapplied; try again
                        if let Err(e) = self.reconcile_once().await {
                            warn!(error = %e, "reconcile pass failed after backoff");
                        }
                    }
                }
            }
        }
    }

    /// One full pass. Per-container problems are downgraded to warnings;
    /// commit, validate and reload failures abort the pass.
    pub async fn reconcile_once(&self) -> anyhow::Result<()> {
        let result = self.reconcile_inner().await;
        self.passes_completed.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn reconcile_inner(&self) -> anyhow::Result<()> {
        self.set_state(ReconcilerState::Rendering);
        let snapshot = self.watcher.snapshot();

        let mut routes = Vec::new();
        for record in &snapshot {
            match extract_route(&record.id, &record.name, &record.address, &record.labels) {
                Ok(route) if route.enabled => routes.push(route),
                Ok(_) => {}
                Err(e) => {
                    self.handler.handle(
                        &ControllerError::new(
                            ErrorKind::InvalidValue,
                            Severity::Warning,
                            "reconciler",
                            format!("skipping container {}", record.name),
                        )
                        .with_cause(anyhow::Error::from(e)),
                    );
                }
            }
        }

        let (routes, extras) = self.load_extras(routes).await;

        let config = render::generate(&routes, &extras, &self.settings.ssl_dir);
        render::validate(&config)?;

        let template = match render::load_template(&self.settings.template_path) {
            Ok(template) => template,
            Err(e) => {
                self.handler.critical(
                    "reconciler",
                    "nginx configuration template not found",
                    anyhow::anyhow!("{}", e),
                );
                self.set_state(ReconcilerState::Idle);
                return Err(e);
            }
        };
        let text = render::render(&config, &template);

        if self.last_committed.lock().as_deref() == Some(text.as_str()) {
            debug!("configuration unchanged, skipping commit and reload");
            self.set_state(ReconcilerState::Idle);
            return Ok(());
        }

        info!(
            upstreams = config.upstreams.len(),
            servers = config.servers.len(),
            "committing nginx configuration"
        );

        self.set_state(ReconcilerState::Committing);
        let previous = self.last_committed.lock().clone();
        self.retry
            .run("writing nginx configuration", || self.commit(&text))
            .await?;

        if let Err(e) = self
            .retry
            .run("validating nginx configuration", || self.proxy.configtest())
            .await
        {
            self.handler.handle(
                &ControllerError::new(
                    ErrorKind::InvalidValue,
                    Severity::Error,
                    "reconciler",
                    "rendered configuration failed validation",
                )
                .with_cause(anyhow::anyhow!("{}", e)),
            );
            // Put the known-good bytes back before anyone re-reads them
            if let Some(previous) = previous {
                if let Err(restore_err) = self
                    .retry
                    .run("restoring previous configuration", || self.commit(&previous))
                    .await
                {
                    self.handler.error(
                        "reconciler",
                        "failed to restore previous configuration",
                        restore_err,
                    );
                }
            }
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
            self.set_state(ReconcilerState::Idle);
            return Err(e);
        }

        self.set_state(ReconcilerState::Reloading);
        let reload_result = self
            .reload_breaker
            .execute(|| {
                self.retry.run("applying nginx configuration", || async {
                    if self.proxy.is_running() {
                        self.proxy.reload().await
                    } else {
                        self.proxy.start().await
                    }
                })
            })
            .await;

        if let Err(e) = reload_result {
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
            self.set_state(ReconcilerState::Idle);
            return Err(e);
        }

        *self.last_committed.lock() = Some(text);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.set_state(ReconcilerState::Idle);
        info!("nginx configuration applied");
        Ok(())
    }

    /// Fetch snippets and FastCGI parameter sets for each route. Snippet
    /// failures degrade the route (rendered without the fragment); FastCGI
    /// failures drop the route. The batch always survives.
    async fn load_extras(
        &self,
        routes: Vec<RouteConfig>,
    ) -> (Vec<RouteConfig>, HashMap<String, RouteExtras>) {
        let mut extras = HashMap::new();
        let mut kept = Vec::new();

        for route in routes {
            let mut extra = RouteExtras::default();

            if !route.configuration_snippet.is_empty() {
                extra.configuration_snippet = self
                    .fetch_snippet(&route, &route.configuration_snippet, "configuration snippet")
                    .await;
            }
            if !route.server_snippet.is_empty() {
                extra.server_snippet = self
                    .fetch_snippet(&route, &route.server_snippet, "server snippet")
                    .await;
            }

            if route.fastcgi.enabled {
                let loaded = self
                    .retry
                    .run("loading FastCGI parameters", || async {
                        match self
                            .snippets
                            .load_fastcgi_params(
                                &route.container_id,
                                &route.fastcgi.params,
                                &route.fastcgi.params_file,
                            )
                            .await
                        {
                            Ok(params) => Ok(Ok(params)),
                            // Only transport problems are worth retrying
                            Err(SnippetError::Fetch(e)) => Err(e),
                            Err(other) => Ok(Err(other)),
                        }
                    })
                    .await;

                let cause = match loaded {
                    Ok(Ok(params)) => {
                        extra.fastcgi_params = Some(params);
                        None
                    }
                    Ok(Err(e)) => Some(anyhow::Error::from(e)),
                    Err(e) => Some(e),
                };
                if let Some(cause) = cause {
                    self.handler.handle(
                        &ControllerError::new(
                            ErrorKind::InvalidValue,
                            Severity::Warning,
                            "reconciler",
                            format!(
                                "dropping container {}: FastCGI parameters unavailable",
                                route.container_name
                            ),
                        )
                        .with_cause(cause),
                    );
                    continue;
                }
            }

            extras.insert(route.container_id.clone(), extra);
            kept.push(route);
        }

        (kept, extras)
    }

    async fn fetch_snippet(
        &self,
        route: &RouteConfig,
        path: &str,
        description: &str,
    ) -> Option<String> {
        let result = self
            .retry
            .run(description, || async {
                match self.snippets.fetch(&route.container_id, path).await {
                    Ok(snippet) => Ok(Ok(snippet)),
                    Err(SnippetError::Fetch(e)) => Err(e),
                    // Path gates are deterministic; retrying is pointless
                    Err(other) => Ok(Err(other)),
                }
            })
            .await;

        match result {
            Ok(Ok(snippet)) => Some(snippet.content),
            Ok(Err(e)) => {
                self.handler.handle(
                    &ControllerError::new(
                        ErrorKind::InvalidValue,
                        Severity::Warning,
                        "reconciler",
                        format!(
                            "container {}: {} rejected",
                            route.container_name, description
                        ),
                    )
                    .with_cause(anyhow::Error::from(e)),
                );
                None
            }
            Err(e) => {
                self.handler.warning(
                    "reconciler",
                    format!(
                        "container {}: failed to load {}",
                        route.container_name, description
                    ),
                    e,
                );
                None
            }
        }
    }

    /// Write the temp file, then rename over the live path. The temp file is
    /// removed on any failure.
    async fn commit(&self, content: &str) -> anyhow::Result<()> {
        let path = &self.settings.nginx_config_path;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = PathBuf::from(format!("{}.tmp", path.display()));
        if let Err(e) = tokio::fs::write(&temp_path, content).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(anyhow::anyhow!(
                "failed to write temp config {}: {}",
                temp_path.display(),
                e
            ));
        }
        if let Err(e) = tokio::fs::rename(&temp_path, path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(anyhow::anyhow!(
                "failed to move config into place at {}: {}",
                path.display(),
                e
            ));
        }
        debug!(path = %path.display(), bytes = content.len(), "configuration committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{LABEL_CONFIGURATION_SNIPPET, LABEL_ENABLE, LABEL_HOST, LABEL_PORT};
    use crate::runtime::{
        ContainerBrief, ContainerDetails, ContainerEvent, EventStream, RuntimeClient, RuntimeError,
    };
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64 as StdAtomicU64};

    #[derive(Default)]
    struct FakeRuntime {
        containers: parking_lot::Mutex<HashMap<String, ContainerDetails>>,
        copy_calls: AtomicU32,
    }

    impl FakeRuntime {
        fn add_container(&self, id: &str, name: &str, address: &str, labels: &[(&str, &str)]) {
            let details = ContainerDetails {
                id: id.to_string(),
                name: name.to_string(),
                address: address.to_string(),
                network: "appnet".to_string(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                running: true,
            };
            self.containers.lock().insert(id.to_string(), details);
        }

        fn remove_container(&self, id: &str) {
            self.containers.lock().remove(id);
        }
    }

    #[async_trait]
    impl RuntimeClient for FakeRuntime {
        async fn list_running(&self) -> Result<Vec<ContainerBrief>, RuntimeError> {
            Ok(self
                .containers
                .lock()
                .values()
                .map(|details| ContainerBrief {
                    id: details.id.clone(),
                    name: details.name.clone(),
                    labels: details.labels.clone(),
                })
                .collect())
        }

        async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
            self.containers
                .lock()
                .get(id)
                .cloned()
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
        }

        async fn subscribe_events(&self) -> Result<EventStream, RuntimeError> {
            Ok(futures::stream::empty::<Result<ContainerEvent, RuntimeError>>().boxed())
        }

        async fn copy_file(&self, _id: &str, _path: &str) -> Result<Vec<u8>, RuntimeError> {
            self.copy_calls.fetch_add(1, Ordering::SeqCst);
            Err(RuntimeError::Transport(anyhow::anyhow!("no files here")))
        }

        async fn ping(&self) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct ProxyStats {
        configtests: AtomicU32,
        reloads: AtomicU32,
        starts: AtomicU32,
        fail_configtest: AtomicBool,
        running: AtomicBool,
        configtest_delay_ms: StdAtomicU64,
    }

    struct RecordingProxy(Arc<ProxyStats>);

    #[async_trait]
    impl ProxyHandle for RecordingProxy {
        fn is_running(&self) -> bool {
            self.0.running.load(Ordering::SeqCst)
        }

        async fn configtest(&self) -> anyhow::Result<()> {
            let delay = self.0.configtest_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.0.configtests.fetch_add(1, Ordering::SeqCst);
            if self.0.fail_configtest.load(Ordering::SeqCst) {
                anyhow::bail!("configuration test failed: bad directive");
            }
            Ok(())
        }

        async fn start(&self) -> anyhow::Result<()> {
            self.0.starts.fetch_add(1, Ordering::SeqCst);
            self.0.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn reload(&self) -> anyhow::Result<()> {
            self.0.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        runtime: Arc<FakeRuntime>,
        watcher: Arc<Watcher>,
        reconciler: Arc<Reconciler>,
        stats: Arc<ProxyStats>,
        config_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("conf.d/docker-ingress.conf");
        let template_path = dir.path().join("nginx.conf.tmpl");
        std::fs::write(&template_path, "# managed\n{{upstreams}}{{servers}}").unwrap();

        let settings = Settings {
            nginx_config_path: config_path.clone(),
            template_path,
            snippet_cache_dir: dir.path().join("cache"),
            ..Settings::default()
        };

        let runtime = Arc::new(FakeRuntime::default());
        let handler = Arc::new(ErrorHandler::new(false));
        let (watcher, _tick_rx) =
            Watcher::new(Arc::clone(&runtime) as Arc<dyn RuntimeClient>, Arc::clone(&handler));
        let stats = Arc::new(ProxyStats::default());
        let snippets = SnippetStore::new(
            Arc::clone(&runtime) as Arc<dyn RuntimeClient>,
            settings.snippet_cache_dir.clone(),
        );

        let reconciler = Arc::new(
            Reconciler::new(
                Arc::clone(&watcher),
                snippets,
                Box::new(RecordingProxy(Arc::clone(&stats))),
                settings,
                handler,
            )
            .with_retry(RetryPolicy::new(0, Duration::from_millis(1))),
        );

        Harness {
            runtime,
            watcher,
            reconciler,
            stats,
            config_path,
            _dir: dir,
        }
    }

    fn enabled_labels(host: &str, port: &str) -> Vec<(&'static str, String)> {
        vec![
            (LABEL_ENABLE, "true".to_string()),
            (LABEL_HOST, host.to_string()),
            (LABEL_PORT, port.to_string()),
        ]
    }

    fn add_enabled(harness: &Harness, id: &str, name: &str, address: &str, host: &str, port: &str) {
        let labels = enabled_labels(host, port);
        let labels: Vec<(&str, &str)> = labels.iter().map(|(k, v)| (*k, v.as_str())).collect();
        harness.runtime.add_container(id, name, address, &labels);
    }

    #[tokio::test]
    async fn test_first_pass_starts_proxy_and_commits() {
        let h = harness();
        add_enabled(&h, "aaa111bbb222ccc", "web-1", "10.0.0.5", "app.local", "3000");
        h.watcher.bootstrap().await.unwrap();

        h.reconciler.reconcile_once().await.unwrap();

        let content = std::fs::read_to_string(&h.config_path).unwrap();
        assert!(content.contains("upstream backend_app_local_web_1 {"));
        assert!(content.contains("server 10.0.0.5:3000 weight=1;"));
        assert_eq!(h.stats.starts.load(Ordering::SeqCst), 1);
        assert_eq!(h.stats.reloads.load(Ordering::SeqCst), 0);
        assert_eq!(h.reconciler.state(), ReconcilerState::Idle);
    }

    #[tokio::test]
    async fn test_identical_snapshot_short_circuits() {
        let h = harness();
        add_enabled(&h, "aaa", "web", "10.0.0.5", "app.local", "3000");
        h.watcher.bootstrap().await.unwrap();

        h.reconciler.reconcile_once().await.unwrap();
        let configtests = h.stats.configtests.load(Ordering::SeqCst);

        h.reconciler.reconcile_once().await.unwrap();
        // No write, no validate, no reload the second time
        assert_eq!(h.stats.configtests.load(Ordering::SeqCst), configtests);
        assert_eq!(h.stats.reloads.load(Ordering::SeqCst), 0);
        assert_eq!(h.stats.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_removed_container_disappears_from_config() {
        let h = harness();
        add_enabled(&h, "aaa", "web", "10.0.0.5", "a.local", "3000");
        add_enabled(&h, "bbb", "api", "10.0.0.6", "b.local", "4000");
        h.watcher.bootstrap().await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();
        assert!(std::fs::read_to_string(&h.config_path)
            .unwrap()
            .contains("a.local"));

        h.runtime.remove_container("aaa");
        h.watcher.bootstrap().await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();

        let content = std::fs::read_to_string(&h.config_path).unwrap();
        assert!(!content.contains("a.local"));
        assert!(content.contains("b.local"));
        // Second pass reloads the already-running child
        assert_eq!(h.stats.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_container_does_not_poison_batch() {
        let h = harness();
        add_enabled(&h, "good", "web", "10.0.0.5", "ok.local", "3000");
        add_enabled(&h, "bad", "broken", "10.0.0.6", "broken.local", "99999");
        h.watcher.bootstrap().await.unwrap();

        h.reconciler.reconcile_once().await.unwrap();

        let content = std::fs::read_to_string(&h.config_path).unwrap();
        assert!(content.contains("ok.local"));
        assert!(!content.contains("broken.local"));
    }

    #[tokio::test]
    async fn test_configtest_failure_restores_previous_bytes() {
        let h = harness();
        add_enabled(&h, "aaa", "web", "10.0.0.5", "a.local", "3000");
        h.watcher.bootstrap().await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();
        let good = std::fs::read_to_string(&h.config_path).unwrap();

        add_enabled(&h, "bbb", "api", "10.0.0.6", "b.local", "4000");
        h.watcher.bootstrap().await.unwrap();
        h.stats.fail_configtest.store(true, Ordering::SeqCst);

        assert!(h.reconciler.reconcile_once().await.is_err());

        // The live file carries the previous good bytes again
        let restored = std::fs::read_to_string(&h.config_path).unwrap();
        assert_eq!(restored, good);
        assert_eq!(h.stats.reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_snippet_traversal_renders_without_fragment() {
        let h = harness();
        h.runtime.add_container(
            "aaa",
            "web",
            "10.0.0.5",
            &[
                (LABEL_ENABLE, "true"),
                (LABEL_HOST, "app.local"),
                (LABEL_CONFIGURATION_SNIPPET, "/etc/passwd"),
            ],
        );
        h.watcher.bootstrap().await.unwrap();

        h.reconciler.reconcile_once().await.unwrap();

        let content = std::fs::read_to_string(&h.config_path).unwrap();
        assert!(content.contains("app.local"));
        // The gate fired before any runtime fetch
        assert_eq!(h.runtime.copy_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ticks_during_pass_coalesce_to_one_followup() {
        let h = harness();
        add_enabled(&h, "aaa", "web", "10.0.0.5", "app.local", "3000");
        h.watcher.bootstrap().await.unwrap();
        h.stats.configtest_delay_ms.store(150, Ordering::SeqCst);

        let (tick_tx, tick_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&h.reconciler).run(tick_rx, shutdown_rx));

        tick_tx.send_modify(|g| *g += 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Burst of ticks while the first pass is still validating
        for _ in 0..4 {
            tick_tx.send_modify(|g| *g += 1);
        }

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.reconciler.passes(), 2);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_repeated_failures_enter_degraded_backoff() {
        let h = harness();
        add_enabled(&h, "aaa", "web", "10.0.0.5", "app.local", "3000");
        h.watcher.bootstrap().await.unwrap();
        h.stats.fail_configtest.store(true, Ordering::SeqCst);

        let reconciler = Arc::new(
            Reconciler::new(
                Arc::clone(&h.watcher),
                SnippetStore::new(
                    Arc::clone(&h.runtime) as Arc<dyn RuntimeClient>,
                    h._dir.path().join("cache2"),
                ),
                Box::new(RecordingProxy(Arc::clone(&h.stats))),
                Settings {
                    nginx_config_path: h.config_path.clone(),
                    template_path: h._dir.path().join("nginx.conf.tmpl"),
                    ..Settings::default()
                },
                Arc::new(ErrorHandler::new(false)),
            )
            .with_retry(RetryPolicy::new(0, Duration::from_millis(1)))
            .with_degraded_backoff(Duration::from_millis(300)),
        );

        let (tick_tx, tick_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&reconciler).run(tick_rx, shutdown_rx));

        // Three failing passes, one tick each
        for expected in 1..=3u64 {
            tick_tx.send_modify(|g| *g += 1);
            let mut waited = Duration::ZERO;
            while reconciler.passes() < expected && waited < Duration::from_secs(2) {
                tokio::time::sleep(Duration::from_millis(10)).await;
                waited += Duration::from_millis(10);
            }
        }

        // The third failure trips the backoff
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reconciler.state(), ReconcilerState::DegradedBackoff);

        // After expiry the reconciler leaves backoff and retries
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(reconciler.passes() >= 4);
        assert_ne!(reconciler.state(), ReconcilerState::DegradedBackoff);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
