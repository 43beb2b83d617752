use futures::FutureExt;
use ingressd::errors::ErrorHandler;
use ingressd::health::HealthMonitor;
use ingressd::labels::extract_route;
use ingressd::nginx::NginxSupervisor;
use ingressd::reconciler::Reconciler;
use ingressd::resilience::{spawn_guarded, RetryPolicy};
use ingressd::runtime::{DockerRuntime, RuntimeClient};
use ingressd::settings::Settings;
use ingressd::snippets::SnippetStore;
use ingressd::watcher::Watcher;
use rcgen::generate_simple_self_signed;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ingressd=info".parse().expect("valid log directive")),
        )
        .init();

    let settings = Settings::from_env();
    let handler = Arc::new(ErrorHandler::new(settings.strict_errors));
    let retry = RetryPolicy::default();

    info!(
        config = %settings.nginx_config_path.display(),
        binary = %settings.nginx_binary,
        cache = %settings.snippet_cache_dir.display(),
        template = %settings.template_path.display(),
        health_port = settings.health_port,
        strict = settings.strict_errors,
        "starting nginx ingress controller"
    );

    // Directories nginx and the controller write into
    if let Err(e) = retry
        .run("creating runtime directories", || async {
            create_directories(&settings)
        })
        .await
    {
        handler.critical("startup", "failed to create runtime directories", e);
        return Ok(());
    }

    // A default self-signed pair so TLS server blocks always have something
    // to point at; failure is not fatal
    if let Err(e) = generate_default_certificate(&settings) {
        handler.warning("startup", "failed to generate default TLS certificate", e);
    }

    // Docker connection, verified with a ping
    let runtime: Arc<dyn RuntimeClient> = {
        let connected = retry
            .run("connecting to Docker daemon", || async {
                let client = DockerRuntime::connect(settings.docker_host.as_deref())?;
                client
                    .ping()
                    .await
                    .map_err(|e| anyhow::anyhow!("Docker daemon is not responding: {}", e))?;
                Ok(client)
            })
            .await;
        match connected {
            Ok(client) => Arc::new(client),
            Err(e) => {
                handler.critical("docker", "failed to connect to Docker after retries", e);
                return Ok(());
            }
        }
    };
    info!("Docker daemon is reachable");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = NginxSupervisor::new(settings.nginx_binary.clone(), Arc::clone(&handler));

    // Health surface: runtime reachability and child liveness
    let health = HealthMonitor::new(Arc::clone(&handler), shutdown_rx.clone());
    {
        let probe_runtime = Arc::clone(&runtime);
        health.register(
            "docker",
            Duration::from_secs(30),
            Arc::new(move || {
                let runtime = Arc::clone(&probe_runtime);
                async move { runtime.ping().await.map_err(anyhow::Error::from) }.boxed()
            }),
        );
        let probe_supervisor = Arc::clone(&supervisor);
        health.register(
            "nginx",
            Duration::from_secs(15),
            Arc::new(move || {
                let supervisor = Arc::clone(&probe_supervisor);
                async move {
                    if supervisor.is_running() {
                        Ok(())
                    } else {
                        anyhow::bail!("nginx process is not running")
                    }
                }
                .boxed()
            }),
        );
    }
    {
        let health = Arc::clone(&health);
        let port = settings.health_port;
        spawn_guarded("health-server", Arc::clone(&handler), async move {
            if let Err(e) = health.serve(port).await {
                warn!(error = %e, "health server error");
            }
        });
    }

    // Watcher and its initial enumeration
    let (watcher, tick_rx) = Watcher::new(Arc::clone(&runtime), Arc::clone(&handler));
    if let Err(e) = retry
        .run("loading initial container set", || watcher.bootstrap())
        .await
    {
        handler.critical("watcher", "failed to load initial configuration", e);
        return Ok(());
    }
    report_routes(&watcher);

    // Start nginx before the first reconcile pass so a reload has a target
    if let Err(e) = retry.run("starting nginx", || supervisor.start()).await {
        handler.critical("nginx", "failed to start nginx after retries", e);
        return Ok(());
    }

    let snippets = SnippetStore::new(Arc::clone(&runtime), settings.snippet_cache_dir.clone());
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&watcher),
        snippets,
        Box::new(Arc::clone(&supervisor)),
        settings.clone(),
        Arc::clone(&handler),
    ));

    let watcher_task = spawn_guarded(
        "watcher",
        Arc::clone(&handler),
        Arc::clone(&watcher).run(shutdown_rx.clone()),
    );
    // The bootstrap already published the first tick; the reconciler's
    // initial pass starts as soon as it begins listening
    let reconciler_task = spawn_guarded(
        "reconciler",
        Arc::clone(&handler),
        Arc::clone(&reconciler).run(tick_rx, shutdown_rx.clone()),
    );

    info!("controller started, watching containers labeled nginx.ingress.*");

    wait_for_shutdown_signal().await;
    info!("shutting down");

    let _ = shutdown_tx.send(true);

    if let Err(e) = supervisor.stop().await {
        handler.warning("nginx", "error stopping nginx", e);
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = watcher_task.await;
        let _ = reconciler_task.await;
    })
    .await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C");
    }
}

fn create_directories(settings: &Settings) -> anyhow::Result<()> {
    let mut dirs = vec![settings.ssl_dir.clone(), settings.snippet_cache_dir.clone()];
    if let Some(parent) = settings.nginx_config_path.parent() {
        dirs.push(parent.to_path_buf());
    }
    for dir in dirs {
        std::fs::create_dir_all(&dir)
            .map_err(|e| anyhow::anyhow!("failed to create directory {}: {}", dir.display(), e))?;
    }
    Ok(())
}

/// Emit `default.crt`/`default.key` unless a pair already exists.
fn generate_default_certificate(settings: &Settings) -> anyhow::Result<()> {
    let cert_path = settings.default_cert_path();
    let key_path = settings.default_key_path();
    if cert_path.exists() {
        info!(cert = %cert_path.display(), "default TLS certificate already present");
        return Ok(());
    }

    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let certified = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("failed to generate self-signed certificate: {}", e))?;

    std::fs::write(&cert_path, certified.cert.pem())?;
    std::fs::write(&key_path, certified.key_pair.serialize_pem())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&cert_path, std::fs::Permissions::from_mode(0o644))?;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    info!(cert = %cert_path.display(), "default self-signed TLS certificate generated");
    Ok(())
}

/// Log the enabled routes found at startup.
fn report_routes(watcher: &Watcher) {
    let snapshot = watcher.snapshot();
    let mut enabled = 0usize;
    for record in &snapshot {
        if let Ok(route) = extract_route(&record.id, &record.name, &record.address, &record.labels)
        {
            if route.enabled {
                enabled += 1;
                info!(
                    host = %route.host,
                    backend = %format!("{}:{}", route.address, route.port),
                    path = %route.path,
                    container = %route.container_name,
                    "route configured"
                );
            }
        }
    }
    if enabled == 0 {
        info!(
            "no containers with ingress labels found; add nginx.ingress.enable=true \
             and nginx.ingress.host=<hostname> labels to route traffic"
        );
    }
}
