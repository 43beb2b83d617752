//! nginx child process supervision.
//!
//! The supervisor owns the child exclusively: it starts nginx in the
//! foreground inside its own process group, validates configuration with
//! `nginx -t` before any start or reload, translates reload requests into
//! SIGHUP, and stops with SIGQUIT bounded by a grace period before SIGKILL.
//! A monitor task observes unexpected exits and reports them as Critical.

use crate::errors::ErrorHandler;
use crate::resilience::{spawn_guarded, RetryPolicy};
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// What the reconciler needs from the proxy child: adopt-or-start semantics
/// plus out-of-process configuration validation.
#[async_trait::async_trait]
pub trait ProxyHandle: Send + Sync {
    fn is_running(&self) -> bool;
    async fn configtest(&self) -> anyhow::Result<()>;
    async fn start(&self) -> anyhow::Result<()>;
    async fn reload(&self) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl ProxyHandle for Arc<NginxSupervisor> {
    fn is_running(&self) -> bool {
        NginxSupervisor::is_running(self)
    }

    async fn configtest(&self) -> anyhow::Result<()> {
        NginxSupervisor::configtest(self).await
    }

    async fn start(&self) -> anyhow::Result<()> {
        NginxSupervisor::start(self).await
    }

    async fn reload(&self) -> anyhow::Result<()> {
        NginxSupervisor::reload(self).await
    }
}

struct Inner {
    state: ProcessState,
    pid: Option<u32>,
    exit_rx: Option<watch::Receiver<bool>>,
    shutdown_requested: bool,
}

/// Supervises the nginx child. Start, reload and stop are serialized by a
/// single async mutex so a reload can never race the monitor's exit handling
/// or another lifecycle call.
pub struct NginxSupervisor {
    binary: String,
    ops: tokio::sync::Mutex<()>,
    inner: Arc<Mutex<Inner>>,
    handler: Arc<ErrorHandler>,
    retry: RetryPolicy,
    stop_timeout: Duration,
}

impl NginxSupervisor {
    pub fn new(binary: impl Into<String>, handler: Arc<ErrorHandler>) -> Arc<Self> {
        Self::with_stop_timeout(binary, handler, Duration::from_secs(10))
    }

    /// Construct with an explicit graceful-stop bound (tests use a short one).
    pub fn with_stop_timeout(
        binary: impl Into<String>,
        handler: Arc<ErrorHandler>,
        stop_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            binary: binary.into(),
            ops: tokio::sync::Mutex::new(()),
            inner: Arc::new(Mutex::new(Inner {
                state: ProcessState::Stopped,
                pid: None,
                exit_rx: None,
                shutdown_requested: false,
            })),
            handler,
            retry: RetryPolicy::new(2, Duration::from_secs(3)),
            stop_timeout,
        })
    }

    pub fn state(&self) -> ProcessState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    /// Run `nginx -t` against the on-disk configuration.
    pub async fn configtest(&self) -> anyhow::Result<()> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("-t")
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("failed to run {} -t: {}", self.binary, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("configuration test failed: {}", stderr.trim());
        }
        Ok(())
    }

    /// Start the child in foreground mode within its own process group.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let _ops = self.ops.lock().await;

        if self.state() == ProcessState::Running {
            warn!("start requested but nginx is already running");
            return Ok(());
        }

        self.retry
            .run("testing nginx configuration", || self.configtest())
            .await?;

        self.inner.lock().state = ProcessState::Starting;

        let mut command = tokio::process::Command::new(&self.binary);
        command
            .args(["-g", "daemon off;"])
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.inner.lock().state = ProcessState::Stopped;
                return Err(anyhow::anyhow!("failed to start {}: {}", self.binary, e));
            }
        };

        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(false);
        {
            let mut inner = self.inner.lock();
            inner.state = ProcessState::Running;
            inner.pid = pid;
            inner.exit_rx = Some(exit_rx);
            inner.shutdown_requested = false;
        }
        info!(pid, "nginx started");

        // Monitor owns the child handle and reaps it
        let inner = Arc::clone(&self.inner);
        let handler = Arc::clone(&self.handler);
        spawn_guarded("nginx-monitor", Arc::clone(&self.handler), async move {
            let status = child.wait().await;
            let was_requested = {
                let mut guard = inner.lock();
                let requested = guard.shutdown_requested;
                guard.state = ProcessState::Stopped;
                guard.pid = None;
                requested
            };
            let _ = exit_tx.send(true);

            match status {
                Ok(status) if was_requested => {
                    debug!(?status, "nginx exited after stop request");
                }
                Ok(status) => {
                    handler.critical(
                        "nginx",
                        "nginx process exited unexpectedly",
                        anyhow::anyhow!("exit status: {}", status),
                    );
                }
                Err(e) => {
                    handler.critical("nginx", "failed waiting on nginx process", e.into());
                }
            }
        });

        Ok(())
    }

    /// Ask the running child to re-read its configuration.
    ///
    /// Refused unless the child is Running and the configuration passes
    /// `nginx -t` first.
    pub async fn reload(&self) -> anyhow::Result<()> {
        let _ops = self.ops.lock().await;

        let pid = {
            let inner = self.inner.lock();
            if inner.state != ProcessState::Running {
                anyhow::bail!("nginx is not running");
            }
            inner.pid.ok_or_else(|| anyhow::anyhow!("nginx pid unknown"))?
        };

        self.retry
            .run("testing configuration before reload", || self.configtest())
            .await?;

        send_signal(pid, libc::SIGHUP)?;
        info!(pid, "nginx configuration reloaded");
        Ok(())
    }

    /// Graceful stop: SIGQUIT, bounded wait, SIGKILL on timeout.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let _ops = self.ops.lock().await;

        let (pid, mut exit_rx) = {
            let mut inner = self.inner.lock();
            if inner.state != ProcessState::Running {
                debug!("stop requested but nginx is not running");
                return Ok(());
            }
            inner.shutdown_requested = true;
            inner.state = ProcessState::Stopping;
            let pid = inner.pid.ok_or_else(|| anyhow::anyhow!("nginx pid unknown"))?;
            let exit_rx = inner.exit_rx.clone();
            (pid, exit_rx)
        };

        info!(pid, "stopping nginx");
        if let Err(e) = send_signal(pid, libc::SIGQUIT) {
            warn!(pid, error = %e, "failed to send SIGQUIT, killing");
            kill_group(pid);
        }

        let exited = match exit_rx.as_mut() {
            Some(rx) => tokio::time::timeout(self.stop_timeout, rx.changed())
                .await
                .is_ok(),
            None => false,
        };

        if !exited {
            warn!(
                pid,
                timeout_secs = self.stop_timeout.as_secs(),
                "timeout waiting for nginx to stop, sending SIGKILL"
            );
            kill_group(pid);
            if let Some(rx) = exit_rx.as_mut() {
                let _ = tokio::time::timeout(Duration::from_secs(2), rx.changed()).await;
            }
        }

        let mut inner = self.inner.lock();
        inner.state = ProcessState::Stopped;
        inner.pid = None;
        inner.exit_rx = None;
        Ok(())
    }
}

fn send_signal(pid: u32, signal: i32) -> anyhow::Result<()> {
    let result = unsafe { libc::kill(pid as i32, signal) };
    if result != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Kill the whole process group (nginx master plus workers).
fn kill_group(pid: u32) {
    unsafe {
        // Negative pid targets the group created at spawn
        if libc::kill(-(pid as i32), libc::SIGKILL) != 0 {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}
