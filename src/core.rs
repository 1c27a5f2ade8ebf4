//! The service façade: one `Core` value owning the pool and the monitor.
//!
//! External collaborators construct a single `Core` at process start and
//! pass it around explicitly; there are no hidden globals. Tests build
//! isolated cores with injected dialers.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CoreSettings;
use crate::diagnose::{self, CheckResult};
use crate::error::OpsError;
use crate::pool::{HealthMonitor, Pool, PoolEntrySummary};
use crate::procedure::{
    self, DeploySpec, DeploymentResult, ProcedureCtx, ServiceOp,
};
use crate::progress::ProgressSink;
use crate::router::{self, CommandSpec};
use crate::server::{Role, ServerRecord};
use crate::transport::{Dialer, KnownHostsStore, OutputSink, production_dialer};

/// Result of a connectivity test through the façade.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionReport {
    pub ok: bool,
    pub latency_ms: Option<u64>,
    pub auth_method: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ConnectionReport {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            latency_ms: None,
            auth_method: None,
            error: Some(error.into()),
        }
    }
}

/// Process-wide entry point for remote-host operations.
pub struct Core {
    settings: CoreSettings,
    pool: Arc<Pool>,
    monitor: Arc<HealthMonitor>,
    known_hosts: KnownHostsStore,
    shutdown_token: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Core {
    /// Build a core with the production SSH dialer.
    pub fn new(settings: CoreSettings) -> Result<Self, OpsError> {
        let known_hosts = match &settings.known_hosts_path {
            Some(path) => KnownHostsStore::new(path.clone()),
            None => KnownHostsStore::default_location()?,
        };
        let dialer: Arc<dyn Dialer> = Arc::new(production_dialer(known_hosts.clone()));
        Ok(Self::build(dialer, known_hosts, settings))
    }

    /// Build a core around an injected dialer. This is the test seam; the
    /// background tasks run exactly as in production.
    pub fn with_dialer(dialer: Arc<dyn Dialer>, settings: CoreSettings) -> Result<Self, OpsError> {
        let known_hosts = match &settings.known_hosts_path {
            Some(path) => KnownHostsStore::new(path.clone()),
            None => KnownHostsStore::default_location()?,
        };
        Ok(Self::build(dialer, known_hosts, settings))
    }

    fn build(dialer: Arc<dyn Dialer>, known_hosts: KnownHostsStore, settings: CoreSettings) -> Self {
        let pool = Arc::new(Pool::new(dialer.clone(), settings.stale_after));
        let monitor = Arc::new(HealthMonitor::new(
            pool.clone(),
            dialer.clone(),
            settings.probe_timeout,
        ));
        let shutdown_token = CancellationToken::new();

        let monitor_task = monitor
            .clone()
            .spawn(settings.monitor_tick, shutdown_token.clone());

        let cleanup_pool = pool.clone();
        let cleanup_tick = settings.cleanup_tick;
        let cleanup_shutdown = shutdown_token.clone();
        let cleanup_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cleanup_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(cleanup_tick) => cleanup_pool.run_cleanup_once().await,
                }
            }
        });

        Self {
            settings,
            pool,
            monitor,
            known_hosts,
            shutdown_token,
            tasks: StdMutex::new(vec![monitor_task, cleanup_task]),
        }
    }

    fn ensure_open(&self) -> Result<(), OpsError> {
        if self.pool.is_closed() {
            Err(OpsError::PoolClosed)
        } else {
            Ok(())
        }
    }

    fn ctx<'a>(
        &'a self,
        server: &'a ServerRecord,
        cancel: &'a CancellationToken,
    ) -> ProcedureCtx<'a> {
        ProcedureCtx {
            pool: &self.pool,
            server,
            cancel,
            settings: &self.settings,
        }
    }

    /// Dial (or reuse) the transport for `(server, role)` and probe it.
    ///
    /// A root-role request on a locked host is rejected before any dial.
    pub async fn test_connection(
        &self,
        server: &ServerRecord,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<ConnectionReport, OpsError> {
        self.ensure_open()?;
        if let Err(err) = router::ensure_role_allowed(server, role) {
            return Ok(ConnectionReport::failure(err.to_string()));
        }

        let started = Instant::now();
        match self.pool.acquire(server, role, cancel).await {
            Ok(lease) => match lease.probe(self.settings.probe_timeout, cancel).await {
                Ok(_) => Ok(ConnectionReport {
                    ok: true,
                    latency_ms: Some(started.elapsed().as_millis() as u64),
                    auth_method: Some(lease.auth_method().to_string()),
                    error: None,
                }),
                Err(err) => Ok(ConnectionReport::failure(err.to_string())),
            },
            Err(err @ OpsError::Cancelled) => Err(err),
            Err(err) => Ok(ConnectionReport::failure(err.to_string())),
        }
    }

    /// Execute a command, routed by the server's security posture.
    pub async fn execute(
        &self,
        server: &ServerRecord,
        command: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<String, OpsError> {
        self.ensure_open()?;
        self.ctx(server, cancel).run_routed(command).await
    }

    /// Execute a command, streaming prefixed output lines to `sink`.
    /// Returns the remote exit status.
    pub async fn execute_stream(
        &self,
        server: &ServerRecord,
        command: &CommandSpec,
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Result<i32, OpsError> {
        self.ensure_open()?;
        let route = router::route(server, command.privilege())?;
        let lease = self.pool.acquire(server, route.role, cancel).await?;
        let text = route.transform.apply(&command.text);
        lease.stream(&text, sink, cancel).await
    }

    /// Provision the app user, SSH keys and directory layout.
    pub async fn run_setup(
        &self,
        server: &ServerRecord,
        events: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), OpsError> {
        self.ensure_open()?;
        procedure::run_server_setup(&self.ctx(server, cancel), events).await
    }

    /// Apply the security lockdown. On success the caller is responsible
    /// for setting `security_locked` on the server record.
    pub async fn apply_lockdown(
        &self,
        server: &ServerRecord,
        events: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), OpsError> {
        self.ensure_open()?;
        procedure::run_lockdown(&self.ctx(server, cancel), events).await
    }

    /// Run a service operation; returns the command output.
    pub async fn service(
        &self,
        server: &ServerRecord,
        op: ServiceOp,
        service: &str,
        cancel: &CancellationToken,
    ) -> Result<String, OpsError> {
        self.ensure_open()?;
        procedure::run_service_op(&self.ctx(server, cancel), op, service).await
    }

    /// Deploy an application version. Step failures are reported in the
    /// returned result, not as `Err`.
    pub async fn deploy(
        &self,
        server: &ServerRecord,
        spec: &DeploySpec,
        events: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<DeploymentResult, OpsError> {
        self.ensure_open()?;
        procedure::run_deployment(&self.ctx(server, cancel), spec, events).await
    }

    /// Status and counters for every pooled transport.
    pub async fn pool_snapshot(&self) -> Result<Vec<PoolEntrySummary>, OpsError> {
        self.ensure_open()?;
        Ok(self.pool.snapshot().await)
    }

    /// Close and re-dial the pooled transport for `(server, role)`.
    pub async fn recover(
        &self,
        server: &ServerRecord,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<(), OpsError> {
        self.ensure_open()?;
        server.validate()?;
        self.monitor.recover(server, role, cancel).await
    }

    /// Connectivity diagnostics for one server and role.
    pub async fn diagnose(
        &self,
        server: &ServerRecord,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<Vec<CheckResult>, OpsError> {
        self.ensure_open()?;
        server.validate()?;
        Ok(diagnose::run_diagnostics(&self.pool, &self.known_hosts, server, role, cancel).await)
    }

    /// Post-lockdown diagnostics: sudo path, authorized keys, application
    /// tree and sshd directives.
    pub async fn diagnose_post_lockdown(
        &self,
        server: &ServerRecord,
        cancel: &CancellationToken,
    ) -> Result<Vec<CheckResult>, OpsError> {
        self.ensure_open()?;
        server.validate()?;
        Ok(diagnose::run_post_lockdown_checks(&self.pool, server, cancel).await)
    }

    /// Close every pooled transport and stop the background tasks. Further
    /// façade calls yield [`OpsError::PoolClosed`].
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.pool.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list poisoned");
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(err) = task.await {
                log::debug!("background task join error: {err}");
            }
        }
        log::debug!("core shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::testutil::{ScriptedDialer, server};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn settings() -> CoreSettings {
        CoreSettings {
            known_hosts_path: Some(std::env::temp_dir().join("pbfleet-test-known-hosts")),
            // Long ticks keep the background tasks quiet during tests.
            monitor_tick: Duration::from_secs(3600),
            cleanup_tick: Duration::from_secs(3600),
            stale_after: Duration::from_secs(3600),
            probe_timeout: Duration::from_secs(5),
            service_verify_delay: Duration::from_millis(10),
        }
    }

    fn core() -> (Arc<ScriptedDialer>, Core) {
        let dialer = Arc::new(ScriptedDialer::new());
        let core = Core::with_dialer(dialer.clone(), settings()).expect("core");
        (dialer, core)
    }

    #[tokio::test]
    async fn execute_routes_privileged_to_root_when_unlocked() {
        let (dialer, core) = core();
        let cancel = CancellationToken::new();
        core.execute(
            &server(),
            &CommandSpec::privileged("systemctl restart nginx"),
            &cancel,
        )
        .await
        .expect("execute");

        let log = dialer.logged_commands();
        assert!(log.contains(&"root: systemctl restart nginx".to_string()));
        core.shutdown().await;
    }

    #[tokio::test]
    async fn execute_wraps_privileged_with_sudo_when_locked() {
        let (dialer, core) = core();
        let cancel = CancellationToken::new();
        let mut locked = server();
        locked.security_locked = true;

        core.execute(
            &locked,
            &CommandSpec::privileged("systemctl restart nginx"),
            &cancel,
        )
        .await
        .expect("execute");

        let log = dialer.logged_commands();
        assert!(log.contains(&"pocketbase: sudo systemctl restart nginx".to_string()));
        core.shutdown().await;
    }

    #[tokio::test]
    async fn locked_root_test_connection_fails_without_dialing() {
        let (dialer, core) = core();
        let cancel = CancellationToken::new();
        let mut locked = server();
        locked.security_locked = true;

        let report = core
            .test_connection(&locked, Role::Root, &cancel)
            .await
            .expect("report");
        assert!(!report.ok);
        assert_eq!(
            report.error.as_deref(),
            Some("Root SSH access disabled by security lockdown")
        );
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
        core.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_reports_latency_and_auth() {
        let (_dialer, core) = core();
        let cancel = CancellationToken::new();
        let report = core
            .test_connection(&server(), Role::App, &cancel)
            .await
            .expect("report");
        assert!(report.ok);
        assert!(report.latency_ms.is_some());
        assert_eq!(report.auth_method.as_deref(), Some("ssh-agent"));
        core.shutdown().await;
    }

    #[tokio::test]
    async fn every_call_after_shutdown_yields_pool_closed() {
        let (_dialer, core) = core();
        let cancel = CancellationToken::new();
        core.shutdown().await;

        assert!(matches!(
            core.test_connection(&server(), Role::App, &cancel).await,
            Err(OpsError::PoolClosed)
        ));
        assert!(matches!(
            core.execute(&server(), &CommandSpec::new("uptime"), &cancel).await,
            Err(OpsError::PoolClosed)
        ));
        assert!(matches!(core.pool_snapshot().await, Err(OpsError::PoolClosed)));
        assert!(matches!(
            core.service(&server(), ServiceOp::Status, "pocketbase", &cancel).await,
            Err(OpsError::PoolClosed)
        ));
        assert!(matches!(
            core.diagnose(&server(), Role::App, &cancel).await,
            Err(OpsError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn service_restart_verifies_active() {
        let (dialer, core) = core();
        let cancel = CancellationToken::new();
        core.service(&server(), ServiceOp::Restart, "pocketbase", &cancel)
            .await
            .expect("restart");

        let log = dialer.logged_commands();
        assert!(
            log.iter()
                .any(|cmd| cmd.ends_with("systemctl restart pocketbase"))
        );
        assert!(
            log.iter()
                .any(|cmd| cmd.ends_with("systemctl is-active pocketbase"))
        );
        core.shutdown().await;
    }

    #[tokio::test]
    async fn recover_without_pooled_entry_is_ok() {
        let (_dialer, core) = core();
        let cancel = CancellationToken::new();
        core.recover(&server(), Role::App, &cancel).await.expect("recover");
        core.shutdown().await;
    }
}
