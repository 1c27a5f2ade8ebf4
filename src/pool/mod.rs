//! Keyed pool of live SSH transports.
//!
//! The pool multiplexes callers onto one transport per
//! `(host, port, server-id, role)` key. Lookups take a read lock; creation
//! uses the classic double-check under the write lock, with the dial itself
//! performed outside any map lock. Each entry carries its own mutex, which
//! serializes probes against use and makes recovery single-flight per key.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::OpsError;
use crate::server::{Role, ServerRecord};
use crate::transport::{Dialer, ExecOutput, OutputSink, Transport};

mod monitor;

pub use monitor::{HealthMonitor, MonitorEvent};

/// Identity of a pooled transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub server_id: String,
    pub role: Role,
}

impl PoolKey {
    pub fn for_server(server: &ServerRecord, role: Role) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            server_id: server.id.clone(),
            role,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}",
            self.host, self.port, self.server_id, self.role
        )
    }
}

/// Health classification of a pooled transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Recovering,
    Failed,
}

impl ConnectionStatus {
    /// Whether a lease may be handed out in this state.
    pub fn usable(&self) -> bool {
        matches!(self, ConnectionStatus::Healthy | ConnectionStatus::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Healthy => "healthy",
            ConnectionStatus::Degraded => "degraded",
            ConnectionStatus::Unhealthy => "unhealthy",
            ConnectionStatus::Recovering => "recovering",
            ConnectionStatus::Failed => "failed",
        }
    }
}

/// Map a consecutive-failure count onto a status.
pub(crate) fn status_for_failures(failures: u32) -> ConnectionStatus {
    if failures >= config::FAILED_AFTER_FAILURES {
        ConnectionStatus::Failed
    } else if failures >= config::UNHEALTHY_AFTER_FAILURES {
        ConnectionStatus::Unhealthy
    } else if failures > 0 {
        ConnectionStatus::Degraded
    } else {
        ConnectionStatus::Healthy
    }
}

/// Mutable interior of a pool entry. Always reached through the entry mutex.
pub(crate) struct EntryState {
    pub(crate) transport: Transport,
    pub(crate) status: ConnectionStatus,
    pub(crate) consecutive_failures: u32,
    pub(crate) total_uses: u64,
    pub(crate) total_errors: u64,
    pub(crate) rolling_avg_response: Option<Duration>,
    pub(crate) last_used: Instant,
}

impl EntryState {
    fn new(transport: Transport) -> Self {
        Self {
            transport,
            status: ConnectionStatus::Healthy,
            consecutive_failures: 0,
            total_uses: 0,
            total_errors: 0,
            rolling_avg_response: None,
            last_used: Instant::now(),
        }
    }

    /// Fold one probe latency sample into the two-sample moving average.
    pub(crate) fn record_latency(&mut self, sample: Duration) {
        self.rolling_avg_response = Some(match self.rolling_avg_response {
            Some(prev) => (prev + sample) / 2,
            None => sample,
        });
    }
}

/// One pooled transport plus its health bookkeeping.
pub struct PooledEntry {
    key: PoolKey,
    pub(crate) state: Mutex<EntryState>,
}

impl PooledEntry {
    fn new(key: PoolKey, transport: Transport) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(EntryState::new(transport)),
        })
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }
}

/// Snapshot line for one pool entry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PoolEntrySummary {
    pub key: String,
    pub status: ConnectionStatus,
    pub consecutive_failures: u32,
    pub total_uses: u64,
    pub total_errors: u64,
    /// Two-sample moving average of probe latency, when measured.
    pub rolling_avg_response_ms: Option<u64>,
    pub idle_secs: u64,
    pub open: bool,
}

/// A caller's temporary right to use a pooled transport.
///
/// Dropping the lease releases it. Entries are shared rather than checked
/// out exclusively; the per-entry mutex serializes the actual I/O.
pub struct Lease {
    entry: Arc<PooledEntry>,
    username: String,
    auth_method: String,
    role: Role,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", self.entry.key())
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .field("role", &self.role)
            .finish()
    }
}

impl Lease {
    pub fn key(&self) -> &PoolKey {
        self.entry.key()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn auth_method(&self) -> &str {
        &self.auth_method
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Run a command; non-zero exit is an error carrying the output.
    pub async fn run(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, OpsError> {
        let mut state = self.entry.state.lock().await;
        let result = state.transport.run(command, timeout, cancel).await;
        state.last_used = Instant::now();
        result
    }

    /// Run a command, reporting the exit code instead of failing on it.
    pub async fn run_unchecked(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, OpsError> {
        let mut state = self.entry.state.lock().await;
        let result = state.transport.run_unchecked(command, timeout, cancel).await;
        state.last_used = Instant::now();
        result
    }

    /// Stream command output to `sink`; returns the exit status.
    pub async fn stream(
        &self,
        command: &str,
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Result<i32, OpsError> {
        let mut state = self.entry.state.lock().await;
        let result = state.transport.stream(command, sink, cancel).await;
        state.last_used = Instant::now();
        result
    }

    /// Probe the transport once, outside of the monitor schedule.
    pub async fn probe(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Duration, OpsError> {
        let mut state = self.entry.state.lock().await;
        let result = state.transport.probe(timeout, cancel).await;
        state.last_used = Instant::now();
        result
    }
}

/// Process-wide keyed transport cache.
pub struct Pool {
    entries: RwLock<HashMap<PoolKey, Arc<PooledEntry>>>,
    dialer: Arc<dyn Dialer>,
    closed: AtomicBool,
    evictions: StdMutex<VecDeque<PoolKey>>,
    stale_after: Duration,
}

impl Pool {
    pub fn new(dialer: Arc<dyn Dialer>, stale_after: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dialer,
            closed: AtomicBool::new(false),
            evictions: StdMutex::new(VecDeque::new()),
            stale_after,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), OpsError> {
        if self.is_closed() {
            Err(OpsError::PoolClosed)
        } else {
            Ok(())
        }
    }

    /// Lease the transport for `(server, role)`, creating it when absent or
    /// replacing it when the cached one is no longer usable.
    pub async fn acquire(
        &self,
        server: &ServerRecord,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<Lease, OpsError> {
        self.ensure_open()?;
        server.validate()?;
        let key = PoolKey::for_server(server, role);

        if let Some(entry) = self.lookup(&key).await {
            if let Some(lease) = self.lease_if_usable(&entry).await {
                log::debug!("pool hit: {key}");
                return Ok(lease);
            }
            log::debug!("pool entry for {key} unusable, recreating");
        } else {
            log::debug!("pool miss, dialing {key}");
        }

        // Dial outside every lock, then double-check under the write lock.
        let transport = self.dialer.dial(server, role, cancel).await?;
        let fresh = PooledEntry::new(key.clone(), transport);

        let (winner, loser) = {
            let mut entries = self.entries.write().await;
            self.ensure_open()?;
            match entries.get(&key).cloned() {
                Some(existing) => {
                    // A racer may have inserted a usable entry while we
                    // dialed; adopt it and discard ours. A busy entry
                    // (mutex held) is in active use, which counts as usable.
                    let existing_usable = match existing.state.try_lock() {
                        Ok(state) => state.transport.is_open() && state.status.usable(),
                        Err(_) => true,
                    };
                    if existing_usable {
                        (existing, Some(fresh))
                    } else {
                        entries.insert(key.clone(), fresh.clone());
                        (fresh, Some(existing))
                    }
                }
                None => {
                    entries.insert(key.clone(), fresh.clone());
                    (fresh, None)
                }
            }
        };
        if let Some(loser) = loser {
            close_entry(&loser).await;
        }

        self.lease_from(&winner).await
    }

    async fn lookup(&self, key: &PoolKey) -> Option<Arc<PooledEntry>> {
        let entries = self.entries.read().await;
        entries.get(key).cloned()
    }

    async fn lease_if_usable(&self, entry: &Arc<PooledEntry>) -> Option<Lease> {
        let mut state = entry.state.lock().await;
        if !state.transport.is_open() || !state.status.usable() {
            return None;
        }
        state.total_uses += 1;
        state.last_used = Instant::now();
        Some(Lease {
            entry: entry.clone(),
            username: state.transport.username().to_string(),
            auth_method: state.transport.auth_method().to_string(),
            role: state.transport.role(),
        })
    }

    async fn lease_from(&self, entry: &Arc<PooledEntry>) -> Result<Lease, OpsError> {
        self.lease_if_usable(entry).await.ok_or_else(|| {
            OpsError::TransportUnhealthy {
                key: entry.key().to_string(),
                status: "closed".to_string(),
            }
        })
    }

    /// Close and remove the entry for `key`, if present.
    pub async fn evict(&self, key: &PoolKey) {
        let removed = {
            let mut entries = self.entries.write().await;
            entries.remove(key)
        };
        if let Some(entry) = removed {
            log::debug!("evicting {key}");
            close_entry(&entry).await;
        }
    }

    /// Queue `key` for eviction at the next cleanup tick. Used by the
    /// health monitor, which never touches the map directly.
    pub fn schedule_evict(&self, key: PoolKey) {
        let mut queue = self.evictions.lock().expect("eviction queue poisoned");
        if !queue.contains(&key) {
            queue.push_back(key);
        }
    }

    /// Current entries, for the monitor's probe sweep.
    pub(crate) async fn entries_snapshot(&self) -> Vec<Arc<PooledEntry>> {
        let entries = self.entries.read().await;
        entries.values().cloned().collect()
    }

    /// Status and counters for every pooled entry.
    pub async fn snapshot(&self) -> Vec<PoolEntrySummary> {
        let entries = self.entries_snapshot().await;
        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            let state = entry.state.lock().await;
            summaries.push(PoolEntrySummary {
                key: entry.key().to_string(),
                status: state.status,
                consecutive_failures: state.consecutive_failures,
                total_uses: state.total_uses,
                total_errors: state.total_errors,
                rolling_avg_response_ms: state
                    .rolling_avg_response
                    .map(|d| d.as_millis() as u64),
                idle_secs: state.last_used.elapsed().as_secs(),
                open: state.transport.is_open(),
            });
        }
        summaries
    }

    /// One cleanup pass: drain the monitor's eviction queue, then evict
    /// entries idle past the stale bound.
    pub async fn run_cleanup_once(&self) {
        let queued: Vec<PoolKey> = {
            let mut queue = self.evictions.lock().expect("eviction queue poisoned");
            queue.drain(..).collect()
        };
        for key in queued {
            self.evict(&key).await;
        }

        let mut stale = Vec::new();
        for entry in self.entries_snapshot().await {
            let state = entry.state.lock().await;
            if state.last_used.elapsed() > self.stale_after {
                stale.push(entry.key().clone());
            }
        }
        for key in stale {
            log::debug!("stale cleanup: {key}");
            self.evict(&key).await;
        }
    }

    /// Close every entry and refuse further use.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Arc<PooledEntry>> = {
            let mut entries = self.entries.write().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            close_entry(&entry).await;
        }
    }
}

async fn close_entry(entry: &Arc<PooledEntry>) {
    let state = entry.state.lock().await;
    state.transport.close().await;
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Scripted sessions and dialers shared by the pool and monitor tests.

    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    /// A session that answers probes from a script and records commands.
    pub struct ScriptedSession {
        pub open: AtomicBool,
        /// Commands executed on this session, in order.
        pub commands: Arc<SyncMutex<Vec<String>>>,
        /// When false, probe echoes fail with a non-zero exit.
        pub healthy: Arc<AtomicBool>,
    }

    impl ScriptedSession {
        pub fn healthy() -> Self {
            Self {
                open: AtomicBool::new(true),
                commands: Arc::new(SyncMutex::new(Vec::new())),
                healthy: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    #[async_trait]
    impl crate::transport::RemoteSession for ScriptedSession {
        async fn run(
            &self,
            command: &str,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<ExecOutput, OpsError> {
            self.commands
                .lock()
                .expect("commands lock")
                .push(command.to_string());
            if command.starts_with("echo ") {
                if self.healthy.load(Ordering::SeqCst) {
                    return Ok(ExecOutput {
                        output: command["echo ".len()..].to_string(),
                        exit: 0,
                    });
                }
                return Ok(ExecOutput {
                    output: String::new(),
                    exit: 1,
                });
            }
            // Canned answers for the handful of commands whose output the
            // procedures inspect.
            let (output, exit) = if command.contains("systemctl is-active") {
                ("active\n".to_string(), 0)
            } else if command.contains("sudo -n whoami") {
                ("root\n".to_string(), 0)
            } else if command.contains("ufw status") {
                (
                    "Status: active\n22/tcp ALLOW\n80/tcp ALLOW\n443/tcp ALLOW\n".to_string(),
                    0,
                )
            } else if command.contains("grep -E '^(PermitRootLogin") {
                (
                    "PermitRootLogin no\nPasswordAuthentication no\nPubkeyAuthentication yes\nMaxAuthTries 3\n"
                        .to_string(),
                    0,
                )
            } else if command.starts_with("cat ") {
                (String::new(), 1)
            } else {
                ("ok\n".to_string(), 0)
            };
            Ok(ExecOutput { output, exit })
        }

        async fn stream(
            &self,
            _command: &str,
            _sink: &OutputSink,
            _cancel: &CancellationToken,
        ) -> Result<i32, OpsError> {
            Ok(0)
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    /// Dialer that mints scripted sessions and counts dials. Every minted
    /// session appends executed commands to the shared `commands` log as
    /// `"<username>: <command>"`.
    pub struct ScriptedDialer {
        pub dials: AtomicU32,
        /// Shared health switch for every minted session.
        pub healthy: Arc<AtomicBool>,
        /// Dial attempts that fail before this one succeed.
        pub fail_first: AtomicU32,
        /// Interleaved command log across all sessions.
        pub commands: Arc<SyncMutex<Vec<String>>>,
    }

    impl ScriptedDialer {
        pub fn new() -> Self {
            Self {
                dials: AtomicU32::new(0),
                healthy: Arc::new(AtomicBool::new(true)),
                fail_first: AtomicU32::new(0),
                commands: Arc::new(SyncMutex::new(Vec::new())),
            }
        }

        pub fn logged_commands(&self) -> Vec<String> {
            self.commands.lock().expect("commands lock").clone()
        }
    }

    /// Session wrapper that prefixes logged commands with its username.
    struct TaggedSession {
        inner: ScriptedSession,
        username: String,
        log: Arc<SyncMutex<Vec<String>>>,
    }

    #[async_trait]
    impl crate::transport::RemoteSession for TaggedSession {
        async fn run(
            &self,
            command: &str,
            timeout: Duration,
            cancel: &CancellationToken,
        ) -> Result<ExecOutput, OpsError> {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("{}: {command}", self.username));
            self.inner.run(command, timeout, cancel).await
        }

        async fn stream(
            &self,
            command: &str,
            sink: &OutputSink,
            cancel: &CancellationToken,
        ) -> Result<i32, OpsError> {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("{}: {command}", self.username));
            sink.stdout_line("streamed");
            self.inner.stream(command, sink, cancel).await
        }

        fn is_open(&self) -> bool {
            self.inner.is_open()
        }

        async fn close(&self) {
            self.inner.close().await;
        }
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(
            &self,
            server: &ServerRecord,
            role: Role,
            _cancel: &CancellationToken,
        ) -> Result<Transport, OpsError> {
            let n = self.dials.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first.load(Ordering::SeqCst) {
                return Err(OpsError::DialFailed {
                    attempts: config::DIAL_ATTEMPTS,
                    reason: "connection refused".to_string(),
                });
            }
            let username = role.username(server).to_string();
            let session = TaggedSession {
                inner: ScriptedSession {
                    open: AtomicBool::new(true),
                    commands: Arc::new(SyncMutex::new(Vec::new())),
                    healthy: self.healthy.clone(),
                },
                username: username.clone(),
                log: self.commands.clone(),
            };
            Ok(Transport::new(Box::new(session), role, username, "ssh-agent"))
        }
    }

    pub fn server() -> ServerRecord {
        ServerRecord {
            id: "s1".to_string(),
            host: "10.0.0.5".to_string(),
            port: 22,
            root_username: "root".to_string(),
            app_username: "pocketbase".to_string(),
            security_locked: false,
            use_ssh_agent: false,
            manual_key_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{ScriptedDialer, server};
    use super::*;

    fn pool() -> (Arc<ScriptedDialer>, Pool) {
        let dialer = Arc::new(ScriptedDialer::new());
        let pool = Pool::new(dialer.clone(), config::STALE_AFTER);
        (dialer, pool)
    }

    #[tokio::test]
    async fn acquire_inserts_keyed_entry() {
        let (_dialer, pool) = pool();
        let cancel = CancellationToken::new();
        let lease = pool
            .acquire(&server(), Role::App, &cancel)
            .await
            .expect("acquire");
        assert_eq!(lease.username(), "pocketbase");

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, "10.0.0.5:22/s1/app");
        assert_eq!(snapshot[0].status, ConnectionStatus::Healthy);
        assert_eq!(snapshot[0].total_uses, 1);
    }

    #[tokio::test]
    async fn acquire_reuses_existing_entry() {
        let (dialer, pool) = pool();
        let cancel = CancellationToken::new();
        pool.acquire(&server(), Role::App, &cancel).await.expect("first");
        pool.acquire(&server(), Role::App, &cancel).await.expect("second");
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot[0].total_uses, 2);
    }

    #[tokio::test]
    async fn roles_get_distinct_entries() {
        let (dialer, pool) = pool();
        let cancel = CancellationToken::new();
        pool.acquire(&server(), Role::App, &cancel).await.expect("app");
        pool.acquire(&server(), Role::Root, &cancel).await.expect("root");
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert_eq!(pool.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn dial_failure_leaves_pool_empty() {
        let (dialer, pool) = pool();
        dialer.fail_first.store(u32::MAX, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let err = pool
            .acquire(&server(), Role::App, &cancel)
            .await
            .expect_err("dial fails");
        assert!(matches!(err, OpsError::DialFailed { .. }));
        assert!(pool.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn evict_closes_and_removes() {
        let (_dialer, pool) = pool();
        let cancel = CancellationToken::new();
        pool.acquire(&server(), Role::App, &cancel).await.expect("acquire");
        let key = PoolKey::for_server(&server(), Role::App);
        pool.evict(&key).await;
        assert!(pool.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn stale_entries_are_cleaned_up() {
        let dialer = Arc::new(ScriptedDialer::new());
        let pool = Pool::new(dialer, Duration::ZERO);
        let cancel = CancellationToken::new();
        pool.acquire(&server(), Role::App, &cancel).await.expect("acquire");
        pool.run_cleanup_once().await;
        assert!(pool.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn fresh_entries_survive_cleanup() {
        let (_dialer, pool) = pool();
        let cancel = CancellationToken::new();
        pool.acquire(&server(), Role::App, &cancel).await.expect("acquire");
        pool.run_cleanup_once().await;
        assert_eq!(pool.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn scheduled_evictions_drain_on_cleanup() {
        let (_dialer, pool) = pool();
        let cancel = CancellationToken::new();
        pool.acquire(&server(), Role::App, &cancel).await.expect("acquire");
        pool.schedule_evict(PoolKey::for_server(&server(), Role::App));
        pool.run_cleanup_once().await;
        assert!(pool.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_rejects_further_acquires() {
        let (_dialer, pool) = pool();
        let cancel = CancellationToken::new();
        pool.acquire(&server(), Role::App, &cancel).await.expect("acquire");
        pool.shutdown().await;
        let err = pool
            .acquire(&server(), Role::App, &cancel)
            .await
            .expect_err("closed");
        assert!(matches!(err, OpsError::PoolClosed));
        assert!(pool.snapshot().await.is_empty());
    }

    #[test]
    fn failure_counts_map_to_statuses() {
        assert_eq!(status_for_failures(0), ConnectionStatus::Healthy);
        assert_eq!(status_for_failures(1), ConnectionStatus::Degraded);
        assert_eq!(status_for_failures(2), ConnectionStatus::Degraded);
        assert_eq!(status_for_failures(3), ConnectionStatus::Unhealthy);
        assert_eq!(status_for_failures(4), ConnectionStatus::Unhealthy);
        assert_eq!(status_for_failures(5), ConnectionStatus::Failed);
        assert_eq!(status_for_failures(9), ConnectionStatus::Failed);
    }

    #[test]
    fn rolling_average_is_two_sample() {
        let transport = Transport::new(
            Box::new(super::testutil::ScriptedSession::healthy()),
            Role::App,
            "pocketbase",
            "ssh-agent",
        );
        let mut state = EntryState::new(transport);
        assert_eq!(state.rolling_avg_response, None);

        state.record_latency(Duration::from_millis(100));
        assert_eq!(state.rolling_avg_response, Some(Duration::from_millis(100)));
        state.record_latency(Duration::from_millis(300));
        assert_eq!(state.rolling_avg_response, Some(Duration::from_millis(200)));
        state.record_latency(Duration::from_millis(200));
        assert_eq!(state.rolling_avg_response, Some(Duration::from_millis(200)));
    }
}
