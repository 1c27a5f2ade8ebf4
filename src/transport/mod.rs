//! SSH transport layer: one session per pooled connection.
//!
//! A [`Transport`] owns a live SSH session for a `(server, role)` pair and
//! runs commands on it, each in its own exec channel. The session itself is
//! behind the [`RemoteSession`] trait so tests can inject scripted
//! transports; production sessions are dialed by [`SshDialer`].

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::OpsError;
use crate::server::{Role, ServerRecord};

mod auth;
mod known_hosts;
mod ssh;

pub use auth::{AuthCandidate, resolve_auth_candidates};
pub use known_hosts::{HostKeyCheck, KnownHostsStore};
pub use ssh::SshDialer;

/// Production dialer stack: russh attempts under the retry policy.
pub fn production_dialer(known_hosts: KnownHostsStore) -> RetryDialer<SshDialer> {
    RetryDialer::new(SshDialer::new(known_hosts))
}

/// Combined output of one remote command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Interleaved stdout and stderr in arrival order.
    pub output: String,
    /// Remote exit status. `-1` when the server never reported one.
    pub exit: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit == 0
    }
}

/// Caller-owned sink for streamed command output.
///
/// Lines are prefixed `[OUT] ` or `[ERR] ` by origin. Sends never block; a
/// full channel drops the line.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<String>,
}

impl OutputSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    pub fn stdout_line(&self, line: &str) {
        self.send(format!("[OUT] {line}"));
    }

    pub fn stderr_line(&self, line: &str) {
        self.send(format!("[ERR] {line}"));
    }

    fn send(&self, line: String) {
        if let Err(err) = self.tx.try_send(line) {
            log::debug!("stream line dropped: {err}");
        }
    }
}

/// A live remote shell session. Implemented by the russh-backed session and
/// by scripted fakes in tests.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a command in a fresh exec channel and capture combined output.
    ///
    /// A non-zero exit is reported in [`ExecOutput::exit`], not as `Err`;
    /// the caller decides whether that is a failure.
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, OpsError>;

    /// Run a command, forwarding output lines to `sink` until EOF on both
    /// streams. Bounded by cancellation rather than a hard timeout.
    async fn stream(
        &self,
        command: &str,
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Result<i32, OpsError>;

    /// Whether the underlying connection is still open.
    fn is_open(&self) -> bool;

    /// Close the session. Idempotent; closure is terminal.
    async fn close(&self);
}

/// Creates transports. The production implementation is [`SshDialer`]
/// wrapped in [`RetryDialer`]; tests inject their own to run procedures
/// against scripted sessions.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        server: &ServerRecord,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<Transport, OpsError>;
}

/// Retry decorator around a single-attempt dialer.
///
/// Makes up to [`config::DIAL_ATTEMPTS`] attempts with linear back-off and
/// accepts a transport only after a successful probe. Authentication and
/// host-key failures surface immediately: repeating them cannot help and
/// re-trying a mismatched key would hide an active attack.
pub struct RetryDialer<D> {
    inner: D,
}

impl<D: Dialer> RetryDialer<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<D: Dialer> Dialer for RetryDialer<D> {
    async fn dial(
        &self,
        server: &ServerRecord,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<Transport, OpsError> {
        let mut last_error = String::new();
        for attempt in 1..=config::DIAL_ATTEMPTS {
            let backoff = config::dial_backoff(attempt);
            if !backoff.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(OpsError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
                log::debug!(
                    "dial retry {attempt}/{} for {}@{}",
                    config::DIAL_ATTEMPTS,
                    role.username(server),
                    server.addr()
                );
            }

            match self.inner.dial(server, role, cancel).await {
                Ok(transport) => match transport.probe(config::PROBE_TIMEOUT, cancel).await {
                    Ok(latency) => {
                        log::debug!(
                            "transport for {} accepted, probe {}ms",
                            server.addr(),
                            latency.as_millis()
                        );
                        return Ok(transport);
                    }
                    Err(OpsError::Cancelled) => return Err(OpsError::Cancelled),
                    Err(err) => {
                        transport.close().await;
                        last_error = format!("acceptance probe failed: {err}");
                    }
                },
                Err(
                    err @ (OpsError::HostKeyMismatch { .. }
                    | OpsError::AuthFailed { .. }
                    | OpsError::AuthUnavailable(_)
                    | OpsError::InvalidServer(_)
                    | OpsError::Cancelled),
                ) => return Err(err),
                Err(err) => {
                    log::debug!("dial attempt {attempt} to {} failed: {err}", server.addr());
                    last_error = err.to_string();
                }
            }
        }

        Err(OpsError::DialFailed {
            attempts: config::DIAL_ATTEMPTS,
            reason: last_error,
        })
    }
}

/// An established SSH session plus its identity metadata.
///
/// Exclusively owned by its pool entry; callers reach it through a lease.
pub struct Transport {
    session: Box<dyn RemoteSession>,
    role: Role,
    username: String,
    auth_method: String,
    created_at: Instant,
}

impl Transport {
    pub fn new(
        session: Box<dyn RemoteSession>,
        role: Role,
        username: impl Into<String>,
        auth_method: impl Into<String>,
    ) -> Self {
        Self {
            session,
            role,
            username: username.into(),
            auth_method: auth_method.into(),
            created_at: Instant::now(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Label of the authentication method that won during dial.
    pub fn auth_method(&self) -> &str {
        &self.auth_method
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    /// Run a command; non-zero exit becomes [`OpsError::CommandFailed`]
    /// carrying the combined output.
    pub async fn run(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, OpsError> {
        let result = self.session.run(command, timeout, cancel).await?;
        if result.success() {
            Ok(result)
        } else {
            Err(OpsError::CommandFailed {
                exit: result.exit,
                output: result.output,
            })
        }
    }

    /// Run a command without treating a non-zero exit as an error.
    pub async fn run_unchecked(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, OpsError> {
        self.session.run(command, timeout, cancel).await
    }

    /// Stream a command's output to `sink`; returns the exit status.
    pub async fn stream(
        &self,
        command: &str,
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Result<i32, OpsError> {
        self.session.stream(command, sink, cancel).await
    }

    /// Round-trip the fixed echo marker. Returns the observed latency.
    ///
    /// Used by the health monitor and as the acceptance test of a freshly
    /// dialed transport.
    pub async fn probe(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Duration, OpsError> {
        let started = Instant::now();
        let out = self
            .run(&format!("echo {}", config::PROBE_MARKER), timeout, cancel)
            .await?;
        if out.output.contains(config::PROBE_MARKER) {
            Ok(started.elapsed())
        } else {
            Err(OpsError::Internal(format!(
                "probe marker missing from output: {}",
                out.output.trim()
            )))
        }
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("role", &self.role)
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .field("open", &self.is_open())
            .finish()
    }
}
