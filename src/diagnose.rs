//! Read-only connectivity diagnostics.
//!
//! Runs a fixed sequence of checks against one server and returns a result
//! list; individual check failures become `warning`/`error` entries, never
//! an `Err`. Fatal early checks (TCP unreachable) short-circuit the
//! dependent remote checks, while purely local checks always run.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use russh::client;
use russh::keys::PublicKey;

use crate::config;
use crate::pool::Pool;
use crate::router;
use crate::server::{Role, ServerRecord};
use crate::transport::{KnownHostsStore, resolve_auth_candidates};

/// Severity of one diagnostic check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Success,
    Warning,
    Error,
    Info,
}

/// One diagnostic finding.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CheckResult {
    pub step: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
    pub duration_ms: u64,
}

impl CheckResult {
    fn new(step: &str, status: CheckStatus, message: impl Into<String>, started: Instant) -> Self {
        Self {
            step: step.to_string(),
            status,
            message: message.into(),
            details: None,
            suggestion: None,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    fn fatal(&self) -> bool {
        self.status == CheckStatus::Error
    }
}

const PROBE_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Pre-lockdown connectivity inspection.
pub(crate) async fn run_diagnostics(
    pool: &Pool,
    known_hosts: &KnownHostsStore,
    server: &ServerRecord,
    role: Role,
    cancel: &CancellationToken,
) -> Vec<CheckResult> {
    let mut results = Vec::new();

    let tcp = check_tcp_reach(server).await;
    let tcp_ok = !tcp.fatal();
    results.push(tcp);

    if tcp_ok {
        let banner = check_ssh_banner(server).await;
        let banner_ok = !banner.fatal();
        results.push(banner);

        if banner_ok {
            results.push(check_protocol_negotiation(server).await);
            results.push(check_pool_connect(pool, server, role, cancel).await);
        }
    }

    results.push(check_auth_survey(server));
    results.push(check_agent_status().await);
    results.push(check_key_files(server));
    results.push(check_known_hosts(known_hosts, server));
    results.push(check_ssh_client_config());
    results.push(check_ssh_dir_mode());

    results
}

/// Post-lockdown additions: the app user's sudo path, its authorized keys,
/// the application tree and the critical sshd directives.
pub(crate) async fn run_post_lockdown_checks(
    pool: &Pool,
    server: &ServerRecord,
    cancel: &CancellationToken,
) -> Vec<CheckResult> {
    let mut results = Vec::new();

    let started = Instant::now();
    let lease = match pool.acquire(server, Role::App, cancel).await {
        Ok(lease) => lease,
        Err(err) => {
            results.push(
                CheckResult::new(
                    "app_user_connect",
                    CheckStatus::Error,
                    format!("cannot connect as {}: {err}", server.app_username),
                    started,
                )
                .with_suggestion("run the connection diagnostics for the app role"),
            );
            return results;
        }
    };
    results.push(CheckResult::new(
        "app_user_connect",
        CheckStatus::Success,
        format!("connected as {}", server.app_username),
        started,
    ));

    let started = Instant::now();
    match lease
        .run("sudo -n whoami", config::COMMAND_TIMEOUT, cancel)
        .await
    {
        Ok(out) if out.output.contains("root") => results.push(CheckResult::new(
            "app_user_sudo",
            CheckStatus::Success,
            "sudo -n escalates to root",
            started,
        )),
        Ok(out) => results.push(
            CheckResult::new(
                "app_user_sudo",
                CheckStatus::Error,
                format!("sudo -n yielded '{}' instead of root", out.output.trim()),
                started,
            )
            .with_suggestion("check the sudoers drop-in for the app user"),
        ),
        Err(err) => results.push(
            CheckResult::new(
                "app_user_sudo",
                CheckStatus::Error,
                format!("sudo -n failed: {err}"),
                started,
            )
            .with_suggestion("re-run server setup to restore the sudoers drop-in"),
        ),
    }

    let started = Instant::now();
    let authorized = format!("/home/{}/.ssh/authorized_keys", server.app_username);
    match lease
        .run_unchecked(&format!("test -s {authorized}"), config::COMMAND_TIMEOUT, cancel)
        .await
    {
        Ok(out) if out.success() => results.push(CheckResult::new(
            "authorized_keys",
            CheckStatus::Success,
            format!("{authorized} present and non-empty"),
            started,
        )),
        Ok(_) => results.push(
            CheckResult::new(
                "authorized_keys",
                CheckStatus::Error,
                format!("{authorized} is missing or empty"),
                started,
            )
            .with_suggestion("re-run server setup to install the app user's keys"),
        ),
        Err(err) => results.push(CheckResult::new(
            "authorized_keys",
            CheckStatus::Error,
            format!("cannot stat {authorized}: {err}"),
            started,
        )),
    }

    let started = Instant::now();
    match lease
        .run_unchecked("stat /opt/pocketbase", config::COMMAND_TIMEOUT, cancel)
        .await
    {
        Ok(out) if out.success() => results.push(CheckResult::new(
            "application_tree",
            CheckStatus::Success,
            "/opt/pocketbase is accessible",
            started,
        )),
        Ok(out) => results.push(
            CheckResult::new(
                "application_tree",
                CheckStatus::Error,
                "/opt/pocketbase is not accessible",
                started,
            )
            .with_details(out.output),
        ),
        Err(err) => results.push(CheckResult::new(
            "application_tree",
            CheckStatus::Error,
            format!("stat failed: {err}"),
            started,
        )),
    }

    let started = Instant::now();
    match lease
        .run_unchecked(
            "sudo -n grep -E '^(PermitRootLogin|PasswordAuthentication) ' /etc/ssh/sshd_config",
            config::COMMAND_TIMEOUT,
            cancel,
        )
        .await
    {
        Ok(out)
            if out.output.contains("PermitRootLogin no")
                && out.output.contains("PasswordAuthentication no") =>
        {
            results.push(CheckResult::new(
                "sshd_directives",
                CheckStatus::Success,
                "critical sshd directives in place",
                started,
            ))
        }
        Ok(out) => results.push(
            CheckResult::new(
                "sshd_directives",
                CheckStatus::Warning,
                "critical sshd directives missing or changed",
                started,
            )
            .with_details(out.output)
            .with_suggestion("re-run the security lockdown"),
        ),
        Err(err) => results.push(CheckResult::new(
            "sshd_directives",
            CheckStatus::Warning,
            format!("cannot read sshd_config: {err}"),
            started,
        )),
    }

    results
}

async fn check_tcp_reach(server: &ServerRecord) -> CheckResult {
    let started = Instant::now();
    match timeout(PROBE_IO_TIMEOUT, TcpStream::connect((server.host.as_str(), server.port))).await {
        Ok(Ok(_stream)) => CheckResult::new(
            "tcp_reachability",
            CheckStatus::Success,
            format!("{} accepts TCP connections", server.addr()),
            started,
        ),
        Ok(Err(err)) => CheckResult::new(
            "tcp_reachability",
            CheckStatus::Error,
            format!("cannot reach {}: {err}", server.addr()),
            started,
        )
        .with_suggestion("check the host address, firewall rules and that sshd is listening"),
        Err(_) => CheckResult::new(
            "tcp_reachability",
            CheckStatus::Error,
            format!("connection to {} timed out", server.addr()),
            started,
        )
        .with_suggestion("check network routes and firewall rules"),
    }
}

async fn check_ssh_banner(server: &ServerRecord) -> CheckResult {
    let started = Instant::now();
    let read_banner = async {
        let mut stream = TcpStream::connect((server.host.as_str(), server.port)).await?;
        let mut buf = [0u8; 255];
        let n = stream.read(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf[..n]).into_owned())
    };
    match timeout(PROBE_IO_TIMEOUT, read_banner).await {
        Ok(Ok(banner)) if banner.starts_with("SSH-") => CheckResult::new(
            "ssh_banner",
            CheckStatus::Success,
            "SSH service identified",
            started,
        )
        .with_details(banner.lines().next().unwrap_or_default().to_string()),
        Ok(Ok(banner)) => CheckResult::new(
            "ssh_banner",
            CheckStatus::Error,
            "service did not present an SSH banner",
            started,
        )
        .with_details(banner)
        .with_suggestion("confirm sshd, not another service, listens on this port"),
        Ok(Err(err)) => CheckResult::new(
            "ssh_banner",
            CheckStatus::Error,
            format!("banner read failed: {err}"),
            started,
        ),
        Err(_) => CheckResult::new(
            "ssh_banner",
            CheckStatus::Error,
            "banner read timed out",
            started,
        ),
    }
}

/// Accepts any host key; used only for the auth-agnostic handshake check.
struct NegotiationProbe;

impl client::Handler for NegotiationProbe {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn check_protocol_negotiation(server: &ServerRecord) -> CheckResult {
    let started = Instant::now();
    let ssh_config = Arc::new(client::Config::default());
    let connect = client::connect(
        ssh_config,
        (server.host.as_str(), server.port),
        NegotiationProbe,
    );
    match timeout(config::CONNECT_TIMEOUT, connect).await {
        Ok(Ok(_handle)) => CheckResult::new(
            "protocol_negotiation",
            CheckStatus::Success,
            "SSH handshake and algorithm negotiation succeeded",
            started,
        ),
        Ok(Err(err)) => CheckResult::new(
            "protocol_negotiation",
            CheckStatus::Error,
            format!("handshake failed: {err}"),
            started,
        )
        .with_suggestion("the server may require algorithms this client does not offer"),
        Err(_) => CheckResult::new(
            "protocol_negotiation",
            CheckStatus::Error,
            "handshake timed out",
            started,
        ),
    }
}

async fn check_pool_connect(
    pool: &Pool,
    server: &ServerRecord,
    role: Role,
    cancel: &CancellationToken,
) -> CheckResult {
    let started = Instant::now();
    if let Err(err) = router::ensure_role_allowed(server, role) {
        return CheckResult::new(
            "authenticated_connect",
            CheckStatus::Error,
            err.to_string(),
            started,
        )
        .with_suggestion("use the app role on security-locked hosts");
    }
    match pool.acquire(server, role, cancel).await {
        Ok(lease) => CheckResult::new(
            "authenticated_connect",
            CheckStatus::Success,
            format!(
                "authenticated as {} via {}",
                lease.username(),
                lease.auth_method()
            ),
            started,
        ),
        Err(err) => CheckResult::new(
            "authenticated_connect",
            CheckStatus::Error,
            format!("authenticated connect failed: {err}"),
            started,
        )
        .with_suggestion("inspect the authentication checks below"),
    }
}

fn check_auth_survey(server: &ServerRecord) -> CheckResult {
    let started = Instant::now();
    match resolve_auth_candidates(server) {
        Ok(candidates) => {
            let labels: Vec<String> = candidates.iter().map(|c| c.label()).collect();
            CheckResult::new(
                "auth_methods",
                CheckStatus::Info,
                format!("{} authentication candidate(s)", labels.len()),
                started,
            )
            .with_details(labels.join(", "))
        }
        Err(err) => CheckResult::new(
            "auth_methods",
            CheckStatus::Error,
            err.to_string(),
            started,
        )
        .with_suggestion("load a key into the agent or configure a key path for this server"),
    }
}

async fn check_agent_status() -> CheckResult {
    use russh::keys::agent::client::AgentClient;

    let started = Instant::now();
    if std::env::var_os("SSH_AUTH_SOCK").is_none() {
        return CheckResult::new(
            "ssh_agent",
            CheckStatus::Warning,
            "SSH_AUTH_SOCK is not set; no agent available",
            started,
        )
        .with_suggestion("start ssh-agent and add the deployment key");
    }
    match AgentClient::connect_env().await {
        Ok(mut agent) => match agent.request_identities().await {
            Ok(identities) if identities.is_empty() => CheckResult::new(
                "ssh_agent",
                CheckStatus::Warning,
                "agent is running but holds no keys",
                started,
            )
            .with_suggestion("ssh-add the deployment key"),
            Ok(identities) => CheckResult::new(
                "ssh_agent",
                CheckStatus::Success,
                format!("agent holds {} key(s)", identities.len()),
                started,
            ),
            Err(err) => CheckResult::new(
                "ssh_agent",
                CheckStatus::Warning,
                format!("agent did not list identities: {err}"),
                started,
            ),
        },
        Err(err) => CheckResult::new(
            "ssh_agent",
            CheckStatus::Warning,
            format!("cannot reach agent: {err}"),
            started,
        ),
    }
}

fn check_key_files(server: &ServerRecord) -> CheckResult {
    let started = Instant::now();
    let mut found = Vec::new();
    let mut loose_modes = Vec::new();

    let mut paths = Vec::new();
    if let Some(manual) = &server.manual_key_path {
        paths.push(manual.clone());
    }
    if let Some(home) = dirs::home_dir() {
        for name in config::DEFAULT_KEY_NAMES {
            paths.push(home.join(".ssh").join(name));
        }
    }

    for path in paths {
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        let mode = meta.permissions().mode() & 0o777;
        found.push(format!("{} ({mode:o})", path.display()));
        if mode & 0o077 != 0 {
            loose_modes.push(path.display().to_string());
        }
    }

    if found.is_empty() {
        CheckResult::new(
            "private_keys",
            CheckStatus::Warning,
            "no private key files found",
            started,
        )
        .with_suggestion("provision a key or rely on the SSH agent")
    } else if loose_modes.is_empty() {
        CheckResult::new(
            "private_keys",
            CheckStatus::Success,
            format!("{} key file(s) with restrictive modes", found.len()),
            started,
        )
        .with_details(found.join(", "))
    } else {
        CheckResult::new(
            "private_keys",
            CheckStatus::Warning,
            format!("key files readable by group/others: {}", loose_modes.join(", ")),
            started,
        )
        .with_suggestion("chmod 600 the affected key files")
    }
}

fn check_known_hosts(store: &KnownHostsStore, server: &ServerRecord) -> CheckResult {
    let started = Instant::now();
    if store.contains_host(&server.host, server.port) {
        CheckResult::new(
            "known_hosts",
            CheckStatus::Success,
            format!("{} has a recorded host key", server.addr()),
            started,
        )
    } else {
        CheckResult::new(
            "known_hosts",
            CheckStatus::Info,
            format!("{} not yet recorded; first connect will store its key", server.addr()),
            started,
        )
    }
}

fn check_ssh_client_config() -> CheckResult {
    let started = Instant::now();
    let Some(home) = dirs::home_dir() else {
        return CheckResult::new(
            "ssh_client_config",
            CheckStatus::Warning,
            "cannot resolve home directory",
            started,
        );
    };
    let path = home.join(".ssh").join("config");
    if path.is_file() {
        CheckResult::new(
            "ssh_client_config",
            CheckStatus::Info,
            format!("{} present (not consulted by this tool)", path.display()),
            started,
        )
    } else {
        CheckResult::new(
            "ssh_client_config",
            CheckStatus::Info,
            "no SSH client config",
            started,
        )
    }
}

fn check_ssh_dir_mode() -> CheckResult {
    let started = Instant::now();
    let Some(home) = dirs::home_dir() else {
        return CheckResult::new(
            "ssh_dir_mode",
            CheckStatus::Warning,
            "cannot resolve home directory",
            started,
        );
    };
    let dir = home.join(".ssh");
    match std::fs::metadata(&dir) {
        Ok(meta) => {
            let mode = meta.permissions().mode() & 0o777;
            if mode & 0o077 == 0 {
                CheckResult::new(
                    "ssh_dir_mode",
                    CheckStatus::Success,
                    format!("{} mode {mode:o}", dir.display()),
                    started,
                )
            } else {
                CheckResult::new(
                    "ssh_dir_mode",
                    CheckStatus::Warning,
                    format!("{} mode {mode:o} is too permissive", dir.display()),
                    started,
                )
                .with_suggestion("chmod 700 ~/.ssh")
            }
        }
        Err(_) => CheckResult::new(
            "ssh_dir_mode",
            CheckStatus::Info,
            format!("{} does not exist", dir.display()),
            started,
        ),
    }
}
