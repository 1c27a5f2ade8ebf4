//! Scripted transports for driving the core without a network.
//!
//! `ScriptDialer` mints sessions that answer commands from an ordered rule
//! table and append everything they execute to a shared log, tagged with
//! the username the transport was dialed as.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use pbfleet::error::OpsError;
use pbfleet::server::{Role, ServerRecord};
use pbfleet::transport::{Dialer, ExecOutput, OutputSink, RemoteSession, Transport};

/// One canned response: first rule whose `contains` matches wins.
#[derive(Clone)]
pub struct Rule {
    pub contains: String,
    pub output: String,
    pub exit: i32,
}

impl Rule {
    pub fn new(contains: &str, output: &str, exit: i32) -> Self {
        Self {
            contains: contains.to_string(),
            output: output.to_string(),
            exit,
        }
    }
}

#[derive(Default)]
pub struct Script {
    rules: Mutex<Vec<Rule>>,
}

impl Script {
    pub fn add(&self, contains: &str, output: &str, exit: i32) {
        self.rules
            .lock()
            .expect("rules lock")
            .push(Rule::new(contains, output, exit));
    }

    fn answer(&self, command: &str) -> ExecOutput {
        if let Some(marker) = command.strip_prefix("echo ") {
            return ExecOutput {
                output: format!("{marker}\n"),
                exit: 0,
            };
        }
        let rules = self.rules.lock().expect("rules lock");
        for rule in rules.iter() {
            if command.contains(&rule.contains) {
                return ExecOutput {
                    output: rule.output.clone(),
                    exit: rule.exit,
                };
            }
        }
        ExecOutput {
            output: "ok\n".to_string(),
            exit: 0,
        }
    }
}

pub struct ScriptSession {
    username: String,
    script: Arc<Script>,
    log: Arc<Mutex<Vec<String>>>,
    open: AtomicBool,
}

#[async_trait]
impl RemoteSession for ScriptSession {
    async fn run(
        &self,
        command: &str,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, OpsError> {
        if cancel.is_cancelled() {
            return Err(OpsError::Cancelled);
        }
        self.log
            .lock()
            .expect("log lock")
            .push(format!("{}: {command}", self.username));
        Ok(self.script.answer(command))
    }

    async fn stream(
        &self,
        command: &str,
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Result<i32, OpsError> {
        let answer = self.run(command, Duration::from_secs(1), cancel).await?;
        for line in answer.output.lines() {
            sink.stdout_line(line);
        }
        Ok(answer.exit)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Dialer minting scripted sessions, with optional queued dial failures.
pub struct ScriptDialer {
    pub script: Arc<Script>,
    pub log: Arc<Mutex<Vec<String>>>,
    pub dials: AtomicU32,
    failures: Mutex<VecDeque<OpsError>>,
}

impl ScriptDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(Script::default()),
            log: Arc::new(Mutex::new(Vec::new())),
            dials: AtomicU32::new(0),
            failures: Mutex::new(VecDeque::new()),
        })
    }

    /// Queue an error returned by the next dial attempt(s), in order.
    pub fn push_failure(&self, err: OpsError) {
        self.failures.lock().expect("failures lock").push_back(err);
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().expect("log lock").clone()
    }

    pub fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for ScriptDialer {
    async fn dial(
        &self,
        server: &ServerRecord,
        role: Role,
        _cancel: &CancellationToken,
    ) -> Result<Transport, OpsError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(err);
        }
        let username = role.username(server).to_string();
        let session = ScriptSession {
            username: username.clone(),
            script: self.script.clone(),
            log: self.log.clone(),
            open: AtomicBool::new(true),
        };
        Ok(Transport::new(Box::new(session), role, username, "ssh-agent"))
    }
}

pub fn server(locked: bool) -> ServerRecord {
    ServerRecord {
        id: "s1".to_string(),
        host: "10.0.0.5".to_string(),
        port: 22,
        root_username: "root".to_string(),
        app_username: "pocketbase".to_string(),
        security_locked: locked,
        use_ssh_agent: false,
        manual_key_path: None,
    }
}

pub fn test_settings() -> pbfleet::CoreSettings {
    pbfleet::CoreSettings {
        known_hosts_path: Some(std::env::temp_dir().join("pbfleet-it-known-hosts")),
        monitor_tick: Duration::from_secs(3600),
        cleanup_tick: Duration::from_secs(3600),
        stale_after: Duration::from_secs(3600),
        probe_timeout: Duration::from_secs(5),
        service_verify_delay: Duration::from_millis(5),
    }
}
