//! russh-backed sessions and the production dialer.
//!
//! Each command runs in its own exec channel on a shared session handle.
//! Host keys are checked against the [`KnownHostsStore`] during the
//! handshake; a mismatch aborts the connection before authentication.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use russh::client::{self, AuthResult};
use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use russh::{ChannelMsg, Disconnect};

use crate::config;
use crate::error::OpsError;
use crate::server::{Role, ServerRecord};

use super::known_hosts::KnownHostsStore;
use super::{AuthCandidate, ExecOutput, OutputSink, RemoteSession, Transport, resolve_auth_candidates};

/// Handshake-time host key verification against the store.
struct HostKeyHandler {
    store: KnownHostsStore,
    host: String,
    port: u16,
}

impl client::Handler for HostKeyHandler {
    type Error = OpsError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.store
            .verify_and_record(&self.host, self.port, server_public_key)?;
        Ok(true)
    }
}

/// A live russh session running commands over per-command exec channels.
pub struct SshSession {
    handle: client::Handle<HostKeyHandler>,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(
        &self,
        command: &str,
        soft_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, OpsError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut output = Vec::new();
        let mut exit: Option<i32> = None;

        let waited = timeout(soft_timeout, async {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(OpsError::Cancelled),
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { ref data }) => {
                            output.extend_from_slice(data);
                        }
                        Some(ChannelMsg::ExtendedData { ref data, ext }) if ext == 1 => {
                            output.extend_from_slice(data);
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            exit = Some(exit_status as i32);
                        }
                        Some(ChannelMsg::Eof) => {
                            if exit.is_some() {
                                return Ok(());
                            }
                        }
                        Some(ChannelMsg::Close) | None => return Ok(()),
                        Some(_) => {}
                    }
                }
            }
        })
        .await;

        let _ = channel.close().await;

        match waited {
            Ok(Ok(())) => Ok(ExecOutput {
                output: String::from_utf8_lossy(&output).into_owned(),
                exit: exit.unwrap_or(-1),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                log::warn!(
                    "command exceeded {}s soft bound, returning partial output",
                    soft_timeout.as_secs()
                );
                Ok(ExecOutput {
                    output: String::from_utf8_lossy(&output).into_owned(),
                    exit: -1,
                })
            }
        }
    }

    async fn stream(
        &self,
        command: &str,
        sink: &OutputSink,
        cancel: &CancellationToken,
    ) -> Result<i32, OpsError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut out_buf = String::new();
        let mut err_buf = String::new();
        let mut exit: Option<i32> = None;

        let result: Result<(), OpsError> = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(OpsError::Cancelled),
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        out_buf.push_str(&String::from_utf8_lossy(data));
                        drain_lines(&mut out_buf, |line| sink.stdout_line(line));
                    }
                    Some(ChannelMsg::ExtendedData { ref data, ext }) if ext == 1 => {
                        err_buf.push_str(&String::from_utf8_lossy(data));
                        drain_lines(&mut err_buf, |line| sink.stderr_line(line));
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit = Some(exit_status as i32);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break Ok(()),
                    Some(_) => {}
                }
            }
        };

        let _ = channel.close().await;
        result?;

        if !out_buf.trim_end().is_empty() {
            sink.stdout_line(out_buf.trim_end_matches(['\r', '\n']));
        }
        if !err_buf.trim_end().is_empty() {
            sink.stderr_line(err_buf.trim_end_matches(['\r', '\n']));
        }
        Ok(exit.unwrap_or(-1))
    }

    fn is_open(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn close(&self) {
        if self.handle.is_closed() {
            return;
        }
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// Split complete lines out of `buf`, passing each to `emit`.
fn drain_lines(buf: &mut String, mut emit: impl FnMut(&str)) {
    while let Some(pos) = buf.find('\n') {
        let line: String = buf.drain(..=pos).collect();
        emit(line.trim_end_matches(['\r', '\n']));
    }
}

/// Single-attempt production dialer: resolves auth up-front, verifies the
/// host key during the handshake, authenticates and hands back a transport.
/// Retry and probe acceptance live in [`super::RetryDialer`].
pub struct SshDialer {
    known_hosts: KnownHostsStore,
}

impl SshDialer {
    pub fn new(known_hosts: KnownHostsStore) -> Self {
        Self { known_hosts }
    }

    async fn try_dial(
        &self,
        server: &ServerRecord,
        role: Role,
        candidates: &[AuthCandidate],
    ) -> Result<Transport, OpsError> {
        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(config::KEEPALIVE_INTERVAL),
            keepalive_max: 3,
            ..Default::default()
        });
        let handler = HostKeyHandler {
            store: self.known_hosts.clone(),
            host: server.host.clone(),
            port: server.port,
        };

        let username = role.username(server).to_string();
        let connect = client::connect(ssh_config, (server.host.as_str(), server.port), handler);
        let mut handle = timeout(config::CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| {
                OpsError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", server.addr()),
                ))
            })??;

        let mut attempted = false;
        for candidate in candidates {
            let accepted = match candidate {
                AuthCandidate::Agent => {
                    authenticate_via_agent(&mut handle, &username).await
                }
                AuthCandidate::KeyFile(path) => {
                    let key = match load_secret_key(path, None) {
                        Ok(key) => key,
                        Err(err) => {
                            log::warn!("skipping unreadable key {}: {err}", path.display());
                            continue;
                        }
                    };
                    let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
                    match handle
                        .authenticate_publickey(
                            &username,
                            PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                        )
                        .await
                    {
                        Ok(result) => result.success(),
                        Err(err) => {
                            log::debug!("key auth error for {}: {err}", path.display());
                            false
                        }
                    }
                }
            };
            attempted = true;

            if accepted {
                log::debug!(
                    "{}@{} authenticated via {}",
                    username,
                    server.addr(),
                    candidate.label()
                );
                return Ok(Transport::new(
                    Box::new(SshSession { handle }),
                    role,
                    username,
                    candidate.label(),
                ));
            }
        }

        if attempted {
            Err(OpsError::AuthFailed {
                username,
                host: server.host.clone(),
            })
        } else {
            Err(OpsError::AuthUnavailable(format!(
                "no usable credentials for {}@{}",
                username,
                server.addr()
            )))
        }
    }
}

async fn authenticate_via_agent(
    handle: &mut client::Handle<HostKeyHandler>,
    username: &str,
) -> bool {
    let mut agent = match AgentClient::connect_env().await {
        Ok(agent) => agent,
        Err(err) => {
            log::warn!("ssh-agent unreachable: {err}");
            return false;
        }
    };
    let identities = match agent.request_identities().await {
        Ok(identities) => identities,
        Err(err) => {
            log::warn!("ssh-agent identity listing failed: {err}");
            return false;
        }
    };
    for identity in identities {
        let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
        match handle
            .authenticate_publickey_with(username, identity, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return true,
            Ok(AuthResult::Failure { .. }) => continue,
            Ok(_) => continue,
            Err(err) => {
                log::debug!("agent identity rejected: {err}");
                continue;
            }
        }
    }
    false
}

#[async_trait]
impl super::Dialer for SshDialer {
    async fn dial(
        &self,
        server: &ServerRecord,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<Transport, OpsError> {
        server.validate()?;
        // Fail before connecting when nothing could possibly authenticate.
        let candidates = resolve_auth_candidates(server)?;

        tokio::select! {
            _ = cancel.cancelled() => Err(OpsError::Cancelled),
            dialed = self.try_dial(server, role, &candidates) => dialed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_lines_handles_partial_chunks() {
        let mut buf = String::from("one\ntwo\npart");
        let mut seen = Vec::new();
        drain_lines(&mut buf, |line| seen.push(line.to_string()));
        assert_eq!(seen, vec!["one", "two"]);
        assert_eq!(buf, "part");
    }

    #[test]
    fn drain_lines_strips_carriage_returns() {
        let mut buf = String::from("crlf\r\n");
        let mut seen = Vec::new();
        drain_lines(&mut buf, |line| seen.push(line.to_string()));
        assert_eq!(seen, vec!["crlf"]);
        assert!(buf.is_empty());
    }
}
