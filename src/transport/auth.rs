//! Authentication method resolution for outbound SSH dials.
//!
//! Candidates are gathered in priority order before any connection is made:
//! the local SSH agent (when the record opts in and `SSH_AUTH_SOCK` is set),
//! an explicit key path from the record, then the conventional key files
//! under `~/.ssh`. A dial with no viable candidate fails up-front with
//! [`OpsError::AuthUnavailable`] instead of surfacing a confusing rejection
//! from the remote.

use std::path::{Path, PathBuf};

use crate::config;
use crate::error::OpsError;
use crate::server::ServerRecord;

/// One viable way to authenticate, in resolution priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCandidate {
    /// The local SSH agent at `SSH_AUTH_SOCK`.
    Agent,
    /// A private key file on disk.
    KeyFile(PathBuf),
}

impl AuthCandidate {
    /// Short label used in connection reports and diagnostics.
    pub fn label(&self) -> String {
        match self {
            AuthCandidate::Agent => "ssh-agent".to_string(),
            AuthCandidate::KeyFile(path) => format!("key:{}", path.display()),
        }
    }
}

/// Resolve the authentication candidates for a server.
///
/// Errors with [`OpsError::AuthUnavailable`] when nothing is viable.
pub fn resolve_auth_candidates(server: &ServerRecord) -> Result<Vec<AuthCandidate>, OpsError> {
    let home = dirs::home_dir();
    let agent_available = std::env::var_os("SSH_AUTH_SOCK").is_some();
    resolve_in(server, home.as_deref(), agent_available)
}

fn resolve_in(
    server: &ServerRecord,
    home: Option<&Path>,
    agent_available: bool,
) -> Result<Vec<AuthCandidate>, OpsError> {
    let mut candidates = Vec::new();

    if server.use_ssh_agent {
        if agent_available {
            candidates.push(AuthCandidate::Agent);
        } else {
            log::debug!(
                "server {} requests ssh-agent but SSH_AUTH_SOCK is not set",
                server.id
            );
        }
    }

    if let Some(path) = &server.manual_key_path {
        if path.is_file() {
            candidates.push(AuthCandidate::KeyFile(path.clone()));
        } else {
            log::warn!(
                "configured key {} for server {} does not exist",
                path.display(),
                server.id
            );
        }
    }

    if let Some(home) = home {
        let ssh_dir = home.join(".ssh");
        for name in config::DEFAULT_KEY_NAMES {
            let path = ssh_dir.join(name);
            if path.is_file() && !candidates.contains(&AuthCandidate::KeyFile(path.clone())) {
                candidates.push(AuthCandidate::KeyFile(path));
            }
        }
    }

    if candidates.is_empty() {
        return Err(OpsError::AuthUnavailable(format!(
            "no agent socket, configured key or default key found for {}",
            server.host
        )));
    }
    Ok(candidates)
}
