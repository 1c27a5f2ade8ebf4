//! Server records, remote roles and security posture.
//!
//! A [`ServerRecord`] is owned by the external control plane; this core only
//! reads it. The record is validated once per façade call, not per step.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::OpsError;

/// Which remote identity an operation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The root account. Only reachable before security lockdown.
    Root,
    /// The unprivileged application account.
    App,
}

impl Role {
    /// Username this role maps to on the given server.
    pub fn username<'a>(&self, server: &'a ServerRecord) -> &'a str {
        match self {
            Role::Root => &server.root_username,
            Role::App => &server.app_username,
        }
    }

    /// Stable lowercase name used in pool keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::App => "app",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the host still allows direct root SSH login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityPosture {
    /// Root SSH enabled; privileged work runs as root directly.
    PreLockdown,
    /// Root SSH disabled; privileged work runs as the app user via `sudo`.
    PostLockdown,
}

/// A managed host as recorded by the control plane.
///
/// Read-only to this core. The lockdown procedure never flips
/// `security_locked` itself; the caller updates the record after a
/// successful run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ServerRecord {
    /// Opaque identifier assigned by the control plane.
    pub id: String,
    /// Hostname or address used for SSH.
    pub host: String,
    /// SSH port, 1-65535.
    pub port: u16,
    /// Account used for pre-lockdown privileged operations.
    pub root_username: String,
    /// Unprivileged application account.
    pub app_username: String,
    /// True once the host has been security-locked (root SSH disabled).
    pub security_locked: bool,
    /// Prefer the local SSH agent when authenticating.
    pub use_ssh_agent: bool,
    /// Explicit private key path overriding the default key search.
    #[serde(default)]
    pub manual_key_path: Option<PathBuf>,
}

impl ServerRecord {
    /// Validate the invariants the rest of the core relies on.
    pub fn validate(&self) -> Result<(), OpsError> {
        if self.host.trim().is_empty() {
            return Err(OpsError::InvalidServer("host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(OpsError::InvalidServer("port must be 1-65535".to_string()));
        }
        if self.root_username.trim().is_empty() {
            return Err(OpsError::InvalidServer("root username is empty".to_string()));
        }
        if self.app_username.trim().is_empty() {
            return Err(OpsError::InvalidServer("app username is empty".to_string()));
        }
        Ok(())
    }

    /// Security posture derived strictly from `security_locked`.
    pub fn posture(&self) -> SecurityPosture {
        if self.security_locked {
            SecurityPosture::PostLockdown
        } else {
            SecurityPosture::PreLockdown
        }
    }

    /// `host:port` form used in logs and known-hosts entries.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
