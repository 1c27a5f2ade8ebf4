//! Capability routing: which identity runs a command, and how it is wrapped.
//!
//! The routing table is a complete function of the host's security posture
//! and the requested privilege. Before lockdown, privileged work uses the
//! root account directly. After lockdown, root SSH is gone and privileged
//! work runs as the app user with a single `sudo ` prefix.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config;
use crate::error::OpsError;
use crate::server::{Role, SecurityPosture, ServerRecord};

/// Privilege level a caller requests for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    Unprivileged,
    Privileged,
}

/// A shell command to run on a managed host.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommandSpec {
    /// Command text, executed by the remote login shell.
    pub text: String,
    /// Whether the command needs root rights.
    pub requires_sudo: bool,
    /// Per-command timeout in seconds. `None` uses the 5-minute default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandSpec {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            requires_sudo: false,
            timeout_secs: None,
        }
    }

    pub fn privileged(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            requires_sudo: true,
            timeout_secs: None,
        }
    }

    pub fn privilege(&self) -> Privilege {
        if self.requires_sudo {
            Privilege::Privileged
        } else {
            Privilege::Unprivileged
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(config::COMMAND_TIMEOUT)
    }
}

/// How a command text is rewritten before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTransform {
    /// Text passes through unchanged.
    Identity,
    /// Text is prefixed with exactly one `sudo `.
    SudoPrefix,
}

impl CommandTransform {
    pub fn apply(&self, text: &str) -> String {
        match self {
            CommandTransform::Identity => text.to_string(),
            CommandTransform::SudoPrefix => format!("sudo {text}"),
        }
    }
}

/// Resolved route for one command: which role dials, how text is wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub role: Role,
    pub transform: CommandTransform,
}

/// Resolve the transport role and command transform for a request.
///
/// Validates the server record once per call; steps reuse the result.
pub fn route(server: &ServerRecord, privilege: Privilege) -> Result<Route, OpsError> {
    server.validate()?;

    let route = match (server.posture(), privilege) {
        (SecurityPosture::PreLockdown, Privilege::Unprivileged) => Route {
            role: Role::App,
            transform: CommandTransform::Identity,
        },
        (SecurityPosture::PreLockdown, Privilege::Privileged) => Route {
            role: Role::Root,
            transform: CommandTransform::Identity,
        },
        (SecurityPosture::PostLockdown, Privilege::Unprivileged) => Route {
            role: Role::App,
            transform: CommandTransform::Identity,
        },
        (SecurityPosture::PostLockdown, Privilege::Privileged) => Route {
            role: Role::App,
            transform: CommandTransform::SudoPrefix,
        },
    };
    Ok(route)
}

/// Guard for callers that request a role directly, bypassing [`route`].
///
/// A locked host no longer accepts root logins; reject before dialing.
pub fn ensure_role_allowed(server: &ServerRecord, role: Role) -> Result<(), OpsError> {
    server.validate()?;
    if role == Role::Root && server.security_locked {
        return Err(OpsError::RootDisabled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(locked: bool) -> ServerRecord {
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

    #[test]
    fn unlocked_privileged_uses_root_unchanged() {
        let r = route(&server(false), Privilege::Privileged).expect("route");
        assert_eq!(r.role, Role::Root);
        assert_eq!(r.transform.apply("systemctl restart nginx"), "systemctl restart nginx");
    }

    #[test]
    fn unlocked_unprivileged_uses_app_unchanged() {
        let r = route(&server(false), Privilege::Unprivileged).expect("route");
        assert_eq!(r.role, Role::App);
        assert_eq!(r.transform, CommandTransform::Identity);
    }

    #[test]
    fn locked_privileged_uses_app_with_single_sudo() {
        let r = route(&server(true), Privilege::Privileged).expect("route");
        assert_eq!(r.role, Role::App);
        let wrapped = r.transform.apply("systemctl restart nginx");
        assert_eq!(wrapped, "sudo systemctl restart nginx");
        assert_eq!(wrapped.matches("sudo ").count(), 1);
    }

    #[test]
    fn locked_unprivileged_uses_app_unchanged() {
        let r = route(&server(true), Privilege::Unprivileged).expect("route");
        assert_eq!(r.role, Role::App);
        assert_eq!(r.transform, CommandTransform::Identity);
    }

    #[test]
    fn direct_root_request_on_locked_host_is_rejected() {
        let err = ensure_role_allowed(&server(true), Role::Root).expect_err("must reject");
        assert!(matches!(err, OpsError::RootDisabled));
        assert_eq!(
            err.to_string(),
            "Root SSH access disabled by security lockdown"
        );
    }

    #[test]
    fn direct_app_request_on_locked_host_is_allowed() {
        assert!(ensure_role_allowed(&server(true), Role::App).is_ok());
    }

    #[test]
    fn invalid_server_is_rejected_before_routing() {
        let mut bad = server(false);
        bad.host = String::new();
        assert!(matches!(
            route(&bad, Privilege::Privileged),
            Err(OpsError::InvalidServer(_))
        ));
    }

    #[test]
    fn command_spec_timeout_defaults_to_soft_bound() {
        let cmd = CommandSpec::new("ls");
        assert_eq!(cmd.timeout(), config::COMMAND_TIMEOUT);
        let cmd = CommandSpec {
            timeout_secs: Some(30),
            ..CommandSpec::new("ls")
        };
        assert_eq!(cmd.timeout(), Duration::from_secs(30));
    }
}
