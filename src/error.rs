//! Error taxonomy for remote-host operations.
//!
//! Every externally visible failure is one of these variants. Procedure
//! failures wrap the underlying cause together with the step that raised it,
//! so callers can attribute an error to a stage without parsing messages.

use thiserror::Error;

/// Errors surfaced by the pool, transports, router and procedures.
#[derive(Error, Debug)]
pub enum OpsError {
    /// The server record failed validation. Caller bug, never retried.
    #[error("invalid server record: {0}")]
    InvalidServer(String),

    /// No viable authentication method was found before connecting.
    #[error("no SSH authentication method available: {0}")]
    AuthUnavailable(String),

    /// TCP connect or SSH handshake failed after all dial attempts.
    #[error("SSH dial failed after {attempts} attempts: {reason}")]
    DialFailed { attempts: u32, reason: String },

    /// The recorded host key differs from the one the server presented.
    #[error("host key mismatch for {host}: recorded key differs from presented {fingerprint}")]
    HostKeyMismatch { host: String, fingerprint: String },

    /// The remote rejected our credentials.
    #[error("SSH authentication rejected for {username}@{host}")]
    AuthFailed { username: String, host: String },

    /// A remote command exited non-zero.
    #[error("command failed with exit {exit}: {output}")]
    CommandFailed { exit: i32, output: String },

    /// A root-role transport was requested on a security-locked host.
    #[error("Root SSH access disabled by security lockdown")]
    RootDisabled,

    /// A started or restarted service did not report `active`.
    #[error("service {service} failed to start: {state}")]
    ServiceFailedToStart { service: String, state: String },

    /// Rollback was requested but the backup directory is missing.
    #[error("rollback unavailable: no backup at {backup_dir}")]
    RollbackUnavailable { backup_dir: String },

    /// The caller's cancellation token tripped.
    #[error("operation cancelled")]
    Cancelled,

    /// The façade was called after shutdown.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The operation targeted an entry the monitor marked non-healthy.
    #[error("transport for {key} is {status}")]
    TransportUnhealthy { key: String, status: String },

    /// A procedure step failed. Carries the step name as the stage marker.
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<OpsError>,
    },

    /// An error raised inside the russh library.
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    /// Local filesystem or socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation inside the core itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OpsError {
    /// Whether a retry of the same operation could plausibly succeed.
    ///
    /// Authentication and host-key failures are never retried: repeating
    /// them risks account lockouts and hides active mismatches.
    pub fn retryable(&self) -> bool {
        match self {
            OpsError::DialFailed { .. } | OpsError::Io(_) => true,
            OpsError::Ssh(_) => true,
            OpsError::StepFailed { source, .. } => source.retryable(),
            _ => false,
        }
    }

    /// Name of the failed step for procedure errors.
    pub fn step(&self) -> Option<&str> {
        match self {
            OpsError::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Whether this error is a cancellation, possibly wrapped in a step.
    pub fn is_cancelled(&self) -> bool {
        match self {
            OpsError::Cancelled => true,
            OpsError::StepFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Wrap an error with the procedure step that raised it.
    pub(crate) fn in_step(self, step: &str) -> OpsError {
        match self {
            // Keep the innermost step attribution.
            err @ OpsError::StepFailed { .. } => err,
            other => OpsError::StepFailed {
                step: step.to_string(),
                source: Box::new(other),
            },
        }
    }
}
