//! Multi-step remote procedures and their shared runner.
//!
//! Every procedure is a fixed sequence of named steps. The runner emits a
//! `running` event when a step starts and `success`/`skipped` when it ends;
//! the first failure emits a terminal `failed` event at 100% and aborts the
//! procedure with the step name attached to the error.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::CoreSettings;
use crate::error::OpsError;
use crate::pool::{Lease, Pool};
use crate::progress::{ProgressEvent, ProgressSink, StepStatus};
use crate::router::{self, CommandSpec};
use crate::server::{Role, ServerRecord};

mod deploy;
mod lockdown;
mod service;
mod setup;

pub use deploy::{
    DeploySpec, DeployStepRecord, DeployStepStatus, DeployStrategy, DeploymentResult,
    HealthCheckSpec, HealthProbe,
};
pub use service::ServiceOp;

pub(crate) use deploy::run_deployment;
pub(crate) use lockdown::run_lockdown;
pub(crate) use service::run_service_op;
pub(crate) use setup::run_server_setup;

/// How a completed step reports itself.
pub(crate) enum StepOutcome {
    /// Step did its work.
    Done(String),
    /// Step found nothing to do.
    Skipped(String),
}

/// Event bookkeeping for one procedure execution.
pub(crate) struct ProcedureRun<'a> {
    sink: &'a ProgressSink,
    cancel: &'a CancellationToken,
    total: usize,
    done: usize,
}

impl<'a> ProcedureRun<'a> {
    pub(crate) fn new(sink: &'a ProgressSink, cancel: &'a CancellationToken, total: usize) -> Self {
        Self {
            sink,
            cancel,
            total: total.max(1),
            done: 0,
        }
    }

    fn pct_before(&self) -> u8 {
        (self.done * 100 / self.total) as u8
    }

    fn pct_after(&self) -> u8 {
        ((self.done + 1) * 100 / self.total) as u8
    }

    /// Run one named step, emitting its progress events.
    pub(crate) async fn step(
        &mut self,
        name: &str,
        fut: impl Future<Output = Result<StepOutcome, OpsError>>,
    ) -> Result<(), OpsError> {
        if self.cancel.is_cancelled() {
            return self.abort(name, OpsError::Cancelled);
        }
        self.sink.emit(ProgressEvent::new(
            name,
            StepStatus::Running,
            format!("{name} started"),
            self.pct_before(),
        ));

        match fut.await {
            Ok(StepOutcome::Done(message)) => {
                self.sink.emit(ProgressEvent::new(
                    name,
                    StepStatus::Success,
                    message,
                    self.pct_after(),
                ));
                self.done += 1;
                Ok(())
            }
            Ok(StepOutcome::Skipped(message)) => {
                self.sink.emit(ProgressEvent::new(
                    name,
                    StepStatus::Skipped,
                    message,
                    self.pct_after(),
                ));
                self.done += 1;
                Ok(())
            }
            Err(err) => self.abort(name, err),
        }
    }

    fn abort(&self, name: &str, err: OpsError) -> Result<(), OpsError> {
        let err = err.in_step(name);
        self.sink.emit(
            ProgressEvent::new(name, StepStatus::Failed, err.to_string(), 100)
                .with_details(format!("procedure aborted at step {name}")),
        );
        Err(err)
    }
}

/// Everything a procedure step needs to reach the remote host.
pub(crate) struct ProcedureCtx<'a> {
    pub pool: &'a Pool,
    pub server: &'a ServerRecord,
    pub cancel: &'a CancellationToken,
    pub settings: &'a CoreSettings,
}

impl ProcedureCtx<'_> {
    /// Run a command on the pooled transport for `role`, requiring exit 0.
    pub(crate) async fn run_as(&self, role: Role, command: &str) -> Result<String, OpsError> {
        let lease = self.pool.acquire(self.server, role, self.cancel).await?;
        let out = lease
            .run(command, crate::config::COMMAND_TIMEOUT, self.cancel)
            .await?;
        Ok(out.output)
    }

    /// Run a command on the pooled transport for `role`, reporting the exit.
    pub(crate) async fn run_as_unchecked(
        &self,
        role: Role,
        command: &str,
    ) -> Result<crate::transport::ExecOutput, OpsError> {
        let lease = self.pool.acquire(self.server, role, self.cancel).await?;
        lease
            .run_unchecked(command, crate::config::COMMAND_TIMEOUT, self.cancel)
            .await
    }

    /// Run a command through the capability router.
    pub(crate) async fn run_routed(&self, command: &CommandSpec) -> Result<String, OpsError> {
        let route = router::route(self.server, command.privilege())?;
        let lease = self.pool.acquire(self.server, route.role, self.cancel).await?;
        let text = route.transform.apply(&command.text);
        let out = lease.run(&text, command.timeout(), self.cancel).await?;
        Ok(out.output)
    }

    /// Routed variant that reports the exit instead of failing on it.
    pub(crate) async fn run_routed_unchecked(
        &self,
        command: &CommandSpec,
    ) -> Result<crate::transport::ExecOutput, OpsError> {
        let route = router::route(self.server, command.privilege())?;
        let lease = self.pool.acquire(self.server, route.role, self.cancel).await?;
        let text = route.transform.apply(&command.text);
        lease.run_unchecked(&text, command.timeout(), self.cancel).await
    }

    /// Lease a freshly dialed transport for `role`, evicting any pooled one
    /// first. Used by validation steps that must prove a new login works.
    pub(crate) async fn fresh_lease(&self, role: Role) -> Result<Lease, OpsError> {
        let key = crate::pool::PoolKey::for_server(self.server, role);
        self.pool.evict(&key).await;
        self.pool.acquire(self.server, role, self.cancel).await
    }

    /// Cancellable sleep.
    pub(crate) async fn pause(&self, duration: Duration) -> Result<(), OpsError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(OpsError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub(crate) fn privileged(&self, text: impl Into<String>) -> CommandSpec {
        CommandSpec::privileged(text)
    }
}

/// Quote a value for safe single-quoted shell interpolation.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Reject service/unit names that could escape a shell word.
pub(crate) fn validate_unit_name(name: &str) -> Result<(), OpsError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':'));
    if ok {
        Ok(())
    } else {
        Err(OpsError::InvalidServer(format!(
            "invalid service unit name '{name}'"
        )))
    }
}
