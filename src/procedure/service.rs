//! Systemd service management, dispatched through the capability router.
//!
//! Every operation is a single remote invocation. `start` and `restart`
//! verify their post-condition: shortly after the command, the unit must
//! report `active`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::OpsError;

use super::{ProcedureCtx, validate_unit_name};

/// Service operations exposed by the façade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOp {
    Start,
    Stop,
    Restart,
    Reload,
    Enable,
    Disable,
    Status,
    /// Tail the unit's journal; the payload is the line count.
    Logs(u32),
}

impl ServiceOp {
    fn command(&self, service: &str) -> String {
        match self {
            ServiceOp::Start => format!("systemctl start {service}"),
            ServiceOp::Stop => format!("systemctl stop {service}"),
            ServiceOp::Restart => format!("systemctl restart {service}"),
            ServiceOp::Reload => format!("systemctl reload {service}"),
            ServiceOp::Enable => format!("systemctl enable {service}"),
            ServiceOp::Disable => format!("systemctl disable {service}"),
            ServiceOp::Status => format!("systemctl status {service} --no-pager"),
            ServiceOp::Logs(lines) => {
                format!("journalctl -u {service} -n {lines} --no-pager")
            }
        }
    }

    /// Whether the operation must leave the unit running.
    fn verifies_active(&self) -> bool {
        matches!(self, ServiceOp::Start | ServiceOp::Restart)
    }

    /// Read-only operations report their output even on non-zero exit
    /// (`systemctl status` exits 3 for inactive units).
    fn tolerates_nonzero(&self) -> bool {
        matches!(self, ServiceOp::Status | ServiceOp::Logs(_))
    }
}

pub(crate) async fn run_service_op(
    ctx: &ProcedureCtx<'_>,
    op: ServiceOp,
    service: &str,
) -> Result<String, OpsError> {
    validate_unit_name(service)?;
    let command = ctx.privileged(op.command(service));

    let output = if op.tolerates_nonzero() {
        ctx.run_routed_unchecked(&command).await?.output
    } else {
        ctx.run_routed(&command).await?
    };

    if op.verifies_active() {
        ctx.pause(ctx.settings.service_verify_delay).await?;
        let state = ctx
            .run_routed_unchecked(&ctx.privileged(format!("systemctl is-active {service}")))
            .await?;
        let state_text = state.output.trim().to_string();
        if state_text != "active" {
            return Err(OpsError::ServiceFailedToStart {
                service: service.to_string(),
                state: if state_text.is_empty() {
                    "unknown".to_string()
                } else {
                    state_text
                },
            });
        }
    }

    Ok(output)
}
