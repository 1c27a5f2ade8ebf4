//! Security lockdown: firewall, fail2ban and SSH hardening.
//!
//! The app user's sudo path is proven to work *before* anything that could
//! disable root login; a hardening mistake must never strand the host. On
//! success the caller flips `security_locked` on the server record.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::OpsError;
use crate::progress::{ProgressSink, now_ms};
use crate::server::Role;

use super::{ProcedureCtx, ProcedureRun, StepOutcome};

const SSHD_CONFIG: &str = "/etc/ssh/sshd_config";

/// Matches ufw's enabled banner at line start.
static UFW_ACTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Status:\s*active").expect("static regex"));

/// Whether `ufw status` output carries an ALLOW rule for `port`/tcp.
fn ufw_allows_port(status: &str, port: u16) -> bool {
    Regex::new(&format!(r"(?m)^{port}/tcp\s+ALLOW"))
        .expect("port rule regex")
        .is_match(status)
}

/// Hardening directives applied before root login is disabled.
const SSHD_DIRECTIVES: &[(&str, &str)] = &[
    ("PasswordAuthentication", "no"),
    ("PubkeyAuthentication", "yes"),
    ("X11Forwarding", "no"),
    ("PermitEmptyPasswords", "no"),
    ("MaxAuthTries", "3"),
    ("MaxSessions", "2"),
    ("Protocol", "2"),
    ("ClientAliveInterval", "300"),
    ("ClientAliveCountMax", "2"),
];

/// Unit names tried when reloading the SSH daemon, in OS-preference order.
const SSH_UNIT_CANDIDATES: &[&str] = &["ssh", "sshd", "openssh-server"];

pub(crate) async fn run_lockdown(
    ctx: &ProcedureCtx<'_>,
    sink: &ProgressSink,
) -> Result<(), OpsError> {
    ctx.server.validate()?;
    if ctx.server.security_locked {
        return Err(OpsError::InvalidServer(
            "host is already security-locked".to_string(),
        ));
    }

    let ssh_port = ctx.server.port;
    let mut run = ProcedureRun::new(sink, ctx.cancel, 5);

    run.step("setup_firewall", async {
        ctx.run_as(
            Role::Root,
            "command -v ufw >/dev/null 2>&1 || (DEBIAN_FRONTEND=noninteractive apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq ufw)",
        )
        .await?;
        ctx.run_as(Role::Root, "ufw --force reset").await?;
        ctx.run_as(Role::Root, "ufw default deny incoming").await?;
        ctx.run_as(Role::Root, "ufw default allow outgoing").await?;
        ctx.run_as(Role::Root, &format!("ufw allow {ssh_port}/tcp")).await?;
        ctx.run_as(Role::Root, "ufw allow 80/tcp").await?;
        ctx.run_as(Role::Root, "ufw allow 443/tcp").await?;
        ctx.run_as(Role::Root, "ufw --force enable").await?;

        let status = ctx.run_as(Role::Root, "ufw status").await?;
        if !UFW_ACTIVE.is_match(&status) {
            return Err(OpsError::CommandFailed {
                exit: 1,
                output: format!("ufw did not report active:\n{status}"),
            });
        }
        Ok(StepOutcome::Done(format!(
            "firewall active, allowing {ssh_port}, 80, 443"
        )))
    })
    .await?;

    run.step("setup_fail2ban", async {
        ctx.run_as(
            Role::Root,
            "command -v fail2ban-server >/dev/null 2>&1 || (DEBIAN_FRONTEND=noninteractive apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq fail2ban)",
        )
        .await?;
        ctx.run_as(Role::Root, &write_jail_command(ssh_port)).await?;
        ctx.run_as(Role::Root, "systemctl enable fail2ban").await?;
        ctx.run_as(Role::Root, "systemctl restart fail2ban").await?;

        let state = ctx
            .run_as_unchecked(Role::Root, "systemctl is-active fail2ban")
            .await?;
        if state.output.trim() != "active" {
            return Err(OpsError::CommandFailed {
                exit: state.exit,
                output: format!("fail2ban is not active: {}", state.output.trim()),
            });
        }
        ctx.run_as(Role::Root, "fail2ban-client status sshd").await?;
        Ok(StepOutcome::Done("fail2ban guarding sshd".to_string()))
    })
    .await?;

    // Proves the post-lockdown privilege path while root login still works.
    run.step("validate_app_user", async {
        let app = &ctx.server.app_username;
        let lease = ctx.fresh_lease(Role::App).await?;
        let who = lease
            .run("sudo -n whoami", crate::config::COMMAND_TIMEOUT, ctx.cancel)
            .await?;
        if !who.output.contains("root") {
            return Err(OpsError::CommandFailed {
                exit: 1,
                output: format!("sudo -n as {app} did not yield root: {}", who.output.trim()),
            });
        }
        Ok(StepOutcome::Done(format!("{app} can escalate with sudo -n")))
    })
    .await?;

    run.step("harden_ssh", async {
        let backup = format!("{SSHD_CONFIG}.backup.{}", now_ms() / 1000);
        ctx.run_as(Role::Root, &format!("cp -a {SSHD_CONFIG} {backup}")).await?;

        for (key, value) in SSHD_DIRECTIVES {
            ctx.run_as(Role::Root, &set_directive_command(key, value)).await?;
        }
        validate_or_restore(ctx, &backup).await?;

        // Everything else is proven valid; only now cut root login.
        ctx.run_as(Role::Root, &set_directive_command("PermitRootLogin", "no"))
            .await?;
        validate_or_restore(ctx, &backup).await?;

        reload_ssh_daemon(ctx).await?;
        Ok(StepOutcome::Done(format!(
            "sshd hardened, config backed up to {backup}"
        )))
    })
    .await?;

    run.step("verify_security", async {
        let ufw = ctx.run_as(Role::Root, "ufw status").await?;
        if !UFW_ACTIVE.is_match(&ufw) {
            return Err(OpsError::CommandFailed {
                exit: 1,
                output: "ufw inactive after lockdown".to_string(),
            });
        }
        for port in [ssh_port, 80, 443] {
            if !ufw_allows_port(&ufw, port) {
                return Err(OpsError::CommandFailed {
                    exit: 1,
                    output: format!("ufw is missing the {port}/tcp rule"),
                });
            }
        }

        let fail2ban = ctx
            .run_as_unchecked(Role::Root, "systemctl is-active fail2ban")
            .await?;
        if fail2ban.output.trim() != "active" {
            return Err(OpsError::CommandFailed {
                exit: fail2ban.exit,
                output: "fail2ban inactive after lockdown".to_string(),
            });
        }

        let directives = ctx
            .run_as(
                Role::Root,
                &format!(
                    "grep -E '^(PermitRootLogin|PasswordAuthentication|PubkeyAuthentication|MaxAuthTries) ' {SSHD_CONFIG}"
                ),
            )
            .await?;
        for expected in [
            "PermitRootLogin no",
            "PasswordAuthentication no",
            "PubkeyAuthentication yes",
            "MaxAuthTries 3",
        ] {
            if !directives.contains(expected) {
                return Err(OpsError::CommandFailed {
                    exit: 1,
                    output: format!("critical sshd directive missing: {expected}"),
                });
            }
        }

        let ssh_active = ssh_unit_is_active(ctx).await?;
        if !ssh_active {
            return Err(OpsError::CommandFailed {
                exit: 1,
                output: "no SSH service unit reports active".to_string(),
            });
        }
        Ok(StepOutcome::Done("lockdown verified".to_string()))
    })
    .await?;

    Ok(())
}

/// Idempotent per-directive edit: replace the line when the key is present,
/// append it otherwise.
fn set_directive_command(key: &str, value: &str) -> String {
    format!(
        "grep -qE '^{key}[[:space:]]' {SSHD_CONFIG} \
         && sed -i 's/^{key}[[:space:]].*/{key} {value}/' {SSHD_CONFIG} \
         || echo '{key} {value}' >> {SSHD_CONFIG}"
    )
}

fn write_jail_command(ssh_port: u16) -> String {
    format!(
        "cat > /etc/fail2ban/jail.local <<'EOF'\n\
         [sshd]\n\
         enabled = true\n\
         port = {ssh_port}\n\
         maxretry = 3\n\
         bantime = 3600\n\
         findtime = 600\n\
         EOF"
    )
}

/// `sshd -t` gate: a syntax error restores the backup and fails the step.
async fn validate_or_restore(ctx: &ProcedureCtx<'_>, backup: &str) -> Result<(), OpsError> {
    let check = ctx.run_as_unchecked(Role::Root, "sshd -t").await?;
    if check.success() {
        return Ok(());
    }
    log::error!("sshd config validation failed, restoring {backup}");
    ctx.run_as(Role::Root, &format!("cp -a {backup} {SSHD_CONFIG}")).await?;
    Err(OpsError::CommandFailed {
        exit: check.exit,
        output: format!("sshd -t rejected the config, backup restored: {}", check.output.trim()),
    })
}

/// Reload the SSH daemon: `systemctl reload` with candidate unit names,
/// falling back to restart, finally to a SIGHUP of the daemon.
async fn reload_ssh_daemon(ctx: &ProcedureCtx<'_>) -> Result<(), OpsError> {
    for unit in SSH_UNIT_CANDIDATES {
        let reload = ctx
            .run_as_unchecked(Role::Root, &format!("systemctl reload {unit}"))
            .await?;
        if reload.success() {
            return Ok(());
        }
    }
    for unit in SSH_UNIT_CANDIDATES {
        let restart = ctx
            .run_as_unchecked(Role::Root, &format!("systemctl restart {unit}"))
            .await?;
        if restart.success() {
            log::debug!("sshd reloaded via systemctl restart {unit}");
            return Ok(());
        }
    }
    ctx.run_as(Role::Root, "kill -HUP $(pgrep -o -x sshd)").await?;
    log::warn!("sshd reloaded via SIGHUP fallback");
    Ok(())
}

async fn ssh_unit_is_active(ctx: &ProcedureCtx<'_>) -> Result<bool, OpsError> {
    for unit in SSH_UNIT_CANDIDATES {
        let state = ctx
            .run_as_unchecked(Role::Root, &format!("systemctl is-active {unit}"))
            .await?;
        if state.output.trim() == "active" {
            return Ok(true);
        }
    }
    Ok(false)
}
