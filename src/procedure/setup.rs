//! Server setup: provision the app user, its SSH access and the directory
//! layout on a freshly created host.
//!
//! Runs with the root role and therefore refuses security-locked hosts.

use crate::error::OpsError;
use crate::progress::ProgressSink;
use crate::server::Role;

use super::{ProcedureCtx, ProcedureRun, StepOutcome, shell_quote};

/// Application directories created on every managed host.
const APP_DIRS: &[&str] = &["/opt/pocketbase", "/opt/pocketbase/apps", "/var/log/pocketbase"];

pub(crate) async fn run_server_setup(
    ctx: &ProcedureCtx<'_>,
    sink: &ProgressSink,
) -> Result<(), OpsError> {
    ctx.server.validate()?;
    if ctx.server.security_locked {
        return Err(OpsError::RootDisabled);
    }

    let app = ctx.server.app_username.clone();
    let mut run = ProcedureRun::new(sink, ctx.cancel, 4);

    run.step("create_user", async {
        let check = ctx.run_as_unchecked(Role::Root, &format!("id {app}")).await?;
        if check.success() && check.output.contains("uid=") {
            return Ok(StepOutcome::Skipped(format!("user {app} already exists")));
        }

        ctx.run_as(Role::Root, &format!("useradd -m -s /bin/bash {app}"))
            .await?;
        ctx.run_as(Role::Root, &format!("usermod -aG sudo {app}")).await?;
        ctx.run_as(Role::Root, &write_sudoers_command(&app)).await?;
        Ok(StepOutcome::Done(format!("user {app} created")))
    })
    .await?;

    run.step("setup_ssh_keys", async {
        let ssh_dir = format!("/home/{app}/.ssh");
        ctx.run_as(Role::Root, &format!("mkdir -p {ssh_dir} && chmod 700 {ssh_dir}"))
            .await?;
        ctx.run_as(
            Role::Root,
            &format!(
                "cp /root/.ssh/authorized_keys {ssh_dir}/authorized_keys && chmod 600 {ssh_dir}/authorized_keys"
            ),
        )
        .await?;
        ctx.run_as(Role::Root, &format!("chown -R {app}:{app} {ssh_dir}"))
            .await?;
        Ok(StepOutcome::Done(format!("SSH keys installed for {app}")))
    })
    .await?;

    run.step("create_directories", async {
        for dir in APP_DIRS {
            ctx.run_as(
                Role::Root,
                &format!("mkdir -p {dir} && chmod 755 {dir} && chown {app}:{app} {dir}"),
            )
            .await?;
        }
        Ok(StepOutcome::Done("application directories created".to_string()))
    })
    .await?;

    run.step("test_connection", async {
        let lease = ctx.fresh_lease(Role::App).await?;
        lease
            .probe(crate::config::PROBE_TIMEOUT, ctx.cancel)
            .await?;
        lease
            .run("sudo -n systemctl --version", crate::config::COMMAND_TIMEOUT, ctx.cancel)
            .await?;
        lease
            .run("ls -la /opt/pocketbase", crate::config::COMMAND_TIMEOUT, ctx.cancel)
            .await?;
        Ok(StepOutcome::Done(format!(
            "verified {app} login and sudo access",
        )))
    })
    .await?;

    Ok(())
}

/// Sudoers drop-in granting the app user passwordless access to the exact
/// binaries the deployment flow needs, in both /bin and /usr/bin.
fn sudoers_content(app: &str) -> String {
    let binaries = ["systemctl", "mkdir", "chown", "chmod"];
    let paths: Vec<String> = binaries
        .iter()
        .flat_map(|bin| [format!("/bin/{bin}"), format!("/usr/bin/{bin}")])
        .collect();
    format!("{app} ALL=(ALL) NOPASSWD: {}\n", paths.join(", "))
}

fn write_sudoers_command(app: &str) -> String {
    let file = format!("/etc/sudoers.d/{app}");
    format!(
        "printf '%s' {} > {file} && chmod 0440 {file} && visudo -cf {file}",
        shell_quote(&sudoers_content(app)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sudoers_covers_both_bin_variants() {
        let content = sudoers_content("pocketbase");
        assert!(content.starts_with("pocketbase ALL=(ALL) NOPASSWD: "));
        for bin in ["systemctl", "mkdir", "chown", "chmod"] {
            assert!(content.contains(&format!("/bin/{bin}")));
            assert!(content.contains(&format!("/usr/bin/{bin}")));
        }
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn sudoers_write_validates_the_drop_in() {
        let cmd = write_sudoers_command("pocketbase");
        assert!(cmd.contains("> /etc/sudoers.d/pocketbase"));
        assert!(cmd.contains("chmod 0440"));
        assert!(cmd.contains("visudo -cf"));
    }
}
