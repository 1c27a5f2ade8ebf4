//! Application deployment with backup, health wait and automatic rollback.
//!
//! Artifact and directory work runs as the app user, which owns the
//! application tree; only service control goes through the privileged
//! route. On a failed deploy with rollback enabled, the previous version is
//! restored from its backup and the service restarted.

use std::time::Instant;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::OpsError;
use crate::progress::{ProgressEvent, ProgressSink, StepStatus};
use crate::router::CommandSpec;

use super::{ProcedureCtx, shell_quote, validate_unit_name};

/// Rollout strategy requested by the caller.
///
/// Only `recreate` semantics are implemented; the other strategies are
/// accepted and currently reduce to `recreate`. The accepted value is
/// recorded in the result so callers can see what actually ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeployStrategy {
    Rolling,
    BlueGreen,
    Canary,
    #[default]
    Recreate,
}

/// How the post-restart health wait decides the app is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthProbe {
    /// `curl -fsS` against a URL from the host itself.
    Http { url: String },
    /// The deployed unit reports `active`.
    ServiceActive,
    /// The working directory exists.
    WorkdirExists,
}

/// Health wait configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HealthCheckSpec {
    pub probe: HealthProbe,
    /// Give up after this many seconds.
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    /// Seconds between probe attempts.
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
}

fn default_health_timeout() -> u64 {
    60
}

fn default_health_interval() -> u64 {
    2
}

/// Everything needed to roll one version of an app onto a host.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeploySpec {
    pub app_name: String,
    pub version: String,
    /// Systemd unit restarted after the artifact is in place.
    pub service: String,
    /// Remote path of the uploaded artifact (`.tar.gz`, `.zip` or a file).
    pub artifact_path: String,
    /// App working directory, owned by the app user.
    pub workdir: String,
    /// Root under which per-version backups are kept.
    #[serde(default = "default_backup_root")]
    pub backup_root: String,
    #[serde(default)]
    pub strategy: DeployStrategy,
    #[serde(default = "default_true")]
    pub backup_previous: bool,
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
    #[serde(default)]
    pub health: Option<HealthCheckSpec>,
    /// Commands run before the artifact is placed. Failures abort.
    #[serde(default)]
    pub pre_hooks: Vec<String>,
    /// Commands run after a healthy rollout. Failures are warnings.
    #[serde(default)]
    pub post_hooks: Vec<String>,
}

fn default_backup_root() -> String {
    "/opt/pocketbase/backups".to_string()
}

fn default_true() -> bool {
    true
}

impl DeploySpec {
    pub fn validate(&self) -> Result<(), OpsError> {
        let fields = [
            ("app_name", &self.app_name),
            ("version", &self.version),
            ("artifact_path", &self.artifact_path),
            ("workdir", &self.workdir),
            ("backup_root", &self.backup_root),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(OpsError::InvalidServer(format!("deploy spec: {name} is empty")));
            }
        }
        validate_unit_name(&self.service)?;
        if !self.workdir.starts_with('/') {
            return Err(OpsError::InvalidServer(
                "deploy spec: workdir must be absolute".to_string(),
            ));
        }
        Ok(())
    }

    fn version_marker(&self) -> String {
        format!("{}/.deploy-version", self.workdir)
    }

    fn backup_dir(&self, version: &str) -> String {
        format!("{}/{}/{}", self.backup_root, self.app_name, version)
    }
}

/// Outcome of one deployment step, as recorded in the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeployStepStatus {
    Completed,
    Failed,
    Skipped,
    Warning,
}

/// One line of the deployment audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeployStepRecord {
    pub name: String,
    pub status: DeployStepStatus,
    pub message: String,
    pub duration_ms: u64,
}

/// Final report handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeploymentResult {
    pub success: bool,
    pub app_name: String,
    pub version: String,
    pub previous_version: Option<String>,
    pub strategy: DeployStrategy,
    pub steps: Vec<DeployStepRecord>,
    pub error: Option<String>,
}

const STEP_NAMES: &[&str] = &[
    "validate_spec",
    "resolve_previous",
    "backup_previous",
    "pre_deploy_hooks",
    "place_artifact",
    "restart_service",
    "health_check",
    "post_deploy_hooks",
];

/// Per-step event emission and audit recording for one deployment.
struct DeployRun<'a> {
    sink: &'a ProgressSink,
    steps: Vec<DeployStepRecord>,
    done: usize,
}

impl<'a> DeployRun<'a> {
    fn new(sink: &'a ProgressSink) -> Self {
        Self {
            sink,
            steps: Vec::new(),
            done: 0,
        }
    }

    fn pct(&self) -> u8 {
        (self.done * 100 / STEP_NAMES.len()) as u8
    }

    fn begin(&self, name: &str) -> Instant {
        self.sink.emit(ProgressEvent::new(
            name,
            StepStatus::Running,
            format!("{name} started"),
            self.pct(),
        ));
        Instant::now()
    }

    fn finish(&mut self, name: &str, started: Instant, status: DeployStepStatus, message: String) {
        self.done += 1;
        let event_status = match status {
            DeployStepStatus::Completed => StepStatus::Success,
            DeployStepStatus::Skipped => StepStatus::Skipped,
            DeployStepStatus::Warning => StepStatus::Warning,
            DeployStepStatus::Failed => StepStatus::Failed,
        };
        if status != DeployStepStatus::Failed {
            self.sink
                .emit(ProgressEvent::new(name, event_status, message.clone(), self.pct()));
        }
        self.steps.push(DeployStepRecord {
            name: name.to_string(),
            status,
            message,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    fn record(&mut self, name: &str, status: DeployStepStatus, message: String, started: Instant) {
        self.steps.push(DeployStepRecord {
            name: name.to_string(),
            status,
            message,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }
}

pub(crate) async fn run_deployment(
    ctx: &ProcedureCtx<'_>,
    spec: &DeploySpec,
    sink: &ProgressSink,
) -> Result<DeploymentResult, OpsError> {
    ctx.server.validate()?;
    spec.validate()?;

    let mut run = DeployRun::new(sink);
    let mut previous_version: Option<String> = None;

    let outcome: Result<(), OpsError> =
        deploy_steps(ctx, spec, &mut run, &mut previous_version).await;

    match outcome {
        Ok(()) => {
            sink.emit(ProgressEvent::new(
                "deploy",
                StepStatus::Success,
                format!("{} {} deployed", spec.app_name, spec.version),
                100,
            ));
            Ok(DeploymentResult {
                success: true,
                app_name: spec.app_name.clone(),
                version: spec.version.clone(),
                previous_version,
                strategy: spec.strategy,
                steps: run.steps,
                error: None,
            })
        }
        // Cancellation is surfaced as-is; no rollback I/O after it.
        Err(err) if err.is_cancelled() => Err(err),
        Err(err) => {
            let failure = err.to_string();
            if let Some(step) = err.step() {
                run.record(step, DeployStepStatus::Failed, failure.clone(), Instant::now());
            }
            if spec.rollback_on_failure {
                sink.emit(ProgressEvent::new(
                    "automatic_rollback",
                    StepStatus::Warning,
                    format!("deployment failed ({failure}), rolling back"),
                    run.pct(),
                ));
                let started = Instant::now();
                match rollback(ctx, spec, previous_version.as_deref()).await {
                    Ok(restored) => {
                        run.record(
                            "automatic_rollback",
                            DeployStepStatus::Completed,
                            format!("restored {restored}"),
                            started,
                        );
                        sink.emit(ProgressEvent::new(
                            "automatic_rollback",
                            StepStatus::Success,
                            format!("restored {restored}"),
                            run.pct(),
                        ));
                    }
                    Err(rollback_err) => {
                        run.record(
                            "automatic_rollback",
                            DeployStepStatus::Failed,
                            rollback_err.to_string(),
                            started,
                        );
                        log::error!(
                            "rollback of {} failed after deploy error: {rollback_err}",
                            spec.app_name
                        );
                    }
                }
            }
            sink.emit(ProgressEvent::new(
                "deploy",
                StepStatus::Failed,
                failure.clone(),
                100,
            ));
            Ok(DeploymentResult {
                success: false,
                app_name: spec.app_name.clone(),
                version: spec.version.clone(),
                previous_version,
                strategy: spec.strategy,
                steps: run.steps,
                error: Some(failure),
            })
        }
    }
}

async fn deploy_steps(
    ctx: &ProcedureCtx<'_>,
    spec: &DeploySpec,
    run: &mut DeployRun<'_>,
    previous_version: &mut Option<String>,
) -> Result<(), OpsError> {
    let check_cancel = |name: &str| -> Result<(), OpsError> {
        if ctx.cancel.is_cancelled() {
            Err(OpsError::Cancelled.in_step(name))
        } else {
            Ok(())
        }
    };

    // validate_spec: already proven by the caller, recorded for the trail.
    let started = run.begin("validate_spec");
    run.finish(
        "validate_spec",
        started,
        DeployStepStatus::Completed,
        format!("{} {} via {:?} strategy", spec.app_name, spec.version, spec.strategy),
    );

    check_cancel("resolve_previous")?;
    let started = run.begin("resolve_previous");
    let marker = ctx
        .run_routed_unchecked(&CommandSpec::new(format!("cat {}", spec.version_marker())))
        .await
        .map_err(|err| err.in_step("resolve_previous"))?;
    if marker.success() && !marker.output.trim().is_empty() {
        *previous_version = Some(marker.output.trim().to_string());
    }
    run.finish(
        "resolve_previous",
        started,
        DeployStepStatus::Completed,
        match previous_version {
            Some(version) => format!("previous version {version}"),
            None => "no previous version recorded".to_string(),
        },
    );

    check_cancel("backup_previous")?;
    let started = run.begin("backup_previous");
    match (spec.backup_previous, previous_version.as_deref()) {
        (true, Some(previous)) => {
            let backup_dir = spec.backup_dir(previous);
            ctx.run_routed(&CommandSpec::new(format!(
                "mkdir -p {backup_dir} && cp -r {}/* {backup_dir}/",
                spec.workdir
            )))
            .await
            .map_err(|err| err.in_step("backup_previous"))?;
            run.finish(
                "backup_previous",
                started,
                DeployStepStatus::Completed,
                format!("{previous} backed up to {backup_dir}"),
            );
        }
        (true, None) => run.finish(
            "backup_previous",
            started,
            DeployStepStatus::Skipped,
            "nothing to back up".to_string(),
        ),
        (false, _) => run.finish(
            "backup_previous",
            started,
            DeployStepStatus::Skipped,
            "backup disabled".to_string(),
        ),
    }

    check_cancel("pre_deploy_hooks")?;
    let started = run.begin("pre_deploy_hooks");
    if spec.pre_hooks.is_empty() {
        run.finish(
            "pre_deploy_hooks",
            started,
            DeployStepStatus::Skipped,
            "no pre-deploy hooks".to_string(),
        );
    } else {
        for hook in &spec.pre_hooks {
            ctx.run_routed(&CommandSpec::new(hook.clone()))
                .await
                .map_err(|err| err.in_step("pre_deploy_hooks"))?;
        }
        run.finish(
            "pre_deploy_hooks",
            started,
            DeployStepStatus::Completed,
            format!("{} hooks ran", spec.pre_hooks.len()),
        );
    }

    check_cancel("place_artifact")?;
    let started = run.begin("place_artifact");
    ctx.run_routed(&CommandSpec::new(place_artifact_command(spec)))
        .await
        .map_err(|err| err.in_step("place_artifact"))?;
    ctx.run_routed(&CommandSpec::new(format!(
        "printf '%s' {} > {}",
        shell_quote(&spec.version),
        spec.version_marker()
    )))
    .await
    .map_err(|err| err.in_step("place_artifact"))?;
    run.finish(
        "place_artifact",
        started,
        DeployStepStatus::Completed,
        format!("{} unpacked into {}", spec.artifact_path, spec.workdir),
    );

    check_cancel("restart_service")?;
    let started = run.begin("restart_service");
    restart_and_verify(ctx, &spec.service)
        .await
        .map_err(|err| err.in_step("restart_service"))?;
    run.finish(
        "restart_service",
        started,
        DeployStepStatus::Completed,
        format!("{} restarted", spec.service),
    );

    check_cancel("health_check")?;
    let started = run.begin("health_check");
    match &spec.health {
        Some(health) => {
            wait_healthy(ctx, spec, health)
                .await
                .map_err(|err| err.in_step("health_check"))?;
            run.finish(
                "health_check",
                started,
                DeployStepStatus::Completed,
                "application reported healthy".to_string(),
            );
        }
        None => run.finish(
            "health_check",
            started,
            DeployStepStatus::Skipped,
            "no health check configured".to_string(),
        ),
    }

    check_cancel("post_deploy_hooks")?;
    let started = run.begin("post_deploy_hooks");
    if spec.post_hooks.is_empty() {
        run.finish(
            "post_deploy_hooks",
            started,
            DeployStepStatus::Skipped,
            "no post-deploy hooks".to_string(),
        );
    } else {
        let mut warnings = 0usize;
        for hook in &spec.post_hooks {
            if let Err(err) = ctx.run_routed(&CommandSpec::new(hook.clone())).await {
                if matches!(err, OpsError::Cancelled) {
                    return Err(err.in_step("post_deploy_hooks"));
                }
                warnings += 1;
                log::warn!("post-deploy hook failed (non-fatal): {err}");
            }
        }
        let status = if warnings == 0 {
            DeployStepStatus::Completed
        } else {
            DeployStepStatus::Warning
        };
        run.finish(
            "post_deploy_hooks",
            started,
            status,
            format!(
                "{} hooks ran, {warnings} failed",
                spec.post_hooks.len()
            ),
        );
    }

    Ok(())
}

/// Artifact placement by extension: tarballs and zips extract, anything
/// else is copied into the working directory.
fn place_artifact_command(spec: &DeploySpec) -> String {
    let artifact = &spec.artifact_path;
    let workdir = &spec.workdir;
    if artifact.ends_with(".tar.gz") || artifact.ends_with(".tgz") {
        format!("mkdir -p {workdir} && tar -xzf {artifact} -C {workdir}")
    } else if artifact.ends_with(".zip") {
        format!("mkdir -p {workdir} && unzip -o {artifact} -d {workdir}")
    } else {
        format!("mkdir -p {workdir} && cp {artifact} {workdir}/")
    }
}

async fn restart_and_verify(ctx: &ProcedureCtx<'_>, service: &str) -> Result<(), OpsError> {
    ctx.run_routed(&ctx.privileged(format!("systemctl restart {service}")))
        .await?;
    ctx.pause(ctx.settings.service_verify_delay).await?;
    let state = ctx
        .run_routed_unchecked(&ctx.privileged(format!("systemctl is-active {service}")))
        .await?;
    if state.output.trim() != "active" {
        return Err(OpsError::ServiceFailedToStart {
            service: service.to_string(),
            state: state.output.trim().to_string(),
        });
    }
    Ok(())
}

/// Poll the configured probe until it passes or the timeout elapses.
async fn wait_healthy(
    ctx: &ProcedureCtx<'_>,
    spec: &DeploySpec,
    health: &HealthCheckSpec,
) -> Result<(), OpsError> {
    let deadline = Instant::now() + Duration::from_secs(health.timeout_secs);
    let interval = Duration::from_secs(health.interval_secs.max(1));

    loop {
        let passed = match &health.probe {
            HealthProbe::Http { url } => {
                let probe = ctx
                    .run_routed_unchecked(&CommandSpec::new(format!(
                        "curl -fsS --max-time 5 {} >/dev/null",
                        shell_quote(url)
                    )))
                    .await?;
                probe.success()
            }
            HealthProbe::ServiceActive => {
                let probe = ctx
                    .run_routed_unchecked(&ctx.privileged(format!(
                        "systemctl is-active {}",
                        spec.service
                    )))
                    .await?;
                probe.output.trim() == "active"
            }
            HealthProbe::WorkdirExists => {
                let probe = ctx
                    .run_routed_unchecked(&CommandSpec::new(format!("test -d {}", spec.workdir)))
                    .await?;
                probe.success()
            }
        };
        if passed {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(OpsError::CommandFailed {
                exit: 1,
                output: format!(
                    "health check did not pass within {}s",
                    health.timeout_secs
                ),
            });
        }
        ctx.pause(interval).await?;
    }
}

/// Restore the previous version from its backup and restart the service.
/// Returns the restored version.
async fn rollback(
    ctx: &ProcedureCtx<'_>,
    spec: &DeploySpec,
    previous_version: Option<&str>,
) -> Result<String, OpsError> {
    let Some(previous) = previous_version else {
        return Err(OpsError::RollbackUnavailable {
            backup_dir: format!("{}/{}", spec.backup_root, spec.app_name),
        });
    };
    let backup_dir = spec.backup_dir(previous);

    let present = ctx
        .run_routed_unchecked(&CommandSpec::new(format!("test -d {backup_dir}")))
        .await?;
    if !present.success() {
        return Err(OpsError::RollbackUnavailable { backup_dir });
    }

    ctx.run_routed(&CommandSpec::new(format!(
        "rm -rf {workdir}/* && cp -r {backup_dir}/* {workdir}/",
        workdir = spec.workdir
    )))
    .await?;
    ctx.run_routed(&CommandSpec::new(format!(
        "printf '%s' {} > {}",
        shell_quote(previous),
        spec.version_marker()
    )))
    .await?;
    restart_and_verify(ctx, &spec.service).await?;
    Ok(previous.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> DeploySpec {
        DeploySpec {
            app_name: "shop".to_string(),
            version: "v2".to_string(),
            service: "pocketbase-shop".to_string(),
            artifact_path: "/tmp/shop-v2.tar.gz".to_string(),
            workdir: "/opt/pocketbase/apps/shop".to_string(),
            backup_root: default_backup_root(),
            strategy: DeployStrategy::Recreate,
            backup_previous: true,
            rollback_on_failure: true,
            health: None,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }

    #[test]
    fn tarballs_extract_zips_unzip_files_copy() {
        let mut s = spec();
        assert!(place_artifact_command(&s).contains("tar -xzf /tmp/shop-v2.tar.gz"));
        s.artifact_path = "/tmp/shop.zip".to_string();
        assert!(place_artifact_command(&s).contains("unzip -o /tmp/shop.zip"));
        s.artifact_path = "/tmp/pocketbase".to_string();
        assert!(place_artifact_command(&s).ends_with("cp /tmp/pocketbase /opt/pocketbase/apps/shop/"));
    }

    #[test]
    fn backup_dir_is_per_app_and_version() {
        assert_eq!(
            spec().backup_dir("v1"),
            "/opt/pocketbase/backups/shop/v1"
        );
    }

    #[test]
    fn empty_fields_fail_validation() {
        let mut s = spec();
        s.version = String::new();
        assert!(s.validate().is_err());

        let mut s = spec();
        s.workdir = "relative/path".to_string();
        assert!(s.validate().is_err());

        let mut s = spec();
        s.service = "bad name".to_string();
        assert!(s.validate().is_err());

        assert!(spec().validate().is_ok());
    }

    #[test]
    fn strategy_defaults_to_recreate() {
        let json = r#"{
            "app_name": "shop",
            "version": "v2",
            "service": "pocketbase-shop",
            "artifact_path": "/tmp/a.tar.gz",
            "workdir": "/opt/pocketbase/apps/shop"
        }"#;
        let parsed: DeploySpec = serde_json::from_str(json).expect("parse");
        assert_eq!(parsed.strategy, DeployStrategy::Recreate);
        assert!(parsed.backup_previous);
        assert!(parsed.rollback_on_failure);
        assert_eq!(parsed.backup_root, "/opt/pocketbase/backups");
    }

    #[test]
    fn accepted_strategies_parse_snake_case() {
        for (text, strategy) in [
            ("\"rolling\"", DeployStrategy::Rolling),
            ("\"blue_green\"", DeployStrategy::BlueGreen),
            ("\"canary\"", DeployStrategy::Canary),
            ("\"recreate\"", DeployStrategy::Recreate),
        ] {
            let parsed: DeployStrategy = serde_json::from_str(text).expect("parse");
            assert_eq!(parsed, strategy);
        }
    }
}
