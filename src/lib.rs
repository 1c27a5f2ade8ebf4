//! # pbfleet - Remote-host operations core
//!
//! `pbfleet` is the remote operations engine of a PocketBase fleet
//! deployment tool. It executes privileged operations on a population of
//! Linux hosts over SSH through three interlocking pieces:
//!
//! - **Connection pool**: callers are multiplexed onto one live SSH
//!   transport per `(host, port, server-id, role)` key.
//! - **Health monitor**: a background task probes every pooled transport,
//!   classifies it and schedules eviction or recovery.
//! - **Capability router**: each command is routed by the host's security
//!   posture: direct root before lockdown, app user plus `sudo` after.
//!
//! On top sit the multi-step procedures (server setup, security lockdown,
//! service management, deployment) which emit structured progress events on
//! caller-supplied channels.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pbfleet::{Core, CoreSettings, CommandSpec, ServerRecord};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let core = Core::new(CoreSettings::default())?;
//!     let server = ServerRecord {
//!         id: "s1".to_string(),
//!         host: "10.0.0.5".to_string(),
//!         port: 22,
//!         root_username: "root".to_string(),
//!         app_username: "pocketbase".to_string(),
//!         security_locked: false,
//!         use_ssh_agent: true,
//!         manual_key_path: None,
//!     };
//!
//!     let cancel = CancellationToken::new();
//!     let output = core
//!         .execute(&server, &CommandSpec::privileged("systemctl status nginx"), &cancel)
//!         .await?;
//!     println!("{output}");
//!
//!     core.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Main components
//!
//! - [`Core`] - the service façade owning pool, monitor and dialer
//! - [`pool::Pool`] - keyed transport cache with stale cleanup
//! - [`pool::HealthMonitor`] - periodic prober and recovery entry point
//! - [`router`] - security-posture command routing
//! - [`procedure`] - setup, lockdown, service and deployment procedures
//! - [`diagnose`] - read-only connectivity inspection
//! - [`error::OpsError`] - the error taxonomy

pub mod config;
pub mod core;
pub mod diagnose;
pub mod error;
pub mod pool;
pub mod procedure;
pub mod progress;
pub mod router;
pub mod server;
pub mod transport;

pub use crate::core::{ConnectionReport, Core};
pub use config::CoreSettings;
pub use error::OpsError;
pub use procedure::{DeploySpec, DeploymentResult, ServiceOp};
pub use progress::{ProgressEvent, ProgressSink, StepStatus};
pub use router::{CommandSpec, Privilege};
pub use server::{Role, SecurityPosture, ServerRecord};
