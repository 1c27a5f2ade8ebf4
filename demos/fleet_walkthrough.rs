//! End-to-end walkthrough against a real host.
//!
//! Usage:
//!   cargo run --example fleet_walkthrough -- <host> [port]
//!
//! Reads the host from the command line, tests connectivity for both roles,
//! prints diagnostics and a pool snapshot. Destructive procedures (setup,
//! lockdown, deploy) are shown but only run when PBFLEET_APPLY=1 is set.

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pbfleet::{Core, CoreSettings, ProgressSink, Role, ServerRecord};

fn server_from_args() -> Result<ServerRecord> {
    let mut args = std::env::args().skip(1);
    let host = args.next().context("usage: fleet_walkthrough <host> [port]")?;
    let port = match args.next() {
        Some(port) => port.parse().context("port must be 1-65535")?,
        None => 22,
    };
    Ok(ServerRecord {
        id: format!("demo-{host}"),
        host,
        port,
        root_username: "root".to_string(),
        app_username: "pocketbase".to_string(),
        security_locked: false,
        use_ssh_agent: true,
        manual_key_path: None,
    })
}

fn print_events(mut rx: mpsc::Receiver<pbfleet::ProgressEvent>) {
    while let Ok(event) = rx.try_recv() {
        println!(
            "  [{:>3}%] {:<20} {:?}: {}",
            event.progress_pct, event.step, event.status, event.message
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger_init();
    let server = server_from_args()?;
    let core = Core::new(CoreSettings::default())?;
    let cancel = CancellationToken::new();

    println!("== connectivity ==");
    for role in [Role::Root, Role::App] {
        let report = core.test_connection(&server, role, &cancel).await?;
        match report.ok {
            true => println!(
                "{role}: ok, {}ms via {}",
                report.latency_ms.unwrap_or_default(),
                report.auth_method.as_deref().unwrap_or("?")
            ),
            false => println!("{role}: failed: {}", report.error.unwrap_or_default()),
        }
    }

    println!("\n== diagnostics ==");
    for check in core.diagnose(&server, Role::Root, &cancel).await? {
        println!(
            "  {:<22} {:?}: {} ({}ms)",
            check.step, check.status, check.message, check.duration_ms
        );
        if let Some(suggestion) = check.suggestion {
            println!("      hint: {suggestion}");
        }
    }

    if std::env::var_os("PBFLEET_APPLY").is_some() {
        println!("\n== server setup ==");
        let (tx, rx) = mpsc::channel(64);
        let outcome = core.run_setup(&server, &ProgressSink::new(tx), &cancel).await;
        print_events(rx);
        if let Err(err) = outcome {
            core.shutdown().await;
            bail!("setup failed: {err}");
        }
    } else {
        println!("\n(set PBFLEET_APPLY=1 to run the setup procedure)");
    }

    println!("\n== pool ==");
    for entry in core.pool_snapshot().await? {
        println!(
            "  {} status={:?} uses={} errors={} avg={:?}ms",
            entry.key,
            entry.status,
            entry.total_uses,
            entry.total_errors,
            entry.rolling_avg_response_ms
        );
    }

    core.shutdown().await;
    Ok(())
}

fn env_logger_init() {
    // Keep the demo dependency-light: route log records to stderr.
    struct StderrLogger;
    impl log::Log for StderrLogger {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::Level::Info
        }
        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                eprintln!("[{}] {}", record.level(), record.args());
            }
        }
        fn flush(&self) {}
    }
    static LOGGER: StderrLogger = StderrLogger;
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(log::LevelFilter::Info));
}
