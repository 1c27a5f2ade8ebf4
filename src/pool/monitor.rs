//! Background health monitoring for pooled transports.
//!
//! A single long-lived task sweeps the pool on a fixed tick, probing each
//! entry with its own timeout and reclassifying it from the result. The
//! monitor never mutates the pool map: failed entries are pushed onto the
//! pool's eviction queue and removed at the next cleanup tick. Recovery is
//! explicit, requested through [`HealthMonitor::recover`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::OpsError;
use crate::server::{Role, ServerRecord};
use crate::transport::Dialer;

use super::{ConnectionStatus, Pool, PoolKey, PooledEntry, status_for_failures};

/// Observer notifications emitted by the monitor. Best-effort: a full
/// channel drops the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A previously non-healthy entry probed successfully.
    Recovered { key: String },
    /// An entry failed a probe and was reclassified.
    ProbeFailed {
        key: String,
        status: ConnectionStatus,
        consecutive_failures: u32,
    },
    /// An entry reached the failure bound and was queued for eviction.
    EvictionScheduled { key: String },
}

/// Periodic prober and explicit recovery entry point.
pub struct HealthMonitor {
    pool: Arc<Pool>,
    dialer: Arc<dyn Dialer>,
    probe_timeout: Duration,
    events: Option<mpsc::Sender<MonitorEvent>>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<Pool>, dialer: Arc<dyn Dialer>, probe_timeout: Duration) -> Self {
        Self {
            pool,
            dialer,
            probe_timeout,
            events: None,
        }
    }

    /// Attach an observer channel for recovered/failed notifications.
    pub fn with_events(mut self, events: mpsc::Sender<MonitorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Spawn the monitor loop. It stops when `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, tick: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::debug!("health monitor started, tick {}s", tick.as_secs());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(tick) => self.sweep(&shutdown).await,
                }
            }
            log::debug!("health monitor stopped");
        })
    }

    /// Probe every pooled entry once.
    ///
    /// The entry set is snapshotted under the read lock and released before
    /// any I/O; only each entry's own mutex is held while probing it.
    pub async fn sweep(&self, cancel: &CancellationToken) {
        for entry in self.pool.entries_snapshot().await {
            if cancel.is_cancelled() {
                return;
            }
            self.probe_entry(&entry, cancel).await;
        }
    }

    async fn probe_entry(&self, entry: &Arc<PooledEntry>, cancel: &CancellationToken) {
        let mut state = entry.state.lock().await;
        if state.status == ConnectionStatus::Recovering {
            return;
        }

        let started = Instant::now();
        let probed = if state.transport.is_open() {
            state.transport.probe(self.probe_timeout, cancel).await
        } else {
            Err(OpsError::TransportUnhealthy {
                key: entry.key().to_string(),
                status: "closed".to_string(),
            })
        };

        match probed {
            Ok(_) => {
                state.record_latency(started.elapsed());
                let was = state.status;
                state.consecutive_failures = 0;
                state.status = ConnectionStatus::Healthy;
                if was != ConnectionStatus::Healthy {
                    log::info!("transport {} recovered (was {})", entry.key(), was.as_str());
                    self.emit(MonitorEvent::Recovered {
                        key: entry.key().to_string(),
                    });
                }
            }
            Err(OpsError::Cancelled) => {}
            Err(err) => {
                state.consecutive_failures += 1;
                state.total_errors += 1;
                state.status = status_for_failures(state.consecutive_failures);
                log::warn!(
                    "probe failed for {} ({} consecutive): {err}",
                    entry.key(),
                    state.consecutive_failures
                );
                self.emit(MonitorEvent::ProbeFailed {
                    key: entry.key().to_string(),
                    status: state.status,
                    consecutive_failures: state.consecutive_failures,
                });
                if state.status == ConnectionStatus::Failed {
                    state.transport.close().await;
                    self.pool.schedule_evict(entry.key().clone());
                    self.emit(MonitorEvent::EvictionScheduled {
                        key: entry.key().to_string(),
                    });
                }
            }
        }
    }

    /// Close and re-dial the transport for `(server, role)`.
    ///
    /// The entry's mutex is held for the whole attempt, so at most one
    /// recovery runs per key; concurrent acquires wait on the same lock.
    pub async fn recover(
        &self,
        server: &ServerRecord,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<(), OpsError> {
        let key = PoolKey::for_server(server, role);
        let Some(entry) = self
            .pool
            .entries_snapshot()
            .await
            .into_iter()
            .find(|entry| entry.key() == &key)
        else {
            // Nothing pooled for the key; the next acquire dials fresh.
            return Ok(());
        };

        let mut state = entry.state.lock().await;
        state.status = ConnectionStatus::Recovering;
        state.transport.close().await;
        log::info!("recovering transport {key}");

        match self.dialer.dial(server, role, cancel).await {
            Ok(transport) => {
                state.transport = transport;
                state.status = ConnectionStatus::Healthy;
                state.consecutive_failures = 0;
                state.last_used = Instant::now();
                self.emit(MonitorEvent::Recovered {
                    key: key.to_string(),
                });
                Ok(())
            }
            Err(err) => {
                state.status = ConnectionStatus::Failed;
                self.pool.schedule_evict(key.clone());
                self.emit(MonitorEvent::EvictionScheduled {
                    key: key.to_string(),
                });
                Err(err)
            }
        }
    }

    fn emit(&self, event: MonitorEvent) {
        if let Some(events) = &self.events {
            if let Err(err) = events.try_send(event) {
                log::debug!("monitor event dropped: {err}");
            }
        }
    }
}
