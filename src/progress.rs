//! Progress event stream contract for multi-step procedures.
//!
//! Events flow out on a caller-supplied bounded channel. The core only ever
//! writes: a full channel drops the event rather than blocking, and the
//! channel is never closed from this side. Within one procedure run
//! `progress_pct` is monotonically non-decreasing and the terminal event is
//! `success` or `failed` at 100.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Outcome attached to a single progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Skipped,
    Warning,
}

/// One progress report from a running procedure.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProgressEvent {
    /// Step name, stable per procedure.
    pub step: String,
    pub status: StepStatus,
    /// Human-readable summary of what happened.
    pub message: String,
    /// Optional expanded detail (command output, error text).
    #[serde(default)]
    pub details: Option<String>,
    /// Completed share of the procedure, 0-100.
    pub progress_pct: u8,
    /// Milliseconds since the Unix epoch.
    pub ts_ms: u128,
}

impl ProgressEvent {
    pub fn new(step: &str, status: StepStatus, message: impl Into<String>, pct: u8) -> Self {
        Self {
            step: step.to_string(),
            status,
            message: message.into(),
            details: None,
            progress_pct: pct.min(100),
            ts_ms: now_ms(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Caller-owned progress channel wrapper with non-blocking sends.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    /// Wrap a caller-supplied channel.
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards every event. Used when the caller does not
    /// observe progress (service ops, direct execute).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit an event. Drops it when the channel is full or gone.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            if let Err(err) = tx.try_send(event) {
                log::debug!("progress event dropped: {err}");
            }
        }
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_clamped_to_100() {
        let event = ProgressEvent::new("deploy", StepStatus::Success, "done", 250);
        assert_eq!(event.progress_pct, 100);
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ProgressSink::new(tx);

        sink.emit(ProgressEvent::new("a", StepStatus::Running, "first", 0));
        // Channel capacity is 1: this send must be dropped, not block.
        sink.emit(ProgressEvent::new("b", StepStatus::Running, "second", 0));

        let received = rx.recv().await.expect("first event");
        assert_eq!(received.step, "a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disabled_sink_accepts_events() {
        let sink = ProgressSink::disabled();
        sink.emit(ProgressEvent::new("a", StepStatus::Success, "ok", 100));
    }

    #[test]
    fn event_serializes_with_snake_case_status() {
        let event = ProgressEvent::new("create_user", StepStatus::Running, "starting", 0);
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("\"step\":\"create_user\""));
    }
}
