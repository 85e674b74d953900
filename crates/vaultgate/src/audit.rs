use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Only `RateLimitExceeded` is raised by the gate. The rest are for login and
/// account flows that report through the same sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventType {
    Login,
    Logout,
    Register,
    RefreshToken,
    ChangePassword,
    RateLimitExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure,
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Login => "LOGIN",
            Self::Logout => "LOGOUT",
            Self::Register => "REGISTER",
            Self::RefreshToken => "REFRESH_TOKEN",
            Self::ChangePassword => "CHANGE_PASSWORD",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        })
    }
}

/// A security-relevant decision, as handed to an [`AuditSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub event_type: SecurityEventType,
    /// Client key or username.
    pub subject: String,
    pub client_addr: String,
    pub timestamp_ms: u64,
    pub outcome: Outcome,
}

/// Fire-and-forget consumer of audit events.
///
/// Implementations must not block and must not fail the caller; an
/// unavailable sink simply loses the event.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes each event as a `SECURITY_EVENT` log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match event.outcome {
            Outcome::Success => tracing::info!(
                event_type = %event.event_type,
                subject = %event.subject,
                client_addr = %event.client_addr,
                timestamp_ms = event.timestamp_ms,
                outcome = %event.outcome,
                "SECURITY_EVENT"
            ),
            Outcome::Failure => tracing::warn!(
                event_type = %event.event_type,
                subject = %event.subject,
                client_addr = %event.client_addr,
                timestamp_ms = event.timestamp_ms,
                outcome = %event.outcome,
                "SECURITY_EVENT"
            ),
        }
    }
}

/// Forwards events to a bounded channel, dropping them when it is full or closed.
#[derive(Debug)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
    dropped: AtomicU64,
}

impl ChannelAuditSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events lost because the consumer was behind or gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(dropped, "audit channel full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
