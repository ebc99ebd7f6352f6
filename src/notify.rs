//! Notification requests, read-tracking records and the fire-and-forget dispatcher.
//!
//! The engine never waits on delivery. Requests are handed to a [`Notifier`]
//! after the approval transaction commits; the [`NotificationDispatcher`]
//! retries failed deliveries with backoff on its own task.
use crate::types::{TimeStamp, UserId};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
#[serde(rename_all = "snake_case")]
#[cbor(index_only)]
pub enum NotificationEvent {
    #[n(0)]
    ApprovalRequested,
    #[n(1)]
    Delegated,
    #[n(2)]
    Overdue,
    #[n(3)]
    Escalated,
    #[n(4)]
    Approved,
    #[n(5)]
    Rejected,
    #[n(6)]
    Cancelled,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::ApprovalRequested => "approval_requested",
            NotificationEvent::Delegated => "delegated",
            NotificationEvent::Overdue => "overdue",
            NotificationEvent::Escalated => "escalated",
            NotificationEvent::Approved => "approved",
            NotificationEvent::Rejected => "rejected",
            NotificationEvent::Cancelled => "cancelled",
        }
    }
}

/// One delivery request handed to the notification transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub notification_id: u64,
    pub recipient_id: UserId,
    pub event: NotificationEvent,
    pub payload: serde_json::Value,
}

/// Read-tracking record; delivery itself is the transport's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct ApprovalNotification {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub instance_id: u64,
    #[n(2)]
    pub recipient_id: UserId,
    #[n(3)]
    pub event: NotificationEvent,
    #[n(4)]
    pub is_read: bool,
    #[n(5)]
    pub created_at: TimeStamp,
}

/// Engine-facing side of notification delivery. Must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, request: NotificationRequest);
}

/// Actual delivery (email, SMS, push). Owned by another system.
pub trait DeliveryTransport: Send + Sync {
    fn deliver(&self, request: &NotificationRequest) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1u32 << exp)
    }
}

/// Queue in front of a [`DeliveryTransport`]. Cheap to clone.
#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::UnboundedSender<NotificationRequest>,
}

impl NotificationDispatcher {
    /// Starts the delivery task on the current tokio runtime.
    pub fn spawn(transport: Arc<dyn DeliveryTransport>, policy: RetryPolicy) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(delivery_loop(receiver, transport, policy));
        (Self { sender }, handle)
    }
}

impl Notifier for NotificationDispatcher {
    fn notify(&self, request: NotificationRequest) {
        if let Err(e) = self.sender.send(request) {
            warn!(
                notification_id = e.0.notification_id,
                recipient_id = e.0.recipient_id,
                "Notification queue closed, request dropped"
            );
        }
    }
}

async fn delivery_loop(
    mut receiver: mpsc::UnboundedReceiver<NotificationRequest>,
    transport: Arc<dyn DeliveryTransport>,
    policy: RetryPolicy,
) {
    while let Some(request) = receiver.recv().await {
        let transport = transport.clone();
        tokio::spawn(async move {
            deliver_with_retry(transport.as_ref(), &request, policy).await;
        });
    }
    debug!("Notification queue drained and closed");
}

/// Attempts delivery up to `policy.max_attempts` times. Returns whether it succeeded.
pub async fn deliver_with_retry(
    transport: &dyn DeliveryTransport,
    request: &NotificationRequest,
    policy: RetryPolicy,
) -> bool {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match transport.deliver(request) {
            Ok(()) => {
                debug!(
                    notification_id = request.notification_id,
                    recipient_id = request.recipient_id,
                    event = request.event.as_str(),
                    attempt,
                    "Notification delivered"
                );
                return true;
            }
            Err(e) if attempt < attempts => {
                warn!(
                    notification_id = request.notification_id,
                    attempt,
                    error = %e,
                    "Notification delivery failed, retrying"
                );
                tokio::time::sleep(policy.backoff(attempt)).await;
            }
            Err(e) => {
                error!(
                    notification_id = request.notification_id,
                    recipient_id = request.recipient_id,
                    attempts,
                    error = %e,
                    "Notification delivery abandoned"
                );
            }
        }
    }
    false
}

/// Writes deliveries to the log.
#[derive(Debug, Default)]
pub struct LogTransport;

impl DeliveryTransport for LogTransport {
    fn deliver(&self, request: &NotificationRequest) -> anyhow::Result<()> {
        tracing::info!(
            notification_id = request.notification_id,
            recipient_id = request.recipient_id,
            event = request.event.as_str(),
            payload = %request.payload,
            "Notification"
        );
        Ok(())
    }
}

/// Collects requests in memory instead of delivering them.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    requests: Mutex<Vec<NotificationRequest>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<NotificationRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn recipients_of(&self, event: NotificationEvent) -> Vec<UserId> {
        self.requests()
            .into_iter()
            .filter(|r| r.event == event)
            .map(|r| r.recipient_id)
            .collect()
    }

    pub fn clear(&self) {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, request: NotificationRequest) {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
    }
}
