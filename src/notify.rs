// Fire-and-forget notifications to users
//
// Delivery (push, email, chat) belongs to another service. The engine
// hands each message to a `Notifier` after its commit and only logs a
// failure; nothing is ever rolled back because a message was lost.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::Selector;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// To an event's creator when someone else stakes on it
    NewStake {
        recipient: String,
        event_id: String,
        staker: String,
        selector: Selector,
        amount: Decimal,
    },
    Won {
        recipient: String,
        event_id: String,
        staked: Decimal,
        payout: Decimal,
    },
    Lost {
        recipient: String,
        event_id: String,
        staked: Decimal,
    },
    /// To an event's creator when a resolution is disputed
    DisputeFiled {
        recipient: String,
        event_id: String,
        filer: String,
        reason: String,
    },
}

impl Notification {
    pub fn recipient(&self) -> &str {
        match self {
            Notification::NewStake { recipient, .. }
            | Notification::Won { recipient, .. }
            | Notification::Lost { recipient, .. }
            | Notification::DisputeFiled { recipient, .. } => recipient,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(notification).map_err(|e| NotifyError(e.to_string()))?;
        tracing::info!(target: "notify", recipient = notification.recipient(), "🔔 {}", payload);
        Ok(())
    }
}

/// Keeps notifications in memory. `failing()` rejects every message
/// after recording it.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { sent: Mutex::new(Vec::new()), fail: true }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.recipient() == recipient)
            .cloned()
            .collect()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().push(notification.clone());
        if self.fail {
            return Err(NotifyError("delivery disabled".to_string()));
        }
        Ok(())
    }
}
