//! Change and notification fan-out to the UI layer
//!
//! Both streams are hot broadcasts with a bounded buffer per subscriber.
//! Delivery is at-most-once with no replay: a late subscriber only sees
//! events published after it subscribed, and a subscriber that falls more
//! than the buffer behind loses the oldest events (`RecvError::Lagged`).
//! Nothing here is durable; the thread store stays the source of truth.

use crate::email::thread::{ThreadId, ThreadStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// What changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Saved,
    StatusChanged { from: ThreadStatus, to: ThreadStatus },
    LabelsChanged,
    MessageAppended,
    Erased,
    LabelCreated { label: String },
    LabelDeleted { label: String },
}

/// Externally visible state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub thread_id: Option<ThreadId>,
    pub at: DateTime<Utc>,
}

/// Tag consumed by the UI to pick a toast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    Delivered,
    Failed,
    PendingApproval,
    Sending,
    Pending,
    Delayed,
}

impl NotificationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationAction::Delivered => "delivered",
            NotificationAction::Failed => "failed",
            NotificationAction::PendingApproval => "pending_approval",
            NotificationAction::Sending => "sending",
            NotificationAction::Pending => "pending",
            NotificationAction::Delayed => "delayed",
        }
    }
}

impl fmt::Display for NotificationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable delivery notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub action: NotificationAction,
    pub message: String,
    pub thread_id: ThreadId,
}

/// Publisher for both streams
#[derive(Debug, Clone)]
pub struct EmailEvents {
    changes: broadcast::Sender<ChangeEvent>,
    notifications: broadcast::Sender<NotificationEvent>,
}

impl EmailEvents {
    pub fn new(change_buffer: usize, notification_buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(change_buffer.max(1));
        let (notifications, _) = broadcast::channel(notification_buffer.max(1));
        Self {
            changes,
            notifications,
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.notifications.subscribe()
    }

    /// Fire and forget; no subscribers is not an error
    pub fn publish_change(&self, kind: ChangeKind, thread_id: Option<&ThreadId>) {
        let event = ChangeEvent {
            kind,
            thread_id: thread_id.cloned(),
            at: Utc::now(),
        };
        if self.changes.send(event).is_err() {
            tracing::trace!("No change subscribers");
        }
    }

    pub fn notify<S: Into<String>>(&self, action: NotificationAction, thread_id: &ThreadId, message: S) {
        let event = NotificationEvent {
            action,
            message: message.into(),
            thread_id: thread_id.clone(),
        };
        tracing::debug!("Notification {} for {}: {}", action, thread_id, event.message);
        if self.notifications.send(event).is_err() {
            tracing::trace!("No notification subscribers");
        }
    }
}

impl Default for EmailEvents {
    fn default() -> Self {
        Self::new(256, 64)
    }
}
