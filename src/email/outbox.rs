//! Outbox delivery and DSN reconciliation
//!
//! A transport accepting a thread only means the station queued it. The
//! thread stays `pending` until a DSN for the current attempt reports the
//! outcome. Transport failures are absorbed here: the thread stays in the
//! outbox, the UI gets a `delayed` notification, and only after the retry
//! policy is exhausted does the thread move to `failed`. Errors that no
//! retry can fix (see `EmailError::is_retryable`) fail the thread at once.

use crate::email::collaborators::{DeliveryTransport, DsnEvent, DsnOutcome};
use crate::email::events::{ChangeKind, EmailEvents, NotificationAction};
use crate::email::locks::ThreadLocks;
use crate::email::retry::RetryPolicy;
use crate::email::store::ThreadStore;
use crate::email::thread::{Actor, Thread, ThreadId, ThreadStatus};
use crate::email::{EmailError, EmailResult};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Timing knobs for delivery attempts
#[derive(Debug, Clone)]
pub struct OutboxSettings {
    /// How long to wait for the transport to acknowledge a send
    pub send_timeout: Duration,
    /// How long an accepted attempt may wait for its DSN before resending
    pub dsn_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(15),
            dsn_timeout: Duration::from_secs(10 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Counts from one outbox pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxReport {
    pub accepted: usize,
    pub delayed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// What happened to one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Accepted,
    Delayed,
    Failed,
    Skipped,
}

/// Why an attempt is being made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Periodic pass; honours backoff and DSN wait
    Scheduled,
    /// A station came back; backoff no longer applies
    Reconnect,
    /// Explicit send of one thread
    Immediate,
}

/// Sends pending threads and applies DSNs
#[derive(Clone)]
pub struct OutboxProcessor {
    store: Arc<ThreadStore>,
    transport: Arc<dyn DeliveryTransport>,
    events: EmailEvents,
    locks: ThreadLocks,
    settings: OutboxSettings,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<ThreadStore>,
        transport: Arc<dyn DeliveryTransport>,
        events: EmailEvents,
        locks: ThreadLocks,
        settings: OutboxSettings,
    ) -> Self {
        Self {
            store,
            transport,
            events,
            locks,
            settings,
        }
    }

    pub fn settings(&self) -> &OutboxSettings {
        &self.settings
    }

    /// One pass over every pending thread
    ///
    /// Threads another attempt is working on, threads still backing off and
    /// threads waiting for a DSN are skipped.
    pub async fn process_outbox(&self) -> OutboxReport {
        self.run_pass(Trigger::Scheduled).await
    }

    /// Pass right after a station became reachable, ignoring backoff
    pub async fn process_after_reconnect(&self) -> OutboxReport {
        self.run_pass(Trigger::Reconnect).await
    }

    async fn run_pass(&self, trigger: Trigger) -> OutboxReport {
        let pending = self.store.outbox().await;
        let mut report = OutboxReport::default();

        for thread in pending {
            let Some(_guard) = self.locks.try_lock(thread.id()) else {
                debug!("Thread {} has an attempt in flight", thread.id());
                report.skipped += 1;
                continue;
            };

            match self.attempt_locked(thread.id(), trigger).await {
                Ok(Attempt::Accepted) => report.accepted += 1,
                Ok(Attempt::Delayed) => report.delayed += 1,
                Ok(Attempt::Failed) => report.failed += 1,
                Ok(Attempt::Skipped) => report.skipped += 1,
                Err(e) => {
                    error!("Outbox attempt for {} failed: {}", thread.id(), e);
                    report.errors += 1;
                }
            }
        }

        if report != OutboxReport::default() {
            info!(
                "Outbox pass: {} accepted, {} delayed, {} failed, {} skipped, {} errors",
                report.accepted, report.delayed, report.failed, report.skipped, report.errors
            );
        }
        report
    }

    /// Immediate attempt for one thread, ignoring backoff
    ///
    /// Returns whether the station accepted the thread for relay. `false`
    /// also covers an attempt already in flight for this thread.
    pub async fn attempt(&self, id: &ThreadId) -> EmailResult<bool> {
        let Some(_guard) = self.locks.try_lock(id) else {
            debug!("Immediate send of {} skipped, attempt in flight", id);
            return Ok(false);
        };

        let thread = self
            .store
            .get(id)
            .await
            .ok_or_else(|| EmailError::NotFound(id.to_string()))?;
        if thread.status() != ThreadStatus::Pending {
            return Err(EmailError::InvalidTransition {
                thread_id: id.to_string(),
                from: thread.status(),
                to: "sending".to_string(),
            });
        }

        Ok(self.attempt_locked(id, Trigger::Immediate).await? == Attempt::Accepted)
    }

    /// Caller holds the thread lock
    async fn attempt_locked(&self, id: &ThreadId, trigger: Trigger) -> EmailResult<Attempt> {
        let Some(mut thread) = self.store.get(id).await else {
            return Ok(Attempt::Skipped);
        };
        if thread.status() != ThreadStatus::Pending {
            return Ok(Attempt::Skipped);
        }

        let now = Utc::now();
        if trigger == Trigger::Scheduled {
            if let Some(next) = thread.delivery.next_attempt_at {
                if next > now {
                    debug!("Thread {} backing off until {}", id, next);
                    return Ok(Attempt::Skipped);
                }
            }
        }
        if trigger != Trigger::Immediate {
            if let Some(accepted) = thread.delivery.accepted_at {
                let waited = (now - accepted).to_std().unwrap_or(Duration::ZERO);
                if waited < self.settings.dsn_timeout {
                    debug!("Thread {} waiting for DSN", id);
                    return Ok(Attempt::Skipped);
                }
                warn!("No DSN for thread {} after {:?}, sending again", id, waited);
            }
        }

        let seq = thread.delivery.begin_attempt();
        self.store.save(&thread).await?;
        debug!("Sending thread {} (attempt {})", id, seq);

        let outcome = tokio::time::timeout(self.settings.send_timeout, self.transport.send(&thread)).await;
        let mut permanent = false;
        let reason = match outcome {
            Ok(Ok(true)) => {
                thread.delivery.accepted_at = Some(Utc::now());
                thread.delivery.failed_passes = 0;
                thread.delivery.next_attempt_at = None;
                self.store.save(&thread).await?;
                self.events.notify(
                    NotificationAction::Sending,
                    id,
                    format!("Sending \"{}\" to {}", thread.subject, recipients(&thread)),
                );
                return Ok(Attempt::Accepted);
            }
            Ok(Ok(false)) => "station did not accept the thread".to_string(),
            Ok(Err(e)) => {
                permanent = !e.is_retryable();
                e.to_string()
            }
            Err(_) => format!("no acknowledgement within {:?}", self.settings.send_timeout),
        };

        thread.delivery.failed_passes += 1;
        let passes = thread.delivery.failed_passes;
        warn!("Attempt {} for thread {} not accepted: {}", seq, id, reason);

        if permanent || self.settings.retry.is_exhausted(passes) {
            if let Err(from) = thread.transition(ThreadStatus::Failed, Actor::Delivery) {
                warn!("Thread {} left {} before it could fail", id, from);
                return Ok(Attempt::Skipped);
            }
            thread.delivery.next_attempt_at = None;
            self.store.save(&thread).await?;
            self.events.publish_change(
                ChangeKind::StatusChanged {
                    from: ThreadStatus::Pending,
                    to: ThreadStatus::Failed,
                },
                Some(id),
            );
            self.events.notify(
                NotificationAction::Failed,
                id,
                format!(
                    "Could not deliver \"{}\" after {} attempts: {}",
                    thread.subject, passes, reason
                ),
            );
            return Ok(Attempt::Failed);
        }

        thread.delivery.next_attempt_at = Some(self.settings.retry.next_attempt_at(Utc::now(), passes));
        self.store.save(&thread).await?;
        self.events.notify(
            NotificationAction::Delayed,
            id,
            format!("Still trying to send \"{}\": {}", thread.subject, reason),
        );
        Ok(Attempt::Delayed)
    }

    /// Apply DSNs from a transport stream until it closes
    ///
    /// Each thread gets its own chain of tasks: reports for one thread are
    /// applied in arrival order, and a thread whose lock is held by a send
    /// only delays its own reports.
    pub async fn apply_dsn_stream(&self, mut stream: mpsc::UnboundedReceiver<DsnEvent>) {
        let mut lanes: HashMap<ThreadId, JoinHandle<()>> = HashMap::new();

        while let Some(event) = stream.recv().await {
            lanes.retain(|_, lane| !lane.is_finished());
            let id = event.thread_id.clone();
            let previous = lanes.remove(&id);
            let outbox = self.clone();
            let lane = tokio::spawn(async move {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                if let Err(e) = outbox.apply_dsn(event).await {
                    error!("Failed to apply DSN: {}", e);
                }
            });
            lanes.insert(id, lane);
        }

        debug!("DSN stream closed");
        for (_, lane) in lanes {
            let _ = lane.await;
        }
    }

    /// Reconcile one DSN; returns the new status if it changed
    ///
    /// Only a `delivered` report may resolve a superseded attempt: the
    /// message did arrive, whichever copy made it. Any other outcome for a
    /// superseded attempt is discarded, so a late failure never overrides a
    /// newer result.
    pub async fn apply_dsn(&self, event: DsnEvent) -> EmailResult<Option<ThreadStatus>> {
        let id = &event.thread_id;
        let _guard = self.locks.lock(id).await;

        let Some(mut thread) = self.store.get(id).await else {
            warn!("DSN for unknown thread {}", id);
            return Ok(None);
        };
        if !thread.delivery.was_issued(event.attempt_seq) {
            warn!(
                "DSN for {} names attempt {} which was never made",
                id, event.attempt_seq
            );
            return Ok(None);
        }
        if thread.status() != ThreadStatus::Pending {
            debug!("Ignoring DSN for {} in status {}", id, thread.status());
            return Ok(None);
        }
        if thread.delivery.is_superseded(event.attempt_seq) && event.outcome != DsnOutcome::Delivered {
            debug!(
                "Discarding stale DSN for {} (attempt {}, current {})",
                id, event.attempt_seq, thread.delivery.attempt_seq
            );
            return Ok(None);
        }

        let (target, action, message) = match &event.outcome {
            DsnOutcome::Delivered => (
                Some(ThreadStatus::Sent),
                NotificationAction::Delivered,
                format!("\"{}\" delivered to {}", thread.subject, recipients(&thread)),
            ),
            DsnOutcome::Failed { reason } => (
                Some(ThreadStatus::Failed),
                NotificationAction::Failed,
                format!("\"{}\" could not be delivered: {}", thread.subject, reason),
            ),
            DsnOutcome::PendingApproval => (
                None,
                NotificationAction::PendingApproval,
                format!("\"{}\" is waiting for approval", thread.subject),
            ),
            DsnOutcome::Sending => (
                None,
                NotificationAction::Sending,
                format!("\"{}\" is being relayed", thread.subject),
            ),
            DsnOutcome::Pending => (
                None,
                NotificationAction::Pending,
                format!("\"{}\" is queued at the station", thread.subject),
            ),
            DsnOutcome::Delayed => (
                None,
                NotificationAction::Delayed,
                format!("Delivery of \"{}\" is delayed", thread.subject),
            ),
        };

        let Some(target) = target else {
            self.events.notify(action, id, message);
            return Ok(None);
        };

        if let Err(from) = thread.transition(target, Actor::Delivery) {
            warn!("DSN cannot move thread {} from {} to {}", id, from, target);
            return Ok(None);
        }
        thread.delivery.last_dsn_seq = Some(event.attempt_seq);
        thread.delivery.next_attempt_at = None;
        self.store.save(&thread).await?;

        info!("Thread {} is now {}", id, target);
        self.events.publish_change(
            ChangeKind::StatusChanged {
                from: ThreadStatus::Pending,
                to: target,
            },
            Some(id),
        );
        self.events.notify(action, id, message);
        Ok(Some(target))
    }
}

fn recipients(thread: &Thread) -> String {
    let all: Vec<&str> = thread.real_recipients().map(String::as_str).collect();
    if all.is_empty() {
        "nobody".to_string()
    } else {
        all.join(", ")
    }
}
