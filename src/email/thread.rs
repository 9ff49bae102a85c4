use crate::email::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Placeholder recipient for drafts that are not yet addressed
pub const DRAFT_RECIPIENT: &str = "(draft)";

/// Subject stored for threads saved without one
pub const NO_SUBJECT: &str = "(No Subject)";

/// Width of the base-36 millisecond part of a thread id
const TIMESTAMP_WIDTH: usize = 9;
/// Width of the base-36 tie-breaker part of a thread id
const TIEBREAK_WIDTH: usize = 4;
/// Distinct tie-breakers per millisecond (36^4)
const TIEBREAK_SPACE: u64 = 1_679_616;

static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Sortable, time-derived thread identity
///
/// Millisecond timestamp and a per-process tie-breaker, both base-36 and
/// zero padded, so string order matches creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    /// Generate a fresh id for the current instant
    pub fn generate() -> Self {
        Self::generate_at(Utc::now())
    }

    /// Generate an id for the given instant, never repeating within the process
    pub fn generate_at(now: DateTime<Utc>) -> Self {
        let floor = (now.timestamp_millis().max(0) as u64).saturating_mul(TIEBREAK_SPACE);
        let mut prev = LAST_ID.load(Ordering::Relaxed);
        let next = loop {
            let candidate = floor.max(prev + 1);
            match LAST_ID.compare_exchange_weak(prev, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break candidate,
                Err(actual) => prev = actual,
            }
        };

        let millis = next / TIEBREAK_SPACE;
        let tiebreak = next % TIEBREAK_SPACE;
        ThreadId(format!(
            "{}{}",
            to_base36(millis, TIMESTAMP_WIDTH),
            to_base36(tiebreak, TIEBREAK_WIDTH)
        ))
    }

    /// Wrap an id read from storage or the wire
    pub fn from_string<S: Into<String>>(id: S) -> Self {
        ThreadId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn to_base36(mut value: u64, width: usize) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::with_capacity(width);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    while out.len() < width {
        out.push(b'0');
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Thread priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Who is asking for a status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// Folder moves issued from the UI or CLI
    User,
    /// Outbox processor and DSN reconciliation
    Delivery,
}

/// Thread status; folder membership is derived from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Draft,
    Pending,
    Sent,
    Received,
    Failed,
    Spam,
    Archived,
    Deleted,
}

impl ThreadStatus {
    pub const ALL: [ThreadStatus; 8] = [
        ThreadStatus::Draft,
        ThreadStatus::Pending,
        ThreadStatus::Sent,
        ThreadStatus::Received,
        ThreadStatus::Failed,
        ThreadStatus::Spam,
        ThreadStatus::Archived,
        ThreadStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Draft => "draft",
            ThreadStatus::Pending => "pending",
            ThreadStatus::Sent => "sent",
            ThreadStatus::Received => "received",
            ThreadStatus::Failed => "failed",
            ThreadStatus::Spam => "spam",
            ThreadStatus::Archived => "archived",
            ThreadStatus::Deleted => "deleted",
        }
    }

    /// Legal transition table
    pub fn can_transition(self, to: ThreadStatus, actor: Actor) -> bool {
        use ThreadStatus::*;
        match actor {
            Actor::Delivery => matches!((self, to), (Pending, Sent) | (Pending, Failed)),
            Actor::User => matches!(
                (self, to),
                (Draft, Pending)
                    | (Draft, Deleted)
                    | (Failed, Pending)
                    | (Failed, Deleted)
                    | (Received, Archived)
                    | (Received, Spam)
                    | (Received, Deleted)
                    | (Sent, Archived)
                    | (Sent, Deleted)
                    | (Archived, Received)
                    | (Archived, Spam)
                    | (Archived, Deleted)
                    | (Spam, Received)
                    | (Spam, Deleted)
                    | (Deleted, Received)
            ),
        }
    }

    /// Only trashed threads may be erased for good
    pub fn can_erase(self) -> bool {
        self == ThreadStatus::Deleted
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ThreadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ThreadStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown thread status: {}", s))
    }
}

/// Delivery bookkeeping for outbound threads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryState {
    /// Sequence number of the most recent send attempt
    pub attempt_seq: u64,
    /// Sequence number carried by the last DSN that was applied
    pub last_dsn_seq: Option<u64>,
    /// Consecutive passes where the transport did not accept the thread
    pub failed_passes: u32,
    /// Earliest time the outbox may try again
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the transport last accepted the thread for relay
    pub accepted_at: Option<DateTime<Utc>>,
}

impl DeliveryState {
    /// Start a new attempt and return its sequence number
    pub fn begin_attempt(&mut self) -> u64 {
        self.attempt_seq += 1;
        self.accepted_at = None;
        self.attempt_seq
    }

    /// Clear retry bookkeeping when a failed thread is queued again
    pub fn reset_for_retry(&mut self) {
        self.failed_passes = 0;
        self.next_attempt_at = None;
        self.accepted_at = None;
    }

    /// Whether `seq` names an attempt this client actually made
    pub fn was_issued(&self, seq: u64) -> bool {
        seq >= 1 && seq <= self.attempt_seq
    }

    /// Whether a newer attempt has been made since `seq`
    pub fn is_superseded(&self, seq: u64) -> bool {
        seq < self.attempt_seq
    }
}

/// A conversation of signed messages sharing recipients and subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    id: ThreadId,
    pub station: String,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub priority: Priority,
    status: ThreadStatus,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    pub delivery: DeliveryState,
}

impl Thread {
    /// Start a new draft owned by `station`
    pub fn new_draft<S: Into<String>>(station: S, from: S, subject: S) -> Self {
        Self::with_status(station.into(), from.into(), subject.into(), ThreadStatus::Draft)
    }

    /// Thread as it arrived from a station
    pub fn new_received<S: Into<String>>(station: S, from: S, subject: S) -> Self {
        Self::with_status(station.into(), from.into(), subject.into(), ThreadStatus::Received)
    }

    fn with_status(station: String, from: String, subject: String, status: ThreadStatus) -> Self {
        let created = Utc::now();
        Self {
            id: ThreadId::generate_at(created),
            station,
            from,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject,
            priority: Priority::Normal,
            status,
            created,
            labels: BTreeSet::new(),
            messages: Vec::new(),
            delivery: DeliveryState::default(),
        }
    }

    pub fn id(&self) -> &ThreadId {
        &self.id
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append a message; messages are never removed individually
    pub fn append_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// In-place access for signing draft bodies; length cannot change
    pub(crate) fn messages_mut(&mut self) -> &mut [Message] {
        &mut self.messages
    }

    /// Reconcile an edited copy with the stored version of the same thread
    ///
    /// Delivery bookkeeping is owned by the outbox and always comes from
    /// `stored`. The copy may add messages but never drop any: a copy taken
    /// before later appends keeps the stored list. Returns `false` when both
    /// sides appended different messages.
    pub(crate) fn rebase_onto(&mut self, stored: &Thread) -> bool {
        self.delivery = stored.delivery.clone();
        if self.messages.starts_with(&stored.messages) {
            true
        } else if stored.messages.starts_with(&self.messages) {
            self.messages = stored.messages.clone();
            true
        } else {
            false
        }
    }

    /// Move to `to` if the transition table allows it
    pub fn transition(&mut self, to: ThreadStatus, actor: Actor) -> Result<ThreadStatus, ThreadStatus> {
        if self.status.can_transition(to, actor) {
            let from = self.status;
            self.status = to;
            Ok(from)
        } else {
            Err(self.status)
        }
    }

    /// Recipients excluding the draft placeholder
    pub fn real_recipients(&self) -> impl Iterator<Item = &String> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .filter(|addr| !is_placeholder(addr))
    }

    /// Everyone on the thread, used for the storage key
    pub fn participants(&self) -> Vec<String> {
        let mut all: Vec<String> = std::iter::once(&self.from)
            .chain(self.to.iter())
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(|addr| addr.trim().to_lowercase())
            .filter(|addr| !addr.is_empty())
            .collect();
        all.sort();
        all.dedup();
        all
    }

    /// Fill in the placeholders a draft is stored with
    pub fn normalize_draft(&mut self) {
        self.to.retain(|addr| !addr.trim().is_empty());
        if self.to.is_empty() {
            self.to.push(DRAFT_RECIPIENT.to_string());
        }
        if self.subject.trim().is_empty() {
            self.subject = NO_SUBJECT.to_string();
        }
    }

    /// Drop the draft placeholder before the thread leaves the drafts folder
    pub fn strip_placeholder(&mut self) {
        self.to.retain(|addr| !is_placeholder(addr) && !addr.trim().is_empty());
    }

    /// Subject without reply/forward prefixes or bracket tags
    pub fn normalized_subject(&self) -> String {
        normalize_subject(&self.subject)
    }
}

fn is_placeholder(addr: &str) -> bool {
    addr.trim() == DRAFT_RECIPIENT
}

/// Strip `Re:`, `Fwd:`, `Fw:` and `[tag]` prefixes
pub fn normalize_subject(subject: &str) -> String {
    let mut normalized = subject.trim().to_string();

    loop {
        let lower = normalized.to_lowercase();
        if lower.starts_with("re:") {
            normalized = normalized[3..].trim().to_string();
        } else if lower.starts_with("fwd:") {
            normalized = normalized[4..].trim().to_string();
        } else if lower.starts_with("fw:") {
            normalized = normalized[3..].trim().to_string();
        } else if normalized.starts_with('[') {
            match normalized.find(']') {
                Some(end) => normalized = normalized[end + 1..].trim().to_string(),
                None => break,
            }
        } else {
            break;
        }
    }

    normalized
}
