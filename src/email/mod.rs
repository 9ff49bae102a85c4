//! Email threading and delivery
//!
//! Threads of signed messages live in one folder each on disk. A thread moves
//! through a folder state machine (draft, outbox, sent/failed, archive, spam,
//! trash) and outbound threads are reconciled against delivery status
//! notifications (DSNs) reported asynchronously by the relay station.

pub mod attachments;
pub mod collaborators;
pub mod contacts;
pub mod coordinator;
pub mod events;
pub mod locks;
pub mod message;
pub mod outbox;
pub mod retry;
pub mod store;
pub mod thread;

pub use attachments::{AttachmentBatch, AttachmentLimits, AttachmentStore, RejectedAttachment};
pub use collaborators::{
    Contact, ContactService, DeliveryTransport, DsnEvent, DsnOutcome, Identity, IdentityKey,
    MessageSigner, OfflineTransport, Profile, ProfileService,
};
pub use contacts::{FrequentContact, FrequentContacts};
pub use coordinator::{
    AccountChange, ComposeRequest, ConnectionStatus, CoordinatorSettings, DraftReceipt,
    EmailCoordinator, SendReceipt, StationAccount,
};
pub use events::{ChangeEvent, ChangeKind, EmailEvents, NotificationAction, NotificationEvent};
pub use locks::ThreadLocks;
pub use message::{AttachmentKind, Attachments, Message};
pub use outbox::{OutboxProcessor, OutboxReport, OutboxSettings};
pub use retry::RetryPolicy;
pub use store::{Folder, ThreadStore};
pub use thread::{
    Actor, DeliveryState, Priority, Thread, ThreadId, ThreadStatus, DRAFT_RECIPIENT, NO_SUBJECT,
};

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the email subsystem
#[derive(Error, Debug)]
pub enum EmailError {
    /// Storage I/O failure; the thread keeps its last saved state
    #[error("Persistence error at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No identity key available, or the signer refused the content
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Illegal folder move, rejected before any write
    #[error("Cannot move thread {thread_id} from {from} to {to}")]
    InvalidTransition {
        thread_id: String,
        from: ThreadStatus,
        to: String,
    },

    /// Station unreachable or the send was not acknowledged in time
    #[error("Transport error: {0}")]
    Transport(String),

    /// Per-file or cumulative attachment cap exceeded
    #[error("Attachment {name} too large: {size} bytes exceeds limit of {limit} bytes")]
    AttachmentTooLarge { name: String, size: u64, limit: u64 },

    /// Thread missing from the store
    #[error("Thread not found: {0}")]
    NotFound(String),

    /// Edited copy lost messages appended since it was read
    #[error("Thread {0} changed since it was read")]
    Conflict(String),

    /// Label name empty or unknown
    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    /// Recipient list unusable for the requested operation
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Stored data could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EmailError {
    /// Wrap an I/O error with the path it happened on
    pub fn persistence<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        EmailError::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Create a new signing error
    pub fn signing<S: Into<String>>(msg: S) -> Self {
        EmailError::Signing(msg.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        EmailError::Transport(msg.into())
    }

    /// Whether the outbox should keep retrying after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmailError::Transport(_) | EmailError::Persistence { .. })
    }
}

pub type EmailResult<T> = Result<T, EmailError>;
