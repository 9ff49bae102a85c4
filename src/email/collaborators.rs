//! Capabilities consumed from the rest of the application
//!
//! Signing keys, the station connection, the local profile and the contact
//! book are owned elsewhere; the email core only sees these traits.

use crate::email::thread::{Thread, ThreadId};
use crate::email::{EmailError, EmailResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Secret half of an identity, opaque to this crate
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new<S: Into<String>>(secret: S) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityKey(<redacted>)")
    }
}

/// Read-only profile of the local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub callsign: String,
    pub npub: String,
    pub nickname: String,
}

/// Who is acting, passed explicitly into coordinator operations
#[derive(Debug, Clone)]
pub struct Identity {
    pub callsign: String,
    pub npub: String,
    pub nickname: String,
    pub key: Option<IdentityKey>,
}

impl Identity {
    pub fn from_profile(profile: Profile, key: Option<IdentityKey>) -> Self {
        Self {
            callsign: profile.callsign,
            npub: profile.npub,
            nickname: profile.nickname,
            key,
        }
    }

    /// Address used in the `from` field of new threads
    pub fn address(&self) -> &str {
        &self.callsign
    }
}

/// Produces a signature over a message's canonical bytes
pub trait MessageSigner: Send + Sync {
    fn sign(&self, canonical: &[u8], key: &IdentityKey) -> EmailResult<String>;
}

/// Outcome reported by the relay for one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DsnOutcome {
    Delivered,
    Failed { reason: String },
    PendingApproval,
    Sending,
    Pending,
    Delayed,
}

/// Delivery status notification correlated by thread and attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsnEvent {
    pub thread_id: ThreadId,
    pub outcome: DsnOutcome,
    pub attempt_seq: u64,
}

impl DsnEvent {
    pub fn new(thread_id: ThreadId, outcome: DsnOutcome, attempt_seq: u64) -> Self {
        Self {
            thread_id,
            outcome,
            attempt_seq,
        }
    }
}

/// Channel to a relay station
///
/// `send` answers whether the station accepted the thread for relay, which is
/// not delivery. The attempt sequence number to echo back in DSNs is
/// `thread.delivery.attempt_seq`.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn send(&self, thread: &Thread) -> EmailResult<bool>;

    /// Hand over the DSN stream; only the first caller gets it
    fn take_dsn_stream(&self) -> Option<mpsc::UnboundedReceiver<DsnEvent>>;
}

/// Transport used when no station is configured
#[derive(Debug, Default, Clone)]
pub struct OfflineTransport;

#[async_trait]
impl DeliveryTransport for OfflineTransport {
    async fn send(&self, thread: &Thread) -> EmailResult<bool> {
        Err(EmailError::transport(format!(
            "no station reachable for {}",
            thread.station
        )))
    }

    fn take_dsn_stream(&self) -> Option<mpsc::UnboundedReceiver<DsnEvent>> {
        None
    }
}

/// Identity lookup for composing `from`
pub trait ProfileService: Send + Sync {
    fn profile(&self) -> Profile;
}

/// Entry of the application's contact book
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub name: String,
    pub address: String,
}

/// Read-only contact list used for recipient suggestions
pub trait ContactService: Send + Sync {
    fn contacts(&self) -> Vec<Contact>;
}
