//! Shared test doubles for the integration suites

#![allow(dead_code)]

use async_trait::async_trait;
use stationmail::email::{
    CoordinatorSettings, DeliveryTransport, DsnEvent, EmailCoordinator, EmailError, EmailResult,
    Identity, IdentityKey, MessageSigner, OutboxSettings, RetryPolicy, Thread, ThreadId,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const MIB: usize = 1024 * 1024;

/// Signer that tags the canonical length with the key
pub struct EchoSigner;

impl MessageSigner for EchoSigner {
    fn sign(&self, canonical: &[u8], key: &IdentityKey) -> EmailResult<String> {
        Ok(format!("sig:{}:{}", key.expose(), canonical.len()))
    }
}

/// Transport whose acceptance can be flipped, recording every attempt
pub struct ScriptedTransport {
    pub accept: AtomicBool,
    pub attempts: Mutex<Vec<(ThreadId, u64)>>,
    dsn_tx: mpsc::UnboundedSender<DsnEvent>,
    dsn_rx: Mutex<Option<mpsc::UnboundedReceiver<DsnEvent>>>,
}

impl ScriptedTransport {
    pub fn new(accept: bool) -> Arc<Self> {
        let (dsn_tx, dsn_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            accept: AtomicBool::new(accept),
            attempts: Mutex::new(Vec::new()),
            dsn_tx,
            dsn_rx: Mutex::new(Some(dsn_rx)),
        })
    }

    /// Deliver a DSN as the station would
    pub fn report(&self, event: DsnEvent) {
        self.dsn_tx.send(event).unwrap();
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliveryTransport for ScriptedTransport {
    async fn send(&self, thread: &Thread) -> EmailResult<bool> {
        self.attempts
            .lock()
            .unwrap()
            .push((thread.id().clone(), thread.delivery.attempt_seq));
        if self.accept.load(Ordering::SeqCst) {
            Ok(true)
        } else {
            Err(EmailError::transport("station unreachable"))
        }
    }

    fn take_dsn_stream(&self) -> Option<mpsc::UnboundedReceiver<DsnEvent>> {
        self.dsn_rx.lock().unwrap().take()
    }
}

pub fn identity() -> Identity {
    Identity {
        callsign: "X1ABCD".to_string(),
        npub: "npub1alpha".to_string(),
        nickname: "Alpha".to_string(),
        key: Some(IdentityKey::new("nsec1alpha")),
    }
}

pub fn identity_without_key() -> Identity {
    Identity {
        key: None,
        ..identity()
    }
}

/// Settings that never wait between failed passes
pub fn fast_settings(dir: &Path, max_failed_passes: u32) -> CoordinatorSettings {
    CoordinatorSettings {
        outbox: OutboxSettings {
            retry: RetryPolicy::immediate(max_failed_passes),
            ..OutboxSettings::default()
        },
        ..CoordinatorSettings::new(dir)
    }
}

pub async fn open_coordinator(
    settings: CoordinatorSettings,
    transport: Arc<dyn DeliveryTransport>,
) -> EmailCoordinator {
    EmailCoordinator::open(settings, transport, Arc::new(EchoSigner))
        .await
        .unwrap()
}

pub fn write_file(dir: &TempDir, name: &str, len: usize, fill: u8) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, vec![fill; len]).unwrap();
    path
}
