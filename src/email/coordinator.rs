//! Façade over the thread store, outbox and event streams
//!
//! Every mutation of a thread goes through the per-thread lock shared with
//! the outbox, checks the transition table before writing, and publishes a
//! change event once the write succeeded.

use crate::email::attachments::{AttachmentBatch, AttachmentLimits, AttachmentStore, RejectedAttachment};
use crate::email::collaborators::{
    Contact, ContactService, DeliveryTransport, DsnEvent, Identity, MessageSigner,
};
use crate::email::contacts::FrequentContacts;
use crate::email::events::{ChangeEvent, ChangeKind, EmailEvents, NotificationEvent};
use crate::email::locks::ThreadLocks;
use crate::email::message::Message;
use crate::email::outbox::{OutboxProcessor, OutboxReport, OutboxSettings};
use crate::email::store::{validate_label, Folder, ThreadStore};
use crate::email::thread::{Actor, Priority, Thread, ThreadId, ThreadStatus, DRAFT_RECIPIENT};
use crate::email::{EmailError, EmailResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CONTACTS_FILE: &str = "contacts.json";

/// Station connection state as reported by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Relay account, keyed by station
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationAccount {
    pub station: String,
    pub callsign: String,
    pub status: ConnectionStatus,
}

/// Result of `register_account`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountChange {
    Added,
    Updated,
    /// Station became reachable again; the outbox is processed right away
    Reconnected,
}

/// Everything needed to build an outgoing thread
#[derive(Debug, Clone, Default)]
pub struct ComposeRequest {
    pub station: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub content: String,
    pub priority: Priority,
    /// Local files to copy into the thread folder
    pub attachments: Vec<PathBuf>,
}

/// Outcome of `send`
#[derive(Debug)]
pub struct SendReceipt {
    pub thread: Thread,
    /// Whether the station accepted the first attempt; delivery comes later by DSN
    pub queued: bool,
    pub rejected_attachments: Vec<RejectedAttachment>,
}

/// Outcome of `save_draft`
#[derive(Debug)]
pub struct DraftReceipt {
    pub thread: Thread,
    pub rejected_attachments: Vec<RejectedAttachment>,
}

/// Construction parameters
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub data_dir: PathBuf,
    pub attachments: AttachmentLimits,
    pub outbox: OutboxSettings,
    /// Period of the background outbox pass
    pub outbox_interval: Duration,
    pub change_buffer: usize,
    pub notification_buffer: usize,
}

impl CoordinatorSettings {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            attachments: AttachmentLimits::default(),
            outbox: OutboxSettings::default(),
            outbox_interval: Duration::from_secs(30),
            change_buffer: 256,
            notification_buffer: 64,
        }
    }
}

/// Entry point for the UI and CLI
pub struct EmailCoordinator {
    store: Arc<ThreadStore>,
    attachments: AttachmentStore,
    outbox: OutboxProcessor,
    transport: Arc<dyn DeliveryTransport>,
    signer: Arc<dyn MessageSigner>,
    events: EmailEvents,
    locks: ThreadLocks,
    accounts: RwLock<HashMap<String, StationAccount>>,
    frequent: Arc<Mutex<FrequentContacts>>,
    contact_service: Option<Arc<dyn ContactService>>,
    outbox_interval: Duration,
}

impl EmailCoordinator {
    /// Open the store under `settings.data_dir` and wire the outbox
    pub async fn open(
        settings: CoordinatorSettings,
        transport: Arc<dyn DeliveryTransport>,
        signer: Arc<dyn MessageSigner>,
    ) -> EmailResult<Self> {
        let store = Arc::new(ThreadStore::open(&settings.data_dir).await?);
        let events = EmailEvents::new(settings.change_buffer, settings.notification_buffer);
        let locks = ThreadLocks::new();
        let outbox = OutboxProcessor::new(
            store.clone(),
            transport.clone(),
            events.clone(),
            locks.clone(),
            settings.outbox.clone(),
        );
        let frequent = FrequentContacts::load(settings.data_dir.join(CONTACTS_FILE)).await;

        Ok(Self {
            store,
            attachments: AttachmentStore::new(settings.attachments),
            outbox,
            transport,
            signer,
            events,
            locks,
            accounts: RwLock::new(HashMap::new()),
            frequent: Arc::new(Mutex::new(frequent)),
            contact_service: None,
            outbox_interval: settings.outbox_interval,
        })
    }

    pub fn with_contact_service(mut self, service: Arc<dyn ContactService>) -> Self {
        self.contact_service = Some(service);
        self
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    // Accounts

    /// Add or refresh a station account; never duplicates a station
    pub async fn register_account(&self, account: StationAccount) -> AccountChange {
        let change = {
            let mut accounts = self.accounts.write().await;
            let change = match accounts.get(&account.station) {
                None => AccountChange::Added,
                Some(existing)
                    if existing.status != ConnectionStatus::Connected
                        && account.status == ConnectionStatus::Connected =>
                {
                    AccountChange::Reconnected
                }
                Some(_) => AccountChange::Updated,
            };
            accounts.insert(account.station.clone(), account.clone());
            change
        };

        info!("Account {} {:?} ({:?})", account.station, change, account.status);
        if change == AccountChange::Reconnected {
            let outbox = self.outbox.clone();
            tokio::spawn(async move {
                outbox.process_after_reconnect().await;
            });
        }
        change
    }

    pub async fn accounts(&self) -> Vec<StationAccount> {
        let mut accounts: Vec<StationAccount> = self.accounts.read().await.values().cloned().collect();
        accounts.sort_by(|a, b| a.station.cmp(&b.station));
        accounts
    }

    // Composing

    /// Unsaved draft built from a request
    pub fn compose(&self, identity: &Identity, request: &ComposeRequest) -> Thread {
        let mut thread = Thread::new_draft(
            request.station.as_str(),
            identity.address(),
            request.subject.as_str(),
        );
        thread.to = request.to.clone();
        thread.cc = request.cc.clone();
        thread.bcc = request.bcc.clone();
        thread.priority = request.priority;
        thread
    }

    /// Prefilled request answering the last message of a thread
    pub async fn reply(&self, identity: &Identity, id: &ThreadId, reply_all: bool) -> EmailResult<ComposeRequest> {
        let thread = self.get_thread(id).await?;
        let me = identity.address().to_lowercase();

        let mut to: Vec<String> = if thread.from.to_lowercase() == me {
            thread
                .to
                .iter()
                .filter(|addr| addr.as_str() != DRAFT_RECIPIENT)
                .cloned()
                .collect()
        } else {
            vec![thread.from.clone()]
        };
        to.retain(|addr| addr.to_lowercase() != me);

        let mut cc = Vec::new();
        if reply_all {
            let mut taken: HashSet<String> = to.iter().map(|addr| addr.to_lowercase()).collect();
            taken.insert(me);
            cc = thread
                .to
                .iter()
                .chain(thread.cc.iter())
                .filter(|addr| addr.as_str() != DRAFT_RECIPIENT)
                .filter(|addr| taken.insert(addr.to_lowercase()))
                .cloned()
                .collect();
        }

        Ok(ComposeRequest {
            station: thread.station.clone(),
            to,
            cc,
            subject: format!("Re: {}", thread.normalized_subject()),
            content: quote_last(&thread),
            priority: thread.priority,
            ..ComposeRequest::default()
        })
    }

    /// Prefilled request forwarding a thread with its attachments
    pub async fn forward(&self, id: &ThreadId) -> EmailResult<ComposeRequest> {
        let thread = self.get_thread(id).await?;
        let dir = self.store.thread_dir(&thread).await;
        let attachments = self
            .attachments
            .list(&dir)
            .await?
            .into_iter()
            .map(|stored| dir.join(stored.name))
            .collect();

        Ok(ComposeRequest {
            station: thread.station.clone(),
            subject: format!("Fwd: {}", thread.normalized_subject()),
            content: quote_last(&thread),
            priority: thread.priority,
            attachments,
            ..ComposeRequest::default()
        })
    }

    /// Save a draft with an unsigned body; drafts need no identity key
    ///
    /// Attachments are copied into the draft folder right away and ride on
    /// the body, so `send_draft` signs and sends them as they are.
    pub async fn save_draft(&self, identity: &Identity, request: &ComposeRequest) -> EmailResult<DraftReceipt> {
        let mut thread = self.compose(identity, request);
        if request.attachments.is_empty() {
            if !request.content.trim().is_empty() {
                thread.append_message(Message::new(identity.address(), request.content.as_str()));
            }
            return Ok(DraftReceipt {
                thread: self.save_thread(thread).await?,
                rejected_attachments: Vec::new(),
            });
        }

        let id = self.save_thread(thread).await?.id().clone();
        let _guard = self.locks.lock(&id).await;
        let mut thread = self.get_thread(&id).await?;
        let dir = self.store.thread_dir(&thread).await;
        let batch = self.attachments.copy_into_thread(&dir, &request.attachments).await?;

        let body = Message::new(identity.address(), request.content.as_str())
            .with_attachments(batch.attachments());
        thread.append_message(body);
        self.store.save(&thread).await?;
        self.events.publish_change(ChangeKind::MessageAppended, Some(&id));

        Ok(DraftReceipt {
            thread,
            rejected_attachments: batch.rejected,
        })
    }

    /// Persist an edited thread
    ///
    /// Drafts get their placeholders filled in. A status differing from the
    /// stored one must be a legal user move; new threads start as drafts and
    /// only `send`/`send_draft` put a thread in the outbox. Delivery state is
    /// never taken from the caller, and a copy that would drop stored
    /// messages keeps them instead.
    pub async fn save_thread(&self, mut thread: Thread) -> EmailResult<Thread> {
        let _guard = self.locks.lock(thread.id()).await;

        let previous = self.store.get(thread.id()).await;
        let from = previous
            .as_ref()
            .map(|previous| previous.status())
            .unwrap_or(ThreadStatus::Draft);
        let legal = from == thread.status()
            || (thread.status() != ThreadStatus::Pending
                && from.can_transition(thread.status(), Actor::User));
        if !legal {
            return Err(invalid_transition(&thread, from, thread.status()));
        }
        if let Some(previous) = previous.as_ref() {
            if !thread.rebase_onto(previous) {
                warn!("Edited copy of {} conflicts with stored messages", thread.id());
                return Err(EmailError::Conflict(thread.id().to_string()));
            }
        }
        if thread.status() == ThreadStatus::Draft {
            thread.normalize_draft();
        }

        self.store.save(&thread).await?;
        match previous {
            Some(previous) if previous.status() != thread.status() => self.events.publish_change(
                ChangeKind::StatusChanged {
                    from: previous.status(),
                    to: thread.status(),
                },
                Some(thread.id()),
            ),
            _ => self.events.publish_change(ChangeKind::Saved, Some(thread.id())),
        }
        Ok(thread)
    }

    /// Append a signed message to a stored thread
    ///
    /// Nothing is written when signing fails. Threads already in the outbox
    /// are rejected: signing happens before a thread becomes pending.
    pub async fn create_signed_message(
        &self,
        identity: &Identity,
        id: &ThreadId,
        content: &str,
        metadata: Option<BTreeMap<String, String>>,
    ) -> EmailResult<Thread> {
        let _guard = self.locks.lock(id).await;
        let mut thread = self.get_thread(id).await?;
        if thread.status() == ThreadStatus::Pending {
            return Err(EmailError::InvalidTransition {
                thread_id: id.to_string(),
                from: thread.status(),
                to: "signed message".to_string(),
            });
        }

        let mut message = Message::new(identity.address(), content);
        if let Some(metadata) = metadata {
            message = message.with_metadata(metadata);
        }
        message.sign(self.signer.as_ref(), identity)?;
        thread.append_message(message);

        self.store.save(&thread).await?;
        self.events.publish_change(ChangeKind::MessageAppended, Some(id));
        Ok(thread)
    }

    // Sending

    /// Compose, attach, sign and queue in one go
    ///
    /// The thread is stored as a draft first. If signing fails it stays a
    /// draft; only a fully signed thread with a real recipient becomes
    /// pending. Oversized attachments are reported, not fatal.
    pub async fn send(&self, identity: &Identity, request: ComposeRequest) -> EmailResult<SendReceipt> {
        let draft = self.save_thread(self.compose(identity, &request)).await?;
        let id = draft.id().clone();

        let (thread, batch) = {
            let _guard = self.locks.lock(&id).await;
            let mut thread = self.get_thread(&id).await?;
            ensure_recipients(&thread)?;

            let dir = self.store.thread_dir(&thread).await;
            let batch = self.attachments.copy_into_thread(&dir, &request.attachments).await?;

            let mut message = Message::new(identity.address(), request.content.as_str())
                .with_attachments(batch.attachments());
            message.sign(self.signer.as_ref(), identity)?;
            thread.append_message(message);

            self.enqueue(&mut thread)?;
            self.store.save(&thread).await?;
            (thread, batch)
        };

        self.announce_queued(&thread);
        Ok(self.dispatch(thread, batch).await)
    }

    /// Sign a stored draft's unsigned bodies and queue it
    pub async fn send_draft(&self, identity: &Identity, id: &ThreadId) -> EmailResult<SendReceipt> {
        let thread = {
            let _guard = self.locks.lock(id).await;
            let mut thread = self.get_thread(id).await?;
            if thread.status() != ThreadStatus::Draft {
                return Err(invalid_transition(&thread, thread.status(), ThreadStatus::Pending));
            }
            ensure_recipients(&thread)?;

            for message in thread.messages_mut().iter_mut().filter(|m| !m.is_signed()) {
                message.sign(self.signer.as_ref(), identity)?;
            }
            if thread.messages().is_empty() {
                let mut message = Message::new(identity.address(), "");
                message.sign(self.signer.as_ref(), identity)?;
                thread.append_message(message);
            }

            self.enqueue(&mut thread)?;
            self.store.save(&thread).await?;
            thread
        };

        self.announce_queued(&thread);
        Ok(self.dispatch(thread, AttachmentBatch::default()).await)
    }

    fn enqueue(&self, thread: &mut Thread) -> EmailResult<()> {
        thread.strip_placeholder();
        if let Err(from) = thread.transition(ThreadStatus::Pending, Actor::User) {
            return Err(invalid_transition(thread, from, ThreadStatus::Pending));
        }
        thread.delivery.reset_for_retry();
        Ok(())
    }

    fn announce_queued(&self, thread: &Thread) {
        self.events.publish_change(ChangeKind::MessageAppended, Some(thread.id()));
        self.events.publish_change(
            ChangeKind::StatusChanged {
                from: ThreadStatus::Draft,
                to: ThreadStatus::Pending,
            },
            Some(thread.id()),
        );
    }

    /// Record recipients and make the first attempt; never fails the send
    async fn dispatch(&self, thread: Thread, batch: AttachmentBatch) -> SendReceipt {
        let recipients: Vec<String> = thread.real_recipients().cloned().collect();
        self.track_recipients(&recipients);

        let queued = match self.outbox.attempt(thread.id()).await {
            Ok(queued) => queued,
            Err(e) => {
                warn!("First attempt for {} failed: {}", thread.id(), e);
                false
            }
        };
        let latest = self.store.get(thread.id()).await;
        let thread = latest.unwrap_or(thread);

        SendReceipt {
            thread,
            queued,
            rejected_attachments: batch.rejected,
        }
    }

    /// Immediate delivery attempt for a pending thread
    ///
    /// `true` only means the station queued it; the outcome arrives by DSN.
    pub async fn send_via_websocket(&self, id: &ThreadId) -> EmailResult<bool> {
        self.outbox.attempt(id).await
    }

    pub async fn process_outbox(&self) -> OutboxReport {
        self.outbox.process_outbox().await
    }

    pub async fn apply_dsn(&self, event: DsnEvent) -> EmailResult<Option<ThreadStatus>> {
        self.outbox.apply_dsn(event).await
    }

    // Receiving

    /// Store an incoming thread, merging new messages into a known conversation
    pub async fn receive(&self, incoming: Thread) -> EmailResult<Thread> {
        if incoming.status() != ThreadStatus::Received {
            return Err(EmailError::InvalidTransition {
                thread_id: incoming.id().to_string(),
                from: incoming.status(),
                to: ThreadStatus::Received.to_string(),
            });
        }

        let _guard = self.locks.lock(incoming.id()).await;
        let Some(mut existing) = self.store.get(incoming.id()).await else {
            self.store.save(&incoming).await?;
            info!("Received thread {} from {}", incoming.id(), incoming.from);
            self.events.publish_change(ChangeKind::Saved, Some(incoming.id()));
            return Ok(incoming);
        };

        let mut appended = 0;
        for message in incoming.messages() {
            if !existing.messages().contains(message) {
                existing.append_message(message.clone());
                appended += 1;
            }
        }
        if appended == 0 {
            debug!("Thread {} already up to date", existing.id());
            return Ok(existing);
        }

        self.store.save(&existing).await?;
        debug!("Appended {} messages to {}", appended, existing.id());
        self.events.publish_change(ChangeKind::MessageAppended, Some(existing.id()));
        Ok(existing)
    }

    // Folder moves

    pub async fn delete_thread(&self, id: &ThreadId) -> EmailResult<Thread> {
        self.move_thread(id, ThreadStatus::Deleted).await
    }

    pub async fn archive_thread(&self, id: &ThreadId) -> EmailResult<Thread> {
        self.move_thread(id, ThreadStatus::Archived).await
    }

    /// Back to the inbox, whoever wrote the thread
    pub async fn restore_thread(&self, id: &ThreadId) -> EmailResult<Thread> {
        self.move_thread(id, ThreadStatus::Received).await
    }

    pub async fn mark_as_spam(&self, id: &ThreadId) -> EmailResult<Thread> {
        self.move_thread(id, ThreadStatus::Spam).await
    }

    /// Requeue a failed thread with a fresh retry budget
    ///
    /// Drafts go through `send_draft` instead so they get signed.
    pub async fn mark_as_pending(&self, id: &ThreadId) -> EmailResult<Thread> {
        let thread = self.get_thread(id).await?;
        if thread.status() != ThreadStatus::Failed {
            return Err(invalid_transition(&thread, thread.status(), ThreadStatus::Pending));
        }
        self.move_thread(id, ThreadStatus::Pending).await
    }

    async fn move_thread(&self, id: &ThreadId, to: ThreadStatus) -> EmailResult<Thread> {
        let _guard = self.locks.lock(id).await;
        let mut thread = self.get_thread(id).await?;

        let from = match thread.transition(to, Actor::User) {
            Ok(from) => from,
            Err(current) => return Err(invalid_transition(&thread, current, to)),
        };
        if to == ThreadStatus::Pending {
            thread.delivery.reset_for_retry();
        }

        self.store.save(&thread).await?;
        info!("Moved thread {} from {} to {}", id, from, to);
        self.events
            .publish_change(ChangeKind::StatusChanged { from, to }, Some(id));
        Ok(thread)
    }

    /// Erase a trashed thread and its attachments for good
    pub async fn permanently_delete(&self, id: &ThreadId) -> EmailResult<()> {
        let _guard = self.locks.lock(id).await;
        let thread = self.get_thread(id).await?;
        if !thread.status().can_erase() {
            return Err(EmailError::InvalidTransition {
                thread_id: id.to_string(),
                from: thread.status(),
                to: "erased".to_string(),
            });
        }

        self.store.delete(id).await?;
        self.events.publish_change(ChangeKind::Erased, Some(id));
        Ok(())
    }

    // Labels

    pub async fn get_labels(&self) -> Vec<String> {
        self.store.labels().await
    }

    /// Register a label; `false` when it already existed
    pub async fn create_label(&self, label: &str) -> EmailResult<bool> {
        let created = self.store.create_label(label).await?;
        if created {
            self.events.publish_change(
                ChangeKind::LabelCreated {
                    label: label.trim().to_string(),
                },
                None,
            );
        }
        Ok(created)
    }

    /// Remove a label from every thread carrying it, keeping the threads
    ///
    /// Returns how many threads were untagged.
    pub async fn delete_label(&self, label: &str) -> EmailResult<usize> {
        let label = validate_label(label)?;
        let tagged = self.store.list_by_label(&label).await;
        let registered = self.store.labels().await.contains(&label);
        if tagged.is_empty() && !registered {
            return Err(EmailError::InvalidLabel(label));
        }

        let mut untagged = 0;
        for thread in tagged {
            if self.remove_label(thread.id(), &label).await?.is_some() {
                untagged += 1;
            }
        }
        self.store.forget_label(&label).await?;

        info!("Deleted label {} from {} threads", label, untagged);
        self.events
            .publish_change(ChangeKind::LabelDeleted { label }, None);
        Ok(untagged)
    }

    /// Tag a thread; the label is registered if new
    pub async fn add_label(&self, id: &ThreadId, label: &str) -> EmailResult<Thread> {
        let label = validate_label(label)?;
        self.get_thread(id).await?;
        self.create_label(&label).await?;

        let _guard = self.locks.lock(id).await;
        let mut thread = self.get_thread(id).await?;
        if thread.labels.insert(label) {
            self.store.save(&thread).await?;
            self.events.publish_change(ChangeKind::LabelsChanged, Some(id));
        }
        Ok(thread)
    }

    /// Untag a thread; `None` when it did not carry the label
    pub async fn remove_label(&self, id: &ThreadId, label: &str) -> EmailResult<Option<Thread>> {
        let _guard = self.locks.lock(id).await;
        let mut thread = self.get_thread(id).await?;
        if !thread.labels.remove(label.trim()) {
            return Ok(None);
        }

        self.store.save(&thread).await?;
        self.events.publish_change(ChangeKind::LabelsChanged, Some(id));
        Ok(Some(thread))
    }

    // Queries

    pub async fn get_thread(&self, id: &ThreadId) -> EmailResult<Thread> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| EmailError::NotFound(id.to_string()))
    }

    pub async fn get_folder(&self, folder: Folder) -> Vec<Thread> {
        self.store.folder(folder).await
    }

    pub async fn get_inbox(&self) -> Vec<Thread> {
        self.store.inbox().await
    }

    pub async fn get_sent(&self) -> Vec<Thread> {
        self.store.sent().await
    }

    pub async fn get_outbox(&self) -> Vec<Thread> {
        self.store.outbox().await
    }

    pub async fn get_drafts(&self) -> Vec<Thread> {
        self.store.drafts().await
    }

    pub async fn get_archive(&self) -> Vec<Thread> {
        self.store.archive().await
    }

    pub async fn get_spam(&self) -> Vec<Thread> {
        self.store.spam().await
    }

    pub async fn get_garbage(&self) -> Vec<Thread> {
        self.store.garbage().await
    }

    pub async fn get_by_label(&self, label: &str) -> Vec<Thread> {
        self.store.list_by_label(label.trim()).await
    }

    // Recipients

    /// Update the frequent-contact ranking in the background
    ///
    /// Failures are logged; the send path never waits on this.
    pub fn track_recipients(&self, addresses: &[String]) -> JoinHandle<()> {
        let addresses = addresses.to_vec();
        let frequent = self.frequent.clone();
        let names: HashMap<String, String> = self
            .contact_service
            .as_ref()
            .map(|service| {
                service
                    .contacts()
                    .into_iter()
                    .map(|contact| (contact.address.to_lowercase(), contact.name))
                    .collect()
            })
            .unwrap_or_default();

        tokio::spawn(async move {
            let mut frequent = frequent.lock().await;
            frequent.record(addresses.iter().map(String::as_str), &names);
            if let Err(e) = frequent.save().await {
                warn!("Could not save frequent contacts: {}", e);
            }
        })
    }

    /// Frequent recipients first, then matching contacts from the address book
    pub async fn suggest_recipients(&self, query: &str, limit: usize) -> Vec<Contact> {
        let mut seen = HashSet::new();
        let mut suggestions: Vec<Contact> = self
            .frequent
            .lock()
            .await
            .top(query, limit)
            .into_iter()
            .map(|entry| Contact {
                name: entry.name,
                address: entry.email,
            })
            .filter(|contact| seen.insert(contact.address.to_lowercase()))
            .collect();

        if let Some(service) = &self.contact_service {
            let query = query.trim().to_lowercase();
            for contact in service.contacts() {
                if suggestions.len() >= limit {
                    break;
                }
                let matches = query.is_empty()
                    || contact.address.to_lowercase().contains(&query)
                    || contact.name.to_lowercase().contains(&query);
                if matches && seen.insert(contact.address.to_lowercase()) {
                    suggestions.push(contact);
                }
            }
        }

        suggestions.truncate(limit);
        suggestions
    }

    // Events

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe_changes()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events.subscribe_notifications()
    }

    /// Start the DSN listener and the periodic outbox pass
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(dsn_stream) = self.transport.take_dsn_stream() {
            let outbox = self.outbox.clone();
            handles.push(tokio::spawn(async move {
                outbox.apply_dsn_stream(dsn_stream).await;
            }));
        } else {
            debug!("Transport has no DSN stream");
        }

        let coordinator = Arc::clone(self);
        let period = self.outbox_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                coordinator.process_outbox().await;
            }
        }));

        handles
    }
}

fn invalid_transition(thread: &Thread, from: ThreadStatus, to: ThreadStatus) -> EmailError {
    EmailError::InvalidTransition {
        thread_id: thread.id().to_string(),
        from,
        to: to.to_string(),
    }
}

/// Queued threads need at least one real `to` address
fn ensure_recipients(thread: &Thread) -> EmailResult<()> {
    let addressed = thread
        .to
        .iter()
        .any(|addr| !addr.trim().is_empty() && addr.as_str() != DRAFT_RECIPIENT);
    if !addressed {
        return Err(EmailError::InvalidRecipient(format!(
            "thread {} has no recipients",
            thread.id()
        )));
    }
    Ok(())
}

fn quote_last(thread: &Thread) -> String {
    thread
        .last_message()
        .map(|message| format!("\n\n{}", message.quoted()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::collaborators::{IdentityKey, OfflineTransport};
    use tempfile::TempDir;

    struct EchoSigner;

    impl MessageSigner for EchoSigner {
        fn sign(&self, canonical: &[u8], key: &IdentityKey) -> EmailResult<String> {
            Ok(format!("{}:{}", key.expose(), canonical.len()))
        }
    }

    fn identity() -> Identity {
        Identity {
            callsign: "X1ABCD".to_string(),
            npub: "npub1abcd".to_string(),
            nickname: "Alpha".to_string(),
            key: Some(IdentityKey::new("nsec1abcd")),
        }
    }

    async fn coordinator() -> (TempDir, EmailCoordinator) {
        let dir = TempDir::new().unwrap();
        let coordinator = EmailCoordinator::open(
            CoordinatorSettings::new(dir.path()),
            Arc::new(OfflineTransport),
            Arc::new(EchoSigner),
        )
        .await
        .unwrap();
        (dir, coordinator)
    }

    fn incoming(subject: &str) -> Thread {
        let mut thread = Thread::new_received("p2p.example", "X2EFGH", subject);
        thread.to.push("X1ABCD".to_string());
        thread.cc.push("X3IJKL".to_string());
        thread.append_message(Message::new("X2EFGH", "first line\nsecond line"));
        thread
    }

    #[tokio::test]
    async fn test_register_account_is_idempotent() {
        let (_dir, coordinator) = coordinator().await;
        let mut account = StationAccount {
            station: "p2p.example".to_string(),
            callsign: "X1ABCD".to_string(),
            status: ConnectionStatus::Disconnected,
        };

        assert_eq!(coordinator.register_account(account.clone()).await, AccountChange::Added);
        assert_eq!(coordinator.register_account(account.clone()).await, AccountChange::Updated);
        account.status = ConnectionStatus::Connected;
        assert_eq!(coordinator.register_account(account).await, AccountChange::Reconnected);
        assert_eq!(coordinator.accounts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_illegal_move_is_rejected_without_write() {
        let (_dir, coordinator) = coordinator().await;
        let thread = coordinator.receive(incoming("Hi")).await.unwrap();
        coordinator.delete_thread(thread.id()).await.unwrap();

        let err = coordinator.archive_thread(thread.id()).await.unwrap_err();
        assert!(matches!(err, EmailError::InvalidTransition { .. }));
        assert_eq!(coordinator.get_garbage().await.len(), 1);
    }

    #[tokio::test]
    async fn test_receive_merges_new_messages() {
        let (_dir, coordinator) = coordinator().await;
        let mut thread = incoming("Plans");
        coordinator.receive(thread.clone()).await.unwrap();

        thread.append_message(Message::new("X2EFGH", "one more thing"));
        let merged = coordinator.receive(thread.clone()).await.unwrap();
        assert_eq!(merged.messages().len(), 2);

        let again = coordinator.receive(thread).await.unwrap();
        assert_eq!(again.messages().len(), 2);
        assert_eq!(coordinator.get_inbox().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reply_all_addresses_everyone_else() {
        let (_dir, coordinator) = coordinator().await;
        let thread = coordinator.receive(incoming("Re: [team] Plans")).await.unwrap();

        let reply = coordinator.reply(&identity(), thread.id(), true).await.unwrap();
        assert_eq!(reply.to, vec!["X2EFGH".to_string()]);
        assert_eq!(reply.cc, vec!["X3IJKL".to_string()]);
        assert_eq!(reply.subject, "Re: Plans");
        assert!(reply.content.contains("> second line"));

        let single = coordinator.reply(&identity(), thread.id(), false).await.unwrap();
        assert!(single.cc.is_empty());

        let forward = coordinator.forward(thread.id()).await.unwrap();
        assert!(forward.to.is_empty());
        assert_eq!(forward.subject, "Fwd: Plans");
    }

    #[tokio::test]
    async fn test_signed_message_on_pending_thread_is_rejected() {
        let (_dir, coordinator) = coordinator().await;
        let request = ComposeRequest {
            station: "p2p.example".to_string(),
            to: vec!["X2EFGH".to_string()],
            subject: "Queued".to_string(),
            content: "body".to_string(),
            ..ComposeRequest::default()
        };
        let receipt = coordinator.send(&identity(), request).await.unwrap();
        assert!(!receipt.queued);

        let err = coordinator
            .create_signed_message(&identity(), receipt.thread.id(), "late", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EmailError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_send_draft_signs_body() {
        let (_dir, coordinator) = coordinator().await;
        let request = ComposeRequest {
            station: "p2p.example".to_string(),
            to: vec!["X2EFGH".to_string()],
            subject: "Later".to_string(),
            content: "draft body".to_string(),
            ..ComposeRequest::default()
        };
        let draft = coordinator.save_draft(&identity(), &request).await.unwrap().thread;
        assert!(!draft.messages()[0].is_signed());

        let receipt = coordinator.send_draft(&identity(), draft.id()).await.unwrap();
        assert_eq!(receipt.thread.status(), ThreadStatus::Pending);
        assert!(receipt.thread.messages().iter().all(Message::is_signed));
        assert!(coordinator.get_drafts().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_label_keeps_threads() {
        let (_dir, coordinator) = coordinator().await;
        let thread = coordinator.receive(incoming("Tagged")).await.unwrap();
        coordinator.add_label(thread.id(), "work").await.unwrap();
        assert_eq!(coordinator.get_by_label("work").await.len(), 1);

        assert_eq!(coordinator.delete_label("work").await.unwrap(), 1);
        assert!(coordinator.get_by_label("work").await.is_empty());
        assert!(coordinator.get_labels().await.is_empty());
        assert_eq!(coordinator.get_inbox().await.len(), 1);
        assert!(matches!(
            coordinator.delete_label("work").await,
            Err(EmailError::InvalidLabel(_))
        ));
    }

    #[tokio::test]
    async fn test_suggestions_prefer_frequent_recipients() {
        struct Book;
        impl ContactService for Book {
            fn contacts(&self) -> Vec<Contact> {
                vec![
                    Contact {
                        name: "Alice".to_string(),
                        address: "X2EFGH".to_string(),
                    },
                    Contact {
                        name: "Alan".to_string(),
                        address: "X9ZZZZ".to_string(),
                    },
                ]
            }
        }

        let (_dir, coordinator) = coordinator().await;
        let coordinator = coordinator.with_contact_service(Arc::new(Book));
        coordinator
            .track_recipients(&["X2EFGH".to_string()])
            .await
            .unwrap();

        let suggestions = coordinator.suggest_recipients("al", 5).await;
        assert_eq!(suggestions.len(), 2);
        assert_eq!(suggestions[0].address, "X2EFGH");
        assert_eq!(suggestions[0].name, "Alice");
        assert_eq!(suggestions[1].address, "X9ZZZZ");
    }
}
