//! Folder-per-thread persistence
//!
//! ```text
//! <root>/labels.json
//! <root>/threads/<yyyy-mm-dd_HHMM>_<subject-slug>_<digest>/thread.json
//! <root>/threads/<...>/<sha1>_<original name>      (attachments)
//! ```
//!
//! The folder name is derived from creation time, subject and participants,
//! so editing a draft's subject or recipients moves the folder on the next
//! save. Callers serialize saves of the same thread (see `ThreadLocks`).

use crate::email::thread::{Thread, ThreadId, ThreadStatus};
use crate::email::{EmailError, EmailResult};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs as async_fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// File holding a thread's header and messages
pub const THREAD_FILE: &str = "thread.json";
const THREADS_DIR: &str = "threads";
const LABELS_FILE: &str = "labels.json";
const SLUG_MAX: usize = 40;

/// Mailbox views, each a pure filter over thread status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Folder {
    Inbox,
    Sent,
    Outbox,
    Drafts,
    Archive,
    Spam,
    Garbage,
    Failed,
}

impl Folder {
    pub const ALL: [Folder; 8] = [
        Folder::Inbox,
        Folder::Sent,
        Folder::Outbox,
        Folder::Drafts,
        Folder::Archive,
        Folder::Spam,
        Folder::Garbage,
        Folder::Failed,
    ];

    pub fn status(&self) -> ThreadStatus {
        match self {
            Folder::Inbox => ThreadStatus::Received,
            Folder::Sent => ThreadStatus::Sent,
            Folder::Outbox => ThreadStatus::Pending,
            Folder::Drafts => ThreadStatus::Draft,
            Folder::Archive => ThreadStatus::Archived,
            Folder::Spam => ThreadStatus::Spam,
            Folder::Garbage => ThreadStatus::Deleted,
            Folder::Failed => ThreadStatus::Failed,
        }
    }

    pub fn contains(&self, thread: &Thread) -> bool {
        thread.status() == self.status()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Sent => "sent",
            Folder::Outbox => "outbox",
            Folder::Drafts => "drafts",
            Folder::Archive => "archive",
            Folder::Spam => "spam",
            Folder::Garbage => "garbage",
            Folder::Failed => "failed",
        }
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Folder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trash" => Ok(Folder::Garbage),
            "draft" => Ok(Folder::Drafts),
            other => Folder::ALL
                .iter()
                .copied()
                .find(|folder| folder.as_str() == other)
                .ok_or_else(|| format!("unknown folder: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredThread {
    thread: Thread,
    dir: String,
}

/// Durable thread storage with an in-memory index
pub struct ThreadStore {
    root: PathBuf,
    threads_dir: PathBuf,
    index: RwLock<HashMap<ThreadId, StoredThread>>,
    labels: RwLock<BTreeSet<String>>,
}

impl ThreadStore {
    /// Open the store under `root`, loading every readable thread
    pub async fn open<P: AsRef<Path>>(root: P) -> EmailResult<Self> {
        let root = root.as_ref().to_path_buf();
        let threads_dir = root.join(THREADS_DIR);
        async_fs::create_dir_all(&threads_dir)
            .await
            .map_err(|e| EmailError::persistence(&threads_dir, e))?;

        let index = Self::load_threads(&threads_dir).await?;
        let labels = Self::load_labels(&root.join(LABELS_FILE)).await?;
        info!(
            "Opened thread store at {} ({} threads, {} labels)",
            root.display(),
            index.len(),
            labels.len()
        );

        Ok(Self {
            root,
            threads_dir,
            index: RwLock::new(index),
            labels: RwLock::new(labels),
        })
    }

    async fn load_threads(threads_dir: &Path) -> EmailResult<HashMap<ThreadId, StoredThread>> {
        let mut index = HashMap::new();
        let mut entries = async_fs::read_dir(threads_dir)
            .await
            .map_err(|e| EmailError::persistence(threads_dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EmailError::persistence(threads_dir, e))?
        {
            let path = entry.path();
            let file = path.join(THREAD_FILE);
            let content = match async_fs::read(&file).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Skipping folder without readable thread file {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_slice::<Thread>(&content) {
                Ok(thread) => {
                    let dir = entry.file_name().to_string_lossy().to_string();
                    index.insert(thread.id().clone(), StoredThread { thread, dir });
                }
                Err(e) => warn!("Skipping unparsable thread {}: {}", file.display(), e),
            }
        }

        Ok(index)
    }

    async fn load_labels(path: &Path) -> EmailResult<BTreeSet<String>> {
        match async_fs::read(path).await {
            Ok(content) => Ok(serde_json::from_slice(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(EmailError::persistence(path, e)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder name derived from creation time, subject and participants
    pub fn dir_name(thread: &Thread) -> String {
        let mut hasher = Sha256::new();
        for participant in thread.participants() {
            hasher.update(participant.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(thread.id().as_str().as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        format!(
            "{}_{}_{}",
            thread.created.format("%Y-%m-%d_%H%M"),
            slugify(&thread.subject),
            &digest[..8]
        )
    }

    /// Where the thread's files live, or will live once saved
    pub async fn thread_dir(&self, thread: &Thread) -> PathBuf {
        let index = self.index.read().await;
        match index.get(thread.id()) {
            Some(stored) => self.threads_dir.join(&stored.dir),
            None => self.threads_dir.join(Self::dir_name(thread)),
        }
    }

    /// Move-or-create: write the thread, relocating its folder if the key changed
    ///
    /// On failure the previously saved state stays in place, on disk and in
    /// the index.
    pub async fn save(&self, thread: &Thread) -> EmailResult<()> {
        let new_dir = Self::dir_name(thread);
        let new_path = self.threads_dir.join(&new_dir);
        let old_dir = {
            let index = self.index.read().await;
            index.get(thread.id()).map(|stored| stored.dir.clone())
        };

        let mut moved_from = None;
        if let Some(old_dir) = old_dir.filter(|old| *old != new_dir) {
            let old_path = self.threads_dir.join(&old_dir);
            if async_fs::try_exists(&old_path).await.unwrap_or(false) {
                async_fs::rename(&old_path, &new_path)
                    .await
                    .map_err(|e| EmailError::persistence(&old_path, e))?;
                debug!("Moved thread {} from {} to {}", thread.id(), old_dir, new_dir);
                moved_from = Some(old_path);
            }
        }

        if let Err(e) = self.write_thread_file(&new_path, thread).await {
            if let Some(old_path) = moved_from {
                if let Err(rollback) = async_fs::rename(&new_path, &old_path).await {
                    warn!(
                        "Could not move {} back to {}: {}",
                        new_path.display(),
                        old_path.display(),
                        rollback
                    );
                }
            }
            return Err(e);
        }

        let mut index = self.index.write().await;
        index.insert(
            thread.id().clone(),
            StoredThread {
                thread: thread.clone(),
                dir: new_dir,
            },
        );
        debug!("Saved thread {} ({})", thread.id(), thread.status());
        Ok(())
    }

    async fn write_thread_file(&self, dir: &Path, thread: &Thread) -> EmailResult<()> {
        async_fs::create_dir_all(dir)
            .await
            .map_err(|e| EmailError::persistence(dir, e))?;

        let content = serde_json::to_vec_pretty(thread)?;
        let tmp = dir.join(format!(".{}.tmp", THREAD_FILE));
        let file = dir.join(THREAD_FILE);
        async_fs::write(&tmp, &content)
            .await
            .map_err(|e| EmailError::persistence(&tmp, e))?;
        async_fs::rename(&tmp, &file)
            .await
            .map_err(|e| EmailError::persistence(&file, e))?;
        Ok(())
    }

    /// Erase the thread folder and everything in it
    pub async fn delete(&self, id: &ThreadId) -> EmailResult<Thread> {
        let stored = {
            let index = self.index.read().await;
            index
                .get(id)
                .cloned()
                .ok_or_else(|| EmailError::NotFound(id.to_string()))?
        };

        let path = self.threads_dir.join(&stored.dir);
        match async_fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Thread folder {} already gone", path.display());
            }
            Err(e) => return Err(EmailError::persistence(&path, e)),
        }

        self.index.write().await.remove(id);
        info!("Erased thread {}", id);
        Ok(stored.thread)
    }

    pub async fn get(&self, id: &ThreadId) -> Option<Thread> {
        self.index.read().await.get(id).map(|stored| stored.thread.clone())
    }

    /// Threads matching `predicate`, newest first
    pub async fn list<F>(&self, predicate: F) -> Vec<Thread>
    where
        F: Fn(&Thread) -> bool,
    {
        let index = self.index.read().await;
        let mut threads: Vec<Thread> = index
            .values()
            .map(|stored| &stored.thread)
            .filter(|&thread| predicate(thread))
            .cloned()
            .collect();
        threads.sort_by(|a, b| b.id().cmp(a.id()));
        threads
    }

    pub async fn folder(&self, folder: Folder) -> Vec<Thread> {
        self.list(|thread| folder.contains(thread)).await
    }

    /// Threads carrying `label`, whatever their status
    pub async fn list_by_label(&self, label: &str) -> Vec<Thread> {
        self.list(|thread| thread.labels.contains(label)).await
    }

    pub async fn inbox(&self) -> Vec<Thread> {
        self.folder(Folder::Inbox).await
    }

    pub async fn sent(&self) -> Vec<Thread> {
        self.folder(Folder::Sent).await
    }

    pub async fn outbox(&self) -> Vec<Thread> {
        self.folder(Folder::Outbox).await
    }

    pub async fn drafts(&self) -> Vec<Thread> {
        self.folder(Folder::Drafts).await
    }

    pub async fn archive(&self) -> Vec<Thread> {
        self.folder(Folder::Archive).await
    }

    pub async fn spam(&self) -> Vec<Thread> {
        self.folder(Folder::Spam).await
    }

    pub async fn garbage(&self) -> Vec<Thread> {
        self.folder(Folder::Garbage).await
    }

    /// Registered labels plus any label found on a thread
    pub async fn labels(&self) -> Vec<String> {
        let mut all = self.labels.read().await.clone();
        for stored in self.index.read().await.values() {
            all.extend(stored.thread.labels.iter().cloned());
        }
        all.into_iter().collect()
    }

    /// Register a label; returns false when it already existed
    pub async fn create_label(&self, label: &str) -> EmailResult<bool> {
        let label = validate_label(label)?;
        let mut labels = self.labels.write().await;
        if labels.contains(&label) {
            return Ok(false);
        }

        let mut updated = labels.clone();
        updated.insert(label);
        self.write_labels(&updated).await?;
        *labels = updated;
        Ok(true)
    }

    /// Drop a label from the registry; threads are handled by the caller
    pub async fn forget_label(&self, label: &str) -> EmailResult<bool> {
        let mut labels = self.labels.write().await;
        if !labels.contains(label) {
            return Ok(false);
        }

        let mut updated = labels.clone();
        updated.remove(label);
        self.write_labels(&updated).await?;
        *labels = updated;
        Ok(true)
    }

    async fn write_labels(&self, labels: &BTreeSet<String>) -> EmailResult<()> {
        let path = self.root.join(LABELS_FILE);
        let tmp = self.root.join(format!(".{}.tmp", LABELS_FILE));
        let content = serde_json::to_vec_pretty(labels)?;
        async_fs::write(&tmp, &content)
            .await
            .map_err(|e| EmailError::persistence(&tmp, e))?;
        async_fs::rename(&tmp, &path)
            .await
            .map_err(|e| EmailError::persistence(&path, e))
    }
}

/// Trimmed, non-empty label name
pub fn validate_label(label: &str) -> EmailResult<String> {
    let label = label.trim();
    if label.is_empty() || label.contains(',') {
        return Err(EmailError::InvalidLabel(label.to_string()));
    }
    Ok(label.to_string())
}

fn slugify(subject: &str) -> String {
    let mut slug = String::new();
    for c in subject.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= SLUG_MAX {
            break;
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "no-subject".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::message::Message;
    use crate::email::thread::Actor;
    use tempfile::TempDir;

    fn sample_thread(subject: &str) -> Thread {
        let mut thread = Thread::new_received("p2p.example", "X2EFGH", subject);
        thread.to.push("X1ABCD".to_string());
        thread.append_message(Message::new("X2EFGH", "hello there"));
        thread
    }

    async fn count_dirs(root: &Path) -> usize {
        let mut entries = async_fs::read_dir(root.join(THREADS_DIR)).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        count
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Meeting at 10:00, room B!"), "meeting-at-10-00-room-b");
        assert_eq!(slugify("   "), "no-subject");
        assert_eq!(slugify(&"x".repeat(100)).len(), SLUG_MAX);
    }

    #[test]
    fn test_folder_parse() {
        assert_eq!("trash".parse::<Folder>(), Ok(Folder::Garbage));
        assert_eq!("Outbox".parse::<Folder>(), Ok(Folder::Outbox));
        assert!("nowhere".parse::<Folder>().is_err());
    }

    #[tokio::test]
    async fn test_save_twice_stores_one_thread() {
        let dir = TempDir::new().unwrap();
        let store = ThreadStore::open(dir.path()).await.unwrap();
        let thread = sample_thread("Weekly sync");

        store.save(&thread).await.unwrap();
        store.save(&thread).await.unwrap();

        assert_eq!(store.inbox().await.len(), 1);
        assert_eq!(count_dirs(dir.path()).await, 1);
    }

    #[tokio::test]
    async fn test_subject_change_moves_folder_with_attachments() {
        let dir = TempDir::new().unwrap();
        let store = ThreadStore::open(dir.path()).await.unwrap();
        let mut thread = sample_thread("First title");
        store.save(&thread).await.unwrap();

        let old_dir = store.thread_dir(&thread).await;
        std::fs::write(old_dir.join("attachment.bin"), b"data").unwrap();

        thread.subject = "Second title".to_string();
        store.save(&thread).await.unwrap();
        let new_dir = store.thread_dir(&thread).await;

        assert_ne!(old_dir, new_dir);
        assert!(!old_dir.exists());
        assert!(new_dir.join("attachment.bin").exists());
        assert_eq!(count_dirs(dir.path()).await, 1);
    }

    #[tokio::test]
    async fn test_reopen_restores_index() {
        let dir = TempDir::new().unwrap();
        let thread = sample_thread("Persisted");
        {
            let store = ThreadStore::open(dir.path()).await.unwrap();
            store.save(&thread).await.unwrap();
            store.create_label("work").await.unwrap();
        }

        std::fs::create_dir_all(dir.path().join(THREADS_DIR).join("garbage-folder")).unwrap();
        let store = ThreadStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get(thread.id()).await, Some(thread));
        assert_eq!(store.labels().await, vec!["work".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_previous_state() {
        let dir = TempDir::new().unwrap();
        let store = ThreadStore::open(dir.path()).await.unwrap();
        let mut thread = sample_thread("Stable");
        store.save(&thread).await.unwrap();

        // A directory squatting on the temp file name makes the write fail
        let thread_dir = store.thread_dir(&thread).await;
        std::fs::create_dir_all(thread_dir.join(format!(".{}.tmp", THREAD_FILE))).unwrap();

        thread.labels.insert("changed".to_string());
        let err = store.save(&thread).await.unwrap_err();
        assert!(matches!(err, EmailError::Persistence { .. }));

        let stored = store.get(thread.id()).await.unwrap();
        assert!(stored.labels.is_empty());
    }

    #[tokio::test]
    async fn test_delete_erases_folder() {
        let dir = TempDir::new().unwrap();
        let store = ThreadStore::open(dir.path()).await.unwrap();
        let mut thread = sample_thread("Bye");
        thread.transition(ThreadStatus::Deleted, Actor::User).unwrap();
        store.save(&thread).await.unwrap();
        let path = store.thread_dir(&thread).await;

        store.delete(thread.id()).await.unwrap();

        assert!(!path.exists());
        assert!(store.get(thread.id()).await.is_none());
        assert!(store.garbage().await.is_empty());
        assert!(matches!(
            store.delete(thread.id()).await,
            Err(EmailError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_label_queries_ignore_status() {
        let dir = TempDir::new().unwrap();
        let store = ThreadStore::open(dir.path()).await.unwrap();

        let mut inbox = sample_thread("One");
        inbox.labels.insert("family".to_string());
        let mut archived = sample_thread("Two");
        archived.labels.insert("family".to_string());
        archived.transition(ThreadStatus::Archived, Actor::User).unwrap();
        store.save(&inbox).await.unwrap();
        store.save(&archived).await.unwrap();

        assert_eq!(store.list_by_label("family").await.len(), 2);
        assert_eq!(store.archive().await.len(), 1);
        assert_eq!(store.inbox().await.len(), 1);
    }

    #[tokio::test]
    async fn test_label_registry() {
        let dir = TempDir::new().unwrap();
        let store = ThreadStore::open(dir.path()).await.unwrap();

        assert!(store.create_label(" travel ").await.unwrap());
        assert!(!store.create_label("travel").await.unwrap());
        assert!(matches!(
            store.create_label("  ").await,
            Err(EmailError::InvalidLabel(_))
        ));
        assert!(store.forget_label("travel").await.unwrap());
        assert!(!store.forget_label("travel").await.unwrap());
        assert!(store.labels().await.is_empty());
    }
}
