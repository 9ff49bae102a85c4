use crate::email::message::Attachments;
use crate::email::{EmailError, EmailResult};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tracing::{debug, warn};

const MIB: u64 = 1024 * 1024;
/// Hex characters of the digest prefix in stored names
const DIGEST_HEX_LEN: usize = 40;

/// Size caps applied before anything is copied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentLimits {
    pub max_file_bytes: u64,
    pub max_thread_bytes: u64,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 5 * MIB,
            max_thread_bytes: 10 * MIB,
        }
    }
}

/// A source file that was not attached
#[derive(Debug)]
pub struct RejectedAttachment {
    pub path: PathBuf,
    pub error: EmailError,
}

/// Result of copying a batch of files into a thread folder
#[derive(Debug, Default)]
pub struct AttachmentBatch {
    /// Stored names, in the order the sources were given
    pub stored: Vec<String>,
    pub rejected: Vec<RejectedAttachment>,
}

impl AttachmentBatch {
    pub fn attachments(&self) -> Option<Attachments> {
        Attachments::from_names(self.stored.clone())
    }

    /// Metadata map to merge into the message
    pub fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        if let Some(attachments) = self.attachments() {
            attachments.write_metadata(&mut metadata);
        }
        metadata
    }
}

/// A file stored next to a thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub name: String,
    pub size: u64,
}

impl StoredAttachment {
    /// Name the user originally attached
    pub fn original_name(&self) -> &str {
        original_name(&self.name)
    }
}

/// Content-addressed attachment copies inside thread folders
#[derive(Debug, Clone, Default)]
pub struct AttachmentStore {
    limits: AttachmentLimits,
}

impl AttachmentStore {
    pub fn new(limits: AttachmentLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &AttachmentLimits {
        &self.limits
    }

    /// Copy local files into `thread_dir` under digest-prefixed names
    ///
    /// Oversized files are rejected one by one; the rest of the batch is
    /// still copied. Content already present resolves to the same name and
    /// does not count against the thread cap twice.
    pub async fn copy_into_thread(
        &self,
        thread_dir: &Path,
        files: &[PathBuf],
    ) -> EmailResult<AttachmentBatch> {
        async_fs::create_dir_all(thread_dir)
            .await
            .map_err(|e| EmailError::persistence(thread_dir, e))?;

        let mut total: u64 = self.list(thread_dir).await?.iter().map(|a| a.size).sum();
        let mut seen = HashSet::new();
        let mut batch = AttachmentBatch::default();

        for source in files {
            if !seen.insert(source.clone()) {
                debug!("Skipping duplicate attachment source {}", source.display());
                continue;
            }

            match self.copy_one(thread_dir, source, total).await {
                Ok((name, added)) => {
                    total += added;
                    batch.stored.push(name);
                }
                Err(error) => {
                    warn!("Rejected attachment {}: {}", source.display(), error);
                    batch.rejected.push(RejectedAttachment {
                        path: source.clone(),
                        error,
                    });
                }
            }
        }

        Ok(batch)
    }

    /// Returns the stored name and how many bytes were newly written
    async fn copy_one(&self, thread_dir: &Path, source: &Path, total: u64) -> EmailResult<(String, u64)> {
        let size = async_fs::metadata(source)
            .await
            .map_err(|e| EmailError::persistence(source, e))?
            .len();

        // Files forwarded from another thread keep their original name
        let display_name = match source.file_name().map(|name| name.to_string_lossy()) {
            Some(name) if is_stored_name(&name) => original_name(&name).to_string(),
            Some(name) => name.to_string(),
            None => "attachment".to_string(),
        };

        if size > self.limits.max_file_bytes {
            return Err(EmailError::AttachmentTooLarge {
                name: display_name,
                size,
                limit: self.limits.max_file_bytes,
            });
        }

        let data = async_fs::read(source)
            .await
            .map_err(|e| EmailError::persistence(source, e))?;
        let name = stored_name(&data, &display_name);
        let destination = thread_dir.join(&name);

        if async_fs::try_exists(&destination).await.unwrap_or(false) {
            debug!("Attachment {} already stored", name);
            return Ok((name, 0));
        }

        if total + size > self.limits.max_thread_bytes {
            return Err(EmailError::AttachmentTooLarge {
                name: display_name,
                size: total + size,
                limit: self.limits.max_thread_bytes,
            });
        }

        let tmp = thread_dir.join(format!(".{}.tmp", name));
        async_fs::write(&tmp, &data)
            .await
            .map_err(|e| EmailError::persistence(&tmp, e))?;
        async_fs::rename(&tmp, &destination)
            .await
            .map_err(|e| EmailError::persistence(&destination, e))?;

        debug!("Stored attachment {} ({} bytes)", name, size);
        Ok((name, size))
    }

    /// Attachments stored in a thread folder, sorted by name
    pub async fn list(&self, thread_dir: &Path) -> EmailResult<Vec<StoredAttachment>> {
        let mut entries = match async_fs::read_dir(thread_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EmailError::persistence(thread_dir, e)),
        };

        let mut attachments = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EmailError::persistence(thread_dir, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_stored_name(&name) {
                continue;
            }
            let size = entry
                .metadata()
                .await
                .map_err(|e| EmailError::persistence(entry.path(), e))?
                .len();
            attachments.push(StoredAttachment { name, size });
        }

        attachments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(attachments)
    }
}

/// `<sha1 hex>_<original name>`; commas are replaced so `files` stays splittable
pub fn stored_name(data: &[u8], original: &str) -> String {
    let digest = format!("{:x}", Sha1::digest(data));
    let safe: String = original
        .chars()
        .map(|c| match c {
            ',' | '/' | '\\' => '_',
            other => other,
        })
        .collect();
    format!("{}_{}", &digest[..DIGEST_HEX_LEN], safe)
}

/// Whether a folder entry is a stored attachment
pub fn is_stored_name(name: &str) -> bool {
    name.len() > DIGEST_HEX_LEN + 1
        && name.as_bytes()[DIGEST_HEX_LEN] == b'_'
        && name[..DIGEST_HEX_LEN].chars().all(|c| c.is_ascii_hexdigit())
}

/// Strip the digest prefix from a stored name
pub fn original_name(stored: &str) -> &str {
    if is_stored_name(stored) {
        &stored[DIGEST_HEX_LEN + 1..]
    } else {
        stored
    }
}
