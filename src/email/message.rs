use crate::email::collaborators::{Identity, MessageSigner};
use crate::email::{EmailError, EmailResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Metadata key for a single image attachment
pub const META_IMAGE: &str = "image";
/// Metadata key for a single non-image attachment
pub const META_FILE: &str = "file";
/// Metadata key for several attachments, comma joined
pub const META_FILES: &str = "files";

/// How a single attachment is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    /// Classify by filename extension
    pub fn from_filename(filename: &str) -> Self {
        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "svg" => Self::Image,
            _ => Self::File,
        }
    }

    fn metadata_key(&self) -> &'static str {
        match self {
            Self::Image => META_IMAGE,
            Self::File => META_FILE,
        }
    }
}

/// Attachments of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachments {
    Single { kind: AttachmentKind, name: String },
    Multiple(Vec<String>),
}

impl Attachments {
    /// Build from stored names; `None` when there are none
    pub fn from_names(mut names: Vec<String>) -> Option<Self> {
        names.retain(|name| !name.is_empty());
        names.dedup();
        match names.len() {
            0 => None,
            1 => {
                let name = names.remove(0);
                Some(Attachments::Single {
                    kind: AttachmentKind::from_filename(&name),
                    name,
                })
            }
            _ => Some(Attachments::Multiple(names)),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        match self {
            Attachments::Single { name, .. } => vec![name.as_str()],
            Attachments::Multiple(names) => names.iter().map(String::as_str).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Attachments::Single { .. } => 1,
            Attachments::Multiple(names) => names.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode into the string-keyed storage map
    pub fn write_metadata(&self, metadata: &mut BTreeMap<String, String>) {
        match self {
            Attachments::Single { kind, name } => {
                metadata.insert(kind.metadata_key().to_string(), name.clone());
            }
            Attachments::Multiple(names) => {
                metadata.insert(META_FILES.to_string(), names.join(","));
            }
        }
    }

    /// Decode and remove the attachment keys from a storage map
    ///
    /// `files` wins over `image`, which wins over `file`; the losing keys are
    /// dropped since they describe the same concept.
    pub fn take_metadata(metadata: &mut BTreeMap<String, String>) -> Option<Self> {
        let files = metadata.remove(META_FILES);
        let image = metadata.remove(META_IMAGE);
        let file = metadata.remove(META_FILE);

        if let Some(files) = files {
            let names = files
                .split(',')
                .map(|name| name.trim().to_string())
                .collect();
            return Self::from_names(names);
        }
        if let Some(name) = image.filter(|name| !name.is_empty()) {
            return Some(Attachments::Single {
                kind: AttachmentKind::Image,
                name,
            });
        }
        file.filter(|name| !name.is_empty())
            .map(|name| Attachments::Single {
                kind: AttachmentKind::File,
                name,
            })
    }
}

/// On-disk shape of a message
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageRecord {
    author: String,
    timestamp: DateTime<Utc>,
    content: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    author_key: Option<String>,
}

/// One unit of content inside a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "MessageRecord", into = "MessageRecord")]
pub struct Message {
    author: String,
    timestamp: DateTime<Utc>,
    content: String,
    attachments: Option<Attachments>,
    metadata: BTreeMap<String, String>,
    signature: Option<String>,
    author_key: Option<String>,
}

impl From<MessageRecord> for Message {
    fn from(mut record: MessageRecord) -> Self {
        let attachments = Attachments::take_metadata(&mut record.metadata);
        Self {
            author: record.author,
            timestamp: record.timestamp,
            content: record.content,
            attachments,
            metadata: record.metadata,
            signature: record.signature,
            author_key: record.author_key,
        }
    }
}

impl From<Message> for MessageRecord {
    fn from(message: Message) -> Self {
        let metadata = message.storage_metadata();
        Self {
            author: message.author,
            timestamp: message.timestamp,
            content: message.content,
            metadata,
            signature: message.signature,
            author_key: message.author_key,
        }
    }
}

impl Message {
    pub fn new<S: Into<String>>(author: S, content: S) -> Self {
        Self {
            author: author.into(),
            timestamp: Utc::now(),
            content: content.into(),
            attachments: None,
            metadata: BTreeMap::new(),
            signature: None,
            author_key: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_attachments(mut self, attachments: Option<Attachments>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Extra metadata; attachment keys are routed into the typed field
    pub fn with_metadata(mut self, mut metadata: BTreeMap<String, String>) -> Self {
        if let Some(attachments) = Attachments::take_metadata(&mut metadata) {
            self.attachments = Some(attachments);
        }
        self.metadata.extend(metadata);
        self
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        &self.timestamp
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn attachments(&self) -> Option<&Attachments> {
        self.attachments.as_ref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn author_key(&self) -> Option<&str> {
        self.author_key.as_deref()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Metadata map as stored, attachment keys included
    pub fn storage_metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = self.metadata.clone();
        if let Some(attachments) = &self.attachments {
            attachments.write_metadata(&mut metadata);
        }
        metadata
    }

    /// Bytes covered by the signature
    pub fn canonical_bytes(&self) -> EmailResult<Vec<u8>> {
        #[derive(Serialize)]
        struct Canonical<'a> {
            author: &'a str,
            timestamp: String,
            content: &'a str,
            metadata: BTreeMap<String, String>,
        }

        let canonical = Canonical {
            author: &self.author,
            timestamp: self.timestamp.to_rfc3339(),
            content: &self.content,
            metadata: self.storage_metadata(),
        };
        Ok(serde_json::to_vec(&canonical)?)
    }

    /// Sign once; a signed message is immutable
    pub fn sign(&mut self, signer: &dyn MessageSigner, identity: &Identity) -> EmailResult<()> {
        if self.is_signed() {
            return Err(EmailError::signing("message is already signed"));
        }
        let key = identity
            .key
            .as_ref()
            .ok_or_else(|| EmailError::signing(format!("no identity key for {}", identity.callsign)))?;

        let canonical = self.canonical_bytes()?;
        let signature = signer.sign(&canonical, key)?;

        self.signature = Some(signature);
        self.author_key = Some(identity.npub.clone());
        Ok(())
    }

    /// Content quoted for a reply or forward
    pub fn quoted(&self) -> String {
        let mut quoted = format!(
            "On {}, {} wrote:\n",
            self.timestamp.format("%Y-%m-%d %H:%M"),
            self.author
        );
        for line in self.content.lines() {
            quoted.push_str("> ");
            quoted.push_str(line);
            quoted.push('\n');
        }
        quoted
    }
}
