use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tracing::{debug, warn};

/// Recipient ranking entry; derived from send history, never authoritative
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequentContact {
    pub email: String,
    pub name: String,
    pub count: u32,
    pub last_used: DateTime<Utc>,
}

/// Ranking of addresses the user sends to, for autocomplete
#[derive(Debug)]
pub struct FrequentContacts {
    path: PathBuf,
    entries: HashMap<String, FrequentContact>,
}

impl FrequentContacts {
    /// Load the ranking; an unreadable file starts an empty one
    pub async fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match async_fs::read(&path).await {
            Ok(content) => match serde_json::from_slice::<Vec<FrequentContact>>(&content) {
                Ok(list) => list
                    .into_iter()
                    .map(|entry| (entry.email.to_lowercase(), entry))
                    .collect(),
                Err(e) => {
                    warn!("Discarding unreadable contact ranking {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self { path, entries }
    }

    /// Count one use of each address
    pub fn record<'a, I>(&mut self, addresses: I, names: &HashMap<String, String>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = Utc::now();
        for address in addresses {
            let address = address.trim();
            if address.is_empty() {
                continue;
            }
            let key = address.to_lowercase();
            let name = names.get(&key).cloned();
            let entry = self.entries.entry(key).or_insert_with(|| FrequentContact {
                email: address.to_string(),
                name: address.to_string(),
                count: 0,
                last_used: now,
            });
            entry.count += 1;
            entry.last_used = now;
            if let Some(name) = name {
                entry.name = name;
            }
        }
    }

    /// Persist the ranking
    pub async fn save(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            async_fs::create_dir_all(parent).await?;
        }
        let list: Vec<&FrequentContact> = self.entries.values().collect();
        let content = serde_json::to_vec_pretty(&list)?;
        async_fs::write(&self.path, content).await?;
        debug!("Saved {} frequent contacts", list.len());
        Ok(())
    }

    /// Best matches for `query`, most used first
    pub fn top(&self, query: &str, limit: usize) -> Vec<FrequentContact> {
        let query = query.trim().to_lowercase();
        let mut matches: Vec<FrequentContact> = self
            .entries
            .values()
            .filter(|entry| {
                query.is_empty()
                    || entry.email.to_lowercase().contains(&query)
                    || entry.name.to_lowercase().contains(&query)
            })
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| b.last_used.cmp(&a.last_used))
                .then_with(|| a.email.cmp(&b.email))
        });
        matches.truncate(limit);
        matches
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
