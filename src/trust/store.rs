//! Known-host storage
//!
//! Flat-file store of accepted host keys with an in-memory cache, in the
//! spirit of `~/.ssh/known_hosts` but keyed by host record id. Each line is
//! `record_id hostname port algorithm base64(key)`.
//!
//! Reads are infallible (a store that cannot answer has nothing on record);
//! writes surface IO errors to the caller.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use thiserror::Error;

use crate::host::HostRecordId;

#[derive(Error, Debug)]
pub enum TrustStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One accepted host key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHostEntry {
    /// Host record this key was accepted for
    pub host_record_id: HostRecordId,

    /// Hostname the record pointed at when the key was accepted
    pub hostname: String,

    pub port: u16,

    /// Key algorithm name as negotiated ("ssh-ed25519", "rsa-sha2-512")
    pub algorithm: String,

    /// Public key blob in SSH wire format
    pub key: Vec<u8>,
}

/// Storage of accepted host keys.
///
/// A record holds at most one key per algorithm: `record` replaces any
/// previous entry with the same `(host_record_id, algorithm)` pair.
pub trait HostTrustStore: Send + Sync {
    /// All keys on record for a host
    fn entries_for(&self, record: HostRecordId) -> Vec<KnownHostEntry>;

    /// The key on record for a host under one algorithm
    fn entry_for(&self, record: HostRecordId, algorithm: &str) -> Option<KnownHostEntry>;

    /// Insert or replace the key for `(record, algorithm)`
    fn record(&self, entry: KnownHostEntry) -> Result<(), TrustStoreError>;

    /// Remove one exact entry. Returns whether anything matched.
    fn remove(
        &self,
        record: HostRecordId,
        algorithm: &str,
        key: &[u8],
    ) -> Result<bool, TrustStoreError>;

    /// Remove every key on record for a host. Returns how many were removed.
    fn remove_all(&self, record: HostRecordId) -> Result<usize, TrustStoreError>;
}

/// Normalize a hostname for storage: lowercase, brackets stripped
pub fn normalize_hostname(hostname: &str) -> String {
    hostname
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_lowercase()
}

/// In-memory trust store
pub struct MemoryTrustStore {
    entries: RwLock<HashMap<HostRecordId, Vec<KnownHostEntry>>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTrustStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTrustStore for MemoryTrustStore {
    fn entries_for(&self, record: HostRecordId) -> Vec<KnownHostEntry> {
        self.entries
            .read()
            .get(&record)
            .cloned()
            .unwrap_or_default()
    }

    fn entry_for(&self, record: HostRecordId, algorithm: &str) -> Option<KnownHostEntry> {
        self.entries
            .read()
            .get(&record)
            .and_then(|entries| entries.iter().find(|e| e.algorithm == algorithm))
            .cloned()
    }

    fn record(&self, mut entry: KnownHostEntry) -> Result<(), TrustStoreError> {
        entry.hostname = normalize_hostname(&entry.hostname);
        let mut entries = self.entries.write();
        let slot = entries.entry(entry.host_record_id).or_default();
        slot.retain(|e| e.algorithm != entry.algorithm);
        slot.push(entry);
        Ok(())
    }

    fn remove(
        &self,
        record: HostRecordId,
        algorithm: &str,
        key: &[u8],
    ) -> Result<bool, TrustStoreError> {
        let mut entries = self.entries.write();
        let Some(slot) = entries.get_mut(&record) else {
            return Ok(false);
        };
        let before = slot.len();
        slot.retain(|e| !(e.algorithm == algorithm && e.key == key));
        Ok(slot.len() != before)
    }

    fn remove_all(&self, record: HostRecordId) -> Result<usize, TrustStoreError> {
        Ok(self
            .entries
            .write()
            .remove(&record)
            .map(|v| v.len())
            .unwrap_or(0))
    }
}

/// File-backed trust store with an in-memory cache.
///
/// The file is the source of truth across restarts; the cache serves reads.
/// Mutations update the cache first, then persist. New entries append; any
/// replacement or removal rewrites the whole file.
pub struct FileTrustStore {
    path: PathBuf,
    cache: RwLock<HashMap<HostRecordId, Vec<KnownHostEntry>>>,
}

impl FileTrustStore {
    /// Open a store at `path`. A missing file is an empty store; an
    /// unreadable one starts empty with a warning.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            path: path.into(),
            cache: RwLock::new(HashMap::new()),
        };
        if let Err(e) = store.load() {
            tracing::warn!(
                "Failed to load known hosts from {}: {}",
                store.path.display(),
                e
            );
        }
        store
    }

    /// Default location: `~/.ironterm/known_hosts`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ironterm").join("known_hosts"))
    }

    fn load(&self) -> Result<(), TrustStoreError> {
        if !self.path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let mut cache = self.cache.write();
        cache.clear();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some(entry) => cache.entry(entry.host_record_id).or_default().push(entry),
                None => {
                    tracing::warn!(
                        "Skipping malformed known-hosts line {} in {}",
                        line_no + 1,
                        self.path.display()
                    );
                }
            }
        }
        Ok(())
    }

    fn append_entry(&self, entry: &KnownHostEntry) -> Result<(), TrustStoreError> {
        use std::io::Write;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", format_line(entry))?;
        Ok(())
    }

    fn rewrite(&self) -> Result<(), TrustStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let cache = self.cache.read();
        let mut records: Vec<_> = cache.keys().copied().collect();
        records.sort();
        let mut content = String::new();
        for record in records {
            for entry in &cache[&record] {
                content.push_str(&format_line(entry));
                content.push('\n');
            }
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    #[cfg(test)]
    fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl HostTrustStore for FileTrustStore {
    fn entries_for(&self, record: HostRecordId) -> Vec<KnownHostEntry> {
        self.cache
            .read()
            .get(&record)
            .cloned()
            .unwrap_or_default()
    }

    fn entry_for(&self, record: HostRecordId, algorithm: &str) -> Option<KnownHostEntry> {
        self.cache
            .read()
            .get(&record)
            .and_then(|entries| entries.iter().find(|e| e.algorithm == algorithm))
            .cloned()
    }

    fn record(&self, mut entry: KnownHostEntry) -> Result<(), TrustStoreError> {
        entry.hostname = normalize_hostname(&entry.hostname);
        let replaced = {
            let mut cache = self.cache.write();
            let slot = cache.entry(entry.host_record_id).or_default();
            let before = slot.len();
            slot.retain(|e| e.algorithm != entry.algorithm);
            let replaced = slot.len() != before;
            slot.push(entry.clone());
            replaced
        };
        if replaced {
            self.rewrite()
        } else {
            self.append_entry(&entry)
        }
    }

    fn remove(
        &self,
        record: HostRecordId,
        algorithm: &str,
        key: &[u8],
    ) -> Result<bool, TrustStoreError> {
        let removed = {
            let mut cache = self.cache.write();
            let Some(slot) = cache.get_mut(&record) else {
                return Ok(false);
            };
            let before = slot.len();
            slot.retain(|e| !(e.algorithm == algorithm && e.key == key));
            let removed = slot.len() != before;
            if slot.is_empty() {
                cache.remove(&record);
            }
            removed
        };
        if removed {
            self.rewrite()?;
        }
        Ok(removed)
    }

    fn remove_all(&self, record: HostRecordId) -> Result<usize, TrustStoreError> {
        let removed = self
            .cache
            .write()
            .remove(&record)
            .map(|v| v.len())
            .unwrap_or(0);
        if removed > 0 {
            self.rewrite()?;
        }
        Ok(removed)
    }
}

fn format_line(entry: &KnownHostEntry) -> String {
    format!(
        "{} {} {} {} {}",
        entry.host_record_id,
        entry.hostname,
        entry.port,
        entry.algorithm,
        BASE64.encode(&entry.key)
    )
}

fn parse_line(line: &str) -> Option<KnownHostEntry> {
    let mut parts = line.split_whitespace();
    let record_id: i64 = parts.next()?.parse().ok()?;
    let hostname = parts.next()?.to_string();
    let port: u16 = parts.next()?.parse().ok()?;
    let algorithm = parts.next()?.to_string();
    let key = BASE64.decode(parts.next()?).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(KnownHostEntry {
        host_record_id: HostRecordId(record_id),
        hostname,
        port,
        algorithm,
        key,
    })
}
