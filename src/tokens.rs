//! Persistent capability token store.
//!
//! Tokens live in `tokens.jsonl` under the data directory, one JSON record
//! per line.  Records are keyed by the SHA-256 of the token so the bearer
//! value itself never touches disk.  Revocation appends a tombstone
//! (`_deleted: true`); opening the store replays the file, drops tombstoned
//! and expired records and rewrites it compacted.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::info;

use crate::auth::Privilege;

const TOKENS_FILE: &str = "tokens.jsonl";

/// One issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Hex SHA-256 of the bearer token.
    pub hash: String,
    /// Free-form label (the requesting key id, or an admin note).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub privileges: Vec<Privilege>,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub expires_at: i64,
}

impl TokenRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonToken {
    #[serde(flatten)]
    record: TokenRecord,
    #[serde(default)]
    _deleted: bool,
}

/// Tombstones carry only the hash.
#[derive(Debug, Serialize, Deserialize)]
struct JsonTombstone {
    hash: String,
    _deleted: bool,
}

#[derive(Debug, Deserialize)]
struct JsonLine {
    hash: String,
    #[serde(default)]
    _deleted: bool,
}

/// File-backed token store shared by the auth engine and the admin tool.
pub struct TokenStore {
    path: PathBuf,
    records: RwLock<HashMap<String, TokenRecord>>,
}

impl TokenStore {
    /// Open (or create) the store under `data_dir`.
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(TOKENS_FILE);
        let mut records = Self::load(&path)?;

        let now = now_secs();
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        if before != records.len() {
            info!("Dropped {} expired tokens", before - records.len());
        }

        let store = Self {
            path,
            records: RwLock::new(records),
        };
        store.compact()?;
        Ok(store)
    }

    fn load(path: &Path) -> anyhow::Result<HashMap<String, TokenRecord>> {
        let mut records = HashMap::new();
        if !path.exists() {
            return Ok(records);
        }
        let reader = BufReader::new(std::fs::File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let head: JsonLine = serde_json::from_str(&line)?;
            if head._deleted {
                records.remove(&head.hash);
                continue;
            }
            let token: JsonToken = serde_json::from_str(&line)?;
            records.insert(token.record.hash.clone(), token.record);
        }
        Ok(records)
    }

    /// Persist a new token and return its record.
    pub fn insert(
        &self,
        token: &str,
        label: Option<String>,
        privileges: Vec<Privilege>,
        ttl: Duration,
    ) -> anyhow::Result<TokenRecord> {
        let now = now_secs();
        let record = TokenRecord {
            hash: hash_token(token),
            label,
            privileges,
            created_at: now,
            expires_at: now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)),
        };

        let mut records = self.write()?;
        let line = serde_json::to_string(&JsonToken {
            record: record.clone(),
            _deleted: false,
        })?;
        self.append_line(&line)?;
        records.insert(record.hash.clone(), record.clone());
        Ok(record)
    }

    /// Record for a live bearer token, if any.
    pub fn lookup(&self, token: &str) -> anyhow::Result<Option<TokenRecord>> {
        let hash = hash_token(token);
        let records = self.read()?;
        Ok(records
            .get(&hash)
            .filter(|r| !r.is_expired(now_secs()))
            .cloned())
    }

    /// All live records, oldest first.
    pub fn list(&self) -> anyhow::Result<Vec<TokenRecord>> {
        let now = now_secs();
        let records = self.read()?;
        let mut out: Vec<TokenRecord> = records
            .values()
            .filter(|r| !r.is_expired(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.hash.cmp(&b.hash)));
        Ok(out)
    }

    /// Revoke the single token whose hash starts with `prefix`.  Returns
    /// the full hash.
    pub fn revoke(&self, prefix: &str) -> anyhow::Result<String> {
        if prefix.is_empty() {
            anyhow::bail!("Hash prefix must not be empty");
        }
        let mut records = self.write()?;
        let matches: Vec<String> = records
            .keys()
            .filter(|h| h.starts_with(prefix))
            .cloned()
            .collect();
        let hash = match matches.as_slice() {
            [] => anyhow::bail!("No token matches {prefix}"),
            [one] => one.clone(),
            _ => anyhow::bail!("Prefix {prefix} matches {} tokens", matches.len()),
        };

        let line = serde_json::to_string(&JsonTombstone {
            hash: hash.clone(),
            _deleted: true,
        })?;
        self.append_line(&line)?;
        records.remove(&hash);
        Ok(hash)
    }

    fn append_line(&self, line: &str) -> anyhow::Result<()> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }

    fn compact(&self) -> anyhow::Result<()> {
        let records = self.read()?;
        let parent = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Token file has no parent directory"))?;
        let temp = NamedTempFile::new_in(parent)?;
        {
            let mut writer = BufWriter::new(&temp);
            for record in records.values() {
                let line = serde_json::to_string(&JsonToken {
                    record: record.clone(),
                    _deleted: false,
                })?;
                writeln!(writer, "{line}")?;
            }
            writer.flush()?;
        }
        temp.persist(&self.path)?;
        Ok(())
    }

    fn read(
        &self,
    ) -> anyhow::Result<std::sync::RwLockReadGuard<'_, HashMap<String, TokenRecord>>> {
        self.records
            .read()
            .map_err(|_| anyhow::anyhow!("Token store lock poisoned"))
    }

    fn write(
        &self,
    ) -> anyhow::Result<std::sync::RwLockWriteGuard<'_, HashMap<String, TokenRecord>>> {
        self.records
            .write()
            .map_err(|_| anyhow::anyhow!("Token store lock poisoned"))
    }
}

/// Hex SHA-256 of a bearer token.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
