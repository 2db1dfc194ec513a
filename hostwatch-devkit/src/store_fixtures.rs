/*!
Store fixtures

Throwaway store documents in a temp dir, plus a builder for entries in
the legacy flag layout (`current_state` / `unavailable`) so tests can
start from a document written by an older deployment.
*/

use anyhow::{Context, Result};
use hostwatch_kernel::store::{HostRecordStore, StoreError};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Store document living in its own temp dir; removed on drop.
pub struct StoreFixture {
    _dir: TempDir,
    path: PathBuf,
}

impl StoreFixture {
    /// Empty dir, no document yet.
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("Failed to create temp dir")?;
        let path = dir.path().join("state.json");
        Ok(Self { _dir: dir, path })
    }

    /// Fixture whose document holds `entries`.
    pub fn with_entries<'a>(entries: impl IntoIterator<Item = (&'a str, Value)>) -> Result<Self> {
        let fixture = Self::new()?;
        let doc: Map<String, Value> = entries
            .into_iter()
            .map(|(host, entry)| (host.to_string(), entry))
            .collect();
        fixture.write_document(&Value::Object(doc))?;
        Ok(fixture)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> Result<HostRecordStore, StoreError> {
        HostRecordStore::open(&self.path)
    }

    pub fn write_raw(&self, txt: &str) -> Result<()> {
        std::fs::write(&self.path, txt)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }

    pub fn write_document(&self, doc: &Value) -> Result<()> {
        self.write_raw(&serde_json::to_string_pretty(doc)?)
    }

    pub fn read_raw(&self) -> Result<String> {
        std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))
    }

    pub fn read_document(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.read_raw()?)?)
    }

    /// The persisted entry of `host`, as raw JSON.
    pub fn entry(&self, host: &str) -> Result<Value> {
        self.read_document()?
            .get(host)
            .cloned()
            .with_context(|| format!("no entry for {host} in store document"))
    }
}

/// Builder for one document entry in the legacy layout.
///
/// ```ignore
/// let entry = LegacyEntry::escalating(2)
///     .notified_at("2024-03-01 10:00:00.000000")
///     .checked_at("2024-03-01 10:00:00.000000")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct LegacyEntry {
    fields: Map<String, Value>,
}

impl LegacyEntry {
    fn flags(current_state: u8, unavailable: Option<u8>) -> Self {
        let mut fields = Map::new();
        fields.insert("current_state".into(), json!(current_state));
        if let Some(unavailable) = unavailable {
            fields.insert("unavailable".into(), json!(unavailable));
        }
        Self { fields }
    }

    pub fn healthy() -> Self {
        Self::flags(0, Some(0))
    }

    pub fn first_detection() -> Self {
        Self::flags(1, Some(0))
    }

    /// Escalating entry with `call_count` set.
    pub fn escalating(call_count: u32) -> Self {
        Self::flags(1, Some(1)).with("call_count", json!(call_count))
    }

    /// Escalating entry from a deployment that never wrote `call_count`.
    pub fn escalating_without_count() -> Self {
        Self::flags(1, Some(1))
    }

    /// Down entry without the `unavailable` key at all.
    pub fn without_unavailable() -> Self {
        Self::flags(1, None)
    }

    pub fn notified_at(self, ts: &str) -> Self {
        self.with("notification_last_time", json!(ts))
    }

    pub fn checked_at(self, ts: &str) -> Self {
        self.with("check_time", json!(ts))
    }

    /// Arbitrary key, for malformed or future documents.
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }
}
