/*!
 * HOST RECORD STORE - Persisted escalation state of every monitored host
 *
 * ROLE: Keeps one record per configured host (state, call counter,
 * notification and check timestamps) in a single JSON document.
 *
 * OPERATION:
 * - Whole-document load/save; every mutation rewrites the full document
 * - Writes go to a sibling temp file renamed over the document
 * - Reconciliation against the configured host list (add/remove)
 * - Legacy flags `current_state`/`unavailable` decoded into `HostState`
 */

use crate::models::{format_timestamp, parse_timestamp, HostRecord, HostState, HostsMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::PrimitiveDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store document {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("unknown host: {0}")]
    UnknownHost(String),
    #[error("host already present: {0}")]
    DuplicateHost(String),
    #[error("invalid record for {host}: {reason}")]
    InvalidRecord { host: String, reason: String },
    #[error("store {0} is locked by another run")]
    Locked(PathBuf),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Errors that concern the shared document rather than a single host.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StoreError::UnknownHost(_)
                | StoreError::DuplicateHost(_)
                | StoreError::InvalidRecord { .. }
        )
    }
}

/// Named record attributes for point lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordField {
    State,
    CallAttempts,
    LastNotificationTime,
    LastCheckTime,
}

impl RecordField {
    pub const ALL: [RecordField; 4] = [
        RecordField::State,
        RecordField::CallAttempts,
        RecordField::LastNotificationTime,
        RecordField::LastCheckTime,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    State(HostState),
    Count(u32),
    Time(PrimitiveDateTime),
}

/// Partial update merged into an existing record. `None` leaves a field as is;
/// `last_notification_time: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    pub state: Option<HostState>,
    pub call_attempts: Option<u32>,
    pub last_notification_time: Option<Option<PrimitiveDateTime>>,
    pub last_check_time: Option<PrimitiveDateTime>,
}

impl RecordPatch {
    fn apply_to(&self, record: &mut HostRecord) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(count) = self.call_attempts {
            record.call_attempts = count;
        }
        if let Some(time) = self.last_notification_time {
            record.last_notification_time = time;
        }
        if let Some(time) = self.last_check_time {
            record.last_check_time = Some(time);
        }
    }
}

impl From<&HostRecord> for RecordPatch {
    /// Patch that turns any record of the same host into `record`.
    fn from(record: &HostRecord) -> Self {
        Self {
            state: Some(record.state),
            call_attempts: Some(record.call_attempts),
            last_notification_time: Some(record.last_notification_time),
            last_check_time: record.last_check_time,
        }
    }
}

/// Outcome of `HostRecordStore::reconcile`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    /// Hosts listed more than once in the desired list.
    pub duplicates: Vec<String>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// On-disk shape of one host entry. Every key is optional on read.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordDocument {
    #[serde(default)]
    current_state: u8,
    #[serde(default)]
    unavailable: Option<u8>,
    #[serde(default)]
    call_count: u32,
    #[serde(default)]
    notification_last_time: Option<String>,
    /// Left out until the host is checked for the first time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    check_time: Option<String>,
}

impl RecordDocument {
    fn from_record(record: &HostRecord) -> Result<Self, time::error::Format> {
        let (current_state, unavailable) = match record.state {
            HostState::Healthy => (0, 0),
            HostState::FirstDetection => (1, 0),
            HostState::Escalating => (1, 1),
        };
        Ok(Self {
            current_state,
            unavailable: Some(unavailable),
            call_count: record.call_attempts,
            notification_last_time: record
                .last_notification_time
                .map(format_timestamp)
                .transpose()?,
            check_time: record.last_check_time.map(format_timestamp).transpose()?,
        })
    }

    fn into_record(self, id: &str) -> Result<HostRecord, String> {
        let state = match (self.current_state, self.unavailable.unwrap_or(0)) {
            (0, _) => HostState::Healthy,
            (1, 0) => HostState::FirstDetection,
            (1, 1) => HostState::Escalating,
            (current, unavailable) => {
                return Err(format!(
                    "host {id}: unsupported flags current_state={current} unavailable={unavailable}"
                ))
            }
        };
        let parse = |field: &str, value: Option<String>| -> Result<Option<PrimitiveDateTime>, String> {
            value
                .map(|txt| {
                    parse_timestamp(&txt)
                        .map_err(|e| format!("host {id}: bad {field} {txt:?}: {e}"))
                })
                .transpose()
        };

        let mut record = HostRecord {
            id: id.to_string(),
            state,
            call_attempts: self.call_count,
            last_notification_time: parse("notification_last_time", self.notification_last_time)?,
            last_check_time: parse("check_time", self.check_time)?,
        };

        // Recovery always clears these; older documents may still carry them.
        if record.state == HostState::Healthy
            && (record.call_attempts != 0 || record.last_notification_time.is_some())
        {
            warn!(host = %id, calls = record.call_attempts, "healthy record carried escalation leftovers, clearing");
            record.call_attempts = 0;
            record.last_notification_time = None;
        }
        Ok(record)
    }
}

/// Durable mapping host id -> `HostRecord`, backed by one JSON document.
#[derive(Debug)]
pub struct HostRecordStore {
    path: PathBuf,
    records: HostsMap,
}

impl HostRecordStore {
    /// Opens the document at `path`, creating an empty one on first run.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StoreError> {
        let mut store = Self {
            path: path.into(),
            records: BTreeMap::new(),
        };

        if store.path.exists() {
            store.records = store.load()?;
            info!(path = %store.path.display(), hosts = store.records.len(), "store loaded");
        } else {
            if let Some(parent) = store.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            store.persist()?;
            info!(path = %store.path.display(), "created empty store document");
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and decodes the persisted document. Never resets on failure.
    pub fn load(&self) -> Result<HostsMap, StoreError> {
        let content = fs::read_to_string(&self.path)?;
        let corrupt = |reason: String| StoreError::Corrupt {
            path: self.path.clone(),
            reason,
        };

        let document: BTreeMap<String, RecordDocument> =
            serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;

        document
            .into_iter()
            .map(|(id, doc)| {
                let record = doc.into_record(&id).map_err(corrupt)?;
                Ok((id, record))
            })
            .collect()
    }

    /// Replaces the whole store with `records` and writes it out.
    pub fn save(&mut self, records: HostsMap) -> Result<(), StoreError> {
        write_document(&self.path, &records)?;
        self.records = records;
        Ok(())
    }

    fn persist(&self) -> Result<(), StoreError> {
        write_document(&self.path, &self.records)
    }

    pub fn records(&self) -> &HostsMap {
        &self.records
    }

    pub fn record(&self, id: &str) -> Option<&HostRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Point lookup; unknown hosts and unset fields come back as `None`.
    pub fn get(&self, id: &str, fields: &[RecordField]) -> BTreeMap<RecordField, Option<FieldValue>> {
        let record = self.records.get(id);
        fields
            .iter()
            .map(|field| {
                let value = record.and_then(|r| match field {
                    RecordField::State => Some(FieldValue::State(r.state)),
                    RecordField::CallAttempts => Some(FieldValue::Count(r.call_attempts)),
                    RecordField::LastNotificationTime => r.last_notification_time.map(FieldValue::Time),
                    RecordField::LastCheckTime => r.last_check_time.map(FieldValue::Time),
                });
                (*field, value)
            })
            .collect()
    }

    /// Merges `patch` into the record of `id` and persists the store.
    pub fn update(&mut self, id: &str, patch: &RecordPatch) -> Result<HostRecord, StoreError> {
        let current = self
            .records
            .get(id)
            .ok_or_else(|| StoreError::UnknownHost(id.to_string()))?;

        let mut next = current.clone();
        patch.apply_to(&mut next);
        if next.state == HostState::Healthy && next.call_attempts != 0 {
            return Err(StoreError::InvalidRecord {
                host: id.to_string(),
                reason: format!("healthy host with {} call attempts", next.call_attempts),
            });
        }

        let previous = self.records.insert(id.to_string(), next.clone());
        if let Err(e) = self.persist() {
            if let Some(previous) = previous {
                self.records.insert(id.to_string(), previous);
            }
            return Err(e);
        }
        debug!(host = %id, state = %next.state, calls = next.call_attempts, "record updated");
        Ok(next)
    }

    /// Inserts a fresh healthy record and persists the store.
    pub fn add_host(&mut self, id: &str) -> Result<(), StoreError> {
        if self.records.contains_key(id) {
            return Err(StoreError::DuplicateHost(id.to_string()));
        }
        self.records.insert(id.to_string(), HostRecord::new(id));
        if let Err(e) = self.persist() {
            self.records.remove(id);
            return Err(e);
        }
        info!(host = %id, "host added");
        Ok(())
    }

    /// Drops the record of `id` and persists the store.
    pub fn remove_host(&mut self, id: &str) -> Result<HostRecord, StoreError> {
        let removed = self
            .records
            .remove(id)
            .ok_or_else(|| StoreError::UnknownHost(id.to_string()))?;
        if let Err(e) = self.persist() {
            self.records.insert(id.to_string(), removed);
            return Err(e);
        }
        info!(host = %id, "host removed");
        Ok(removed)
    }

    /// Makes the stored host set equal to `desired`.
    ///
    /// Existing records of hosts that stay are left untouched. A host listed
    /// twice is reported as a duplicate and otherwise handled once.
    pub fn reconcile(&mut self, desired: &[String]) -> Result<Reconciliation, StoreError> {
        let mut report = Reconciliation::default();
        let mut wanted = BTreeSet::new();
        for host in desired {
            if !wanted.insert(host.as_str()) {
                let err = StoreError::DuplicateHost(host.clone());
                warn!(error = %err, "duplicate host in configuration");
                report.duplicates.push(host.clone());
            }
        }

        for host in &wanted {
            if !self.records.contains_key(*host) {
                self.records.insert(host.to_string(), HostRecord::new(*host));
                report.added.insert(host.to_string());
            }
        }

        self.records.retain(|id, _| {
            let keep = wanted.contains(id.as_str());
            if !keep {
                report.removed.insert(id.clone());
            }
            keep
        });

        if !report.is_noop() {
            self.persist()?;
            info!(added = ?report.added, removed = ?report.removed, "store reconciled");
        }
        Ok(report)
    }
}

/// Writes the document next to `path` then renames it into place.
fn write_document(path: &Path, records: &HostsMap) -> Result<(), StoreError> {
    let document = records
        .iter()
        .map(|(id, record)| {
            RecordDocument::from_record(record)
                .map(|doc| (id.as_str(), doc))
                .map_err(|e| StoreError::InvalidRecord {
                    host: id.clone(),
                    reason: e.to_string(),
                })
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    document.serialize(&mut ser)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state.json".to_string());
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    if let Err(e) = replace_with(&tmp_path, path, &buf) {
        if let Err(cleanup) = fs::remove_file(&tmp_path) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp_path.display(), error = %cleanup, "could not remove temp store file");
            }
        }
        return Err(e.into());
    }
    Ok(())
}

fn replace_with(tmp_path: &Path, path: &Path, buf: &[u8]) -> std::io::Result<()> {
    let mut tmp = fs::File::create(tmp_path)?;
    tmp.write_all(buf)?;
    tmp.sync_all()?;
    drop(tmp);
    fs::rename(tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::macros::datetime;

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|h| h.to_string()).collect()
    }

    fn open_in(dir: &TempDir) -> HostRecordStore {
        HostRecordStore::open(dir.path().join("state.json")).unwrap()
    }

    #[test]
    fn test_open_creates_empty_document() {
        let dir = TempDir::new().unwrap();
        let store = open_in(&dir);
        assert!(store.records().is_empty());
        let txt = fs::read_to_string(dir.path().join("state.json")).unwrap();
        assert_eq!(txt.trim(), "{}");
    }

    #[test]
    fn test_corrupt_document_is_reported_not_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{\"10.0.0.1\": {\"current_state\": ").unwrap();

        let err = HostRecordStore::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(err.is_fatal());
        // document left as found
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"10.0.0.1\": {\"current_state\": ");
    }

    #[test]
    fn test_bad_timestamp_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"gw": {"current_state": 1, "unavailable": 1, "notification_last_time": "soon"}}"#).unwrap();
        assert!(matches!(HostRecordStore::open(&path), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_legacy_flags_decode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{
                "a": {"current_state": 0},
                "b": {"current_state": 1, "check_time": "2024-01-01 10:00:00.500000"},
                "c": {"current_state": 1, "unavailable": 1, "notification_last_time": "2024-01-01 10:00:00", "check_time": "2024-01-01 10:00:00"},
                "d": {"current_state": 0, "unavailable": 0, "call_count": 0, "notification_last_time": null}
            }"#,
        )
        .unwrap();

        let store = HostRecordStore::open(&path).unwrap();
        assert_eq!(store.record("a").unwrap().state, HostState::Healthy);
        assert_eq!(store.record("b").unwrap().state, HostState::FirstDetection);
        assert_eq!(
            store.record("b").unwrap().last_check_time,
            Some(datetime!(2024-01-01 10:00:00.5))
        );
        let c = store.record("c").unwrap();
        assert_eq!(c.state, HostState::Escalating);
        // legacy escalation entry without call_count
        assert_eq!(c.call_attempts, 0);
        assert_eq!(c.last_notification_time, Some(datetime!(2024-01-01 10:00:00)));
        assert!(store.record("d").unwrap().last_notification_time.is_none());
    }

    #[test]
    fn test_unknown_flags_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"gw": {"current_state": 7}}"#).unwrap();
        assert!(matches!(HostRecordStore::open(&path), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_save_writes_every_key() {
        let dir = TempDir::new().unwrap();
        let mut store = open_in(&dir);
        let mut records = HostsMap::new();
        records.insert(
            "gw".into(),
            HostRecord {
                id: "gw".into(),
                state: HostState::Escalating,
                call_attempts: 2,
                last_notification_time: Some(datetime!(2024-03-01 12:00:00)),
                last_check_time: Some(datetime!(2024-03-01 12:05:00.25)),
            },
        );
        store.save(records).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["gw"]["current_state"], 1);
        assert_eq!(raw["gw"]["unavailable"], 1);
        assert_eq!(raw["gw"]["call_count"], 2);
        assert_eq!(raw["gw"]["notification_last_time"], "2024-03-01 12:00:00.000000");
        assert_eq!(raw["gw"]["check_time"], "2024-03-01 12:05:00.250000");
        assert!(!dir.path().join(".state.json.tmp").exists());

        let reopened = open_in(&dir);
        assert_eq!(reopened.records(), store.records());
    }

    #[test]
    fn test_reconcile_adds_and_removes() {
        let dir = TempDir::new().unwrap();
        let mut store = open_in(&dir);
        store.reconcile(&hosts(&["a", "b"])).unwrap();

        let report = store.reconcile(&hosts(&["b", "c"])).unwrap();
        assert_eq!(report.added, BTreeSet::from(["c".to_string()]));
        assert_eq!(report.removed, BTreeSet::from(["a".to_string()]));
        assert_eq!(open_in(&dir).records().keys().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = open_in(&dir);
        store.reconcile(&hosts(&["a", "b"])).unwrap();
        store
            .update(
                "a",
                &RecordPatch {
                    state: Some(HostState::FirstDetection),
                    ..Default::default()
                },
            )
            .unwrap();

        let second = store.reconcile(&hosts(&["a", "b"])).unwrap();
        assert!(second.added.is_empty());
        assert!(second.removed.is_empty());
        assert_eq!(store.record("a").unwrap().state, HostState::FirstDetection);
    }

    #[test]
    fn test_reconcile_reports_duplicates() {
        let dir = TempDir::new().unwrap();
        let mut store = open_in(&dir);
        let report = store.reconcile(&hosts(&["a", "b", "a"])).unwrap();
        assert_eq!(report.duplicates, vec!["a".to_string()]);
        assert_eq!(report.added.len(), 2);
        assert_eq!(store.records().len(), 2);
    }

    #[test]
    fn test_get_marks_absent_values() {
        let dir = TempDir::new().unwrap();
        let mut store = open_in(&dir);
        store.add_host("a").unwrap();

        let values = store.get("a", &RecordField::ALL);
        assert_eq!(values[&RecordField::State], Some(FieldValue::State(HostState::Healthy)));
        assert_eq!(values[&RecordField::CallAttempts], Some(FieldValue::Count(0)));
        assert_eq!(values[&RecordField::LastNotificationTime], None);

        let missing = store.get("nope", &[RecordField::State]);
        assert_eq!(missing[&RecordField::State], None);
    }

    #[test]
    fn test_update_unknown_host_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = open_in(&dir);
        let err = store.update("ghost", &RecordPatch::default()).unwrap_err();
        assert!(matches!(err, StoreError::UnknownHost(ref h) if h == "ghost"));
        assert!(!err.is_fatal());
        assert!(!store.contains("ghost"));
    }

    #[test]
    fn test_update_merges_and_persists() {
        let dir = TempDir::new().unwrap();
        let mut store = open_in(&dir);
        store.add_host("a").unwrap();
        let now = datetime!(2024-05-05 05:05:05);
        store
            .update(
                "a",
                &RecordPatch {
                    state: Some(HostState::Escalating),
                    call_attempts: Some(1),
                    last_notification_time: Some(Some(now)),
                    last_check_time: Some(now),
                },
            )
            .unwrap();
        store
            .update(
                "a",
                &RecordPatch {
                    last_check_time: Some(now + time::Duration::minutes(1)),
                    ..Default::default()
                },
            )
            .unwrap();

        let record = open_in(&dir).record("a").cloned().unwrap();
        assert_eq!(record.call_attempts, 1);
        assert_eq!(record.last_notification_time, Some(now));
        assert_eq!(record.last_check_time, Some(now + time::Duration::minutes(1)));
    }

    #[test]
    fn test_update_refuses_healthy_with_calls() {
        let dir = TempDir::new().unwrap();
        let mut store = open_in(&dir);
        store.add_host("a").unwrap();
        let err = store
            .update(
                "a",
                &RecordPatch {
                    call_attempts: Some(3),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { .. }));
        assert_eq!(store.record("a").unwrap().call_attempts, 0);
    }

    #[test]
    fn test_unchecked_host_has_no_check_time_key() {
        let dir = TempDir::new().unwrap();
        let mut store = open_in(&dir);
        store.add_host("gw").unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert!(raw["gw"].get("check_time").is_none());
        assert_eq!(raw["gw"]["notification_last_time"], serde_json::Value::Null);
        assert_eq!(open_in(&dir).record("gw").unwrap().last_check_time, None);
    }

    #[test]
    fn test_failed_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        // a directory in place of the document makes the rename fail
        let path = dir.path().join("state.json");
        fs::create_dir_all(path.join("occupied")).unwrap();

        let mut records = HostsMap::new();
        records.insert("gw".into(), HostRecord::new("gw"));
        assert!(write_document(&path, &records).is_err());
        assert!(!dir.path().join(".state.json.tmp").exists());
        assert!(path.is_dir());
    }

    #[test]
    fn test_add_and_remove_host() {
        let dir = TempDir::new().unwrap();
        let mut store = open_in(&dir);
        store.add_host("a").unwrap();
        assert!(matches!(store.add_host("a"), Err(StoreError::DuplicateHost(_))));
        store.remove_host("a").unwrap();
        assert!(matches!(store.remove_host("a"), Err(StoreError::UnknownHost(_))));
        assert!(open_in(&dir).records().is_empty());
    }
}
