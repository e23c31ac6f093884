//! Per-instance record of what the migrator did, optionally persisted as
//! JSON so later processes see the same history.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::parse_zone;
use crate::error::{DalError, Result};
use crate::schema::{FieldType, Table};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSnapshot {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

/// Left behind when DDL failed part way on a backend that cannot roll DDL
/// back. Blocks further migrations of the table until cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialMarker {
    pub at: DateTime<Utc>,
    pub message: String,
    /// DDL that had already been applied when the failure happened.
    pub applied: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Columns as of the last successful migration.
    #[serde(default)]
    pub columns: Vec<ColumnSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialMarker>,
    /// Recorded by a fake migration; nothing was checked against the backend.
    #[serde(default)]
    pub fake: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    zone: Option<String>,
    #[serde(default)]
    tables: BTreeMap<String, LedgerEntry>,
}

#[derive(Debug, Default)]
pub struct Ledger {
    file: LedgerFile,
    path: Option<PathBuf>,
}

impl Ledger {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the ledger for `key` from `folder`, or start an empty one bound
    /// to that file.
    pub fn load(folder: &Path, key: u64) -> Result<Self> {
        let path = folder.join(format!("{key:016x}.ledger.json"));
        let file = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                DalError::Config(format!("corrupt migration ledger {}: {e}", path.display()))
            })?
        } else {
            LedgerFile::default()
        };
        debug!(path = %path.display(), tables = file.tables.len(), "migration ledger loaded");
        Ok(Self {
            file,
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The zone naive timestamps were written in, once one has been recorded.
    pub fn zone(&self) -> Result<Option<FixedOffset>> {
        match &self.file.zone {
            Some(z) => parse_zone(z)
                .map(Some)
                .ok_or_else(|| DalError::Config(format!("ledger records a bad zone {z:?}"))),
            None => Ok(None),
        }
    }

    pub fn set_zone(&mut self, zone: FixedOffset) {
        self.file.zone = Some(zone.to_string());
    }

    pub fn entry(&self, table: &str) -> Option<&LedgerEntry> {
        self.file.tables.get(table)
    }

    pub fn partial(&self, table: &str) -> Option<&PartialMarker> {
        self.entry(table).and_then(|e| e.partial.as_ref())
    }

    pub fn record_synchronized(&mut self, table: &Table, fake: bool) {
        let entry = self.file.tables.entry(table.name().to_string()).or_default();
        entry.columns = table
            .fields()
            .iter()
            .map(|f| ColumnSnapshot {
                name: f.name.clone(),
                field_type: f.field_type.clone(),
                nullable: f.nullable,
            })
            .collect();
        entry.partial = None;
        entry.fake = fake;
        entry.updated_at = Some(Utc::now());
    }

    pub fn record_partial(&mut self, table: &str, message: String, applied: Vec<String>) {
        let entry = self.file.tables.entry(table.to_string()).or_default();
        entry.partial = Some(PartialMarker {
            at: Utc::now(),
            message,
            applied,
        });
        entry.updated_at = Some(Utc::now());
    }

    /// Returns whether a marker was present.
    pub fn clear_partial(&mut self, table: &str) -> bool {
        self.file
            .tables
            .get_mut(table)
            .and_then(|e| e.partial.take())
            .is_some()
    }

    pub fn forget(&mut self, table: &str) {
        self.file.tables.remove(table);
    }

    /// Write the ledger back to its file. No-op for in-memory ledgers.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.file)
            .map_err(|e| DalError::Config(format!("cannot encode migration ledger: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;

    #[test]
    fn test_persisted_ledger_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::builder("person")
            .field(Field::new("name", FieldType::string(32)))
            .build()
            .unwrap();

        let mut ledger = Ledger::load(dir.path(), 42).unwrap();
        assert_eq!(ledger.zone().unwrap(), None);
        ledger.set_zone(FixedOffset::east_opt(2 * 3600).unwrap());
        ledger.record_synchronized(&table, false);
        ledger.record_partial("dog", "boom".into(), vec!["ALTER TABLE dog".into()]);
        ledger.save().unwrap();

        let reloaded = Ledger::load(dir.path(), 42).unwrap();
        assert_eq!(
            reloaded.zone().unwrap(),
            FixedOffset::east_opt(2 * 3600)
        );
        let entry = reloaded.entry("person").unwrap();
        assert_eq!(entry.columns.len(), 2);
        assert_eq!(entry.columns[1].field_type, FieldType::string(32));
        assert_eq!(reloaded.partial("dog").unwrap().applied.len(), 1);
    }

    #[test]
    fn test_clear_partial() {
        let mut ledger = Ledger::in_memory();
        assert!(!ledger.clear_partial("dog"));
        ledger.record_partial("dog", "boom".into(), Vec::new());
        assert!(ledger.clear_partial("dog"));
        assert!(ledger.partial("dog").is_none());
        ledger.save().unwrap();
    }

    #[test]
    fn test_corrupt_ledger_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(format!("{:016x}.ledger.json", 7u64)), "{not json").unwrap();
        assert!(matches!(
            Ledger::load(dir.path(), 7),
            Err(DalError::Config(_))
        ));
    }
}
