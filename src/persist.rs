//! Breaker state durability
//!
//! One row per tool. Sample history is deliberately not persisted: it is
//! advisory and rebuilds from live traffic after a restart.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use toolguard_core::BreakerPhase;
use tracing::debug;

use crate::{Error, Result};

/// Persisted breaker row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerRecord {
    /// Tool id
    pub tool_id: String,
    /// Phase at save time
    pub phase: BreakerPhase,
    /// Failures in the current window
    pub failure_count: u32,
    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// Opens since the last successful probe
    pub consecutive_opens: u32,
    /// Last state change
    pub updated_at: DateTime<Utc>,
}

/// Storage backend for breaker rows
#[async_trait]
pub trait BreakerStore: Send + Sync {
    /// Load every row
    async fn load(&self) -> Result<Vec<BreakerRecord>>;
    /// Replace the whole table
    async fn save(&self, records: &[BreakerRecord]) -> Result<()>;
}

/// Whole-table JSON file, replaced atomically on save
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store rows at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BreakerStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<BreakerRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let records: Vec<BreakerRecord> = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Persist(format!("{}: {e}", self.path.display())))?;
                debug!(path = %self.path.display(), rows = records.len(), "Loaded breaker state");
                Ok(records)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No breaker state file, starting fresh");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, records: &[BreakerRecord]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), rows = records.len(), "Saved breaker state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(id: &str, phase: BreakerPhase) -> BreakerRecord {
        BreakerRecord {
            tool_id: id.to_string(),
            phase,
            failure_count: 2,
            opened_at: DateTime::from_timestamp(1_700_000_000, 0),
            consecutive_opens: 1,
            updated_at: DateTime::from_timestamp(1_700_000_100, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("breakers.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("breakers.json"));
        let rows = vec![row("a", BreakerPhase::Open), row("b", BreakerPhase::Closed)];
        store.save(&rows).await.unwrap();
        assert_eq!(store.load().await.unwrap(), rows);
        assert!(!dir.path().join("breakers.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_persist_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breakers.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = JsonFileStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, Error::Persist(_)));
    }
}
