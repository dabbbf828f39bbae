//! Durable storage for reports created on this device and not yet confirmed
//! by the remote store.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use native_db::{Builder, Database, Models};
use once_cell::sync::OnceCell;

use crate::models::{LocalRecordSet, Report};

/// Fixed key holding the serialized local-only report list.
pub const LOCAL_REPORTS_KEY: &str = "local_reports";

static MODELS: OnceCell<Models> = OnceCell::new();

fn models() -> Result<&'static Models> {
    MODELS.get_or_try_init(|| {
        let mut models = Models::new();
        models.define::<LocalRecordSet>()?;
        Ok(models)
    })
}

#[derive(Clone)]
pub struct LocalCache {
    database: Arc<Database<'static>>,
    fail_writes: Arc<AtomicBool>,
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache").finish_non_exhaustive()
    }
}

impl LocalCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let database = Builder::new().create(models()?, path)?;
        tracing::debug!("Opened local cache at {}", path.display());
        Ok(Self::from_database(database))
    }

    pub fn open_in_memory() -> Result<Self> {
        let database = Builder::new().create_in_memory(models()?)?;
        Ok(Self::from_database(database))
    }

    fn from_database(database: Database<'static>) -> Self {
        Self {
            database: Arc::new(database),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes every write on this cache and its clones fail until reset.
    #[cfg(test)]
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrites the stored set with the local-only subset of `reports`.
    pub fn persist_local_only(&self, reports: &[Report]) -> Result<()> {
        let local: Vec<&Report> = reports.iter().filter(|r| r.is_local_only).collect();
        let payload = serde_json::to_string(&local)?;
        self.write_raw(LOCAL_REPORTS_KEY, payload)?;
        tracing::debug!("Persisted {} local-only report(s)", local.len());
        Ok(())
    }

    /// Stored local-only reports. Empty when absent, unreadable or corrupt.
    pub fn load_local_only(&self) -> Vec<Report> {
        let record = match self.read_raw(LOCAL_REPORTS_KEY) {
            Ok(Some(record)) => record,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to read local cache: {:#}", e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<Report>>(&record.payload) {
            Ok(mut reports) => {
                // entries are local-only by construction, even if the flag was lost
                for report in &mut reports {
                    report.is_local_only = true;
                }
                tracing::debug!(
                    "Loaded {} local-only report(s) saved at {}",
                    reports.len(),
                    record.saved_at
                );
                reports
            }
            Err(e) => {
                tracing::warn!("Discarding corrupt local cache entry: {}", e);
                Vec::new()
            }
        }
    }

    fn read_raw(&self, key: &str) -> Result<Option<LocalRecordSet>> {
        let r = self.database.r_transaction()?;
        let record: Option<LocalRecordSet> = r.get().primary(key.to_string())?;
        Ok(record)
    }

    pub(crate) fn write_raw(&self, key: &str, payload: String) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("local cache write rejected");
        }
        let rw = self.database.rw_transaction()?;
        rw.upsert(LocalRecordSet::new(key, payload))?;
        rw.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReportDraft, ReportId, DEFAULT_LOCATION};
    use tempfile::tempdir;

    fn report(id: i64, local: bool) -> Report {
        let mut report = Report::from_draft(
            ReportId::Numeric(id),
            ReportDraft::new(format!("report {}", id), DEFAULT_LOCATION),
        );
        report.is_local_only = local;
        report
    }

    #[test]
    fn test_empty_cache_loads_nothing() {
        let cache = LocalCache::open_in_memory().unwrap();
        assert!(cache.load_local_only().is_empty());
    }

    #[test]
    fn test_only_local_records_are_persisted() {
        let cache = LocalCache::open_in_memory().unwrap();
        cache
            .persist_local_only(&[report(1, false), report(4, true), report(5, true)])
            .unwrap();

        let loaded = cache.load_local_only();
        let ids: Vec<ReportId> = loaded.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![ReportId::Numeric(4), ReportId::Numeric(5)]);
        assert!(loaded.iter().all(|r| r.is_local_only));
    }

    #[test]
    fn test_persist_overwrites_previous_contents() {
        let cache = LocalCache::open_in_memory().unwrap();
        cache.persist_local_only(&[report(4, true), report(5, true)]).unwrap();
        cache.persist_local_only(&[report(6, true)]).unwrap();

        let loaded = cache.load_local_only();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, ReportId::Numeric(6));
    }

    #[test]
    fn test_corrupt_payload_loads_as_empty() {
        let cache = LocalCache::open_in_memory().unwrap();
        cache
            .write_raw(LOCAL_REPORTS_KEY, "{not json".to_string())
            .unwrap();
        assert!(cache.load_local_only().is_empty());

        cache
            .write_raw(LOCAL_REPORTS_KEY, r#"{"id": 4}"#.to_string())
            .unwrap();
        assert!(cache.load_local_only().is_empty());
    }

    #[test]
    fn test_failed_write_keeps_previous_contents() {
        let cache = LocalCache::open_in_memory().unwrap();
        cache.persist_local_only(&[report(4, true)]).unwrap();

        let clone = cache.clone();
        clone.set_fail_writes(true);
        assert!(cache.persist_local_only(&[report(5, true)]).is_err());
        assert_eq!(cache.load_local_only()[0].id, ReportId::Numeric(4));

        clone.set_fail_writes(false);
        cache.persist_local_only(&[report(5, true)]).unwrap();
        assert_eq!(cache.load_local_only()[0].id, ReportId::Numeric(5));
    }

    #[test]
    fn test_local_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("signalement.db");

        {
            let cache = LocalCache::open(&path).unwrap();
            cache.persist_local_only(&[report(7, true)]).unwrap();
        }

        let reopened = LocalCache::open(&path).unwrap();
        let loaded = reopened.load_local_only();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].description, "report 7");
    }
}
