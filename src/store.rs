//! Reactive container for the latest known reports and companies.
//!
//! The visible report collection is always the baseline (remote or seed)
//! followed by the records kept on this device, in that order. Every view
//! hands out copies; the snapshot itself never leaves the store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::cache::LocalCache;
use crate::models::{next_local_id, Company, Report, ReportDraft, ReportId, StatusFilter};

/// Where the baseline comes from.
#[async_trait]
pub trait ReportSource: Send + Sync + 'static {
    /// Every report. Empty when there is no data or the read failed.
    async fn fetch_reports(&self) -> Vec<Report>;

    /// Companies sorted by name. Empty when there is no data or the read failed.
    async fn fetch_companies(&self) -> Vec<Company>;

    /// Creates a report and returns it with its assigned id.
    async fn create_report(&self, draft: ReportDraft) -> Result<Report>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Report {0} not found")]
    NotFound(ReportId),
    #[error("Report {0} is not local-only and cannot be deleted")]
    NotLocalOnly(ReportId),
    #[error("No numeric id left for a new local report")]
    IdSpaceExhausted,
}

#[derive(Debug, Default)]
struct Snapshot {
    baseline: Vec<Report>,
    local: Vec<Report>,
    companies: Vec<Company>,
}

impl Snapshot {
    fn reports(&self) -> impl Iterator<Item = &Report> {
        self.baseline.iter().chain(self.local.iter())
    }
}

struct Inner<S> {
    source: Arc<S>,
    cache: Option<LocalCache>,
    state: RwLock<Snapshot>,
    loading: AtomicUsize,
    revision: watch::Sender<u64>,
}

/// Counts an in-flight load for as long as it lives.
struct LoadingGuard<'a>(&'a AtomicUsize);

impl<'a> LoadingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ReportStore<S: ReportSource> {
    inner: Arc<Inner<S>>,
}

impl<S: ReportSource> Clone for ReportStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ReportSource> std::fmt::Debug for ReportStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("ReportStore")
            .field("baseline", &state.baseline.len())
            .field("local", &state.local.len())
            .field("companies", &state.companies.len())
            .field("loading", &self.is_loading())
            .finish()
    }
}

impl<S: ReportSource> ReportStore<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self::build(source, None)
    }

    /// Store backed by a local cache; previously kept local-only records are restored.
    pub fn with_cache(source: Arc<S>, cache: LocalCache) -> Self {
        Self::build(source, Some(cache))
    }

    fn build(source: Arc<S>, cache: Option<LocalCache>) -> Self {
        let local = cache
            .as_ref()
            .map(LocalCache::load_local_only)
            .unwrap_or_default();
        if !local.is_empty() {
            tracing::info!("Restored {} local-only report(s)", local.len());
        }
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                source,
                cache,
                state: RwLock::new(Snapshot {
                    local,
                    ..Default::default()
                }),
                loading: AtomicUsize::new(0),
                revision,
            }),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.inner.source
    }

    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.inner.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn bump_revision(&self) {
        self.inner.revision.send_modify(|revision| *revision += 1);
    }

    // ===== LOADING =====

    /// Replaces the baseline with a fresh fetch, even when it comes back empty.
    pub async fn reload(&self) {
        let _loading = LoadingGuard::new(&self.inner.loading);
        let reports = self.inner.source.fetch_reports().await;
        self.replace_reports(reports);
    }

    pub async fn reload_companies(&self) {
        let _loading = LoadingGuard::new(&self.inner.loading);
        let companies = self.inner.source.fetch_companies().await;
        self.replace_companies(companies);
    }

    /// Loads reports and companies concurrently.
    pub async fn init(&self) {
        tokio::join!(self.reload(), self.reload_companies());
    }

    /// True while any load is in flight.
    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn replace_reports(&self, reports: Vec<Report>) {
        {
            let mut state = self.write();
            tracing::debug!(
                "Replacing {} baseline report(s) with {}",
                state.baseline.len(),
                reports.len()
            );
            state.baseline = reports;
        }
        self.bump_revision();
    }

    pub(crate) fn replace_companies(&self, companies: Vec<Company>) {
        self.write().companies = companies;
        self.bump_revision();
    }

    // ===== VIEWS =====

    pub fn all_reports(&self) -> Vec<Report> {
        self.read().reports().cloned().collect()
    }

    pub fn all_companies(&self) -> Vec<Company> {
        self.read().companies.clone()
    }

    pub fn local_reports(&self) -> Vec<Report> {
        self.read().local.clone()
    }

    pub fn reports_filtered(&self, filter: impl Into<StatusFilter>) -> Vec<Report> {
        let filter = filter.into();
        self.read()
            .reports()
            .filter(|r| filter.matches(r.status))
            .cloned()
            .collect()
    }

    /// First visible report with this id; baseline records win over local ones.
    pub fn report(&self, id: &ReportId) -> Option<Report> {
        self.read().reports().find(|r| &r.id == id).cloned()
    }

    /// Receives a new revision number after every snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    // ===== MUTATIONS =====

    /// Creates through the source, then reloads so the snapshot shows the
    /// server-confirmed state.
    pub async fn create(&self, draft: ReportDraft) -> Result<Report> {
        let created = self.inner.source.create_report(draft).await?;
        self.reload().await;
        Ok(created)
    }

    fn persist(&self, local: &[Report]) -> Result<()> {
        match &self.inner.cache {
            Some(cache) => cache.persist_local_only(local),
            None => Ok(()),
        }
    }

    /// Keeps a report on this device under the next free numeric id.
    pub fn add_local(&self, draft: ReportDraft) -> Result<Report> {
        let report = {
            let mut state = self.write();
            let id = next_local_id(state.reports()).ok_or(StoreError::IdSpaceExhausted)?;
            let mut report = Report::from_draft(id, draft);
            report.is_local_only = true;

            let mut local = state.local.clone();
            local.push(report.clone());
            self.persist(&local)?;
            state.local = local;
            report
        };
        tracing::info!("Kept report {} locally", report.id);
        self.bump_revision();
        Ok(report)
    }

    /// Removes a local-only record. Baseline records cannot be deleted here.
    pub fn delete_local(&self, id: &ReportId) -> Result<()> {
        {
            let mut state = self.write();
            let Some(position) = state.local.iter().position(|r| &r.id == id) else {
                if state.baseline.iter().any(|r| &r.id == id) {
                    return Err(StoreError::NotLocalOnly(id.clone()).into());
                }
                return Err(StoreError::NotFound(id.clone()).into());
            };

            let mut local = state.local.clone();
            local.remove(position);
            self.persist(&local)?;
            state.local = local;
        }
        tracing::info!("Deleted local report {}", id);
        self.bump_revision();
        Ok(())
    }

    /// Drops a pushed record. It leaves the in-memory set even when the
    /// cache write fails, so this session never submits it twice.
    fn remove_local(&self, id: &ReportId) -> Result<()> {
        let persisted = {
            let mut state = self.write();
            let local: Vec<Report> = state.local.iter().filter(|r| &r.id != id).cloned().collect();
            let persisted = self.persist(&local);
            state.local = local;
            persisted
        };
        self.bump_revision();
        persisted
    }

    /// Submits each local-only record in order through the source's create
    /// path, dropping it locally once accepted. Stops at the first failure.
    /// Returns how many records were pushed.
    pub async fn push_local_only(&self) -> Result<usize> {
        let pending = self.local_reports();
        tracing::info!("Pushing {} local-only report(s)", pending.len());

        let mut pushed = 0;
        let mut outcome = Ok(());
        for report in pending {
            let created = match self.inner.source.create_report(report.to_draft()).await {
                Ok(created) => created,
                Err(e) => {
                    tracing::error!("Failed to push local report {}: {:#}", report.id, e);
                    outcome = Err(e);
                    break;
                }
            };
            tracing::info!("Local report {} pushed as {}", report.id, created.id);
            pushed += 1;

            if let Err(e) = self.remove_local(&report.id) {
                tracing::error!(
                    "Local report {} was created remotely as {} but is still in the local cache: {:#}",
                    report.id,
                    created.id,
                    e
                );
                outcome = Err(e);
                break;
            }
        }

        self.reload().await;
        outcome.map(|_| pushed)
    }
}
