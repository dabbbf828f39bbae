//! Live subscriptions that keep a [`ReportStore`] in step with the remote store.
//!
//! Each collection is either stopped or has exactly one listener task. Every
//! event carries the full listing and rebuilds the snapshot from it.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tokio::task::JoinHandle;

use crate::db_client::ChangeStream;
use crate::gateway::{decode_companies, decode_reports};
use crate::store::{ReportSource, ReportStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Reports,
    Companies,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Reports, Collection::Companies];
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collection::Reports => write!(f, "reports"),
            Collection::Companies => write!(f, "companies"),
        }
    }
}

/// A source that can push full listings whenever a collection changes.
pub trait LiveSource: Send + Sync + 'static {
    fn watch(&self, collection: Collection) -> ChangeStream;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Stopped,
    Active,
}

enum Subscription {
    Stopped,
    Active(JoinHandle<()>),
}

impl Subscription {
    fn state(&self) -> SubscriptionState {
        match self {
            Subscription::Stopped => SubscriptionState::Stopped,
            Subscription::Active(_) => SubscriptionState::Active,
        }
    }
}

pub struct SyncEngine<S: ReportSource + LiveSource> {
    store: ReportStore<S>,
    reports: Mutex<Subscription>,
    companies: Mutex<Subscription>,
}

impl<S: ReportSource + LiveSource> fmt::Debug for SyncEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("reports", &self.state(Collection::Reports))
            .field("companies", &self.state(Collection::Companies))
            .finish()
    }
}

impl<S: ReportSource + LiveSource> SyncEngine<S> {
    pub fn new(store: ReportStore<S>) -> Self {
        Self {
            store,
            reports: Mutex::new(Subscription::Stopped),
            companies: Mutex::new(Subscription::Stopped),
        }
    }

    pub fn store(&self) -> &ReportStore<S> {
        &self.store
    }

    fn slot(&self, collection: Collection) -> MutexGuard<'_, Subscription> {
        let slot = match collection {
            Collection::Reports => &self.reports,
            Collection::Companies => &self.companies,
        };
        slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self, collection: Collection) -> SubscriptionState {
        self.slot(collection).state()
    }

    /// Registers the listener for `collection`. Does nothing when already
    /// active; returns whether a listener was started. Must be called from
    /// within a tokio runtime.
    pub fn start(&self, collection: Collection) -> bool {
        let mut slot = self.slot(collection);
        if let Subscription::Active(_) = *slot {
            tracing::debug!("Live sync for {} already active", collection);
            return false;
        }

        let stream = self.store.source().watch(collection);
        let task = tokio::spawn(listen(self.store.clone(), collection, stream));
        *slot = Subscription::Active(task);
        tracing::info!("Live sync for {} started", collection);
        true
    }

    /// Deregisters the listener for `collection`. Safe to call when already
    /// stopped; returns whether a listener was stopped.
    pub fn stop(&self, collection: Collection) -> bool {
        let previous = std::mem::replace(&mut *self.slot(collection), Subscription::Stopped);
        match previous {
            Subscription::Active(task) => {
                task.abort();
                tracing::info!("Live sync for {} stopped", collection);
                true
            }
            Subscription::Stopped => false,
        }
    }

    pub fn start_all(&self) {
        for collection in Collection::ALL {
            self.start(collection);
        }
    }

    pub fn stop_all(&self) {
        for collection in Collection::ALL {
            self.stop(collection);
        }
    }
}

impl<S: ReportSource + LiveSource> Drop for SyncEngine<S> {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn listen<S: ReportSource + LiveSource>(
    store: ReportStore<S>,
    collection: Collection,
    mut stream: ChangeStream,
) {
    while let Some(event) = stream.next().await {
        match event {
            Ok(documents) => {
                tracing::debug!("{} update with {} document(s)", collection, documents.len());
                match collection {
                    Collection::Reports => store.replace_reports(decode_reports(&documents)),
                    Collection::Companies => store.replace_companies(decode_companies(&documents)),
                }
            }
            // one bad event must not end the subscription
            Err(e) => tracing::warn!("Live sync error on {}: {:#}", collection, e),
        }
    }
    tracing::debug!("Change stream for {} closed", collection);
}
