//! # Report Store Integration Tests
//!
//! Exercise the store end to end against the seed baseline, the in-memory
//! document store and a durable local cache. No network access is needed:
//! ```bash
//! cargo test --test store_integration_test
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tempfile::tempdir;

use signalement_rs::models::{
    Location, ReportDraft, ReportId, ReportStatus, StatusFilter, DEFAULT_LOCATION,
};
use signalement_rs::{
    Collection, ImageHost, InMemoryDocumentStore, LocalCache, ReportGateway, ReportStore,
    SeedSource, SubscriptionState, SyncEngine,
};

/// Image host that hands out predictable URLs and can reject one upload.
#[derive(Default)]
struct StubImageHost {
    reject_index: Option<usize>,
}

#[async_trait]
impl ImageHost for StubImageHost {
    async fn upload_image(&self, _data_url: &str, index: usize) -> Result<String> {
        if Some(index) == self.reject_index {
            return Err(anyhow!("upload rejected"));
        }
        Ok(format!("https://i.ibb.co/stub/{}.jpg", index))
    }
}

type MemoryGateway = ReportGateway<InMemoryDocumentStore, StubImageHost>;

fn remote_store(host: StubImageHost) -> (InMemoryDocumentStore, ReportStore<MemoryGateway>) {
    let db = InMemoryDocumentStore::new();
    let gateway = ReportGateway::new(Arc::new(db.clone()), Arc::new(host));
    (db, ReportStore::new(Arc::new(gateway)))
}

fn photo(tag: &str) -> String {
    format!("data:image/png;base64,{}", base64::encode(tag))
}

#[tokio::test]
async fn test_seed_add_local_and_filter() {
    let cache = LocalCache::open_in_memory().unwrap();
    let store = ReportStore::with_cache(Arc::new(SeedSource::default()), cache);
    store.init().await;

    let added = store
        .add_local(ReportDraft::new("Caniveau bouché", Location::or_default(-18.9, 47.52)))
        .unwrap();
    assert_eq!(added.id, ReportId::Numeric(4));
    assert!(added.is_local_only);

    store.reload().await;
    assert_eq!(store.reports_filtered(StatusFilter::All).len(), 4);
    assert_eq!(store.reports_filtered("all".parse::<StatusFilter>().unwrap()).len(), 4);

    let resolved = store.reports_filtered(ReportStatus::Resolved);
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].id, ReportId::Numeric(3));

    // the new record counts as reported, alongside seed record 1
    assert_eq!(store.reports_filtered(ReportStatus::Reported).len(), 2);
}

#[tokio::test]
async fn test_local_records_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
        let store = ReportStore::with_cache(
            Arc::new(SeedSource::default()),
            LocalCache::open(&path).unwrap(),
        );
        store.init().await;
        store
            .add_local(ReportDraft::new("Arbre tombé", DEFAULT_LOCATION))
            .unwrap();
        store
            .add_local(ReportDraft::new("Lampadaire", DEFAULT_LOCATION))
            .unwrap();
        store.delete_local(&ReportId::Numeric(4)).unwrap();
    }

    let store = ReportStore::with_cache(
        Arc::new(SeedSource::default()),
        LocalCache::open(&path).unwrap(),
    );
    store.init().await;

    let reports = store.all_reports();
    let ids: Vec<ReportId> = reports.iter().map(|r| r.id.clone()).collect();
    assert_eq!(
        ids,
        vec![
            ReportId::Numeric(1),
            ReportId::Numeric(2),
            ReportId::Numeric(3),
            ReportId::Numeric(5),
        ]
    );
    assert_eq!(reports[3].description, "Lampadaire");
}

#[tokio::test]
async fn test_seed_records_are_not_deletable() {
    let store = ReportStore::new(Arc::new(SeedSource::default()));
    store.init().await;
    assert!(store.delete_local(&ReportId::Numeric(2)).is_err());
    assert_eq!(store.all_reports().len(), 3);
}

#[tokio::test]
async fn test_create_then_reload_shows_created_report() {
    let (db, store) = remote_store(StubImageHost::default());
    let draft = ReportDraft::new("Route inondée", DEFAULT_LOCATION)
        .with_status(ReportStatus::InProgress)
        .with_submitter("uid-1", "rakoto@mail.mg")
        .with_photos(vec![photo("a"), photo("b")]);

    let created = store.create(draft).await.unwrap();
    assert_eq!(
        created.photos,
        vec!["https://i.ibb.co/stub/0.jpg", "https://i.ibb.co/stub/1.jpg"]
    );

    let visible = store.report(&created.id).unwrap();
    assert_eq!(visible.status, ReportStatus::InProgress);
    assert_eq!(visible.submitter_email.as_deref(), Some("rakoto@mail.mg"));
    assert_eq!(visible.photos, created.photos);
    // report plus two photo sub-records
    assert_eq!(db.document_count(), 3);
}

#[tokio::test]
async fn test_failed_upload_persists_nothing() {
    let host = StubImageHost {
        reject_index: Some(1),
    };
    let (db, store) = remote_store(host);
    let draft = ReportDraft::new("Nid de poule", DEFAULT_LOCATION)
        .with_photos(vec![photo("1"), photo("2"), photo("3")]);

    assert!(store.create(draft).await.is_err());
    assert_eq!(db.document_count(), 0);
    assert!(store.all_reports().is_empty());
}

#[tokio::test]
async fn test_push_local_records_to_remote() {
    let (db, store) = remote_store(StubImageHost::default());
    store
        .add_local(ReportDraft::new("Pont endommagé", DEFAULT_LOCATION))
        .unwrap();

    assert_eq!(store.push_local_only().await.unwrap(), 1);
    assert!(store.local_reports().is_empty());
    assert_eq!(db.documents("reports").len(), 1);

    let reports = store.all_reports();
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].is_local_only);
    assert_eq!(reports[0].description, "Pont endommagé");
}

#[tokio::test]
async fn test_live_sync_lifecycle() {
    let (db, store) = remote_store(StubImageHost::default());
    let engine = SyncEngine::new(store.clone());
    engine.start_all();
    assert_eq!(engine.state(Collection::Reports), SubscriptionState::Active);

    let mut revisions = store.subscribe();
    store
        .create(ReportDraft::new("Dalot bouché", DEFAULT_LOCATION))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while store.all_reports().is_empty() {
            revisions.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    engine.stop(Collection::Reports);
    engine.stop(Collection::Reports);
    assert_eq!(engine.state(Collection::Reports), SubscriptionState::Stopped);
    assert_eq!(engine.state(Collection::Companies), SubscriptionState::Active);

    engine.stop_all();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(db.listener_count("reports"), 0);
    assert_eq!(db.listener_count("companies"), 0);
}
