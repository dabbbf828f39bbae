//! Translation between domain records and the remote store's documents.
//!
//! Reads never fail: errors are logged and an empty result is returned, so a
//! caller cannot tell "no data" from "could not load". Writes propagate every
//! failure because a lost submission must not look like a success.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::db_client::{ChangeStream, Collections, DocumentStore};
use crate::document::{Document, FieldValue, Fields, Write};
use crate::models::{
    sort_by_name, sort_newest_first, Company, Location, Report, ReportDraft, ReportId,
    ReportPhoto, ReportStatus, DEFAULT_LOCATION,
};
use crate::storage::{is_data_url, upload_multiple_images, ImageHost};
use crate::store::ReportSource;
use crate::sync::{Collection, LiveSource};

// ===== DECODING =====

/// Geo pair from the `location` field, or the default when missing or malformed.
pub fn decode_location(value: Option<&FieldValue>) -> Location {
    let (latitude, longitude) = match value {
        Some(FieldValue::GeoPoint(loc)) => (loc.latitude, loc.longitude),
        Some(FieldValue::Map(fields)) => {
            let lat = fields.get("latitude").and_then(FieldValue::as_f64);
            let lng = fields.get("longitude").and_then(FieldValue::as_f64);
            match (lat, lng) {
                (Some(lat), Some(lng)) => (lat, lng),
                _ => return DEFAULT_LOCATION,
            }
        }
        _ => return DEFAULT_LOCATION,
    };
    Location::or_default(latitude, longitude)
}

fn decode_report_id(document: &Document) -> ReportId {
    match document.get("id") {
        Some(FieldValue::Integer(n)) => ReportId::Numeric(*n),
        Some(FieldValue::String(s)) if !s.trim().is_empty() => ReportId::Text(s.trim().to_string()),
        _ => ReportId::Text(document.id.clone()),
    }
}

fn decode_photos(value: Option<&FieldValue>) -> Vec<String> {
    match value {
        Some(FieldValue::Array(values)) => values
            .iter()
            .filter_map(FieldValue::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .collect(),
        Some(FieldValue::String(s)) if !s.trim().is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

pub fn decode_report(document: &Document) -> Report {
    Report {
        id: decode_report_id(document),
        description: document.get_str("description").unwrap_or_default().to_string(),
        location: decode_location(document.get("location")),
        surface_area: document.get_f64("surfaceArea").unwrap_or(0.0),
        progress_percent: document.get_f64("progressPercent").unwrap_or(0.0),
        budget: document.get_f64("budget").unwrap_or(0.0),
        status: document
            .get_str("status")
            .map(ReportStatus::normalize)
            .unwrap_or_default(),
        company: document.get_text("company"),
        submitter_id: document.get_text("submitterId"),
        submitter_email: document.get_text("submitterEmail"),
        photos: decode_photos(document.get("photos")),
        is_local_only: false,
    }
}

pub fn decode_reports(documents: &[Document]) -> Vec<Report> {
    documents.iter().map(decode_report).collect()
}

/// Companies with both an integer `id` and a non-empty `name`, sorted by name.
pub fn decode_companies(documents: &[Document]) -> Vec<Company> {
    let mut companies: Vec<Company> = documents
        .iter()
        .filter_map(|doc| {
            let id = doc.get("id").and_then(FieldValue::as_i64);
            let name = doc.get_text("name");
            match (id, name) {
                (Some(id), Some(name)) => Some(Company::new(id, name)),
                _ => {
                    tracing::debug!("Skipping company document {} with missing fields", doc.id);
                    None
                }
            }
        })
        .collect();
    sort_by_name(&mut companies);
    companies
}

pub fn decode_photo(document: &Document) -> ReportPhoto {
    ReportPhoto {
        id: document.id.clone(),
        description: document.get_str("description").unwrap_or_default().to_string(),
        link: document.get_str("link").unwrap_or_default().to_string(),
        added_at: document.get("addedAt").and_then(FieldValue::as_timestamp),
    }
}

// ===== ENCODING =====

fn encode_report(draft: &ReportDraft, photos: &[String]) -> Fields {
    let mut fields = Fields::new();
    fields.insert("description".to_string(), draft.description.clone().into());
    fields.insert("location".to_string(), draft.location.into());
    fields.insert("surfaceArea".to_string(), draft.surface_area.into());
    fields.insert("progressPercent".to_string(), draft.progress_percent.into());
    fields.insert("budget".to_string(), draft.budget.into());
    fields.insert("status".to_string(), draft.status.as_str().into());
    fields.insert("company".to_string(), draft.company.clone().into());
    fields.insert("submitterId".to_string(), draft.submitter_id.clone().into());
    fields.insert("submitterEmail".to_string(), draft.submitter_email.clone().into());
    fields.insert(
        "photos".to_string(),
        FieldValue::Array(photos.iter().map(|p| p.as_str().into()).collect()),
    );
    fields.insert("createdAt".to_string(), FieldValue::ServerTimestamp);
    fields
}

fn encode_photo(index: usize, url: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("addedAt".to_string(), FieldValue::ServerTimestamp);
    fields.insert("description".to_string(), format!("image{}", index + 1).into());
    fields.insert("link".to_string(), url.into());
    fields
}

// ===== GATEWAY =====

pub struct ReportGateway<D: DocumentStore, H: ImageHost> {
    db: Arc<D>,
    images: Arc<H>,
    collections: Collections,
}

impl<D: DocumentStore, H: ImageHost> std::fmt::Debug for ReportGateway<D, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportGateway")
            .field("collections", &self.collections)
            .finish()
    }
}

impl<D: DocumentStore, H: ImageHost> ReportGateway<D, H> {
    pub fn new(db: Arc<D>, images: Arc<H>) -> Self {
        Self::with_collections(db, images, Collections::default())
    }

    pub fn with_collections(db: Arc<D>, images: Arc<H>, collections: Collections) -> Self {
        Self {
            db,
            images,
            collections,
        }
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    pub fn document_store(&self) -> &Arc<D> {
        &self.db
    }

    /// Every report in the remote collection. Empty on failure.
    pub async fn fetch_all_reports(&self) -> Vec<Report> {
        match self.db.list(&self.collections.reports).await {
            Ok(documents) => {
                let reports = decode_reports(&documents);
                tracing::info!("Loaded {} reports", reports.len());
                reports
            }
            Err(e) => {
                tracing::error!("Failed to fetch reports: {:#}", e);
                Vec::new()
            }
        }
    }

    /// Companies sorted by name, skipping incomplete documents. Empty on failure.
    pub async fn fetch_all_companies(&self) -> Vec<Company> {
        match self.db.list(&self.collections.companies).await {
            Ok(documents) => {
                let companies = decode_companies(&documents);
                tracing::info!("Loaded {} companies", companies.len());
                companies
            }
            Err(e) => {
                tracing::error!("Failed to fetch companies: {:#}", e);
                Vec::new()
            }
        }
    }

    /// Photo sub-records of a report, newest first. Empty on failure.
    pub async fn fetch_report_photos(&self, report_id: &ReportId) -> Vec<ReportPhoto> {
        let path = self.collections.report_photos(&report_id.to_string());
        match self.db.list(&path).await {
            Ok(documents) => {
                let mut photos: Vec<ReportPhoto> = documents.iter().map(decode_photo).collect();
                sort_newest_first(&mut photos);
                photos
            }
            Err(e) => {
                tracing::error!("Failed to fetch photos of report {}: {:#}", report_id, e);
                Vec::new()
            }
        }
    }

    /// Uploads pending photos, then writes the report and its photo
    /// sub-records in one commit. Nothing is written if any upload fails.
    pub async fn create_report(&self, draft: ReportDraft) -> Result<Report> {
        let result = self.create_report_inner(draft).await;
        match &result {
            Ok(report) => tracing::info!("Report created with id {}", report.id),
            Err(e) => tracing::error!("Failed to create report: {:#}", e),
        }
        result
    }

    async fn create_report_inner(&self, mut draft: ReportDraft) -> Result<Report> {
        let pending: Vec<String> = draft
            .photos
            .iter()
            .filter(|p| is_data_url(p))
            .cloned()
            .collect();
        tracing::debug!(
            "Report has {} photo(s), {} to upload",
            draft.photos.len(),
            pending.len()
        );

        let mut uploaded = upload_multiple_images(self.images.as_ref(), &pending)
            .await
            .context("Photo upload failed, report not saved")?
            .into_iter();

        // uploaded URLs take the place of the data URLs they came from
        let photos: Vec<String> = draft
            .photos
            .iter()
            .map(|p| {
                if is_data_url(p) {
                    uploaded.next().unwrap_or_default()
                } else {
                    p.clone()
                }
            })
            .collect();

        let id = self.db.new_document_id();
        let report_path = format!("{}/{}", self.collections.reports, id);
        let photos_path = self.collections.report_photos(&id);

        let mut writes = vec![Write::Create {
            path: report_path,
            fields: encode_report(&draft, &photos),
        }];
        for (index, url) in photos.iter().enumerate() {
            writes.push(Write::Create {
                path: format!("{}/{}", photos_path, self.db.new_document_id()),
                fields: encode_photo(index, url),
            });
        }

        self.db
            .commit(writes)
            .await
            .context("Failed to write report")?;

        draft.photos = photos;
        Ok(Report::from_draft(ReportId::Text(id), draft))
    }

    // ===== LOGIN ATTEMPTS =====

    async fn attempts_document(&self, email: &str) -> Result<Option<Document>> {
        let documents = self
            .db
            .query_eq(&self.collections.login_attempts, "email", email.into())
            .await?;
        Ok(documents.into_iter().next())
    }

    fn attempts_write(&self, existing: Option<Document>, email: &str, attempts: u32) -> Write {
        let mut fields = Fields::new();
        fields.insert("email".to_string(), email.into());
        fields.insert("attempts".to_string(), FieldValue::Integer(attempts as i64));
        match existing {
            Some(doc) => Write::Set {
                path: doc.path,
                fields,
                merge: true,
            },
            None => Write::Create {
                path: format!(
                    "{}/{}",
                    self.collections.login_attempts,
                    self.db.new_document_id()
                ),
                fields,
            },
        }
    }

    fn attempts_of(document: &Document) -> u32 {
        document
            .get("attempts")
            .and_then(FieldValue::as_i64)
            .map(|n| n.clamp(0, u32::MAX as i64) as u32)
            .unwrap_or(0)
    }

    /// Failed sign-in count for an email. 0 when unknown or on failure.
    pub async fn get_attempts(&self, email: &str) -> u32 {
        match self.attempts_document(email).await {
            Ok(Some(doc)) => {
                let attempts = Self::attempts_of(&doc);
                tracing::debug!("Attempts for {}: {}", email, attempts);
                attempts
            }
            Ok(None) => 0,
            Err(e) => {
                tracing::error!("Failed to read attempts for {}: {:#}", email, e);
                0
            }
        }
    }

    pub async fn increment_attempts(&self, email: &str) -> Result<u32> {
        let result: Result<u32> = async {
            let existing = self.attempts_document(email).await?;
            let attempts = existing.as_ref().map(Self::attempts_of).unwrap_or(0) + 1;
            let write = self.attempts_write(existing, email, attempts);
            self.db.commit(vec![write]).await?;
            Ok(attempts)
        }
        .await;

        if let Err(e) = &result {
            tracing::error!("Failed to increment attempts for {}: {:#}", email, e);
        }
        result
    }

    /// Resets the counter after a successful sign-in. Failures are only logged.
    pub async fn reset_attempts(&self, email: &str) {
        let result: Result<()> = async {
            let existing = self.attempts_document(email).await?;
            let write = self.attempts_write(existing, email, 0);
            self.db.commit(vec![write]).await
        }
        .await;

        if let Err(e) = result {
            tracing::error!("Failed to reset attempts for {}: {:#}", email, e);
        }
    }
}

#[async_trait]
impl<D: DocumentStore, H: ImageHost> ReportSource for ReportGateway<D, H> {
    async fn fetch_reports(&self) -> Vec<Report> {
        self.fetch_all_reports().await
    }

    async fn fetch_companies(&self) -> Vec<Company> {
        self.fetch_all_companies().await
    }

    async fn create_report(&self, draft: ReportDraft) -> Result<Report> {
        ReportGateway::create_report(self, draft).await
    }
}

impl<D: DocumentStore, H: ImageHost> LiveSource for ReportGateway<D, H> {
    fn watch(&self, collection: Collection) -> ChangeStream {
        let path = match collection {
            Collection::Reports => &self.collections.reports,
            Collection::Companies => &self.collections.companies,
        };
        self.db.watch(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDocumentStore;
    use anyhow::anyhow;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    /// Records every upload; fails the upload at `fail_index`.
    #[derive(Default)]
    struct TestImageHost {
        uploads: Mutex<Vec<usize>>,
        fail_index: Option<usize>,
    }

    #[async_trait]
    impl ImageHost for TestImageHost {
        async fn upload_image(&self, _data_url: &str, index: usize) -> Result<String> {
            self.uploads.lock().unwrap().push(index);
            if Some(index) == self.fail_index {
                return Err(anyhow!("upload {} rejected", index));
            }
            Ok(format!("https://i.ibb.co/photo{}.jpg", index))
        }
    }

    type TestGateway = ReportGateway<InMemoryDocumentStore, TestImageHost>;

    fn gateway(host: TestImageHost) -> (InMemoryDocumentStore, TestGateway) {
        let store = InMemoryDocumentStore::new();
        let gateway = ReportGateway::new(Arc::new(store.clone()), Arc::new(host));
        (store, gateway)
    }

    fn fields(pairs: Vec<(&str, FieldValue)>) -> Fields {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    fn data_url(tag: &str) -> String {
        format!("data:image/jpeg;base64,{}", base64::encode(tag))
    }

    #[tokio::test]
    async fn test_malformed_locations_fall_back_to_default() {
        let (store, gateway) = gateway(TestImageHost::default());
        let malformed = vec![
            None,
            Some("-18.9,47.5".into()),
            Some(FieldValue::GeoPoint(Location {
                latitude: 123.0,
                longitude: 47.5,
            })),
            Some(FieldValue::Map(fields(vec![("latitude", 10.0.into())]))),
            Some(FieldValue::Double(f64::NAN)),
        ];
        for (i, location) in malformed.into_iter().enumerate() {
            let mut f = fields(vec![("description", "x".into())]);
            if let Some(location) = location {
                f.insert("location".to_string(), location);
            }
            store.insert_raw("reports", &format!("r{}", i), f);
        }

        let reports = gateway.fetch_all_reports().await;
        assert_eq!(reports.len(), 5);
        assert!(reports.iter().all(|r| r.location == DEFAULT_LOCATION));
    }

    #[tokio::test]
    async fn test_decoding_defaults_missing_fields() {
        let (store, gateway) = gateway(TestImageHost::default());
        store.insert_raw(
            "reports",
            "abc",
            fields(vec![
                ("description", "Route inondée".into()),
                ("status", "EN COURS".into()),
                (
                    "location",
                    FieldValue::GeoPoint(Location {
                        latitude: -18.91,
                        longitude: 47.52,
                    }),
                ),
                ("budget", FieldValue::Integer(2_000_000)),
                ("company", FieldValue::Null),
            ]),
        );

        let reports = gateway.fetch_all_reports().await;
        let report = &reports[0];
        assert_eq!(report.id, ReportId::Text("abc".to_string()));
        assert_eq!(report.status, ReportStatus::InProgress);
        assert_eq!(report.budget, 2_000_000.0);
        assert_eq!(report.surface_area, 0.0);
        assert_eq!(report.progress_percent, 0.0);
        assert_eq!(report.company, None);
        assert!(report.photos.is_empty());
        assert_eq!(report.location.latitude, -18.91);
    }

    #[tokio::test]
    async fn test_embedded_id_field_wins_over_document_key() {
        let (store, gateway) = gateway(TestImageHost::default());
        store.insert_raw(
            "reports",
            "abc",
            fields(vec![("id", FieldValue::Integer(42)), ("description", "x".into())]),
        );
        let reports = gateway.fetch_all_reports().await;
        assert_eq!(reports[0].id, ReportId::Numeric(42));
    }

    #[tokio::test]
    async fn test_read_failure_yields_empty() {
        let (store, gateway) = gateway(TestImageHost::default());
        store.insert_raw("reports", "a", fields(vec![("description", "x".into())]));
        store.insert_raw(
            "companies",
            "c",
            fields(vec![("id", FieldValue::Integer(1)), ("name", "Acme".into())]),
        );
        store.set_fail_reads(true);

        // indistinguishable from an empty collection: accepted limitation
        assert!(gateway.fetch_all_reports().await.is_empty());
        assert!(gateway.fetch_all_companies().await.is_empty());
        assert!(gateway
            .fetch_report_photos(&ReportId::Text("a".to_string()))
            .await
            .is_empty());
        assert_eq!(gateway.get_attempts("a@b.mg").await, 0);
    }

    #[tokio::test]
    async fn test_companies_are_filtered_and_sorted() {
        let (store, gateway) = gateway(TestImageHost::default());
        store.insert_raw(
            "companies",
            "c2",
            fields(vec![("id", FieldValue::Integer(2)), ("name", "Zeta".into())]),
        );
        store.insert_raw(
            "companies",
            "c1",
            fields(vec![("id", FieldValue::Integer(1)), ("name", "Acme".into())]),
        );
        store.insert_raw("companies", "c3", fields(vec![("name", "No Id".into())]));
        store.insert_raw("companies", "c4", fields(vec![("id", FieldValue::Integer(4))]));

        let companies = gateway.fetch_all_companies().await;
        assert_eq!(companies, vec![Company::new(1, "Acme"), Company::new(2, "Zeta")]);
    }

    #[tokio::test]
    async fn test_create_then_fetch_contains_created_id() {
        let (_store, gateway) = gateway(TestImageHost::default());
        let draft = ReportDraft::new("Lampadaire cassé", DEFAULT_LOCATION)
            .with_status(ReportStatus::Reported)
            .with_company("Colas");

        let created = gateway.create_report(draft).await.unwrap();
        let reports = gateway.fetch_all_reports().await;

        let found = reports.iter().find(|r| r.id == created.id).unwrap();
        assert_eq!(found.description, "Lampadaire cassé");
        assert_eq!(found.company.as_deref(), Some("Colas"));
    }

    #[tokio::test]
    async fn test_create_uploads_data_urls_and_keeps_order() {
        let (store, gateway) = gateway(TestImageHost::default());
        let draft = ReportDraft::new("Arbre tombé", DEFAULT_LOCATION).with_photos(vec![
            data_url("a"),
            "https://i.ibb.co/existing.jpg".to_string(),
            data_url("b"),
        ]);

        let created = gateway.create_report(draft).await.unwrap();
        assert_eq!(
            created.photos,
            vec![
                "https://i.ibb.co/photo0.jpg",
                "https://i.ibb.co/existing.jpg",
                "https://i.ibb.co/photo1.jpg",
            ]
        );

        let photos = gateway.fetch_report_photos(&created.id).await;
        assert_eq!(photos.len(), 3);
        let mut descriptions: Vec<String> = photos.iter().map(|p| p.description.clone()).collect();
        descriptions.sort();
        assert_eq!(descriptions, vec!["image1", "image2", "image3"]);

        let stored = &store.documents("reports")[0];
        assert!(stored.get("createdAt").unwrap().as_timestamp().is_some());
        assert!(matches!(stored.get("location"), Some(FieldValue::GeoPoint(_))));
    }

    #[tokio::test]
    async fn test_create_fails_whole_when_second_upload_fails() {
        let host = TestImageHost {
            fail_index: Some(1),
            ..Default::default()
        };
        let (store, gateway) = gateway(host);
        let draft = ReportDraft::new("Nid de poule", DEFAULT_LOCATION).with_photos(vec![
            data_url("1"),
            data_url("2"),
            data_url("3"),
        ]);

        assert!(gateway.create_report(draft).await.is_err());
        assert_eq!(store.document_count(), 0);
        assert!(gateway.fetch_all_reports().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_propagates_write_failure() {
        let (store, gateway) = gateway(TestImageHost::default());
        store.set_fail_writes(true);
        let draft = ReportDraft::new("x", DEFAULT_LOCATION);
        assert!(gateway.create_report(draft).await.is_err());
    }

    #[tokio::test]
    async fn test_report_photos_newest_first() {
        let (store, gateway) = gateway(TestImageHost::default());
        let at = |s: i64| FieldValue::Timestamp(Utc.timestamp_opt(s, 0).unwrap());
        store.insert_raw(
            "reports/r1/photos",
            "old",
            fields(vec![("link", "https://i.ibb.co/old.jpg".into()), ("addedAt", at(100))]),
        );
        store.insert_raw(
            "reports/r1/photos",
            "untimed",
            fields(vec![("link", "https://i.ibb.co/u.jpg".into())]),
        );
        store.insert_raw(
            "reports/r1/photos",
            "new",
            fields(vec![("link", "https://i.ibb.co/new.jpg".into()), ("addedAt", at(500))]),
        );

        let photos = gateway
            .fetch_report_photos(&ReportId::Text("r1".to_string()))
            .await;
        let ids: Vec<&str> = photos.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old", "untimed"]);
        assert_eq!(photos[2].description, "");
    }

    #[tokio::test]
    async fn test_login_attempt_counter() {
        let (_store, gateway) = gateway(TestImageHost::default());
        assert_eq!(gateway.get_attempts("rakoto@mail.mg").await, 0);
        assert_eq!(gateway.increment_attempts("rakoto@mail.mg").await.unwrap(), 1);
        assert_eq!(gateway.increment_attempts("rakoto@mail.mg").await.unwrap(), 2);
        assert_eq!(gateway.get_attempts("rakoto@mail.mg").await, 2);
        assert_eq!(gateway.get_attempts("other@mail.mg").await, 0);

        gateway.reset_attempts("rakoto@mail.mg").await;
        assert_eq!(gateway.get_attempts("rakoto@mail.mg").await, 0);
    }

    #[tokio::test]
    async fn test_increment_attempts_propagates_failure() {
        let (store, gateway) = gateway(TestImageHost::default());
        store.set_fail_writes(true);
        assert!(gateway.increment_attempts("a@b.mg").await.is_err());
    }
}
