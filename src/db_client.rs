use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::document::{fields_from_rest, Document, FieldValue, Write};

const DEFAULT_FIRESTORE_URL: &str = "https://firestore.googleapis.com/v1";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const LIST_PAGE_SIZE: u32 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub base_url: String,
    pub project_id: String,
    pub api_key: String,
    pub poll_interval_secs: u64,
}

impl DatabaseConfig {
    pub fn new(project_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_FIRESTORE_URL.to_string(),
            project_id: project_id.into(),
            api_key: api_key.into(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }

    /// Creates a new database config from environment variables
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let project_id = std::env::var("SIGNALEMENT_FIREBASE_PROJECT_ID").map_err(|_| {
            anyhow!("SIGNALEMENT_FIREBASE_PROJECT_ID environment variable is required")
        })?;

        let api_key = std::env::var("SIGNALEMENT_FIREBASE_API_KEY")
            .map_err(|_| anyhow!("SIGNALEMENT_FIREBASE_API_KEY environment variable is required"))?;

        let mut base_url = std::env::var("SIGNALEMENT_FIRESTORE_URL")
            .unwrap_or_else(|_| DEFAULT_FIRESTORE_URL.to_string());
        Url::parse(&base_url)
            .with_context(|| format!("SIGNALEMENT_FIRESTORE_URL is not a valid URL: {}", base_url))?;
        while base_url.ends_with('/') {
            base_url.pop();
        }

        let poll_interval_secs = match std::env::var("SIGNALEMENT_POLL_INTERVAL_SECS") {
            Ok(raw) => raw
                .parse::<u64>()
                .map_err(|_| anyhow!("SIGNALEMENT_POLL_INTERVAL_SECS must be a whole number"))?
                .max(1),
            Err(_) => DEFAULT_POLL_INTERVAL_SECS,
        };

        Ok(DatabaseConfig {
            base_url,
            project_id,
            api_key,
            poll_interval_secs,
        })
    }

    /// `projects/<id>/databases/(default)/documents`
    pub fn database_root(&self) -> String {
        format!("projects/{}/databases/(default)/documents", self.project_id)
    }

    /// Full URL of the document tree
    pub fn documents_url(&self) -> String {
        format!("{}/{}", self.base_url, self.database_root())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Remote collection names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collections {
    pub reports: String,
    pub companies: String,
    /// Sub-collection under each report document.
    pub photos: String,
    pub login_attempts: String,
    pub push_tokens: String,
}

impl Default for Collections {
    fn default() -> Self {
        Self {
            reports: "reports".to_string(),
            companies: "companies".to_string(),
            photos: "photos".to_string(),
            login_attempts: "loginAttempts".to_string(),
            push_tokens: "fcmTokens".to_string(),
        }
    }
}

impl Collections {
    pub fn report_photos(&self, report_id: &str) -> String {
        format!("{}/{}/{}", self.reports, report_id, self.photos)
    }
}

/// Full listings pushed by a live listener. Dropping the stream deregisters the listener.
pub struct ChangeStream {
    receiver: mpsc::Receiver<Result<Vec<Document>>>,
    poller: Option<JoinHandle<()>>,
}

impl ChangeStream {
    pub fn new(receiver: mpsc::Receiver<Result<Vec<Document>>>) -> Self {
        Self {
            receiver,
            poller: None,
        }
    }

    pub fn with_poller(receiver: mpsc::Receiver<Result<Vec<Document>>>, poller: JoinHandle<()>) -> Self {
        Self {
            receiver,
            poller: Some(poller),
        }
    }

    /// Next full listing, `None` once the listener is gone.
    pub async fn next(&mut self) -> Option<Result<Vec<Document>>> {
        self.receiver.recv().await
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("polling", &self.poller.is_some())
            .finish()
    }
}

/// Remote document database the gateway talks to.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Every document of a collection, in the store's listing order.
    async fn list(&self, collection: &str) -> Result<Vec<Document>>;

    /// Documents of a top-level collection whose `field` equals `value`.
    async fn query_eq(&self, collection: &str, field: &str, value: FieldValue) -> Result<Vec<Document>>;

    /// Applies all writes atomically.
    async fn commit(&self, writes: Vec<Write>) -> Result<()>;

    /// Registers a change listener on a collection.
    fn watch(&self, collection: &str) -> ChangeStream;

    /// Fresh document key for client-side creation.
    fn new_document_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()[..20].to_string()
    }
}

// ===== FIRESTORE REST CLIENT =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
    update_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<RestDocument>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    document: Option<RestDocument>,
}

#[derive(Clone)]
pub struct FirestoreDbClient {
    config: DatabaseConfig,
    http: reqwest::Client,
    id_token: Arc<RwLock<Option<String>>>,
}

impl std::fmt::Debug for FirestoreDbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let authenticated = self
            .id_token
            .read()
            .map(|token| token.is_some())
            .unwrap_or(false);
        f.debug_struct("FirestoreDbClient")
            .field("project_id", &self.config.project_id)
            .field("base_url", &self.config.base_url)
            .field(
                "auth",
                if authenticated {
                    &"Authenticated"
                } else {
                    &"Anonymous"
                },
            )
            .finish()
    }
}

impl FirestoreDbClient {
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            config,
            http,
            id_token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Installs (or clears) the user's id token sent as bearer auth.
    pub fn set_id_token(&self, token: Option<String>) {
        let mut guard = self.id_token.write().unwrap_or_else(|e| e.into_inner());
        *guard = token;
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.query(&[("key", self.config.api_key.as_str())]);
        let token = self
            .id_token
            .read()
            .map(|token| token.clone())
            .unwrap_or_else(|e| e.into_inner().clone());
        match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<String> {
        let response = self.authorize(builder).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(body);
            return Err(anyhow!("Firestore request failed: HTTP {} - {}", status, message));
        }
        Ok(body)
    }

    fn decode_document(&self, raw: RestDocument) -> Document {
        let prefix = format!("{}/", self.config.database_root());
        let path = raw
            .name
            .split_once(&prefix)
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_else(|| raw.name.clone());
        let mut document = Document::new(path, fields_from_rest(&raw.fields));
        document.update_time = raw
            .update_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));
        document
    }

    /// Splits `a/b/c` into the parent document URL and the collection id `c`.
    fn query_target(&self, collection: &str) -> (String, String) {
        match collection.rsplit_once('/') {
            Some((parent, id)) => (
                format!("{}/{}:runQuery", self.config.documents_url(), parent),
                id.to_string(),
            ),
            None => (
                format!("{}:runQuery", self.config.documents_url()),
                collection.to_string(),
            ),
        }
    }
}

#[async_trait]
impl DocumentStore for FirestoreDbClient {
    async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        let url = format!("{}/{}", self.config.documents_url(), collection);
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(&url)
                .query(&[("pageSize", LIST_PAGE_SIZE.to_string())]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let body = self.send(request).await?;
            let page: ListDocumentsResponse = serde_json::from_str(&body)
                .map_err(|e| anyhow!("Failed to parse listing of {}: {} - {}", collection, e, body))?;

            documents.extend(page.documents.into_iter().map(|raw| self.decode_document(raw)));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        tracing::debug!("Listed {} documents from {}", documents.len(), collection);
        Ok(documents)
    }

    async fn query_eq(&self, collection: &str, field: &str, value: FieldValue) -> Result<Vec<Document>> {
        let encoded = value
            .to_rest()
            .ok_or_else(|| anyhow!("Cannot filter {} on a server timestamp", field))?;
        let (url, collection_id) = self.query_target(collection);
        let body = json!({
            "structuredQuery": {
                "from": [ { "collectionId": collection_id } ],
                "where": {
                    "fieldFilter": {
                        "field": { "fieldPath": field },
                        "op": "EQUAL",
                        "value": encoded
                    }
                }
            }
        });

        let response = self.send(self.http.post(&url).json(&body)).await?;
        let items: Vec<RunQueryItem> = serde_json::from_str(&response)
            .map_err(|e| anyhow!("Failed to parse query response: {} - {}", e, response))?;

        Ok(items
            .into_iter()
            .filter_map(|item| item.document)
            .map(|raw| self.decode_document(raw))
            .collect())
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let root = self.config.database_root();
        let url = format!("{}:commit", self.config.documents_url());
        let body = json!({
            "writes": writes.iter().map(|w| w.to_rest(&root)).collect::<Vec<_>>()
        });

        self.send(self.http.post(&url).json(&body)).await?;
        tracing::debug!("Committed {} writes", writes.len());
        Ok(())
    }

    /// Polls the collection and pushes a full listing whenever any document
    /// was added, removed or updated since the previous poll.
    fn watch(&self, collection: &str) -> ChangeStream {
        let (tx, rx) = mpsc::channel(8);
        let client = self.clone();
        let collection = collection.to_string();
        let period = self.config.poll_interval();

        let poller = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_seen: Option<Vec<(String, Option<DateTime<Utc>>)>> = None;

            loop {
                interval.tick().await;
                let event = match client.list(&collection).await {
                    Ok(documents) => {
                        let fingerprint: Vec<_> = documents
                            .iter()
                            .map(|d| (d.path.clone(), d.update_time))
                            .collect();
                        if last_seen.as_ref() == Some(&fingerprint) {
                            tracing::debug!("No change in {}", collection);
                            continue;
                        }
                        last_seen = Some(fingerprint);
                        Ok(documents)
                    }
                    Err(e) => Err(e.context(format!("Polling {} failed", collection))),
                };

                if tx.send(event).await.is_err() {
                    tracing::debug!("Listener on {} dropped, stopping poller", collection);
                    break;
                }
            }
        });

        ChangeStream::with_poller(rx, poller)
    }
}
