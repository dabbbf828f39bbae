use native_db::{native_db, ToKey};
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};

/// A serialized record list stored under a fixed key in the local database.
///
/// The payload stays a JSON string rather than a typed list so that a
/// damaged or outdated entry can be detected and discarded on load instead
/// of failing the whole database open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 1, version = 1)]
#[native_db]
pub struct LocalRecordSet {
    #[primary_key]
    pub key: String,
    pub payload: String,
    pub saved_at: String,
}

impl LocalRecordSet {
    pub fn new(key: impl Into<String>, payload: String) -> Self {
        Self {
            key: key.into(),
            payload,
            saved_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
