use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::serde_helpers::deserialize_lenient_i64;
use super::status::collation_key;

/// Contractor responsible for a repair. Read-only on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    #[serde(deserialize_with = "deserialize_lenient_i64")]
    pub id: i64,
    pub name: String,
}

impl Company {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Name ordering that ignores case and accents first, then falls back to the raw text.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    collation_key(a)
        .cmp(&collation_key(b))
        .then_with(|| a.cmp(b))
}

pub fn sort_by_name(companies: &mut [Company]) {
    companies.sort_by(|a, b| compare_names(&a.name, &b.name));
}

/// Photo attached under a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPhoto {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub added_at: Option<DateTime<Utc>>,
}

/// Newest first; photos without a timestamp go last and keep their relative order.
pub fn sort_newest_first(photos: &mut [ReportPhoto]) {
    photos.sort_by(|a, b| match (&a.added_at, &b.added_at) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
