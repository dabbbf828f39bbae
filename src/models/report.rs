use std::fmt;

use serde::{Deserialize, Serialize};

use super::serde_helpers::deserialize_photos;
use super::status::ReportStatus;

/// Fallback coordinate for records that carry no usable location.
pub const DEFAULT_LOCATION: Location = Location {
    latitude: -18.8972,
    longitude: 47.501,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    /// Returns a location only for finite, in-range coordinates.
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return None;
        }
        Some(Self {
            latitude,
            longitude,
        })
    }

    pub fn or_default(latitude: f64, longitude: f64) -> Self {
        Self::new(latitude, longitude).unwrap_or(DEFAULT_LOCATION)
    }
}

impl Default for Location {
    fn default() -> Self {
        DEFAULT_LOCATION
    }
}

/// Identifier of a report: numeric for seeded and local records, the document key otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportId {
    Numeric(i64),
    Text(String),
}

impl ReportId {
    pub fn as_numeric(&self) -> Option<i64> {
        match self {
            ReportId::Numeric(n) => Some(*n),
            ReportId::Text(_) => None,
        }
    }

    /// Parses CLI/user input: digits become a numeric id, anything else a document key.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(n) => ReportId::Numeric(n),
            Err(_) => ReportId::Text(raw.trim().to_string()),
        }
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportId::Numeric(n) => write!(f, "{}", n),
            ReportId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ReportId {
    fn from(n: i64) -> Self {
        ReportId::Numeric(n)
    }
}

impl From<&str> for ReportId {
    fn from(s: &str) -> Self {
        ReportId::Text(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: ReportId,
    pub description: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub surface_area: f64,
    #[serde(default)]
    pub progress_percent: f64,
    #[serde(default)]
    pub budget: f64,
    #[serde(default)]
    pub status: ReportStatus,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub submitter_id: Option<String>,
    #[serde(default)]
    pub submitter_email: Option<String>,
    #[serde(default, deserialize_with = "deserialize_photos")]
    pub photos: Vec<String>,
    #[serde(default)]
    pub is_local_only: bool,
}

impl Report {
    pub fn from_draft(id: ReportId, draft: ReportDraft) -> Self {
        Self {
            id,
            description: draft.description,
            location: draft.location,
            surface_area: draft.surface_area,
            progress_percent: draft.progress_percent,
            budget: draft.budget,
            status: draft.status,
            company: draft.company,
            submitter_id: draft.submitter_id,
            submitter_email: draft.submitter_email,
            photos: draft.photos,
            is_local_only: false,
        }
    }

    /// Strips the identity so the record can be submitted through the create path.
    pub fn to_draft(&self) -> ReportDraft {
        ReportDraft {
            description: self.description.clone(),
            location: self.location,
            surface_area: self.surface_area,
            progress_percent: self.progress_percent,
            budget: self.budget,
            status: self.status,
            company: self.company.clone(),
            submitter_id: self.submitter_id.clone(),
            submitter_email: self.submitter_email.clone(),
            photos: self.photos.clone(),
        }
    }
}

/// A report as submitted by the client, before the remote store assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReportDraft {
    pub description: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub surface_area: f64,
    #[serde(default)]
    pub progress_percent: f64,
    #[serde(default)]
    pub budget: f64,
    #[serde(default)]
    pub status: ReportStatus,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub submitter_id: Option<String>,
    #[serde(default)]
    pub submitter_email: Option<String>,
    #[serde(default, deserialize_with = "deserialize_photos")]
    pub photos: Vec<String>,
}

impl ReportDraft {
    pub fn new(description: impl Into<String>, location: Location) -> Self {
        Self {
            description: description.into(),
            location,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: ReportStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_submitter(mut self, id: impl Into<String>, email: impl Into<String>) -> Self {
        self.submitter_id = Some(id.into());
        self.submitter_email = Some(email.into());
        self
    }

    pub fn with_photos(mut self, photos: Vec<String>) -> Self {
        self.photos = photos;
        self
    }
}

/// Next identifier for a client-created record: one past the largest numeric id seen.
/// `None` once the largest id is already `i64::MAX`.
pub fn next_local_id<'a>(reports: impl IntoIterator<Item = &'a Report>) -> Option<ReportId> {
    let max = reports
        .into_iter()
        .filter_map(|r| r.id.as_numeric())
        .max()
        .unwrap_or(0);
    max.checked_add(1).map(ReportId::Numeric)
}
