// Report status and the normalization applied to whatever spelling the remote side stores.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum ReportStatus {
    #[default]
    Reported,
    InProgress,
    Resolved,
}

impl ReportStatus {
    pub const ALL: [ReportStatus; 3] = [
        ReportStatus::Reported,
        ReportStatus::InProgress,
        ReportStatus::Resolved,
    ];

    /// Canonical spelling written to the remote store.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Reported => "Reported",
            ReportStatus::InProgress => "InProgress",
            ReportStatus::Resolved => "Resolved",
        }
    }

    /// Maps a free-form status string to a known status.
    ///
    /// Matching ignores case, accents, underscores, hyphens and spacing, so
    /// "Résolu", "resolu" and "RESOLU" all land on [`ReportStatus::Resolved`].
    pub fn recognize(raw: &str) -> Option<ReportStatus> {
        match fold(raw).as_str() {
            "reported" | "signale" | "new" | "nouveau" | "open" => Some(ReportStatus::Reported),
            "inprogress" | "encours" | "ongoing" | "started" => Some(ReportStatus::InProgress),
            "resolved" | "resolu" | "termine" | "done" | "closed" | "fixed" => {
                Some(ReportStatus::Resolved)
            }
            _ => None,
        }
    }

    /// Like [`ReportStatus::recognize`] but unrecognized input falls back to `Reported`.
    pub fn normalize(raw: &str) -> ReportStatus {
        Self::recognize(raw).unwrap_or_default()
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ReportStatus {
    fn from(s: &str) -> Self {
        ReportStatus::normalize(s)
    }
}

// Cached records may carry older spellings, so decoding goes through normalize too.
impl<'de> Deserialize<'de> for ReportStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(ReportStatus::normalize(&raw))
    }
}

/// Lowercases, strips diacritics and drops separators.
fn fold(raw: &str) -> String {
    collation_key(raw)
        .chars()
        .filter(|c| !(c.is_whitespace() || *c == '_' || *c == '-'))
        .collect()
}

/// Lowercased, accent-free form used for tolerant matching and name ordering.
///
/// Compatibility decomposition also folds fullwidth and other presentation
/// forms onto their plain letters before the combining marks are dropped.
pub(crate) fn collation_key(raw: &str) -> String {
    raw.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Filter token accepted by the store's filtered view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    Only(ReportStatus),
}

impl StatusFilter {
    pub fn matches(&self, status: ReportStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Only(wanted) => *wanted == status,
        }
    }
}

impl From<ReportStatus> for StatusFilter {
    fn from(status: ReportStatus) -> Self {
        StatusFilter::Only(status)
    }
}

impl FromStr for StatusFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match fold(s).as_str() {
            "all" | "tous" | "*" => Ok(StatusFilter::All),
            _ => ReportStatus::recognize(s)
                .map(StatusFilter::Only)
                .ok_or_else(|| anyhow!("Unknown status filter: {}", s)),
        }
    }
}
