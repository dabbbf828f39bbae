use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{
    sort_by_name, Company, Location, Report, ReportDraft, ReportId, ReportStatus,
};
use crate::store::ReportSource;

/// Static baseline used when no remote store is configured.
#[derive(Debug, Clone)]
pub struct SeedSource {
    reports: Vec<Report>,
    companies: Vec<Company>,
}

impl Default for SeedSource {
    fn default() -> Self {
        Self::new(seed_reports(), seed_companies())
    }
}

impl SeedSource {
    pub fn new(reports: Vec<Report>, mut companies: Vec<Company>) -> Self {
        sort_by_name(&mut companies);
        Self { reports, companies }
    }
}

#[async_trait]
impl ReportSource for SeedSource {
    async fn fetch_reports(&self) -> Vec<Report> {
        self.reports.clone()
    }

    async fn fetch_companies(&self) -> Vec<Company> {
        self.companies.clone()
    }

    async fn create_report(&self, _draft: ReportDraft) -> Result<Report> {
        Err(anyhow!("The seed baseline is read-only; keep the report locally instead"))
    }
}

fn seeded(id: i64, draft: ReportDraft) -> Report {
    Report::from_draft(ReportId::Numeric(id), draft)
}

pub fn seed_reports() -> Vec<Report> {
    let at = |latitude, longitude| Location::or_default(latitude, longitude);
    vec![
        seeded(
            1,
            ReportDraft {
                surface_area: 12.5,
                budget: 1_500_000.0,
                ..ReportDraft::new("Nid de poule sur la route principale", at(-18.9100, 47.5250))
            }
            .with_status(ReportStatus::Reported),
        ),
        seeded(
            2,
            ReportDraft {
                surface_area: 40.0,
                progress_percent: 45.0,
                budget: 8_000_000.0,
                ..ReportDraft::new("Route inondée après les pluies", at(-18.8792, 47.5079))
            }
            .with_status(ReportStatus::InProgress)
            .with_company("Colas Madagascar"),
        ),
        seeded(
            3,
            ReportDraft {
                surface_area: 3.0,
                progress_percent: 100.0,
                budget: 250_000.0,
                ..ReportDraft::new("Éclairage public en panne", at(-18.9137, 47.5361))
            }
            .with_status(ReportStatus::Resolved)
            .with_company("Jirama"),
        ),
    ]
}

pub fn seed_companies() -> Vec<Company> {
    vec![
        Company::new(1, "Colas Madagascar"),
        Company::new(2, "Jirama"),
        Company::new(3, "Entreprise Rakoto BTP"),
    ]
}
