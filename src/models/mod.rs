pub mod company;
pub mod local;
pub mod report;
pub mod serde_helpers;
pub mod status;

// ===== LOCAL MODELS FOLLOW THE NATIVE_DB PATTERN =====
// https://docs.rs/native_db/latest/native_db/

pub use company::{compare_names, sort_by_name, sort_newest_first, Company, ReportPhoto};
pub use local::LocalRecordSet;
pub use report::{next_local_id, Location, Report, ReportDraft, ReportId, DEFAULT_LOCATION};
pub use status::{ReportStatus, StatusFilter};
