pub mod auth;
pub mod cache;
pub mod db_client;
pub mod document;
pub mod gateway;
pub mod memory;
pub mod models;
pub mod notifications;
pub mod seed;
pub mod storage;
pub mod store;
pub mod sync;

pub use auth::{AuthClient, AuthConfig, AuthError, AuthUser};
pub use cache::LocalCache;
pub use db_client::{ChangeStream, Collections, DatabaseConfig, DocumentStore, FirestoreDbClient};
pub use gateway::ReportGateway;
pub use memory::InMemoryDocumentStore;
pub use notifications::{PushTokenRegistrar, TokenFlush};
pub use seed::SeedSource;
pub use storage::{ImageHost, ImgbbClient, StorageConfig, UploadError};
pub use store::{ReportSource, ReportStore, StoreError};
pub use sync::{Collection, LiveSource, SubscriptionState, SyncEngine};
