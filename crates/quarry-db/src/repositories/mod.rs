pub mod cache;
pub mod jobs;
pub mod refresh;
pub mod sections;
pub mod usage;

pub use cache::PgCacheStore;
pub use jobs::PgJobRepository;
pub use refresh::PgRefreshJournal;
pub use sections::PgSectionStore;
pub use usage::PgUsageLog;
