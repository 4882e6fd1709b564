//! GitHub report listing/blob client and the report record store.

pub mod records;
pub mod remote;

pub use records::{MemoryRecordStore, PgRecordStore, RecordStore, StoreError, UpsertOutcome};
pub use remote::{
    classify_rate_limit, FetchError, GitHubClient, GitHubClientConfig, RateLimitDisposition,
    RateLimitPolicy, ReportSource,
};

pub const CRATE_NAME: &str = "covglobe-storage";
