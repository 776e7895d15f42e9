//! Remote platform client adapter.
//!
//! The data platform stores projects containing folders and immutable,
//! typed data objects. This crate provides the narrow interface the
//! filesystem core consumes ([`PlatformClient`], [`RangeFetcher`]) along
//! with an HTTP implementation backed by a bounded pool of reqwest
//! clients. Everything behind the traits can be faked in tests.

pub mod env;
pub mod http;
pub mod pool;
pub mod retry;
pub mod types;

pub use env::PlatformEnvironment;
pub use http::{HttpPlatformClient, HttpRangeFetcher};
pub use pool::{ClientPool, PooledClient};
pub use retry::retry_with_backoff;
pub use types::{
    DataObjectDescriptor, DownloadUrl, FileDescriptor, FileState, FolderContents,
    PlatformClient, ProjectDescriptor, ProjectPermission, RangeFetcher,
};
