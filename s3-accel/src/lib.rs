//! Parallel range-fetch accelerator for S3-compatible object stores.
//!
//! One large object, many concurrent byte-range (or `partNumber`) GETs,
//! reassembled in strict order into a byte stream or a local file. A probe
//! request learns the object's size and part layout, a fixed-size worker
//! fleet keeps exactly `concurrency` GETs in flight, and a single writer
//! enforces in-order delivery while downloads continue in parallel. Every
//! request is SigV4-signed directly, with no vendor SDK, and runs under
//! layered timeouts, bounded jittered retries, a process-wide DNS record
//! cache, and expiry-aware credential caching.
//!
//! ```no_run
//! use futures::StreamExt;
//! use s3_accel::{DownloadOptions, ObjectRef, download};
//!
//! # async fn run() -> Result<(), s3_accel::Error> {
//! let handle = download(
//!     ObjectRef::new("my-bucket", "path/to/object"),
//!     DownloadOptions::default().with_part_size_mb(8).with_concurrency(64),
//! )?;
//!
//! let meta = handle.meta().await?;
//! println!("{} bytes in {:?} parts", meta.length_in_bytes, meta.parts);
//!
//! let mut stream = handle.read_stream()?;
//! while let Some(chunk) = stream.next().await {
//!     let chunk = chunk?;
//!     // consume in-order bytes
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod credentials;
mod download;
mod error;
mod events;
mod http;
mod imds;
mod region;
mod resolver;
mod retry;
mod s3;
mod sign;

pub use config::DownloadOptions;
pub use credentials::{
    Credentials, DefaultChainProvider, ProvideCredentials, StaticProvider,
    clear_credentials_cache,
};
pub use download::{Download, DownloadStream, ObjectMeta, download};
pub use error::{Error, NetworkClass, TimeoutKind};
pub use events::{DownloadEvent, EventKind, ListenerId};
pub use http::{ConnectionPool, PoolConfig};
pub use region::clear_region_cache;
pub use resolver::clear_dns_cache;
pub use s3::ObjectRef;

/// Reset every process-wide cache: DNS records, the discovered region, the
/// instance-metadata session token, and cached instance credentials.
/// Primarily a test hook.
pub fn clear_caches() {
    clear_dns_cache();
    clear_region_cache();
    clear_credentials_cache();
    imds::ImdsClient::shared().clear();
}
