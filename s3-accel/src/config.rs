//! Download options and creation-time validation.

use crate::credentials::ProvideCredentials;
use crate::error::Error;
use crate::http::{ConnectionPool, TimeoutProfile, timeout_from_millis};
use crate::retry::RetryPolicy;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Part sizes are given in decimal megabytes, matching the wire math of
/// the service (a "17 MB" object is 17,000,000 bytes).
const MEGABYTE: u64 = 1_000_000;

/// Tuning for one download. `Default` gives the documented defaults; every
/// timeout accepts `0` to disable that deadline.
#[derive(Clone)]
pub struct DownloadOptions {
    /// Split the object into ranges of this many megabytes. When absent the
    /// object's own multipart layout is used (`partNumber` addressing).
    pub part_size_mb: Option<u64>,
    /// Concurrent part GETs. The probe counts against this budget.
    pub concurrency: usize,
    pub request_timeout_ms: u64,
    pub resolve_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub data_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Endpoint override: `host`, `host:port`, or `scheme://host[:port]`.
    /// Absent, the endpoint is `s3.{region}.amazonaws.com`.
    pub endpoint: Option<String>,
    /// Region override, skipping `AWS_REGION`/instance-metadata discovery.
    pub region: Option<String>,
    /// Credential source override. Absent, the environment and then the
    /// instance metadata service are consulted per request.
    pub credentials_provider: Option<Arc<dyn ProvideCredentials>>,
    /// Share a TCP/TLS pool across downloads. Absent, the download builds
    /// a private pool.
    pub connection_pool: Option<Arc<ConnectionPool>>,
    /// Attempt budget per part GET.
    pub max_attempts: usize,
    /// Clamp on the exponential backoff delay.
    pub max_retry_delay_ms: u64,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            part_size_mb: None,
            concurrency: 4,
            request_timeout_ms: 300_000,
            resolve_timeout_ms: 3_000,
            connection_timeout_ms: 3_000,
            read_timeout_ms: 300_000,
            data_timeout_ms: 3_000,
            write_timeout_ms: 300_000,
            endpoint: None,
            region: None,
            credentials_provider: None,
            connection_pool: None,
            max_attempts: RetryPolicy::S3_ATTEMPTS,
            max_retry_delay_ms: RetryPolicy::DEFAULT_MAX_DELAY.as_millis() as u64,
        }
    }
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_part_size_mb(mut self, megabytes: u64) -> Self {
        self.part_size_mb = Some(megabytes);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_credentials_provider(
        mut self,
        provider: Arc<dyn ProvideCredentials>,
    ) -> Self {
        self.credentials_provider = Some(provider);
        self
    }

    pub fn with_connection_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.connection_pool = Some(pool);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.max_retry_delay_ms = delay_ms;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.part_size_mb == Some(0) {
            return Err(Error::Config("part_size_mb must be greater than zero".to_string()));
        }
        if self.concurrency < 1 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.max_attempts < 1 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    pub(crate) fn part_size_bytes(&self) -> Option<u64> {
        self.part_size_mb.map(|mb| mb * MEGABYTE)
    }

    pub(crate) fn timeout_profile(&self) -> TimeoutProfile {
        TimeoutProfile {
            resolve: timeout_from_millis(self.resolve_timeout_ms),
            connection: timeout_from_millis(self.connection_timeout_ms),
            write: timeout_from_millis(self.write_timeout_ms),
            read: timeout_from_millis(self.read_timeout_ms),
            data: timeout_from_millis(self.data_timeout_ms),
            request: timeout_from_millis(self.request_timeout_ms),
        }
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }
}

impl fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("part_size_mb", &self.part_size_mb)
            .field("concurrency", &self.concurrency)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("resolve_timeout_ms", &self.resolve_timeout_ms)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("data_timeout_ms", &self.data_timeout_ms)
            .field("write_timeout_ms", &self.write_timeout_ms)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("credentials_provider", &self.credentials_provider.as_ref().map(|_| ".."))
            .field("connection_pool", &self.connection_pool)
            .field("max_attempts", &self.max_attempts)
            .field("max_retry_delay_ms", &self.max_retry_delay_ms)
            .finish()
    }
}
