//! Process-wide DNS record cache.
//!
//! Records are cached per `(family, hostname)` in a bounded FIFO and
//! consumed one per lookup, so consecutive requests rotate through the
//! answer set. Effective TTLs are clamped to `[MIN_TTL, MAX_TTL]` no matter
//! what the resolver reports: the floor protects against flapping
//! authoritative answers, the ceiling keeps failover times bounded.

use crate::error::{Error, NetworkClass};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{LazyLock, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::trace;

const MIN_TTL: Duration = Duration::from_secs(5);
const MAX_TTL: Duration = Duration::from_secs(30);
const MAX_RECORDS_PER_HOST: usize = 1000;

/// Desired address family for a lookup. The engine dials IPv4 by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    fn matches(self, addr: &IpAddr) -> bool {
        match self {
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedRecord {
    addr: IpAddr,
    expires_at: Instant,
}

type Cache = HashMap<(AddressFamily, String), VecDeque<CachedRecord>>;

static CACHE: LazyLock<Mutex<Cache>> = LazyLock::new(|| Mutex::new(HashMap::new()));
static RESOLVER: OnceLock<TokioAsyncResolver> = OnceLock::new();

fn resolver() -> Result<&'static TokioAsyncResolver, Error> {
    if let Some(resolver) = RESOLVER.get() {
        return Ok(resolver);
    }
    let fresh = TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|e| Error::network(NetworkClass::Other, format!("resolver setup: {e}")))?;
    Ok(RESOLVER.get_or_init(|| fresh))
}

fn clamp_ttl(reported: Duration) -> Duration {
    reported.clamp(MIN_TTL, MAX_TTL)
}

fn map_resolve_error(err: ResolveError) -> Error {
    let class = match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => match *response_code {
            ResponseCode::NXDomain => NetworkClass::NameNotFound,
            ResponseCode::ServFail => NetworkClass::TransientNameServerFailure,
            _ => NetworkClass::NoRecords,
        },
        ResolveErrorKind::Timeout => NetworkClass::GenericTimeout,
        ResolveErrorKind::Io(io) => NetworkClass::from_io_kind(io.kind()),
        _ => NetworkClass::Other,
    };
    Error::network(class, err)
}

fn pop_cached(family: AddressFamily, host: &str) -> Option<IpAddr> {
    let mut cache = CACHE.lock().expect("dns cache poisoned");
    let records = cache.get_mut(&(family, host.to_string()))?;
    let now = Instant::now();
    while let Some(record) = records.pop_front() {
        if record.expires_at > now {
            return Some(record.addr);
        }
    }
    None
}

fn store_records(family: AddressFamily, host: &str, records: &[CachedRecord]) {
    let mut cache = CACHE.lock().expect("dns cache poisoned");
    let entry = cache.entry((family, host.to_string())).or_default();
    for record in records {
        if entry.len() >= MAX_RECORDS_PER_HOST {
            break;
        }
        entry.push_back(*record);
    }
}

/// Return one address for `host`, consuming a cached record when a fresh
/// one is available and resolving otherwise. Cancellation propagates by
/// dropping the returned future; the caller owns the deadline.
pub(crate) async fn resolve(host: &str, family: AddressFamily) -> Result<IpAddr, Error> {
    if let Some(addr) = pop_cached(family, host) {
        trace!(host, %addr, "dns cache hit");
        return Ok(addr);
    }

    let lookup = resolver()?.lookup_ip(host).await.map_err(map_resolve_error)?;
    let expires_at = {
        let reported = lookup
            .as_lookup()
            .valid_until()
            .saturating_duration_since(Instant::now());
        Instant::now() + clamp_ttl(reported)
    };
    let records: Vec<CachedRecord> = lookup
        .iter()
        .filter(|addr| family.matches(addr))
        .map(|addr| CachedRecord { addr, expires_at })
        .collect();

    let first = records.first().map(|r| r.addr).ok_or_else(|| {
        Error::network(NetworkClass::NoRecords, format!("empty answer for {host}"))
    })?;
    trace!(host, count = records.len(), "dns answer cached");
    // Retain the remainder for subsequent lookups.
    store_records(family, host, &records[1..]);
    Ok(first)
}

/// Drop every cached record. Test hook; also useful after a known
/// network-topology change.
pub fn clear_dns_cache() {
    CACHE.lock().expect("dns cache poisoned").clear();
}

#[cfg(test)]
fn seed_for_tests(family: AddressFamily, host: &str, records: Vec<(IpAddr, Instant)>) {
    let records: Vec<CachedRecord> = records
        .into_iter()
        .map(|(addr, expires_at)| CachedRecord { addr, expires_at })
        .collect();
    CACHE
        .lock()
        .expect("dns cache poisoned")
        .insert((family, host.to_string()), records.into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_ttl_clamp() {
        assert_eq!(clamp_ttl(Duration::from_secs(1)), MIN_TTL);
        assert_eq!(clamp_ttl(Duration::from_secs(10)), Duration::from_secs(10));
        assert_eq!(clamp_ttl(Duration::from_secs(3600)), MAX_TTL);
        assert_eq!(clamp_ttl(Duration::ZERO), MIN_TTL);
    }

    #[test]
    fn test_records_consumed_in_fifo_order() {
        let host = "fifo.test.invalid";
        let fresh = Instant::now() + Duration::from_secs(30);
        seed_for_tests(
            AddressFamily::V4,
            host,
            vec![(ip(1), fresh), (ip(2), fresh), (ip(3), fresh)],
        );

        assert_eq!(pop_cached(AddressFamily::V4, host), Some(ip(1)));
        assert_eq!(pop_cached(AddressFamily::V4, host), Some(ip(2)));
        assert_eq!(pop_cached(AddressFamily::V4, host), Some(ip(3)));
        assert_eq!(pop_cached(AddressFamily::V4, host), None);
    }

    #[test]
    fn test_expired_records_are_discarded() {
        let host = "expired.test.invalid";
        let stale = Instant::now() - Duration::from_secs(1);
        let fresh = Instant::now() + Duration::from_secs(30);
        seed_for_tests(AddressFamily::V4, host, vec![(ip(1), stale), (ip(2), fresh)]);

        assert_eq!(pop_cached(AddressFamily::V4, host), Some(ip(2)));
        assert_eq!(pop_cached(AddressFamily::V4, host), None);
    }

    #[test]
    fn test_families_do_not_share_entries() {
        let host = "family.test.invalid";
        let fresh = Instant::now() + Duration::from_secs(30);
        seed_for_tests(AddressFamily::V4, host, vec![(ip(1), fresh)]);

        assert_eq!(pop_cached(AddressFamily::V6, host), None);
        assert_eq!(pop_cached(AddressFamily::V4, host), Some(ip(1)));
    }

    #[test]
    fn test_store_caps_records_per_host() {
        let host = "cap.test.invalid";
        let fresh = Instant::now() + Duration::from_secs(30);
        let records: Vec<CachedRecord> = (0u8..=255)
            .cycle()
            .take(MAX_RECORDS_PER_HOST + 10)
            .map(|last| CachedRecord { addr: ip(last), expires_at: fresh })
            .collect();
        store_records(AddressFamily::V4, host, &records);

        let cache = CACHE.lock().unwrap();
        assert_eq!(cache[&(AddressFamily::V4, host.to_string())].len(), MAX_RECORDS_PER_HOST);
    }
}
