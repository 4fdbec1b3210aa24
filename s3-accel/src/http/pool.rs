//! Idle connection reuse.
//!
//! HTTP/1.1 keep-alive senders are parked per endpoint after a fully-read
//! response and handed back out on the next request to the same endpoint.
//! A pool can be shared across downloads to keep sockets warm between
//! objects; each download builds a private one when the caller does not
//! supply theirs.

use super::Endpoint;
use bytes::Bytes;
use http_body_util::Full;
use hyper::client::conn::http1;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

pub(crate) type Sender = http1::SendRequest<Full<Bytes>>;

/// Tuning for a [`ConnectionPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Idle keep-alive connections retained per endpoint. Excess
    /// connections are dropped on check-in.
    pub max_idle_per_endpoint: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_idle_per_endpoint: 64 }
    }
}

/// Caller-tunable TCP/TLS connection pool.
pub struct ConnectionPool {
    config: PoolConfig,
    idle: Mutex<HashMap<Endpoint, Vec<Sender>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self { config, idle: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn checkout(&self, endpoint: &Endpoint) -> Option<Sender> {
        let mut idle = self.idle.lock().expect("connection pool poisoned");
        let senders = idle.get_mut(endpoint)?;
        while let Some(sender) = senders.pop() {
            if !sender.is_closed() {
                return Some(sender);
            }
        }
        None
    }

    pub(crate) fn checkin(&self, endpoint: &Endpoint, sender: Sender) {
        if sender.is_closed() {
            return;
        }
        let mut idle = self.idle.lock().expect("connection pool poisoned");
        let senders = idle.entry(endpoint.clone()).or_default();
        if senders.len() < self.config.max_idle_per_endpoint {
            senders.push(sender);
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idle: usize = self
            .idle
            .lock()
            .expect("connection pool poisoned")
            .values()
            .map(Vec::len)
            .sum();
        f.debug_struct("ConnectionPool")
            .field("max_idle_per_endpoint", &self.config.max_idle_per_endpoint)
            .field("idle", &idle)
            .finish()
    }
}
