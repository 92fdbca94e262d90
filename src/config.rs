// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

use std::time::Duration;

/// The configuration for either a transaction client or a lower-level
/// component of one.
///
/// See the documentation for each field to see the defaults.
#[derive(Clone, Debug)]
pub struct Config {
    /// Per-attempt RPC timeout against store nodes. Default: 30 s.
    pub timeout: Duration,
    /// Idle TTL of cached regions; a region untouched for longer is reloaded
    /// from PD on next access. Default: 600 s.
    pub region_cache_ttl: Duration,
    /// Interval of the background store re-resolve loop. Default: 60 s.
    pub store_check_interval: Duration,
    /// Timeout of the store liveness probe. Zero disables probing (stores
    /// with failed sends are treated as unreachable). Default: 1 s.
    pub store_liveness_timeout: Duration,
    /// Whether requests to an unreachable leader may be forwarded through a
    /// reachable peer. Default: false.
    pub enable_forwarding: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: Duration::from_secs(30),
            region_cache_ttl: Duration::from_secs(600),
            store_check_interval: Duration::from_secs(60),
            store_liveness_timeout: Duration::from_secs(1),
            enable_forwarding: false,
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_region_cache_ttl(mut self, ttl: Duration) -> Self {
        self.region_cache_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_forwarding(mut self, enable: bool) -> Self {
        self.enable_forwarding = enable;
        self
    }

    #[must_use]
    pub fn with_store_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.store_liveness_timeout = timeout;
        self
    }
}
