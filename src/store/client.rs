// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use derive_new::new;
use log::info;
use tokio::sync::OnceCell;
use tokio::sync::RwLock;
use tonic::transport::Channel;

use super::Request;
use crate::Result;

/// A trait for connecting to store nodes.
#[async_trait]
pub trait KvConnect: Send + Sync + 'static {
    type KvClient: KvClient + Clone + Send + Sync + 'static;

    async fn connect(&self, address: &str) -> Result<Self::KvClient>;
}

/// A client for one store node.
#[async_trait]
pub trait KvClient {
    async fn dispatch(&self, req: &dyn Request, timeout: Duration) -> Result<Box<dyn Any>>;

    /// A copy of this client that asks the node to forward requests to
    /// `host` (the unreachable target store).
    fn with_forwarded_host(&self, host: &str) -> Self
    where
        Self: Sized;
}

#[derive(new, Clone)]
pub struct TonicConnect {
    connect_timeout: Duration,
}

#[async_trait]
impl KvConnect for TonicConnect {
    type KvClient = KvRpcClient;

    async fn connect(&self, address: &str) -> Result<KvRpcClient> {
        info!("connect to store endpoint: {:?}", address);
        let endpoint = Channel::from_shared(format!("http://{address}"))?
            .connect_timeout(self.connect_timeout);
        let channel = endpoint.connect().await?;
        Ok(KvRpcClient::new(channel, None))
    }
}

/// Handles requests for a single store node over one shared channel.
#[derive(new, Clone)]
pub struct KvRpcClient {
    channel: Channel,
    forwarded_host: Option<String>,
}

#[async_trait]
impl KvClient for KvRpcClient {
    async fn dispatch(&self, request: &dyn Request, timeout: Duration) -> Result<Box<dyn Any>> {
        request
            .dispatch(self.channel.clone(), self.forwarded_host.as_deref(), timeout)
            .await
    }

    fn with_forwarded_host(&self, host: &str) -> Self {
        KvRpcClient {
            channel: self.channel.clone(),
            forwarded_host: Some(host.to_owned()),
        }
    }
}

/// A per-address cache of KV clients. Concurrent dials to one address are
/// coalesced onto a single connection attempt.
pub(crate) struct KvClientCache<Cn: KvConnect> {
    connect: Cn,
    cache: RwLock<HashMap<String, Arc<OnceCell<Cn::KvClient>>>>,
}

impl<Cn: KvConnect> KvClientCache<Cn> {
    pub(crate) fn new(connect: Cn) -> Self {
        KvClientCache {
            connect,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn client(&self, address: &str) -> Result<Cn::KvClient> {
        let cached = { self.cache.read().await.get(address).cloned() };
        let cell = match cached {
            Some(cell) => cell,
            None => self
                .cache
                .write()
                .await
                .entry(address.to_owned())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone(),
        };
        let client = cell
            .get_or_try_init(|| self.connect.connect(address))
            .await?;
        Ok(client.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    #[derive(Clone)]
    struct CountingClient {
        addr: String,
    }

    #[async_trait]
    impl KvClient for CountingClient {
        async fn dispatch(&self, _req: &dyn Request, _timeout: Duration) -> Result<Box<dyn Any>> {
            Ok(Box::new(()))
        }

        fn with_forwarded_host(&self, _host: &str) -> Self {
            self.clone()
        }
    }

    struct CountingConnect {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl KvConnect for CountingConnect {
        type KvClient = CountingClient;

        async fn connect(&self, address: &str) -> Result<CountingClient> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CountingClient {
                addr: address.to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn client_cache_dials_once_per_address() {
        let cache = KvClientCache::new(CountingConnect {
            calls: AtomicUsize::new(0),
        });
        let c1 = cache.client("a").await.unwrap();
        let c2 = cache.client("a").await.unwrap();
        let c3 = cache.client("b").await.unwrap();
        assert_eq!(c1.addr, c2.addr);
        assert_ne!(c1.addr, c3.addr);
        assert_eq!(cache.connect.calls.load(Ordering::SeqCst), 2);
    }
}
