// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! An in-process cluster for tests: a [`MockPdClient`] and store endpoints
//! backed by the reference [`crate::mvcc::MvccEngine`], with real region
//! routing (epochs, leaders, splits) simulated in front of it.

mod cluster;
mod pd;

pub use cluster::MockCluster;
pub use cluster::MockConnect;
pub use cluster::MockKvClient;
pub use pd::MockPdClient;

use std::sync::Arc;

use crate::region_cache::RegionCache;
use crate::transaction::Client;
use crate::Config;

/// A transactional client wired to an in-process cluster.
pub fn mock_client(cluster: Arc<MockCluster>) -> Client<MockPdClient, MockConnect> {
    mock_client_with_config(cluster, Config::default())
}

pub fn mock_client_with_config(
    cluster: Arc<MockCluster>,
    config: Config,
) -> Client<MockPdClient, MockConnect> {
    let pd = Arc::new(MockPdClient::new(cluster.clone()));
    let cache = RegionCache::new(pd.clone(), config);
    Client::with_parts(pd, cache, MockConnect::new(cluster))
}
