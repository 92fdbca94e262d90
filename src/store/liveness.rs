// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! Store liveness probing via the standard gRPC health service.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use tokio::sync::watch;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

use crate::proto::healthpb;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LivenessState {
    Unknown,
    Reachable,
    Unreachable,
}

/// The probe itself, abstracted so tests can stub store health.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn check(&self, address: &str, timeout: Duration) -> LivenessState;
}

/// Probes `/grpc.health.v1.Health/Check` over a fresh connection.
#[derive(Default)]
pub struct GrpcHealthProbe;

#[async_trait]
impl HealthProbe for GrpcHealthProbe {
    async fn check(&self, address: &str, timeout: Duration) -> LivenessState {
        match tokio::time::timeout(timeout, check_health(address)).await {
            Ok(state) => state,
            Err(_) => LivenessState::Unreachable,
        }
    }
}

async fn check_health(address: &str) -> LivenessState {
    let endpoint = match Channel::from_shared(format!("http://{address}")) {
        Ok(endpoint) => endpoint,
        Err(_) => return LivenessState::Unreachable,
    };
    let channel = match endpoint.connect().await {
        Ok(channel) => channel,
        Err(e) => {
            info!("health check: connection to {} failed: {}", address, e);
            return LivenessState::Unreachable;
        }
    };

    let mut grpc = Grpc::new(channel);
    if grpc.ready().await.is_err() {
        return LivenessState::Unreachable;
    }
    let codec: ProstCodec<healthpb::HealthCheckRequest, healthpb::HealthCheckResponse> =
        ProstCodec::default();
    let response = grpc
        .unary(
            tonic::Request::new(healthpb::HealthCheckRequest::default()),
            PathAndQuery::from_static("/grpc.health.v1.Health/Check"),
            codec,
        )
        .await;
    match response {
        Ok(response) => match healthpb::ServingStatus::try_from(response.into_inner().status) {
            Ok(healthpb::ServingStatus::Serving) => LivenessState::Reachable,
            Ok(healthpb::ServingStatus::Unknown) => LivenessState::Unknown,
            _ => LivenessState::Unreachable,
        },
        Err(e) => {
            info!("health check: check on {} failed: {}", address, e);
            LivenessState::Unreachable
        }
    }
}

/// De-duplicates concurrent probes to one address: followers subscribe to the
/// owner's result instead of dialing themselves.
#[derive(Default)]
pub(crate) struct SingleFlightLiveness {
    inflight: tokio::sync::Mutex<HashMap<String, watch::Receiver<Option<LivenessState>>>>,
}

impl SingleFlightLiveness {
    pub(crate) async fn request(
        &self,
        address: &str,
        probe: &dyn HealthProbe,
        timeout: Duration,
    ) -> LivenessState {
        let (tx, follower) = {
            let mut inflight = self.inflight.lock().await;
            if let Some(rx) = inflight.get(address) {
                (None, Some(rx.clone()))
            } else {
                let (tx, rx) = watch::channel(None);
                inflight.insert(address.to_owned(), rx);
                (Some(tx), None)
            }
        };

        if let Some(mut rx) = follower {
            loop {
                if let Some(state) = *rx.borrow() {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return LivenessState::Unknown;
                }
            }
        }

        let tx = tx.expect("either owner or follower");
        let state = probe.check(address, timeout).await;
        self.inflight.lock().await.remove(address);
        let _ = tx.send(Some(state));
        state
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    struct SlowProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for SlowProbe {
        async fn check(&self, _address: &str, _timeout: Duration) -> LivenessState {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            LivenessState::Reachable
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_probes_are_single_flighted() {
        let sf = Arc::new(SingleFlightLiveness::default());
        let probe = Arc::new(SlowProbe {
            calls: AtomicUsize::new(0),
        });

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            let probe = probe.clone();
            handles.push(tokio::spawn(async move {
                sf.request("addr", probe.as_ref(), Duration::from_secs(1))
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), LivenessState::Reachable);
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }
}
