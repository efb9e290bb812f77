//! Test cluster utilities for integration testing

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use weir_engine::consensus::NodeFactory;
use weir_engine::consensus::memory::{MemoryConsensus, MemoryNodeFactory};
use weir_engine::relay::{MemoryRelay, Relay, Subscription};
use weir_engine::{ClusterConfig, Engine, PeerId};

/// Initialize test logging once; respects `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// An in-process cluster: one shared consensus hub and relay, one engine
/// per named server.
pub struct TestCluster {
    /// Shared consensus hub
    pub hub: Arc<MemoryConsensus>,
    /// Shared relay
    pub relay: Arc<MemoryRelay>,
    names: Vec<String>,
}

impl TestCluster {
    /// A cluster of `size` servers named `n1..nN`.
    pub fn new(size: usize) -> Self {
        Self {
            hub: MemoryConsensus::new(),
            relay: MemoryRelay::new(),
            names: (1..=size).map(|i| format!("n{i}")).collect(),
        }
    }

    /// Server names in this cluster.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Start every server, in name order.
    pub async fn start_all(&self) -> Vec<Engine> {
        let mut engines = Vec::with_capacity(self.names.len());
        for name in &self.names {
            engines.push(self.start_node(name).await);
        }
        engines
    }

    /// Start (or restart) the server called `name`.
    pub async fn start_node(&self, name: &str) -> Engine {
        let mut config = ClusterConfig::new(name, "test-cluster");
        for other in &self.names {
            if other != name {
                config = config.with_route(other.as_str());
            }
        }
        let relay: Arc<dyn Relay> = self.relay.clone();
        let factory: Arc<dyn NodeFactory> =
            Arc::new(MemoryNodeFactory::new(self.hub.clone(), PeerId::from(name)));
        let engine = Engine::new(config, relay, factory).expect("engine config");
        engine.start().await.expect("engine start");
        engine
    }

    /// Index of the current meta leader, if any.
    pub fn meta_leader_index(&self, engines: &[Engine]) -> Option<usize> {
        engines.iter().position(|engine| engine.is_meta_leader())
    }

    /// Index of the engine currently leading `stream`.
    pub fn stream_leader_index(
        &self,
        engines: &[Engine],
        account: &str,
        stream: &str,
    ) -> Option<usize> {
        engines
            .iter()
            .position(|engine| engine.meta().is_stream_leader(account, stream))
    }

    /// Index of the engine currently leading `consumer`.
    pub fn consumer_leader_index(
        &self,
        engines: &[Engine],
        account: &str,
        stream: &str,
        consumer: &str,
    ) -> Option<usize> {
        engines
            .iter()
            .position(|engine| engine.meta().is_consumer_leader(account, stream, consumer))
    }

    /// Subscribe an inbox on the shared relay.
    pub fn inbox(&self, subject: &str) -> Subscription {
        self.relay.subscribe(subject).expect("subscribe inbox")
    }
}

/// Poll `f` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if f().await {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive and decode the next JSON payload from `sub`.
pub async fn recv_json<T: serde::de::DeserializeOwned>(
    sub: &mut Subscription,
    timeout: Duration,
) -> Option<T> {
    match tokio::time::timeout(timeout, sub.rx.recv()).await {
        Ok(Some(delivery)) => serde_json::from_slice(&delivery.payload).ok(),
        _ => None,
    }
}
