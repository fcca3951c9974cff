//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use castore_node::{NodeConfig, NodeRuntime, PeerClient};
use tempfile::TempDir;

/// Test configuration with fast gossip for quick convergence
pub struct TestConfig {
    pub gossip_interval_ms: u64,
    pub replica: i32,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: 100,
            replica: -1,
        }
    }
}

fn node_config(name: &str, dir: &TempDir, test: &TestConfig, remote: Option<String>) -> NodeConfig {
    let mut config = NodeConfig {
        name: name.to_string(),
        port: 0,
        volumes: vec![dir.path().join("v1")],
        replica: test.replica,
        remote,
        ..NodeConfig::default()
    };
    config.memberlist.port = 0;
    config.memberlist.interval_ms = test.gossip_interval_ms;
    config
}

/// In-process cluster of real nodes on ephemeral ports
pub struct TestCluster {
    nodes: Vec<Option<NodeRuntime>>,
    _dirs: Vec<TempDir>,
}

impl TestCluster {
    /// Starts `num_nodes` nodes and makes every node a member of every other one
    pub async fn start(num_nodes: usize) -> Self {
        Self::start_with(num_nodes, TestConfig::default()).await
    }

    pub async fn start_with(num_nodes: usize, test: TestConfig) -> Self {
        let mut nodes = Vec::with_capacity(num_nodes);
        let mut dirs = Vec::with_capacity(num_nodes);
        for i in 0..num_nodes {
            let dir = TempDir::new().unwrap();
            let config = node_config(&format!("n{}", i + 1), &dir, &test, None);
            nodes.push(Some(NodeRuntime::start(config).await.unwrap()));
            dirs.push(dir);
        }

        let metas: Vec<_> = nodes
            .iter()
            .flatten()
            .map(|n| n.membership().local_meta())
            .collect();
        for node in nodes.iter().flatten() {
            for meta in &metas {
                node.membership().join(meta.clone());
            }
        }
        Self { nodes, _dirs: dirs }
    }

    /// Starts `num_nodes` nodes that only know the first node's memberlist address
    pub async fn start_gossiping(num_nodes: usize) -> Self {
        let test = TestConfig::default();
        let mut nodes = Vec::with_capacity(num_nodes);
        let mut dirs = Vec::with_capacity(num_nodes);
        let mut seed = None;
        for i in 0..num_nodes {
            let dir = TempDir::new().unwrap();
            let config = node_config(&format!("n{}", i + 1), &dir, &test, seed.clone());
            let runtime = NodeRuntime::start(config).await.unwrap();
            if seed.is_none() {
                seed = Some(runtime.memberlist_addr().to_string());
            }
            nodes.push(Some(runtime));
            dirs.push(dir);
        }
        Self { nodes, _dirs: dirs }
    }

    /// Get a running node by index
    pub fn node(&self, i: usize) -> &NodeRuntime {
        self.nodes[i].as_ref().expect("node stopped")
    }

    /// HTTP client talking to node `i`
    pub fn client(&self, i: usize) -> PeerClient {
        let node = self.node(i);
        PeerClient::new(node.node().name(), node.base_url())
    }

    /// Indices of running nodes
    pub fn running(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|i| self.nodes[*i].is_some())
            .collect()
    }

    /// Stops node `i` and removes it from every surviving member table
    pub async fn stop(&mut self, i: usize) {
        let runtime = self.nodes[i].take().expect("node already stopped");
        let name = runtime.node().name().to_string();
        runtime.shutdown().await;
        for node in self.nodes.iter().flatten() {
            node.membership().leave(&name);
        }
    }

    /// Running nodes that hold `key` locally
    pub async fn holders(&self, key: &str) -> Vec<usize> {
        let mut holders = Vec::new();
        for i in self.running() {
            if self.node(i).node().has_file(key).await.unwrap().is_some() {
                holders.push(i);
            }
        }
        holders
    }

    pub async fn shutdown(self) {
        for runtime in self.nodes.into_iter().flatten() {
            runtime.shutdown().await;
        }
    }
}

/// Polls `check` until it holds or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
