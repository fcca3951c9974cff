//! Multi-node tests over real HTTP listeners.

mod common;

use std::time::Duration;

use castore_node::Membership;
use castore_storage::{bytes_stream, collect_bytes};
use common::{eventually, TestCluster};

const CONVERGE: Duration = Duration::from_secs(15);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_round_trip() {
    let cluster = TestCluster::start(1).await;
    let client = cluster.client(0);

    client.create_file("a", bytes_stream("hello"), None).await.unwrap();
    let body = collect_bytes(client.get_file("a").await.unwrap()).await.unwrap();
    assert_eq!(body, b"hello");
    assert!(client.has_file("a").await.unwrap().is_some());
    assert!(client.has_file("b").await.unwrap().is_none());

    client.delete_file("a").await.unwrap();
    assert!(client.get_file("a").await.err().unwrap().is_not_found());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_are_forwarded_to_owner() {
    let cluster = TestCluster::start(3).await;
    let (cl1, cl2) = (cluster.client(0), cluster.client(1));

    cl1.create_file("k", bytes_stream("owned by n1"), Some(0)).await.unwrap();
    assert!(cl1.has_file("k").await.unwrap().is_some());
    assert!(cl2.has_file("k").await.unwrap().is_none());

    let body = collect_bytes(cl2.get_file("k").await.unwrap()).await.unwrap();
    assert_eq!(body, b"owned by n1");
    assert_eq!(cluster.holders("k").await, vec![0]);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_is_forwarded_to_owner() {
    let cluster = TestCluster::start(2).await;
    cluster
        .client(0)
        .create_file("k", bytes_stream("x"), Some(0))
        .await
        .unwrap();

    cluster.client(1).delete_file("k").await.unwrap();
    assert!(cluster.holders("k").await.is_empty());
    assert!(cluster.client(1).delete_file("k").await.unwrap_err().is_not_found());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicas_reach_target_count() {
    let cluster = TestCluster::start(4).await;
    cluster
        .client(0)
        .create_file("k", bytes_stream("replicated body"), Some(3))
        .await
        .unwrap();

    let c = &cluster;
    assert!(eventually(CONVERGE, move || async move { c.holders("k").await.len() == 3 }).await);
    let owner = &cluster.node(0).node().volumes()[0];
    assert!(eventually(CONVERGE, move || async move { owner.next_replica().await.unwrap().is_none() }).await);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let holders = cluster.holders("k").await;
    assert_eq!(holders.len(), 3);
    assert!(holders.contains(&0));

    let file = owner.find_file("k").await.unwrap();
    assert_eq!(file.volume_ids.len(), 2);
    for i in holders.iter().filter(|i| **i != 0) {
        let copy = cluster.node(*i).node().volumes()[0].find_file("k").await.unwrap();
        assert_eq!(copy.replica, 3);
        assert_eq!(copy.signature, file.signature);
        assert_eq!(copy.volume_ids.len(), 2);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_departed_holder_is_replaced() {
    let mut cluster = TestCluster::start(4).await;
    cluster
        .client(0)
        .create_file("k", bytes_stream("survive departures"), Some(3))
        .await
        .unwrap();
    let c = &cluster;
    assert!(eventually(CONVERGE, move || async move { c.holders("k").await.len() == 3 }).await);
    let owner = &cluster.node(0).node().volumes()[0];
    assert!(eventually(CONVERGE, move || async move { owner.next_replica().await.unwrap().is_none() }).await);

    let departed = cluster
        .holders("k")
        .await
        .into_iter()
        .find(|i| *i != 0)
        .unwrap();
    cluster.stop(departed).await;

    let c = &cluster;
    assert!(eventually(CONVERGE, move || async move { c.holders("k").await.len() == 3 }).await);
    let survivors = cluster.running();
    assert_eq!(cluster.holders("k").await, survivors);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gossip_discovers_members_through_seed() {
    let cluster = TestCluster::start_gossiping(3).await;

    let c = &cluster;
    assert!(
        eventually(CONVERGE, move || async move {
            (0..3).all(|i| c.node(i).membership().nodes().len() == 2)
        })
        .await
    );
    let n3_volume = cluster.node(2).node().volumes()[0].id().to_string();
    let peer = cluster
        .node(1)
        .membership()
        .node_with_volume_id(&n3_volume)
        .unwrap();
    assert_eq!(peer.name(), "n3");

    cluster
        .client(2)
        .create_file("g", bytes_stream("gossiped"), Some(0))
        .await
        .unwrap();
    let body = collect_bytes(cluster.client(0).get_file("g").await.unwrap())
        .await
        .unwrap();
    assert_eq!(body, b"gossiped");

    cluster.shutdown().await;
}
