//! Meta controller integration: assignments, removals, snapshot restore

mod common;

use std::time::Duration;

use common::test_cluster::{TestCluster, init_logging, recv_json, wait_until};
use weir_engine::gateway::{ConsumerCreateResponse, StreamCreateResponse, StreamDeleteResponse};
use weir_engine::{ClientInfo, ConsumerConfig, StreamConfig};

const WAIT: Duration = Duration::from_secs(5);

fn r3_config(name: &str, subjects: &[&str]) -> StreamConfig {
    StreamConfig {
        replicas: 3,
        ..StreamConfig::new(name, subjects.iter().map(|s| s.to_string()).collect())
    }
}

#[tokio::test]
async fn stream_assignment_reaches_all_peers() {
    init_logging();
    let cluster = TestCluster::new(3);
    let engines = cluster.start_all().await;
    let leader = cluster.meta_leader_index(&engines).expect("meta leader");

    let mut inbox = cluster.inbox("_INBOX.orders.create");
    engines[leader]
        .gateway()
        .create_stream(
            ClientInfo::for_account("ACME"),
            r3_config("ORDERS", &["orders.*"]),
            "_INBOX.orders.create",
        )
        .expect("propose create");

    assert!(
        wait_until(WAIT, || async {
            engines
                .iter()
                .all(|e| e.meta().stream_assignment("ACME", "ORDERS").is_some())
        })
        .await,
        "assignment should replicate to every peer"
    );

    // The stream leader answers the create exactly once.
    let resp: StreamCreateResponse = recv_json(&mut inbox, WAIT).await.expect("create response");
    let info = resp.stream_info.expect("stream info");
    assert_eq!(info.config.name, "ORDERS");
    assert!(resp.error.is_none());

    // Every member of the group runs the stream locally.
    assert!(
        wait_until(WAIT, || async {
            engines
                .iter()
                .all(|e| e.meta().lookup_stream("ACME", "ORDERS").is_some())
        })
        .await
    );

    // Exactly one peer leads it.
    let leaders = engines
        .iter()
        .filter(|e| e.meta().is_stream_leader("ACME", "ORDERS"))
        .count();
    assert_eq!(leaders, 1);

    // Now remove it.
    let mut delete_inbox = cluster.inbox("_INBOX.orders.delete");
    engines[leader]
        .gateway()
        .delete_stream(
            ClientInfo::for_account("ACME"),
            "ORDERS",
            "_INBOX.orders.delete",
        )
        .expect("propose delete");

    assert!(
        wait_until(WAIT, || async {
            engines
                .iter()
                .all(|e| e.meta().stream_assignment("ACME", "ORDERS").is_none())
        })
        .await,
        "removal should replicate to every peer"
    );
    let resp: StreamDeleteResponse = recv_json(&mut delete_inbox, WAIT)
        .await
        .expect("delete response");
    assert!(resp.success);
}

#[tokio::test]
async fn consumer_assignment_requires_parent_stream() {
    init_logging();
    let cluster = TestCluster::new(3);
    let engines = cluster.start_all().await;
    let leader = cluster.meta_leader_index(&engines).expect("meta leader");

    // Creating a consumer on a missing stream fails fast.
    let err = engines[leader]
        .gateway()
        .create_consumer(
            ClientInfo::for_account("ACME"),
            "NOPE",
            ConsumerConfig::durable("dlc"),
            "_INBOX.consumer.create",
        )
        .unwrap_err();
    assert!(err.to_string().contains("not found"));

    let mut inbox = cluster.inbox("_INBOX.stream.create");
    engines[leader]
        .gateway()
        .create_stream(
            ClientInfo::for_account("ACME"),
            r3_config("EVENTS", &["events.*"]),
            "_INBOX.stream.create",
        )
        .expect("propose create");
    let _: StreamCreateResponse = recv_json(&mut inbox, WAIT).await.expect("create response");

    let mut consumer_inbox = cluster.inbox("_INBOX.consumer.create");
    engines[leader]
        .gateway()
        .create_consumer(
            ClientInfo::for_account("ACME"),
            "EVENTS",
            ConsumerConfig::durable("dlc"),
            "_INBOX.consumer.create",
        )
        .expect("propose consumer create");

    let resp: ConsumerCreateResponse = recv_json(&mut consumer_inbox, WAIT)
        .await
        .expect("consumer response");
    let info = resp.consumer_info.expect("consumer info");
    assert_eq!(info.name, "dlc");
    assert_eq!(info.stream_name, "EVENTS");

    assert!(
        wait_until(WAIT, || async {
            engines
                .iter()
                .all(|e| e.meta().consumer_assignment("ACME", "EVENTS", "dlc").is_some())
        })
        .await
    );
    let leaders = engines
        .iter()
        .filter(|e| e.meta().is_consumer_leader("ACME", "EVENTS", "dlc"))
        .count();
    assert_eq!(leaders, 1);
}

#[tokio::test]
async fn create_with_too_many_replicas_is_refused() {
    init_logging();
    let cluster = TestCluster::new(3);
    let engines = cluster.start_all().await;
    let leader = cluster.meta_leader_index(&engines).expect("meta leader");

    let mut inbox = cluster.inbox("_INBOX.big.create");
    let err = engines[leader]
        .gateway()
        .create_stream(
            ClientInfo::for_account("ACME"),
            StreamConfig {
                replicas: 5,
                ..StreamConfig::new("BIG", vec![])
            },
            "_INBOX.big.create",
        )
        .unwrap_err();
    assert!(err.to_string().contains("insufficient"));

    let resp: StreamCreateResponse = recv_json(&mut inbox, WAIT).await.expect("error response");
    assert_eq!(resp.error.expect("error").code, 503);
}

/// Meta snapshot restore: a peer that was down across several deltas
/// rebuilds the final assignment map from the snapshot alone.
#[tokio::test]
async fn meta_snapshot_restores_final_map_on_restarted_peer() {
    init_logging();
    let cluster = TestCluster::new(3);
    let mut engines = cluster.start_all().await;
    let leader = cluster.meta_leader_index(&engines).expect("meta leader");
    assert_eq!(leader, 0, "n1 starts first and should lead the meta group");
    let account = ClientInfo::for_account("ACME");

    // S1 + S1C1 and S2 + S2C1 while everyone is up.
    for (stream, consumer) in [("S1", "S1C1"), ("S2", "S2C1")] {
        engines[0]
            .gateway()
            .create_stream(account.clone(), r3_config(stream, &[]), "")
            .expect("create stream");
        assert!(
            wait_until(WAIT, || async {
                engines
                    .iter()
                    .all(|e| e.meta().lookup_stream("ACME", stream).is_some())
            })
            .await
        );
        engines[0]
            .gateway()
            .create_consumer(account.clone(), stream, ConsumerConfig::durable(consumer), "")
            .expect("create consumer");
        assert!(
            wait_until(WAIT, || async {
                engines.iter().all(|e| {
                    e.meta()
                        .consumer_assignment("ACME", stream, consumer)
                        .is_some()
                })
            })
            .await
        );
    }

    // n3 goes away; more deltas happen without it.
    engines.remove(2).stop().await;

    engines[0]
        .gateway()
        .create_stream(account.clone(), r3_config("S3", &[]), "")
        .expect("create S3");
    engines[0]
        .gateway()
        .create_consumer(account.clone(), "S3", ConsumerConfig::durable("S3C1"), "")
        .expect("create S3C1");
    engines[0]
        .gateway()
        .delete_stream(account.clone(), "S2", "")
        .expect("delete S2");
    engines[0]
        .gateway()
        .delete_consumer(account.clone(), "S1", "S1C1", "")
        .expect("delete S1C1");
    engines[0]
        .gateway()
        .create_consumer(account.clone(), "S1", ConsumerConfig::durable("S1C2"), "")
        .expect("create S1C2");

    assert!(
        wait_until(WAIT, || async {
            let meta = engines[0].meta();
            meta.stream_assignment("ACME", "S2").is_none()
                && meta.consumer_assignment("ACME", "S1", "S1C2").is_some()
                && meta.consumer_assignment("ACME", "S3", "S3C1").is_some()
        })
        .await
    );

    // Snapshot the final state, then bring n3 back.
    engines[0].snapshot_meta().expect("meta snapshot");
    let restarted = cluster.start_node("n3").await;

    assert!(
        wait_until(WAIT, || async {
            let meta = restarted.meta();
            let mut streams = meta.assigned_stream_names("ACME");
            streams.sort();
            streams == ["S1", "S3"]
                && meta.assigned_consumer_names("ACME", "S1") == ["S1C2"]
                && meta.assigned_consumer_names("ACME", "S3") == ["S3C1"]
        })
        .await,
        "restarted peer should land on the snapshot's final map"
    );
}
