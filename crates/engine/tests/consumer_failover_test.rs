//! Consumer replication integration: delivered/ack state survives failover

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::test_cluster::{TestCluster, init_logging, recv_json, wait_until};
use weir_engine::gateway::{ConsumerCreateResponse, StreamCreateResponse};
use weir_engine::{ClientInfo, ConsumerConfig, StreamConfig};

const WAIT: Duration = Duration::from_secs(5);
const ACCOUNT: &str = "ACME";

#[tokio::test]
async fn consumer_state_survives_leader_failover() {
    init_logging();
    let cluster = TestCluster::new(3);
    let mut engines = cluster.start_all().await;
    let leader = cluster.meta_leader_index(&engines).expect("meta leader");

    let mut inbox = cluster.inbox("_INBOX.fo.create");
    engines[leader]
        .gateway()
        .create_stream(
            ClientInfo::for_account(ACCOUNT),
            StreamConfig {
                replicas: 3,
                ..StreamConfig::new("TEST", vec!["t.*".to_string()])
            },
            "_INBOX.fo.create",
        )
        .expect("propose create");
    let _: StreamCreateResponse = recv_json(&mut inbox, WAIT).await.expect("create response");

    let stream_leader = cluster
        .stream_leader_index(&engines, ACCOUNT, "TEST")
        .expect("stream leader");
    let gateway = engines[stream_leader].gateway();
    for i in 0..10 {
        gateway
            .publish(ACCOUNT, "t.x", "", b"", Bytes::from(format!("m{i}")))
            .await
            .expect("publish");
    }
    assert!(
        wait_until(WAIT, || async {
            engines[stream_leader]
                .stream_state(ACCOUNT, "TEST")
                .await
                .map(|s| s.messages == 10)
                .unwrap_or(false)
        })
        .await
    );

    let mut consumer_inbox = cluster.inbox("_INBOX.fo.consumer");
    engines[leader]
        .gateway()
        .create_consumer(
            ClientInfo::for_account(ACCOUNT),
            "TEST",
            ConsumerConfig::durable("dlc"),
            "_INBOX.fo.consumer",
        )
        .expect("propose consumer");
    let _: ConsumerCreateResponse = recv_json(&mut consumer_inbox, WAIT)
        .await
        .expect("consumer response");

    // Pull and ack the first five on the consumer leader.
    let consumer_leader = cluster
        .consumer_leader_index(&engines, ACCOUNT, "TEST", "dlc")
        .expect("consumer leader");
    let consumer = engines[consumer_leader]
        .meta()
        .lookup_consumer(ACCOUNT, "TEST", "dlc")
        .expect("running consumer");
    for i in 1..=5u64 {
        let (dseq, msg) = consumer.deliver_next().await.expect("deliver");
        assert_eq!((dseq, msg.sequence), (i, i));
        consumer.ack(dseq, msg.sequence).await.expect("ack");
    }
    drop(consumer);

    // Replicated state reaches the followers before we fail over.
    assert!(
        wait_until(WAIT, || async {
            let mut all = true;
            for (idx, engine) in engines.iter().enumerate() {
                if idx == consumer_leader {
                    continue;
                }
                match engine.consumer_info(ACCOUNT, "TEST", "dlc").await {
                    Some(info) => {
                        all &= info.delivered.consumer_seq == 5
                            && info.delivered.stream_seq == 5
                            && info.ack_floor.consumer_seq == 5
                            && info.ack_floor.stream_seq == 5
                            && info.num_ack_pending == 0;
                    }
                    None => all = false,
                }
            }
            all
        })
        .await,
        "delivered/ack state should replicate before failover"
    );

    // Kill the consumer leader and wait for a successor.
    engines.remove(consumer_leader).stop().await;
    assert!(
        wait_until(WAIT, || async {
            // The successor's own leader flag flips once its monitor sees
            // the transition; wait for that, not just the election.
            match cluster.consumer_leader_index(&engines, ACCOUNT, "TEST", "dlc") {
                Some(idx) => engines[idx]
                    .meta()
                    .lookup_consumer(ACCOUNT, "TEST", "dlc")
                    .map(|c| c.is_leader())
                    .unwrap_or(false),
                None => false,
            }
        })
        .await,
        "a new consumer leader should be elected"
    );

    let new_leader = cluster
        .consumer_leader_index(&engines, ACCOUNT, "TEST", "dlc")
        .expect("new consumer leader");
    let info = engines[new_leader]
        .consumer_info(ACCOUNT, "TEST", "dlc")
        .await
        .expect("info");
    assert_eq!(info.delivered.consumer_seq, 5);
    assert_eq!(info.delivered.stream_seq, 5);
    assert_eq!(info.ack_floor, info.delivered);

    // Drain the remaining five on the new leader.
    let consumer = engines[new_leader]
        .meta()
        .lookup_consumer(ACCOUNT, "TEST", "dlc")
        .expect("running consumer");
    for i in 6..=10u64 {
        let (dseq, msg) = consumer.deliver_next().await.expect("deliver");
        assert_eq!((dseq, msg.sequence), (i, i));
        consumer.ack(dseq, msg.sequence).await.expect("ack");
    }

    assert!(
        wait_until(WAIT, || async {
            engines[new_leader]
                .consumer_info(ACCOUNT, "TEST", "dlc")
                .await
                .map(|info| {
                    info.delivered.consumer_seq == 10
                        && info.delivered.stream_seq == 10
                        && info.ack_floor == info.delivered
                        && info.num_ack_pending == 0
                })
                .unwrap_or(false)
        })
        .await,
        "final state should be fully delivered and acked"
    );
}
