//! Stream replication integration: publish, purge, message delete

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::test_cluster::{TestCluster, init_logging, recv_json, wait_until};
use weir_engine::gateway::{
    ConsumerCreateResponse, MsgDeleteResponse, PubAck, StreamCreateResponse, StreamPurgeResponse,
};
use weir_engine::{ClientInfo, ConsumerConfig, StreamConfig};

const WAIT: Duration = Duration::from_secs(5);
const ACCOUNT: &str = "ACME";

fn client() -> ClientInfo {
    ClientInfo::for_account(ACCOUNT)
}

/// Single-replica stream on a three-server cluster: create, publish ten,
/// read them back through a durable consumer.
#[tokio::test]
async fn single_replica_stream_publish_and_consume() {
    init_logging();
    let cluster = TestCluster::new(3);
    let engines = cluster.start_all().await;
    let leader = cluster.meta_leader_index(&engines).expect("meta leader");

    let mut inbox = cluster.inbox("_INBOX.test.create");
    engines[leader]
        .gateway()
        .create_stream(
            client(),
            StreamConfig::new("TEST", vec!["foo".to_string(), "bar".to_string()]),
            "_INBOX.test.create",
        )
        .expect("propose create");
    let resp: StreamCreateResponse = recv_json(&mut inbox, WAIT).await.expect("create response");
    assert_eq!(resp.stream_info.expect("info").config.name, "TEST");

    // A single-replica stream runs on exactly one (random) peer.
    let host = engines
        .iter()
        .position(|e| e.meta().lookup_stream(ACCOUNT, "TEST").is_some())
        .expect("hosting peer");
    assert_eq!(
        engines
            .iter()
            .filter(|e| e.meta().lookup_stream(ACCOUNT, "TEST").is_some())
            .count(),
        1
    );
    assert!(engines[host].meta().is_stream_leader(ACCOUNT, "TEST"));

    let gateway = engines[host].gateway();
    for i in 0..10 {
        let subject = if i % 2 == 0 { "foo" } else { "bar" };
        gateway
            .publish(ACCOUNT, subject, "", b"", Bytes::from(format!("msg-{i}")))
            .await
            .expect("publish");
    }

    let state = engines[host]
        .stream_state(ACCOUNT, "TEST")
        .await
        .expect("state");
    assert_eq!(state.messages, 10);
    assert_eq!(state.last_seq, 10);

    // Durable consumer sees all ten in order.
    let mut consumer_inbox = cluster.inbox("_INBOX.test.consumer");
    engines[leader]
        .gateway()
        .create_consumer(
            client(),
            "TEST",
            ConsumerConfig::durable("dlc"),
            "_INBOX.test.consumer",
        )
        .expect("propose consumer");
    let resp: ConsumerCreateResponse = recv_json(&mut consumer_inbox, WAIT)
        .await
        .expect("consumer response");
    let info = resp.consumer_info.expect("consumer info");
    assert_eq!(info.name, "dlc");
    assert_eq!(info.stream_name, "TEST");

    let consumer = engines[host]
        .meta()
        .lookup_consumer(ACCOUNT, "TEST", "dlc")
        .expect("running consumer");
    for expected in 1..=10u64 {
        let (dseq, msg) = consumer.deliver_next().await.expect("deliver");
        assert_eq!(dseq, expected);
        assert_eq!(msg.sequence, expected);
        assert_eq!(msg.payload, Bytes::from(format!("msg-{}", expected - 1)));
    }
}

/// Replicated publishes are acked by the leader at apply time and land on
/// every member's store.
#[tokio::test]
async fn replicated_publish_acks_and_fans_out() {
    init_logging();
    let cluster = TestCluster::new(3);
    let engines = cluster.start_all().await;
    let leader = cluster.meta_leader_index(&engines).expect("meta leader");

    let mut inbox = cluster.inbox("_INBOX.wide.create");
    engines[leader]
        .gateway()
        .create_stream(
            client(),
            StreamConfig {
                replicas: 3,
                ..StreamConfig::new("WIDE", vec!["wide.*".to_string()])
            },
            "_INBOX.wide.create",
        )
        .expect("propose create");
    let _: StreamCreateResponse = recv_json(&mut inbox, WAIT).await.expect("create response");

    let stream_leader = cluster
        .stream_leader_index(&engines, ACCOUNT, "WIDE")
        .expect("stream leader");

    let mut ack_inbox = cluster.inbox("_INBOX.wide.ack");
    engines[stream_leader]
        .gateway()
        .publish(
            ACCOUNT,
            "wide.one",
            "_INBOX.wide.ack",
            b"",
            Bytes::from_static(b"payload"),
        )
        .await
        .expect("publish");

    let ack: PubAck = recv_json(&mut ack_inbox, WAIT).await.expect("pub ack");
    assert_eq!(ack.stream, "WIDE");
    assert_eq!(ack.seq, Some(1));
    assert!(ack.error.is_none());

    assert!(
        wait_until(WAIT, || async {
            let mut all = true;
            for engine in &engines {
                match engine.stream_state(ACCOUNT, "WIDE").await {
                    Some(state) => all &= state.messages == 1,
                    None => all = false,
                }
            }
            all
        })
        .await,
        "message should replicate to every member"
    );
}

/// Five-server cluster, three replicas, publish a hundred and purge.
#[tokio::test]
async fn purge_replicated_stream() {
    init_logging();
    let cluster = TestCluster::new(5);
    let engines = cluster.start_all().await;
    let leader = cluster.meta_leader_index(&engines).expect("meta leader");

    let mut inbox = cluster.inbox("_INBOX.purge.create");
    engines[leader]
        .gateway()
        .create_stream(
            client(),
            StreamConfig {
                replicas: 3,
                ..StreamConfig::new("TEST", vec!["t.*".to_string()])
            },
            "_INBOX.purge.create",
        )
        .expect("propose create");
    let _: StreamCreateResponse = recv_json(&mut inbox, WAIT).await.expect("create response");

    let stream_leader = cluster
        .stream_leader_index(&engines, ACCOUNT, "TEST")
        .expect("stream leader");
    let gateway = engines[stream_leader].gateway();
    for i in 0..100 {
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
                .map(|s| s.messages == 100)
                .unwrap_or(false)
        })
        .await
    );

    let mut purge_inbox = cluster.inbox("_INBOX.purge.go");
    gateway
        .purge_stream(client(), "TEST", "_INBOX.purge.go")
        .expect("propose purge");
    let resp: StreamPurgeResponse = recv_json(&mut purge_inbox, WAIT)
        .await
        .expect("purge response");
    assert!(resp.success);
    assert_eq!(resp.purged, 100);

    assert!(
        wait_until(WAIT, || async {
            let mut all = true;
            for engine in &engines {
                if engine.meta().lookup_stream(ACCOUNT, "TEST").is_none() {
                    continue;
                }
                match engine.stream_state(ACCOUNT, "TEST").await {
                    Some(state) => all &= state.messages == 0 && state.first_seq == 101,
                    None => all = false,
                }
            }
            all
        })
        .await,
        "purge should land on every member"
    );
}

/// Message deletes tombstone the sequence on every member and answer on
/// the leader.
#[tokio::test]
async fn delete_message_by_sequence() {
    init_logging();
    let cluster = TestCluster::new(3);
    let engines = cluster.start_all().await;
    let leader = cluster.meta_leader_index(&engines).expect("meta leader");

    let mut inbox = cluster.inbox("_INBOX.del.create");
    engines[leader]
        .gateway()
        .create_stream(
            client(),
            StreamConfig {
                replicas: 3,
                ..StreamConfig::new("DEL", vec!["d.*".to_string()])
            },
            "_INBOX.del.create",
        )
        .expect("propose create");
    let _: StreamCreateResponse = recv_json(&mut inbox, WAIT).await.expect("create response");

    let stream_leader = cluster
        .stream_leader_index(&engines, ACCOUNT, "DEL")
        .expect("stream leader");
    let gateway = engines[stream_leader].gateway();
    for i in 0..3 {
        gateway
            .publish(ACCOUNT, "d.x", "", b"", Bytes::from(format!("m{i}")))
            .await
            .expect("publish");
    }

    let mut del_inbox = cluster.inbox("_INBOX.del.go");
    gateway
        .delete_msg(client(), "DEL", 2, "_INBOX.del.go")
        .expect("propose delete");
    let resp: MsgDeleteResponse = recv_json(&mut del_inbox, WAIT).await.expect("delete response");
    assert!(resp.success);

    assert!(
        wait_until(WAIT, || async {
            let mut all = true;
            for engine in &engines {
                match engine.stream_state(ACCOUNT, "DEL").await {
                    Some(state) => {
                        all &= state.messages == 2 && state.deleted.contains(&2);
                    }
                    None => all = false,
                }
            }
            all
        })
        .await
    );

    // Deleting it again reports the missing sequence.
    let mut again_inbox = cluster.inbox("_INBOX.del.again");
    gateway
        .delete_msg(client(), "DEL", 2, "_INBOX.del.again")
        .expect("propose delete");
    let resp: MsgDeleteResponse = recv_json(&mut again_inbox, WAIT)
        .await
        .expect("second delete response");
    assert!(!resp.success);
    assert_eq!(resp.error.expect("error").code, 400);
}

/// Without a group leader there is nothing to propose to; publishes fail
/// with a propose error.
#[tokio::test]
async fn publish_fails_without_quorum() {
    init_logging();
    let cluster = TestCluster::new(3);
    let mut engines = cluster.start_all().await;
    let leader = cluster.meta_leader_index(&engines).expect("meta leader");

    let mut inbox = cluster.inbox("_INBOX.q.create");
    engines[leader]
        .gateway()
        .create_stream(
            client(),
            StreamConfig {
                replicas: 3,
                ..StreamConfig::new("Q", vec!["q.*".to_string()])
            },
            "_INBOX.q.create",
        )
        .expect("propose create");
    let _: StreamCreateResponse = recv_json(&mut inbox, WAIT).await.expect("create response");

    // Take down two members; whoever survives has no quorum.
    let survivor = engines
        .iter()
        .position(|e| e.meta().lookup_stream(ACCOUNT, "Q").is_some())
        .expect("member");
    let mut stopped = 0;
    for i in (0..engines.len()).rev() {
        if i != survivor && stopped < 2 {
            engines.remove(i).stop().await;
            stopped += 1;
        }
    }

    let err = engines
        .iter()
        .find(|e| e.meta().lookup_stream(ACCOUNT, "Q").is_some())
        .expect("survivor")
        .gateway()
        .publish(ACCOUNT, "q.x", "", b"", Bytes::from_static(b"m"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("propose") || err.to_string().contains("no leader"));
}
