mod common;

use std::time::Duration;

use common::*;
use proptest::prelude::*;
use spark_core::codes;
use spark_transport::framing::record;
use spark_transport::memory::{ConnectionEvent, ConnectionProbe, MemoryConnection};
use spark_transport::{BufferedConnection, DemuxerSettings, ReuseOutcome};

fn pooled_settings(limit: usize) -> DemuxerSettings {
    DemuxerSettings::default()
        .with_max_pooled_connections(limit)
        .with_idle_timeout(Duration::from_secs(30))
}

fn reusable() -> (BufferedConnection, ConnectionProbe, MemoryConnection) {
    let (server, client) = MemoryConnection::pair();
    let probe = server.probe();
    (BufferedConnection::new(Box::new(server)), probe, client)
}

#[tokio::test(flavor = "multi_thread")]
async fn full_pool_closes_with_caller_timeout_and_keeps_count() {
    let h = harness(pooled_settings(1));

    let (first, first_probe, _first_client) = reusable();
    assert_eq!(
        h.demuxer.reuse_connection(first, Duration::from_secs(1)).await,
        ReuseOutcome::Pooled
    );
    assert_eq!(h.demuxer.pooled_connection_count(), 1);

    let (second, second_probe, _second_client) = reusable();
    assert_eq!(
        h.demuxer.reuse_connection(second, Duration::from_secs(7)).await,
        ReuseOutcome::ClosedFromPool
    );
    assert_eq!(second_probe.events(), vec![ConnectionEvent::Closed(Duration::from_secs(7))]);
    assert_eq!(h.demuxer.pooled_connection_count(), 1);
    assert!(first_probe.events().is_empty());
    h.demuxer.dispose();
}

#[tokio::test(flavor = "multi_thread")]
async fn pooled_slot_is_released_once_when_peer_leaves() {
    let h = harness(pooled_settings(2));
    let (conn, probe, client) = reusable();
    assert_eq!(
        h.demuxer.reuse_connection(conn, Duration::from_secs(1)).await,
        ReuseOutcome::Pooled
    );
    assert_eq!(h.demuxer.pooled_connection_count(), 1);
    drop(client);
    let demuxer = h.demuxer.clone();
    assert!(eventually(|| demuxer.pooled_connection_count() == 0).await);
    assert!(eventually(|| probe.events() == vec![ConnectionEvent::Aborted]).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.demuxer.pooled_connection_count(), 0);
    h.demuxer.dispose();
}

#[tokio::test(flavor = "multi_thread")]
async fn pooled_connection_stalling_in_preamble_is_dropped_silently() {
    let h = harness(
        pooled_settings(2).with_channel_initialization_timeout(Duration::from_millis(100)),
    );
    let (conn, probe, client) = reusable();
    assert_eq!(
        h.demuxer.reuse_connection(conn, Duration::from_secs(1)).await,
        ReuseOutcome::Pooled
    );

    // 模式记录之后不再发送前导。
    let mut client = BufferedConnection::new(Box::new(client));
    client
        .write_all(&[record::VERSION, 1, 0, record::MODE, 0x01], budget())
        .await
        .unwrap();

    assert!(eventually(|| probe.events() == vec![ConnectionEvent::Aborted]).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.exceptions.handled.lock().contains(&codes::TIMEOUT));
    assert!(h.exceptions.escalated.lock().is_empty());
    assert_eq!(h.demuxer.pooled_connection_count(), 0);
    h.demuxer.dispose();
}

#[tokio::test(flavor = "multi_thread")]
async fn reuse_after_dispose_aborts_connection() {
    let h = harness(pooled_settings(2));
    h.demuxer.dispose();
    let (conn, probe, _client) = reusable();
    assert_eq!(
        h.demuxer.reuse_connection(conn, Duration::from_secs(1)).await,
        ReuseOutcome::Disposed
    );
    assert_eq!(probe.events(), vec![ConnectionEvent::Aborted]);
    assert_eq!(h.demuxer.pooled_connection_count(), 0);
}

#[derive(Clone, Debug)]
enum PoolOp {
    Reuse,
    /// 让第 n 个仍在池中的连接的对端离开。
    Leave(usize),
}

fn pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        3 => Just(PoolOp::Reuse),
        1 => (0usize..8).prop_map(PoolOp::Leave),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// 任意复用/离开序列下，池内计数从不超过上限，被拒绝的连接全部被关闭。
    #[test]
    fn pooled_count_never_exceeds_limit(
        limit in 1usize..4,
        ops in proptest::collection::vec(pool_op(), 1..24),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let violations = runtime.block_on(async {
            let h = harness(pooled_settings(limit));
            let mut clients = Vec::new();
            let mut rejected = Vec::new();
            let mut violations = Vec::new();
            for op in ops {
                match op {
                    PoolOp::Reuse => {
                        let (conn, probe, client) = reusable();
                        match h.demuxer.reuse_connection(conn, Duration::from_secs(2)).await {
                            ReuseOutcome::Pooled => clients.push(client),
                            ReuseOutcome::ClosedFromPool => rejected.push(probe),
                            ReuseOutcome::Disposed => violations.push("unexpected dispose".to_owned()),
                        }
                    }
                    PoolOp::Leave(index) => {
                        if !clients.is_empty() {
                            let index = index % clients.len();
                            drop(clients.swap_remove(index));
                        }
                    }
                }
                let count = h.demuxer.pooled_connection_count();
                if count > limit {
                    violations.push(format!("pooled count {count} exceeds limit {limit}"));
                }
            }
            for probe in &rejected {
                if probe.events() != vec![ConnectionEvent::Closed(Duration::from_secs(2))] {
                    violations.push(format!("rejected connection not closed: {:?}", probe.events()));
                }
            }
            drop(clients);
            let demuxer = h.demuxer.clone();
            if !eventually(|| demuxer.pooled_connection_count() == 0).await {
                violations.push("pooled count did not drain to zero".to_owned());
            }
            h.demuxer.dispose();
            violations
        });
        prop_assert!(violations.is_empty(), "{:?}", violations);
    }
}
