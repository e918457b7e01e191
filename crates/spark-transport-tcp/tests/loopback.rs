use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use spark_core::{Result, TimeoutBudget};
use spark_transport::framing::record::{self, faults};
use spark_transport::framing::{ClientPreamble, singleton_request};
use spark_transport::{
    BufferedConnection, ConnectionDemuxer, ConnectionPool, ConnectionPoolSettings,
    DemuxerHandlers, DemuxerSettings, EndpointSettings, FramingMode, PendingSession,
    PooledConnection, PreambleInfo, ReturnOutcome, SessionPreambleHandler, SingletonListener,
    SingletonPreambleHandler, SingletonRequest,
};
use spark_transport_tcp::{TcpConnection, TcpConnectionListener, TcpSocketConfig};

const CONTENT_TYPE: &str = "application/soap+msbin1";

fn budget() -> TimeoutBudget {
    TimeoutBudget::new(Duration::from_secs(5))
}

#[derive(Default)]
struct Upper {
    requests: AtomicUsize,
}

#[async_trait]
impl SingletonListener for Upper {
    async fn on_request(&self, request: SingletonRequest) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let reply = request.body().to_ascii_uppercase();
        let _ = request.reply(&reply, budget()).await;
    }
}

struct UpperHandler(Arc<Upper>);

#[async_trait]
impl SingletonPreambleHandler for UpperHandler {
    async fn on_singleton_preamble(&self, _preamble: &PreambleInfo) -> Result<Arc<dyn SingletonListener>> {
        Ok(self.0.clone())
    }
}

struct RejectSessions;

#[async_trait]
impl SessionPreambleHandler for RejectSessions {
    async fn on_session(&self, session: PendingSession) -> Result<()> {
        session.reject(faults::ENDPOINT_NOT_FOUND).await;
        Ok(())
    }
}

async fn serve() -> (ConnectionDemuxer, Arc<Upper>, String) {
    let listener = TcpConnectionListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let base = format!("net.tcp://{}", listener.local_addr());
    let upper = Arc::new(Upper::default());
    let endpoints = |via: &str| -> Option<Arc<EndpointSettings>> {
        via.ends_with("/upper")
            .then(|| Arc::new(EndpointSettings::default().with_content_type(CONTENT_TYPE)))
    };
    let demuxer = ConnectionDemuxer::new(
        DemuxerSettings::default(),
        DemuxerHandlers::new(
            Arc::new(endpoints),
            Arc::new(RejectSessions),
            Arc::new(UpperHandler(upper.clone())),
        ),
    );
    demuxer.start_demuxing(Arc::new(listener), None).unwrap();
    (demuxer, upper, base)
}

async fn request(connection: &mut BufferedConnection, via: &str, body: &[u8]) -> Result<Vec<u8>> {
    ClientPreamble::new(FramingMode::Singleton, via, CONTENT_TYPE)
        .handshake(connection, budget())
        .await?;
    Ok(singleton_request(connection, body, 1024, budget()).await?.to_vec())
}

async fn wait_for_pooled(demuxer: &ConnectionDemuxer, expected: usize) -> bool {
    for _ in 0..500 {
        if demuxer.pooled_connection_count() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn singleton_requests_reuse_one_tcp_connection() {
    let (demuxer, upper, base) = serve().await;
    let via = format!("{base}/upper");

    let tcp = TcpConnection::connect_via(&via, TcpSocketConfig::default(), budget())
        .await
        .unwrap();
    let mut connection = BufferedConnection::new(Box::new(tcp));
    assert_eq!(request(&mut connection, &via, b"ping").await.unwrap(), b"PING");
    assert!(wait_for_pooled(&demuxer, 1).await);

    assert_eq!(request(&mut connection, &via, b"again").await.unwrap(), b"AGAIN");
    assert_eq!(upper.requests.load(Ordering::SeqCst), 2);

    connection.abort();
    assert!(wait_for_pooled(&demuxer, 0).await);
    demuxer.dispose();
}

#[tokio::test(flavor = "multi_thread")]
async fn client_pool_hands_back_the_same_connection() {
    let (demuxer, _upper, base) = serve().await;
    let via = format!("{base}/upper");
    let pool = ConnectionPool::new(ConnectionPoolSettings::default());

    let tcp = TcpConnection::connect_via(&via, TcpSocketConfig::default(), budget())
        .await
        .unwrap();
    let mut leased = PooledConnection::fresh(BufferedConnection::new(Box::new(tcp)));
    let first_id = leased.connection.id();
    assert_eq!(request(&mut leased.connection, &via, b"a").await.unwrap(), b"A");
    assert_eq!(
        pool.return_connection(&base, leased, Duration::from_secs(1)).await,
        ReturnOutcome::Pooled
    );

    let mut leased = pool.take(&base).expect("pooled connection available");
    assert_eq!(leased.connection.id(), first_id);
    assert_eq!(request(&mut leased.connection, &via, b"b").await.unwrap(), b"B");
    pool.clear();
    demuxer.dispose();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplex_rejection_and_bad_mode_reach_tcp_client_as_faults() {
    let (demuxer, upper, base) = serve().await;
    let via = format!("{base}/upper");

    let tcp = TcpConnection::connect_via(&via, TcpSocketConfig::default(), budget())
        .await
        .unwrap();
    let mut duplex = BufferedConnection::new(Box::new(tcp));
    let err = ClientPreamble::new(FramingMode::Duplex, &via, CONTENT_TYPE)
        .handshake(&mut duplex, budget())
        .await
        .unwrap_err();
    assert_eq!(err.fault(), Some(faults::ENDPOINT_NOT_FOUND));

    let tcp = TcpConnection::connect_via(&via, TcpSocketConfig::default(), budget())
        .await
        .unwrap();
    let mut bad = BufferedConnection::new(Box::new(tcp));
    bad.write_all(&[record::VERSION, 1, 0, record::MODE, 0x09], budget())
        .await
        .unwrap();
    let err = record::expect_record(&mut bad, record::PREAMBLE_ACK, "ack", budget())
        .await
        .unwrap_err();
    assert_eq!(err.fault(), Some(faults::UNSUPPORTED_MODE));

    let tcp = TcpConnection::connect_via(&via, TcpSocketConfig::default(), budget())
        .await
        .unwrap();
    let mut good = BufferedConnection::new(Box::new(tcp));
    assert_eq!(request(&mut good, &via, b"ok").await.unwrap(), b"OK");
    assert_eq!(upper.requests.load(Ordering::SeqCst), 1);
    demuxer.dispose();
}
