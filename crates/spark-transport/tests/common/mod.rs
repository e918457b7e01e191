#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use spark_core::{CoreError, Result, TimeoutBudget};
use spark_transport::framing::{ClientPreamble, singleton_request};
use spark_transport::memory::{MemoryClient, MemoryConnector, MemoryListener};
use spark_transport::{
    BufferedConnection, ConnectionDemuxer, DemuxerHandlers, DemuxerSettings, EndpointSettings,
    FramingMode, PendingSession, PreambleInfo, SessionPreambleHandler, SingletonListener,
    SingletonPreambleHandler, SingletonRequest, TransportExceptionHandler,
};
use tokio::sync::mpsc;

pub const VIA: &str = "net.tcp://host/echo";
pub const CONTENT_TYPE: &str = "application/soap+msbin1";

pub fn budget() -> TimeoutBudget {
    TimeoutBudget::new(Duration::from_secs(5))
}

/// 把请求体原样回送的单例监听器。
#[derive(Default)]
pub struct EchoSingleton {
    pub preambles: AtomicUsize,
    pub requests: AtomicUsize,
}

#[async_trait]
impl SingletonListener for EchoSingleton {
    async fn on_request(&self, request: SingletonRequest) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let body = request.body().clone();
        let _ = request.reply(&body, budget()).await;
    }
}

pub struct EchoSingletonHandler(pub Arc<EchoSingleton>);

#[async_trait]
impl SingletonPreambleHandler for EchoSingletonHandler {
    async fn on_singleton_preamble(
        &self,
        _preamble: &PreambleInfo,
    ) -> Result<Arc<dyn SingletonListener>> {
        self.0.preambles.fetch_add(1, Ordering::SeqCst);
        Ok(self.0.clone())
    }
}

/// 接受所有会话并把连接交给测试。
pub struct AcceptingSessions(pub mpsc::UnboundedSender<(PreambleInfo, BufferedConnection)>);

#[async_trait]
impl SessionPreambleHandler for AcceptingSessions {
    async fn on_session(&self, session: PendingSession) -> Result<()> {
        let info = PreambleInfo {
            via: session.via().to_owned(),
            content_type: session.content_type().to_owned(),
        };
        let connection = session.accept(budget()).await?;
        let _ = self.0.send((info, connection));
        Ok(())
    }
}

/// 记录交给共享异常处理的错误码。
#[derive(Default)]
pub struct RecordingExceptions {
    pub handled: Mutex<Vec<&'static str>>,
    pub escalated: Mutex<Vec<&'static str>>,
}

impl TransportExceptionHandler for RecordingExceptions {
    fn handle(&self, error: &CoreError) -> bool {
        self.handled.lock().push(error.code());
        true
    }

    fn escalate(&self, error: CoreError) {
        self.escalated.lock().push(error.code());
    }
}

pub struct Harness {
    pub demuxer: ConnectionDemuxer,
    pub connector: MemoryConnector,
    pub singleton: Arc<EchoSingleton>,
    pub exceptions: Arc<RecordingExceptions>,
    pub sessions: mpsc::UnboundedReceiver<(PreambleInfo, BufferedConnection)>,
}

pub fn harness(settings: DemuxerSettings) -> Harness {
    let (listener, connector) = MemoryListener::new("memory://demuxer");
    let singleton = Arc::new(EchoSingleton::default());
    let exceptions = Arc::new(RecordingExceptions::default());
    let (tx, sessions) = mpsc::unbounded_channel();
    let endpoints = |via: &str| -> Option<Arc<EndpointSettings>> {
        via.starts_with("net.tcp://host/")
            .then(|| Arc::new(EndpointSettings::default().with_content_type(CONTENT_TYPE)))
    };
    let handlers = DemuxerHandlers::new(
        Arc::new(endpoints),
        Arc::new(AcceptingSessions(tx)),
        Arc::new(EchoSingletonHandler(singleton.clone())),
    )
    .with_exception_handler(exceptions.clone());
    let demuxer = ConnectionDemuxer::new(settings, handlers);
    demuxer
        .start_demuxing(Arc::new(listener), None)
        .expect("demuxer starts");
    Harness {
        demuxer,
        connector,
        singleton,
        exceptions,
        sessions,
    }
}

pub fn client_connection(client: MemoryClient) -> BufferedConnection {
    BufferedConnection::new(Box::new(client.connection))
}

/// 完成一次单例握手与请求。
pub async fn singleton_roundtrip(connection: &mut BufferedConnection, body: &[u8]) -> Result<Vec<u8>> {
    ClientPreamble::new(FramingMode::Singleton, VIA, CONTENT_TYPE)
        .handshake(connection, budget())
        .await?;
    let reply = singleton_request(connection, body, 4096, budget()).await?;
    Ok(reply.to_vec())
}

/// 轮询直到条件成立或超时。
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
