//! 基于 `tokio::io::duplex` 的内存传输，供测试驱动分流器与连接池。
//!
//! [`ConnectionProbe`] 记录服务端连接被关闭或中止的方式，测试据此断言
//! “超限连接按给定超时优雅关闭”之类的行为。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use spark_core::{CoreError, Result, TimeoutBudget};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::connection::{BoxConnection, Connection, ConnectionId, StreamConnection};
use crate::listener::ConnectionListener;

const PIPE_CAPACITY: usize = 64 * 1024;

/// 连接生命周期事件。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// 优雅关闭，携带调用方给出的超时。
    Closed(Duration),
    Aborted,
}

/// 共享的事件记录器。
#[derive(Clone, Debug, Default)]
pub struct ConnectionProbe {
    events: Arc<Mutex<Vec<ConnectionEvent>>>,
}

impl ConnectionProbe {
    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().clone()
    }

    pub fn is_terminated(&self) -> bool {
        !self.events.lock().is_empty()
    }

    fn record(&self, event: ConnectionEvent) {
        self.events.lock().push(event);
    }
}

/// 带探针的内存连接。
pub struct MemoryConnection {
    inner: StreamConnection<DuplexStream>,
    probe: ConnectionProbe,
}

impl MemoryConnection {
    /// 创建一对互联的连接，分别带各自的探针。
    pub fn pair() -> (MemoryConnection, MemoryConnection) {
        let (left, right) = tokio::io::duplex(PIPE_CAPACITY);
        (Self::wrap(left), Self::wrap(right))
    }

    fn wrap(stream: DuplexStream) -> Self {
        Self {
            inner: StreamConnection::new(stream),
            probe: ConnectionProbe::default(),
        }
    }

    pub fn probe(&self) -> ConnectionProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    async fn read(&mut self, buf: &mut BytesMut, budget: TimeoutBudget) -> Result<usize> {
        self.inner.read(buf, budget).await
    }

    async fn write(&mut self, data: &[u8], budget: TimeoutBudget) -> Result<()> {
        self.inner.write(data, budget).await
    }

    async fn close(&mut self, budget: TimeoutBudget) -> Result<()> {
        self.probe.record(ConnectionEvent::Closed(budget.original()));
        self.inner.close(budget).await
    }

    fn abort(&mut self) {
        self.probe.record(ConnectionEvent::Aborted);
        self.inner.abort();
    }
}

/// 内存监听器：由配对的 [`MemoryConnector`] 投递连接。
pub struct MemoryListener {
    label: String,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
}

/// 向 [`MemoryListener`] 发起连接。
#[derive(Clone)]
pub struct MemoryConnector {
    outgoing: mpsc::UnboundedSender<MemoryConnection>,
}

/// 一次 `connect` 的结果：客户端连接与服务端连接的探针。
pub struct MemoryClient {
    pub connection: MemoryConnection,
    pub server_probe: ConnectionProbe,
}

impl MemoryListener {
    pub fn new(label: impl Into<String>) -> (MemoryListener, MemoryConnector) {
        let (outgoing, incoming) = mpsc::unbounded_channel();
        (
            MemoryListener {
                label: label.into(),
                incoming: tokio::sync::Mutex::new(incoming),
            },
            MemoryConnector { outgoing },
        )
    }
}

impl MemoryConnector {
    pub fn connect(&self) -> Result<MemoryClient> {
        let (client, server) = MemoryConnection::pair();
        let server_probe = server.probe();
        self.outgoing
            .send(server)
            .map_err(|_| CoreError::disposed("memory listener is closed"))?;
        Ok(MemoryClient {
            connection: client,
            server_probe,
        })
    }
}

#[async_trait]
impl ConnectionListener for MemoryListener {
    async fn accept(&self) -> Result<BoxConnection> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(connection) => Ok(Box::new(connection)),
            None => Err(CoreError::disposed(format!(
                "memory listener {} is closed",
                self.label
            ))),
        }
    }

    fn local_label(&self) -> String {
        self.label.clone()
    }
}
