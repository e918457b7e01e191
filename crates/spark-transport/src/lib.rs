#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-transport: 连接接入、握手分流与连接复用。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：服务端在一个监听地址上同时承载长连接双工会话与一次性请求/应答，必须先读取握手前导再决定交给谁。"]
#![doc = "- **What**：定义 [`Connection`]/[`ConnectionListener`] 契约，提供 [`ConnectionAcceptor`]、[`ConnectionDemuxer`]、帧记录编解码与客户端 [`ConnectionPool`]。"]
#![doc = "- **How**：每条连接在独立任务中按超时预算读取前导；分流器只持有追踪表与池计数，所有可变状态都在同一把锁内检查并修改。"]

pub mod acceptor;
pub mod connection;
pub mod demuxer;
pub mod error;
pub mod framing;
pub mod listener;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod pool;
pub mod settings;

pub use acceptor::{ConnectionAcceptor, ConnectionDequeued};
pub use connection::{BoxConnection, BufferedConnection, Connection, ConnectionId, StreamConnection};
pub use demuxer::{
    ConnectionDemuxer, DemuxerHandlers, LoggingExceptionHandler, ReaderStage, ReuseOutcome,
    SessionPreambleHandler, SingletonListener, SingletonPreambleHandler,
    TransportExceptionHandler, TransportSettingsCallback, ViaDelegate,
};
pub use error::FramingError;
pub use framing::{
    ClientPreamble, FramingMode, PendingSession, PreambleInfo, SingletonRequest,
    SingletonRequestReader,
};
pub use listener::ConnectionListener;
pub use pool::{ConnectionPool, PooledConnection, ReturnOutcome};
pub use settings::{ConnectionPoolSettings, DemuxerSettings, EndpointSettings};
