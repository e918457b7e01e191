use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use spark_core::CoreError;
use spark_transport::{BoxConnection, ConnectionListener};
use tokio::net::TcpListener as TokioTcpListener;

use crate::connection::{TcpConnection, TcpSocketConfig};
use crate::error::{self, map_io_error};

/// 对 Tokio `TcpListener` 的语义封装，向分流器提供原始连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 分流器只依赖 [`ConnectionListener`] 契约，TCP 细节（地址、套接字选项）收敛在本类型内；
/// - 每条接入的连接都在交出前应用同一份默认 [`TcpSocketConfig`]。
///
/// ## 契约 (What)
/// - `accept` 失败时返回带 `spark.transport.tcp.accept_failed` 错误码的 [`CoreError`]，
///   单次失败不会关闭监听器，接入循环可以继续；
/// - 套接字选项应用失败时该连接被丢弃，同样返回错误。
///
/// ## 注意事项 (Trade-offs)
/// - 当前实现未支持 `SO_REUSEPORT` 等高级套接字选项，后续可在绑定前扩展；
/// - 接入节流由上游 [`ConnectionAcceptor`](spark_transport::ConnectionAcceptor) 负责。
#[derive(Debug)]
pub struct TcpConnectionListener {
    inner: TokioTcpListener,
    local_addr: SocketAddr,
    default_config: TcpSocketConfig,
}

impl TcpConnectionListener {
    /// 绑定到指定地址并返回监听器。
    pub async fn bind(addr: SocketAddr) -> Result<Self, CoreError> {
        Self::bind_with_config(addr, TcpSocketConfig::default()).await
    }

    /// 绑定到指定地址并设置后续连接的默认套接字配置。
    pub async fn bind_with_config(
        addr: SocketAddr,
        default_config: TcpSocketConfig,
    ) -> Result<Self, CoreError> {
        let listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|err| map_io_error(error::BIND, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        tracing::info!(%local_addr, "tcp listener bound");
        Ok(Self {
            inner: listener,
            local_addr,
            default_config,
        })
    }

    /// 返回监听器实际绑定的地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 读取监听器为后续 `accept` 预设的默认套接字配置。
    pub fn default_socket_config(&self) -> &TcpSocketConfig {
        &self.default_config
    }

    /// 接受一个入站连接并应用默认配置。
    pub async fn accept_tcp(&self) -> Result<TcpConnection, CoreError> {
        let (stream, remote) = self
            .inner
            .accept()
            .await
            .map_err(|err| map_io_error(error::ACCEPT, err))?;
        let connection = TcpConnection::from_stream(stream, self.default_config.clone())?;
        tracing::trace!(local = %self.local_addr, %remote, "tcp connection accepted");
        Ok(connection)
    }
}

#[async_trait]
impl ConnectionListener for TcpConnectionListener {
    async fn accept(&self) -> spark_core::Result<BoxConnection> {
        let connection = self.accept_tcp().await?;
        Ok(Box::new(connection))
    }

    fn local_label(&self) -> String {
        format!("net.tcp://{}", self.local_addr)
    }
}

/// `TcpConnectionListener` 的建造器。
#[derive(Clone, Debug)]
pub struct TcpListenerBuilder {
    addr: SocketAddr,
    default_config: TcpSocketConfig,
}

impl TcpListenerBuilder {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            default_config: TcpSocketConfig::default(),
        }
    }

    /// 覆盖默认的套接字配置。
    pub fn with_default_socket_config(mut self, config: TcpSocketConfig) -> Self {
        self.default_config = config;
        self
    }

    /// 便捷设置 `SO_LINGER`。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.default_config = self.default_config.with_linger(linger);
        self
    }

    pub async fn bind(self) -> Result<TcpConnectionListener, CoreError> {
        TcpConnectionListener::bind_with_config(self.addr, self.default_config).await
    }
}
