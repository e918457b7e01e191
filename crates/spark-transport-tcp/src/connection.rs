use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use socket2::SockRef;
use spark_core::{CoreError, TimeoutBudget};
use spark_transport::{Connection, ConnectionId};
use spark_transport::connection::next_connection_id;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::address::TcpEndpoint;
use crate::error::{self, CONFIGURE, map_io_error};
use crate::util::run_with_budget;

/// TCP 套接字级配置项，实现对内核行为的显式控制。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“优雅关闭需等待对端 EOF、超时后通过 RST 释放资源”这一契约显式配置化，
///   避免调用方直接操作 `socket2` 或平台相关常量；
/// - 分流器在连接池已满时按调用方给出的超时关闭连接，`linger` 决定内核在那之后如何收尾。
///
/// ## 契约说明（What）
/// - `with_linger`：`Some(dur)` 时 `close`/`drop` 阶段在 `dur` 后未完成就发送 RST，
///   `None` 表示遵循内核默认策略；
/// - `with_nodelay`：是否关闭 Nagle 算法，帧记录通常很短，默认开启 `TCP_NODELAY`；
/// - **前置条件**：调用 `apply` 前，`TcpStream` 必须已成功创建；
/// - **后置条件**：若 `apply` 返回 `Ok(())`，则套接字选项已落地。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - `SO_LINGER` 在不同平台的精度不同（Linux 取整到秒），测试与生产环境需选择合适超时；
/// - 若设置过小，可能导致仍在发送缓冲区的数据被丢弃并触发对端 `ECONNRESET`。
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
    nodelay: bool,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketConfig {
    /// 创建默认配置：`linger = None`，`nodelay = true`。
    pub const fn new() -> Self {
        Self {
            linger: None,
            nodelay: true,
        }
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 读取当前配置的超时时长。
    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        SockRef::from(stream).set_linger(self.linger)
    }
}

/// 单条 TCP 连接，实现分流器使用的 [`Connection`] 契约。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 分流器、单例读取器与连接池在不同阶段独占持有连接，因此这里不需要内部互斥锁，
///   读写直接作用在 `TcpStream` 上；
/// - 所有可挂起操作都消耗调用方的 [`TimeoutBudget`]，超时与 IO 错误带上 TCP 专属错误码。
///
/// ## 契约 (What)
/// - `close`：发送 FIN 后读取直至对端 EOF，整个过程受同一预算约束；
/// - `abort`：把 `SO_LINGER` 设为零后丢弃套接字，对端立即收到 RST；
/// - 关闭或中止之后的读写返回 `Aborted` 分类错误。
///
/// ## 注意事项 (Trade-offs)
/// - 优雅关闭期间对端仍在发送的数据会被读出并丢弃；
/// - `abort` 设置 linger 失败时仍然丢弃套接字，只是退化为内核默认的关闭方式。
#[derive(Debug)]
pub struct TcpConnection {
    id: ConnectionId,
    stream: Option<TcpStream>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    config: TcpSocketConfig,
}

impl TcpConnection {
    pub(crate) fn from_stream(stream: TcpStream, config: TcpSocketConfig) -> Result<Self, CoreError> {
        config
            .apply(&stream)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let local_addr = stream
            .local_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        Ok(Self {
            id: next_connection_id(),
            stream: Some(stream),
            local_addr,
            peer_addr,
            config,
        })
    }

    /// 在预算内建立到 `addr` 的连接。
    pub async fn connect(
        addr: SocketAddr,
        config: TcpSocketConfig,
        budget: TimeoutBudget,
    ) -> Result<Self, CoreError> {
        let stream = run_with_budget(budget, error::CONNECT, TcpStream::connect(addr)).await?;
        let connection = Self::from_stream(stream, config)?;
        tracing::debug!(connection = connection.id, peer = %addr, "tcp connection established");
        Ok(connection)
    }

    /// 解析 `net.tcp` 地址并依次尝试所有解析结果，直到某一个连接成功。
    ///
    /// 名称解析与所有建连尝试共享同一预算。
    pub async fn connect_via(
        via: &str,
        config: TcpSocketConfig,
        budget: TimeoutBudget,
    ) -> Result<Self, CoreError> {
        let endpoint = TcpEndpoint::parse(via)?;
        let target = endpoint.lookup_target();
        let addrs = run_with_budget(budget, error::RESOLVE, tokio::net::lookup_host(target)).await?;
        let mut last_error = None;
        for addr in addrs {
            match Self::connect(addr, config.clone(), budget).await {
                Ok(connection) => return Ok(connection),
                Err(err) if err.is_timeout() => return Err(err),
                Err(err) => {
                    tracing::debug!(%endpoint, %addr, error = %err, "tcp connect attempt failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            CoreError::new(error::RESOLVE.code, format!("{endpoint} resolved to no addresses"))
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// 返回构造时使用的套接字配置。
    pub fn config(&self) -> &TcpSocketConfig {
        &self.config
    }

    /// 查询底层套接字当前的 `SO_LINGER` 设置。
    pub fn linger(&self) -> Result<Option<Duration>, CoreError> {
        let stream = self.stream.as_ref().ok_or_else(|| error::closed_error(CONFIGURE))?;
        SockRef::from(stream)
            .linger()
            .map_err(|err| map_io_error(CONFIGURE, err))
    }

    fn stream(&mut self, kind: error::OperationKind) -> Result<&mut TcpStream, CoreError> {
        self.stream.as_mut().ok_or_else(|| error::closed_error(kind))
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn read(&mut self, buf: &mut BytesMut, budget: TimeoutBudget) -> spark_core::Result<usize> {
        let stream = self.stream(error::READ)?;
        run_with_budget(budget, error::READ, stream.read_buf(buf)).await
    }

    async fn write(&mut self, data: &[u8], budget: TimeoutBudget) -> spark_core::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let stream = self.stream(error::WRITE)?;
        run_with_budget(budget, error::WRITE, async move {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await
    }

    /// 执行契约化的优雅关闭流程：发送 FIN、等待对端 EOF 再释放资源。
    async fn close(&mut self, budget: TimeoutBudget) -> spark_core::Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let id = self.id;
        let result = run_with_budget(budget, error::SHUTDOWN, async {
            stream.shutdown().await?;
            read_until_eof(&mut stream).await
        })
        .await;
        match &result {
            Ok(()) => tracing::trace!(connection = id, "tcp connection closed gracefully"),
            Err(err) => {
                tracing::debug!(connection = id, error = %err, "graceful tcp close failed, resetting");
                reset(&stream);
            }
        }
        result
    }

    fn abort(&mut self) {
        if let Some(stream) = self.stream.take() {
            tracing::trace!(connection = self.id, peer = %self.peer_addr, "aborting tcp connection");
            reset(&stream);
        }
    }
}

fn reset(stream: &TcpStream) {
    let _ = SockRef::from(stream).set_linger(Some(Duration::ZERO));
}

async fn read_until_eof(stream: &mut TcpStream) -> io::Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}
