use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use spark_core::{CoreError, Result, TimeoutBudget};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FramingError;

/// 连接在进程内的唯一编号，仅用于日志与追踪表索引。
pub type ConnectionId = u64;

/// 分配新的连接编号。
pub fn next_connection_id() -> ConnectionId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// 独占所有权的双向字节流。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 前导读取器、会话读取器、连接池在不同阶段轮流持有同一条连接，所有权必须显式移交；
/// - 以 `Box<dyn Connection>` 在阶段之间移动，编译期即可排除“两个读者共享一条连接”。
///
/// ## 契约（What）
/// - `read` 将数据追加到 `buf` 末尾并返回读取字节数，`0` 表示对端已关闭写方向；
/// - `write` 写出全部字节后返回；
/// - `close` 在预算内优雅关闭，`abort` 立即丢弃底层资源且不会失败；
/// - 所有可挂起操作都消耗调用方传入的 [`TimeoutBudget`]。
#[async_trait]
pub trait Connection: Send + 'static {
    fn id(&self) -> ConnectionId;

    async fn read(&mut self, buf: &mut BytesMut, budget: TimeoutBudget) -> Result<usize>;

    async fn write(&mut self, data: &[u8], budget: TimeoutBudget) -> Result<()>;

    async fn close(&mut self, budget: TimeoutBudget) -> Result<()>;

    fn abort(&mut self);
}

pub type BoxConnection = Box<dyn Connection>;

/// 把任意 `AsyncRead + AsyncWrite` 流适配为 [`Connection`]。
pub struct StreamConnection<S> {
    id: ConnectionId,
    stream: Option<S>,
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self {
            id: next_connection_id(),
            stream: Some(stream),
        }
    }

    fn stream(&mut self) -> Result<&mut S> {
        let id = self.id;
        self.stream
            .as_mut()
            .ok_or_else(|| CoreError::aborted(format!("connection {id} was closed or aborted")))
    }
}

#[async_trait]
impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn read(&mut self, buf: &mut BytesMut, budget: TimeoutBudget) -> Result<usize> {
        let stream = self.stream()?;
        budget.run_io("connection read", stream.read_buf(buf)).await
    }

    async fn write(&mut self, data: &[u8], budget: TimeoutBudget) -> Result<()> {
        let stream = self.stream()?;
        budget
            .run_io("connection write", async move {
                stream.write_all(data).await?;
                stream.flush().await
            })
            .await
    }

    async fn close(&mut self, budget: TimeoutBudget) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        budget
            .run_io("connection close", async move { stream.shutdown().await })
            .await
    }

    fn abort(&mut self) {
        self.stream = None;
    }
}

/// 连接加上尚未消费的读缓冲。
///
/// # 意图（Why）
/// 前导解析可能一次读入超过当前记录的字节；阶段交接时连同缓冲一起移交，
/// 下一阶段从中断处继续解析，不会丢失对端已发送的数据。
pub struct BufferedConnection {
    inner: BoxConnection,
    buffer: BytesMut,
}

impl BufferedConnection {
    pub fn new(inner: BoxConnection) -> Self {
        Self::from_parts(inner, BytesMut::with_capacity(512))
    }

    pub fn from_parts(inner: BoxConnection, buffer: BytesMut) -> Self {
        Self { inner, buffer }
    }

    pub fn into_parts(self) -> (BoxConnection, BytesMut) {
        (self.inner, self.buffer)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    /// 已缓冲但尚未消费的字节数。
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 再读取一批数据；对端关闭时返回 `UnexpectedEof`。
    async fn fill(&mut self, what: &'static str, budget: TimeoutBudget) -> Result<()> {
        let read = self.inner.read(&mut self.buffer, budget).await?;
        if read == 0 {
            return Err(FramingError::UnexpectedEof(what).into());
        }
        Ok(())
    }

    pub async fn read_u8(&mut self, what: &'static str, budget: TimeoutBudget) -> Result<u8> {
        while self.buffer.is_empty() {
            self.fill(what, budget).await?;
        }
        Ok(self.buffer.get_u8())
    }

    /// 读取 7 位分组的变长整数，最多 5 字节。
    pub async fn read_varint(&mut self, what: &'static str, budget: TimeoutBudget) -> Result<u32> {
        let mut value: u32 = 0;
        for index in 0..5 {
            let byte = self.read_u8(what, budget).await?;
            value |= u32::from(byte & 0x7f) << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(FramingError::MalformedVarint.into())
    }

    pub async fn read_bytes(
        &mut self,
        len: usize,
        what: &'static str,
        budget: TimeoutBudget,
    ) -> Result<Bytes> {
        while self.buffer.len() < len {
            self.fill(what, budget).await?;
        }
        Ok(self.buffer.split_to(len).freeze())
    }

    pub async fn write_all(&mut self, data: &[u8], budget: TimeoutBudget) -> Result<()> {
        self.inner.write(data, budget).await
    }

    pub async fn close(&mut self, budget: TimeoutBudget) -> Result<()> {
        self.inner.close(budget).await
    }

    pub fn abort(&mut self) {
        self.inner.abort();
    }
}

impl fmt::Debug for BufferedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedConnection")
            .field("id", &self.inner.id())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn budget() -> TimeoutBudget {
        TimeoutBudget::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn varint_spans_multiple_reads() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut conn = BufferedConnection::new(Box::new(StreamConnection::new(local)));
        let writer = tokio::spawn(async move {
            remote.write_all(&[0xac]).await.unwrap();
            tokio::task::yield_now().await;
            remote.write_all(&[0x02, b'x']).await.unwrap();
            remote
        });
        assert_eq!(conn.read_varint("size", budget()).await.unwrap(), 300);
        let _remote = writer.await.unwrap();
        assert_eq!(conn.buffered(), 1);
    }

    #[tokio::test]
    async fn six_byte_varint_is_rejected() {
        let (local, mut remote) = tokio::io::duplex(64);
        remote.write_all(&[0xff; 6]).await.unwrap();
        let mut conn = BufferedConnection::new(Box::new(StreamConnection::new(local)));
        let err = conn.read_varint("size", budget()).await.unwrap_err();
        assert_eq!(err.code(), spark_core::codes::FRAMING_MALFORMED);
    }

    #[tokio::test]
    async fn peer_close_surfaces_as_eof() {
        let (local, remote) = tokio::io::duplex(64);
        drop(remote);
        let mut conn = BufferedConnection::new(Box::new(StreamConnection::new(local)));
        let err = conn.read_u8("mode record", budget()).await.unwrap_err();
        assert_eq!(err.code(), spark_core::codes::FRAMING_UNEXPECTED_EOF);
    }

    #[tokio::test]
    async fn aborted_stream_rejects_io() {
        let (local, _remote) = tokio::io::duplex(64);
        let mut conn = StreamConnection::new(local);
        conn.abort();
        let err = conn.write(b"x", budget()).await.unwrap_err();
        assert_eq!(err.code(), spark_core::codes::ABORTED);
    }
}
