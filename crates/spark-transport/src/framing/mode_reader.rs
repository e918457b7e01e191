use std::time::Duration;

use spark_core::{Result, TimeoutBudget};

use super::record::{self, MAJOR_VERSION};
use crate::connection::{BufferedConnection, ConnectionId};
use crate::error::FramingError;

/// 读取版本与模式记录，决定连接交给哪条前导流水线。
///
/// # 契约（What）
/// - `read_mode` 返回模式记录的原始字节，由调用方解释为 [`FramingMode`](super::FramingMode)；
/// - `is_cached` 标记连接来自复用池：此时读取预算为空闲超时，超时属于预期行为；
/// - 读取器独占连接，`into_connection` 把连接连同已缓冲字节移交给下一阶段。
#[derive(Debug)]
pub struct ConnectionModeReader {
    connection: BufferedConnection,
    is_cached: bool,
}

impl ConnectionModeReader {
    pub fn new(connection: BufferedConnection, is_cached: bool) -> Self {
        Self {
            connection,
            is_cached,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.is_cached
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub async fn read_mode(&mut self, budget: TimeoutBudget) -> Result<u8> {
        record::expect_record(&mut self.connection, record::VERSION, "version record", budget)
            .await?;
        let major = self.connection.read_u8("version record", budget).await?;
        let minor = self.connection.read_u8("version record", budget).await?;
        if major != MAJOR_VERSION {
            return Err(FramingError::UnsupportedVersion { major, minor }.into());
        }
        record::expect_record(&mut self.connection, record::MODE, "mode record", budget).await?;
        self.connection.read_u8("mode record", budget).await
    }

    /// 拒绝入池时优雅关闭连接；关闭失败则中止。
    pub async fn close_from_pool(mut self, close_timeout: Duration) {
        let id = self.connection.id();
        if let Err(error) = self
            .connection
            .close(TimeoutBudget::new(close_timeout))
            .await
        {
            tracing::debug!(connection = id, %error, "graceful close from pool failed, aborting");
            self.connection.abort();
        }
    }

    pub fn abort(mut self) {
        self.connection.abort();
    }

    pub fn into_connection(self) -> BufferedConnection {
        self.connection
    }
}
