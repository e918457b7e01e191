//! 会话与单例前导的公共部分：via、内容类型与前导结束记录。

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use spark_core::{Result, TimeoutBudget};

use super::record;
use crate::connection::{BufferedConnection, ConnectionId};
use crate::error::FramingError;
use crate::settings::EndpointSettings;

/// 前导字符串长度上限。
#[derive(Clone, Copy, Debug)]
pub struct PreambleLimits {
    pub max_via_size: usize,
    pub max_content_type_size: usize,
}

/// 读完的前导内容。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreambleInfo {
    pub via: String,
    pub content_type: String,
}

/// 在模式记录之后读取 via、编码与前导结束记录。
///
/// # 执行逻辑（How）
/// 1. via 超长、非 UTF-8 或不是绝对 URI 时失败；
/// 2. 已知编码按表映射为内容类型，扩展编码直接读取字符串；
/// 3. 任何非 `PreambleEnd` 的后续记录（包括升级请求）都视为协议违例。
pub async fn read_preamble(
    connection: &mut BufferedConnection,
    limits: PreambleLimits,
    budget: TimeoutBudget,
) -> Result<PreambleInfo> {
    record::expect_record(connection, record::VIA, "via record", budget).await?;
    let max_via = limits.max_via_size;
    let via = record::read_string(
        connection,
        "via record",
        max_via,
        |len| FramingError::ViaTooLong { len, max: max_via },
        budget,
    )
    .await?;
    if !is_absolute_uri(&via) {
        return Err(FramingError::InvalidVia(via).into());
    }

    let encoding = connection.read_u8("encoding record", budget).await?;
    let content_type = match encoding {
        record::KNOWN_ENCODING => {
            let value = connection.read_u8("encoding record", budget).await?;
            record::known_content_type(value)
                .map(str::to_owned)
                .ok_or(FramingError::UnknownEncoding(value))?
        }
        record::EXTENSIBLE_ENCODING => {
            let max = limits.max_content_type_size;
            record::read_string(
                connection,
                "encoding record",
                max,
                |len| FramingError::ContentTypeTooLong { len, max },
                budget,
            )
            .await?
        }
        found => {
            return Err(FramingError::UnexpectedRecord {
                expected: "encoding record",
                found,
            }
            .into());
        }
    };

    record::expect_record(connection, record::PREAMBLE_END, "preamble end record", budget).await?;
    Ok(PreambleInfo { via, content_type })
}

fn is_absolute_uri(via: &str) -> bool {
    match via.split_once("://") {
        Some((scheme, rest)) => {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                && !rest.is_empty()
        }
        None => false,
    }
}

/// 尽力回送故障记录后关闭连接；任何失败都退化为中止。
pub(crate) async fn send_fault_and_close(
    mut connection: BufferedConnection,
    fault: &str,
    timeout: Duration,
) {
    let budget = TimeoutBudget::new(timeout);
    let mut buf = BytesMut::new();
    record::encode_fault(fault, &mut buf);
    let sent = match connection.write_all(&buf, budget).await {
        Ok(()) => connection.close(budget).await,
        Err(error) => Err(error),
    };
    match sent {
        Ok(()) => tracing::debug!(connection = connection.id(), fault, "fault sent to peer"),
        Err(error) => {
            tracing::debug!(connection = connection.id(), fault, %error, "failed to send fault");
            connection.abort();
        }
    }
}

/// 已读完前导、等待会话处理器决定接受或拒绝的双工连接。
///
/// # 契约（What）
/// - `accept` 写出 `PreambleAck` 并把连接（含剩余缓冲）交给调用方；
/// - `reject` 写出故障记录后关闭连接；
/// - 两者都消费 `self`，同一连接只会被处理一次。
#[derive(Debug)]
pub struct PendingSession {
    info: PreambleInfo,
    endpoint: Arc<EndpointSettings>,
    connection: BufferedConnection,
    fault_send_timeout: Duration,
}

impl PendingSession {
    pub(crate) fn new(
        info: PreambleInfo,
        endpoint: Arc<EndpointSettings>,
        connection: BufferedConnection,
        fault_send_timeout: Duration,
    ) -> Self {
        Self {
            info,
            endpoint,
            connection,
            fault_send_timeout,
        }
    }

    pub fn via(&self) -> &str {
        &self.info.via
    }

    pub fn content_type(&self) -> &str {
        &self.info.content_type
    }

    pub fn endpoint(&self) -> &EndpointSettings {
        &self.endpoint
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub async fn accept(mut self, budget: TimeoutBudget) -> Result<BufferedConnection> {
        if let Err(error) = self
            .connection
            .write_all(&[record::PREAMBLE_ACK], budget)
            .await
        {
            self.connection.abort();
            return Err(error);
        }
        Ok(self.connection)
    }

    pub async fn reject(self, fault: &str) {
        send_fault_and_close(self.connection, fault, self.fault_send_timeout).await;
    }
}
