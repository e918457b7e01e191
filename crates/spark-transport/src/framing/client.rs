//! 客户端侧的前导编码与单例请求辅助。

use bytes::{BufMut, Bytes, BytesMut};
use spark_core::{Result, TimeoutBudget};

use super::record::{self, FramingMode, MAJOR_VERSION, MINOR_VERSION};
use crate::connection::BufferedConnection;

/// 客户端发出的完整前导。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientPreamble {
    pub mode: FramingMode,
    pub via: String,
    pub content_type: String,
}

impl ClientPreamble {
    pub fn new(mode: FramingMode, via: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            mode,
            via: via.into(),
            content_type: content_type.into(),
        }
    }

    /// 已知内容类型写成单字节编码，其余写成扩展编码字符串。
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&[record::VERSION, MAJOR_VERSION, MINOR_VERSION]);
        buf.put_slice(&[record::MODE, self.mode.wire_value()]);
        record::encode_string_record(record::VIA, &self.via, buf);
        match record::known_encoding(&self.content_type) {
            Some(encoding) => buf.put_slice(&[record::KNOWN_ENCODING, encoding]),
            None => record::encode_string_record(record::EXTENSIBLE_ENCODING, &self.content_type, buf),
        }
        buf.put_u8(record::PREAMBLE_END);
    }

    /// 发送前导并等待 `PreambleAck`；服务端回送故障时返回携带故障串的协议错误。
    pub async fn handshake(&self, connection: &mut BufferedConnection, budget: TimeoutBudget) -> Result<()> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        connection.write_all(&buf, budget).await?;
        record::expect_record(connection, record::PREAMBLE_ACK, "preamble ack record", budget).await
    }
}

/// 在已握手的单例连接上发送一次请求并读取应答。
pub async fn singleton_request(
    connection: &mut BufferedConnection,
    body: &[u8],
    max_reply_size: usize,
    budget: TimeoutBudget,
) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(body.len() + 8);
    record::encode_envelope(body, &mut buf);
    buf.put_u8(record::END);
    connection.write_all(&buf, budget).await?;
    let reply = record::read_envelope(connection, max_reply_size, budget).await?;
    record::expect_record(connection, record::END, "end record", budget).await?;
    Ok(reply)
}
