//! 帧记录的线上格式。
//!
//! # 契约（What）
//! - 每条记录以 1 字节记录类型开头；字符串与长度以 7 位分组变长整数作前缀，最长 5 字节；
//! - 前导顺序固定为 `Version → Mode → Via → Encoding → PreambleEnd`，服务端以 `PreambleAck` 或 `Fault` 应答；
//! - 未分块信封以 `UnsizedEnvelope` 开头，后跟若干“长度 + 字节”块，以长度为 0 的块结束。

use bytes::{BufMut, Bytes, BytesMut};
use spark_core::{Result, TimeoutBudget};

use crate::connection::BufferedConnection;
use crate::error::FramingError;

pub const VERSION: u8 = 0x00;
pub const MODE: u8 = 0x01;
pub const VIA: u8 = 0x02;
pub const KNOWN_ENCODING: u8 = 0x03;
pub const EXTENSIBLE_ENCODING: u8 = 0x04;
pub const UNSIZED_ENVELOPE: u8 = 0x05;
pub const END: u8 = 0x07;
pub const FAULT: u8 = 0x08;
pub const PREAMBLE_ACK: u8 = 0x0B;
pub const PREAMBLE_END: u8 = 0x0C;

pub const MAJOR_VERSION: u8 = 1;
pub const MINOR_VERSION: u8 = 0;

const MODE_SINGLETON_UNSIZED: u8 = 0x01;
const MODE_DUPLEX: u8 = 0x02;

/// 故障串读取上限。
pub const MAX_FAULT_SIZE: usize = 256;

/// 回送给对端的故障串。
pub mod faults {
    pub const UNSUPPORTED_MODE: &str =
        "http://schemas.microsoft.com/ws/2006/05/framing/faults/UnsupportedMode";
    pub const UNSUPPORTED_VERSION: &str =
        "http://schemas.microsoft.com/ws/2006/05/framing/faults/UnsupportedVersion";
    pub const ENDPOINT_NOT_FOUND: &str =
        "http://schemas.microsoft.com/ws/2006/05/framing/faults/EndpointNotFound";
    pub const CONTENT_TYPE_INVALID: &str =
        "http://schemas.microsoft.com/ws/2006/05/framing/faults/ContentTypeInvalid";
    pub const CONTENT_TYPE_TOO_LONG: &str =
        "http://schemas.microsoft.com/ws/2006/05/framing/faults/ContentTypeTooLong";
    pub const VIA_TOO_LONG: &str =
        "http://schemas.microsoft.com/ws/2006/05/framing/faults/ViaTooLong";
    pub const SERVICE_ACTIVATION_FAILED: &str =
        "http://schemas.microsoft.com/ws/2006/05/framing/faults/ServiceActivationFailed";
}

/// 连接的帧模式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FramingMode {
    /// 长连接双工会话。
    Duplex,
    /// 一次请求/应答，完成后连接可被复用。
    Singleton,
}

impl FramingMode {
    pub fn wire_value(self) -> u8 {
        match self {
            FramingMode::Duplex => MODE_DUPLEX,
            FramingMode::Singleton => MODE_SINGLETON_UNSIZED,
        }
    }
}

impl TryFrom<u8> for FramingMode {
    type Error = FramingError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            MODE_SINGLETON_UNSIZED => Ok(FramingMode::Singleton),
            MODE_DUPLEX => Ok(FramingMode::Duplex),
            other => Err(FramingError::UnsupportedMode(other)),
        }
    }
}

const KNOWN_CONTENT_TYPES: [&str; 9] = [
    "text/xml; charset=utf-8",
    "text/xml; charset=utf-16",
    "text/xml; charset=unicodeFFFE",
    "application/soap+xml; charset=utf-8",
    "application/soap+xml; charset=utf-16",
    "application/soap+xml; charset=unicodeFFFE",
    "multipart/related",
    "application/soap+msbin1",
    "application/soap+msbinsession1",
];

/// 已知编码字节对应的内容类型。
pub fn known_content_type(encoding: u8) -> Option<&'static str> {
    KNOWN_CONTENT_TYPES.get(usize::from(encoding)).copied()
}

/// 内容类型对应的已知编码字节。
pub fn known_encoding(content_type: &str) -> Option<u8> {
    KNOWN_CONTENT_TYPES
        .iter()
        .position(|candidate| candidate.eq_ignore_ascii_case(content_type))
        .and_then(|index| u8::try_from(index).ok())
}

pub fn encode_varint(mut value: u32, buf: &mut BytesMut) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn encode_len(len: usize, buf: &mut BytesMut) {
    encode_varint(u32::try_from(len).unwrap_or(u32::MAX), buf);
}

/// 写出“记录类型 + 长度前缀字符串”。
pub fn encode_string_record(record: u8, value: &str, buf: &mut BytesMut) {
    buf.put_u8(record);
    encode_len(value.len(), buf);
    buf.put_slice(value.as_bytes());
}

pub fn encode_fault(fault: &str, buf: &mut BytesMut) {
    encode_string_record(FAULT, fault, buf);
}

/// 写出单块未分块信封，空负载只写结束块。
pub fn encode_envelope(payload: &[u8], buf: &mut BytesMut) {
    buf.put_u8(UNSIZED_ENVELOPE);
    if !payload.is_empty() {
        encode_len(payload.len(), buf);
        buf.put_slice(payload);
    }
    encode_varint(0, buf);
}

/// 读取长度受限的 UTF-8 字符串。
pub async fn read_string(
    connection: &mut BufferedConnection,
    what: &'static str,
    max: usize,
    too_long: impl FnOnce(usize) -> FramingError,
    budget: TimeoutBudget,
) -> Result<String> {
    let len = connection.read_varint(what, budget).await? as usize;
    if len > max {
        return Err(too_long(len).into());
    }
    let bytes = connection.read_bytes(len, what, budget).await?;
    String::from_utf8(bytes.to_vec()).map_err(|_| FramingError::InvalidUtf8.into())
}

/// 读取期望的记录类型；对端回送故障时转换为 `FaultReceived`。
pub async fn expect_record(
    connection: &mut BufferedConnection,
    expected: u8,
    name: &'static str,
    budget: TimeoutBudget,
) -> Result<()> {
    let found = connection.read_u8(name, budget).await?;
    if found == expected {
        return Ok(());
    }
    if found == FAULT {
        let fault = read_string(
            connection,
            "fault record",
            MAX_FAULT_SIZE,
            |_| FramingError::FaultReceived(String::from("<oversized fault>")),
            budget,
        )
        .await?;
        return Err(FramingError::FaultReceived(fault).into());
    }
    Err(FramingError::UnexpectedRecord {
        expected: name,
        found,
    }
    .into())
}

/// 读取完整的未分块信封负载，累计长度超过 `max_size` 时失败。
pub async fn read_envelope(
    connection: &mut BufferedConnection,
    max_size: usize,
    budget: TimeoutBudget,
) -> Result<Bytes> {
    expect_record(connection, UNSIZED_ENVELOPE, "envelope record", budget).await?;
    let mut payload = BytesMut::new();
    loop {
        let chunk = connection.read_varint("envelope chunk", budget).await? as usize;
        if chunk == 0 {
            return Ok(payload.freeze());
        }
        if payload.len() + chunk > max_size {
            return Err(FramingError::EnvelopeTooLarge { max: max_size }.into());
        }
        let bytes = connection.read_bytes(chunk, "envelope chunk", budget).await?;
        payload.extend_from_slice(&bytes);
    }
}
