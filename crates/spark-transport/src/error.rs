//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义握手前导与帧记录解析中出现的协议错误，并统一转换为 [`CoreError`]；
//! - 需要回送给对端的错误在转换时携带故障串，分流器据此决定是否写出 `Fault` 记录。
//!
//! ## 设计要求（What）
//! - 变体携带足以排障的上下文（记录类型、长度上限等）；
//! - `From<FramingError> for CoreError` 是唯一的出口，调用方通过 `?` 直接传播。

use std::borrow::Cow;

use spark_core::{CoreError, ErrorCategory, codes};
use thiserror::Error;

use crate::framing::record::faults;

/// 帧记录与握手前导解析错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// 模式记录携带了未支持的取值。
    #[error("framing mode 0x{0:02x} is not supported")]
    UnsupportedMode(u8),

    #[error("framing version {major}.{minor} is not supported")]
    UnsupportedVersion { major: u8, minor: u8 },

    /// 读到了当前阶段不应出现的记录类型。
    #[error("expected {expected} record but found 0x{found:02x}")]
    UnexpectedRecord { expected: &'static str, found: u8 },

    #[error("via is {len} bytes, exceeding the {max} byte limit")]
    ViaTooLong { len: usize, max: usize },

    #[error("content type is {len} bytes, exceeding the {max} byte limit")]
    ContentTypeTooLong { len: usize, max: usize },

    #[error("known encoding 0x{0:02x} is not recognized")]
    UnknownEncoding(u8),

    #[error("via `{0}` is not an absolute uri")]
    InvalidVia(String),

    #[error("record string is not valid utf-8")]
    InvalidUtf8,

    #[error("variable-length integer exceeds five bytes")]
    MalformedVarint,

    #[error("envelope exceeds the {max} byte limit")]
    EnvelopeTooLarge { max: usize },

    /// 连接在记录中途被对端关闭。
    #[error("connection closed while reading {0}")]
    UnexpectedEof(&'static str),

    /// 对端回送了故障记录。
    #[error("peer sent fault `{0}`")]
    FaultReceived(String),

    #[error("no endpoint is listening at `{0}`")]
    EndpointNotFound(String),

    #[error("content type `{0}` is not supported by the endpoint")]
    ContentTypeInvalid(String),

    #[error("service activation failed for `{0}`")]
    ServiceActivationFailed(String),
}

impl FramingError {
    /// 应回送给对端的故障串。
    pub fn fault(&self) -> Option<&'static str> {
        match self {
            FramingError::UnsupportedMode(_) => Some(faults::UNSUPPORTED_MODE),
            FramingError::UnsupportedVersion { .. } => Some(faults::UNSUPPORTED_VERSION),
            FramingError::ViaTooLong { .. } => Some(faults::VIA_TOO_LONG),
            FramingError::ContentTypeTooLong { .. } => Some(faults::CONTENT_TYPE_TOO_LONG),
            FramingError::UnknownEncoding(_) | FramingError::ContentTypeInvalid(_) => {
                Some(faults::CONTENT_TYPE_INVALID)
            }
            FramingError::EndpointNotFound(_) => Some(faults::ENDPOINT_NOT_FOUND),
            FramingError::ServiceActivationFailed(_) => Some(faults::SERVICE_ACTIVATION_FAILED),
            _ => None,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            FramingError::UnsupportedMode(_) => codes::FRAMING_UNSUPPORTED_MODE,
            FramingError::UnsupportedVersion { .. } => codes::FRAMING_UNSUPPORTED_VERSION,
            FramingError::UnexpectedRecord { .. } => codes::FRAMING_UNEXPECTED_RECORD,
            FramingError::UnexpectedEof(_) => codes::FRAMING_UNEXPECTED_EOF,
            FramingError::FaultReceived(_) => codes::FRAMING_FAULT_RECEIVED,
            FramingError::EndpointNotFound(_) => codes::FRAMING_ENDPOINT_NOT_FOUND,
            FramingError::UnknownEncoding(_) | FramingError::ContentTypeInvalid(_) => {
                codes::FRAMING_CONTENT_TYPE_INVALID
            }
            FramingError::ServiceActivationFailed(_) => codes::FRAMING_SERVICE_ACTIVATION_FAILED,
            _ => codes::FRAMING_MALFORMED,
        }
    }
}

impl From<FramingError> for CoreError {
    fn from(error: FramingError) -> Self {
        let message = error.to_string();
        let code = error.code();
        // 对端关闭属于普通通信失败，其余均为协议违例。
        let category = match &error {
            FramingError::UnexpectedEof(_) => ErrorCategory::Communication,
            FramingError::FaultReceived(fault) => ErrorCategory::ProtocolViolation {
                fault: Some(Cow::Owned(fault.clone())),
            },
            other => ErrorCategory::ProtocolViolation {
                fault: other.fault().map(Cow::Borrowed),
            },
        };
        CoreError::new(code, message)
            .with_category(category)
            .with_cause(error)
    }
}
