//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 绑定器与接收上下文的失败需要携带状态上下文（当前通信状态、接收状态、等待时长），
//!   便于调用方判断“为什么不能继续”；
//! - 两类领域错误都经 `From` 落到 [`CoreError`]，分类决定屏蔽策略如何处置它们。
//!
//! ## 设计要求（What）
//! - 生命周期终止类错误（关闭、中止、故障）分别映射到 `Disposed`/`Aborted`/`Faulted`；
//! - 接收上下文的锁等待超时映射为 `InvalidState` 而非 `Timeout`，错误消息包含当前状态。

use std::time::Duration;

use spark_core::{CoreError, ErrorCategory, codes};
use thiserror::Error;

use crate::binder::MaskingMode;
use crate::channel::{ChannelShape, CommunicationState};
use crate::receive_context::ReceiveContextState;

/// 绑定器操作错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BinderError {
    /// 绑定器尚未打开。
    #[error("binder is {state:?}; open it before issuing output operations")]
    NotOpened { state: CommunicationState },

    #[error("binder has been closed")]
    Closed,

    #[error("binder has been aborted")]
    Aborted,

    #[error("binder is faulted")]
    Faulted,

    #[error("request did not complete within {timeout:?}")]
    RequestTimedOut { timeout: Duration },

    #[error("send did not complete within {timeout:?}")]
    SendTimedOut { timeout: Duration },

    /// 通道工厂产出的通道形态与绑定器不一致。
    #[error("channel factory produced a {actual:?} channel for a {expected:?} binder")]
    ShapeMismatch {
        expected: ChannelShape,
        actual: ChannelShape,
    },

    #[error("default masking mode {0:?} is not allowed; use None or All")]
    MaskingModeNotAllowed(MaskingMode),

    #[error("try_receive requires MaskingMode::None")]
    TryReceiveRequiresNoMasking,

    /// 仅在容错开启时才能中止当前内部通道。
    #[error("aborting the current channel requires fault tolerance")]
    FaultToleranceRequired,

    #[error("request channel returned no reply")]
    ReplyMissing,

    #[error("no inner channel is available")]
    ChannelUnavailable,
}

impl BinderError {
    fn code(&self) -> &'static str {
        match self {
            BinderError::NotOpened { .. } | BinderError::FaultToleranceRequired => {
                codes::BINDER_INVALID_STATE
            }
            BinderError::Closed => codes::BINDER_CLOSED,
            BinderError::Aborted => codes::BINDER_ABORTED,
            BinderError::Faulted => codes::BINDER_FAULTED,
            BinderError::RequestTimedOut { .. } | BinderError::SendTimedOut { .. } => {
                codes::BINDER_TIMEOUT
            }
            BinderError::ShapeMismatch { .. }
            | BinderError::MaskingModeNotAllowed(_)
            | BinderError::TryReceiveRequiresNoMasking => codes::BINDER_INVALID_ARGUMENT,
            BinderError::ReplyMissing => codes::BINDER_REPLY_MISSING,
            BinderError::ChannelUnavailable => codes::BINDER_CHANNEL_UNAVAILABLE,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            BinderError::NotOpened { .. } | BinderError::FaultToleranceRequired => {
                ErrorCategory::InvalidState
            }
            BinderError::Closed => ErrorCategory::Disposed,
            BinderError::Aborted => ErrorCategory::Aborted,
            BinderError::Faulted => ErrorCategory::Faulted,
            BinderError::RequestTimedOut { .. } | BinderError::SendTimedOut { .. } => {
                ErrorCategory::Timeout
            }
            BinderError::ShapeMismatch { .. }
            | BinderError::MaskingModeNotAllowed(_)
            | BinderError::TryReceiveRequiresNoMasking => ErrorCategory::InvalidArgument,
            BinderError::ReplyMissing | BinderError::ChannelUnavailable => {
                ErrorCategory::Communication
            }
        }
    }
}

impl From<BinderError> for CoreError {
    fn from(error: BinderError) -> Self {
        CoreError::new(error.code(), error.to_string())
            .with_category(error.category())
            .with_cause(error)
    }
}

/// 接收上下文错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReceiveContextError {
    #[error("cannot {operation} a receive context in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ReceiveContextState,
    },

    /// 在预算内未能取得状态锁；报告等待时观察到的状态。
    #[error("cannot {operation} within {timeout:?}: another operation holds the receive context in state {state:?}")]
    LockTimeout {
        operation: &'static str,
        state: ReceiveContextState,
        timeout: Duration,
    },

    #[error("receive context is faulted")]
    Faulted,
}

impl From<ReceiveContextError> for CoreError {
    fn from(error: ReceiveContextError) -> Self {
        let (code, category) = match error {
            ReceiveContextError::Faulted => (codes::RECEIVE_CONTEXT_FAULTED, ErrorCategory::Faulted),
            _ => (
                codes::RECEIVE_CONTEXT_INVALID_STATE,
                ErrorCategory::InvalidState,
            ),
        };
        CoreError::new(code, error.to_string())
            .with_category(category)
            .with_cause(error)
    }
}
