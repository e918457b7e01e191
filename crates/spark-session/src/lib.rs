#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-session: 客户端可靠通道绑定器与接收上下文。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：上层协议需要一个底层连接断开后可透明重建的逻辑通道，以及与环境事务协作的“至多一次”接收确认。"]
#![doc = "- **What**：提供四种内部通道形态的契约、[`ClientReliableChannelBinder`] 与其独占租约同步器、[`ReceiveContext`] 状态机。"]
#![doc = "- **How**：形态差异收敛为构造时选定的静态行为表；失败由单一的 [`MaskingMode`] 决定抛出或吞掉；接收上下文以二元信号量串行化所有状态变更。"]

pub mod binder;
pub mod channel;
pub mod error;
pub mod receive_context;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use binder::{
    Acquire, BinderSettings, ChannelLease, ChannelSynchronizer, ClientReliableChannelBinder,
    Dequeued, InputQueue, MaskingMode, ReceiveOutcome, TolerateFaultsMode,
};
pub use channel::{
    ChannelFactory, ChannelShape, CommunicationState, DuplexChannel, DuplexSessionChannel,
    EndpointAddress, InnerChannel, RequestChannel, RequestSessionChannel, ShapedChannel,
};
pub use error::{BinderError, ReceiveContextError};
pub use receive_context::{
    RECEIVE_CONTEXT_PROPERTY, ReceiveContext, ReceiveContextHandler, ReceiveContextState,
};
