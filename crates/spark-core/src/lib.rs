#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-core: 传输会话核心的共享契约。"]
#![doc = ""]
#![doc = "连接分流、可靠通道绑定与接收上下文三条链路共用本 crate 提供的四类基础设施："]
#![doc = "稳定错误码与分类（[`CoreError`]）、贯穿调用链的超时预算（[`TimeoutBudget`]）、"]
#![doc = "携带属性袋的消息（[`Message`]）以及任务级环境事务（[`Transaction`]）。"]

pub mod error;
pub mod message;
pub mod prelude;
pub mod time;
pub mod transaction;

pub use error::{CoreError, ErrorCategory, ErrorCause, Result, codes};
pub use message::{Message, MessageId, MessageProperties};
pub use time::TimeoutBudget;
pub use transaction::{
    EnlistmentNotification, PrepareVote, Transaction, TransactionStatus,
};
