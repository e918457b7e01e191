//! 常用类型的集中导出，供下游 `use spark_core::prelude::*;` 一次性引入。

pub use crate::error::{CoreError, ErrorCategory, Result, codes};
pub use crate::message::{Message, MessageId, MessageProperties};
pub use crate::time::TimeoutBudget;
pub use crate::transaction::{EnlistmentNotification, PrepareVote, Transaction, TransactionStatus};
