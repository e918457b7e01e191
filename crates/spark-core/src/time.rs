//! 超时预算：在一条调用链上共享同一个截止时间。
//!
//! # 设计背景（Why）
//! - 握手读取、通道获取、发送与接收都是可挂起操作，每一步都要扣减同一个逐渐缩短的预算，
//!   而不是各自等待固定时长；
//! - 预算以 `tokio::time::Instant` 表示，测试可借助 `tokio::time::pause` 精确推进时间。
//!
//! # 契约（What）
//! - [`TimeoutBudget`] 为 `Copy` 值类型，可随意向下游传递；
//! - [`TimeoutBudget::run`] 在进入前检查预算是否已耗尽，耗尽时直接返回 `Timeout` 分类错误，
//!   不会轮询传入的 Future。

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{CoreError, Result, codes};

/// 跟踪剩余时间的超时预算。
#[derive(Clone, Copy, Debug)]
pub struct TimeoutBudget {
    original: Duration,
    deadline: Option<Instant>,
}

impl TimeoutBudget {
    /// 以给定时长创建预算；`Duration::MAX` 或溢出的时长视为无限。
    pub fn new(timeout: Duration) -> Self {
        let deadline = if timeout == Duration::MAX {
            None
        } else {
            Instant::now().checked_add(timeout)
        };
        Self {
            original: timeout,
            deadline,
        }
    }

    /// 永不过期的预算。
    pub fn infinite() -> Self {
        Self {
            original: Duration::MAX,
            deadline: None,
        }
    }

    /// 已耗尽的预算。
    pub fn expired() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn original(&self) -> Duration {
        self.original
    }

    pub fn is_infinite(&self) -> bool {
        self.deadline.is_none()
    }

    /// 剩余时长；无限预算返回 `Duration::MAX`。
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.deadline {
            Some(deadline) => deadline <= Instant::now(),
            None => false,
        }
    }

    /// 截取不超过 `cap` 的子预算。
    pub fn min(&self, cap: Duration) -> Self {
        let remaining = self.remaining();
        if remaining <= cap {
            *self
        } else {
            Self::new(cap)
        }
    }

    /// 预算耗尽时使用的标准错误。
    pub fn elapsed_error(&self, operation: &str) -> CoreError {
        CoreError::timeout(format!(
            "{operation} did not complete within {:?}",
            self.original
        ))
    }

    /// 在剩余预算内驱动 `future`。
    ///
    /// # 执行逻辑（How）
    /// 1. 预算已耗尽时立即返回超时错误；
    /// 2. 无限预算直接等待；
    /// 3. 其余情况交给 `tokio::time::timeout_at`，到期后丢弃 Future 并返回超时错误。
    pub async fn run<F, T>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_expired() {
            return Err(self.elapsed_error(operation));
        }
        match self.deadline {
            None => future.await,
            Some(deadline) => match tokio::time::timeout_at(deadline, future).await {
                Ok(result) => result,
                Err(_) => Err(self.elapsed_error(operation)),
            },
        }
    }

    /// [`run`](Self::run) 的 IO 版本：`io::Error` 被映射为通信类错误。
    pub async fn run_io<F, T>(&self, operation: &'static str, future: F) -> Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        self.run(operation, async move {
            future.await.map_err(|err| {
                let message = format!("{operation}: {err}");
                let mapped = if err.kind() == io::ErrorKind::TimedOut {
                    CoreError::timeout(message)
                } else {
                    CoreError::new(codes::COMMUNICATION, message)
                };
                mapped.with_cause(err)
            })
        })
        .await
    }
}

impl From<Duration> for TimeoutBudget {
    fn from(timeout: Duration) -> Self {
        Self::new(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test(start_paused = true)]
    async fn remaining_shrinks_with_time() {
        let budget = TimeoutBudget::new(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(budget.remaining(), Duration::from_secs(3));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(budget.is_expired());
        assert_eq!(budget.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn expired_budget_never_polls_future() {
        let budget = TimeoutBudget::expired();
        let err = budget
            .run::<_, ()>("probe", async { unreachable!("future must not be polled") })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn run_times_out_pending_future() {
        let budget = TimeoutBudget::new(Duration::from_millis(50));
        let err = budget
            .run("wait", std::future::pending::<Result<()>>())
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::TIMEOUT);
    }

    #[test]
    fn infinite_budget_reports_max() {
        let budget = TimeoutBudget::new(Duration::MAX);
        assert!(budget.is_infinite());
        assert_eq!(budget.remaining(), Duration::MAX);
        assert!(!budget.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn min_caps_remaining_time() {
        let budget = TimeoutBudget::new(Duration::from_secs(10));
        let capped = budget.min(Duration::from_secs(1));
        assert_eq!(capped.remaining(), Duration::from_secs(1));
        let uncapped = budget.min(Duration::from_secs(60));
        assert_eq!(uncapped.remaining(), Duration::from_secs(10));
    }

    proptest! {
        #[test]
        fn sub_budget_never_outlives_parent(parent_ms in 1u64..100_000, cap_ms in 0u64..200_000) {
            let parent = TimeoutBudget::new(Duration::from_millis(parent_ms));
            let cap = Duration::from_millis(cap_ms);
            let child = parent.min(cap);
            prop_assert!(child.remaining() <= cap);
            prop_assert!(child.remaining() <= parent.original());
            prop_assert!(child.original() <= parent.original());
        }
    }
}
