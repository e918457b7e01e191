//! 接收上下文：单条消息的完成/放弃握手。
//!
//! # 设计背景（Why）
//! - 可靠接收要求“至多一次”交付：消息被 `complete` 后才算被消费，`abandon` 则交还给传输层重新投递；
//! - 在环境事务中完成的消息，只有事务提交才最终生效；事务回滚时上下文悄然回到 `Received`，
//!   消息可在重投后再次完成。
//!
//! # 契约（What）
//! - 所有改变状态的入口经同一个二元信号量串行化；并发的第二个调用在自己的预算内等待，而非竞争；
//! - 取锁超时报告为状态错误（携带等待时观察到的状态），而非裸超时；
//! - `abandon` 对 `Abandoning`/`Abandoned` 幂等；对 `Faulted` 返回专用故障错误；
//! - 事务内 `complete` 持有状态锁直至事务结果确定；无事务时状态检查后立即释放；
//! - `fault` 幂等，`Faulted` 事件至多触发一次。
//!
//! # 状态机
//! ```text
//! Received --complete--> Completing --ok--> Completed
//!    ^  \                    |  \--err--> Faulted
//!    |   \--abandon--> Abandoning --ok--> Abandoned
//!    +---- 事务回滚（Completing / Completed）
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use spark_core::prelude::*;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ReceiveContextError;

/// 传输层把接收上下文挂到消息属性袋时使用的键。
pub const RECEIVE_CONTEXT_PROPERTY: &str = "ReceiveContext";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReceiveContextState {
    Received,
    Completing,
    Completed,
    Abandoning,
    Abandoned,
    Faulted,
}

impl ReceiveContextState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReceiveContextState::Completed
                | ReceiveContextState::Abandoned
                | ReceiveContextState::Faulted
        )
    }
}

/// 传输层实现的完成/放弃动作。
#[async_trait]
pub trait ReceiveContextHandler: Send + Sync {
    async fn on_abandon(&self, reason: Option<&CoreError>, budget: TimeoutBudget) -> Result<()>;

    async fn on_complete(&self, budget: TimeoutBudget) -> Result<()>;
}

type FaultedHandler = Arc<dyn Fn() + Send + Sync>;

struct ContextInner {
    state: Mutex<ReceiveContextState>,
    lock: Arc<Semaphore>,
    handler: Arc<dyn ReceiveContextHandler>,
    faulted_raised: AtomicBool,
    faulted: Mutex<Vec<FaultedHandler>>,
}

impl ContextInner {
    fn fault(&self) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            tracing::warn!(state = ?*state, "receive context faulted");
            *state = ReceiveContextState::Faulted;
        }
        if !self.faulted_raised.swap(true, Ordering::SeqCst) {
            let handlers = self.faulted.lock().clone();
            for handler in handlers {
                handler();
            }
        }
    }
}

/// 每条消息一个的接收上下文句柄，克隆共享同一状态。
#[derive(Clone)]
pub struct ReceiveContext {
    inner: Arc<ContextInner>,
}

impl ReceiveContext {
    pub fn new(handler: Arc<dyn ReceiveContextHandler>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                state: Mutex::new(ReceiveContextState::Received),
                lock: Arc::new(Semaphore::new(1)),
                handler,
                faulted_raised: AtomicBool::new(false),
                faulted: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> ReceiveContextState {
        *self.inner.state.lock()
    }

    /// 注册故障事件，通常由所属通道用来中止自身。
    pub fn on_faulted<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.faulted.lock().push(Arc::new(handler));
    }

    /// 从消息属性袋中取出接收上下文。
    pub fn try_get(message: &Message) -> Option<ReceiveContext> {
        Self::try_get_from(message.properties())
    }

    pub fn try_get_from(properties: &MessageProperties) -> Option<ReceiveContext> {
        properties
            .get::<ReceiveContext>(RECEIVE_CONTEXT_PROPERTY)
            .map(|context| ReceiveContext::clone(&context))
    }

    /// 把自身登记到消息属性袋。
    pub fn attach_to(&self, message: &mut Message) {
        message
            .properties_mut()
            .insert(RECEIVE_CONTEXT_PROPERTY, self.clone());
    }

    async fn acquire(&self, operation: &'static str, budget: TimeoutBudget) -> Result<OwnedSemaphorePermit> {
        let lock = Arc::clone(&self.inner.lock);
        let acquired = budget
            .run(operation, async move {
                lock.acquire_owned()
                    .await
                    .map_err(|_| CoreError::disposed("receive context lock closed"))
            })
            .await;
        match acquired {
            Ok(permit) => Ok(permit),
            Err(error) if error.is_timeout() => Err(ReceiveContextError::LockTimeout {
                operation,
                state: self.state(),
                timeout: budget.original(),
            }
            .into()),
            Err(error) => Err(error),
        }
    }

    /// 放弃消息，交还传输层重新投递。
    ///
    /// # 执行逻辑（How）
    /// 1. 在预算内取得状态锁；
    /// 2. 已在放弃中或已放弃：直接成功；已故障：返回故障错误；非 `Received`：返回状态错误；
    /// 3. 进入 `Abandoning` 后立即释放状态锁（放弃不可回滚，无需继续独占）；
    /// 4. 执行传输层动作，成功进入 `Abandoned`，失败令上下文故障并返回错误。
    pub async fn abandon(&self, reason: Option<CoreError>, budget: TimeoutBudget) -> Result<()> {
        let permit = self.acquire("abandon", budget).await?;
        {
            let mut state = self.inner.state.lock();
            match *state {
                ReceiveContextState::Abandoning | ReceiveContextState::Abandoned => return Ok(()),
                ReceiveContextState::Faulted => return Err(ReceiveContextError::Faulted.into()),
                ReceiveContextState::Received => *state = ReceiveContextState::Abandoning,
                other => {
                    return Err(ReceiveContextError::InvalidState {
                        operation: "abandon",
                        state: other,
                    }
                    .into());
                }
            }
        }
        drop(permit);

        if let Err(error) = self.inner.handler.on_abandon(reason.as_ref(), budget).await {
            self.inner.fault();
            return Err(error);
        }
        let mut state = self.inner.state.lock();
        match *state {
            ReceiveContextState::Abandoning => {
                *state = ReceiveContextState::Abandoned;
                Ok(())
            }
            _ => Err(ReceiveContextError::Faulted.into()),
        }
    }

    /// 完成消息。
    ///
    /// # 执行逻辑（How）
    /// 1. 在预算内取得状态锁并要求 `Received`，随即进入 `Completing`；
    /// 2. 存在环境事务时登记易失参与者，状态锁随参与者一起保留到事务结果确定；
    ///    否则立即释放状态锁；
    /// 3. 执行传输层动作：成功且仍为 `Completing` 时进入 `Completed`，
    ///    期间事务已回滚则保持 `Received`；失败令上下文故障。
    pub async fn complete(&self, budget: TimeoutBudget) -> Result<()> {
        let permit = self.acquire("complete", budget).await?;
        {
            let mut state = self.inner.state.lock();
            match *state {
                ReceiveContextState::Received => *state = ReceiveContextState::Completing,
                ReceiveContextState::Faulted => return Err(ReceiveContextError::Faulted.into()),
                other => {
                    return Err(ReceiveContextError::InvalidState {
                        operation: "complete",
                        state: other,
                    }
                    .into());
                }
            }
        }

        match Transaction::current() {
            Some(transaction) => {
                let enlistment = Arc::new(CompletionEnlistment {
                    context: Arc::clone(&self.inner),
                    permit: Mutex::new(Some(permit)),
                });
                if let Err(error) = transaction.enlist_volatile(enlistment.clone()) {
                    *self.inner.state.lock() = ReceiveContextState::Received;
                    enlistment.release();
                    return Err(error);
                }
                tracing::trace!(transaction = transaction.id(), "receive context enlisted");
            }
            None => drop(permit),
        }

        if let Err(error) = self.inner.handler.on_complete(budget).await {
            self.inner.fault();
            return Err(error);
        }
        let mut state = self.inner.state.lock();
        match *state {
            ReceiveContextState::Completing => {
                *state = ReceiveContextState::Completed;
                Ok(())
            }
            ReceiveContextState::Faulted => Err(ReceiveContextError::Faulted.into()),
            _ => Ok(()),
        }
    }

    /// 令上下文故障；终止态下无副作用。
    pub fn fault(&self) {
        self.inner.fault();
    }
}

impl fmt::Debug for ReceiveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveContext")
            .field("state", &self.state())
            .finish()
    }
}

/// 事务内完成时登记的易失参与者；持有状态锁直至收到结果通知。
struct CompletionEnlistment {
    context: Arc<ContextInner>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl CompletionEnlistment {
    fn release(&self) {
        self.permit.lock().take();
    }
}

impl EnlistmentNotification for CompletionEnlistment {
    fn commit(&self) {
        self.release();
    }

    fn rollback(&self) {
        {
            let mut state = self.context.state.lock();
            if matches!(
                *state,
                ReceiveContextState::Completing | ReceiveContextState::Completed
            ) {
                tracing::debug!(state = ?*state, "transaction rolled back; message returned to received");
                *state = ReceiveContextState::Received;
            }
        }
        self.release();
    }

    fn in_doubt(&self) {
        self.release();
    }
}
