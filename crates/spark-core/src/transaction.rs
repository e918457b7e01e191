//! 任务级环境事务。
//!
//! # 设计背景（Why）
//! - 接收上下文在 `complete` 时需要感知“当前是否处于事务中”，并在事务回滚时把消息退回
//!   可重新投递的状态；
//! - 事务作为显式对象传入 [`Transaction::scope`]，通过 `tokio::task_local!` 在同一任务内可见，
//!   不依赖进程级全局可变状态。
//!
//! # 契约（What）
//! - 只有 `Active` 事务接受登记；
//! - `commit` 先逐一询问 `prepare` 投票，任一参与者要求回滚即整体回滚；
//! - 结果通知在锁外执行，参与者可在回调中再次查询事务状态。

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{CoreError, ErrorCategory, Result, codes};

tokio::task_local! {
    static CURRENT: Transaction;
}

/// 事务的最终或当前状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
    InDoubt,
}

/// 参与者在准备阶段的投票。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepareVote {
    Prepared,
    ForceRollback,
}

/// 易失登记参与者收到的两阶段通知。
pub trait EnlistmentNotification: Send + Sync {
    fn prepare(&self) -> PrepareVote {
        PrepareVote::Prepared
    }

    fn commit(&self);

    fn rollback(&self);

    fn in_doubt(&self);
}

type CompletionCallback = Box<dyn FnOnce(TransactionStatus) + Send>;

struct TransactionState {
    status: TransactionStatus,
    enlistments: Vec<Arc<dyn EnlistmentNotification>>,
    on_completed: Vec<CompletionCallback>,
}

struct TransactionInner {
    id: u64,
    state: Mutex<TransactionState>,
}

/// 可跨任务克隆的事务句柄。
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self {
            inner: Arc::new(TransactionInner {
                id: NEXT.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(TransactionState {
                    status: TransactionStatus::Active,
                    enlistments: Vec::new(),
                    on_completed: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.inner.state.lock().status
    }

    /// 当前任务的环境事务。
    pub fn current() -> Option<Transaction> {
        CURRENT.try_with(Transaction::clone).ok()
    }

    /// 在 `future` 执行期间把 `self` 设为环境事务。
    pub async fn scope<F>(&self, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self.clone(), future).await
    }

    /// 登记易失参与者。
    pub fn enlist_volatile(&self, enlistment: Arc<dyn EnlistmentNotification>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.status != TransactionStatus::Active {
            return Err(not_active(self.inner.id, state.status));
        }
        state.enlistments.push(enlistment);
        Ok(())
    }

    /// 注册结果回调；事务已结束时立即以最终状态调用。
    pub fn on_completed<F>(&self, callback: F)
    where
        F: FnOnce(TransactionStatus) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.status == TransactionStatus::Active {
            state.on_completed.push(Box::new(callback));
            return;
        }
        let status = state.status;
        drop(state);
        callback(status);
    }

    /// 两阶段提交，返回最终状态。
    ///
    /// # 执行逻辑（How）
    /// 1. 在锁内确认仍为 `Active` 并取走参与者列表；
    /// 2. 锁外依次调用 `prepare`，遇到 `ForceRollback` 立即停止询问；
    /// 3. 写入最终状态后向所有参与者广播 `commit` 或 `rollback`，最后触发结果回调。
    pub fn commit(&self) -> Result<TransactionStatus> {
        let enlistments = self.snapshot_enlistments()?;
        let prepared = enlistments
            .iter()
            .all(|enlistment| enlistment.prepare() == PrepareVote::Prepared);
        let outcome = if prepared {
            TransactionStatus::Committed
        } else {
            TransactionStatus::Aborted
        };
        self.finish(outcome, enlistments);
        Ok(outcome)
    }

    /// 回滚事务；已结束的事务返回错误。
    pub fn rollback(&self) -> Result<()> {
        let enlistments = self.snapshot_enlistments()?;
        self.finish(TransactionStatus::Aborted, enlistments);
        Ok(())
    }

    /// 以“结果未知”结束事务，用于协调者与资源管理器失联的场景。
    pub fn mark_in_doubt(&self) -> Result<()> {
        let enlistments = self.snapshot_enlistments()?;
        self.finish(TransactionStatus::InDoubt, enlistments);
        Ok(())
    }

    fn snapshot_enlistments(&self) -> Result<Vec<Arc<dyn EnlistmentNotification>>> {
        let state = self.inner.state.lock();
        if state.status != TransactionStatus::Active {
            return Err(not_active(self.inner.id, state.status));
        }
        Ok(state.enlistments.clone())
    }

    fn finish(&self, outcome: TransactionStatus, enlistments: Vec<Arc<dyn EnlistmentNotification>>) {
        let callbacks = {
            let mut state = self.inner.state.lock();
            state.status = outcome;
            state.enlistments.clear();
            std::mem::take(&mut state.on_completed)
        };
        tracing::debug!(transaction = self.inner.id, ?outcome, "transaction finished");
        for enlistment in &enlistments {
            match outcome {
                TransactionStatus::Committed => enlistment.commit(),
                TransactionStatus::Aborted => enlistment.rollback(),
                TransactionStatus::InDoubt => enlistment.in_doubt(),
                TransactionStatus::Active => {}
            }
        }
        for callback in callbacks {
            callback(outcome);
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

fn not_active(id: u64, status: TransactionStatus) -> CoreError {
    CoreError::new(
        codes::TRANSACTION_NOT_ACTIVE,
        format!("transaction {id} is {status:?} and no longer accepts work"),
    )
    .with_category(ErrorCategory::InvalidState)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        veto: bool,
    }

    impl EnlistmentNotification for Recorder {
        fn prepare(&self) -> PrepareVote {
            if self.veto {
                PrepareVote::ForceRollback
            } else {
                PrepareVote::Prepared
            }
        }

        fn commit(&self) {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }

        fn rollback(&self) {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }

        fn in_doubt(&self) {}
    }

    #[tokio::test]
    async fn scope_exposes_ambient_transaction() {
        assert!(Transaction::current().is_none());
        let tx = Transaction::new();
        let seen = tx.scope(async { Transaction::current().map(|t| t.id()) }).await;
        assert_eq!(seen, Some(tx.id()));
        assert!(Transaction::current().is_none());
    }

    #[test]
    fn veto_rolls_back_every_participant() {
        let tx = Transaction::new();
        let good = Arc::new(Recorder::default());
        let bad = Arc::new(Recorder {
            veto: true,
            ..Recorder::default()
        });
        tx.enlist_volatile(good.clone()).unwrap();
        tx.enlist_volatile(bad.clone()).unwrap();
        assert_eq!(tx.commit().unwrap(), TransactionStatus::Aborted);
        assert_eq!(good.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(bad.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(good.commits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn finished_transaction_rejects_enlistment_and_replays_outcome() {
        let tx = Transaction::new();
        tx.rollback().unwrap();
        let err = tx
            .enlist_volatile(Arc::new(Recorder::default()))
            .unwrap_err();
        assert_eq!(err.code(), codes::TRANSACTION_NOT_ACTIVE);

        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        tx.on_completed(move |status| *sink.lock() = Some(status));
        assert_eq!(*observed.lock(), Some(TransactionStatus::Aborted));
        assert!(tx.commit().is_err());
    }
}
