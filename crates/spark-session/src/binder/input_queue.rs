//! 带异步通知的入站消息队列。
//!
//! # 设计背景（Why）
//! - 请求形态的通道没有独立的接收方向，绑定器把请求的应答合成为入站消息放入队列；
//! - 双向形态由后台接收泵把未关联的消息放入同一队列，`try_receive` 因而对四种形态一致。
//!
//! # 契约（What）
//! - 先进先出；`close` 之后不再接受新元素，但已入队的元素仍可取出，取空后返回 [`Dequeued::Closed`]；
//! - `fail` 记录一个失败，之后的每次 `dequeue` 在取空后都以该失败的副本返回错误；
//! - 等待者在入队、关闭、失败时全部被唤醒，各自重新检查状态。

use std::collections::VecDeque;
use std::pin::pin;

use parking_lot::Mutex;
use spark_core::{CoreError, Result, TimeoutBudget};
use tokio::sync::Notify;

/// 一次出队的结果。
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued<T> {
    Item(T),
    /// 队列已关闭且已取空。
    Closed,
    TimedOut,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    failure: Option<CoreError>,
}

pub struct InputQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> InputQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                failure: None,
            }),
            notify: Notify::new(),
        }
    }

    /// 入队；队列已关闭时把元素原样退回。
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// 在预算内等待下一个元素。
    pub async fn dequeue(&self, budget: TimeoutBudget) -> Result<Dequeued<T>> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Ok(Dequeued::Item(item));
                }
                if let Some(failure) = &state.failure {
                    return Err(replicate(failure));
                }
                if state.closed {
                    return Ok(Dequeued::Closed);
                }
            }
            let waited = budget
                .run("input queue dequeue", async {
                    notified.await;
                    Ok(())
                })
                .await;
            if waited.is_err() {
                return Ok(Dequeued::TimedOut);
            }
        }
    }

    /// 关闭队列；重复调用无副作用。
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// 以失败关闭队列；只保留第一次失败。
    pub fn fail(&self, error: CoreError) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.failure.get_or_insert(error);
        }
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl<T> Default for InputQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn replicate(error: &CoreError) -> CoreError {
    CoreError::new(error.code(), error.message().to_owned()).with_category(error.category().clone())
}
