//! 连接接入循环与接入节流。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 同时处于“已接入但前导未读完”状态的连接数必须有上限，否则慢速对端可以耗尽内存；
//! - 节流额度随连接一起交给下游，由下游在前导读取结束时归还。
//!
//! ## 契约（What）
//! - 每条连接附带一个 [`ConnectionDequeued`]，其回调在 `fire` 或 `Drop` 时恰好执行一次；
//! - `max_pending_accepts` 个额度全部在外时，接入循环暂停在信号量上而不是继续 `accept`；
//! - [`ConnectionAcceptor::dispose`] 幂等，停止循环并释放监听器。

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::connection::BoxConnection;
use crate::listener::ConnectionListener;

/// 连接离开接入队列时的一次性回调。
pub struct ConnectionDequeued {
    permit: Option<OwnedSemaphorePermit>,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

impl ConnectionDequeued {
    /// 归还一个接入节流额度。
    pub fn from_permit(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Some(permit),
            callback: None,
        }
    }

    /// 执行任意一次性回调。
    pub fn from_fn<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            permit: None,
            callback: Some(Box::new(callback)),
        }
    }

    pub fn noop() -> Self {
        Self {
            permit: None,
            callback: None,
        }
    }

    /// 立即触发；之后的 `Drop` 不再重复执行。
    pub fn fire(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.permit.take();
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

impl Drop for ConnectionDequeued {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ConnectionDequeued {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDequeued")
            .field("pending", &(self.permit.is_some() || self.callback.is_some()))
            .finish()
    }
}

/// 接入循环。
pub struct ConnectionAcceptor {
    listener: Arc<dyn ConnectionListener>,
    throttle: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionAcceptor {
    pub fn new(listener: Arc<dyn ConnectionListener>, max_pending_accepts: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            listener,
            throttle: Arc::new(Semaphore::new(max_pending_accepts.max(1))),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// 当前可用的接入额度。
    pub fn available_accepts(&self) -> usize {
        self.throttle.available_permits()
    }

    /// 启动接入循环；重复调用被忽略。
    ///
    /// # 执行逻辑（How）
    /// 1. 先取得节流额度，再调用 `accept`；两步都与关闭信号竞争；
    /// 2. 成功接入后把连接与额度一并交给 `on_available`；
    /// 3. `Disposed` 或致命错误终止循环，其余失败记录后继续。
    /// 4. 接入任务及其派生的读取任务沿用调用方所在的 span。
    pub fn start<F>(&self, on_available: F)
    where
        F: Fn(BoxConnection, ConnectionDequeued) + Send + Sync + 'static,
    {
        let mut slot = self.task.lock();
        if slot.is_some() || *self.shutdown.borrow() {
            return;
        }
        let listener = Arc::clone(&self.listener);
        let throttle = Arc::clone(&self.throttle);
        let mut shutdown = self.shutdown.subscribe();
        *slot = Some(tokio::spawn(async move {
            let label = listener.local_label();
            loop {
                let permit = tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|stopped| *stopped) => break,
                    permit = Arc::clone(&throttle).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let accepted = tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|stopped| *stopped) => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok(connection) => {
                        tracing::trace!(listener = %label, connection = connection.id(), "connection accepted");
                        on_available(connection, ConnectionDequeued::from_permit(permit));
                    }
                    Err(error)
                        if error.is_fatal()
                            || matches!(error.category(), spark_core::ErrorCategory::Disposed) =>
                    {
                        tracing::debug!(listener = %label, %error, "accept loop stopped");
                        break;
                    }
                    Err(error) => {
                        tracing::debug!(listener = %label, %error, "accept failed");
                    }
                }
            }
        }
        .in_current_span()));
    }

    /// 停止接入循环。
    pub fn dispose(&self) {
        self.shutdown.send_replace(true);
        self.throttle.close();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ConnectionAcceptor {
    fn drop(&mut self) {
        self.dispose();
    }
}
