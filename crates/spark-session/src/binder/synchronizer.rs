//! 当前内部通道的独占租约。
//!
//! # 设计背景（Why）
//! - 绑定器在任意时刻最多让一个调用方持有内部通道做输出，后来者在预算内排队；
//! - 通道出现 EOF、故障或被主动中止时不能在持有者手中被替换，只能在归还时回收，
//!   因此回收逻辑集中在 [`ChannelSynchronizer::return_channel`]。
//!
//! # 状态机（What）
//! ```text
//! Created --start--> NoChannel --acquire--> ChannelOpening --opened--> ChannelOpened
//!                        ^                                               |
//!                        +------ recycle (未租出时立即 / 租出时归还) <--- ChannelClosing
//! 任意状态 --close--> Closed；任意状态 --fault/abort--> Faulted
//! ```
//! - `Closed`/`Faulted` 为终态，之后的获取一律返回 [`Acquire::Unavailable`]；
//! - 不容错时，通道丢失后的再次获取会让绑定器进入故障态。
//!
//! # 风险提示（Trade-offs）
//! - 等待者通过 `Notify::notify_waiters` 全量唤醒后各自重新竞争，不保证 FIFO 公平；
//!   竞争者数量有限（同一绑定器上的并发调用），换取实现上没有等待队列的簿记。

use std::pin::pin;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use spark_core::{Result, TimeoutBudget};
use tokio::sync::{Notify, watch};

use super::masking::{BinderSettings, TolerateFaultsMode};
use crate::channel::{ChannelFactory, CommunicationState, EndpointAddress, ShapedChannel};
use crate::error::BinderError;

/// 同步器对所属绑定器的回调。
pub(crate) trait SynchronizerHost: Send + Sync {
    /// 不容错模式下丢失通道，绑定器必须进入故障态。
    fn fault_binder(&self);

    /// 一条故障通道已被回收。
    fn on_connection_lost(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    Created,
    NoChannel,
    ChannelOpening,
    ChannelOpened,
    ChannelClosing,
    Closed,
    Faulted,
}

/// 获取通道的结果。
pub enum Acquire {
    Acquired(ChannelLease),
    TimedOut,
    /// 同步器已关闭或故障。
    Unavailable,
}

#[derive(Clone, Copy, Debug)]
enum Retire {
    Eof,
    Faulted,
    Abort,
}

struct SyncInner {
    state: SyncState,
    channel: Option<ShapedChannel>,
    leased: bool,
    aborting: bool,
    inner_faulted: bool,
    tolerate_faults: bool,
}

pub struct ChannelSynchronizer {
    inner: Mutex<SyncInner>,
    notify: Notify,
    installed: watch::Sender<Option<ShapedChannel>>,
    factory: Arc<dyn ChannelFactory>,
    address: EndpointAddress,
    tolerate_mode: TolerateFaultsMode,
    settings: BinderSettings,
    host: Weak<dyn SynchronizerHost>,
}

impl ChannelSynchronizer {
    pub(crate) fn new(
        factory: Arc<dyn ChannelFactory>,
        address: EndpointAddress,
        settings: BinderSettings,
        host: Weak<dyn SynchronizerHost>,
    ) -> Self {
        let (installed, _) = watch::channel(None);
        Self {
            inner: Mutex::new(SyncInner {
                state: SyncState::Created,
                channel: None,
                leased: false,
                aborting: false,
                inner_faulted: false,
                // 首条通道建立前总是允许创建；安装通道后按模式重新计算。
                tolerate_faults: true,
            }),
            notify: Notify::new(),
            installed,
            factory,
            address,
            tolerate_mode: settings.tolerate_faults,
            settings,
            host,
        }
    }

    /// 进入同步阶段；已预先设置的通道直接视为已打开。
    pub(crate) fn start_synchronizing(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state != SyncState::Created {
                return;
            }
            let next = match inner.channel.clone() {
                Some(channel) => {
                    inner.tolerate_faults = self.tolerate_mode.tolerates(channel.inner().has_security_session());
                    self.installed.send_replace(Some(channel));
                    SyncState::ChannelOpened
                }
                None => SyncState::NoChannel,
            };
            inner.state = next;
        }
        self.notify.notify_waiters();
    }

    pub fn tolerate_faults(&self) -> bool {
        self.inner.lock().tolerate_faults
    }

    pub fn current_channel(&self) -> Option<ShapedChannel> {
        self.inner.lock().channel.clone()
    }

    /// 订阅“已安装通道”的变化，供后台接收泵使用。
    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<ShapedChannel>> {
        self.installed.subscribe()
    }

    /// 在预算内取得当前通道的独占租约。
    ///
    /// # 执行逻辑（How）
    /// 1. 预算已耗尽时直接返回 [`Acquire::TimedOut`]，不触碰任何通道；
    /// 2. `ChannelOpened` 且未租出：立即租出；
    /// 3. `NoChannel` 且未租出：容错时由本调用方经工厂创建并打开新通道，成功后直接持有；
    ///    不容错时令绑定器故障；
    /// 4. 其余情况等待状态变化，预算耗尽返回 [`Acquire::TimedOut`]。
    pub async fn try_get_channel_for_output(self: &Arc<Self>, budget: TimeoutBudget) -> Result<Acquire> {
        loop {
            if budget.is_expired() {
                return Ok(Acquire::TimedOut);
            }
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            let mut fault_binder = false;
            let create = {
                let mut inner = self.inner.lock();
                match inner.state {
                    SyncState::Closed | SyncState::Faulted => return Ok(Acquire::Unavailable),
                    SyncState::ChannelOpened if !inner.leased => {
                        if let Some(channel) = inner.channel.clone() {
                            inner.leased = true;
                            return Ok(Acquire::Acquired(self.lease(channel)));
                        }
                        false
                    }
                    SyncState::NoChannel if !inner.leased => {
                        if inner.tolerate_faults {
                            inner.state = SyncState::ChannelOpening;
                            inner.leased = true;
                            true
                        } else {
                            fault_binder = true;
                            false
                        }
                    }
                    _ => false,
                }
            };
            if fault_binder {
                if let Some(host) = self.host.upgrade() {
                    host.fault_binder();
                }
                return Ok(Acquire::Unavailable);
            }
            if create {
                return self.create_and_open(budget).await;
            }
            let waited = budget
                .run("binder channel acquire", async {
                    notified.await;
                    Ok(())
                })
                .await;
            if waited.is_err() {
                return Ok(Acquire::TimedOut);
            }
        }
    }

    async fn create_and_open(self: &Arc<Self>, budget: TimeoutBudget) -> Result<Acquire> {
        let opened = self.open_new_channel(budget).await;
        let mut inner = self.inner.lock();
        match opened {
            Ok(channel) if inner.state == SyncState::ChannelOpening => {
                inner.state = SyncState::ChannelOpened;
                inner.channel = Some(channel.clone());
                inner.tolerate_faults = self.tolerate_mode.tolerates(channel.inner().has_security_session());
                self.installed.send_replace(Some(channel.clone()));
                tracing::debug!(address = %self.address, shape = ?channel.shape(), "inner channel opened");
                drop(inner);
                Ok(Acquire::Acquired(self.lease(channel)))
            }
            Ok(channel) => {
                // 打开期间同步器已被关闭或中止。
                inner.leased = false;
                drop(inner);
                channel.abort();
                self.notify.notify_waiters();
                Ok(Acquire::Unavailable)
            }
            Err(error) => {
                if inner.state == SyncState::ChannelOpening {
                    inner.state = SyncState::NoChannel;
                }
                inner.leased = false;
                drop(inner);
                self.notify.notify_waiters();
                Err(error)
            }
        }
    }

    async fn open_new_channel(&self, budget: TimeoutBudget) -> Result<ShapedChannel> {
        let channel = self.factory.create_channel(&self.address)?;
        let expected = self.factory.shape();
        if channel.shape() != expected {
            channel.abort();
            return Err(BinderError::ShapeMismatch {
                expected,
                actual: channel.shape(),
            }
            .into());
        }
        if let Err(error) = channel.inner().open(budget).await {
            channel.abort();
            return Err(error);
        }
        Ok(channel)
    }

    fn lease(self: &Arc<Self>, channel: ShapedChannel) -> ChannelLease {
        ChannelLease {
            synchronizer: Arc::clone(self),
            channel,
        }
    }

    /// 归还租约；通道已失效时在此回收。
    fn return_channel(&self) {
        let mut fault_binder = false;
        let mut recycle = None;
        let mut raise = false;
        {
            let mut inner = self.inner.lock();
            inner.leased = false;
            if matches!(inner.state, SyncState::ChannelOpened | SyncState::ChannelClosing) {
                let channel_state = inner.channel.as_ref().map(ShapedChannel::state);
                match channel_state {
                    Some(CommunicationState::Faulted) => {
                        inner.inner_faulted = true;
                        fault_binder = !inner.tolerate_faults;
                        inner.state = SyncState::ChannelClosing;
                    }
                    Some(CommunicationState::Closing | CommunicationState::Closed) => {
                        inner.state = SyncState::ChannelClosing;
                    }
                    _ => {}
                }
                if !fault_binder && inner.state == SyncState::ChannelClosing {
                    (recycle, raise) = self.take_for_recycle(&mut inner);
                }
            }
        }
        self.notify.notify_waiters();
        self.after_retire(fault_binder, recycle, raise);
    }

    fn take_for_recycle(&self, inner: &mut SyncInner) -> (Option<ShapedChannel>, bool) {
        let channel = inner.channel.take();
        let raise = std::mem::take(&mut inner.inner_faulted);
        inner.aborting = false;
        inner.state = SyncState::NoChannel;
        self.installed.send_replace(None);
        (channel, raise)
    }

    fn after_retire(&self, fault_binder: bool, recycle: Option<ShapedChannel>, raise: bool) {
        let host = self.host.upgrade();
        if fault_binder {
            if let Some(host) = &host {
                host.fault_binder();
            }
        }
        if let Some(channel) = recycle {
            self.recycle(channel);
        }
        if raise {
            if let Some(host) = &host {
                host.on_connection_lost();
            }
        }
    }

    /// 已打开的通道在后台优雅关闭，其余直接中止。
    fn recycle(&self, channel: ShapedChannel) {
        if channel.state() != CommunicationState::Opened {
            channel.abort();
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            channel.abort();
            return;
        };
        let budget = TimeoutBudget::new(self.settings.default_close_timeout);
        let address = self.address.clone();
        handle.spawn(async move {
            if let Err(error) = channel.inner().close(budget).await {
                tracing::debug!(%address, %error, "recycled channel did not close cleanly");
                channel.abort();
            }
        });
    }

    fn retire(&self, channel: &ShapedChannel, cause: Retire) {
        let mut fault_binder = false;
        let mut recycle = None;
        let mut raise = false;
        {
            let mut inner = self.inner.lock();
            let current = match &inner.channel {
                Some(current) if current.ptr_eq(channel) => current,
                _ => return,
            };
            if !matches!(inner.state, SyncState::ChannelOpened | SyncState::ChannelClosing) {
                return;
            }
            tracing::debug!(address = %self.address, state = ?current.state(), ?cause, "retiring inner channel");
            match cause {
                Retire::Faulted => {
                    inner.inner_faulted = true;
                    fault_binder = !inner.tolerate_faults;
                }
                Retire::Abort => inner.aborting = true,
                Retire::Eof => {}
            }
            inner.state = SyncState::ChannelClosing;
            if !fault_binder && !inner.leased {
                (recycle, raise) = self.take_for_recycle(&mut inner);
            }
        }
        self.notify.notify_waiters();
        if matches!(cause, Retire::Faulted | Retire::Abort) {
            channel.abort();
        }
        self.after_retire(fault_binder, recycle, raise);
    }

    /// 接收方向读到 EOF：当前通道不再可用，归还后回收。
    pub(crate) fn on_read_eof(&self, channel: &ShapedChannel) {
        self.retire(channel, Retire::Eof);
    }

    /// 当前通道收发失败。
    pub(crate) fn on_channel_faulted(&self, channel: &ShapedChannel) {
        self.retire(channel, Retire::Faulted);
    }

    /// 中止当前通道，下一次获取会重新创建；仅容错时允许。
    pub fn abort_current_channel(&self) -> Result<()> {
        let channel = {
            let inner = self.inner.lock();
            if !inner.tolerate_faults {
                return Err(BinderError::FaultToleranceRequired.into());
            }
            inner.channel.clone()
        };
        if let Some(channel) = channel {
            self.retire(&channel, Retire::Abort);
        }
        Ok(())
    }

    /// 安装外部创建且已打开的通道；已有通道或已终止时返回 `false`，未采用的通道由调用方处置。
    pub fn set_channel(&self, channel: ShapedChannel) -> Result<bool> {
        let expected = self.factory.shape();
        if channel.shape() != expected {
            return Err(BinderError::ShapeMismatch {
                expected,
                actual: channel.shape(),
            }
            .into());
        }
        {
            let mut inner = self.inner.lock();
            if inner.channel.is_some() || inner.leased {
                return Ok(false);
            }
            match inner.state {
                SyncState::Created => {
                    inner.channel = Some(channel);
                }
                SyncState::NoChannel => {
                    inner.tolerate_faults = self.tolerate_mode.tolerates(channel.inner().has_security_session());
                    inner.channel = Some(channel.clone());
                    inner.state = SyncState::ChannelOpened;
                    self.installed.send_replace(Some(channel));
                }
                _ => return Ok(false),
            }
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    /// 确保存在已打开的通道；必要时在预算内创建。
    pub async fn ensure_channel(self: &Arc<Self>, budget: TimeoutBudget) -> Result<bool> {
        {
            let inner = self.inner.lock();
            match inner.state {
                SyncState::ChannelOpened => return Ok(true),
                SyncState::NoChannel => {}
                _ => return Ok(false),
            }
        }
        match self.try_get_channel_for_output(budget).await? {
            Acquire::Acquired(_lease) => Ok(true),
            Acquire::TimedOut | Acquire::Unavailable => Ok(false),
        }
    }

    /// 等待当前租约归还。
    pub async fn wait_for_pending_operations(&self, budget: TimeoutBudget) -> Result<()> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if !self.inner.lock().leased {
                return Ok(());
            }
            budget
                .run("binder pending operations", async {
                    notified.await;
                    Ok(())
                })
                .await?;
        }
    }

    /// 进入 `Closed`，交出当前通道由绑定器按形态关闭。
    pub(crate) fn close(&self) -> Option<ShapedChannel> {
        self.stop(SyncState::Closed)
    }

    /// 进入 `Faulted`，交出当前通道由调用方中止。
    pub(crate) fn fault(&self) -> Option<ShapedChannel> {
        self.stop(SyncState::Faulted)
    }

    fn stop(&self, terminal: SyncState) -> Option<ShapedChannel> {
        let channel = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SyncState::Closed | SyncState::Faulted) {
                return None;
            }
            inner.state = terminal;
            self.installed.send_replace(None);
            inner.channel.take()
        };
        self.notify.notify_waiters();
        channel
    }

}

/// 内部通道的独占租约；析构时归还。
pub struct ChannelLease {
    synchronizer: Arc<ChannelSynchronizer>,
    channel: ShapedChannel,
}

impl ChannelLease {
    pub fn channel(&self) -> &ShapedChannel {
        &self.channel
    }

    /// 持有期间通道是否被主动中止。
    pub fn aborting(&self) -> bool {
        self.synchronizer.inner.lock().aborting
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.synchronizer.return_channel();
    }
}
