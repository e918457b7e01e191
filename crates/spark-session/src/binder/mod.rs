//! 客户端可靠通道绑定器。
//!
//! # 设计背景（Why）
//! - 上层协议（可靠会话、事务流）需要一个“逻辑上始终存在”的通道：底层连接断开后透明重建，
//!   并由单一的 [`MaskingMode`] 决定失败是抛给调用方还是吞掉并返回默认值；
//! - 四种内部通道形态共享同一套请求/发送/接收外观，差异收敛在 [`shape`] 的静态行为表中。
//!
//! # 核心流程（How）
//! 1. `validate_output_operation` 检查绑定器状态，终止态按屏蔽策略返回“静默丢弃”或错误；
//! 2. 经 [`ChannelSynchronizer`] 在剩余预算内取得内部通道的独占租约，获取超时按屏蔽策略处置；
//! 3. 调用形态行为表中的 `send`/`request`；
//! 4. 记录通道是否在使用中被中止，随后归还租约（析构即归还）；
//! 5. 非致命错误交给 [`ClientReliableChannelBinder::handle_exception`] 决定重抛或吞掉，致命错误始终传播。
//!
//! # 风险提示（Trade-offs）
//! - 双向形态的应答由后台接收泵按 `relates_to` 投递；泵只持有绑定器的弱引用，
//!   未关闭就丢弃绑定器时泵会在下一条消息或通道变化时退出。

mod input_queue;
mod masking;
mod shape;
mod synchronizer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use spark_core::{CoreError, ErrorCategory, Message, Result, TimeoutBudget, codes};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use input_queue::{Dequeued, InputQueue};
pub use masking::{BinderSettings, MaskingMode, TolerateFaultsMode};
pub use synchronizer::{Acquire, ChannelLease, ChannelSynchronizer};

use self::shape::{ShapeContext, ShapeOps};
use self::synchronizer::SynchronizerHost;
use crate::channel::{
    ChannelFactory, ChannelShape, CommunicationState, EndpointAddress, ShapedChannel,
};
use crate::error::BinderError;

type FaultedHandler = Arc<dyn Fn(Option<&CoreError>) + Send + Sync>;
type ExceptionHandler = Arc<dyn Fn(&CoreError) + Send + Sync>;
type ConnectionLostHandler = Arc<dyn Fn() + Send + Sync>;

/// `try_receive` 的结果。
#[derive(Debug)]
pub enum ReceiveOutcome {
    Message(Message),
    /// 绑定器已关闭且入站消息已取空。
    Closed,
    TimedOut,
}

#[derive(Default)]
struct BinderEvents {
    faulted: Mutex<Vec<FaultedHandler>>,
    exception: Mutex<Vec<ExceptionHandler>>,
    connection_lost: Mutex<Vec<ConnectionLostHandler>>,
}

struct Lifecycle {
    state: CommunicationState,
    aborted: bool,
}

struct PumpHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum Output {
    Send(Message),
    Request(Message),
}

struct BinderShared {
    ops: &'static ShapeOps,
    settings: BinderSettings,
    address: EndpointAddress,
    synchronizer: Arc<ChannelSynchronizer>,
    context: ShapeContext,
    lifecycle: Mutex<Lifecycle>,
    events: BinderEvents,
    faulted_raised: AtomicBool,
    pump: Mutex<Option<PumpHandle>>,
}

/// 客户端可靠通道绑定器。
///
/// # 契约（What）
/// - 通过 [`create`](Self::create) 构造，形态由通道工厂的 [`ChannelFactory::shape`] 一次性决定；
/// - 任一时刻最多一个调用方持有内部通道做输出；
/// - [`can_get_channel_for_receive`](Self::can_get_channel_for_receive) 恒为 `false`：
///   客户端不能为接收而主动建连，入站消息只来自已建立的通道；
/// - `Faulted` 事件至多触发一次。
#[derive(Clone)]
pub struct ClientReliableChannelBinder {
    shared: Arc<BinderShared>,
}

impl ClientReliableChannelBinder {
    /// 按工厂形态选定行为表并构造绑定器。
    ///
    /// 默认屏蔽模式只能是 `None` 或 `All`。
    pub fn create(
        factory: Arc<dyn ChannelFactory>,
        address: EndpointAddress,
        settings: BinderSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let ops = shape::ops_for(factory.shape());
        let shared = Arc::new_cyclic(|weak: &Weak<BinderShared>| {
            let host: Weak<dyn SynchronizerHost> = weak.clone();
            BinderShared {
                ops,
                synchronizer: Arc::new(ChannelSynchronizer::new(
                    factory,
                    address.clone(),
                    settings.clone(),
                    host,
                )),
                settings,
                address,
                context: ShapeContext::new(),
                lifecycle: Mutex::new(Lifecycle {
                    state: CommunicationState::Created,
                    aborted: false,
                }),
                events: BinderEvents::default(),
                faulted_raised: AtomicBool::new(false),
                pump: Mutex::new(None),
            }
        });
        Ok(Self { shared })
    }

    pub fn state(&self) -> CommunicationState {
        self.shared.lifecycle.lock().state
    }

    pub fn shape(&self) -> ChannelShape {
        self.shared.ops.shape
    }

    pub fn has_session(&self) -> bool {
        self.shared.ops.has_session()
    }

    /// 当前内部通道的会话标识。
    pub fn session_id(&self) -> Option<String> {
        self.shared
            .synchronizer
            .current_channel()
            .and_then(|channel| channel.session_id().map(str::to_owned))
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.shared.address
    }

    pub fn settings(&self) -> &BinderSettings {
        &self.shared.settings
    }

    pub fn default_masking_mode(&self) -> MaskingMode {
        self.shared.settings.default_masking_mode
    }

    pub fn can_get_channel_for_receive(&self) -> bool {
        false
    }

    pub fn tolerate_faults(&self) -> bool {
        self.shared.synchronizer.tolerate_faults()
    }

    /// 注册故障事件；事件参数为触发故障的错误（若有）。
    pub fn on_faulted<F>(&self, handler: F)
    where
        F: Fn(Option<&CoreError>) + Send + Sync + 'static,
    {
        self.shared.events.faulted.lock().push(Arc::new(handler));
    }

    /// 注册“被屏蔽的不可处理错误”事件。
    pub fn on_exception<F>(&self, handler: F)
    where
        F: Fn(&CoreError) + Send + Sync + 'static,
    {
        self.shared.events.exception.lock().push(Arc::new(handler));
    }

    /// 注册“容错模式下内部通道丢失”事件。
    pub fn on_connection_lost<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.events.connection_lost.lock().push(Arc::new(handler));
    }

    /// 打开绑定器。
    ///
    /// # 执行逻辑（How）
    /// 1. 仅允许从 `Created` 进入 `Opening`；
    /// 2. 启动同步器；不容错模式下在预算内立即建立首条通道，失败即令绑定器故障；
    /// 3. 双向形态启动后台接收泵；
    /// 4. 期间被中止时返回中止错误。
    pub async fn open(&self, budget: TimeoutBudget) -> Result<()> {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.state != CommunicationState::Created {
                return Err(CoreError::invalid_state(format!(
                    "binder cannot be opened from state {:?}",
                    lifecycle.state
                )));
            }
            lifecycle.state = CommunicationState::Opening;
        }
        self.shared.synchronizer.start_synchronizing();

        if self.shared.settings.tolerate_faults == TolerateFaultsMode::Never {
            if let Err(error) = self.shared.synchronizer.ensure_channel(budget).await {
                tracing::warn!(address = %self.shared.address, %error, "first inner channel failed to open");
                self.shared.fault(None);
                return Err(error);
            }
        }
        if self.shared.ops.pumps_input {
            self.shared.start_pump();
        }

        let mut lifecycle = self.shared.lifecycle.lock();
        match lifecycle.state {
            CommunicationState::Opening => {
                lifecycle.state = CommunicationState::Opened;
                tracing::debug!(address = %self.shared.address, shape = ?self.shape(), "binder opened");
                Ok(())
            }
            CommunicationState::Faulted => Err(BinderError::Faulted.into()),
            _ => Err(BinderError::Aborted.into()),
        }
    }

    /// 关闭绑定器。
    ///
    /// # 执行逻辑（How）
    /// 1. 等待当前租约归还；
    /// 2. 同步器进入 `Closed` 并交出内部通道，停止接收泵；
    /// 3. 按形态关闭通道（会话双向通道执行关闭输出 + 读到 EOF 的握手）；
    /// 4. 任一步失败即中止绑定器，错误按屏蔽策略处置。
    pub async fn close(&self, budget: TimeoutBudget, masking: MaskingMode) -> Result<()> {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            match lifecycle.state {
                CommunicationState::Created => {
                    drop(lifecycle);
                    self.abort();
                    return Ok(());
                }
                CommunicationState::Opening | CommunicationState::Opened => {
                    lifecycle.state = CommunicationState::Closing;
                }
                CommunicationState::Closing | CommunicationState::Closed => return Ok(()),
                CommunicationState::Faulted => {
                    drop(lifecycle);
                    self.abort();
                    return if masking.masks_handled() {
                        Ok(())
                    } else {
                        Err(BinderError::Faulted.into())
                    };
                }
            }
        }

        match self.shared.close_channel(budget).await {
            Ok(()) => {
                self.shared.lifecycle.lock().state = CommunicationState::Closed;
                self.shared.context.queue.close();
                self.shared.context.abandon_pending();
                tracing::debug!(address = %self.shared.address, "binder closed");
                Ok(())
            }
            Err(error) => {
                self.abort();
                if error.is_fatal() || !self.handle_exception(&error, masking, false) {
                    return Err(error);
                }
                Ok(())
            }
        }
    }

    /// 使用默认关闭预算与默认屏蔽模式关闭。
    pub async fn close_with_defaults(&self) -> Result<()> {
        self.close(
            TimeoutBudget::new(self.shared.settings.default_close_timeout),
            self.default_masking_mode(),
        )
        .await
    }

    /// 立即中止：丢弃内部通道，挂起的获取与接收随即结束。
    pub fn abort(&self) {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.state == CommunicationState::Closed {
                return;
            }
            lifecycle.state = CommunicationState::Closed;
            lifecycle.aborted = true;
        }
        if let Some(channel) = self.shared.synchronizer.close() {
            channel.abort();
        }
        self.shared.signal_pump();
        self.shared.context.queue.close();
        self.shared.context.abandon_pending();
        tracing::debug!(address = %self.shared.address, "binder aborted");
    }

    /// 令绑定器进入故障态；重复调用无副作用。
    pub fn fault(&self, error: Option<CoreError>) {
        self.shared.fault(error);
    }

    /// 校验输出操作的前置状态。
    ///
    /// # 契约（What）
    /// - `Opened` 返回 `Ok(true)`；
    /// - `Created`/`Opening` 返回状态错误，与屏蔽策略无关；
    /// - 终止态在屏蔽可处理错误时返回 `Ok(false)`（调用方静默丢弃），否则返回关闭/中止/故障错误。
    pub fn validate_output_operation(&self, masking: MaskingMode) -> Result<bool> {
        let lifecycle = self.shared.lifecycle.lock();
        match lifecycle.state {
            CommunicationState::Opened => Ok(true),
            state @ (CommunicationState::Created | CommunicationState::Opening) => {
                Err(BinderError::NotOpened { state }.into())
            }
            _ => match terminal_error(&lifecycle, masking) {
                Some(error) => Err(error.into()),
                None => Ok(false),
            },
        }
    }

    /// 发送单向消息。
    pub async fn send(&self, message: Message, budget: TimeoutBudget, masking: MaskingMode) -> Result<()> {
        self.output(Output::Send(message), budget, masking).await.map(|_| ())
    }

    /// 使用默认发送预算与默认屏蔽模式发送。
    pub async fn send_with_defaults(&self, message: Message) -> Result<()> {
        self.send(
            message,
            TimeoutBudget::new(self.shared.settings.default_send_timeout),
            self.default_masking_mode(),
        )
        .await
    }

    /// 发送请求并等待应答；失败被屏蔽时返回 `Ok(None)`。
    pub async fn request(
        &self,
        message: Message,
        budget: TimeoutBudget,
        masking: MaskingMode,
    ) -> Result<Option<Message>> {
        self.output(Output::Request(message), budget, masking).await
    }

    async fn output(&self, output: Output, budget: TimeoutBudget, masking: MaskingMode) -> Result<Option<Message>> {
        if !self.validate_output_operation(masking)? {
            return Ok(None);
        }
        let mut auto_aborted = false;
        let result = self.output_on_channel(output, budget, masking, &mut auto_aborted).await;
        match result {
            Ok(reply) => Ok(reply),
            Err(error) if error.is_fatal() => Err(error),
            Err(error) => {
                if self.handle_exception(&error, masking, auto_aborted) {
                    Ok(None)
                } else {
                    Err(error)
                }
            }
        }
    }

    async fn output_on_channel(
        &self,
        output: Output,
        budget: TimeoutBudget,
        masking: MaskingMode,
        auto_aborted: &mut bool,
    ) -> Result<Option<Message>> {
        let shared = &self.shared;
        let lease = match shared.synchronizer.try_get_channel_for_output(budget).await? {
            Acquire::Acquired(lease) => lease,
            Acquire::TimedOut => {
                let timeout = budget.original();
                return Err(match output {
                    Output::Send(_) => BinderError::SendTimedOut { timeout },
                    Output::Request(_) => BinderError::RequestTimedOut { timeout },
                }
                .into());
            }
            Acquire::Unavailable => {
                let lifecycle = shared.lifecycle.lock();
                return match terminal_error(&lifecycle, masking) {
                    Some(error) => Err(error.into()),
                    None => Ok(None),
                };
            }
        };
        let result = match output {
            Output::Send(message) => (shared.ops.send)(&shared.context, lease.channel(), message, budget)
                .await
                .map(|()| None),
            Output::Request(message) => {
                (shared.ops.request)(&shared.context, lease.channel(), message, budget).await
            }
        };
        *auto_aborted = lease.aborting();
        drop(lease);
        result
    }

    /// 从入站队列取下一条消息。
    ///
    /// 仅接受 `MaskingMode::None`：接收方向的失败必须让调用方看到。
    pub async fn try_receive(&self, budget: TimeoutBudget, masking: MaskingMode) -> Result<ReceiveOutcome> {
        if masking != MaskingMode::None {
            return Err(BinderError::TryReceiveRequiresNoMasking.into());
        }
        let state = self.state();
        if matches!(state, CommunicationState::Created | CommunicationState::Opening) {
            return Err(BinderError::NotOpened { state }.into());
        }
        Ok(match self.shared.context.queue.dequeue(budget).await? {
            Dequeued::Item(message) => ReceiveOutcome::Message(message),
            Dequeued::Closed => ReceiveOutcome::Closed,
            Dequeued::TimedOut => ReceiveOutcome::TimedOut,
        })
    }

    /// 决定一次非致命失败是否被吞掉。
    ///
    /// # 判定顺序（How）
    /// 1. 致命错误永不吞掉；
    /// 2. 容错模式下，使用中被自动中止的通道报告的中止错误、以及通道故障错误直接吞掉；
    /// 3. 可处理错误（非协议违例的通信错误或超时）按 `masks_handled` 决定；
    /// 4. 其余按 `masks_unhandled` 决定，吞掉时触发 `on_exception` 事件以免错误无声消失。
    pub fn handle_exception(&self, error: &CoreError, masking: MaskingMode, auto_aborted: bool) -> bool {
        if error.is_fatal() {
            return false;
        }
        let tolerate = self.tolerate_faults();
        if tolerate && auto_aborted && error.category() == &ErrorCategory::Aborted {
            return true;
        }
        if tolerate && error.category() == &ErrorCategory::Faulted {
            return true;
        }
        if Self::is_handleable(error) {
            let masked = masking.masks_handled();
            if masked {
                tracing::debug!(%error, ?masking, "handleable binder error masked");
            }
            return masked;
        }
        let masked = masking.masks_unhandled();
        if masked {
            tracing::warn!(%error, ?masking, "unhandled binder error masked");
            self.shared.raise_exception(error);
        }
        masked
    }

    /// 协议违例以外的通信错误与超时视为可处理。
    pub fn is_handleable(error: &CoreError) -> bool {
        !error.is_protocol_violation() && (error.is_communication() || error.is_timeout())
    }

    /// 安装一条已打开的外部通道。
    pub fn set_channel(&self, channel: ShapedChannel) -> Result<bool> {
        self.shared.synchronizer.set_channel(channel)
    }

    pub async fn ensure_channel(&self, budget: TimeoutBudget) -> Result<bool> {
        self.shared.synchronizer.ensure_channel(budget).await
    }

    pub fn abort_current_channel(&self) -> Result<()> {
        self.shared.synchronizer.abort_current_channel()
    }

    pub async fn wait_for_pending_operations(&self, budget: TimeoutBudget) -> Result<()> {
        self.shared.synchronizer.wait_for_pending_operations(budget).await
    }
}

fn terminal_error(lifecycle: &Lifecycle, masking: MaskingMode) -> Option<BinderError> {
    if masking.masks_handled() {
        return None;
    }
    Some(match lifecycle.state {
        CommunicationState::Faulted => BinderError::Faulted,
        _ if lifecycle.aborted => BinderError::Aborted,
        _ => BinderError::Closed,
    })
}

impl BinderShared {
    fn fault(&self, error: Option<CoreError>) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if matches!(
                lifecycle.state,
                CommunicationState::Faulted | CommunicationState::Closed
            ) {
                return;
            }
            lifecycle.state = CommunicationState::Faulted;
        }
        match &error {
            Some(error) => tracing::warn!(address = %self.address, %error, "binder faulted"),
            None => tracing::warn!(address = %self.address, "binder faulted"),
        }
        if let Some(channel) = self.synchronizer.fault() {
            channel.abort();
        }
        self.signal_pump();
        self.context.abandon_pending();
        self.context.queue.fail(BinderError::Faulted.into());
        if !self.faulted_raised.swap(true, Ordering::SeqCst) {
            let handlers = self.events.faulted.lock().clone();
            for handler in handlers {
                handler(error.as_ref());
            }
        }
    }

    fn raise_exception(&self, error: &CoreError) {
        let handlers = self.events.exception.lock().clone();
        for handler in handlers {
            handler(error);
        }
    }

    async fn close_channel(&self, budget: TimeoutBudget) -> Result<()> {
        self.synchronizer.wait_for_pending_operations(budget).await?;
        let channel = self.synchronizer.close();
        self.join_pump(budget).await?;
        if let Some(channel) = channel {
            if let Err(error) = (self.ops.close)(&channel, budget).await {
                channel.abort();
                return Err(error);
            }
        }
        Ok(())
    }

    fn start_pump(self: &Arc<Self>) {
        let mut slot = self.pump.lock();
        if slot.is_some() {
            return;
        }
        let (shutdown, stopped) = watch::channel(false);
        let installed = self.synchronizer.subscribe();
        let task = tokio::spawn(run_pump(Arc::downgrade(self), installed, stopped));
        *slot = Some(PumpHandle { shutdown, task });
    }

    fn signal_pump(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.shutdown.send_replace(true);
        }
    }

    async fn join_pump(&self, budget: TimeoutBudget) -> Result<()> {
        let Some(pump) = self.pump.lock().take() else {
            return Ok(());
        };
        pump.shutdown.send_replace(true);
        budget
            .run("binder receive pump shutdown", async {
                pump.task.await.map_err(|error| {
                    CoreError::new(codes::COMMUNICATION, "binder receive pump terminated abnormally")
                        .with_cause(error)
                })
            })
            .await
    }

    fn dispatch(&self, message: Message) {
        if let Some(message) = self.context.complete_reply(message) {
            if self.context.queue.enqueue(message).is_err() {
                tracing::debug!(address = %self.address, "input queue closed; inbound message dropped");
            }
        }
    }

    /// 接收方向失败：不可处理的错误先经事件上报，再让同步器回收通道。
    fn on_receive_failed(&self, channel: &ShapedChannel, error: CoreError) {
        if error.is_fatal() {
            self.fault(Some(error));
            return;
        }
        if !ClientReliableChannelBinder::is_handleable(&error) {
            self.raise_exception(&error);
        }
        tracing::debug!(address = %self.address, %error, "inner channel receive failed");
        self.context.abandon_pending();
        self.synchronizer.on_channel_faulted(channel);
    }
}

impl SynchronizerHost for BinderShared {
    fn fault_binder(&self) {
        self.fault(None);
    }

    fn on_connection_lost(&self) {
        if !self.synchronizer.tolerate_faults() {
            return;
        }
        tracing::debug!(address = %self.address, "inner channel lost");
        let handlers = self.events.connection_lost.lock().clone();
        for handler in handlers {
            handler();
        }
    }
}

/// 后台接收泵：把当前通道的入站消息分派给挂起请求或入站队列。
async fn run_pump(
    shared: Weak<BinderShared>,
    mut installed: watch::Receiver<Option<ShapedChannel>>,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        let current = installed.borrow_and_update().clone();
        let Some(channel) = current else {
            tokio::select! {
                changed = installed.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = stopped.wait_for(|stopped| *stopped) => return,
            }
            continue;
        };
        let Some(duplex) = channel.as_duplex() else {
            return;
        };
        let received = tokio::select! {
            received = duplex.try_receive(TimeoutBudget::infinite()) => received,
            _ = stopped.wait_for(|stopped| *stopped) => return,
        };
        let Some(binder) = shared.upgrade() else {
            return;
        };
        match received {
            Ok(Some(message)) => {
                binder.dispatch(message);
                continue;
            }
            Ok(None) => {
                binder.context.abandon_pending();
                binder.synchronizer.on_read_eof(&channel);
            }
            Err(error) => binder.on_receive_failed(&channel, error),
        }
        drop(binder);
        if !wait_for_replacement(&mut installed, &mut stopped, &channel).await {
            return;
        }
    }
}

async fn wait_for_replacement(
    installed: &mut watch::Receiver<Option<ShapedChannel>>,
    stopped: &mut watch::Receiver<bool>,
    retired: &ShapedChannel,
) -> bool {
    loop {
        let still_current = matches!(&*installed.borrow_and_update(), Some(current) if current.ptr_eq(retired));
        if !still_current {
            return true;
        }
        tokio::select! {
            changed = installed.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = stopped.wait_for(|stopped| *stopped) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBehavior, FakeFactory, FakeFailure};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn budget() -> TimeoutBudget {
        TimeoutBudget::new(Duration::from_secs(5))
    }

    fn binder(shape: ChannelShape, settings: BinderSettings) -> (ClientReliableChannelBinder, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::new(shape, FakeBehavior::default()));
        let binder = ClientReliableChannelBinder::create(
            factory.clone(),
            EndpointAddress::new("net.tcp://host/svc"),
            settings,
        )
        .unwrap();
        (binder, factory)
    }

    #[test]
    fn handled_masking_is_rejected_as_default() {
        let factory = Arc::new(FakeFactory::new(ChannelShape::Request, FakeBehavior::default()));
        let result = ClientReliableChannelBinder::create(
            factory,
            EndpointAddress::new("net.tcp://host/svc"),
            BinderSettings::default().with_default_masking_mode(MaskingMode::Handled),
        );
        assert_eq!(
            result.err().map(|error| error.code()),
            Some(codes::BINDER_INVALID_ARGUMENT)
        );
    }

    #[tokio::test]
    async fn output_before_open_is_invalid_state() {
        let (binder, _factory) = binder(ChannelShape::Request, BinderSettings::default());
        let err = binder
            .request(Message::new("x"), budget(), MaskingMode::All)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::BINDER_INVALID_STATE);
        assert!(!binder.can_get_channel_for_receive());
    }

    #[tokio::test]
    async fn handleable_errors_follow_masking() {
        let (binder, _factory) = binder(ChannelShape::Request, BinderSettings::default());
        let comm = CoreError::new(codes::COMMUNICATION, "reset");
        assert!(!binder.handle_exception(&comm, MaskingMode::None, false));
        assert!(binder.handle_exception(&comm, MaskingMode::Handled, false));
        assert!(!binder.handle_exception(&comm, MaskingMode::Unhandled, false));

        let fatal = CoreError::fatal("oom");
        assert!(!binder.handle_exception(&fatal, MaskingMode::All, false));
    }

    #[tokio::test]
    async fn masked_unhandled_errors_raise_on_exception() {
        let (binder, _factory) = binder(ChannelShape::Request, BinderSettings::default());
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            binder.on_exception(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }
        let protocol = CoreError::protocol(codes::FRAMING_MALFORMED, "Malformed", "bad frame");
        assert!(!ClientReliableChannelBinder::is_handleable(&protocol));
        assert!(!binder.handle_exception(&protocol, MaskingMode::Handled, false));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(binder.handle_exception(&protocol, MaskingMode::Unhandled, false));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tolerated_auto_abort_is_swallowed() {
        let (binder, _factory) = binder(ChannelShape::Request, BinderSettings::default());
        let aborted = CoreError::aborted("channel aborted");
        assert!(binder.tolerate_faults());
        assert!(binder.handle_exception(&aborted, MaskingMode::None, true));
        assert!(!binder.handle_exception(&aborted, MaskingMode::None, false));
        assert!(binder.handle_exception(&CoreError::faulted("inner"), MaskingMode::None, false));
    }

    #[tokio::test]
    async fn request_shape_round_trip_and_synthesized_receive() {
        let (binder, factory) = binder(ChannelShape::RequestSession, BinderSettings::default());
        binder.open(budget()).await.unwrap();
        assert!(binder.has_session());

        let reply = binder
            .request(Message::new("ping"), budget(), MaskingMode::None)
            .await
            .unwrap()
            .expect("reply");
        assert_eq!(reply.body().as_ref(), b"PING");
        assert!(binder.session_id().is_some());

        binder
            .send(Message::new("note"), budget(), MaskingMode::None)
            .await
            .unwrap();
        match binder.try_receive(budget(), MaskingMode::None).await.unwrap() {
            ReceiveOutcome::Message(message) => assert_eq!(message.body().as_ref(), b"NOTE"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            binder.try_receive(budget(), MaskingMode::All).await.unwrap_err().code(),
            codes::BINDER_INVALID_ARGUMENT
        );

        binder.close(budget(), MaskingMode::None).await.unwrap();
        assert_eq!(binder.state(), CommunicationState::Closed);
        assert_eq!(factory.stats().closed(), 1);
        assert!(matches!(
            binder.try_receive(budget(), MaskingMode::None).await.unwrap(),
            ReceiveOutcome::Closed
        ));
    }

    #[tokio::test]
    async fn terminal_binder_drops_output_when_masked() {
        let (binder, _factory) = binder(ChannelShape::Request, BinderSettings::default());
        binder.open(budget()).await.unwrap();
        binder.abort();
        assert!(!binder.validate_output_operation(MaskingMode::All).unwrap());
        let err = binder
            .send(Message::new("late"), budget(), MaskingMode::None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::BINDER_ABORTED);
        assert!(binder
            .request(Message::new("late"), budget(), MaskingMode::Handled)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn faulted_event_fires_once() {
        let (binder, _factory) = binder(ChannelShape::Duplex, BinderSettings::default());
        binder.open(budget()).await.unwrap();
        let raised = Arc::new(AtomicUsize::new(0));
        {
            let raised = raised.clone();
            binder.on_faulted(move |_| {
                raised.fetch_add(1, Ordering::SeqCst);
            });
        }
        binder.fault(Some(CoreError::new(codes::COMMUNICATION, "lost")));
        binder.fault(None);
        assert_eq!(raised.load(Ordering::SeqCst), 1);
        assert_eq!(binder.state(), CommunicationState::Faulted);
        assert_eq!(
            binder.close(budget(), MaskingMode::None).await.unwrap_err().code(),
            codes::BINDER_FAULTED
        );
        assert_eq!(binder.state(), CommunicationState::Closed);
    }

    #[tokio::test]
    async fn unhandled_failure_is_rethrown_without_masking() {
        let (binder, factory) = binder(ChannelShape::Request, BinderSettings::default());
        binder.open(budget()).await.unwrap();
        factory.stats().push_failure(FakeFailure::InvalidArgument);
        let err = binder
            .request(Message::new("x"), budget(), MaskingMode::Handled)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_ARGUMENT);

        factory.stats().push_failure(FakeFailure::Fatal);
        let err = binder
            .request(Message::new("x"), budget(), MaskingMode::All)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
