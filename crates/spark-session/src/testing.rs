//! 内存中的假通道与工厂，供本 crate 及上层的测试驱动绑定器。
//!
//! - 请求形态：应答为请求体的大写形式，`relates_to` 指向请求的 `MessageId`；
//! - 双向形态：发送带 `MessageId` 的消息时，同样把大写应答放入接收方向；
//! - 会话双向形态的 `close_output_session` 模拟对端随之结束输出（接收方向读到 EOF）；
//! - [`FakeStats`] 记录创建数、并发中的操作数峰值与预置的失败序列。

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use spark_core::{CoreError, Message, Result, TimeoutBudget, codes};

use crate::binder::{Dequeued, InputQueue};
use crate::channel::{
    ChannelFactory, ChannelShape, CommunicationState, DuplexChannel, DuplexSessionChannel,
    EndpointAddress, InnerChannel, RequestChannel, RequestSessionChannel, ShapedChannel,
};

/// 预置给下一次收发操作的失败。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FakeFailure {
    Communication,
    Timeout,
    Protocol,
    Fatal,
    InvalidArgument,
    /// 通道进入 `Faulted` 并返回通信错误。
    FaultChannel,
}

impl FakeFailure {
    fn into_error(self) -> CoreError {
        match self {
            FakeFailure::Communication | FakeFailure::FaultChannel => {
                CoreError::new(codes::COMMUNICATION, "fake channel communication failure")
            }
            FakeFailure::Timeout => CoreError::timeout("fake channel operation timed out"),
            FakeFailure::Protocol => CoreError::protocol(
                codes::FRAMING_MALFORMED,
                "Malformed",
                "fake channel protocol violation",
            ),
            FakeFailure::Fatal => CoreError::fatal("fake channel fatal failure"),
            FakeFailure::InvalidArgument => CoreError::invalid_argument("fake channel rejected message"),
        }
    }
}

/// 假通道的行为开关。
#[derive(Clone, Debug, Default)]
pub struct FakeBehavior {
    /// 每次收发操作在通道内停留的时长。
    pub op_delay: Duration,
    pub security_session: bool,
    /// 双向形态不对带标识的消息作答。
    pub silent_duplex: bool,
    /// 前若干次 `open` 失败。
    pub failing_opens: usize,
}

/// 同一工厂下所有假通道共享的统计。
#[derive(Default)]
pub struct FakeStats {
    created: AtomicUsize,
    opens_failed: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    closed: AtomicUsize,
    aborted: AtomicUsize,
    sent: Mutex<Vec<Message>>,
    failures: Mutex<VecDeque<FakeFailure>>,
}

impl FakeStats {
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    /// 已送达假通道的消息（含请求）。
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub fn push_failure(&self, failure: FakeFailure) {
        self.failures.lock().push_back(failure);
    }
}

struct ActiveGuard<'a>(&'a FakeStats);

impl<'a> ActiveGuard<'a> {
    fn enter(stats: &'a FakeStats) -> Self {
        let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_active.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeChannel {
    shape: ChannelShape,
    state: Mutex<CommunicationState>,
    inbox: InputQueue<Message>,
    output_closed: AtomicBool,
    session_id: String,
    behavior: FakeBehavior,
    stats: Arc<FakeStats>,
}

impl FakeChannel {
    fn new(shape: ChannelShape, ordinal: usize, behavior: FakeBehavior, stats: Arc<FakeStats>) -> Self {
        Self {
            shape,
            state: Mutex::new(CommunicationState::Created),
            inbox: InputQueue::new(),
            output_closed: AtomicBool::new(false),
            session_id: format!("urn:spark:fake-session:{ordinal}"),
            behavior,
            stats,
        }
    }

    /// 让通道进入故障态，挂起的接收随之失败。
    pub fn force_fault(&self) {
        *self.state.lock() = CommunicationState::Faulted;
        self.inbox
            .fail(CoreError::new(codes::COMMUNICATION, "fake channel faulted"));
    }

    /// 模拟对端推送一条消息。
    pub fn deliver(&self, message: Message) {
        let _ = self.inbox.enqueue(message);
    }

    /// 模拟对端结束输出。
    pub fn end_input(&self) {
        self.inbox.close();
    }

    pub fn output_closed(&self) -> bool {
        self.output_closed.load(Ordering::SeqCst)
    }

    fn ensure_opened(&self, operation: &str) -> Result<()> {
        match *self.state.lock() {
            CommunicationState::Opened => Ok(()),
            CommunicationState::Faulted => Err(CoreError::faulted(format!("{operation} on a faulted fake channel"))),
            state => Err(CoreError::aborted(format!("{operation} on a fake channel in state {state:?}"))),
        }
    }

    async fn operate(&self, operation: &str, message: &Message) -> Result<()> {
        self.ensure_opened(operation)?;
        let _active = ActiveGuard::enter(&self.stats);
        if !self.behavior.op_delay.is_zero() {
            tokio::time::sleep(self.behavior.op_delay).await;
        }
        let failure = self.stats.failures.lock().pop_front();
        if let Some(failure) = failure {
            if failure == FakeFailure::FaultChannel {
                self.force_fault();
            }
            return Err(failure.into_error());
        }
        self.stats.sent.lock().push(message.clone());
        Ok(())
    }
}

fn reply_to(message: &Message) -> Message {
    let reply = Message::new(message.body().to_ascii_uppercase());
    match message.id() {
        Some(id) => reply.with_relates_to(id.clone()),
        None => reply,
    }
}

#[async_trait]
impl InnerChannel for FakeChannel {
    fn state(&self) -> CommunicationState {
        *self.state.lock()
    }

    async fn open(&self, _budget: TimeoutBudget) -> Result<()> {
        let failed = self
            .stats
            .opens_failed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |failed| {
                (failed < self.behavior.failing_opens).then_some(failed + 1)
            })
            .is_ok();
        let mut state = self.state.lock();
        if failed {
            *state = CommunicationState::Faulted;
            return Err(CoreError::new(codes::COMMUNICATION, "fake channel refused to open"));
        }
        if *state != CommunicationState::Created {
            return Err(CoreError::invalid_state("fake channel opened twice"));
        }
        *state = CommunicationState::Opened;
        Ok(())
    }

    async fn close(&self, _budget: TimeoutBudget) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != CommunicationState::Opened {
                return Err(CoreError::invalid_state("fake channel is not open"));
            }
            *state = CommunicationState::Closed;
        }
        self.inbox.close();
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self) {
        {
            let mut state = self.state.lock();
            if *state == CommunicationState::Closed {
                return;
            }
            *state = CommunicationState::Closed;
        }
        self.inbox.close();
        self.stats.aborted.fetch_add(1, Ordering::SeqCst);
    }

    fn has_security_session(&self) -> bool {
        self.behavior.security_session
    }
}

#[async_trait]
impl DuplexChannel for FakeChannel {
    async fn send(&self, message: Message, _budget: TimeoutBudget) -> Result<()> {
        self.operate("send", &message).await?;
        if !self.behavior.silent_duplex && message.id().is_some() {
            let _ = self.inbox.enqueue(reply_to(&message));
        }
        Ok(())
    }

    async fn try_receive(&self, budget: TimeoutBudget) -> Result<Option<Message>> {
        match self.inbox.dequeue(budget).await? {
            Dequeued::Item(message) => Ok(Some(message)),
            Dequeued::Closed => Ok(None),
            Dequeued::TimedOut => Err(budget.elapsed_error("fake receive")),
        }
    }
}

#[async_trait]
impl DuplexSessionChannel for FakeChannel {
    async fn close_output_session(&self, _budget: TimeoutBudget) -> Result<()> {
        self.ensure_opened("close output session")?;
        self.output_closed.store(true, Ordering::SeqCst);
        self.inbox.close();
        Ok(())
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl RequestChannel for FakeChannel {
    async fn request(&self, message: Message, _budget: TimeoutBudget) -> Result<Message> {
        self.operate("request", &message).await?;
        Ok(reply_to(&message))
    }
}

impl RequestSessionChannel for FakeChannel {
    fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// 按固定形态产出 [`FakeChannel`] 的工厂。
pub struct FakeFactory {
    shape: ChannelShape,
    behavior: FakeBehavior,
    stats: Arc<FakeStats>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    /// 非空时产出该形态，用于触发形态不匹配。
    produce_shape: Option<ChannelShape>,
}

impl FakeFactory {
    pub fn new(shape: ChannelShape, behavior: FakeBehavior) -> Self {
        Self {
            shape,
            behavior,
            stats: Arc::new(FakeStats::default()),
            channels: Mutex::new(Vec::new()),
            produce_shape: None,
        }
    }

    /// 声明 `shape`，实际产出 `actual` 形态的通道。
    pub fn mismatched(shape: ChannelShape, actual: ChannelShape) -> Self {
        Self {
            produce_shape: Some(actual),
            ..Self::new(shape, FakeBehavior::default())
        }
    }

    pub fn stats(&self) -> &Arc<FakeStats> {
        &self.stats
    }

    pub fn created(&self) -> usize {
        self.stats.created.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().clone()
    }

    /// 新建一条假通道但不登记到工厂，用于 `set_channel`。
    pub fn detached(&self) -> Arc<FakeChannel> {
        Arc::new(FakeChannel::new(
            self.shape,
            usize::MAX,
            self.behavior.clone(),
            self.stats.clone(),
        ))
    }

    pub fn wrap(channel: Arc<FakeChannel>) -> ShapedChannel {
        match channel.shape {
            ChannelShape::Duplex => ShapedChannel::Duplex(channel),
            ChannelShape::DuplexSession => ShapedChannel::DuplexSession(channel),
            ChannelShape::Request => ShapedChannel::Request(channel),
            ChannelShape::RequestSession => ShapedChannel::RequestSession(channel),
        }
    }
}

impl ChannelFactory for FakeFactory {
    fn shape(&self) -> ChannelShape {
        self.shape
    }

    fn create_channel(&self, _address: &EndpointAddress) -> Result<ShapedChannel> {
        let ordinal = self.stats.created.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(FakeChannel::new(
            self.produce_shape.unwrap_or(self.shape),
            ordinal,
            self.behavior.clone(),
            self.stats.clone(),
        ));
        self.channels.lock().push(channel.clone());
        Ok(Self::wrap(channel))
    }
}
