//! 内部通道契约。
//!
//! # 设计背景（Why）
//! - 绑定器只关心四种通道形态的差异：消息是直接收取还是由应答合成、是否存在会话、
//!   会话通道如何完成关闭握手；
//! - 形态以封闭枚举 [`ShapedChannel`] 表达，绑定器在构造时按 [`ChannelShape`] 选定行为表，
//!   运行期不做任意类型的动态分派。
//!
//! # 契约（What）
//! - 所有可挂起操作都接收 [`TimeoutBudget`]；
//! - [`DuplexChannel::try_receive`] 返回 `Ok(None)` 表示对端已结束输入（EOF），预算耗尽返回超时错误；
//! - `abort` 必须立即返回，并使挂起中的收发尽快失败或结束。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spark_core::{Message, Result, TimeoutBudget};

/// 通信对象的生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommunicationState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl CommunicationState {
    /// 是否已进入不可恢复的终止区间。
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommunicationState::Closing | CommunicationState::Closed | CommunicationState::Faulted
        )
    }
}

/// 内部通道形态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelShape {
    Duplex,
    DuplexSession,
    Request,
    RequestSession,
}

impl ChannelShape {
    pub fn has_session(self) -> bool {
        matches!(self, ChannelShape::DuplexSession | ChannelShape::RequestSession)
    }

    /// 入站消息是否需要由请求应答合成。
    pub fn is_request(self) -> bool {
        matches!(self, ChannelShape::Request | ChannelShape::RequestSession)
    }
}

/// 通道的目标地址与可选的物理中转地址。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointAddress {
    to: String,
    via: Option<String>,
}

impl EndpointAddress {
    pub fn new(to: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            via: None,
        }
    }

    pub fn with_via(mut self, via: impl Into<String>) -> Self {
        self.via = Some(via.into());
        self
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    /// 物理连接地址；未指定时与 `to` 相同。
    pub fn via(&self) -> &str {
        self.via.as_deref().unwrap_or(&self.to)
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.via {
            Some(via) => write!(f, "{} (via {via})", self.to),
            None => f.write_str(&self.to),
        }
    }
}

/// 所有通道形态共享的生命周期操作。
#[async_trait]
pub trait InnerChannel: Send + Sync {
    fn state(&self) -> CommunicationState;

    async fn open(&self, budget: TimeoutBudget) -> Result<()>;

    async fn close(&self, budget: TimeoutBudget) -> Result<()>;

    fn abort(&self);

    /// 通道是否建立在安全会话之上；影响 `IfNotSecuritySession` 容错模式。
    fn has_security_session(&self) -> bool {
        false
    }
}

/// 双向通道：发送与接收相互独立。
#[async_trait]
pub trait DuplexChannel: InnerChannel {
    async fn send(&self, message: Message, budget: TimeoutBudget) -> Result<()>;

    async fn try_receive(&self, budget: TimeoutBudget) -> Result<Option<Message>>;
}

/// 带会话的双向通道。
#[async_trait]
pub trait DuplexSessionChannel: DuplexChannel {
    /// 关闭本端输出方向；对端读到 EOF 后结束自己的输出。
    async fn close_output_session(&self, budget: TimeoutBudget) -> Result<()>;

    fn session_id(&self) -> &str;
}

/// 请求/应答通道。
#[async_trait]
pub trait RequestChannel: InnerChannel {
    async fn request(&self, message: Message, budget: TimeoutBudget) -> Result<Message>;
}

/// 带会话的请求/应答通道。
pub trait RequestSessionChannel: RequestChannel {
    fn session_id(&self) -> &str;
}

/// 按形态标记的内部通道句柄。
#[derive(Clone)]
pub enum ShapedChannel {
    Duplex(Arc<dyn DuplexChannel>),
    DuplexSession(Arc<dyn DuplexSessionChannel>),
    Request(Arc<dyn RequestChannel>),
    RequestSession(Arc<dyn RequestSessionChannel>),
}

impl ShapedChannel {
    pub fn shape(&self) -> ChannelShape {
        match self {
            ShapedChannel::Duplex(_) => ChannelShape::Duplex,
            ShapedChannel::DuplexSession(_) => ChannelShape::DuplexSession,
            ShapedChannel::Request(_) => ChannelShape::Request,
            ShapedChannel::RequestSession(_) => ChannelShape::RequestSession,
        }
    }

    pub fn inner(&self) -> &dyn InnerChannel {
        match self {
            ShapedChannel::Duplex(channel) => channel.as_ref(),
            ShapedChannel::DuplexSession(channel) => channel.as_ref(),
            ShapedChannel::Request(channel) => channel.as_ref(),
            ShapedChannel::RequestSession(channel) => channel.as_ref(),
        }
    }

    /// 双向形态的收发视图。
    pub fn as_duplex(&self) -> Option<&dyn DuplexChannel> {
        match self {
            ShapedChannel::Duplex(channel) => Some(channel.as_ref()),
            ShapedChannel::DuplexSession(channel) => Some(channel.as_ref()),
            _ => None,
        }
    }

    pub fn as_request(&self) -> Option<&dyn RequestChannel> {
        match self {
            ShapedChannel::Request(channel) => Some(channel.as_ref()),
            ShapedChannel::RequestSession(channel) => Some(channel.as_ref()),
            _ => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            ShapedChannel::DuplexSession(channel) => Some(channel.session_id()),
            ShapedChannel::RequestSession(channel) => Some(channel.session_id()),
            _ => None,
        }
    }

    pub fn state(&self) -> CommunicationState {
        self.inner().state()
    }

    pub fn abort(&self) {
        self.inner().abort();
    }

    /// 是否指向同一个底层通道对象。
    pub fn ptr_eq(&self, other: &ShapedChannel) -> bool {
        match (self, other) {
            (ShapedChannel::Duplex(a), ShapedChannel::Duplex(b)) => Arc::ptr_eq(a, b),
            (ShapedChannel::DuplexSession(a), ShapedChannel::DuplexSession(b)) => {
                Arc::ptr_eq(a, b)
            }
            (ShapedChannel::Request(a), ShapedChannel::Request(b)) => Arc::ptr_eq(a, b),
            (ShapedChannel::RequestSession(a), ShapedChannel::RequestSession(b)) => {
                Arc::ptr_eq(a, b)
            }
            _ => false,
        }
    }
}

impl fmt::Debug for ShapedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapedChannel")
            .field("shape", &self.shape())
            .field("state", &self.state())
            .finish()
    }
}

/// 按目标地址创建内部通道的工厂。
///
/// # 契约（What）
/// - `shape` 在工厂生命周期内保持不变，绑定器据此选定行为表；
/// - 每次（重新）获取通道都会调用 `create_channel`，返回的通道处于 `Created` 状态，由绑定器负责打开。
pub trait ChannelFactory: Send + Sync {
    fn shape(&self) -> ChannelShape;

    fn create_channel(&self, address: &EndpointAddress) -> Result<ShapedChannel>;
}
