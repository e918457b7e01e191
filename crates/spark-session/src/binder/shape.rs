//! 四种通道形态的行为表。
//!
//! # 设计背景（Why）
//! - 形态之间只在三处不同：请求如何得到应答、入站消息从哪里来、会话通道如何关闭；
//! - 行为以静态函数表表达，绑定器构造时按 [`ChannelShape`] 选定一张表，之后不再分支。
//!
//! # 契约（What）
//! - 请求形态：`send` 以请求代发，应答合成为入站消息进入 [`InputQueue`]；
//! - 双向形态：`request` 为缺少标识的消息分配 `MessageId`，登记一次性应答槽后发送，
//!   由后台接收泵按 `relates_to` 投递应答；
//! - 会话双向形态关闭时先关闭输出方向，再把接收方向读到 EOF，最后关闭通道。

use dashmap::DashMap;
use futures::future::BoxFuture;
use spark_core::{Message, MessageId, Result, TimeoutBudget};
use tokio::sync::oneshot;

use super::input_queue::InputQueue;
use crate::channel::{ChannelShape, DuplexChannel, RequestChannel, ShapedChannel};
use crate::error::BinderError;

/// 形态操作共享的绑定器状态：入站队列与待应答表。
pub(crate) struct ShapeContext {
    pub(crate) queue: InputQueue<Message>,
    pending: DashMap<MessageId, oneshot::Sender<Message>>,
}

impl ShapeContext {
    pub(crate) fn new() -> Self {
        Self {
            queue: InputQueue::new(),
            pending: DashMap::new(),
        }
    }

    /// 把关联到挂起请求的应答交给请求方；未关联的消息原样返回。
    pub(crate) fn complete_reply(&self, message: Message) -> Option<Message> {
        let Some(relates_to) = message.relates_to() else {
            return Some(message);
        };
        match self.pending.remove(relates_to) {
            Some((_, sender)) => {
                // 请求方已超时离开时应答被丢弃。
                let _ = sender.send(message);
                None
            }
            None => Some(message),
        }
    }

    /// 放弃所有挂起请求，请求方随即得到 `ReplyMissing`。
    pub(crate) fn abandon_pending(&self) {
        self.pending.clear();
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

struct PendingSlot<'a> {
    context: &'a ShapeContext,
    id: MessageId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.context.pending.remove(&self.id);
    }
}

type SendFn = for<'a> fn(&'a ShapeContext, &'a ShapedChannel, Message, TimeoutBudget) -> BoxFuture<'a, Result<()>>;
type RequestFn =
    for<'a> fn(&'a ShapeContext, &'a ShapedChannel, Message, TimeoutBudget) -> BoxFuture<'a, Result<Option<Message>>>;
type CloseFn = for<'a> fn(&'a ShapedChannel, TimeoutBudget) -> BoxFuture<'a, Result<()>>;

pub(crate) struct ShapeOps {
    pub(crate) shape: ChannelShape,
    /// 是否需要后台接收泵把通道的入站消息搬进队列。
    pub(crate) pumps_input: bool,
    pub(crate) send: SendFn,
    pub(crate) request: RequestFn,
    pub(crate) close: CloseFn,
}

impl ShapeOps {
    pub(crate) fn has_session(&self) -> bool {
        self.shape.has_session()
    }
}

static DUPLEX: ShapeOps = ShapeOps {
    shape: ChannelShape::Duplex,
    pumps_input: true,
    send: duplex_send,
    request: duplex_request,
    close: plain_close,
};

static DUPLEX_SESSION: ShapeOps = ShapeOps {
    shape: ChannelShape::DuplexSession,
    pumps_input: true,
    send: duplex_send,
    request: duplex_request,
    close: duplex_session_close,
};

static REQUEST: ShapeOps = ShapeOps {
    shape: ChannelShape::Request,
    pumps_input: false,
    send: request_send,
    request: request_request,
    close: plain_close,
};

static REQUEST_SESSION: ShapeOps = ShapeOps {
    shape: ChannelShape::RequestSession,
    pumps_input: false,
    send: request_send,
    request: request_request,
    close: plain_close,
};

pub(crate) fn ops_for(shape: ChannelShape) -> &'static ShapeOps {
    match shape {
        ChannelShape::Duplex => &DUPLEX,
        ChannelShape::DuplexSession => &DUPLEX_SESSION,
        ChannelShape::Request => &REQUEST,
        ChannelShape::RequestSession => &REQUEST_SESSION,
    }
}

fn duplex(channel: &ShapedChannel) -> Result<&dyn DuplexChannel> {
    channel
        .as_duplex()
        .ok_or_else(|| BinderError::ChannelUnavailable.into())
}

fn requester(channel: &ShapedChannel) -> Result<&dyn RequestChannel> {
    channel
        .as_request()
        .ok_or_else(|| BinderError::ChannelUnavailable.into())
}

fn duplex_send<'a>(
    _context: &'a ShapeContext,
    channel: &'a ShapedChannel,
    message: Message,
    budget: TimeoutBudget,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move { duplex(channel)?.send(message, budget).await })
}

fn duplex_request<'a>(
    context: &'a ShapeContext,
    channel: &'a ShapedChannel,
    mut message: Message,
    budget: TimeoutBudget,
) -> BoxFuture<'a, Result<Option<Message>>> {
    Box::pin(async move {
        let channel = duplex(channel)?;
        let id = match message.id() {
            Some(id) => id.clone(),
            None => {
                let id = MessageId::unique();
                message.set_id(id.clone());
                id
            }
        };
        let (sender, receiver) = oneshot::channel();
        context.pending.insert(id.clone(), sender);
        let _slot = PendingSlot { context, id };

        channel.send(message, budget).await?;
        let reply = budget
            .run("duplex reply", async {
                receiver
                    .await
                    .map_err(|_| BinderError::ReplyMissing.into())
            })
            .await?;
        Ok(Some(reply))
    })
}

fn request_send<'a>(
    context: &'a ShapeContext,
    channel: &'a ShapedChannel,
    message: Message,
    budget: TimeoutBudget,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let reply = requester(channel)?.request(message, budget).await?;
        if context.queue.enqueue(reply).is_err() {
            tracing::debug!("input queue closed; synthesized reply dropped");
        }
        Ok(())
    })
}

fn request_request<'a>(
    _context: &'a ShapeContext,
    channel: &'a ShapedChannel,
    message: Message,
    budget: TimeoutBudget,
) -> BoxFuture<'a, Result<Option<Message>>> {
    Box::pin(async move { requester(channel)?.request(message, budget).await.map(Some) })
}

fn plain_close(channel: &ShapedChannel, budget: TimeoutBudget) -> BoxFuture<'_, Result<()>> {
    Box::pin(channel.inner().close(budget))
}

fn duplex_session_close(channel: &ShapedChannel, budget: TimeoutBudget) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let ShapedChannel::DuplexSession(session) = channel else {
            return channel.inner().close(budget).await;
        };
        session.close_output_session(budget).await?;
        let mut discarded = 0usize;
        while session.try_receive(budget).await?.is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(
                session = session.session_id(),
                discarded,
                "messages received while closing the session were discarded"
            );
        }
        session.close(budget).await
    })
}
