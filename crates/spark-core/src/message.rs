//! 消息与属性袋。
//!
//! # 设计背景（Why）
//! - 绑定器按 `MessageId`/`RelatesTo` 关联双工通道上的请求与应答；
//! - 传输层通过属性袋把接收上下文等附加对象挂到消息上，上层按字符串键取回。
//!
//! # 契约（What）
//! - 属性值以 `Arc<dyn Any + Send + Sync>` 保存，克隆消息只复制引用；
//! - [`MessageProperties::get`] 在类型不匹配时返回 `None`，不会 panic。

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

/// 消息标识。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(Arc<str>);

impl MessageId {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    /// 生成进程内唯一的标识。
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let sequence = NEXT.fetch_add(1, Ordering::Relaxed);
        Self(Arc::from(format!("urn:spark:message:{sequence}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 字符串键的属性袋。
#[derive(Clone, Default)]
pub struct MessageProperties {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.entries.insert(key.into(), Arc::new(value));
    }

    /// 以共享引用形式插入，避免再次装箱。
    pub fn insert_shared(&mut self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.entries.insert(key.into(), value);
    }

    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.entries
            .get(key)
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for MessageProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// 在通道间传递的应用消息。
///
/// # 契约说明（What）
/// - `body` 为不透明负载，本层不解析其编码；
/// - `id` 与 `relates_to` 用于双工通道上的请求/应答关联：应答消息的 `relates_to` 必须等于请求的 `id`。
#[derive(Clone, Debug, Default)]
pub struct Message {
    action: Option<String>,
    id: Option<MessageId>,
    relates_to: Option<MessageId>,
    body: Bytes,
    properties: MessageProperties,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_relates_to(mut self, id: MessageId) -> Self {
        self.relates_to = Some(id);
        self
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn id(&self) -> Option<&MessageId> {
        self.id.as_ref()
    }

    pub fn set_id(&mut self, id: MessageId) {
        self.id = Some(id);
    }

    pub fn relates_to(&self) -> Option<&MessageId> {
        self.relates_to.as_ref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut MessageProperties {
        &mut self.properties
    }
}
