//! 分流器、端点与客户端连接池的配置。
//!
//! 所有结构体实现 `serde::Deserialize` 且带 `#[serde(default)]`，配置文件只需写出要覆盖的字段；
//! 时长字段以毫秒整数表示。

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// 分流器配置。
///
/// # 契约（What）
/// - `channel_initialization_timeout`：新连接读完模式记录与前导的总预算；
/// - `idle_timeout`：复用连接在池中等待下一次前导的预算；
/// - `max_pooled_connections`：同时处于池中等待读取的连接上限；
/// - `max_pending_accepts`：已接入但前导未读完的连接上限；
/// - `max_via_size` / `max_content_type_size`：前导字符串的长度上限；
/// - `fault_send_timeout`：向对端回送故障记录的预算。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemuxerSettings {
    #[serde(with = "millis")]
    pub channel_initialization_timeout: Duration,
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    pub max_pooled_connections: usize,
    pub max_pending_accepts: usize,
    pub max_via_size: usize,
    pub max_content_type_size: usize,
    #[serde(with = "millis")]
    pub fault_send_timeout: Duration,
}

impl Default for DemuxerSettings {
    fn default() -> Self {
        Self {
            channel_initialization_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            max_pooled_connections: 10,
            max_pending_accepts: 10,
            max_via_size: 2048,
            max_content_type_size: 256,
            fault_send_timeout: Duration::from_secs(1),
        }
    }
}

impl DemuxerSettings {
    pub fn with_channel_initialization_timeout(mut self, timeout: Duration) -> Self {
        self.channel_initialization_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_pooled_connections(mut self, limit: usize) -> Self {
        self.max_pooled_connections = limit;
        self
    }

    pub fn with_max_pending_accepts(mut self, limit: usize) -> Self {
        self.max_pending_accepts = limit;
        self
    }

    pub fn with_max_via_size(mut self, limit: usize) -> Self {
        self.max_via_size = limit;
        self
    }

    pub fn with_max_content_type_size(mut self, limit: usize) -> Self {
        self.max_content_type_size = limit;
        self
    }

    pub fn with_fault_send_timeout(mut self, timeout: Duration) -> Self {
        self.fault_send_timeout = timeout;
        self
    }
}

/// 单个监听端点的传输设置，由 `TransportSettingsCallback` 按 via 返回。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// 允许的内容类型；为空表示接受任意类型。
    pub content_types: Vec<String>,
    #[serde(with = "millis")]
    pub receive_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            content_types: Vec::new(),
            receive_timeout: Duration::from_secs(600),
            max_message_size: 65_536,
        }
    }
}

impl EndpointSettings {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_types.push(content_type.into());
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        self.content_types.is_empty()
            || self
                .content_types
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(content_type))
    }
}

/// 客户端出站连接池配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolSettings {
    pub max_outbound_connections_per_endpoint: usize,
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    #[serde(with = "millis")]
    pub lease_timeout: Duration,
}

impl Default for ConnectionPoolSettings {
    fn default() -> Self {
        Self {
            max_outbound_connections_per_endpoint: 10,
            idle_timeout: Duration::from_secs(120),
            lease_timeout: Duration::from_secs(300),
        }
    }
}

impl ConnectionPoolSettings {
    pub fn with_max_outbound_connections_per_endpoint(mut self, limit: usize) -> Self {
        self.max_outbound_connections_per_endpoint = limit;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }
}
