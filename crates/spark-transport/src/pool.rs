//! 客户端出站连接池。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 单例请求结束后连接仍然可用，按目标地址缓存可省去重复的建连与前导握手；
//! - 缓存数量受每个目标的上限约束，超限归还的连接直接关闭，这是背压而不是错误。
//!
//! ## 契约（What）
//! - 池条目为 `(目标, 连接, 归还时间)`；
//! - `take` 返回最近归还且未过期的连接，途经的过期连接被中止；
//! - 目标下的连接取空后即移除该目标；
//! - `return_connection` 在池满或连接已过租期时以给定预算优雅关闭连接。

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use spark_core::TimeoutBudget;
use tokio::time::Instant;

use crate::connection::BufferedConnection;
use crate::settings::ConnectionPoolSettings;

struct PooledEntry {
    connection: BufferedConnection,
    created_at: Instant,
    returned_at: Instant,
}

/// 从池中取出的连接及其创建时间。
#[derive(Debug)]
pub struct PooledConnection {
    pub connection: BufferedConnection,
    pub created_at: Instant,
}

impl PooledConnection {
    /// 新建连接时使用。
    pub fn fresh(connection: BufferedConnection) -> Self {
        Self {
            connection,
            created_at: Instant::now(),
        }
    }
}

/// 归还结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnOutcome {
    Pooled,
    /// 池已满或连接超过租期，连接已关闭。
    Closed,
}

pub struct ConnectionPool {
    settings: ConnectionPoolSettings,
    idle: DashMap<String, VecDeque<PooledEntry>>,
}

impl ConnectionPool {
    pub fn new(settings: ConnectionPoolSettings) -> Self {
        Self {
            settings,
            idle: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &ConnectionPoolSettings {
        &self.settings
    }

    /// 取出 `key` 下最近归还的可用连接。
    pub fn take(&self, key: &str) -> Option<PooledConnection> {
        let mut expired = Vec::new();
        let found = {
            let mut entries = self.idle.get_mut(key)?;
            let mut found = None;
            while let Some(entry) = entries.pop_back() {
                if entry.returned_at.elapsed() >= self.settings.idle_timeout {
                    expired.push(entry.connection);
                    continue;
                }
                found = Some(PooledConnection {
                    connection: entry.connection,
                    created_at: entry.created_at,
                });
                break;
            }
            found
        };
        self.idle.remove_if(key, |_, entries| entries.is_empty());
        for mut connection in expired {
            tracing::trace!(key, connection = connection.id(), "aborting idle-expired pooled connection");
            connection.abort();
        }
        found
    }

    /// 归还连接。
    ///
    /// 判定与入池在同一次分片锁内完成；关闭动作在锁外执行。
    pub async fn return_connection(
        &self,
        key: &str,
        pooled: PooledConnection,
        close_timeout: Duration,
    ) -> ReturnOutcome {
        let limit = self.settings.max_outbound_connections_per_endpoint;
        let lease_expired = pooled.created_at.elapsed() >= self.settings.lease_timeout;
        let rejected = {
            let mut entries = self.idle.entry(key.to_owned()).or_default();
            if lease_expired || entries.len() >= limit {
                Some(pooled.connection)
            } else {
                entries.push_back(PooledEntry {
                    connection: pooled.connection,
                    created_at: pooled.created_at,
                    returned_at: Instant::now(),
                });
                None
            }
        };
        let Some(mut connection) = rejected else {
            return ReturnOutcome::Pooled;
        };
        self.idle.remove_if(key, |_, entries| entries.is_empty());
        tracing::debug!(key, connection = connection.id(), lease_expired, limit, "closing connection instead of pooling it");
        if let Err(error) = connection.close(TimeoutBudget::new(close_timeout)).await {
            tracing::debug!(key, %error, "graceful close failed, aborting");
            connection.abort();
        }
        ReturnOutcome::Closed
    }

    pub fn idle_count(&self, key: &str) -> usize {
        self.idle.get(key).map(|entries| entries.len()).unwrap_or(0)
    }

    /// 当前持有空闲连接的目标数量。
    pub fn endpoint_count(&self) -> usize {
        self.idle.len()
    }

    /// 中止并清空所有池中连接。
    pub fn clear(&self) {
        let keys: Vec<String> = self.idle.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, entries)) = self.idle.remove(&key) {
                for mut entry in entries {
                    entry.connection.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ConnectionEvent, MemoryConnection};

    fn connection() -> (PooledConnection, crate::memory::ConnectionProbe, MemoryConnection) {
        let (local, remote) = MemoryConnection::pair();
        let probe = local.probe();
        (PooledConnection::fresh(BufferedConnection::new(Box::new(local))), probe, remote)
    }

    #[tokio::test]
    async fn drained_endpoints_are_forgotten() {
        let pool = ConnectionPool::new(ConnectionPoolSettings::default());
        for index in 0..3 {
            let (pooled, _probe, _remote) = connection();
            let key = format!("net.tcp://host-{index}");
            assert_eq!(
                pool.return_connection(&key, pooled, Duration::from_secs(1)).await,
                ReturnOutcome::Pooled
            );
        }
        assert_eq!(pool.endpoint_count(), 3);

        for index in 0..3 {
            assert!(pool.take(&format!("net.tcp://host-{index}")).is_some());
        }
        assert_eq!(pool.endpoint_count(), 0);
        assert!(pool.take("net.tcp://host-0").is_none());

        let rejecting = ConnectionPool::new(
            ConnectionPoolSettings::default().with_max_outbound_connections_per_endpoint(0),
        );
        let (pooled, _probe, _remote) = connection();
        assert_eq!(
            rejecting.return_connection("net.tcp://a", pooled, Duration::from_secs(1)).await,
            ReturnOutcome::Closed
        );
        assert_eq!(rejecting.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn over_limit_return_is_closed_with_given_timeout() {
        let pool = ConnectionPool::new(
            ConnectionPoolSettings::default().with_max_outbound_connections_per_endpoint(1),
        );
        let (first, first_probe, _r1) = connection();
        let (second, second_probe, _r2) = connection();
        assert_eq!(
            pool.return_connection("net.tcp://a", first, Duration::from_secs(3)).await,
            ReturnOutcome::Pooled
        );
        assert_eq!(
            pool.return_connection("net.tcp://a", second, Duration::from_secs(3)).await,
            ReturnOutcome::Closed
        );
        assert!(first_probe.events().is_empty());
        assert_eq!(second_probe.events(), vec![ConnectionEvent::Closed(Duration::from_secs(3))]);
        assert_eq!(pool.idle_count("net.tcp://a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_expired_entries_are_aborted_on_take() {
        let pool = ConnectionPool::new(
            ConnectionPoolSettings::default().with_idle_timeout(Duration::from_secs(10)),
        );
        let (conn, probe, _remote) = connection();
        pool.return_connection("k", conn, Duration::from_secs(1)).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(pool.take("k").is_none());
        assert_eq!(probe.events(), vec![ConnectionEvent::Aborted]);
    }

    #[tokio::test]
    async fn take_returns_most_recent_connection() {
        let pool = ConnectionPool::new(ConnectionPoolSettings::default());
        let (a, _pa, _ra) = connection();
        let (b, _pb, _rb) = connection();
        let b_id = b.connection.id();
        pool.return_connection("k", a, Duration::from_secs(1)).await;
        pool.return_connection("k", b, Duration::from_secs(1)).await;
        assert_eq!(pool.take("k").map(|p| p.connection.id()), Some(b_id));
        assert_eq!(pool.idle_count("k"), 1);
        assert!(pool.take("other").is_none());
    }
}
