//! 单例（一次请求/应答）连接的读取与应答。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 单例前导读完后，连接所有权从前导读取器移交给请求读取器；移交本身是异步的，
//!   此时已没有同步调用方在等待，失败只能就地中止连接；
//! - 应答写完后连接回到分流器的复用路径，等待同一客户端的下一次前导。
//!
//! ## 契约（What）
//! - [`SingletonRequestReader::complete_preamble`] 写出 `PreambleAck`；
//! - [`SingletonRequestReader::receive`] 读取一个信封及其后的 `End` 记录；
//! - [`SingletonRequest::reply`] 写出应答信封与 `End` 后调用 `reuse_connection`。

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use spark_core::{Result, TimeoutBudget};

use super::preamble::PreambleInfo;
use super::record;
use crate::connection::{BufferedConnection, ConnectionId};
use crate::demuxer::ConnectionDemuxer;
use crate::settings::EndpointSettings;

/// 持有单例连接、尚未读出请求的读取器。
#[derive(Debug)]
pub struct SingletonRequestReader {
    connection: BufferedConnection,
    info: PreambleInfo,
    endpoint: Arc<EndpointSettings>,
    demuxer: ConnectionDemuxer,
}

impl SingletonRequestReader {
    pub(crate) fn new(
        connection: BufferedConnection,
        info: PreambleInfo,
        endpoint: Arc<EndpointSettings>,
        demuxer: ConnectionDemuxer,
    ) -> Self {
        Self {
            connection,
            info,
            endpoint,
            demuxer,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn info(&self) -> &PreambleInfo {
        &self.info
    }

    pub async fn complete_preamble(&mut self, budget: TimeoutBudget) -> Result<()> {
        self.connection
            .write_all(&[record::PREAMBLE_ACK], budget)
            .await
    }

    /// 读取请求信封；失败时连接已被中止。
    pub async fn receive(mut self) -> Result<SingletonRequest> {
        let budget = TimeoutBudget::new(self.endpoint.receive_timeout);
        let max = self.endpoint.max_message_size;
        let read = async {
            let body = record::read_envelope(&mut self.connection, max, budget).await?;
            record::expect_record(&mut self.connection, record::END, "end record", budget).await?;
            Ok::<_, spark_core::CoreError>(body)
        };
        match read.await {
            Ok(body) => Ok(SingletonRequest {
                body,
                info: self.info,
                connection: self.connection,
                demuxer: self.demuxer,
            }),
            Err(error) => {
                self.connection.abort();
                Err(error)
            }
        }
    }

    pub fn abort(mut self) {
        self.connection.abort();
    }
}

/// 已读出的单例请求，持有连接直到应答完成。
#[derive(Debug)]
pub struct SingletonRequest {
    body: Bytes,
    info: PreambleInfo,
    connection: BufferedConnection,
    demuxer: ConnectionDemuxer,
}

impl SingletonRequest {
    pub fn via(&self) -> &str {
        &self.info.via
    }

    pub fn content_type(&self) -> &str {
        &self.info.content_type
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// 写出应答并把连接交回分流器复用。
    ///
    /// 池满时的优雅关闭沿用本次应答剩余的预算。
    pub async fn reply(mut self, body: &[u8], budget: TimeoutBudget) -> Result<()> {
        let mut buf = BytesMut::with_capacity(body.len() + 8);
        record::encode_envelope(body, &mut buf);
        buf.extend_from_slice(&[record::END]);
        if let Err(error) = self.connection.write_all(&buf, budget).await {
            self.connection.abort();
            return Err(error);
        }
        self.demuxer
            .reuse_connection(self.connection, budget.remaining())
            .await;
        Ok(())
    }

    pub fn abort(mut self) {
        self.connection.abort();
    }
}
