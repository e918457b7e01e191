//! 连接分流器。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 一个监听地址同时承载双工会话与单例请求/应答；连接必须先读出模式记录与前导，
//!   才能决定交给会话处理器还是单例监听器；
//! - 单例应答完成后连接回到分流器等待下一次前导，池中连接数量受上限约束。
//!
//! ## 架构定位（Architecture）
//! - 上游：[`ConnectionAcceptor`] 推送原始连接与接入节流额度；
//! - 下游：[`SessionPreambleHandler`]、[`SingletonPreambleHandler`] 接手完成分类的连接；
//! - 旁路：[`TransportExceptionHandler`] 决定非致命错误是吞掉还是上报。
//!
//! ## 契约（What）
//! - 每条连接在独立任务中处理，单条连接的协议错误、超时、对端重置只影响它自己；
//! - 追踪表、池计数、释放标记都在同一把锁内检查并修改；
//! - 复用连接的计数增减成对出现，且对每条被接纳的连接恰好执行一次；
//! - `dispose` 幂等，可与任意进行中的分类回调并发。
//!
//! ## 风险提示（Trade-offs）
//! - 致命错误不会在任务内被吞掉，而是交给 [`TransportExceptionHandler::escalate`]；
//!   默认实现只记录 `error` 日志，需要终止进程的宿主应自行实现该方法。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use spark_core::{CoreError, Result, TimeoutBudget};
use tokio::sync::watch;
use tracing::Instrument;

use crate::acceptor::{ConnectionAcceptor, ConnectionDequeued};
use crate::connection::{BoxConnection, BufferedConnection, ConnectionId};
use crate::error::FramingError;
use crate::framing::preamble::{self, PendingSession, PreambleInfo, PreambleLimits};
use crate::framing::{ConnectionModeReader, FramingMode, SingletonRequest, SingletonRequestReader};
use crate::listener::ConnectionListener;
use crate::settings::{DemuxerSettings, EndpointSettings};

/// 改写或校验前导中的目标地址。
///
/// 返回错误表示服务激活失败，对端将收到 `ServiceActivationFailed` 故障。
pub trait ViaDelegate: Send + Sync + 'static {
    fn resolve(&self, via: &str) -> Result<String>;
}

impl<F> ViaDelegate for F
where
    F: Fn(&str) -> Result<String> + Send + Sync + 'static,
{
    fn resolve(&self, via: &str) -> Result<String> {
        self(via)
    }
}

/// 按目标地址查找端点设置；`None` 表示该地址没有监听者。
pub trait TransportSettingsCallback: Send + Sync + 'static {
    fn settings_for(&self, via: &str) -> Option<Arc<EndpointSettings>>;
}

impl<F> TransportSettingsCallback for F
where
    F: Fn(&str) -> Option<Arc<EndpointSettings>> + Send + Sync + 'static,
{
    fn settings_for(&self, via: &str) -> Option<Arc<EndpointSettings>> {
        self(via)
    }
}

/// 接手双工会话连接。
#[async_trait]
pub trait SessionPreambleHandler: Send + Sync + 'static {
    async fn on_session(&self, session: PendingSession) -> Result<()>;
}

/// 为单例前导提供监听器。
#[async_trait]
pub trait SingletonPreambleHandler: Send + Sync + 'static {
    async fn on_singleton_preamble(
        &self,
        preamble: &PreambleInfo,
    ) -> Result<Arc<dyn SingletonListener>>;
}

/// 接收已读出的单例请求。
#[async_trait]
pub trait SingletonListener: Send + Sync + 'static {
    async fn on_request(&self, request: SingletonRequest);
}

/// 共享的传输异常处理策略。
pub trait TransportExceptionHandler: Send + Sync + 'static {
    /// 返回 `true` 表示错误已被吞掉。
    fn handle(&self, error: &CoreError) -> bool;

    /// 未被吞掉的错误与致命错误的最终去处。
    fn escalate(&self, error: CoreError) {
        tracing::error!(code = error.code(), %error, "transport error escalated");
    }
}

/// 记录日志后吞掉所有非致命错误。
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingExceptionHandler;

impl TransportExceptionHandler for LoggingExceptionHandler {
    fn handle(&self, error: &CoreError) -> bool {
        tracing::warn!(code = error.code(), %error, "transport error contained");
        true
    }
}

/// 分流器的下游回调集合。
#[derive(Clone)]
pub struct DemuxerHandlers {
    transport_settings: Arc<dyn TransportSettingsCallback>,
    session: Arc<dyn SessionPreambleHandler>,
    singleton: Arc<dyn SingletonPreambleHandler>,
    exception_handler: Arc<dyn TransportExceptionHandler>,
}

impl DemuxerHandlers {
    pub fn new(
        transport_settings: Arc<dyn TransportSettingsCallback>,
        session: Arc<dyn SessionPreambleHandler>,
        singleton: Arc<dyn SingletonPreambleHandler>,
    ) -> Self {
        Self {
            transport_settings,
            session,
            singleton,
            exception_handler: Arc::new(LoggingExceptionHandler),
        }
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn TransportExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }
}

/// `reuse_connection` 的处置结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReuseOutcome {
    /// 已入池，正在以空闲超时等待下一次前导。
    Pooled,
    /// 池已满，连接按调用方给出的超时优雅关闭。
    ClosedFromPool,
    /// 分流器已释放，连接被中止。
    Disposed,
}

/// 追踪中的读取器所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderStage {
    Mode,
    SessionPreamble,
    SingletonPreamble,
}

type ReaderId = u64;

struct TrackedReader {
    connection: ConnectionId,
    stage: ReaderStage,
    dispose: watch::Sender<bool>,
}

#[derive(Default)]
struct DemuxerState {
    disposed: bool,
    acceptor: Option<Arc<ConnectionAcceptor>>,
    via_delegate: Option<Arc<dyn ViaDelegate>>,
    readers: HashMap<ReaderId, TrackedReader>,
    next_reader: ReaderId,
    pooled_connection_count: usize,
}

struct DemuxerInner {
    settings: DemuxerSettings,
    handlers: DemuxerHandlers,
    state: Mutex<DemuxerState>,
}

/// 连接分流器句柄，克隆代价为一次引用计数。
#[derive(Clone)]
pub struct ConnectionDemuxer {
    inner: Arc<DemuxerInner>,
}

impl ConnectionDemuxer {
    pub fn new(settings: DemuxerSettings, handlers: DemuxerHandlers) -> Self {
        Self {
            inner: Arc::new(DemuxerInner {
                settings,
                handlers,
                state: Mutex::new(DemuxerState::default()),
            }),
        }
    }

    pub fn settings(&self) -> &DemuxerSettings {
        &self.inner.settings
    }

    /// 开始从 `listener` 接入连接。
    ///
    /// # 契约（What）
    /// - `via_delegate` 可改写前导中的目标地址，拒绝时对端收到 `ServiceActivationFailed`；
    /// - 已释放时返回 `Disposed`，重复启动返回 `InvalidState`。
    pub fn start_demuxing(
        &self,
        listener: Arc<dyn ConnectionListener>,
        via_delegate: Option<Arc<dyn ViaDelegate>>,
    ) -> Result<()> {
        let acceptor = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Err(CoreError::disposed("connection demuxer is disposed"));
            }
            if state.acceptor.is_some() {
                return Err(CoreError::invalid_state("connection demuxer is already demuxing"));
            }
            let acceptor = Arc::new(ConnectionAcceptor::new(
                listener,
                self.inner.settings.max_pending_accepts,
            ));
            state.acceptor = Some(Arc::clone(&acceptor));
            state.via_delegate = via_delegate;
            acceptor
        };
        let weak: Weak<DemuxerInner> = Arc::downgrade(&self.inner);
        acceptor.start(move |connection, dequeued| match weak.upgrade() {
            Some(inner) => ConnectionDemuxer { inner }.on_connection_available(connection, dequeued),
            None => {
                let mut connection = connection;
                connection.abort();
                dequeued.fire();
            }
        });
        Ok(())
    }

    /// 以通道初始化超时开始读取新连接的模式记录。
    pub fn on_connection_available(&self, connection: BoxConnection, dequeued: ConnectionDequeued) {
        let budget = TimeoutBudget::new(self.inner.settings.channel_initialization_timeout);
        self.start_mode_read(BufferedConnection::new(connection), dequeued, budget, false);
    }

    /// 把一条已用过的连接交回分流器等待下一次前导。
    ///
    /// # 执行逻辑（How）
    /// 1. 锁内检查池计数：已达 `max_pooled_connections` 时不入池，否则计数加一；
    /// 2. 未入池的连接以 `close_timeout` 优雅关闭；
    /// 3. 入池的连接以空闲超时读取模式记录，读取结束（无论成败）时在锁内把计数减一。
    pub async fn reuse_connection(
        &self,
        connection: BufferedConnection,
        close_timeout: Duration,
    ) -> ReuseOutcome {
        let admitted = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                None
            } else if state.pooled_connection_count >= self.inner.settings.max_pooled_connections {
                Some(false)
            } else {
                state.pooled_connection_count += 1;
                Some(true)
            }
        };
        match admitted {
            None => {
                let mut connection = connection;
                connection.abort();
                ReuseOutcome::Disposed
            }
            Some(false) => {
                tracing::debug!(
                    connection = connection.id(),
                    limit = self.inner.settings.max_pooled_connections,
                    "connection pool is full, closing reused connection"
                );
                ConnectionModeReader::new(connection, true)
                    .close_from_pool(close_timeout)
                    .await;
                ReuseOutcome::ClosedFromPool
            }
            Some(true) => {
                let weak = Arc::downgrade(&self.inner);
                let dequeued = ConnectionDequeued::from_fn(move || {
                    if let Some(inner) = weak.upgrade() {
                        let mut state = inner.state.lock();
                        state.pooled_connection_count = state.pooled_connection_count.saturating_sub(1);
                    }
                });
                let budget = TimeoutBudget::new(self.inner.settings.idle_timeout);
                self.start_mode_read(connection, dequeued, budget, true);
                ReuseOutcome::Pooled
            }
        }
    }

    /// 释放分流器：停止接入并中止所有追踪中的读取器。
    pub fn dispose(&self) {
        let (readers, acceptor) = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.via_delegate = None;
            (std::mem::take(&mut state.readers), state.acceptor.take())
        };
        tracing::debug!(readers = readers.len(), "disposing connection demuxer");
        for reader in readers.into_values() {
            tracing::trace!(connection = reader.connection, stage = ?reader.stage, "disposing reader");
            reader.dispose.send_replace(true);
        }
        if let Some(acceptor) = acceptor {
            acceptor.dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    pub fn pooled_connection_count(&self) -> usize {
        self.inner.state.lock().pooled_connection_count
    }

    pub fn tracked_reader_count(&self) -> usize {
        self.inner.state.lock().readers.len()
    }

    fn track(&self, connection: ConnectionId, stage: ReaderStage) -> Option<(ReaderId, watch::Receiver<bool>)> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return None;
        }
        let id = state.next_reader;
        state.next_reader += 1;
        let (dispose, disposed) = watch::channel(false);
        state.readers.insert(
            id,
            TrackedReader {
                connection,
                stage,
                dispose,
            },
        );
        Some((id, disposed))
    }

    fn untrack(&self, id: ReaderId) -> bool {
        self.inner.state.lock().readers.remove(&id).is_some()
    }

    fn limits(&self) -> PreambleLimits {
        PreambleLimits {
            max_via_size: self.inner.settings.max_via_size,
            max_content_type_size: self.inner.settings.max_content_type_size,
        }
    }

    fn start_mode_read(
        &self,
        connection: BufferedConnection,
        dequeued: ConnectionDequeued,
        budget: TimeoutBudget,
        is_cached: bool,
    ) {
        let Some((reader_id, mut disposed)) = self.track(connection.id(), ReaderStage::Mode) else {
            tracing::debug!(connection = connection.id(), "demuxer disposed, dropping connection");
            let mut connection = connection;
            connection.abort();
            dequeued.fire();
            return;
        };
        let demuxer = self.clone();
        tokio::spawn(async move {
            let mut reader = ConnectionModeReader::new(connection, is_cached);
            let result = tokio::select! {
                biased;
                _ = wait_disposed(&mut disposed) => None,
                result = reader.read_mode(budget) => Some(result),
            };
            dequeued.fire();
            let Some(result) = result else {
                reader.abort();
                return;
            };
            if let Err(error) = demuxer
                .on_connection_mode_known(reader_id, reader, result, budget)
                .await
            {
                demuxer.inner.handlers.exception_handler.escalate(error);
            }
        }
        .in_current_span());
    }

    /// 模式记录读取完成后的路由。
    ///
    /// # 执行逻辑（How）
    /// 1. 从追踪表移除读取器；已释放则中止连接；
    /// 2. 读取失败交给 [`contain`](Self::contain)，复用连接的超时静默丢弃；
    /// 3. 未支持的模式回送 `UnsupportedMode` 故障并走共享异常处理；
    /// 4. 双工与单例分别进入各自的前导流水线，流水线中的非致命错误同样走共享异常处理。
    async fn on_connection_mode_known(
        &self,
        reader_id: ReaderId,
        reader: ConnectionModeReader,
        result: Result<u8>,
        budget: TimeoutBudget,
    ) -> Result<()> {
        if !self.untrack(reader_id) {
            reader.abort();
            return Ok(());
        }
        let is_cached = reader.is_cached();
        let mode = match result {
            Ok(mode) => mode,
            Err(error) => return self.contain(reader.into_connection(), error, is_cached).await,
        };
        let connection = reader.into_connection();
        let mode = match FramingMode::try_from(mode) {
            Ok(mode) => mode,
            Err(unsupported) => {
                let error = CoreError::from(unsupported);
                if let Some(fault) = error.fault() {
                    preamble::send_fault_and_close(
                        connection,
                        fault,
                        self.inner.settings.fault_send_timeout,
                    )
                    .await;
                }
                return self.handle_transport_exception(error);
            }
        };
        tracing::trace!(connection = connection.id(), ?mode, is_cached, "framing mode known");
        // 复用连接的前导读取重新计时。
        let budget = if is_cached {
            TimeoutBudget::new(self.inner.settings.channel_initialization_timeout)
        } else {
            budget
        };
        let outcome = match mode {
            FramingMode::Duplex => self.on_session_preamble(connection, budget, is_cached).await,
            FramingMode::Singleton => self.on_singleton_preamble(connection, budget, is_cached).await,
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(error) => self.handle_transport_exception(error),
        }
    }

    /// 单连接失败的隔离策略。
    async fn contain(&self, mut connection: BufferedConnection, error: CoreError, is_cached: bool) -> Result<()> {
        let id = connection.id();
        if error.is_fatal() {
            connection.abort();
            return Err(error);
        }
        if error.is_timeout() {
            connection.abort();
            if is_cached {
                tracing::trace!(connection = id, "pooled connection idled out");
                return Ok(());
            }
            tracing::warn!(connection = id, %error, "connection did not complete its preamble in time");
            return self.handle_transport_exception(error);
        }
        if let Some(fault) = error.fault().map(str::to_owned) {
            tracing::debug!(connection = id, %error, "rejecting malformed preamble");
            preamble::send_fault_and_close(connection, &fault, self.inner.settings.fault_send_timeout)
                .await;
            return Ok(());
        }
        if error.is_communication() {
            tracing::debug!(connection = id, %error, "dropping connection");
            connection.abort();
            return Ok(());
        }
        connection.abort();
        self.handle_transport_exception(error)
    }

    fn handle_transport_exception(&self, error: CoreError) -> Result<()> {
        if error.is_fatal() || !self.inner.handlers.exception_handler.handle(&error) {
            return Err(error);
        }
        Ok(())
    }

    /// 在追踪下读取前导；分流器释放时返回 `None`。
    async fn read_tracked_preamble(
        &self,
        connection: &mut BufferedConnection,
        stage: ReaderStage,
        budget: TimeoutBudget,
    ) -> Option<Result<PreambleInfo>> {
        let (reader_id, mut disposed) = self.track(connection.id(), stage)?;
        let limits = self.limits();
        let read = tokio::select! {
            biased;
            _ = wait_disposed(&mut disposed) => None,
            result = preamble::read_preamble(connection, limits, budget) => Some(result),
        };
        if !self.untrack(reader_id) {
            return None;
        }
        read
    }

    /// 依次执行 via 改写、端点查找与内容类型校验。
    fn resolve_endpoint(&self, info: &mut PreambleInfo) -> std::result::Result<Arc<EndpointSettings>, FramingError> {
        let via_delegate = self.inner.state.lock().via_delegate.clone();
        if let Some(delegate) = via_delegate {
            match delegate.resolve(&info.via) {
                Ok(via) => info.via = via,
                Err(error) => {
                    tracing::debug!(via = %info.via, %error, "service activation failed");
                    return Err(FramingError::ServiceActivationFailed(info.via.clone()));
                }
            }
        }
        let endpoint = self
            .inner
            .handlers
            .transport_settings
            .settings_for(&info.via)
            .ok_or_else(|| FramingError::EndpointNotFound(info.via.clone()))?;
        if !endpoint.accepts_content_type(&info.content_type) {
            return Err(FramingError::ContentTypeInvalid(info.content_type.clone()));
        }
        Ok(endpoint)
    }

    /// 读取并校验前导；失败时连接已被处置，返回 `Ok(None)`。
    ///
    /// 复用连接在前导阶段超时同样静默丢弃。
    async fn accept_preamble(
        &self,
        connection: &mut Option<BufferedConnection>,
        stage: ReaderStage,
        budget: TimeoutBudget,
        is_cached: bool,
    ) -> Result<Option<(PreambleInfo, Arc<EndpointSettings>)>> {
        let Some(conn) = connection.as_mut() else {
            return Ok(None);
        };
        let read = self.read_tracked_preamble(conn, stage, budget).await;
        let mut info = match read {
            Some(Ok(info)) => info,
            Some(Err(error)) => {
                if let Some(conn) = connection.take() {
                    self.contain(conn, error, is_cached).await?;
                }
                return Ok(None);
            }
            None => {
                if let Some(mut conn) = connection.take() {
                    conn.abort();
                }
                return Ok(None);
            }
        };
        match self.resolve_endpoint(&mut info) {
            Ok(endpoint) => Ok(Some((info, endpoint))),
            Err(rejected) => {
                tracing::debug!(via = %info.via, error = %rejected, "preamble rejected");
                if let (Some(conn), Some(fault)) = (connection.take(), rejected.fault()) {
                    preamble::send_fault_and_close(conn, fault, self.inner.settings.fault_send_timeout)
                        .await;
                }
                Ok(None)
            }
        }
    }

    async fn on_session_preamble(
        &self,
        connection: BufferedConnection,
        budget: TimeoutBudget,
        is_cached: bool,
    ) -> Result<()> {
        let mut slot = Some(connection);
        let Some((info, endpoint)) = self
            .accept_preamble(&mut slot, ReaderStage::SessionPreamble, budget, is_cached)
            .await?
        else {
            return Ok(());
        };
        let Some(connection) = slot else {
            return Ok(());
        };
        tracing::debug!(connection = connection.id(), via = %info.via, "duplex session preamble accepted");
        let session = PendingSession::new(
            info,
            endpoint,
            connection,
            self.inner.settings.fault_send_timeout,
        );
        self.inner.handlers.session.on_session(session).await
    }

    /// 单例前导读完后的所有权移交。
    ///
    /// 移交过程中的任何非致命失败都只中止这条连接并记录日志，不向外传播。
    async fn on_singleton_preamble(
        &self,
        connection: BufferedConnection,
        budget: TimeoutBudget,
        is_cached: bool,
    ) -> Result<()> {
        let mut slot = Some(connection);
        let Some((info, endpoint)) = self
            .accept_preamble(&mut slot, ReaderStage::SingletonPreamble, budget, is_cached)
            .await?
        else {
            return Ok(());
        };
        let Some(mut connection) = slot else {
            return Ok(());
        };
        let id = connection.id();
        let listener = match self.inner.handlers.singleton.on_singleton_preamble(&info).await {
            Ok(listener) => listener,
            Err(error) => {
                connection.abort();
                return handoff_failed(id, error);
            }
        };
        let mut reader = SingletonRequestReader::new(connection, info, endpoint, self.clone());
        if let Err(error) = reader.complete_preamble(budget).await {
            reader.abort();
            return handoff_failed(id, error);
        }
        match reader.receive().await {
            Ok(request) => {
                listener.on_request(request).await;
                Ok(())
            }
            Err(error) => handoff_failed(id, error),
        }
    }
}

fn handoff_failed(connection: ConnectionId, error: CoreError) -> Result<()> {
    if error.is_fatal() {
        return Err(error);
    }
    tracing::debug!(connection, %error, "singleton handoff failed, connection aborted");
    Ok(())
}

async fn wait_disposed(disposed: &mut watch::Receiver<bool>) {
    let _ = disposed.wait_for(|disposed| *disposed).await;
}

impl fmt::Debug for ConnectionDemuxer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionDemuxer")
            .field("disposed", &state.disposed)
            .field("readers", &state.readers.len())
            .field("pooled_connection_count", &state.pooled_connection_count)
            .finish()
    }
}
