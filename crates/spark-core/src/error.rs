use std::borrow::Cow;
use std::error::Error;
use std::fmt;

/// 稳定错误码表。
///
/// # 设计意图（Why）
/// - 运维与测试依据 `<领域>.<语义>` 形式的错误码做聚合与断言，而不是解析自然语言消息；
/// - 各 crate 的领域错误（`FramingError`、`BinderError` 等）在转换为 [`CoreError`] 时统一落到此表。
///
/// # 契约说明（What）
/// - 错误码一经发布不得改名；新增错误码需追加在对应分组末尾。
pub mod codes {
    pub const TIMEOUT: &str = "spark.core.timeout";
    pub const ABORTED: &str = "spark.core.aborted";
    pub const DISPOSED: &str = "spark.core.disposed";
    pub const FAULTED: &str = "spark.core.faulted";
    pub const INVALID_STATE: &str = "spark.core.invalid_state";
    pub const INVALID_ARGUMENT: &str = "spark.core.invalid_argument";
    pub const COMMUNICATION: &str = "spark.core.communication";
    pub const FATAL: &str = "spark.core.fatal";

    pub const TRANSACTION_NOT_ACTIVE: &str = "spark.transaction.not_active";

    pub const FRAMING_UNSUPPORTED_MODE: &str = "spark.framing.unsupported_mode";
    pub const FRAMING_UNSUPPORTED_VERSION: &str = "spark.framing.unsupported_version";
    pub const FRAMING_UNEXPECTED_RECORD: &str = "spark.framing.unexpected_record";
    pub const FRAMING_MALFORMED: &str = "spark.framing.malformed";
    pub const FRAMING_FAULT_RECEIVED: &str = "spark.framing.fault_received";
    pub const FRAMING_ENDPOINT_NOT_FOUND: &str = "spark.framing.endpoint_not_found";
    pub const FRAMING_CONTENT_TYPE_INVALID: &str = "spark.framing.content_type_invalid";
    pub const FRAMING_SERVICE_ACTIVATION_FAILED: &str = "spark.framing.service_activation_failed";
    pub const FRAMING_UNEXPECTED_EOF: &str = "spark.framing.unexpected_eof";

    pub const BINDER_INVALID_STATE: &str = "spark.session.binder.invalid_state";
    pub const BINDER_CHANNEL_UNAVAILABLE: &str = "spark.session.binder.channel_unavailable";
    pub const BINDER_REPLY_MISSING: &str = "spark.session.binder.reply_missing";
    pub const BINDER_CLOSED: &str = "spark.session.binder.closed";
    pub const BINDER_ABORTED: &str = "spark.session.binder.aborted";
    pub const BINDER_FAULTED: &str = "spark.session.binder.faulted";
    pub const BINDER_TIMEOUT: &str = "spark.session.binder.timeout";
    pub const BINDER_INVALID_ARGUMENT: &str = "spark.session.binder.invalid_argument";
    pub const RECEIVE_CONTEXT_INVALID_STATE: &str = "spark.session.receive_context.invalid_state";
    pub const RECEIVE_CONTEXT_FAULTED: &str = "spark.session.receive_context.faulted";
}

/// 错误分类枚举，决定容错路径如何处置一次失败。
///
/// # 设计背景（Why）
/// - 分流器、绑定器、接收上下文分别按“通信失败可丢弃”“超时按场景升级”“致命错误永不吞掉”
///   等规则处置错误，分类必须显式携带而不能依赖字符串匹配。
///
/// # 契约说明（What）
/// - `Communication`：对端异常、连接重置等可隔离的单连接失败；
/// - `Timeout`：超时预算耗尽；
/// - `ProtocolViolation`：握手或帧格式错误，`fault` 为应回送对端的故障串；
/// - `Aborted` / `Faulted` / `Disposed`：对象生命周期已终止导致的失败；
/// - `InvalidState` / `InvalidArgument`：调用方违反前置条件；
/// - `ResourceExhausted`：连接池或接入配额已满；
/// - `Fatal`：进程级不可恢复错误，绕过所有容错路径。
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Communication,
    Timeout,
    ProtocolViolation { fault: Option<Cow<'static, str>> },
    Aborted,
    Faulted,
    Disposed,
    InvalidState,
    InvalidArgument,
    ResourceExhausted,
    Fatal,
}

/// `ErrorCause` 封装底层原因，保持 `Send + Sync` 以方便跨线程传递。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// 框架统一的返回值别名。
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// `CoreError` 是传输会话核心的统一错误载体。
///
/// # 设计意图（Why）
/// - 让分流器、绑定器与接收上下文共享同一套错误码与分类，调用方只需检查 [`category`](Self::category)
///   即可决定“重抛/吞掉/升级”；
/// - 通过 `cause` 保留底层 IO 或领域错误，错误链可经 [`Error::source`] 追溯。
///
/// # 契约定义（What）
/// - `code` 必须取自 [`codes`] 或各 crate 备案的稳定错误码；
/// - 未显式设置分类时默认为 [`ErrorCategory::Communication`]；
/// - 类型本身不可克隆：需要向多个等待者广播失败时，应各自构造新错误。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: ErrorCategory,
}

impl CoreError {
    /// 构造核心错误。
    ///
    /// # 示例（Examples）
    /// ```rust
    /// use spark_core::{CoreError, ErrorCategory, codes};
    ///
    /// let err = CoreError::new(codes::COMMUNICATION, "peer reset");
    /// assert_eq!(err.code(), codes::COMMUNICATION);
    /// assert_eq!(err.category(), &ErrorCategory::Communication);
    /// ```
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: ErrorCategory::Communication,
        }
    }

    /// 超时预算耗尽。
    pub fn timeout(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::TIMEOUT, message).with_category(ErrorCategory::Timeout)
    }

    /// 对象已被中止。
    pub fn aborted(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::ABORTED, message).with_category(ErrorCategory::Aborted)
    }

    /// 对象已进入故障态。
    pub fn faulted(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::FAULTED, message).with_category(ErrorCategory::Faulted)
    }

    /// 对象已被释放。
    pub fn disposed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::DISPOSED, message).with_category(ErrorCategory::Disposed)
    }

    /// 当前状态不允许该操作。
    pub fn invalid_state(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::INVALID_STATE, message).with_category(ErrorCategory::InvalidState)
    }

    /// 入参违反契约。
    pub fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::INVALID_ARGUMENT, message).with_category(ErrorCategory::InvalidArgument)
    }

    /// 协议违例，`fault` 为需要回送给对端的故障串。
    pub fn protocol(
        code: &'static str,
        fault: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(code, message).with_category(ErrorCategory::ProtocolViolation {
            fault: Some(fault.into()),
        })
    }

    /// 进程级致命错误。
    pub fn fatal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::FATAL, message).with_category(ErrorCategory::Fatal)
    }

    /// 附带底层原因并返回新的核心错误。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 为错误标记结构化分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    /// 就地更新错误分类。
    pub fn set_category(&mut self, category: ErrorCategory) {
        self.category = category;
    }

    pub fn category(&self) -> &ErrorCategory {
        &self.category
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 是否为致命错误。
    ///
    /// # 契约说明（What）
    /// - 返回 `true` 时所有容错路径（分流器的丢弃、绑定器的屏蔽）都必须直接向上传播；
    /// - 该判定是全局唯一的“致命”谓词，各层不得自行扩充。
    pub fn is_fatal(&self) -> bool {
        matches!(self.category, ErrorCategory::Fatal)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.category, ErrorCategory::Timeout)
    }

    /// 是否属于通信异常族。
    ///
    /// 协议违例、中止与故障都视作通信异常的特例：它们只影响当前连接或通道。
    pub fn is_communication(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Communication
                | ErrorCategory::ProtocolViolation { .. }
                | ErrorCategory::Aborted
                | ErrorCategory::Faulted
        )
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self.category, ErrorCategory::ProtocolViolation { .. })
    }

    /// 协议违例携带的故障串。
    pub fn fault(&self) -> Option<&str> {
        match &self.category {
            ErrorCategory::ProtocolViolation { fault } => fault.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn Error + 'static))
    }
}
