use std::borrow::Cow;
use std::io;

use spark_core::{CoreError, ErrorCategory};

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "spark.transport.tcp.resolve_failed",
    message: "tcp resolve",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.transport.tcp.shutdown_failed",
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.tcp.configure_failed",
    message: "tcp configure",
};

pub(crate) const TIMEOUT_CODE: &str = "spark.transport.tcp.timeout";
pub(crate) const CLOSED_CODE: &str = "spark.transport.tcp.closed";
pub(crate) const ADDRESS_CODE: &str = "spark.transport.tcp.invalid_address";

/// 将 IO 错误映射为框架级 CoreError，并附带错误分类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    let category = categorize_io_error(&error);
    CoreError::new(kind.code, Cow::Owned(format!("{}: {}", kind.message, error)))
        .with_category(category)
        .with_cause(error)
}

/// 构造超时错误。
pub(crate) fn timeout_error(kind: OperationKind) -> CoreError {
    let message = format!("{} timed out", kind.message);
    CoreError::new(TIMEOUT_CODE, message).with_category(ErrorCategory::Timeout)
}

/// 连接已被关闭或中止后的任何操作。
pub(crate) fn closed_error(kind: OperationKind) -> CoreError {
    let message = format!("{} on a closed connection", kind.message);
    CoreError::new(CLOSED_CODE, message).with_category(ErrorCategory::Aborted)
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::InvalidInput | ErrorKind::AddrNotAvailable => ErrorCategory::InvalidArgument,
        ErrorKind::PermissionDenied | ErrorKind::Unsupported | ErrorKind::AddrInUse => {
            ErrorCategory::InvalidState
        }
        ErrorKind::OutOfMemory => ErrorCategory::ResourceExhausted,
        _ => ErrorCategory::Communication,
    }
}

/// `net.tcp://host[:port]/path` 形式地址的解析失败。
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("`{0}` is not a net.tcp address")]
    UnsupportedScheme(String),
    #[error("`{0}` has no host")]
    MissingHost(String),
    #[error("`{0}` has an invalid port")]
    InvalidPort(String),
}

impl From<AddressError> for CoreError {
    fn from(error: AddressError) -> Self {
        CoreError::new(ADDRESS_CODE, error.to_string())
            .with_category(ErrorCategory::InvalidArgument)
            .with_cause(error)
    }
}
