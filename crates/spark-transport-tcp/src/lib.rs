#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-transport-tcp: 基于 Tokio 的 TCP 连接与监听器。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：分流器与客户端连接池只依赖 `spark-transport` 的 `Connection`/`ConnectionListener` 契约，TCP 细节在此落地。"]
#![doc = "- **What**：提供 [`TcpConnection`]、[`TcpConnectionListener`]、[`TcpSocketConfig`] 与 `net.tcp` 地址解析 [`TcpEndpoint`]。"]
#![doc = "- **How**：每个可挂起操作都在调用方的超时预算内执行；IO 错误按操作映射为稳定错误码，中止连接时以零 `SO_LINGER` 发送 RST。"]

mod address;
mod connection;
mod error;
mod listener;
mod util;

pub use address::{DEFAULT_NET_TCP_PORT, TcpEndpoint};
pub use connection::{TcpConnection, TcpSocketConfig};
pub use error::AddressError;
pub use listener::{TcpConnectionListener, TcpListenerBuilder};
