use async_trait::async_trait;
use spark_core::Result;

use crate::connection::BoxConnection;

/// 原始连接来源。
///
/// # 契约（What）
/// - `accept` 挂起直到下一条连接到达；监听器已关闭时返回 `Disposed` 分类错误；
/// - 单次接入失败（如对端在握手前重置）返回其他分类错误，调用方可继续下一轮 `accept`；
/// - 接入节流由 [`ConnectionAcceptor`](crate::ConnectionAcceptor) 负责，实现无需自行限流。
#[async_trait]
pub trait ConnectionListener: Send + Sync + 'static {
    async fn accept(&self) -> Result<BoxConnection>;

    /// 监听地址的可读描述，仅用于日志。
    fn local_label(&self) -> String;
}
