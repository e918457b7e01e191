use std::future::Future;
use std::io;

use spark_core::{CoreError, TimeoutBudget};

use crate::error::{OperationKind, map_io_error, timeout_error};

/// 在预算内执行 IO Future，超时与 IO 错误都带上操作对应的错误码。
///
/// 预算在进入前已耗尽时不会轮询 `future`。
pub(crate) async fn run_with_budget<F, T>(
    budget: TimeoutBudget,
    kind: OperationKind,
    future: F,
) -> Result<T, CoreError>
where
    F: Future<Output = io::Result<T>>,
{
    if budget.is_expired() {
        return Err(timeout_error(kind));
    }
    if budget.is_infinite() {
        return future.await.map_err(|err| map_io_error(kind, err));
    }
    match tokio::time::timeout(budget.remaining(), future).await {
        Ok(result) => result.map_err(|err| map_io_error(kind, err)),
        Err(_) => Err(timeout_error(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::READ;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn expired_budget_never_polls_future() {
        let err = run_with_budget::<_, ()>(TimeoutBudget::expired(), READ, async {
            unreachable!("future must not be polled")
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_io_times_out_with_operation_code() {
        let err = run_with_budget(
            TimeoutBudget::new(Duration::from_millis(20)),
            READ,
            std::future::pending::<io::Result<()>>(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), crate::error::TIMEOUT_CODE);
        assert!(err.is_timeout());
    }
}
