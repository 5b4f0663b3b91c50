use crate::error::{OperationKind, TransportError, timeout_error};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::time::Instant;

/// 在可选截止时间内执行传输层 Future。
///
/// `timeout` 为 `None` 时不设上限；到期后丢弃 `future` 并返回 `Timeout` 错误，
/// 被丢弃的 Future 负责释放自己持有的连接或流。
pub(crate) async fn run_with_deadline<F, T>(
    timeout: Option<Duration>,
    kind: OperationKind,
    future: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    run_until(timeout.map(|timeout| Instant::now() + timeout), kind, future).await
}

/// 与 [`run_with_deadline`] 相同，但以绝对时刻表示截止时间，便于多个阶段共享同一期限。
pub(crate) async fn run_until<F, T>(
    deadline: Option<Instant>,
    kind: OperationKind,
    future: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    let Some(deadline) = deadline else {
        return future.await;
    };
    tokio::pin!(future);
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);
    tokio::select! {
        biased;
        _ = &mut sleep => Err(timeout_error(kind)),
        result = &mut future => result,
    }
}

/// 在截止时间内执行 IO Future，并用 `map` 把 IO 错误映射为传输错误。
pub(crate) async fn run_io_with_deadline<F, T>(
    timeout: Duration,
    kind: OperationKind,
    future: F,
    map: fn(OperationKind, io::Error) -> TransportError,
) -> Result<T, TransportError>
where
    F: Future<Output = io::Result<T>>,
{
    run_with_deadline(Some(timeout), kind, async move {
        future.await.map_err(|error| map(kind, error))
    })
    .await
}
