use std::io;

use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};
use tokio_util::sync::CancellationToken;

/// Relay bytes between two streams until both directions are closed or the
/// token is cancelled.
///
/// Returns the bytes copied `(a -> b, b -> a)`, or `None` when the relay was
/// cut short by cancellation.
pub(crate) async fn pipe<A, B>(
    a: &mut A,
    b: &mut B,
    cancel: &CancellationToken,
) -> io::Result<Option<(u64, u64)>>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        copied = copy_bidirectional(a, b) => copied.map(Some),
    }
}
