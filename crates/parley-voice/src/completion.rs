//! Shared completion handle for background voice operations.
//!
//! Recording, speech and auto-teardown all run as spawned tasks. Each hands
//! back a `Completion<T>` that resolves with the operation's result and can be
//! cancelled, so callers get one contract for errors and cancellation.

use crate::error::VoiceError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[must_use = "a completion does nothing unless awaited or cancelled"]
pub struct Completion<T> {
    handle: JoinHandle<Result<T, VoiceError>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> Completion<T> {
    /// Runs `operation` on the runtime. Cancelling drops it at its next await
    /// point and resolves the completion with `VoiceError::Cancelled`.
    pub(crate) fn spawn<F>(operation: F) -> Self
    where
        F: Future<Output = Result<T, VoiceError>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => Err(VoiceError::Cancelled),
                result = operation => result,
            }
        });
        Self { handle, cancel }
    }
}

impl<T> Completion<T> {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, VoiceError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) if e.is_cancelled() => Poll::Ready(Err(VoiceError::Cancelled)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(VoiceError::Task(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("finished", &self.handle.is_finished())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolves_with_operation_result() {
        let done = Completion::spawn(async { Ok::<_, VoiceError>(7) });
        assert_eq!(done.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn cancel_resolves_with_cancelled() {
        let pending = Completion::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, VoiceError>(())
        });
        pending.cancel();
        assert!(matches!(pending.await, Err(VoiceError::Cancelled)));
    }
}
