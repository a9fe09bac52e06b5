//! Single-result completions for blocking work.
//!
//! A [`Completion`] is the receiving half of a one-shot channel whose sender is owned by a
//! blocking task. The sender is consumed either by delivering the value or by being dropped when
//! the task unwinds, so every completion resolves exactly once: with the value, or with
//! [`Closed`].

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::oneshot;

/// The producing task went away without delivering a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("completion closed without a value")]
pub struct Closed;

/// The eventual result of a task started with [`spawn_blocking`].
#[derive(Debug)]
#[must_use = "completions do nothing unless awaited"]
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T, Closed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map_err(|_| Closed)
    }
}

/// Runs `f` on the blocking thread pool and returns a [`Completion`] for its result.
///
/// Dropping the completion does not cancel `f`; the value is discarded once produced.
pub fn spawn_blocking<F, T>(f: F) -> Completion<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();

    tokio::task::spawn_blocking(move || {
        // The receiver may already be gone for fire-and-forget calls.
        let _ = tx.send(f());
    });

    Completion { rx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completion_delivers_value() {
        let value = spawn_blocking(|| 40 + 2).await;
        assert_eq!(value, Ok(42));
    }

    #[tokio::test]
    async fn completion_closes_on_panic() {
        let res = spawn_blocking(|| -> u32 { panic!("boom") }).await;
        assert_eq!(res, Err(Closed));
    }
}
