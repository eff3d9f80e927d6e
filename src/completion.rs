//! Waitable results for operations the engine completes later.
//!
//! A [`Completion`] is handed to the application, the matching [`Completer`]
//! stays with the engine. It can be waited on by blocking a thread or with
//! `.await`. Waiting with a timeout is a matter for the caller's runtime,
//! for example `tokio::time::timeout()`.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::channel::oneshot;

/// The terminal state of a [`Completion`]
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    Failure(Error),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Converts to a `Result`, cancellation becomes [`Error::Cancelled`]
    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Success(v) => Ok(v),
            Outcome::Failure(e) => Err(e),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }
}

/// The application side of a pending operation
pub struct Completion<T> {
    rx: oneshot::Receiver<Outcome<T>>,
    cancelled: Arc<AtomicBool>,
}

/// The engine side of a pending operation.
///
/// Dropping it without completing cancels the [`Completion`].
pub struct Completer<T> {
    tx: oneshot::Sender<Outcome<T>>,
    cancelled: Arc<AtomicBool>,
}

/// Creates a linked pair
pub(crate) fn pair<T>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    let cancelled = Arc::new(AtomicBool::new(false));
    (Completer { tx, cancelled: cancelled.clone() }, Completion { rx, cancelled })
}

impl<T> Completion<T> {
    /// A completion that has already finished
    pub(crate) fn ready(outcome: Outcome<T>) -> Self {
        let (c, w) = pair();
        c.complete(outcome);
        w
    }

    /// Marks the operation cancelled if it hasn't completed.
    ///
    /// The engine stops reporting to it. Protocol side effects
    /// already sent to the peer are not undone.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.rx.close();
        trace!("completion cancelled");
    }

    /// Takes the outcome if it is available
    pub fn try_take(&mut self) -> Option<Outcome<T>> {
        match self.rx.try_recv() {
            Ok(o) => o,
            Err(oneshot::Canceled) => Some(Outcome::Cancelled),
        }
    }

    /// Blocks the calling thread until completion.
    ///
    /// Must not be called from the thread that drives the engine.
    pub fn wait(self) -> Outcome<T> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for Completion<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or(Outcome::Cancelled))
    }
}

impl<T> core::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Completion").field("cancelled", &self.cancelled.load(Ordering::Relaxed)).finish()
    }
}

impl<T> Completer<T> {
    pub fn success(self, v: T) {
        self.complete(Outcome::Success(v))
    }

    pub fn fail(self, e: Error) {
        self.complete(Outcome::Failure(e))
    }

    pub fn cancel(self) {
        self.complete(Outcome::Cancelled)
    }

    pub fn complete(self, outcome: Outcome<T>) {
        if self.tx.send(outcome).is_err() {
            trace!("completion no longer wanted");
        }
    }

    /// The application called [`Completion::cancel()`]. A dropped
    /// `Completion` doesn't count, the operation still runs.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl<T> core::fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Completer").field("cancelled", &self.is_cancelled()).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::completion::*;
    use crate::dusklog::init_test_log;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn success_across_threads() {
        init_test_log();
        let (c, w) = pair::<u32>();
        let t = thread::spawn(move || w.wait());
        thread::sleep(Duration::from_millis(10));
        c.success(7);
        assert!(matches!(t.join().unwrap(), Outcome::Success(7)));
    }

    #[test]
    fn dropped_completer_cancels() {
        let (c, mut w) = pair::<()>();
        assert!(w.try_take().is_none());
        drop(c);
        assert!(matches!(w.try_take(), Some(Outcome::Cancelled)));
        assert!(matches!(w.wait(), Outcome::Cancelled));
    }

    #[test]
    fn cancel_wins_over_late_completion() {
        let (c, mut w) = pair::<()>();
        w.cancel();
        assert!(c.is_cancelled());
        c.fail(Error::RequestFailed);
        assert!(matches!(w.wait(), Outcome::Cancelled));
    }

    #[test]
    fn cancel_after_completion_keeps_outcome() {
        let (c, mut w) = pair::<u8>();
        c.success(2);
        w.cancel();
        assert!(matches!(w.wait(), Outcome::Success(2)));
    }

    #[test]
    fn dropped_completion_is_not_cancelled() {
        let (c, w) = pair::<()>();
        drop(w);
        assert!(!c.is_cancelled());
        c.success(());
    }

    #[test]
    fn ready_and_into_result() {
        let w = Completion::ready(Outcome::<()>::Failure(Error::AuthFailed));
        assert!(matches!(w.wait().into_result(), Err(Error::AuthFailed)));
        let w = Completion::ready(Outcome::<()>::Cancelled);
        assert!(matches!(w.wait().into_result(), Err(Error::Cancelled)));
    }

    #[test]
    fn poll_as_future() {
        struct Flag(AtomicBool);
        impl std::task::Wake for Flag {
            fn wake(self: Arc<Self>) {
                self.0.store(true, Ordering::SeqCst)
            }
        }
        let flag = Arc::new(Flag(false.into()));
        let waker = std::task::Waker::from(flag.clone());
        let mut cx = Context::from_waker(&waker);

        let (c, mut w) = pair::<u8>();
        assert!(Pin::new(&mut w).poll(&mut cx).is_pending());
        c.success(3);
        assert!(flag.0.load(Ordering::SeqCst));
        assert!(matches!(Pin::new(&mut w).poll(&mut cx), Poll::Ready(Outcome::Success(3))));
    }
}
