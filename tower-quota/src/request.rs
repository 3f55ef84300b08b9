use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use pin_project_lite::pin_project;
use quanta::Instant;
use tokio::sync::oneshot;
use tokio::time::Timeout;

use quota_queue::Grant;
use quota_queue::Waiter;

use crate::AdmitError;

/// What the controller answers on a caller's private slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Answer {
    Granted(Grant),
    Rejected(Option<Instant>),
}

/// A caller parked in an admission queue.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    expires_at: Instant,
    slot: oneshot::Sender<Answer>,
}

impl PendingRequest {
    pub(crate) fn new(expires_at: Instant) -> (Self, oneshot::Receiver<Answer>) {
        let (slot, receiver) = oneshot::channel();
        (Self { expires_at, slot }, receiver)
    }
}

impl Waiter for PendingRequest {
    fn expires_at(&self) -> Instant {
        self.expires_at
    }

    // A send only fails when the caller stopped waiting, which needs no handling.
    fn grant(self, grant: Grant) {
        let _ = self.slot.send(Answer::Granted(grant));
    }

    fn reject(self, retry_at: Option<Instant>) {
        let _ = self.slot.send(Answer::Rejected(retry_at));
    }
}

pin_project! {
    /// Resolves once the controller answers, or the caller's deadline passes.
    ///
    /// A request dropped from its queue on expiry closes the slot without an answer, which
    /// is reported as [`AdmitError::Timeout`].
    pub struct Acquire {
        #[pin]
        inner: Timeout<oneshot::Receiver<Answer>>,
        clock: quanta::Clock,
    }
}

impl Acquire {
    pub(crate) fn new(inner: Timeout<oneshot::Receiver<Answer>>, clock: quanta::Clock) -> Self {
        Self { inner, clock }
    }
}

impl Future for Acquire {
    type Output = Result<Grant, AdmitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(Ok(Answer::Granted(grant)))) => Poll::Ready(Ok(grant)),
            Poll::Ready(Ok(Ok(Answer::Rejected(retry_at)))) => {
                let now = this.clock.now();
                Poll::Ready(Err(AdmitError::RateLimited {
                    retry_after: retry_at.map(|at| at.saturating_duration_since(now)),
                }))
            }
            Poll::Ready(Ok(Err(_))) | Poll::Ready(Err(_)) => Poll::Ready(Err(AdmitError::Timeout)),
            Poll::Pending => Poll::Pending,
        }
    }
}
