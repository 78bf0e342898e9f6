/// Event-driven call surface: a request object that is opened, sent, and then
/// reports its lifecycle as a stream of [`CallEvent`]s.
///
/// [`WatchedCall`] wraps such an object.  The events reach the consumer
/// unchanged; the watcher only looks at them on the way through.
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::Stream;

use crate::monitor::{Monitor, RoundHandle, Surface};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// Part of the response body arrived.
    Progress(Bytes),
    /// The call finished and a status is available.
    Completed { status: u16, body: String },
    /// Network-level failure.
    Error(String),
    Timeout,
    /// The caller cancelled the call.
    Abort,
}

pub trait EventCall {
    type Events: Stream<Item = CallEvent> + Unpin;

    fn open(&mut self, method: &str, url: &str);

    fn send(&mut self, body: Option<Bytes>) -> Self::Events;

    /// Marker for calls that already track rounds.
    fn is_watched(&self) -> bool {
        false
    }
}

pub struct WatchedCall<C> {
    inner: C,
    monitor: Arc<Monitor>,
    /// Method and URL from the last `open`.
    meta: Option<(String, String)>,
    passthrough: bool,
}

impl<C: EventCall> WatchedCall<C> {
    pub fn new(inner: C, monitor: Arc<Monitor>) -> Self {
        let passthrough = inner.is_watched();
        Self { inner, monitor, meta: None, passthrough }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: EventCall> EventCall for WatchedCall<C> {
    type Events = WatchedEvents<C::Events>;

    fn open(&mut self, method: &str, url: &str) {
        self.meta = Some((method.to_ascii_uppercase(), url.to_string()));
        self.inner.open(method, url);
    }

    fn send(&mut self, body: Option<Bytes>) -> WatchedEvents<C::Events> {
        let round = match (&self.meta, self.passthrough) {
            (Some((method, url)), false) => self.monitor.begin(Surface::EventCall, method, url),
            _ => None,
        };
        WatchedEvents { inner: self.inner.send(body), round }
    }

    fn is_watched(&self) -> bool {
        true
    }
}

/// Forwards every event of `S` and closes the round on the first terminal
/// one.  Later terminal events are ignored.
pub struct WatchedEvents<S> {
    inner: S,
    round: Option<RoundHandle>,
}

impl<S> WatchedEvents<S> {
    pub fn is_tracking(&self) -> bool {
        self.round.is_some()
    }

    fn observe(&mut self, event: &CallEvent) {
        if let CallEvent::Progress(chunk) = event {
            if let Some(round) = &self.round {
                if !chunk.is_empty() {
                    round.mark_content();
                }
            }
            return;
        }
        let Some(round) = self.round.take() else {
            return;
        };
        match event {
            CallEvent::Progress(_) => {}
            CallEvent::Completed { status, body } => {
                let ok = (200..400).contains(status);
                if !body.trim().is_empty() {
                    round.mark_content();
                }
                round.finish(ok, &format!("event status={status} len={}", body.len()));
            }
            CallEvent::Error(message) => {
                tracing::debug!(round = %round.id(), %message, "event call error");
                round.finish(false, "event error");
            }
            CallEvent::Timeout => {
                round.finish(false, "event timeout");
            }
            CallEvent::Abort => {
                round.abort("event abort");
            }
        }
    }
}

impl<S> Stream for WatchedEvents<S>
where
    S: Stream<Item = CallEvent> + Unpin,
{
    type Item = CallEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<CallEvent>> {
        let this = self.get_mut();
        let item = ready!(Pin::new(&mut this.inner).poll_next(cx));
        match &item {
            Some(event) => this.observe(event),
            None => {
                if let Some(round) = this.round.take() {
                    round.finish(false, "event stream ended without completion");
                }
            }
        }
        Poll::Ready(item)
    }
}
