/// Single-shot request/response surface and its watching decorator.
///
/// [`WatchedClient`] sits in front of any [`Transport`].  Requests and
/// responses pass through unchanged; the only thing added is round tracking
/// for calls the [`Monitor`] decides to watch.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use thiserror::Error;

use crate::monitor::{Monitor, RoundHandle, Surface};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("response body read failed: {0}")]
pub struct BodyError(pub String);

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), headers: HeaderMap::new(), body: None }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

pub enum ResponseBody {
    /// Chunks as they arrive from the wire.
    Streaming(BoxStream<'static, Result<Bytes, BodyError>>),
    /// A body that is only available as a whole.
    Buffered(Bytes),
}

impl ResponseBody {
    /// Collects the whole body.
    pub async fn bytes(self) -> Result<Bytes, BodyError> {
        match self {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Streaming(mut stream) => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Streaming(_) => f.write_str("Streaming(..)"),
            ResponseBody::Buffered(b) => write!(f, "Buffered({} bytes)", b.len()),
        }
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl HttpResponse {
    /// Status in [200, 400).
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status.as_u16())
    }
}

/// A network client the host sends its requests through.
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Self::Error>;

    /// Whether `error` is the caller cancelling the call rather than a
    /// network or server failure.
    fn is_cancellation(&self, _error: &Self::Error) -> bool {
        false
    }

    /// Marker for transports that already track rounds.
    fn is_watched(&self) -> bool {
        false
    }
}

/// [`Transport`] over a `reqwest::Client`, with a streaming body.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    type Error = reqwest::Error;

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, reqwest::Error> {
        let mut builder = self
            .client
            .request(request.method, request.url.as_str())
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| BodyError(e.to_string())))
            .boxed();
        Ok(HttpResponse { status, headers, body: ResponseBody::Streaming(body) })
    }
}

/// Decorator that tracks watched calls on `T`.
///
/// Wrapping a transport that is already watched produces a pass-through
/// layer, so a call is never tracked twice.
pub struct WatchedClient<T> {
    inner: T,
    monitor: Arc<Monitor>,
    passthrough: bool,
}

impl<T: Transport> WatchedClient<T> {
    pub fn new(inner: T, monitor: Arc<Monitor>) -> Self {
        let passthrough = inner.is_watched();
        if passthrough {
            tracing::debug!("transport is already watched, wrapper passes through");
        }
        Self { inner, monitor, passthrough }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Sends `request` through the inner transport.  The response is
    /// returned as soon as the inner transport yields it; its body is
    /// inspected in the background.  Errors are returned unchanged.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, T::Error> {
        if self.passthrough {
            return self.inner.send(request).await;
        }
        let Some(round) = self.monitor.begin(Surface::Request, request.method.as_str(), &request.url)
        else {
            return self.inner.send(request).await;
        };

        // If this future is dropped while waiting, `round` goes with it and
        // is closed as an abort.
        match self.inner.send(request).await {
            Ok(response) => Ok(observe(response, round)),
            Err(err) => {
                if self.inner.is_cancellation(&err) {
                    round.abort("request cancelled");
                } else {
                    round.finish(false, "request network error");
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for WatchedClient<T> {
    type Error = T::Error;

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, T::Error> {
        self.execute(request).await
    }

    fn is_cancellation(&self, error: &T::Error) -> bool {
        self.inner.is_cancellation(error)
    }

    fn is_watched(&self) -> bool {
        true
    }
}

fn observe(response: HttpResponse, round: RoundHandle) -> HttpResponse {
    let succeeded = response.is_success();
    let HttpResponse { status, headers, body } = response;

    let body = match body {
        ResponseBody::Buffered(bytes) => {
            if !String::from_utf8_lossy(&bytes).trim().is_empty() {
                round.mark_content();
            }
            round.finish(succeeded, &format!("request len={}", bytes.len()));
            ResponseBody::Buffered(bytes)
        }
        ResponseBody::Streaming(stream) => ResponseBody::Streaming(tee(stream, round, succeeded)),
    };
    HttpResponse { status, headers, body }
}

/// Splits `upstream` in two: the returned stream yields every item
/// unchanged, while a background task watches the same items and closes the
/// round once the body is fully drained.  The task keeps draining even if the
/// caller stops reading.
fn tee(
    mut upstream: BoxStream<'static, Result<Bytes, BodyError>>,
    round: RoundHandle,
    succeeded: bool,
) -> BoxStream<'static, Result<Bytes, BodyError>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::debug!(round = %round.id(), "no tokio runtime, body is watched as it is read");
        return watch_inline(upstream, round, succeeded);
    };
    let (tx, rx) = mpsc::unbounded();

    runtime.spawn(async move {
        let mut bytes = 0usize;
        let reason = loop {
            match upstream.next().await {
                Some(Ok(chunk)) => {
                    if !chunk.is_empty() {
                        bytes += chunk.len();
                        round.mark_content();
                    }
                    // A closed receiver only means the caller stopped reading.
                    let _ = tx.unbounded_send(Ok(chunk));
                }
                Some(Err(e)) => {
                    tracing::debug!(round = %round.id(), error = %e, "body read failed");
                    let _ = tx.unbounded_send(Err(e));
                    break format!("request read err bytes={bytes}");
                }
                None => break format!("request bytes={bytes}"),
            }
        };
        round.finish(succeeded, &reason);
        drop(tx);
    });

    rx.boxed()
}

/// Watches the body on the caller's own reads.  Used when there is no runtime
/// to drain it in the background; dropping the stream early is an abort.
fn watch_inline(
    upstream: BoxStream<'static, Result<Bytes, BodyError>>,
    round: RoundHandle,
    succeeded: bool,
) -> BoxStream<'static, Result<Bytes, BodyError>> {
    stream::unfold((upstream, Some(round), 0usize), move |(mut upstream, mut round, mut bytes)| async move {
        let item = upstream.next().await;
        match &item {
            Some(Ok(chunk)) if !chunk.is_empty() => {
                bytes += chunk.len();
                if let Some(round) = &round {
                    round.mark_content();
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                if let Some(round) = round.take() {
                    tracing::debug!(round = %round.id(), error = %e, "body read failed");
                    round.finish(succeeded, &format!("request read err bytes={bytes}"));
                }
            }
            None => {
                if let Some(round) = round.take() {
                    round.finish(succeeded, &format!("request bytes={bytes}"));
                }
            }
        }
        item.map(|item| (item, (upstream, round, bytes)))
    })
    .boxed()
}
