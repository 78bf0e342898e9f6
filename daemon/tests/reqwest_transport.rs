//! Drives `WatchedClient<ReqwestTransport>` against a throwaway HTTP/1.1
//! responder on localhost.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fail_ding::audio::{AudioError, AudioSink};
use fail_ding::{Classifier, HttpRequest, Monitor, MonitorSettings, ReqwestTransport, RoundOutcome, WatchedClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

#[derive(Default)]
struct CountingSink {
    plays: AtomicUsize,
}

impl AudioSink for CountingSink {
    fn play_alert(&self) -> Result<(), AudioError> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

const STREAMED_HELLO: &str = "HTTP/1.1 200 OK\r\n\
Content-Type: text/event-stream\r\n\
Transfer-Encoding: chunked\r\n\
Connection: close\r\n\r\n\
5\r\nhello\r\n0\r\n\r\n";

const EMPTY_500: &str = "HTTP/1.1 500 Internal Server Error\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

/// Accepts one connection, reads the full request, writes `response`, closes.
async fn serve_once(response: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
    });

    format!("http://{addr}")
}

async fn read_request(socket: &mut tokio::net::TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let content_length = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= head_end + 4 + content_length {
            return;
        }
    }
}

fn setup() -> (WatchedClient<ReqwestTransport>, Arc<CountingSink>, broadcast::Receiver<RoundOutcome>) {
    let sink = Arc::new(CountingSink::default());
    let monitor = Monitor::new(MonitorSettings::default(), Classifier::builtin(), sink.clone());
    let outcomes = monitor.subscribe();
    (WatchedClient::new(ReqwestTransport::default(), monitor), sink, outcomes)
}

async fn next_outcome(rx: &mut broadcast::Receiver<RoundOutcome>) -> RoundOutcome {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("round was never closed")
        .unwrap()
}

#[tokio::test]
async fn streamed_generation_is_quiet() {
    let base = serve_once(STREAMED_HELLO).await;
    let (client, sink, mut outcomes) = setup();

    let request = client
        .monitor()
        .intercept(HttpRequest::post(format!("{base}/api/openai/chat/completions")).with_body("{}"));
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(&response.body.bytes().await.unwrap()[..], b"hello");

    let out = next_outcome(&mut outcomes).await;
    assert!(out.succeeded);
    assert!(out.got_content);
    assert!(!out.notified);
    assert_eq!(sink.plays.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_server_error_alerts() {
    let base = serve_once(EMPTY_500).await;
    let (client, sink, mut outcomes) = setup();

    let request = client
        .monitor()
        .intercept(HttpRequest::post(format!("{base}/api/openai/chat/completions")).with_body("{}"));
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status.as_u16(), 500);

    let out = next_outcome(&mut outcomes).await;
    assert!(!out.succeeded);
    assert!(out.notified);
    assert_eq!(sink.plays.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connection_refused_alerts_and_returns_the_reqwest_error() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (client, sink, mut outcomes) = setup();

    client.monitor().arm();
    let err = client
        .execute(HttpRequest::post(format!("http://{addr}/api/openai/chat/completions")))
        .await
        .unwrap_err();
    assert!(err.is_connect() || err.is_request());

    let out = next_outcome(&mut outcomes).await;
    assert_eq!(out.reason, "request network error");
    assert_eq!(sink.plays.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn character_endpoint_is_not_watched() {
    let base = serve_once(EMPTY_500).await;
    let (client, sink, mut outcomes) = setup();

    client.monitor().arm();
    let response = client
        .execute(HttpRequest::post(format!("{base}/api/characters/123")))
        .await
        .unwrap();
    assert_eq!(response.status.as_u16(), 500);
    assert!(outcomes.try_recv().is_err());
    assert_eq!(sink.plays.load(Ordering::SeqCst), 0);
}
