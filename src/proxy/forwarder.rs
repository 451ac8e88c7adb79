//! Plain-HTTP request forwarding with response byte accounting.
//!
//! Mounted as the control router's fallback, so any request that is not an
//! API call is treated as a proxied request. The response streams back to
//! the client through a counting body; the observation is recorded only
//! when the stream completes cleanly.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{info, warn};

use crate::api::AppState;
use crate::proxy::strip_port;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound client for forwarded requests. The total per-request timeout
/// covers connect, request, and response body.
pub fn forward_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(FORWARD_TIMEOUT).build()
}

pub async fn forward_http(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let host_header = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let raw_host = if !host_header.is_empty() {
        host_header
    } else {
        parts.uri.authority().map(|a| a.as_str()).unwrap_or("")
    };
    let host = strip_port(raw_host).to_string();
    if host.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing host").into_response();
    }

    if let Some(geo) = &state.geo {
        geo.record_host_async(&host);
    }

    if state.blocklist.is_blocked(&host) {
        info!("blocked HTTP request for {host}");
        state.accumulator.record(&host, true, 0, false).await;
        return (StatusCode::FORBIDDEN, "Blocked").into_response();
    }

    // Absolute-form targets carry the full URL; origin-form ones are
    // reassembled from the Host header.
    let url = if parts.uri.scheme().is_some() {
        parts.uri.to_string()
    } else {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("http://{raw_host}{path}")
    };

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("unreadable request body for {host}: {e}");
            return (StatusCode::BAD_REQUEST, "unreadable request body").into_response();
        }
    };

    let mut headers = parts.headers.clone();
    for name in [header::HOST, header::CONNECTION, header::TRANSFER_ENCODING] {
        headers.remove(name);
    }
    headers.remove("proxy-connection");
    headers.remove("keep-alive");

    let upstream = match state
        .forward_client
        .request(parts.method.clone(), &url)
        .headers(headers)
        .body(body_bytes)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            warn!("upstream request for {host} failed: {e}");
            return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
        }
    };

    let status = upstream.status();
    let mut resp_headers = upstream.headers().clone();
    resp_headers.remove(header::CONNECTION);
    resp_headers.remove(header::TRANSFER_ENCODING);

    let accumulator = Arc::clone(&state.accumulator);
    let counted = CountingStream::new(upstream.bytes_stream(), move |written| {
        tokio::spawn(async move {
            accumulator.record(&host, false, written, true).await;
        });
    });

    let mut response = Response::new(Body::from_stream(counted));
    *response.status_mut() = status;
    *response.headers_mut() = resp_headers;
    response
}

/// Byte-counting stream wrapper. The completion hook fires once, on clean
/// end of stream; a mid-stream error or an early drop accounts nothing.
struct CountingStream<S, F> {
    inner: Pin<Box<S>>,
    written: u64,
    on_complete: Option<F>,
}

impl<S, F> CountingStream<S, F> {
    fn new(inner: S, on_complete: F) -> Self {
        Self {
            inner: Box::pin(inner),
            written: 0,
            on_complete: Some(on_complete),
        }
    }
}

impl<S, E, F> Stream for CountingStream<S, F>
where
    S: Stream<Item = Result<Bytes, E>>,
    F: FnOnce(u64) + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.written += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.on_complete = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(hook) = this.on_complete.take() {
                    hook(this.written);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::io;
    use std::sync::mpsc;

    #[tokio::test]
    async fn counts_bytes_and_fires_on_clean_completion() {
        let chunks: Vec<Result<Bytes, io::Error>> =
            vec![Ok(Bytes::from_static(b"hel")), Ok(Bytes::from_static(b"lo"))];
        let (tx, rx) = mpsc::channel();

        let mut counted = CountingStream::new(futures_util::stream::iter(chunks), move |n: u64| {
            tx.send(n).unwrap();
        });

        let mut collected = Vec::new();
        while let Some(chunk) = counted.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(collected, b"hello");
        assert_eq!(rx.recv().unwrap(), 5);
    }

    #[tokio::test]
    async fn mid_stream_error_accounts_nothing() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let (tx, rx) = mpsc::channel();

        let mut counted = CountingStream::new(futures_util::stream::iter(chunks), move |n: u64| {
            tx.send(n).unwrap();
        });

        assert!(counted.next().await.unwrap().is_ok());
        assert!(counted.next().await.unwrap().is_err());
        assert!(counted.next().await.is_none());

        assert!(rx.try_recv().is_err(), "hook must not fire after an error");
    }

    #[tokio::test]
    async fn dropped_stream_accounts_nothing() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![Ok(Bytes::from_static(b"abc"))];
        let (tx, rx) = mpsc::channel();

        let counted = CountingStream::new(futures_util::stream::iter(chunks), move |n: u64| {
            tx.send(n).unwrap();
        });
        drop(counted);

        assert!(rx.try_recv().is_err());
    }
}
