//! Turns `ProxyError` and the orchestrator's `Receiver<Bytes>` streams into
//! axum responses.
//!
//! Grounded on the donor's `to_axum_response`/`wrap_sse_stream_with_heartbeat`
//! (`gproxy-router/src/proxy.rs`): same heartbeat cadence and frame, same
//! "unsubscribe on disconnect" behavior (dropping the `Receiver` end when the
//! axum body stream is dropped stops the forwarding task via a failed send).

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use cloudgate_core::ProxyError;

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";

/// `ProxyError` and axum's `IntoResponse` are both foreign to this crate, so
/// this is a free function rather than a trait impl.
pub fn error_response(err: ProxyError) -> Response {
    let status = StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, err.body).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// `spec.md` §4.7 "SSE writing": `text/event-stream`, `no-cache`,
/// `keep-alive`, one `data: <json>\n\n` frame per chunk, 15s heartbeats
/// wrapped around the upstream forwarding task so idle connections survive
/// intermediary timeouts.
pub fn sse_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let rx = wrap_with_heartbeat(rx);
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

fn wrap_with_heartbeat(mut upstream_rx: mpsc::Receiver<Bytes>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                maybe_chunk = upstream_rx.recv() => {
                    let Some(chunk) = maybe_chunk else { break };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(SSE_HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

pub fn json_response<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = (StatusCode::OK, body).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => error_response(ProxyError::new(500, format!("serialization failed: {err}"))),
    }
}
