//! Streaming relay: chunk-by-chunk passthrough with deferred logging.
//!
//! Once a 2xx status line has been written to the client, a mid-stream
//! failure cannot be retried; it is recorded on the request log instead.
//! The final record is emitted when the stream ends, errors, or the client
//! goes away (the stream is dropped).

use super::RequestContext;
use crate::group::GroupRoute;
use crate::logs::{RequestLogRecord, RequestLogService};
use crate::pool::KeyHandle;
use crate::server::Server;
use axum::{body::Body, response::Response};
use bytes::Bytes;
use chrono::Utc;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

struct PendingLog {
    logs: Arc<RequestLogService>,
    record: RequestLogRecord,
    start: Instant,
}

struct RelayStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    pending: Option<PendingLog>,
}

impl RelayStream {
    fn finish(&mut self, error: Option<String>) {
        if let Some(pending) = self.pending.take() {
            let mut record = pending.record;
            record.timestamp = Utc::now();
            record.duration_ms = pending.start.elapsed().as_millis() as i64;
            record.error_message = error;
            pending.logs.record(record);
        }
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                this.finish(Some(format!("mid-stream error: {e}")));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        // Client went away mid-relay; the partial transfer still gets its
        // log row.
        self.finish(Some("relay aborted before stream end".to_string()));
    }
}

/// Build the streamed client response. The status and headers mirror the
/// upstream; each chunk is forwarded as it arrives so SSE event boundaries
/// reach the client without buffering.
#[allow(clippy::too_many_arguments)]
pub(super) fn stream_response(
    server: &Server,
    route: &Arc<GroupRoute>,
    ctx: &RequestContext,
    response: reqwest::Response,
    model: &str,
    key: &KeyHandle,
    upstream_url: &str,
    retries: u32,
) -> Response {
    let status = response.status();
    let headers = crate::channel::transform::relayable_response_headers(response.headers());

    let record = RequestLogRecord {
        id: ctx.request_id.clone(),
        timestamp: Utc::now(),
        group_id: route.id(),
        group_name: route.name().to_string(),
        upstream_url: upstream_url.to_string(),
        key_hash: key.key_hash.clone(),
        key_value_encrypted: server.crypto.encrypt(&key.key_value).unwrap_or_default(),
        model: model.to_string(),
        status_code: status.as_u16() as i32,
        duration_ms: 0,
        is_stream: true,
        retries: retries as i32,
        error_message: None,
    };

    let relay = RelayStream {
        inner: Box::pin(response.bytes_stream()),
        pending: Some(PendingLog {
            logs: server.logs.clone(),
            record,
            start: ctx.start,
        }),
    };

    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder
        .body(Body::from_stream(relay))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
