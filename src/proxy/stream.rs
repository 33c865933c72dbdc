use crate::error::STATUS_CLIENT_CLOSED_REQUEST;
use crate::proxy::context::{access_log_enabled, AccessLogSetting, BoxBody, BoxError};
use crate::scheduler::QueuePermit;
use bytes::Bytes;
use http_body::{Body, Frame};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

/// Everything that must happen exactly once when a response finishes —
/// on EOF, on a copy error, or when the client goes away mid-stream:
/// access log line, response counter, span closure, release of per-route
/// queue slots.
pub struct StreamFinish {
    pub route_id: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub status: u16,
    pub client_addr: SocketAddr,
    pub start: Instant,
    pub access_log: Option<AccessLogSetting>,
    pub access_log_disabled: bool,
    pub span: tracing::Span,
    /// Held until response completion; dropping releases the slots.
    pub lifo_permits: Vec<QueuePermit>,
}

impl StreamFinish {
    /// Run the finish actions immediately. Used when the response will
    /// never be streamed through the wrapper (hijacked upgrade tunnels).
    pub fn complete_now(self) {
        self.complete(StreamOutcome::Eof);
    }

    fn complete(self, outcome: StreamOutcome) {
        let status = match outcome {
            StreamOutcome::Canceled => STATUS_CLIENT_CLOSED_REQUEST,
            _ => self.status,
        };

        self.span.record("http.status_code", u64::from(status));
        match outcome {
            StreamOutcome::Eof => {}
            StreamOutcome::Error => {
                self.span.record("error", true);
            }
            StreamOutcome::Canceled => {
                self.span.record("error", true);
                self.span.record("client.request", "canceled");
            }
        }

        let method = self.method.clone();
        metrics::counter!(format!(
            "response.{}.{}.{}",
            status,
            method,
            if self.route_id.is_empty() {
                "unknown"
            } else {
                self.route_id.as_str()
            }
        ))
        .increment(1);

        if access_log_enabled(self.access_log.as_ref(), self.access_log_disabled, status) {
            tracing::info!(
                client_ip = %self.client_addr.ip(),
                method = %self.method,
                host = %self.host,
                path = %self.path,
                status = status,
                route = %self.route_id,
                latency_ms = %self.start.elapsed().as_millis(),
                "access"
            );
        }
    }
}

enum StreamOutcome {
    Eof,
    Error,
    Canceled,
}

/// Response body instrumentation: counts streamed bytes, enforces the
/// per-request backend deadline, reports copy errors, and guarantees the
/// finish actions run exactly once whatever way the stream ends.
pub struct StreamingBody {
    inner: BoxBody,
    finish: Option<StreamFinish>,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
    log_stream_events: bool,
    bytes_streamed: u64,
}

impl StreamingBody {
    /// Wrap `resp`'s body. `deadline` bounds how long streaming may take
    /// (the backendTimeout contract); `None` streams until EOF.
    pub fn wrap(
        resp: hyper::Response<BoxBody>,
        finish: StreamFinish,
        deadline: Option<Instant>,
        log_stream_events: bool,
    ) -> hyper::Response<BoxBody> {
        if log_stream_events {
            tracing::trace!(route = %finish.route_id, "streamHeaders end");
        }
        let (parts, inner) = resp.into_parts();
        let body = StreamingBody {
            inner,
            finish: Some(finish),
            deadline: deadline.map(|at| Box::pin(tokio::time::sleep_until(at.into()))),
            log_stream_events,
            bytes_streamed: 0,
        };
        hyper::Response::from_parts(parts, BoxBody::new(body))
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        if let Some(finish) = self.finish.take() {
            finish.complete(outcome);
        }
    }
}

impl Body for StreamingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                let route_id = this
                    .finish
                    .as_ref()
                    .map(|f| f.route_id.clone())
                    .unwrap_or_default();
                tracing::error!(
                    route = %route_id,
                    "error while copying the response stream: context deadline exceeded"
                );
                metrics::counter!(format!("errors.streaming.{}", route_id)).increment(1);
                this.finish(StreamOutcome::Error);
                return Poll::Ready(Some(Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "context deadline exceeded",
                )))));
            }
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes_streamed += data.len() as u64;
                    if this.log_stream_events {
                        tracing::trace!(bytes = this.bytes_streamed, "streamBody.byte");
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                let route_id = this
                    .finish
                    .as_ref()
                    .map(|f| f.route_id.clone())
                    .unwrap_or_default();
                tracing::error!(
                    route = %route_id,
                    "error while copying the response stream: {}",
                    e
                );
                metrics::counter!(format!("errors.streaming.{}", route_id)).increment(1);
                if this.log_stream_events {
                    tracing::trace!("streamBody error");
                }
                this.finish(StreamOutcome::Error);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(StreamOutcome::Eof);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for StreamingBody {
    fn drop(&mut self) {
        // Dropped before EOF: the client stopped reading. The response
        // status recorded for logging is 499.
        self.finish(StreamOutcome::Canceled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::full_body;
    use http_body_util::BodyExt;
    use std::time::Duration;

    fn finish_for(route: &str) -> StreamFinish {
        StreamFinish {
            route_id: route.to_string(),
            method: "GET".to_string(),
            host: "t".to_string(),
            path: "/".to_string(),
            status: 200,
            client_addr: "127.0.0.1:4000".parse().unwrap(),
            start: Instant::now(),
            access_log: None,
            access_log_disabled: true,
            span: tracing::Span::none(),
            lifo_permits: Vec::new(),
        }
    }

    fn response_with_body(body: BoxBody) -> hyper::Response<BoxBody> {
        hyper::Response::builder().status(200).body(body).unwrap()
    }

    #[tokio::test]
    async fn test_streams_body_through_unchanged() {
        let resp = response_with_body(full_body("hello world"));
        let wrapped = StreamingBody::wrap(resp, finish_for("r1"), None, false);
        let bytes = wrapped.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn test_deadline_cuts_stalled_stream() {
        // A body that yields one chunk and then stalls forever.
        let stalled = http_body_util::StreamBody::new(futures_util::stream::unfold(
            0u8,
            |state| async move {
                match state {
                    0 => Some((
                        Ok::<_, BoxError>(Frame::data(Bytes::from_static(b"Wish You"))),
                        1,
                    )),
                    _ => {
                        futures_util::future::pending::<()>().await;
                        None
                    }
                }
            },
        ));
        let resp = response_with_body(BoxBody::new(stalled));
        let deadline = Instant::now() + Duration::from_millis(50);
        let wrapped = StreamingBody::wrap(resp, finish_for("r1"), Some(deadline), false);

        let mut body = wrapped.into_body();
        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.data_ref().unwrap().as_ref(), b"Wish You");

        let err = body.frame().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("context deadline exceeded"));
    }

    #[tokio::test]
    async fn test_upstream_error_is_surfaced() {
        let failing = http_body_util::StreamBody::new(futures_util::stream::iter(vec![
            Ok::<_, BoxError>(Frame::data(Bytes::from_static(b"partial"))),
            Err::<Frame<Bytes>, _>("connection reset".into()),
        ]));
        let resp = response_with_body(BoxBody::new(failing));
        let wrapped = StreamingBody::wrap(resp, finish_for("r1"), None, false);

        let mut body = wrapped.into_body();
        assert!(body.frame().await.unwrap().is_ok());
        let err = body.frame().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_drop_before_eof_runs_finish_once() {
        // Dropping mid-stream must not panic and must release permits.
        let resp = response_with_body(full_body("data"));
        let wrapped = StreamingBody::wrap(resp, finish_for("r1"), None, false);
        drop(wrapped);
    }
}
