use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use std::fmt;

/// Classified request-path failures. Every error the proxy can produce while
/// serving a request maps to exactly one kind, and each kind maps to one
/// downstream status (plus optional extra header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorKind {
    /// No priority route or router entry matched.
    RouteLookupFailed,
    /// A rate limiter denied the request.
    Ratelimited,
    /// The circuit breaker for the target host is open.
    CircuitOpen,
    /// A LIFO queue rejected the request because it was at capacity.
    QueueFull,
    /// A LIFO queue rejected the request because the wait timed out.
    QueueTimeout,
    /// The outbound connection could not be established (refused / DNS).
    DialingFailed,
    /// The backend did not answer within the response deadline.
    BackendTimeout,
    /// Any other transport-level failure talking to the backend.
    BackendTransport,
    /// The downstream client went away while we were serving it.
    ClientCanceled,
    /// Loopback recursion exceeded the configured bound.
    MaxLoopbacksReached,
    /// The incoming request body was malformed or aborted mid-read.
    InvalidRequestBody,
    /// The response was already written (e.g. a hijacked upgrade tunnel);
    /// the error mapper must not touch the connection again.
    Handled,
    /// Catch-all; maps to 500.
    Internal,
}

/// The tagged error that drives final status mapping.
#[derive(Debug, Clone)]
pub struct ProxyError {
    pub kind: ProxyErrorKind,
    /// Human-readable cause, used for logs and the debug-mode document.
    pub reason: String,
    /// Extra response headers attached by the mapper (`X-Circuit-Open`,
    /// `X-Rate-Limit`, `Retry-After`, ...).
    pub additional_headers: Vec<(HeaderName, HeaderValue)>,
}

/// Status used for logging when the client disconnected; nginx convention.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

impl ProxyError {
    pub fn new(kind: ProxyErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            additional_headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.additional_headers.push((name, value));
        self
    }

    /// The downstream status this error maps to. `RouteLookupFailed` is the
    /// one kind whose status is configuration-dependent, so the configured
    /// default is passed in.
    pub fn status(&self, default_http_status: StatusCode) -> StatusCode {
        match self.kind {
            ProxyErrorKind::RouteLookupFailed => default_http_status,
            ProxyErrorKind::Ratelimited => StatusCode::TOO_MANY_REQUESTS,
            ProxyErrorKind::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorKind::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorKind::QueueTimeout => StatusCode::BAD_GATEWAY,
            ProxyErrorKind::DialingFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorKind::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorKind::BackendTransport => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorKind::ClientCanceled => {
                StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ProxyErrorKind::MaxLoopbacksReached => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorKind::InvalidRequestBody => StatusCode::BAD_REQUEST,
            ProxyErrorKind::Handled => StatusCode::OK,
            ProxyErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this failure deserves an error-level log line. Expected
    /// traffic-shaping outcomes and client disconnects stay at info/debug.
    pub fn log_as_error(&self) -> bool {
        !matches!(
            self.kind,
            ProxyErrorKind::RouteLookupFailed
                | ProxyErrorKind::Ratelimited
                | ProxyErrorKind::CircuitOpen
                | ProxyErrorKind::QueueFull
                | ProxyErrorKind::QueueTimeout
                | ProxyErrorKind::ClientCanceled
                | ProxyErrorKind::Handled
        )
    }

    /// Retry eligibility: only a dial-level failure is safe to replay, and
    /// only when the request carried no body (checked by the dispatcher).
    pub fn is_dialing_failure(&self) -> bool {
        self.kind == ProxyErrorKind::DialingFailed
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ProxyErrorKind::RouteLookupFailed => write!(f, "route lookup failed"),
            ProxyErrorKind::Ratelimited => write!(f, "ratelimited: {}", self.reason),
            ProxyErrorKind::CircuitOpen => write!(f, "circuit breaker open: {}", self.reason),
            ProxyErrorKind::QueueFull => write!(f, "queue full: {}", self.reason),
            ProxyErrorKind::QueueTimeout => write!(f, "queue timeout: {}", self.reason),
            ProxyErrorKind::DialingFailed => write!(f, "dialing failed: {}", self.reason),
            ProxyErrorKind::BackendTimeout => write!(f, "backend timeout: {}", self.reason),
            ProxyErrorKind::BackendTransport => write!(f, "backend error: {}", self.reason),
            ProxyErrorKind::ClientCanceled => write!(f, "client canceled: {}", self.reason),
            ProxyErrorKind::MaxLoopbacksReached => write!(f, "max loopbacks reached"),
            ProxyErrorKind::InvalidRequestBody => {
                write!(f, "invalid request body: {}", self.reason)
            }
            ProxyErrorKind::Handled => write!(f, "handled"),
            ProxyErrorKind::Internal => write!(f, "internal error: {}", self.reason),
        }
    }
}

impl std::error::Error for ProxyError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let default = StatusCode::NOT_FOUND;
        let cases = [
            (ProxyErrorKind::RouteLookupFailed, 404),
            (ProxyErrorKind::Ratelimited, 429),
            (ProxyErrorKind::CircuitOpen, 503),
            (ProxyErrorKind::QueueFull, 503),
            (ProxyErrorKind::QueueTimeout, 502),
            (ProxyErrorKind::DialingFailed, 502),
            (ProxyErrorKind::BackendTimeout, 504),
            (ProxyErrorKind::BackendTransport, 503),
            (ProxyErrorKind::ClientCanceled, 499),
            (ProxyErrorKind::MaxLoopbacksReached, 500),
            (ProxyErrorKind::InvalidRequestBody, 400),
            (ProxyErrorKind::Internal, 500),
        ];
        for (kind, expect) in cases {
            let err = ProxyError::new(kind, "test");
            assert_eq!(err.status(default).as_u16(), expect, "kind {:?}", kind);
        }
    }

    #[test]
    fn test_configured_default_status() {
        let err = ProxyError::new(ProxyErrorKind::RouteLookupFailed, "");
        assert_eq!(err.status(StatusCode::IM_A_TEAPOT).as_u16(), 418);
    }

    #[test]
    fn test_traffic_shaping_not_logged_as_error() {
        for kind in [
            ProxyErrorKind::Ratelimited,
            ProxyErrorKind::CircuitOpen,
            ProxyErrorKind::QueueFull,
            ProxyErrorKind::ClientCanceled,
        ] {
            assert!(!ProxyError::new(kind, "").log_as_error());
        }
        assert!(ProxyError::new(ProxyErrorKind::MaxLoopbacksReached, "").log_as_error());
        assert!(ProxyError::new(ProxyErrorKind::BackendTransport, "").log_as_error());
    }
}
