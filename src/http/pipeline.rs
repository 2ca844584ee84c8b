//! Request pipeline.
//!
//! # State Machine
//! ```text
//! Routing → Forwarding → Completed
//!              ↓
//!           Retrying → Routing (another backend)
//!              ↓
//!            Failed
//! ```
//!
//! One call to `Pipeline::handle` drives a request through these phases
//! inside a single task. Transport failures are retried up to
//! `retry_on_error` times; backend 5xx responses only demote the backend.

use axum::body::{Body, Bytes};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::request::Parts;
use axum::http::{Request, Response, StatusCode, Version};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::config::ProxyConfig;
use crate::health::{classify, StatusPolicy, Verdict};
use crate::http::context::RequestContext;
use crate::http::forward::{ForwardError, Forwarder};
use crate::http::headers::{inject_forwarded, strip_hop_by_hop, wants_debug};
use crate::http::response::{error_page, insert_debug_headers, ping};
use crate::net::{ConnectionHandle, ConnectionState};
use crate::observability::access_log::{AccessLogSink, AccessRecord};
use crate::registry::{Backend, BackendRegistry, RouteError, Selection};
use crate::resilience::{RetryDecision, RetryPolicy};

/// Terminal failure of a request, rendered as an error page.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("Cannot read the remote address.")]
    NoRemoteAddress,

    #[error("Request body too large")]
    BodyTooLarge,

    #[error("Cannot read the request body: {0}")]
    InvalidBody(String),

    #[error("Cannot retry on error")]
    CannotRetry,

    #[error("Reached max retries limit")]
    RetryLimitExceeded,

    #[error("Retry on error is disabled")]
    RetryDisabled,
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Route(RouteError::MissingHost)
            | PipelineError::NoRemoteAddress
            | PipelineError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            PipelineError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            PipelineError::Route(_)
            | PipelineError::CannotRetry
            | PipelineError::RetryLimitExceeded
            | PipelineError::RetryDisabled => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Where a request currently is.
pub enum Phase {
    Routing,
    Forwarding,
    Retrying(ForwardError),
    Completed(Response<Body>),
    Failed(PipelineError),
}

/// Shared per-worker request handler.
pub struct Pipeline {
    pub(crate) registry: Arc<BackendRegistry>,
    pub(crate) forwarder: Arc<dyn Forwarder>,
    access_log: Arc<dyn AccessLogSink>,
    policy: StatusPolicy,
    retry: RetryPolicy,
    max_body_bytes: usize,
    http_keep_alive: bool,
    pub(crate) tcp_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        config: &ProxyConfig,
        registry: Arc<BackendRegistry>,
        forwarder: Arc<dyn Forwarder>,
        access_log: Arc<dyn AccessLogSink>,
    ) -> Self {
        Self {
            registry,
            forwarder,
            access_log,
            policy: StatusPolicy::from_config(config),
            retry: RetryPolicy::new(config.server.retry_on_error),
            max_body_bytes: config.server.max_body_bytes,
            http_keep_alive: config.server.http_keep_alive,
            tcp_timeout: config.server.tcp_timeout(),
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Proxy one HTTP request received on `conn`.
    pub async fn handle(
        self: Arc<Self>,
        request: Request<Body>,
        conn: ConnectionHandle,
    ) -> Response<Body> {
        let mut ctx = RequestContext::new(wants_debug(request.headers()));
        let (mut parts, body) = request.into_parts();

        let Some(remote) = conn.peer_addr() else {
            return self.fail(ctx, &parts, &conn, PipelineError::NoRemoteAddress);
        };
        inject_forwarded(
            &mut parts.headers,
            remote.ip(),
            conn.local_addr().map(|addr| addr.port()),
        );
        strip_hop_by_hop(&mut parts.headers);

        let body = match self.buffer_body(&parts.headers, body).await {
            Ok(body) => body,
            Err(err) => return self.fail(ctx, &parts, &conn, err),
        };

        let host = host_of(&parts);
        let mut phase = Phase::Routing;
        loop {
            phase = match phase {
                Phase::Routing => match self.registry.select(host.as_deref()) {
                    Ok(Selection::Ping) => return ping(),
                    Ok(Selection::Backend { backend, frontend }) => {
                        ctx.select(backend, frontend);
                        Phase::Forwarding
                    }
                    Err(err) => Phase::Failed(err.into()),
                },
                Phase::Forwarding => match ctx.backend.clone() {
                    Some(backend) => {
                        ctx.begin_attempt();
                        let request = outbound_request(&parts, body.clone());
                        let outcome = tokio::select! {
                            res = self.forwarder.forward(&backend, request) => res,
                            state = conn.closed() => Err(match state {
                                ConnectionState::TimedOut => ForwardError::ClientIdleTimeout,
                                _ => ForwardError::ClientClosed,
                            }),
                        };
                        match outcome {
                            Ok(response) => Phase::Completed(response),
                            Err(err) => Phase::Retrying(err),
                        }
                    }
                    None => Phase::Failed(RouteError::NoHealthyBackend.into()),
                },
                Phase::Retrying(err) => self.after_failure(&mut ctx, err, &parts, &conn),
                Phase::Completed(response) => return self.respond(ctx, &parts, &conn, response),
                Phase::Failed(err) => return self.fail(ctx, &parts, &conn, err),
            };
        }
    }

    async fn buffer_body(&self, headers: &HeaderMap, body: Body) -> Result<Bytes, PipelineError> {
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > self.max_body_bytes as u64) {
            return Err(PipelineError::BodyTooLarge);
        }

        let mut stream = body.into_data_stream();
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::InvalidBody(e.to_string()))?;
            if buf.len() + chunk.len() > self.max_body_bytes {
                return Err(PipelineError::BodyTooLarge);
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(buf))
    }

    fn after_failure(
        &self,
        ctx: &mut RequestContext,
        err: ForwardError,
        parts: &Parts,
        conn: &ConnectionHandle,
    ) -> Phase {
        if let Some(backend) = &ctx.backend {
            if err.marks_dead() {
                self.demote(backend, err.code(), parts);
            } else {
                tracing::warn!(
                    vhost = %backend.virtual_host(),
                    backend = %backend.authority(),
                    code = err.code(),
                    error = %err,
                    url = %parts.uri,
                    "Backend reported an error"
                );
            }
        }

        ctx.failures += 1;
        if conn.is_closed() {
            return Phase::Failed(PipelineError::CannotRetry);
        }
        match self.retry.decide(ctx.failures) {
            RetryDecision::Retry => {
                tracing::info!(
                    vhost = ?ctx.frontend,
                    attempt = ctx.failures + 1,
                    max_attempts = self.retry.max_attempts(),
                    url = %parts.uri,
                    "Retrying on error"
                );
                Phase::Routing
            }
            RetryDecision::LimitExceeded => Phase::Failed(PipelineError::RetryLimitExceeded),
            RetryDecision::Disabled => Phase::Failed(PipelineError::RetryDisabled),
        }
    }

    fn demote(&self, backend: &Backend, reason: &str, parts: &Parts) {
        let outcome = self.registry.mark_dead(backend);
        tracing::warn!(
            vhost = %backend.virtual_host(),
            backend = %backend.authority(),
            instance_id = %backend.instance_id(),
            reason,
            outcome = ?outcome,
            url = %parts.uri,
            "Backend is dead"
        );
    }

    fn respond(
        &self,
        mut ctx: RequestContext,
        parts: &Parts,
        conn: &ConnectionHandle,
        response: Response<Body>,
    ) -> Response<Body> {
        ctx.mark_headers();
        let status = response.status();

        if let Some(backend) = &ctx.backend {
            match classify(status, response.headers(), &self.policy) {
                Verdict::Failing => {
                    self.demote(backend, &format!("HTTP error code {}", status.as_u16()), parts)
                }
                Verdict::Maintenance => tracing::debug!(
                    vhost = %backend.virtual_host(),
                    backend = %backend.authority(),
                    "Backend in maintenance"
                ),
                Verdict::Healthy => {}
            }
        }

        let (mut head, body) = response.into_parts();
        strip_hop_by_hop(&mut head.headers);
        if ctx.debug {
            insert_debug_headers(&mut head.headers, &ctx);
        }
        if !self.http_keep_alive {
            head.headers
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        let body = self.track_completion(ctx, parts, conn, status, body);
        Response::from_parts(head, body)
    }

    fn fail(
        &self,
        mut ctx: RequestContext,
        parts: &Parts,
        conn: &ConnectionHandle,
        err: PipelineError,
    ) -> Response<Body> {
        ctx.error_response = true;
        let status = err.status();
        match &err {
            PipelineError::Route(_) => tracing::debug!(
                error = %err,
                host = ?host_of(parts),
                "Cannot route request"
            ),
            _ => tracing::warn!(
                error = %err,
                host = ?host_of(parts),
                url = %parts.uri,
                failures = ctx.failures,
                connection = %conn.socket_info(),
                "Request failed"
            ),
        }

        let (head, body) = error_page(status, &err.to_string(), ctx.debug).into_parts();
        let body = self.track_completion(ctx, parts, conn, status, body);
        Response::from_parts(head, body)
    }

    /// Wrap `body` so the access record and backend counters are written
    /// when the client has received it (or gone away).
    fn track_completion(
        &self,
        ctx: RequestContext,
        parts: &Parts,
        conn: &ConnectionHandle,
        status: StatusCode,
        body: Body,
    ) -> Body {
        let Some(backend) = ctx.backend.clone() else {
            return body;
        };
        let header_str = |name: header::HeaderName| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };

        let completion = Completion {
            sink: self.access_log.clone(),
            backend,
            conn: conn.clone(),
            remote_addr: conn
                .peer_addr()
                .map(|a| crate::http::headers::client_ip(a.ip()).to_string())
                .unwrap_or_default(),
            method: parts.method.to_string(),
            url: parts.uri.to_string(),
            http_version: version_str(parts.version),
            referer: header_str(header::REFERER),
            user_agent: header_str(header::USER_AGENT),
            status: status.as_u16(),
            ctx,
        };

        let guard = CompletionGuard(Some(completion));
        Body::from_stream(body.into_data_stream().map(move |chunk| {
            let _ = &guard;
            chunk
        }))
    }
}

/// Everything the access record needs once the response is over.
struct Completion {
    sink: Arc<dyn AccessLogSink>,
    backend: Arc<Backend>,
    conn: ConnectionHandle,
    ctx: RequestContext,
    remote_addr: String,
    method: String,
    url: String,
    http_version: String,
    referer: Option<String>,
    user_agent: Option<String>,
    status: u16,
}

impl Completion {
    fn finish(self, total: Duration, backend_time: Duration) {
        let bytes_written = self.conn.bytes_written();

        self.sink.record(AccessRecord {
            remote_addr: self.remote_addr,
            current_time: unix_millis(self.ctx.started_at),
            total_time_spent: total.as_millis() as u64,
            backend_time_spent: backend_time.as_millis() as u64,
            method: self.method,
            url: self.url,
            http_version: self.http_version,
            status_code: self.status,
            socket_bytes_written: bytes_written,
            referer: self.referer,
            user_agent: self.user_agent,
            virtual_host: self.backend.virtual_host().to_string(),
            log_session: self.backend.log_session().map(str::to_owned),
            error: self.ctx.error_response,
        });
        self.backend
            .record(bytes_written, self.conn.bytes_read(), total);
    }
}

/// Fires when the response body is dropped.
///
/// Socket counters are only final once the connection has closed, so the
/// record is deferred until then.
struct CompletionGuard(Option<Completion>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let Some(completion) = self.0.take() else {
            return;
        };
        let total = completion.ctx.total_elapsed();
        let backend_time = completion.ctx.backend_elapsed();

        if completion.conn.is_closed() {
            return completion.finish(total, backend_time);
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    completion.conn.closed().await;
                    completion.finish(total, backend_time);
                });
            }
            Err(_) => completion.finish(total, backend_time),
        }
    }
}

fn host_of(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
}

fn outbound_request(parts: &Parts, body: Bytes) -> Request<Body> {
    let mut request = Request::new(Body::from(body));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = parts.headers.clone();
    request
}

fn version_str(version: Version) -> String {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
    .to_string()
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
