//! Audit capture middleware
//!
//! Observes every request/response exchange and hands one event per audited
//! exchange to the delivery pipeline:
//! - Paths under the API prefix are always audited, anything else only when
//!   the response status is 400 or above
//! - Health checks and static assets are never audited
//! - Request bodies with a known length up to the capture cap are recorded
//! - Response bodies are teed while streaming to the client, except for
//!   reads and file transfers
//!
//! The response itself is never altered. Emission is fire-and-forget, so a
//! failing audit store cannot slow down or fail the audited request.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request},
    http::{header, HeaderMap, Method},
    response::Response,
};
use docket_common::types::{is_object_id, is_uuid_like};
use docket_common::ObjectId;
use futures::FutureExt;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::BodyExt;
use serde_json::Value as JsonValue;
use std::{
    future::Future,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    pin::Pin,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::models::{ErrorInfo, NewAuditEvent};
use super::redaction::truncation_marker;
use super::service::AuditService;
use crate::config::MAX_AUDIT_MAX_BODY_BYTES;

/// Largest body buffered for auditing; larger bodies are recorded as a marker
pub const MAX_CAPTURE_BYTES: usize = MAX_AUDIT_MAX_BODY_BYTES;

/// Status recorded for exchanges abandoned before a response existed
pub const STATUS_CLIENT_CLOSED: u16 = 499;

const HEALTH_PATHS: &[&str] = &["/health", "/healthz", "/ready", "/live"];
const STATIC_PREFIXES: &[&str] = &["/static/", "/assets/"];
const STATIC_EXTENSIONS: &[&str] = &[
    "js", "css", "map", "png", "jpg", "jpeg", "gif", "svg", "ico", "woff", "woff2", "ttf", "txt",
];
const FILE_TRANSFER_SEGMENTS: &[&str] = &["files", "upload", "download", "export", "attachments"];

/// Authenticated identity for the current request
///
/// The host's auth layer inserts this as a request extension. Without it the
/// middleware falls back to ObjectId-shaped `x-user-id` / `x-tenant-id`
/// headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditContext {
    pub actor_id: Option<ObjectId>,
    pub tenant_id: Option<ObjectId>,
}

/// Audit capture layer
#[derive(Clone)]
pub struct AuditLayer {
    service: AuditService,
}

impl AuditLayer {
    pub fn new(service: AuditService) -> Self {
        Self { service }
    }
}

impl<S> Layer<S> for AuditLayer {
    type Service = AuditMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuditMiddleware {
            inner,
            service: self.service.clone(),
        }
    }
}

/// Audit middleware service
#[derive(Clone)]
pub struct AuditMiddleware<S> {
    inner: S,
    service: AuditService,
}

impl<S> Service<Request> for AuditMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::fmt::Display + Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // Drive the clone that was polled ready
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let service = self.service.clone();

        let path = request.uri().path().to_string();
        if is_excluded(&path) {
            return Box::pin(inner.call(request));
        }

        Box::pin(async move {
            let api_prefix = service.config().api_prefix.clone();
            let method = request.method().clone();
            let context = audit_context(&request);
            let ip_address = client_ip(&request);
            let user_agent = request
                .headers()
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();

            let (request, request_body) = capture_request_body(request, &path).await;

            let resource = infer_resource(&path, &api_prefix);
            let draft = ExchangeDraft {
                actor_id: context.actor_id,
                tenant_id: context.tenant_id,
                action: infer_action(&method, &resource),
                resource,
                resource_id: infer_resource_id(&path),
                method: method.to_string(),
                endpoint: path.clone(),
                ip_address,
                user_agent,
                request_body,
                always_audit: is_under_prefix(&path, &api_prefix),
            };
            let mut recorder = ExchangeRecorder::new(service, draft);

            let response = match AssertUnwindSafe(inner.call(request)).catch_unwind().await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    recorder.fail(500, ErrorInfo::new(err.to_string()));
                    return Err(err);
                },
                Err(panic) => {
                    recorder.fail(500, ErrorInfo::new("request handler panicked"));
                    drop(recorder);
                    std::panic::resume_unwind(panic);
                },
            };

            let status = response.status().as_u16();
            if !recorder.should_emit(status) {
                recorder.discard();
                return Ok(response);
            }
            recorder.set_status(status);

            if !should_capture_response(&method, &path) {
                recorder.finish(None);
                return Ok(response);
            }

            let (parts, body) = response.into_parts();
            let observed = ObservedBody::new(body, recorder);
            Ok(Response::from_parts(parts, Body::new(observed)))
        })
    }
}

/// Everything known about an exchange before the response
#[derive(Debug)]
struct ExchangeDraft {
    actor_id: Option<ObjectId>,
    tenant_id: Option<ObjectId>,
    action: String,
    resource: String,
    resource_id: Option<String>,
    method: String,
    endpoint: String,
    ip_address: String,
    user_agent: String,
    request_body: Option<JsonValue>,
    always_audit: bool,
}

/// Emits the audit event for one exchange exactly once
///
/// Consumed by [`finish`](Self::finish) on the normal path. If it is dropped
/// instead (body abandoned, inner error or panic, cancelled request) the `Drop`
/// impl emits what is known.
pub struct ExchangeRecorder {
    service: AuditService,
    draft: Option<ExchangeDraft>,
    status: Option<u16>,
    error: Option<ErrorInfo>,
}

impl ExchangeRecorder {
    fn new(service: AuditService, draft: ExchangeDraft) -> Self {
        Self {
            service,
            draft: Some(draft),
            status: None,
            error: None,
        }
    }

    fn should_emit(&self, status: u16) -> bool {
        self.draft
            .as_ref()
            .is_some_and(|draft| draft.always_audit || status >= 400)
    }

    fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    fn fail(&mut self, status: u16, error: ErrorInfo) {
        self.status = Some(status);
        self.error = Some(error);
    }

    /// Drop without emitting
    fn discard(mut self) {
        self.draft = None;
    }

    /// Emit with the observed response data
    fn finish(mut self, response_data: Option<JsonValue>) {
        self.emit(response_data);
    }

    fn emit(&mut self, response_data: Option<JsonValue>) {
        let Some(draft) = self.draft.take() else {
            return;
        };
        let status_code = self.status.unwrap_or(STATUS_CLIENT_CLOSED);
        if !draft.always_audit && status_code < 400 {
            return;
        }

        let event = NewAuditEvent {
            actor_id: draft.actor_id,
            tenant_id: draft.tenant_id,
            action: draft.action,
            resource: draft.resource,
            resource_id: draft.resource_id,
            method: draft.method,
            endpoint: draft.endpoint,
            ip_address: draft.ip_address,
            user_agent: draft.user_agent,
            status_code,
            request_body: draft.request_body,
            response_data,
            error: self.error.take(),
            category: None,
        };

        self.service.spawn_log_event(event);
    }
}

impl Drop for ExchangeRecorder {
    fn drop(&mut self) {
        if self.draft.is_none() {
            return;
        }
        if self.error.is_none() {
            let error = if self.status.is_some() {
                ErrorInfo::new("response body was not fully delivered")
            } else {
                ErrorInfo::new("request was cancelled before a response was produced")
            };
            self.error = Some(error);
        }
        debug!(status = ?self.status, "Emitting audit event from drop");
        self.emit(None);
    }
}

/// Response body wrapper that tees bytes for the audit trail
///
/// Frames pass through unchanged. The recorder is finished at end of stream;
/// if the client goes away first, dropping the body drops the recorder.
pub struct ObservedBody {
    inner: Body,
    buffer: Vec<u8>,
    seen: usize,
    recorder: Option<ExchangeRecorder>,
}

impl ObservedBody {
    fn new(inner: Body, recorder: ExchangeRecorder) -> Self {
        let mut body = Self {
            inner,
            buffer: Vec::new(),
            seen: 0,
            recorder: Some(recorder),
        };
        if body.inner.is_end_stream() {
            body.complete();
        }
        body
    }

    fn tee(&mut self, data: &Bytes) {
        self.seen += data.len();
        if self.seen <= MAX_CAPTURE_BYTES {
            self.buffer.extend_from_slice(data);
        } else {
            self.buffer = Vec::new();
        }
    }

    fn complete(&mut self) {
        let Some(recorder) = self.recorder.take() else {
            return;
        };
        let data = if self.seen > MAX_CAPTURE_BYTES {
            Some(truncation_marker(self.seen, "", recorder.service.config().max_body_bytes))
        } else {
            parse_body(&self.buffer)
        };
        recorder.finish(data);
    }
}

impl HttpBody for ObservedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.tee(data);
                }
                if this.inner.is_end_stream() {
                    this.complete();
                }
            },
            Poll::Ready(Some(Err(err))) => {
                if let Some(mut recorder) = this.recorder.take() {
                    recorder.error = Some(ErrorInfo::new(format!("response body failed: {err}")));
                }
            },
            Poll::Ready(None) => this.complete(),
            Poll::Pending => {},
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// JSON when the bytes parse, lossy text otherwise, nothing when empty
fn parse_body(bytes: &[u8]) -> Option<JsonValue> {
    if bytes.is_empty() {
        return None;
    }
    Some(
        serde_json::from_slice(bytes)
            .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(bytes).into_owned())),
    )
}

/// Buffer the request body when it is small enough and worth recording
async fn capture_request_body(request: Request, path: &str) -> (Request, Option<JsonValue>) {
    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    let capture = !is_file_transfer(path)
        && matches!(declared, Some(len) if len > 0 && len <= MAX_CAPTURE_BYTES);
    if !capture {
        return (request, None);
    }

    let (parts, body) = request.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(uri = %parts.uri, error = %e, "Failed to read request body");
            // The handler must see the failed read, not an empty body
            let failed = futures::stream::once(async move { Err::<Bytes, axum::Error>(e) });
            return (Request::from_parts(parts, Body::from_stream(failed)), None);
        },
    };
    let captured = parse_body(&bytes);
    (Request::from_parts(parts, Body::from(bytes)), captured)
}

fn audit_context(request: &Request) -> AuditContext {
    let fallback = |name: &str| header_object_id(request.headers(), name);
    match request.extensions().get::<AuditContext>() {
        Some(context) => AuditContext {
            actor_id: context.actor_id.clone().or_else(|| fallback("x-user-id")),
            tenant_id: context.tenant_id.clone().or_else(|| fallback("x-tenant-id")),
        },
        None => AuditContext {
            actor_id: fallback("x-user-id"),
            tenant_id: fallback("x-tenant-id"),
        },
    }
}

fn header_object_id(headers: &HeaderMap, name: &str) -> Option<ObjectId> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| ObjectId::parse(v.trim()).ok())
}

/// Client address: forwarding headers first, then the socket peer
fn client_ip(request: &Request) -> String {
    let headers = request.headers();
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .map(str::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Health checks and static assets
fn is_excluded(path: &str) -> bool {
    if HEALTH_PATHS.contains(&path) || path.ends_with("/health") || path == "/favicon.ico" {
        return true;
    }
    if STATIC_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return true;
    }
    path.rsplit('/')
        .next()
        .and_then(|last| last.rsplit_once('.'))
        .is_some_and(|(_, ext)| STATIC_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

fn is_under_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn is_file_transfer(path: &str) -> bool {
    path.split('/')
        .any(|segment| FILE_TRANSFER_SEGMENTS.contains(&segment.to_lowercase().as_str()))
}

fn should_capture_response(method: &Method, path: &str) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) && !is_file_transfer(path)
}

fn is_version_segment(segment: &str) -> bool {
    segment
        .strip_prefix(['v', 'V'])
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

fn is_identifier_segment(segment: &str) -> bool {
    is_object_id(segment)
        || is_uuid_like(segment)
        || (!segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()))
}

/// Audit action from HTTP method and resource
fn infer_action(method: &Method, resource: &str) -> String {
    let verb = match *method {
        Method::POST => "create".to_string(),
        Method::PUT | Method::PATCH => "update".to_string(),
        Method::DELETE => "delete".to_string(),
        Method::GET => "view".to_string(),
        ref other => other.as_str().to_lowercase(),
    };
    format!("{verb}_{resource}")
}

/// First meaningful path segment after the API prefix
fn infer_resource(path: &str, api_prefix: &str) -> String {
    let prefix = api_prefix.trim_end_matches('/');
    let rest = if is_under_prefix(path, prefix) {
        &path[prefix.len()..]
    } else {
        path
    };

    rest.split('/')
        .filter(|segment| !segment.is_empty())
        .find(|segment| !is_version_segment(segment) && !is_identifier_segment(segment))
        .map(str::to_lowercase)
        .unwrap_or_else(|| "root".to_string())
}

/// First ObjectId or UUID segment of the path
fn infer_resource_id(path: &str) -> Option<String> {
    path.split('/')
        .find(|segment| is_object_id(segment) || is_uuid_like(segment))
        .map(str::to_lowercase)
}
