use std::sync::Arc;

use auth::{
    CertificateIdentity, IdentityError, identity_from_certificate_der, verify_identity_for_agent,
};
use axum::{
    Extension, Json, Router,
    body::{Body, to_bytes},
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{MethodRouter, get, post},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::{
    agents::{Agent, AgentError, AgentResolver},
    config::GatewayConfig,
    enforce::{EnforceError, LabelEnforcer, MATCH_PARAM, MATCH_TARGET_PARAM, encode_pairs, parse_pairs},
    metrics::GatewayMetrics,
    proxy::{ProxyError, UpstreamProxy},
    tls::PeerCertificate,
};

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
const AGENT_PREFIX: &str = "/namespaces/:namespace/agents/:name";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("agent {namespace}/{name} not found")]
    UnknownAgent { namespace: String, name: String },
    #[error("no {0} backend configured")]
    NoBackend(&'static str),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Enforce(#[from] EnforceError),
    #[error("agent lookup failed: {0}")]
    Resolver(#[from] AgentError),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::UnknownAgent { .. } => StatusCode::NOT_FOUND,
            Self::NoBackend(_) => StatusCode::NOT_ACCEPTABLE,
            Self::BadRequest(_) | Self::Enforce(_) => StatusCode::BAD_REQUEST,
            Self::Resolver(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<IdentityError> for GatewayError {
    fn from(err: IdentityError) -> Self {
        Self::Unauthenticated(err.to_string())
    }
}

impl From<ProxyError> for GatewayError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Upstream(message) => Self::Upstream(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEndpoint {
    Query,
    QueryRange,
    Series,
    Labels,
    LabelValues,
    TargetsMetadata,
}

impl ReadEndpoint {
    fn path(self) -> &'static str {
        match self {
            Self::Query => "/api/v1/query",
            Self::QueryRange => "/api/v1/query_range",
            Self::Series => "/api/v1/series",
            Self::Labels => "/api/v1/labels",
            Self::LabelValues => "/api/v1/label/:label/values",
            Self::TargetsMetadata => "/api/v1/targets/metadata",
        }
    }

    /// Selector parameter an endpoint needs so it does not return data across
    /// all tenants when the caller leaves it out.
    fn required_selector(self) -> Option<&'static str> {
        match self {
            Self::Series | Self::Labels | Self::LabelValues => Some(MATCH_PARAM),
            Self::TargetsMetadata => Some(MATCH_TARGET_PARAM),
            Self::Query | Self::QueryRange => None,
        }
    }
}

const READ_ENDPOINTS: [ReadEndpoint; 6] = [
    ReadEndpoint::Query,
    ReadEndpoint::QueryRange,
    ReadEndpoint::Series,
    ReadEndpoint::Labels,
    ReadEndpoint::LabelValues,
    ReadEndpoint::TargetsMetadata,
];

#[derive(Clone)]
pub struct GatewayState {
    resolver: Arc<dyn AgentResolver>,
    proxy: Arc<UpstreamProxy>,
    enforcer: Arc<LabelEnforcer>,
    metrics: Arc<GatewayMetrics>,
    query_backend: Option<Arc<str>>,
    write_backend: Option<Arc<str>>,
    write_path: Arc<str>,
    tenant_header: HeaderName,
    mtls_required: bool,
}

impl GatewayState {
    pub fn new(config: &GatewayConfig, resolver: Arc<dyn AgentResolver>) -> Result<Self, ProxyError> {
        Ok(Self {
            resolver,
            proxy: Arc::new(UpstreamProxy::new(config.upstream_timeout)?),
            enforcer: Arc::new(LabelEnforcer::new(
                &config.tenant_label,
                config.error_on_replace,
            )),
            metrics: Arc::new(GatewayMetrics::default()),
            query_backend: config.query_backend.as_deref().map(Arc::from),
            write_backend: config.write_backend.as_deref().map(Arc::from),
            write_path: Arc::from(config.write_path.as_str()),
            tenant_header: config.tenant_header.clone(),
            mtls_required: config.mtls_required(),
        })
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    fn authenticate(
        &self,
        peer: Option<Extension<PeerCertificate>>,
    ) -> Result<Option<CertificateIdentity>, GatewayError> {
        if !self.mtls_required {
            return Ok(None);
        }
        let der = peer
            .and_then(|Extension(peer)| peer.0)
            .ok_or(IdentityError::MissingCertificate)?;
        Ok(Some(identity_from_certificate_der(&der)?))
    }

    async fn authorize(
        &self,
        agent_path: &AgentPath,
        peer: Option<Extension<PeerCertificate>>,
    ) -> Result<Agent, GatewayError> {
        let identity = self.authenticate(peer)?;
        let agent = self
            .resolver
            .resolve(&agent_path.namespace, &agent_path.name)
            .await?
            .ok_or_else(|| GatewayError::UnknownAgent {
                namespace: agent_path.namespace.clone(),
                name: agent_path.name.clone(),
            })?;
        if let Some(identity) = identity {
            verify_identity_for_agent(&identity, &agent.namespace, &agent.name)?;
        }
        Ok(agent)
    }
}

#[derive(Debug, Deserialize)]
struct AgentPath {
    namespace: String,
    name: String,
}

pub fn router(state: GatewayState) -> Router {
    let mut router = Router::new()
        .route("/-/healthy", get(healthy))
        .route("/-/ready", get(ready))
        .route("/metrics", get(metrics))
        .route(&format!("{AGENT_PREFIX}/api/v1/write"), post(write));
    for endpoint in READ_ENDPOINTS {
        router = router.route(&format!("{AGENT_PREFIX}{}", endpoint.path()), read_route(endpoint));
    }
    router.with_state(state)
}

fn read_route(endpoint: ReadEndpoint) -> MethodRouter<GatewayState> {
    let handler = move |state: State<GatewayState>,
                        agent_path: Path<AgentPath>,
                        peer: Option<Extension<PeerCertificate>>,
                        request: Request| async move {
        read(endpoint, state, agent_path, peer, request).await
    };
    get(handler.clone()).post(handler)
}

async fn healthy() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn ready(State(state): State<GatewayState>) -> impl IntoResponse {
    if state.query_backend.is_none() && state.write_backend.is_none() {
        return (StatusCode::SERVICE_UNAVAILABLE, "no backend configured");
    }
    (StatusCode::OK, "OK")
}

async fn metrics(State(state): State<GatewayState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.metrics_text(),
    )
}

fn finish(state: &GatewayState, result: Result<(Response, bool), GatewayError>) -> Response {
    match result {
        Ok((response, enforced)) => {
            state.metrics.observe_forwarded(enforced);
            response
        }
        Err(err) => {
            let status = err.status();
            state.metrics.observe_rejected(status);
            if status.is_server_error() {
                error!(error = %err, "request failed");
            } else {
                debug!(error = %err, status = status.as_u16(), "request rejected");
            }
            err.into_response()
        }
    }
}

async fn read(
    endpoint: ReadEndpoint,
    State(state): State<GatewayState>,
    Path(agent_path): Path<AgentPath>,
    peer: Option<Extension<PeerCertificate>>,
    request: Request,
) -> Response {
    state.metrics.observe_request();
    let result = forward_read(&state, endpoint, &agent_path, peer, request).await;
    finish(&state, result)
}

async fn forward_read(
    state: &GatewayState,
    endpoint: ReadEndpoint,
    agent_path: &AgentPath,
    peer: Option<Extension<PeerCertificate>>,
    request: Request,
) -> Result<(Response, bool), GatewayError> {
    let agent = state.authorize(agent_path, peer).await?;
    let backend = state
        .query_backend
        .clone()
        .ok_or(GatewayError::NoBackend("query"))?;

    let (parts, body) = request.into_parts();
    let body = read_body(body).await?;
    let upstream_path = upstream_path(parts.uri.path());
    let headers = parts.headers;

    let Some(tenant) = agent.tenant.as_deref() else {
        let response = state
            .proxy
            .forward(parts.method, &backend, upstream_path, parts.uri.query(), headers, body)
            .await?;
        return Ok((response, false));
    };

    let is_form = parts.method == Method::POST && is_form_body(&headers);
    let mut query_pairs = parse_pairs(parts.uri.query().unwrap_or_default().as_bytes());
    let mut form_pairs = is_form.then(|| parse_pairs(&body));

    let mut present = state.enforcer.enforce_pairs(&mut query_pairs, tenant)?;
    if let Some(form) = form_pairs.as_mut() {
        present.extend(state.enforcer.enforce_pairs(form, tenant)?);
    }
    if let Some(param) = endpoint.required_selector()
        && !present.contains(&param)
    {
        let target = form_pairs.as_mut().unwrap_or(&mut query_pairs);
        target.push((param.to_string(), state.enforcer.tenant_selector(tenant)));
    }

    let body = match &form_pairs {
        Some(form) => Bytes::from(encode_pairs(form)),
        None => body,
    };
    let query = encode_pairs(&query_pairs);
    debug!(
        namespace = %agent.namespace,
        agent = %agent.name,
        tenant,
        path = upstream_path,
        "enforced tenant label on read request"
    );

    let response = state
        .proxy
        .forward(parts.method, &backend, upstream_path, Some(&query), headers, body)
        .await?;
    Ok((response, true))
}

async fn write(
    State(state): State<GatewayState>,
    Path(agent_path): Path<AgentPath>,
    peer: Option<Extension<PeerCertificate>>,
    request: Request,
) -> Response {
    state.metrics.observe_request();
    let result = forward_write(&state, &agent_path, peer, request).await;
    finish(&state, result)
}

async fn forward_write(
    state: &GatewayState,
    agent_path: &AgentPath,
    peer: Option<Extension<PeerCertificate>>,
    request: Request,
) -> Result<(Response, bool), GatewayError> {
    let agent = state.authorize(agent_path, peer).await?;
    let backend = state
        .write_backend
        .clone()
        .ok_or(GatewayError::NoBackend("write"))?;

    let (parts, body) = request.into_parts();
    let body = read_body(body).await?;
    let mut headers = parts.headers;

    let enforced = match agent.tenant.as_deref() {
        Some(tenant) => {
            let value = HeaderValue::from_str(tenant).map_err(|err| {
                GatewayError::Internal(format!("tenant '{tenant}' is not a valid header value: {err}"))
            })?;
            headers.insert(state.tenant_header.clone(), value);
            true
        }
        None => {
            warn!(namespace = %agent.namespace, agent = %agent.name, "forwarding write without tenant");
            false
        }
    };

    let response = state
        .proxy
        .forward(parts.method, &backend, &state.write_path, parts.uri.query(), headers, body)
        .await?;
    Ok((response, enforced))
}

async fn read_body(body: Body) -> Result<Bytes, GatewayError> {
    to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|err| GatewayError::BadRequest(format!("request body error: {err}")))
}

fn is_form_body(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
}

/// The part of the request path after `/namespaces/{ns}/agents/{name}`.
fn upstream_path(path: &str) -> &str {
    path.find("/api/v1/").map_or(path, |index| &path[index..])
}
