use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use schema::{LABEL_SERVICE, LABEL_STORAGE, Shard, Tenant, validate_tenant};
use serde::{Deserialize, Serialize};
use serde_json::json;
use store::{LabelSelector, ResourceStore, StoreError};
use tracing::{debug, info};

use crate::{
    metrics::ControllerMetrics,
    routing::{RoutingError, RoutingReconciler},
    runtime::ControlPlane,
};

const MAX_UPSERT_ATTEMPTS: u32 = 5;

#[derive(Clone)]
pub struct AdminState {
    tenants: Arc<dyn ResourceStore<Tenant>>,
    shards: Arc<dyn ResourceStore<Shard>>,
    routing: Arc<RoutingReconciler>,
    metrics: Arc<ControllerMetrics>,
}

impl AdminState {
    pub fn from_control_plane(plane: &ControlPlane) -> Self {
        Self {
            tenants: plane.stores.tenants.clone(),
            shards: plane.stores.shards.clone(),
            routing: Arc::clone(&plane.routing),
            metrics: Arc::clone(&plane.metrics),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TenantUpsert {
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub storage: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum AdminError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Store(err) if err.is_not_found() => StatusCode::NOT_FOUND,
            Self::Store(err) if err.is_conflict() => StatusCode::CONFLICT,
            Self::Store(err) if err.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_) | Self::Routing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/debug/shards", get(list_shards))
        .route("/debug/hashring/:service/:storage", get(hashring))
        .route("/v1/tenants", get(list_tenants))
        .route(
            "/v1/tenants/:name",
            get(get_tenant).put(upsert_tenant).delete(delete_tenant),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.metrics_text(),
    )
}

async fn list_shards(State(state): State<AdminState>) -> Result<Json<Vec<Shard>>, AdminError> {
    Ok(Json(state.shards.list(&LabelSelector::everything()).await?))
}

async fn hashring(
    State(state): State<AdminState>,
    Path((service, storage)): Path<(String, String)>,
) -> Result<impl IntoResponse, AdminError> {
    let entries = state.routing.builder().build(&service, &storage).await?;
    Ok(Json(entries))
}

async fn list_tenants(State(state): State<AdminState>) -> Result<Json<Vec<Tenant>>, AdminError> {
    Ok(Json(state.tenants.list(&LabelSelector::everything()).await?))
}

async fn get_tenant(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<Tenant>, AdminError> {
    state
        .tenants
        .get(&name)
        .await?
        .map(Json)
        .ok_or_else(|| AdminError::NotFound(format!("tenant '{name}' not found")))
}

async fn upsert_tenant(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(body): Json<TenantUpsert>,
) -> Result<impl IntoResponse, AdminError> {
    for _ in 0..MAX_UPSERT_ATTEMPTS {
        let existing = state.tenants.get(&name).await?;
        let created = existing.is_none();
        let mut tenant = existing.unwrap_or_else(|| Tenant::new(&name));
        apply_upsert(&mut tenant, &body);
        validate_tenant(&tenant).map_err(|err| AdminError::BadRequest(format!("{err:?}")))?;

        let result = if created {
            state.tenants.create(tenant).await
        } else {
            state.tenants.update(tenant).await
        };
        match result {
            Ok(stored) => {
                info!(tenant = %name, created, "tenant upserted");
                let status = if created {
                    StatusCode::CREATED
                } else {
                    StatusCode::OK
                };
                return Ok((status, Json(stored)));
            }
            Err(err) if err.is_conflict() => {
                debug!(tenant = %name, "tenant upsert raced, retrying");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(AdminError::Conflict(format!(
        "tenant '{name}' kept changing, retry the request"
    )))
}

fn apply_upsert(tenant: &mut Tenant, body: &TenantUpsert) {
    if let Some(id) = &body.tenant {
        tenant.spec.tenant = id.trim().to_string();
    }
    for (key, value) in [(LABEL_SERVICE, &body.service), (LABEL_STORAGE, &body.storage)] {
        match value.as_deref().map(str::trim) {
            Some("") => {
                tenant.meta.labels.remove(key);
            }
            Some(value) => {
                tenant.meta.labels.insert(key.to_string(), value.to_string());
            }
            None => {}
        }
    }
}

async fn delete_tenant(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AdminError> {
    state.tenants.delete(&name, None).await?;
    info!(tenant = %name, "tenant deletion requested");
    Ok(StatusCode::ACCEPTED)
}
