//! API handlers.

use actix_web::{web::Data, web::Path, web::Query, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::error::{api_error_from_db, process_not_found, ApiError};
use crate::server::ServerState;
use crate::web::extractors::RequestTenant;

const DEFAULT_PAGE_SIZE: u32 = 100;
const MAX_PAGE_SIZE: u32 = 1000;

#[derive(Deserialize)]
pub struct PageQuery {
    limit: Option<u32>,
}

impl PageQuery {
    fn limit(&self) -> Result<u32, ApiError> {
        match self.limit {
            None => Ok(DEFAULT_PAGE_SIZE),
            Some(0) => Err(ApiError::validation("limit must be positive")),
            Some(limit) => Ok(limit.min(MAX_PAGE_SIZE)),
        }
    }
}

fn validated_process_id(raw: String) -> Result<String, ApiError> {
    if raw.is_empty() || raw.len() > 255 {
        Err(ApiError::validation("invalid process id"))
    } else {
        Ok(raw)
    }
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "UP" }))
}

/// Readiness: provable only by checking a session out of the pool.
pub async fn ready(state: Data<ServerState>) -> HttpResponse {
    let db = state.db.clone();
    let checked = state
        .blocking_threadpool
        .spawn(move || db.check())
        .await;

    match checked {
        Ok(()) => HttpResponse::Ok().json(json!({ "status": "READY" })),
        Err(e) => {
            warn!("readiness check failed: {}", e);
            HttpResponse::ServiceUnavailable()
                .json(json!({ "status": "DOWN", "reason": "database" }))
        }
    }
}

pub async fn metrics(state: Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(state.metrics.render())
}

pub async fn get_status(
    path: Path<String>,
    tenant: RequestTenant,
    state: Data<ServerState>,
) -> Result<HttpResponse, ApiError> {
    let process_id = validated_process_id(path.into_inner())?;
    let db = state.db.clone();
    let RequestTenant { context, tenant_id } = tenant;

    let status = state
        .blocking_threadpool
        .spawn(move || db.get_status(&context, &tenant_id, &process_id))
        .await
        .map_err(api_error_from_db)?;

    match status {
        Some(status) => Ok(HttpResponse::Ok().json(status)),
        None => Err(process_not_found()),
    }
}

pub async fn list_processes(
    query: Query<PageQuery>,
    tenant: RequestTenant,
    state: Data<ServerState>,
) -> Result<HttpResponse, ApiError> {
    let limit = query.limit()?;
    let db = state.db.clone();
    let RequestTenant { context, tenant_id } = tenant;

    let processes = state
        .blocking_threadpool
        .spawn(move || db.get_processes(&context, &tenant_id, limit))
        .await
        .map_err(api_error_from_db)?;

    Ok(HttpResponse::Ok().json(json!({ "processes": processes })))
}

pub async fn get_logs(
    path: Path<String>,
    query: Query<PageQuery>,
    tenant: RequestTenant,
    state: Data<ServerState>,
) -> Result<HttpResponse, ApiError> {
    let process_id = validated_process_id(path.into_inner())?;
    let limit = query.limit()?;
    let db = state.db.clone();
    let RequestTenant { context, tenant_id } = tenant;

    let logs = state
        .blocking_threadpool
        .spawn(move || db.get_logs(&context, &tenant_id, &process_id, limit))
        .await
        .map_err(api_error_from_db)?;

    Ok(HttpResponse::Ok().json(json!({ "logs": logs })))
}
