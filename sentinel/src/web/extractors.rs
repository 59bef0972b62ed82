//! Request extractors.
//!
//! `RequestTenant` is the gate in front of every authenticated endpoint: it
//! parses the bearer token, validates it, and enforces the cross-tenant
//! access rule before a handler runs.

use actix_web::{
    dev::Payload,
    web::{Data, Query},
    FromRequest, HttpRequest,
};
use futures::future::LocalBoxFuture;
use serde::Deserialize;

use sentinel_auth::AuthErrorKind;
use sentinel_common::TenantContext;
use sentinel_db::{DbError, DbErrorKind};

use crate::error::{ApiError, ApiErrorKind};
use crate::server::ServerState;

fn unauthorized(context: &str) -> ApiError {
    sentinel_auth::AuthError::from(AuthErrorKind::Malformed(context.to_owned())).into()
}

/// The raw token from the `Authorization: Bearer ...` header.
#[derive(Debug)]
pub struct BearerToken(pub String);

impl FromRequest for BearerToken {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();

        Box::pin(async move {
            let header = req
                .headers()
                .get("Authorization")
                .ok_or_else(|| unauthorized("no Authorization header"))?
                .to_str()
                .map_err(|_| unauthorized("Authorization header is not ASCII"))?;

            match header.split_once(' ') {
                Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
                    Ok(BearerToken(token.trim().to_owned()))
                }
                Some(_) => Err(unauthorized("unsupported authorization scheme")),
                None => Err(unauthorized("malformed Authorization header")),
            }
        })
    }
}

#[derive(Deserialize)]
struct TenantQuery {
    tenant_id: Option<String>,
}

/// A validated caller plus the tenant the request targets. The target
/// defaults to the caller's own tenant; naming another tenant requires a
/// system or admin context.
#[derive(Debug)]
pub struct RequestTenant {
    pub context: TenantContext,
    pub tenant_id: String,
}

impl FromRequest for RequestTenant {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();

        Box::pin(async move {
            let state = req
                .app_data::<Data<ServerState>>()
                .ok_or(ApiErrorKind::NoServerState)
                .map_err(ApiError::from)?
                .clone();

            let BearerToken(token) = BearerToken::extract(&req).await?;
            let context = state.verifier.verify(&token).await?;

            let query = Query::<TenantQuery>::extract(&req)
                .await
                .map_err(|_| ApiError::validation("invalid query parameters"))?;
            let tenant_id = query
                .into_inner()
                .tenant_id
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| context.tenant_id.clone());

            if !context.can_access(&tenant_id) {
                return Err(DbError::from(DbErrorKind::CrossTenantAccess).into());
            }

            Ok(RequestTenant { context, tenant_id })
        })
    }
}
