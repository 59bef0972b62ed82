//! Top-level error type for the service binary.

use std::convert::From;
use std::error::Error;
use std::fmt;

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use backtrace::Backtrace;
use serde_json::json;
use thiserror::Error;

use sentinel_auth::AuthError;
use sentinel_common::{from_error, impl_fmt_display, InternalError, MetricsError, ReportableError};
use sentinel_db::{DbError, DbErrorKind};

/// Common `Result` type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Top-level error type. Renders as `{"error": "..."}` with the status the
/// kind maps to.
#[derive(Debug)]
pub struct ApiError {
    kind: ApiErrorKind,
    pub(crate) backtrace: Box<Backtrace>,
    status: StatusCode,
}

#[derive(Error, Debug)]
pub enum ApiErrorKind {
    #[error("{}", _0)]
    Db(DbError),

    #[error("{}", _0)]
    Auth(AuthError),

    #[error("{}", _0)]
    Validation(String),

    #[error("No app_data ServerState")]
    NoServerState,

    #[error("{}", _0)]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: &str) -> Self {
        ApiErrorKind::Validation(message.to_owned()).into()
    }

    pub fn not_found(message: &str) -> Self {
        let mut error: ApiError = ApiErrorKind::Validation(message.to_owned()).into();
        error.status = StatusCode::NOT_FOUND;
        error
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn kind(&self) -> &ApiErrorKind {
        &self.kind
    }

    pub fn is_cross_tenant(&self) -> bool {
        matches!(&self.kind, ApiErrorKind::Db(e) if e.is_cross_tenant())
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.kind.source()
    }
}

impl From<ApiErrorKind> for ApiError {
    fn from(kind: ApiErrorKind) -> Self {
        let status = match &kind {
            ApiErrorKind::Db(error) => error.status,
            ApiErrorKind::Auth(error) => error.status,
            ApiErrorKind::Validation(_) => StatusCode::BAD_REQUEST,
            ApiErrorKind::NoServerState | ApiErrorKind::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        Self {
            kind,
            backtrace: Box::new(Backtrace::new()),
            status,
        }
    }
}

impl From<ApiError> for HttpResponse {
    fn from(inner: ApiError) -> Self {
        ResponseError::error_response(&inner)
    }
}

impl From<std::io::Error> for ApiError {
    fn from(inner: std::io::Error) -> Self {
        ApiErrorKind::Internal(inner.to_string()).into()
    }
}

impl From<MetricsError> for ApiError {
    fn from(inner: MetricsError) -> Self {
        ApiErrorKind::Internal(inner.to_string()).into()
    }
}

from_error!(DbError, ApiError, ApiErrorKind::Db);
from_error!(AuthError, ApiError, ApiErrorKind::Auth);

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status).json(json!({ "error": self.to_string() }))
    }
}

impl InternalError for ApiError {
    fn internal_error(message: String) -> Self {
        ApiErrorKind::Internal(message).into()
    }
}

impl ReportableError for ApiError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn metric_label(&self) -> Option<String> {
        match &self.kind {
            ApiErrorKind::Db(e) => e.metric_label(),
            ApiErrorKind::Auth(_) => Some("api.error.auth".to_owned()),
            _ => None,
        }
    }
}

impl_fmt_display!(ApiError, ApiErrorKind);

/// 404 body for a process the caller may see but that does not exist.
pub fn process_not_found() -> ApiError {
    ApiError::not_found("process not found")
}

/// Maps a `DbError` arising in the HTTP path onto its response status.
pub fn api_error_from_db(error: DbError) -> ApiError {
    match error.kind() {
        DbErrorKind::NotFound => process_not_found(),
        _ => error.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_error_kind() {
        let e: ApiError = ApiErrorKind::Validation("bad limit".to_owned()).into();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);

        let e: ApiError = ApiError::from(DbError::from(DbErrorKind::PoolExhausted));
        assert_eq!(e.status(), StatusCode::SERVICE_UNAVAILABLE);

        let e: ApiError = ApiError::from(DbError::from(DbErrorKind::CrossTenantAccess));
        assert_eq!(e.status(), StatusCode::FORBIDDEN);
        assert!(e.is_cross_tenant());

        let e = process_not_found();
        assert_eq!(e.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn responses_render_a_json_error_body() {
        let e = ApiError::validation("limit must be positive");
        let response = e.error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
