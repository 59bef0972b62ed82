//! Web layer: request extractors, handlers, and the metrics middleware.

pub mod extractors;
pub mod handlers;

use std::future::Future;
use std::time::Instant;

use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse},
    web::Data,
};

use sentinel_common::trace::TraceParent;

use crate::server::ServerState;

/// Counts and times every request; applied with `wrap_fn` on the app.
pub fn track_http_metrics<B>(
    req: ServiceRequest,
    srv: &impl Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error>,
) -> impl Future<Output = Result<ServiceResponse<B>, actix_web::Error>> {
    let metrics = req
        .app_data::<Data<ServerState>>()
        .map(|state| state.metrics.clone());
    let trace_parent = req
        .headers()
        .get("traceparent")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| TraceParent::parse(value).ok());
    let method = req.method().to_string();
    let path = req.path().to_owned();

    if let Some(metrics) = &metrics {
        metrics.requests_total.inc();
        metrics.http_requests_in_flight.inc();
    }
    let started = Instant::now();
    let fut = srv.call(req);

    async move {
        let result = fut.await;
        if let Some(metrics) = &metrics {
            metrics.http_requests_in_flight.dec();
            metrics
                .http_request_duration
                .observe(started.elapsed().as_secs_f64());
            match &result {
                Ok(response) if response.status().as_u16() < 400 => {
                    metrics.requests_success.inc()
                }
                _ => metrics.requests_error.inc(),
            }
        }
        if let Some(parent) = trace_parent {
            debug!("handled request";
                "method" => method,
                "path" => path,
                "trace_id" => parent.trace_id,
                "span_id" => parent.span_id);
        }
        result
    }
}
