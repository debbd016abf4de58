//! Request metrics middleware.
//!
//! Counts every request and records per-endpoint duration and failures in
//! [`AppState`]. Request logging itself is done by `tracing_actix_web::TracingLogger`.

use crate::state::AppState;
use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::{web, Error};
use std::time::Instant;

pub async fn record_metrics(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let start_time = Instant::now();
    let endpoint = format!("{} {}", req.method(), req.path());
    let state = req.app_data::<web::Data<AppState>>().cloned();

    if let Some(state) = &state {
        state.increment_request_count();
    }

    let result = next.call(req).await;

    if let Some(state) = &state {
        let is_error = match &result {
            Ok(response) => response.status().is_client_error() || response.status().is_server_error(),
            Err(_) => true,
        };
        state.record_endpoint_request(&endpoint, start_time.elapsed().as_millis() as u64, is_error);
        if is_error {
            state.increment_error_count();
        }
    }

    result
}
