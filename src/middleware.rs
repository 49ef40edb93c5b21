//! Request deadline.

use std::time::Duration;

use actix_web::body::{BoxBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::{web, Error, ResponseError};
use tracing::warn;

use crate::error::AppError;

/// How long a request may take end to end. Registered as app data; without
/// it [`enforce_deadline`] passes requests straight through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDeadline(pub Duration);

/// Answer 503 when the wrapped service does not finish within the
/// configured [`RequestDeadline`]. The handler future is dropped.
pub async fn enforce_deadline(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let Some(limit) = req.app_data::<web::Data<RequestDeadline>>().map(|d| d.0) else {
        return next.call(req).await.map(|res| res.map_into_left_body::<BoxBody>());
    };

    let request = req.request().clone();
    match tokio::time::timeout(limit, next.call(req)).await {
        Ok(response) => response.map(|res| res.map_into_left_body::<BoxBody>()),
        Err(_) => {
            warn!(
                method = %request.method(),
                path = %request.path(),
                timeout_ms = limit.as_millis() as u64,
                "request deadline exceeded"
            );
            let response = AppError::RequestTimeout.error_response();
            Ok(ServiceResponse::new(request, response).map_into_right_body())
        }
    }
}
