use std::any::Any;
use std::panic::AssertUnwindSafe;

use actix_web::{web, HttpRequest, HttpResponse};
use futures::FutureExt;

use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::state::AppState;

/// Catch-all: every request that is not an operational route runs the pipeline.
pub async fn handle(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let ctx = RequestContext::from_request(&req, state.config.trust_forwarded_for);

    // A panic anywhere in the pipeline becomes a generic 500 instead of a dropped connection
    AssertUnwindSafe(state.pipeline.handle(&req, &ctx, body))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(GatewayError::Internal(format!(
                "pipeline panicked: {}",
                panic_message(panic.as_ref())
            )))
        })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Mount the pipeline as the default service.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.default_service(web::to(handle));
}
