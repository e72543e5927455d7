use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};

use crate::metrics::REGISTRY;
use crate::state::AppState;

/// Operational routes live under this prefix and never reach an origin.
pub const OPS_PREFIX: &str = "/_gateway";

/// GET /_gateway/health - Health check endpoint
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let pipeline = &state.pipeline;
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "crawlgate-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "counter_store": pipeline.rate_limiter.store().name(),
        "mapped_hosts": pipeline.router.len(),
        "default_origin": pipeline.router.has_default(),
        "bot_patterns": pipeline.classifier.pattern_count(),
    }))
}

/// Compare the presented token with the configured one. Both sides are
/// digested first, so neither timing nor length leaks.
fn token_matches(presented: &str, expected: &str) -> bool {
    use sha2::{Digest, Sha256};
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Credentials from `Authorization: Bearer <token>`; the scheme is case-insensitive.
fn bearer_token(req: &HttpRequest) -> Option<&str> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

/// GET /_gateway/metrics - Prometheus text exposition, gated by `METRICS_TOKEN` when set
pub async fn metrics(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(expected) = state.config.metrics_token.as_deref() {
        let authorized = bearer_token(&req).is_some_and(|token| token_matches(token, expected));
        if !authorized {
            tracing::debug!("rejected unauthenticated metrics scrape");
            return HttpResponse::Unauthorized()
                .insert_header((header::WWW_AUTHENTICATE, "Bearer"))
                .json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "metrics require a bearer token"
                }));
        }
    }

    match prometheus::TextEncoder::new().encode_to_string(&REGISTRY.gather()) {
        Ok(body) => HttpResponse::Ok()
            .content_type(prometheus::TEXT_FORMAT)
            .body(body),
        Err(e) => {
            tracing::error!(error = %e, "metrics encoding failed");
            HttpResponse::InternalServerError().finish()
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope(OPS_PREFIX)
            .route("/health", web::get().to(health))
            .route("/metrics", web::get().to(metrics)),
    );
}
