use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

/// Errors that terminate a request with a gateway-generated response.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The licensing authority rejected the presented token, or could not be reached
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// Unlicensed bot traffic over its window budget
    #[error("rate limit exceeded")]
    RateLimited,
    /// No origin mapped and no default origin configured
    #[error("unknown publisher host: {0}")]
    UnknownHost(String),
    /// Upstream origin failed or returned an unusable response
    #[error("upstream error: {0}")]
    Upstream(String),
    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidToken(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UnknownHost(_) => StatusCode::NOT_FOUND,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            GatewayError::InvalidToken(reason) => {
                HttpResponse::Forbidden().json(serde_json::json!({
                    "error": "invalid_token",
                    "reason": reason
                }))
            }
            GatewayError::RateLimited => HttpResponse::TooManyRequests().json(serde_json::json!({
                "error": "rate_limited",
                "message": "Too many unlicensed requests. Obtain a valid token from the licensing \
                            authority and retry with the X-Agent-Token header or a token query parameter."
            })),
            GatewayError::UnknownHost(host) => {
                tracing::warn!(host = %host, "no origin for host");
                HttpResponse::NotFound().json(serde_json::json!({
                    "error": "unknown_host",
                    "message": "Unknown publisher host"
                }))
            }
            GatewayError::Upstream(msg) => {
                tracing::error!("Upstream error: {}", msg);
                HttpResponse::BadGateway().json(serde_json::json!({
                    "error": "bad_gateway",
                    "message": "Failed to reach origin"
                }))
            }
            GatewayError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                HttpResponse::InternalServerError().json(serde_json::json!({
                    "error": "internal_error",
                    "message": "An internal error occurred"
                }))
            }
        }
    }
}
