use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;
use url::Url;

use crate::context::{RequestContext, AGENT_TOKEN_HEADER};
use crate::error::GatewayError;
use crate::metrics::{PROXY_LATENCY, UPSTREAM_ERRORS};

/// Header marking a request that carries a verified bot license.
pub const LICENSED_BOT_HEADER: &str = "x-licensed-bot";

/// Headers to strip from the client request before proxying
const HEADERS_TO_STRIP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length", // Will be recalculated
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    // Consumed by the gateway; a `token` query parameter is part of the URL and stays
    AGENT_TOKEN_HEADER,
    // Only the gateway may assert a license
    LICENSED_BOT_HEADER,
];

/// Hop-by-hop response headers. Everything else from the origin is relayed as-is.
const RESPONSE_HEADERS_TO_STRIP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
];

/// Join an origin base URL and the client's path+query.
///
/// Rejects any result whose authority differs from the origin's.
pub fn build_target_url(origin: &str, path_and_query: &str) -> Result<Url, GatewayError> {
    let base = Url::parse(origin)
        .map_err(|e| GatewayError::Internal(format!("invalid origin URL {origin}: {e}")))?;

    let path_and_query = if path_and_query.starts_with('/') {
        path_and_query.to_string()
    } else {
        format!("/{path_and_query}")
    };
    let target = format!("{}{}", origin.trim_end_matches('/'), path_and_query);
    let target = Url::parse(&target)
        .map_err(|e| GatewayError::Upstream(format!("invalid target URL: {e}")))?;

    if target.host_str() != base.host_str()
        || target.port_or_known_default() != base.port_or_known_default()
    {
        return Err(GatewayError::Upstream(format!(
            "target {target} escapes origin {origin}"
        )));
    }

    Ok(target)
}

/// Proxy an HTTP request to `origin`, relaying the origin's response.
///
/// `licensed` adds `X-Licensed-Bot: true` to the upstream request.
pub async fn proxy_request(
    client: &reqwest::Client,
    original_req: &HttpRequest,
    ctx: &RequestContext,
    origin: &str,
    body: Bytes,
    licensed: bool,
    max_body_bytes: usize,
) -> Result<HttpResponse, GatewayError> {
    // Path and query go to the origin verbatim, `token` parameter included
    let target_url = build_target_url(origin, &ctx.path_and_query)?;

    let method = reqwest::Method::from_bytes(original_req.method().as_str().as_bytes())
        .map_err(|_| GatewayError::Internal(format!("unsupported method {}", ctx.method)))?;

    let mut request_builder = client.request(method, target_url.as_str());

    // Copy headers from original request (except stripped ones)
    for (name, value) in original_req.headers() {
        let name_lower = name.as_str().to_lowercase();
        if !HEADERS_TO_STRIP.contains(&name_lower.as_str()) {
            request_builder = request_builder.header(name.as_str(), value.as_bytes());
        }
    }

    let forwarded_for = match original_req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => match original_req.peer_addr() {
            Some(peer) => format!("{}, {}", existing, peer.ip()),
            None => existing.to_string(),
        },
        None => ctx.client_ip.clone(),
    };
    request_builder = request_builder
        .header("x-forwarded-for", forwarded_for)
        .header("x-forwarded-host", ctx.host.as_str())
        .header("x-forwarded-proto", ctx.scheme.as_str());

    if licensed {
        request_builder = request_builder.header(LICENSED_BOT_HEADER, "true");
    }

    if !body.is_empty() {
        request_builder = request_builder.body(body);
    }

    let timer = PROXY_LATENCY.start_timer();
    let mut response = request_builder.send().await.map_err(|e| {
        UPSTREAM_ERRORS.inc();
        tracing::error!(target = %target_url, error = %e, "proxy request failed");
        GatewayError::Upstream("upstream request failed".to_string())
    })?;

    let status = response.status();
    let headers = response.headers().clone();

    // Check Content-Length before reading (fast path)
    if let Some(cl) = response.content_length() {
        if cl > max_body_bytes as u64 {
            UPSTREAM_ERRORS.inc();
            return Err(GatewayError::Upstream(format!(
                "upstream response too large: {} bytes (max {})",
                cl, max_body_bytes
            )));
        }
    }

    // Chunked responses without Content-Length are cut off as soon as they pass the cap
    let mut body_buf = Vec::with_capacity(
        response
            .content_length()
            .map(|cl| cl as usize)
            .unwrap_or(8192)
            .min(max_body_bytes),
    );
    while let Some(chunk) = response.chunk().await.map_err(|e| {
        UPSTREAM_ERRORS.inc();
        tracing::error!(target = %target_url, error = %e, "failed to read upstream body");
        GatewayError::Upstream("failed to read upstream response".to_string())
    })? {
        if body_buf.len() + chunk.len() > max_body_bytes {
            UPSTREAM_ERRORS.inc();
            return Err(GatewayError::Upstream(format!(
                "upstream response too large (max {} bytes)",
                max_body_bytes
            )));
        }
        body_buf.extend_from_slice(&chunk);
    }
    timer.observe_duration();

    let status = actix_web::http::StatusCode::from_u16(status.as_u16())
        .map_err(|_| GatewayError::Upstream(format!("invalid upstream status {status}")))?;
    let mut builder = HttpResponse::build(status);

    for (name, value) in headers.iter() {
        let name_lower = name.as_str().to_lowercase();
        if !RESPONSE_HEADERS_TO_STRIP.contains(&name_lower.as_str()) {
            builder.append_header((name.as_str(), value.as_bytes()));
        }
    }

    tracing::debug!(
        target = %target_url,
        status = status.as_u16(),
        licensed,
        bytes = body_buf.len(),
        "proxied"
    );

    Ok(builder.body(Bytes::from(body_buf)))
}
