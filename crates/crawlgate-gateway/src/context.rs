use actix_web::HttpRequest;

/// Header carrying a bot access token.
pub const AGENT_TOKEN_HEADER: &str = "x-agent-token";
/// Query parameter carrying a bot access token.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Immutable per-request snapshot consumed by the decision pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub method: String,
    /// Original path plus query string, e.g. `/articles/42?page=2`
    pub path_and_query: String,
    pub client_ip: String,
    pub user_agent: Option<String>,
    /// `Host` as presented by the client, port included
    pub host: String,
    pub scheme: String,
    pub token: Option<String>,
}

impl RequestContext {
    pub fn from_request(req: &HttpRequest, trust_forwarded_for: bool) -> Self {
        let conn = req.connection_info();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Self {
            method: req.method().as_str().to_string(),
            path_and_query,
            client_ip: client_ip(req, trust_forwarded_for),
            user_agent: user_agent(req),
            host: conn.host().to_string(),
            scheme: conn.scheme().to_string(),
            token: extract_token(req),
        }
    }

    pub fn path(&self) -> &str {
        match self.path_and_query.find('?') {
            Some(idx) => &self.path_and_query[..idx],
            None => &self.path_and_query,
        }
    }

    /// `scheme://host/path?query` as the client requested it.
    pub fn absolute_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path_and_query)
    }

    /// `scheme://host/path` with the query string removed.
    pub fn canonical_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path())
    }

    pub fn user_agent_or_empty(&self) -> &str {
        self.user_agent.as_deref().unwrap_or("")
    }
}

fn header_str<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// User-Agent decoded lossily; an agent string with stray non-ASCII bytes is
/// still classified.
fn user_agent(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("user-agent")
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

/// Client IP, preferring the first `X-Forwarded-For` hop when trusted,
/// then `X-Real-IP`, then the transport peer address.
fn client_ip(req: &HttpRequest, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = header_str(req, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }

        if let Some(ip) = header_str(req, "x-real-ip").map(str::trim).filter(|ip| !ip.is_empty()) {
            return ip.to_string();
        }
    }

    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Token from the `token` query parameter, falling back to `X-Agent-Token`.
fn extract_token(req: &HttpRequest) -> Option<String> {
    let non_empty = |t: &str| {
        let t = t.trim();
        (!t.is_empty()).then(|| t.to_string())
    };

    let from_query = req.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == TOKEN_QUERY_PARAM)
            .and_then(|(_, value)| non_empty(&value))
    });

    from_query.or_else(|| header_str(req, AGENT_TOKEN_HEADER).and_then(non_empty))
}
