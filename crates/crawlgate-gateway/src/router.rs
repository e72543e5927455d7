use std::collections::HashMap;

/// Static hostname → origin base URL table with a default fallback.
///
/// Unmapped hosts go to the default origin. This is an operability policy,
/// not a security boundary.
#[derive(Debug, Clone, Default)]
pub struct OriginRouter {
    mappings: HashMap<String, String>,
    default_origin: Option<String>,
}

impl OriginRouter {
    pub fn new(mappings: HashMap<String, String>, default_origin: Option<String>) -> Self {
        let mappings = mappings
            .into_iter()
            .map(|(host, origin)| {
                (
                    strip_port(&host).to_ascii_lowercase(),
                    origin.trim_end_matches('/').to_string(),
                )
            })
            .collect();

        Self {
            mappings,
            default_origin: default_origin.map(|o| o.trim_end_matches('/').to_string()),
        }
    }

    /// Resolve a `Host` header value to an origin base URL.
    ///
    /// Returns `None` only when the host is unmapped and no default origin is configured.
    pub fn resolve(&self, host: &str) -> Option<&str> {
        let host = strip_port(host.trim()).to_ascii_lowercase();
        self.mappings
            .get(&host)
            .or(self.default_origin.as_ref())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn has_default(&self) -> bool {
        self.default_origin.is_some()
    }
}

/// Strip a `:port` suffix, including from bracketed IPv6 literals (`[::1]:8080`).
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }

    match host.rfind(':') {
        // More than one colon without brackets is a bare IPv6 literal
        Some(idx) if !host[..idx].contains(':') => &host[..idx],
        _ => host,
    }
}
