use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Pipeline outcomes
pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("crawlgate_requests_total", "Requests by pipeline decision"),
        &["decision"],
    )
    .unwrap()
});

pub static CLASSIFICATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "crawlgate_classifications_total",
            "Requests by traffic classification",
        ),
        &["class"],
    )
    .unwrap()
});

// Licensing authority
pub static VERIFICATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "crawlgate_verifications_total",
            "Token verifications by outcome",
        ),
        &["result"],
    )
    .unwrap()
});

pub static USAGE_REPORTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("crawlgate_usage_reports_total", "Usage reports by outcome"),
        &["result"],
    )
    .unwrap()
});

pub static RATE_LIMIT_DECISIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "crawlgate_rate_limit_decisions_total",
            "Rate limiter answers for unlicensed bot traffic",
        ),
        &["result"],
    )
    .unwrap()
});

// Proxy metrics
pub static UPSTREAM_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "crawlgate_upstream_errors_total",
        "Proxied requests that failed upstream",
    )
    .unwrap()
});

pub static PROXY_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("crawlgate_proxy_latency_seconds", "Origin round-trip latency")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .unwrap()
});

/// Register all metrics with the registry
pub fn register_metrics() {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(CLASSIFICATIONS.clone())).unwrap();
    REGISTRY.register(Box::new(VERIFICATIONS.clone())).unwrap();
    REGISTRY.register(Box::new(USAGE_REPORTS.clone())).unwrap();
    REGISTRY
        .register(Box::new(RATE_LIMIT_DECISIONS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(UPSTREAM_ERRORS.clone()))
        .unwrap();
    REGISTRY.register(Box::new(PROXY_LATENCY.clone())).unwrap();
}
