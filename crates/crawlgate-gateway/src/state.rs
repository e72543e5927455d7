use crate::classifier::TrafficClassifier;
use crate::config::GatewayConfig;
use crate::metering::MeteringReporter;
use crate::pipeline::Pipeline;
use crate::rate_limit::{
    CounterBackend, MemoryCounterStore, RateLimitSettings, RateLimiter, RedisCounterStore,
    StoreError,
};
use crate::router::OriginRouter;
use crate::verifier::LicenseVerifier;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub pipeline: Arc<Pipeline<CounterBackend>>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self, StateError> {
        let store = match config.redis_url {
            Some(ref url) => CounterBackend::Redis(RedisCounterStore::open(
                url,
                config.rate_limit_key_prefix.clone(),
            )?),
            None => {
                tracing::warn!(
                    "REDIS_URL not set; rate-limit counters are process-local and not shared between instances"
                );
                CounterBackend::Memory(MemoryCounterStore::new())
            }
        };
        Self::with_store(config, store)
    }

    pub fn with_store(config: GatewayConfig, store: CounterBackend) -> Result<Self, StateError> {
        // Upstream redirects are relayed to the client, never followed
        let proxy_client = reqwest::Client::builder()
            .timeout(config.proxy_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        // Per-call timeouts are set by the verifier and the reporter
        let authority_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let rate_limiter = RateLimiter::new(
            store,
            RateLimitSettings {
                window: config.rate_limit_window,
                max_requests: config.rate_limit_max_requests,
                failure_policy: config.rate_limit_failure_policy,
                store_timeout: config.counter_store_timeout,
            },
        );

        let pipeline = Pipeline {
            classifier: TrafficClassifier::new(&config.extra_bot_patterns),
            router: OriginRouter::new(config.origin_map.clone(), config.default_origin.clone()),
            rate_limiter,
            verifier: LicenseVerifier::new(
                authority_client.clone(),
                &config.authority_url,
                config.verify_timeout,
            ),
            reporter: MeteringReporter::new(
                authority_client,
                &config.authority_url,
                config.usage_timeout,
            ),
            proxy_client,
            authority_url: config.authority_url.clone(),
            max_body_bytes: config.max_body_bytes,
        };

        Ok(Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to create HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("invalid counter store: {0}")]
    CounterStore(#[from] StoreError),
}
