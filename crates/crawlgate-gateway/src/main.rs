use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crawlgate_gateway::{config::GatewayConfig, metrics::register_metrics, routes, state::AppState};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    let port = config.port;
    let max_body_bytes = config.max_body_bytes;

    tracing::info!("Starting crawlgate-gateway on port {}", port);
    tracing::info!("Licensing authority: {}", config.authority_url);
    tracing::info!(
        "Origins: {} mapped host(s), default {}",
        config.origin_map.len(),
        config.default_origin.as_deref().unwrap_or("<none>")
    );
    tracing::info!(
        "Rate limit: {} requests / {:?}, failure policy {:?}",
        config.rate_limit_max_requests,
        config.rate_limit_window,
        config.rate_limit_failure_policy
    );
    tracing::debug!(?config, "loaded configuration");

    // Register Prometheus metrics
    register_metrics();

    // Create shared state
    let state = match AppState::new(config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Failed to initialize gateway: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        "Counter store: {}",
        state.pipeline.rate_limiter.store().name()
    );
    let state_data = web::Data::new(state);

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(state_data.clone())
            .app_data(web::PayloadConfig::new(max_body_bytes))
            .wrap(Logger::default())
            .configure(routes::health::configure)
            .configure(routes::gateway::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
