pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod metering;
pub mod metrics;
pub mod pipeline;
pub mod proxy;
pub mod rate_limit;
pub mod router;
pub mod routes;
pub mod state;
pub mod verifier;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use pipeline::{Decision, Pipeline};
pub use state::AppState;
