//! Per-request decision pipeline.
//!
//! ```text
//!            ┌─────── Human ──────────────────────────────► Proxy
//!  Start ────┤
//!            ├─ Bot + token ─► Verify ─┬─ valid ──────────► ProxyMetered
//!            │                         └─ invalid ────────► RejectInvalidToken (403)
//!            └─ Bot, no token ─► RateLimitCheck ─┬─ allow ─► Redirect (302)
//!                                                └─ deny ──► RejectRateLimited (429)
//! ```
//!
//! [`Pipeline::decide`] walks the states and returns a [`Decision`] without
//! touching the origin; [`Pipeline::execute`] performs the terminal action.

use actix_web::http::header;
use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;

use crate::classifier::{Classification, TrafficClassifier};
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::metering::{MeteringReporter, UsageEvent};
use crate::metrics::{CLASSIFICATIONS, REQUESTS_TOTAL};
use crate::proxy::proxy_request;
use crate::rate_limit::{CounterBackend, CounterStore, RateLimitKey, RateLimiter};
use crate::router::OriginRouter;
use crate::verifier::{LicenseVerifier, VerificationResult};

/// Non-terminal pipeline states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Start,
    Verify { token: String },
    RateLimitCheck,
}

/// Terminal actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Human traffic, passed through untouched
    Proxy,
    /// Licensed bot traffic, proxied and metered
    ProxyMetered(VerificationResult),
    /// Unlicensed bot under budget, sent to the authorization endpoint
    Redirect { location: String },
    /// Token presented but not accepted
    RejectInvalidToken { reason: String },
    /// Unlicensed bot over budget
    RejectRateLimited,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Proxy => "proxy",
            Decision::ProxyMetered(_) => "proxy_metered",
            Decision::Redirect { .. } => "redirect",
            Decision::RejectInvalidToken { .. } => "reject_invalid_token",
            Decision::RejectRateLimited => "reject_rate_limited",
        }
    }
}

enum Step {
    Next(State),
    Done(Decision),
}

/// Everything a request needs to be decided and served.
pub struct Pipeline<S = CounterBackend> {
    pub classifier: TrafficClassifier,
    pub router: OriginRouter,
    pub rate_limiter: RateLimiter<S>,
    pub verifier: LicenseVerifier,
    pub reporter: MeteringReporter,
    pub proxy_client: reqwest::Client,
    pub authority_url: String,
    pub max_body_bytes: usize,
}

impl<S: CounterStore> Pipeline<S> {
    /// Run the state machine to a terminal decision.
    pub async fn decide(&self, ctx: &RequestContext) -> Decision {
        let mut state = State::Start;
        loop {
            match self.step(state, ctx).await {
                Step::Next(next) => state = next,
                Step::Done(decision) => {
                    tracing::debug!(
                        host = %ctx.host,
                        path = %ctx.path(),
                        client_ip = %ctx.client_ip,
                        decision = decision.label(),
                        "request decided"
                    );
                    return decision;
                }
            }
        }
    }

    async fn step(&self, state: State, ctx: &RequestContext) -> Step {
        match state {
            State::Start => {
                let class = self.classifier.classify(ctx.user_agent.as_deref());
                CLASSIFICATIONS.with_label_values(&[class.as_str()]).inc();
                match (class, &ctx.token) {
                    (Classification::Human, _) => Step::Done(Decision::Proxy),
                    (Classification::Bot, Some(token)) => Step::Next(State::Verify {
                        token: token.clone(),
                    }),
                    (Classification::Bot, None) => Step::Next(State::RateLimitCheck),
                }
            }
            State::Verify { token } => {
                let verdict = self.verifier.verify(&token, &ctx.canonical_url()).await;
                if verdict.valid {
                    Step::Done(Decision::ProxyMetered(verdict))
                } else {
                    Step::Done(Decision::RejectInvalidToken {
                        reason: verdict.denial_reason().to_string(),
                    })
                }
            }
            State::RateLimitCheck => {
                let key = RateLimitKey::new(&ctx.client_ip, ctx.user_agent_or_empty());
                if self.rate_limiter.allow(&key).await {
                    Step::Done(Decision::Redirect {
                        location: self.authorize_url(ctx),
                    })
                } else {
                    Step::Done(Decision::RejectRateLimited)
                }
            }
        }
    }

    /// `{authority}/authorize?url=<absolute url>&ua=<user agent>`
    pub fn authorize_url(&self, ctx: &RequestContext) -> String {
        format!(
            "{}/authorize?url={}&ua={}",
            self.authority_url.trim_end_matches('/'),
            urlencoding::encode(&ctx.absolute_url()),
            urlencoding::encode(ctx.user_agent_or_empty()),
        )
    }

    /// Perform the terminal action for `decision`.
    pub async fn execute(
        &self,
        decision: Decision,
        req: &HttpRequest,
        ctx: &RequestContext,
        body: Bytes,
    ) -> Result<HttpResponse, GatewayError> {
        REQUESTS_TOTAL.with_label_values(&[decision.label()]).inc();

        match decision {
            Decision::Proxy => {
                let origin = self.resolve_origin(ctx)?;
                proxy_request(
                    &self.proxy_client,
                    req,
                    ctx,
                    origin,
                    body,
                    false,
                    self.max_body_bytes,
                )
                .await
            }
            Decision::ProxyMetered(verdict) => {
                let origin = self.resolve_origin(ctx)?;
                let response = proxy_request(
                    &self.proxy_client,
                    req,
                    ctx,
                    origin,
                    body,
                    true,
                    self.max_body_bytes,
                )
                .await?;

                // Detached; the response does not wait for it
                let event = UsageEvent::from_verification(
                    &verdict,
                    ctx.canonical_url(),
                    ctx.user_agent_or_empty().to_string(),
                );
                drop(self.reporter.record(event));

                Ok(response)
            }
            Decision::Redirect { location } => Ok(HttpResponse::Found()
                .insert_header((header::LOCATION, location))
                .finish()),
            Decision::RejectInvalidToken { reason } => Err(GatewayError::InvalidToken(reason)),
            Decision::RejectRateLimited => Err(GatewayError::RateLimited),
        }
    }

    fn resolve_origin(&self, ctx: &RequestContext) -> Result<&str, GatewayError> {
        self.router
            .resolve(&ctx.host)
            .ok_or_else(|| GatewayError::UnknownHost(ctx.host.clone()))
    }

    /// Decide and serve one request.
    pub async fn handle(
        &self,
        req: &HttpRequest,
        ctx: &RequestContext,
        body: Bytes,
    ) -> Result<HttpResponse, GatewayError> {
        let decision = self.decide(ctx).await;
        self.execute(decision, req, ctx, body).await
    }
}
