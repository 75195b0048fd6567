//! API Surface (§4.9): axum router wiring `AppState<S>` (every
//! component, each `Arc`-shared) to the agent-facing and operator-facing
//! handlers in `routes`. Grounded on the teacher's `admin.rs`
//! `Router::with_state` / `axum::serve` shape, generalized from its
//! single concrete state to a `Store`-generic one.

pub mod auth;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::config::ApiConfig;
use crate::decision::DecisionEngineHarness;
use crate::dispatcher::Dispatcher;
use crate::emergency::EmergencyOrchestrator;
use crate::events::EventBus;
use crate::pricing::PricingPipeline;
use crate::rate_limit::{PriceSampleBuffer, RateLimiter};
use crate::safety::SafetyEnforcer;
use crate::state_machine::StateMachine;
use crate::store::Store;

pub struct AppState<S: Store> {
    pub store: Arc<S>,
    pub dispatcher: Arc<Dispatcher<S>>,
    pub safety: Arc<SafetyEnforcer<S>>,
    pub state_machine: Arc<StateMachine<S>>,
    pub decision: Arc<DecisionEngineHarness<S>>,
    pub emergency: Arc<EmergencyOrchestrator<S>>,
    pub pricing: Arc<PricingPipeline<S>>,
    pub events: EventBus,
    pub rate_limiter: Arc<RateLimiter>,
    pub price_buffer: Arc<PriceSampleBuffer>,
    pub config: ApiConfig,
}

impl<S: Store> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            safety: self.safety.clone(),
            state_machine: self.state_machine.clone(),
            decision: self.decision.clone(),
            emergency: self.emergency.clone(),
            pricing: self.pricing.clone(),
            events: self.events.clone(),
            rate_limiter: self.rate_limiter.clone(),
            price_buffer: self.price_buffer.clone(),
            config: self.config.clone(),
        }
    }
}

pub fn build_router<S: Store>(state: AppState<S>) -> Router {
    Router::new()
        .route("/agents/register", post(routes::register))
        .route("/agents/:id/heartbeat", post(routes::heartbeat))
        .route("/agents/:id/commands", get(routes::poll_commands))
        .route("/agents/:id/commands/:cmd_id/report", post(routes::report_execution))
        .route("/agents/:id/switch-report", post(routes::switch_report))
        .route("/agents/:id/pricing-report", post(routes::pricing_report))
        .route("/agents/:id/rebalance-recommendation", post(routes::rebalance_recommendation))
        .route("/agents/:id/termination-imminent", post(routes::termination_imminent))
        .route("/agents/:id/termination-report", post(routes::termination_report))
        .route("/instances", get(routes::list_instances))
        .route("/agents/:id/force-switch", post(routes::force_switch))
        .route("/agents/:id/emergency-status", get(routes::emergency_status))
        .route("/notifications", get(routes::notifications))
        .with_state(state)
}
