//! Fleet control plane: re-homes customer VMs between spot/on-demand
//! purchasing modes and between spot capacity pools, with sub-15-second
//! emergency failover on cloud rebalance/termination signals.

pub mod api;
pub mod config;
pub mod decision;
pub mod dispatcher;
pub mod emergency;
pub mod error;
pub mod events;
pub mod model;
pub mod pricing;
pub mod rate_limit;
pub mod safety;
pub mod scheduler;
pub mod state_machine;
pub mod store;

use std::sync::Arc;

use api::AppState;
use config::AppConfig;
use decision::{DecisionEngineHarness, RuleBasedScorer};
use dispatcher::Dispatcher;
use emergency::EmergencyOrchestrator;
use events::EventBus;
use pricing::PricingPipeline;
use rate_limit::{PriceSampleBuffer, RateLimiter};
use safety::SafetyEnforcer;
use scheduler::Scheduler;
use state_machine::StateMachine;
use store::Store;

/// Wires every component against one `Store` backend. Built once in
/// `main`, then split into an `AppState` for the API router and a
/// `Scheduler` for the background jobs — both hold the same `Arc`s.
pub struct ControlPlane<S: Store> {
    pub store: Arc<S>,
    pub dispatcher: Arc<Dispatcher<S>>,
    pub safety: Arc<SafetyEnforcer<S>>,
    pub state_machine: Arc<StateMachine<S>>,
    pub decision: Arc<DecisionEngineHarness<S>>,
    pub emergency: Arc<EmergencyOrchestrator<S>>,
    pub pricing: Arc<PricingPipeline<S>>,
    pub events: EventBus,
    pub config: AppConfig,
}

impl<S: Store> ControlPlane<S> {
    pub fn new(store: Arc<S>, config: AppConfig) -> Self {
        let state_machine = Arc::new(StateMachine::new(store.clone()));
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), config.dispatcher.clone()));
        let safety = Arc::new(SafetyEnforcer::new(store.clone(), config.safety.clone()));
        let decision = Arc::new(DecisionEngineHarness::new(store.clone(), Arc::new(RuleBasedScorer)));
        let emergency = Arc::new(EmergencyOrchestrator::new(store.clone(), state_machine.clone(), config.emergency.clone()));
        let pricing = Arc::new(PricingPipeline::new(store.clone(), config.pricing.clone()));
        let events = EventBus::default();

        Self { store, dispatcher, safety, state_machine, decision, emergency, pricing, events, config }
    }

    pub fn api_state(&self) -> AppState<S> {
        AppState {
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            safety: self.safety.clone(),
            state_machine: self.state_machine.clone(),
            decision: self.decision.clone(),
            emergency: self.emergency.clone(),
            pricing: self.pricing.clone(),
            events: self.events.clone(),
            rate_limiter: Arc::new(RateLimiter::new(self.config.api.rate_limit_per_minute)),
            price_buffer: Arc::new(PriceSampleBuffer::new(self.config.api.price_sample_buffer_per_pool_per_minute)),
            config: self.config.api.clone(),
        }
    }

    pub fn scheduler(&self) -> Scheduler<S> {
        Scheduler::new(
            self.store.clone(),
            self.dispatcher.clone(),
            self.pricing.clone(),
            self.decision.clone(),
            self.safety.clone(),
            self.events.clone(),
            self.config.scheduler.clone(),
        )
    }
}
