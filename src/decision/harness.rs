//! Decision Engine Harness (§4.4). Wraps a pluggable `Scorer`, applies
//! hard pre-filters before delegating, persists every decision
//! (filtered or scored) via `Store::insert_decision`, and falls back to
//! the rule-based scorer on error. Hot-reload is an atomic
//! `RwLock<Arc<dyn Scorer>>` swap per the explicit-engine-handle design
//! note.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::decision::scorer::{Action, RuleBasedScorer, Scorer, ScorerInput, ScorerOutput};
use crate::model::{Agent, Instance};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    pub action: Action,
    pub target_mode: Option<crate::model::Mode>,
    pub target_pool_id: Option<String>,
    pub risk_score: f64,
    pub expected_savings_per_hour: f64,
    pub confidence: f64,
    pub reason: String,
    pub filtered: bool,
    pub created_at: DateTime<Utc>,
}

pub struct DecisionInput<'a> {
    pub agent: &'a Agent,
    pub instance: &'a Instance,
    pub scorer_input: ScorerInput,
    pub recent_switches_in_7d: u32,
}

pub struct DecisionEngineHarness<S: Store> {
    store: Arc<S>,
    scorer: RwLock<Arc<dyn Scorer>>,
    fallback: Arc<dyn Scorer>,
}

impl<S: Store> DecisionEngineHarness<S> {
    pub fn new(store: Arc<S>, scorer: Arc<dyn Scorer>) -> Self {
        Self { store, scorer: RwLock::new(scorer), fallback: Arc::new(RuleBasedScorer) }
    }

    /// Atomic pointer swap, observed by the next `decide` call.
    pub fn reload_scorer(&self, scorer: Arc<dyn Scorer>) {
        let mut guard = self.scorer.write().unwrap();
        tracing::info!(from = guard.name(), to = scorer.name(), "reloading scorer");
        *guard = scorer;
    }

    pub async fn decide(&self, input: DecisionInput<'_>) -> Decision {
        let DecisionInput { agent, recent_switches_in_7d, scorer_input, .. } = input;

        let decision = if !agent.config.enabled {
            filtered(agent.tenant_id, agent.agent_id, "agent disabled")
        } else if !agent.config.auto_switch_enabled {
            filtered(agent.tenant_id, agent.agent_id, "auto switch off")
        } else if recent_switches_in_7d >= agent.config.max_switches_per_week {
            filtered(agent.tenant_id, agent.agent_id, "rate-limited")
        } else if agent
            .last_switch_at
            .is_some_and(|last| (Utc::now() - last).num_hours() < agent.config.min_pool_duration_hours)
        {
            filtered(agent.tenant_id, agent.agent_id, "rate-limited")
        } else {
            let scorer = self.scorer.read().unwrap().clone();
            let output = scorer.score(&scorer_input).unwrap_or_else(|err| {
                tracing::warn!(error = %err, scorer = scorer.name(), "scorer errored, falling back");
                self.fallback.score(&scorer_input).unwrap_or_else(|_| ScorerOutput::stay("scorer unavailable"))
            });
            to_decision(agent.tenant_id, agent.agent_id, output, false)
        };

        if let Err(err) = self.store.insert_decision(decision.clone()).await {
            tracing::warn!(%err, agent_id = %agent.agent_id, "failed to persist decision");
        }
        decision
    }
}

fn filtered(tenant_id: Uuid, agent_id: Uuid, reason: &str) -> Decision {
    Decision {
        id: Uuid::new_v4(),
        tenant_id,
        agent_id,
        action: Action::Stay,
        target_mode: None,
        target_pool_id: None,
        risk_score: 0.0,
        expected_savings_per_hour: 0.0,
        confidence: 0.0,
        reason: reason.to_string(),
        filtered: true,
        created_at: Utc::now(),
    }
}

fn to_decision(tenant_id: Uuid, agent_id: Uuid, output: ScorerOutput, filtered: bool) -> Decision {
    Decision {
        id: Uuid::new_v4(),
        tenant_id,
        agent_id,
        action: output.action,
        target_mode: output.target_mode,
        target_pool_id: output.target_pool_id,
        risk_score: output.risk_score,
        expected_savings_per_hour: output.expected_savings_per_hour,
        confidence: output.confidence,
        reason: output.reason,
        filtered,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::scorer::AlternativePool;
    use crate::model::{AgentConfig, AgentStatus, InstanceStatus, Mode, NoticeStatus};
    use crate::store::MemoryStore;

    struct StubScorer(ScorerOutput);
    impl Scorer for StubScorer {
        fn score(&self, _input: &ScorerInput) -> anyhow::Result<ScorerOutput> {
            Ok(self.0.clone())
        }
    }

    fn agent(config: AgentConfig) -> Agent {
        Agent {
            agent_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            logical_id: "a".into(),
            instance_id: None,
            mode: Mode::Spot,
            current_pool_id: Some("m5.large.us-east-1a".into()),
            region: "us-east-1".into(),
            az: "us-east-1a".into(),
            last_heartbeat_at: Utc::now(),
            status: AgentStatus::Online,
            config,
            config_version: 1,
            notice_status: NoticeStatus::None,
            notice_deadline: None,
            last_switch_at: None,
            recent_switches_in_7d: 0,
            version: 0,
        }
    }

    fn instance(agent_id: Uuid) -> Instance {
        Instance::new(
            agent_id,
            Uuid::new_v4(),
            "m5.large".into(),
            "us-east-1".into(),
            "us-east-1a".into(),
            "m5.large.us-east-1a".into(),
            Mode::Spot,
            InstanceStatus::RunningPrimary,
            true,
        )
    }

    fn scorer_input() -> ScorerInput {
        ScorerInput {
            current_pool_id: "m5.large.us-east-1a".into(),
            current_mode: Mode::Spot,
            current_price: 0.04,
            ondemand_price: 0.096,
            alternatives: vec![AlternativePool { pool_id: "m5.large.us-east-1b".into(), az: "us-east-1b".into(), canonical_price: 0.034 }],
            risk_threshold: 0.75,
            min_savings_percent: 10.0,
        }
    }

    #[tokio::test]
    async fn s1_normal_approved_switch_delegates_to_scorer() {
        let output = ScorerOutput {
            action: Action::Switch,
            target_mode: Some(Mode::Spot),
            target_pool_id: Some("m5.large.us-east-1b".into()),
            risk_score: 0.82,
            expected_savings_per_hour: 0.006,
            confidence: 0.9,
            reason: "favorable pool".into(),
        };
        let store = Arc::new(MemoryStore::new());
        let harness = DecisionEngineHarness::new(store.clone(), Arc::new(StubScorer(output)));
        let a = agent(AgentConfig::default());
        let i = instance(a.agent_id);
        let decision = harness.decide(DecisionInput { agent: &a, instance: &i, scorer_input: scorer_input(), recent_switches_in_7d: 0 }).await;
        assert_eq!(decision.action, Action::Switch);
        assert!(!decision.filtered);
        assert_eq!(decision.expected_savings_per_hour, 0.006);
        assert_eq!(store.decision_count(a.agent_id), 1);
    }

    #[tokio::test]
    async fn s2_rate_limited_forces_stay() {
        let output = ScorerOutput { action: Action::Switch, ..ScorerOutput::stay("switch") };
        let store = Arc::new(MemoryStore::new());
        let harness = DecisionEngineHarness::new(store, Arc::new(StubScorer(output)));
        let mut cfg = AgentConfig::default();
        cfg.max_switches_per_week = 10;
        let a = agent(cfg);
        let i = instance(a.agent_id);
        let decision = harness.decide(DecisionInput { agent: &a, instance: &i, scorer_input: scorer_input(), recent_switches_in_7d: 10 }).await;
        assert_eq!(decision.action, Action::Stay);
        assert_eq!(decision.reason, "rate-limited");
        assert!(decision.filtered);
    }

    #[tokio::test]
    async fn disabled_agent_forces_stay() {
        let output = ScorerOutput { action: Action::Switch, ..ScorerOutput::stay("switch") };
        let store = Arc::new(MemoryStore::new());
        let harness = DecisionEngineHarness::new(store, Arc::new(StubScorer(output)));
        let mut cfg = AgentConfig::default();
        cfg.enabled = false;
        let a = agent(cfg);
        let i = instance(a.agent_id);
        let decision = harness.decide(DecisionInput { agent: &a, instance: &i, scorer_input: scorer_input(), recent_switches_in_7d: 0 }).await;
        assert_eq!(decision.reason, "agent disabled");
    }
}
