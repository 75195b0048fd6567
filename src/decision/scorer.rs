//! Pluggable scorer contract (§4.4). Pure in-memory and synchronous —
//! per §5, "Decision Engine and Safety Enforcer ... never suspend" —
//! which also keeps `Scorer` object-safe for the hot-reload handle in
//! `harness::DecisionEngineHarness`.

use serde::{Deserialize, Serialize};

use crate::model::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Stay,
    Switch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternativePool {
    pub pool_id: String,
    pub az: String,
    pub canonical_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerInput {
    pub current_pool_id: String,
    pub current_mode: Mode,
    pub current_price: f64,
    pub ondemand_price: f64,
    pub alternatives: Vec<AlternativePool>,
    pub risk_threshold: f64,
    pub min_savings_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerOutput {
    pub action: Action,
    pub target_mode: Option<Mode>,
    pub target_pool_id: Option<String>,
    pub risk_score: f64,
    pub expected_savings_per_hour: f64,
    pub confidence: f64,
    pub reason: String,
}

impl ScorerOutput {
    pub fn stay(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Stay,
            target_mode: None,
            target_pool_id: None,
            risk_score: 0.0,
            expected_savings_per_hour: 0.0,
            confidence: 0.0,
            reason: reason.into(),
        }
    }
}

pub trait Scorer: Send + Sync {
    fn score(&self, input: &ScorerInput) -> anyhow::Result<ScorerOutput>;

    fn name(&self) -> &str {
        "scorer"
    }
}

/// Fallback used when no scorer is loaded or the loaded scorer errors
/// (§4.4): never recommends a switch without a live scorer.
pub struct RuleBasedScorer;

impl Scorer for RuleBasedScorer {
    fn score(&self, input: &ScorerInput) -> anyhow::Result<ScorerOutput> {
        if input.ondemand_price <= 0.0 {
            return Ok(ScorerOutput::stay("no on-demand reference price"));
        }
        let current_savings_percent = (input.ondemand_price - input.current_price) / input.ondemand_price * 100.0;
        if current_savings_percent >= input.min_savings_percent {
            Ok(ScorerOutput::stay("current savings already exceed threshold"))
        } else {
            Ok(ScorerOutput::stay("no live scorer: conservative stay"))
        }
    }

    fn name(&self) -> &str {
        "rule_based_fallback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_based_scorer_never_switches() {
        let scorer = RuleBasedScorer;
        let input = ScorerInput {
            current_pool_id: "m5.large.us-east-1a".into(),
            current_mode: Mode::Spot,
            current_price: 0.09,
            ondemand_price: 0.096,
            alternatives: vec![AlternativePool { pool_id: "m5.large.us-east-1b".into(), az: "us-east-1b".into(), canonical_price: 0.03 }],
            risk_threshold: 0.75,
            min_savings_percent: 10.0,
        };
        let out = scorer.score(&input).unwrap();
        assert_eq!(out.action, Action::Stay);
    }
}
