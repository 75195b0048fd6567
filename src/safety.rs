//! Safety Enforcer (§4.5). Ported algorithmically from
//! `examples/original_source/new app/core-platform/services/safety_enforcer.py`:
//! four non-negotiable constraints, a safe-alternative construction
//! strategy that drops/caps/raises in a fixed order, and an audit row
//! for every non-approved outcome.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SafetyConfig;
use crate::model::{SafetyViolation, ViolationSeverity};
use crate::store::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolAllocation {
    pub pool_id: String,
    pub az: String,
    pub risk_score: f64,
    pub allocation: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetRecommendation {
    pub pools: Vec<PoolAllocation>,
    pub total_capacity: f64,
    pub on_demand_count: f64,
}

#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum SafetyOutcome {
    Approved(FleetRecommendation),
    Modified { safe: FleetRecommendation, modifications: Vec<String> },
    Rejected { violated_constraints: Vec<String> },
}

fn az_diversity(pools: &[PoolAllocation]) -> usize {
    let mut azs: Vec<&str> = pools.iter().map(|p| p.az.as_str()).collect();
    azs.sort_unstable();
    azs.dedup();
    azs.len()
}

fn max_concentration(rec: &FleetRecommendation) -> f64 {
    if rec.total_capacity <= 0.0 {
        return 0.0;
    }
    rec.pools.iter().map(|p| p.allocation / rec.total_capacity).fold(0.0, f64::max)
}

fn ondemand_ratio(rec: &FleetRecommendation) -> f64 {
    if rec.total_capacity <= 0.0 {
        return 1.0;
    }
    rec.on_demand_count / rec.total_capacity
}

fn violations(rec: &FleetRecommendation, cfg: &SafetyConfig) -> Vec<String> {
    let mut out = Vec::new();
    if rec.pools.iter().any(|p| p.risk_score < cfg.risk_floor) {
        out.push("risk_floor".to_string());
    }
    if az_diversity(&rec.pools) < cfg.min_az_diversity {
        out.push("az_diversity".to_string());
    }
    if max_concentration(rec) > cfg.max_pool_concentration {
        out.push("pool_concentration".to_string());
    }
    if ondemand_ratio(rec) < cfg.min_ondemand_buffer {
        out.push("ondemand_buffer".to_string());
    }
    out
}

/// Mirrors `_create_safe_alternative`: drop sub-floor pools, cap
/// concentration, raise the on-demand buffer by shrinking the largest
/// spot pools first, then fail if AZ diversity can't be met.
fn create_safe_alternative(rec: &FleetRecommendation, cfg: &SafetyConfig) -> Option<(FleetRecommendation, Vec<String>)> {
    let mut modifications = Vec::new();
    let mut pools: Vec<PoolAllocation> = rec.pools.iter().filter(|p| p.risk_score >= cfg.risk_floor).cloned().collect();
    if pools.len() < rec.pools.len() {
        modifications.push(format!("dropped {} pool(s) below risk floor", rec.pools.len() - pools.len()));
    }

    if az_diversity(&pools) < cfg.min_az_diversity {
        return None;
    }

    let mut total_capacity = rec.total_capacity;
    for p in pools.iter_mut() {
        let cap = total_capacity * cfg.max_pool_concentration;
        if p.allocation > cap {
            modifications.push(format!("capped {} from {:.4} to {:.4}", p.pool_id, p.allocation, cap));
            p.allocation = cap;
        }
    }

    let mut on_demand_count = rec.on_demand_count;
    let required_ondemand = total_capacity * cfg.min_ondemand_buffer;
    if on_demand_count < required_ondemand {
        let mut deficit = required_ondemand - on_demand_count;
        // Shrink the largest spot pools first until the deficit is covered.
        loop {
            if deficit <= 1e-9 {
                break;
            }
            let Some(largest) = pools
                .iter_mut()
                .filter(|p| p.allocation > 0.0)
                .max_by(|a, b| a.allocation.partial_cmp(&b.allocation).unwrap())
            else {
                break;
            };
            let take = largest.allocation.min(deficit);
            largest.allocation -= take;
            on_demand_count += take;
            deficit -= take;
            modifications.push(format!("shrank {} by {:.4} to raise on-demand buffer", largest.pool_id, take));
        }
        if deficit > 1e-9 {
            return None;
        }
    }
    total_capacity = pools.iter().map(|p| p.allocation).sum::<f64>() + on_demand_count;

    pools.retain(|p| p.allocation > 1e-9);
    if az_diversity(&pools) < cfg.min_az_diversity {
        return None;
    }

    Some((
        FleetRecommendation { pools, total_capacity, on_demand_count },
        modifications,
    ))
}

pub struct SafetyEnforcer<S: Store> {
    store: std::sync::Arc<S>,
    config: SafetyConfig,
}

impl<S: Store> SafetyEnforcer<S> {
    pub fn new(store: std::sync::Arc<S>, config: SafetyConfig) -> Self {
        Self { store, config }
    }

    /// Validates a candidate fleet recommendation and, on failure,
    /// attempts the safe-alternative construction before giving up.
    pub async fn validate(&self, tenant_id: Uuid, rec: FleetRecommendation) -> anyhow::Result<SafetyOutcome> {
        let violated = violations(&rec, &self.config);
        if violated.is_empty() {
            return Ok(SafetyOutcome::Approved(rec));
        }

        let outcome = match create_safe_alternative(&rec, &self.config) {
            Some((safe, modifications)) => {
                self.record(tenant_id, ViolationSeverity::High, violated, &rec, Some(&safe)).await?;
                SafetyOutcome::Modified { safe, modifications }
            }
            None => {
                self.record(tenant_id, ViolationSeverity::Critical, violated.clone(), &rec, None).await?;
                SafetyOutcome::Rejected { violated_constraints: violated }
            }
        };
        Ok(outcome)
    }

    async fn record(
        &self,
        tenant_id: Uuid,
        severity: ViolationSeverity,
        violated_constraints: Vec<String>,
        original: &FleetRecommendation,
        safe_alternative: Option<&FleetRecommendation>,
    ) -> anyhow::Result<()> {
        let violation = SafetyViolation {
            id: Uuid::new_v4(),
            tenant_id,
            severity,
            violated_constraints,
            original: serde_json::to_value(original)?,
            safe_alternative: safe_alternative.map(serde_json::to_value).transpose()?,
            created_at: chrono::Utc::now(),
        };
        tracing::warn!(severity = ?violation.severity, "safety violation recorded");
        self.store.insert_safety_violation(violation).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn pool(id: &str, az: &str, risk: f64, alloc: f64) -> PoolAllocation {
        PoolAllocation { pool_id: id.to_string(), az: az.to_string(), risk_score: risk, allocation: alloc }
    }

    #[tokio::test]
    async fn s3_safety_rejection() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let enforcer = SafetyEnforcer::new(store, SafetyConfig::default());
        let rec = FleetRecommendation {
            pools: vec![
                pool("m5.large.us-east-1a", "us-east-1a", 0.72, 40.0),
                pool("m5.large.us-east-1b", "us-east-1b", 0.80, 30.0),
                pool("m5.large.us-east-1c", "us-east-1c", 0.85, 30.0),
            ],
            total_capacity: 100.0,
            on_demand_count: 0.0,
        };
        let outcome = enforcer.validate(Uuid::new_v4(), rec).await.unwrap();
        match outcome {
            SafetyOutcome::Rejected { violated_constraints } => {
                assert!(violated_constraints.contains(&"risk_floor".to_string()));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn s4_safety_modification() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let enforcer = SafetyEnforcer::new(store, SafetyConfig::default());
        let rec = FleetRecommendation {
            pools: vec![
                pool("m5.large.us-east-1a", "us-east-1a", 0.80, 40.0),
                pool("m5.large.us-east-1b", "us-east-1b", 0.80, 30.0),
                pool("m5.large.us-east-1c", "us-east-1c", 0.85, 30.0),
            ],
            total_capacity: 100.0,
            on_demand_count: 0.0,
        };
        let outcome = enforcer.validate(Uuid::new_v4(), rec).await.unwrap();
        match outcome {
            SafetyOutcome::Modified { safe, .. } => {
                assert!(safe.pools.iter().all(|p| p.allocation / safe.total_capacity <= 0.20 + 1e-6));
                assert!(safe.on_demand_count / safe.total_capacity >= 0.15 - 1e-6);
            }
            other => panic!("expected modification, got {other:?}"),
        }
    }

    #[test]
    fn boundary_exactly_20_percent_approves() {
        let cfg = SafetyConfig::default();
        let rec = FleetRecommendation {
            pools: vec![
                pool("a", "us-east-1a", 0.80, 20.0),
                pool("b", "us-east-1b", 0.80, 20.0),
                pool("c", "us-east-1c", 0.80, 20.0),
                pool("d", "us-east-1a", 0.80, 20.0),
            ],
            total_capacity: 100.0,
            on_demand_count: 15.0,
        };
        assert!(violations(&rec, &cfg).is_empty());
    }

    #[test]
    fn boundary_exactly_15_percent_ondemand_approves() {
        let cfg = SafetyConfig::default();
        let rec = FleetRecommendation {
            pools: vec![
                pool("a", "us-east-1a", 0.80, 20.0),
                pool("b", "us-east-1b", 0.80, 20.0),
                pool("c", "us-east-1c", 0.80, 20.0),
            ],
            total_capacity: 100.0,
            on_demand_count: 15.0,
        };
        assert!(violations(&rec, &cfg).is_empty());
    }
}
