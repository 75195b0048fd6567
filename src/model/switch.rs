use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchTrigger {
    Automatic,
    Manual,
    Emergency,
}

/// Immutable audit row written when an agent reports a completed cutover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    pub from_instance_id: Uuid,
    pub to_instance_id: Uuid,
    pub from_pool_id: String,
    pub to_pool_id: String,
    pub from_mode: Mode,
    pub to_mode: Mode,
    pub old_price: f64,
    pub new_price: f64,
    pub savings_impact_per_hour: f64,
    pub downtime_seconds: f64,
    pub trigger: SwitchTrigger,
    pub created_at: DateTime<Utc>,
}

impl SwitchRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: Uuid,
        agent_id: Uuid,
        from_instance_id: Uuid,
        to_instance_id: Uuid,
        from_pool_id: String,
        to_pool_id: String,
        from_mode: Mode,
        to_mode: Mode,
        old_price: f64,
        new_price: f64,
        downtime_seconds: f64,
        trigger: SwitchTrigger,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            agent_id,
            from_instance_id,
            to_instance_id,
            from_pool_id,
            to_pool_id,
            from_mode,
            to_mode,
            old_price,
            new_price,
            savings_impact_per_hour: old_price - new_price,
            downtime_seconds,
            trigger,
            created_at: Utc::now(),
        }
    }

    /// Open question resolution (spec §9): convention carried from the
    /// reference, not a true accounting of realized savings.
    pub fn daily_savings_contribution(&self) -> f64 {
        self.savings_impact_per_hour * 24.0
    }
}
