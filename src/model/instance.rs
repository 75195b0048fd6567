use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Mode;

/// Valid transitions are exactly the edges drawn in `state_machine`; any
/// other transition is a programming error (`ControlPlaneError::Fatal`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Launching,
    RunningPrimary,
    RunningReplica,
    Promoting,
    Zombie,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub tenant_id: Uuid,
    pub instance_type: String,
    pub region: String,
    pub az: String,
    pub pool_id: String,
    pub mode: Mode,
    pub status: InstanceStatus,
    pub is_primary: bool,
    pub is_active: bool,
    pub version: i64,
    pub spot_price: Option<f64>,
    pub ondemand_price: Option<f64>,
    pub baseline_ondemand_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub boot_completed_at: Option<DateTime<Utc>>,
    pub termination_attempted_at: Option<DateTime<Utc>>,
    pub termination_confirmed: bool,
    /// Set when this row was promoted from a replica — used by
    /// `emergency::fastest_boot_pool`'s historical-mean ranking.
    pub boot_duration_seconds: Option<i64>,
    pub replica_synced_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(
        agent_id: Uuid,
        tenant_id: Uuid,
        instance_type: String,
        region: String,
        az: String,
        pool_id: String,
        mode: Mode,
        status: InstanceStatus,
        is_primary: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            tenant_id,
            instance_type,
            region,
            az,
            pool_id,
            mode,
            status,
            is_primary,
            is_active: true,
            version: 0,
            spot_price: None,
            ondemand_price: None,
            baseline_ondemand_price: None,
            created_at: now,
            updated_at: now,
            promoted_at: None,
            boot_completed_at: None,
            termination_attempted_at: None,
            termination_confirmed: false,
            boot_duration_seconds: None,
            replica_synced_at: None,
        }
    }

    /// True for the states a heartbeat must never resurrect from.
    pub fn rejects_heartbeat(&self) -> bool {
        matches!(self.status, InstanceStatus::Zombie | InstanceStatus::Terminated) || !self.is_primary
    }

    pub fn is_ready_replica(&self) -> bool {
        self.status == InstanceStatus::RunningReplica && self.replica_synced_at.is_some()
    }
}
