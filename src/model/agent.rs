use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeStatus {
    None,
    Rebalance,
    Termination,
}

/// Per-agent policy knobs. `auto_switch_enabled` and
/// `manual_replica_enabled` are mutually exclusive — enforced in
/// `Agent::validate_config` rather than at construction, since the Store
/// round-trips this struct independent of the constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub enabled: bool,
    pub auto_switch_enabled: bool,
    pub manual_replica_enabled: bool,
    pub auto_terminate_enabled: bool,
    pub terminate_wait_seconds: i64,
    pub min_savings_percent: f64,
    pub risk_threshold: f64,
    pub max_switches_per_week: u32,
    pub min_pool_duration_hours: i64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_switch_enabled: true,
            manual_replica_enabled: false,
            auto_terminate_enabled: true,
            terminate_wait_seconds: 300,
            min_savings_percent: 10.0,
            risk_threshold: 0.75,
            max_switches_per_week: 10,
            min_pool_duration_hours: 1,
        }
    }
}

impl AgentConfig {
    pub fn is_valid(&self) -> bool {
        !(self.auto_switch_enabled && self.manual_replica_enabled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: Uuid,
    pub tenant_id: Uuid,
    /// Stable across VM reinstalls; unique per tenant.
    pub logical_id: String,
    pub instance_id: Option<Uuid>,
    pub mode: Mode,
    pub current_pool_id: Option<String>,
    pub region: String,
    pub az: String,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: AgentStatus,
    pub config: AgentConfig,
    pub config_version: i64,
    pub notice_status: NoticeStatus,
    pub notice_deadline: Option<DateTime<Utc>>,
    pub last_switch_at: Option<DateTime<Utc>>,
    pub recent_switches_in_7d: u32,
    pub version: i64,
}

impl Agent {
    pub fn new(tenant_id: Uuid, logical_id: impl Into<String>, region: String, az: String, mode: Mode) -> Self {
        let now = Utc::now();
        Self {
            agent_id: Uuid::new_v4(),
            tenant_id,
            logical_id: logical_id.into(),
            instance_id: None,
            mode,
            current_pool_id: None,
            region,
            az,
            last_heartbeat_at: now,
            status: AgentStatus::Online,
            config: AgentConfig::default(),
            config_version: 1,
            notice_status: NoticeStatus::None,
            notice_deadline: None,
            last_switch_at: None,
            recent_switches_in_7d: 0,
            version: 0,
        }
    }

    pub fn is_heartbeat_stale(&self, now: DateTime<Utc>, heartbeat_timeout_seconds: i64) -> bool {
        (now - self.last_heartbeat_at).num_seconds() > heartbeat_timeout_seconds
    }
}
