use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Switch,
    Launch,
    Terminate,
    CreateReplica,
    PromoteReplica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
    Expired,
}

/// Priority tiers, higher first. Named per §4.6 so call sites read like
/// the spec rather than bare integers.
pub mod priority {
    pub const EMERGENCY_PROMOTE: i16 = 100;
    pub const EMERGENCY_CREATE_REPLICA: i16 = 90;
    pub const MANUAL_SWITCH: i16 = 75;
    pub const SCORER_SWITCH: i16 = 50;
    pub const ROUTINE_TERMINATE: i16 = 20;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    pub instance_id: Option<Uuid>,
    pub command_type: CommandType,
    pub target_mode: Option<Mode>,
    pub target_pool_id: Option<String>,
    pub priority: i16,
    pub terminate_wait_seconds: Option<i64>,
    pub status: CommandStatus,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub message: Option<String>,
}

impl Command {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: Uuid,
        agent_id: Uuid,
        instance_id: Option<Uuid>,
        command_type: CommandType,
        target_mode: Option<Mode>,
        target_pool_id: Option<String>,
        priority: i16,
        request_id: impl Into<String>,
        deadline_seconds: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            agent_id,
            instance_id,
            command_type,
            target_mode,
            target_pool_id,
            priority,
            terminate_wait_seconds: None,
            status: CommandStatus::Pending,
            request_id: request_id.into(),
            created_at: now,
            deadline: now + chrono::Duration::seconds(deadline_seconds),
            executed_at: None,
            success: None,
            message: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == CommandStatus::Pending && now > self.deadline
    }
}
