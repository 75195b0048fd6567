use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    High,
    Critical,
}

/// Audit row for any recommendation the Safety Enforcer rejected or
/// modified. `original` and `safe_alternative` are stored as JSON since
/// their shape is the caller-supplied recommendation, not a Store entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyViolation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub severity: ViolationSeverity,
    pub violated_constraints: Vec<String>,
    pub original: serde_json::Value,
    pub safe_alternative: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
