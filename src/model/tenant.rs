use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A billing/auth boundary. Every agent, instance and command belongs to
/// exactly one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    /// Opaque bearer secret checked by `api::auth`. Never logged.
    pub auth_token: String,
    pub enabled: bool,
    pub total_savings: f64,
}

impl Tenant {
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            auth_token: auth_token.into(),
            enabled: true,
            total_savings: 0.0,
        }
    }
}
