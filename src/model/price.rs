use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Agent,
    ProviderApi,
    Interpolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSampleRole {
    Primary,
    Replica,
}

/// Raw, append-only sample as reported by an agent or fetched from a
/// provider price-history API. TTL 7 days, swept by
/// `pricing::pipeline::enforce_retention`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSample {
    pub id: Uuid,
    pub pool_id: String,
    pub price: f64,
    pub captured_at: DateTime<Utc>,
    pub source: PriceSource,
    pub role: PriceSampleRole,
    pub agent_id: Option<Uuid>,
}

/// One row of the consolidated 5-minute-bucket series. Primary key
/// `(pool_id, timestamp)`; rows are replaced wholesale by each
/// consolidation run, not appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedPrice {
    pub pool_id: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub source: PriceSource,
    pub confidence: f64,
    pub run_id: Uuid,
}

/// Canonical feature-store row, copied from consolidated rows with
/// `source in {agent, provider_api}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalPrice {
    pub pool_id: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub source: PriceSource,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnDemandPrice {
    pub region: String,
    pub instance_type: String,
    pub price: f64,
    pub effective_at: DateTime<Utc>,
}
