//! The Store: durable state with version-counter optimistic concurrency.
//!
//! Grounded on `examples/ultrasoundlabs-untron-intents/apps/solver/src/db.rs`:
//! a concrete backend struct with inherent async methods per operation
//! rather than a generic query language. Unlike the solver (which only
//! ever runs against Postgres), the components here are written generic
//! over `S: Store` so unit tests run against `MemoryStore` without a
//! network. `Store` uses native `async fn` in traits (stable since Rust
//! 1.75) instead of pulling in `async-trait`, since nothing else in the
//! teacher's dependency stack needs it.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use chrono::{DateTime, Utc};
use std::future::Future;
use uuid::Uuid;

use crate::decision::Decision;
use crate::model::{
    Agent, CanonicalPrice, Command, ConsolidatedPrice, Instance, OnDemandPrice, Pool, PriceSample,
    SafetyViolation, SwitchRecord, SystemEvent, Tenant, Version,
};

/// Atomic four-write cutover batch, per §4.7. Passed as a single value so
/// the backend can apply it inside one transaction.
pub struct CutoverBatch {
    pub new_primary: Instance,
    pub new_primary_expected_version: Version,
    pub old_primary: Instance,
    pub old_primary_expected_version: Version,
    pub agent: Agent,
    pub agent_expected_version: Version,
    pub switch_record: SwitchRecord,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("optimistic lock conflict")]
    Conflict,
    #[error("not found")]
    NotFound,
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Retries `f` up to 3 times on `StoreError::Conflict`, re-invoking the
/// closure (which should re-read and recompute) on each attempt. Per
/// §4.1: "the caller retries from a fresh read up to a bounded number of
/// times (3), then surfaces a retriable error."
pub async fn retry_on_conflict<T, F, Fut>(mut f: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    let mut attempts = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(StoreError::Conflict) if attempts < 3 => {
                attempts += 1;
                tracing::warn!(attempts, "store write conflict, retrying");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

pub trait Store: Send + Sync + 'static {
    // -- Tenant --
    fn get_tenant(&self, id: Uuid) -> impl Future<Output = StoreResult<Option<Tenant>>> + Send;
    fn get_tenant_by_token(&self, token: &str) -> impl Future<Output = StoreResult<Option<Tenant>>> + Send;
    fn add_tenant_savings(&self, tenant_id: Uuid, delta: f64) -> impl Future<Output = StoreResult<()>> + Send;

    // -- Agent --
    fn get_agent(&self, id: Uuid) -> impl Future<Output = StoreResult<Option<Agent>>> + Send;
    fn get_agent_by_logical_id(
        &self,
        tenant_id: Uuid,
        logical_id: &str,
    ) -> impl Future<Output = StoreResult<Option<Agent>>> + Send;
    fn list_agents(&self, tenant_id: Uuid) -> impl Future<Output = StoreResult<Vec<Agent>>> + Send;
    fn list_online_agents(&self) -> impl Future<Output = StoreResult<Vec<Agent>>> + Send;
    fn insert_agent(&self, agent: Agent) -> impl Future<Output = StoreResult<Agent>> + Send;
    fn update_agent_if(
        &self,
        agent: Agent,
        expected_version: Version,
    ) -> impl Future<Output = StoreResult<Agent>> + Send;

    // -- Instance --
    fn get_instance(&self, id: Uuid) -> impl Future<Output = StoreResult<Option<Instance>>> + Send;
    fn list_instances_for_agent(&self, agent_id: Uuid) -> impl Future<Output = StoreResult<Vec<Instance>>> + Send;
    fn list_instances(&self, tenant_id: Uuid) -> impl Future<Output = StoreResult<Vec<Instance>>> + Send;
    fn insert_instance(&self, instance: Instance) -> impl Future<Output = StoreResult<Instance>> + Send;
    fn update_instance_if(
        &self,
        instance: Instance,
        expected_version: Version,
    ) -> impl Future<Output = StoreResult<Instance>> + Send;
    fn list_zombies_past_wait(&self, now: DateTime<Utc>) -> impl Future<Output = StoreResult<Vec<Instance>>> + Send;
    fn list_unconfirmed_terminations(&self, now: DateTime<Utc>) -> impl Future<Output = StoreResult<Vec<Instance>>> + Send;

    // -- Pool --
    fn get_pool(&self, id: &str) -> impl Future<Output = StoreResult<Option<Pool>>> + Send;
    fn upsert_pool(&self, pool: Pool) -> impl Future<Output = StoreResult<Pool>> + Send;
    fn list_pools(&self) -> impl Future<Output = StoreResult<Vec<Pool>>> + Send;

    // -- Command --
    /// Inserts `command` unless `(agent_id, request_id)` already exists,
    /// in which case the existing row is returned (idempotency, §4.6).
    fn enqueue_command(&self, command: Command) -> impl Future<Output = StoreResult<Command>> + Send;
    fn get_command(&self, id: Uuid) -> impl Future<Output = StoreResult<Option<Command>>> + Send;
    /// Atomically selects up to `limit` pending commands for the agent,
    /// ordered `priority desc, created_at asc`, and transitions them to
    /// `in_flight`.
    fn poll_commands(
        &self,
        agent_id: Uuid,
        limit: usize,
        now: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<Vec<Command>>> + Send;
    fn report_command(
        &self,
        agent_id: Uuid,
        command_id: Uuid,
        success: bool,
        message: Option<String>,
    ) -> impl Future<Output = StoreResult<Command>> + Send;
    fn expire_pending_commands(&self, now: DateTime<Utc>) -> impl Future<Output = StoreResult<u64>> + Send;

    // -- Switch / cutover --
    fn apply_cutover(&self, batch: CutoverBatch) -> impl Future<Output = StoreResult<()>> + Send;
    fn list_switch_records_since(
        &self,
        agent_id: Uuid,
        since: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<Vec<SwitchRecord>>> + Send;

    // -- Safety --
    fn insert_safety_violation(&self, violation: SafetyViolation) -> impl Future<Output = StoreResult<()>> + Send;

    // -- Decisions --
    /// Every decision the harness produces, filtered or scored, for
    /// analytics (§4.4).
    fn insert_decision(&self, decision: Decision) -> impl Future<Output = StoreResult<()>> + Send;

    // -- Events --
    fn insert_system_event(&self, event: SystemEvent) -> impl Future<Output = StoreResult<()>> + Send;

    // -- Pricing --
    fn insert_raw_prices(&self, samples: Vec<PriceSample>) -> impl Future<Output = StoreResult<()>> + Send;
    fn raw_prices_in_window(
        &self,
        pool_id: &str,
        since: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<Vec<PriceSample>>> + Send;
    fn list_pool_ids_with_raw_prices(&self, since: DateTime<Utc>) -> impl Future<Output = StoreResult<Vec<String>>> + Send;
    fn replace_consolidated(
        &self,
        pool_id: &str,
        rows: Vec<ConsolidatedPrice>,
    ) -> impl Future<Output = StoreResult<()>> + Send;
    fn consolidated_in_window(
        &self,
        pool_id: &str,
        since: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<Vec<ConsolidatedPrice>>> + Send;
    fn replace_canonical(&self, pool_id: &str, rows: Vec<CanonicalPrice>) -> impl Future<Output = StoreResult<()>> + Send;
    fn canonical_latest(&self, pool_id: &str) -> impl Future<Output = StoreResult<Option<CanonicalPrice>>> + Send;
    fn upsert_ondemand_price(&self, price: OnDemandPrice) -> impl Future<Output = StoreResult<()>> + Send;
    fn latest_ondemand_price(
        &self,
        region: &str,
        instance_type: &str,
    ) -> impl Future<Output = StoreResult<Option<OnDemandPrice>>> + Send;
    fn enforce_retention(
        &self,
        raw_before: DateTime<Utc>,
        consolidated_before: DateTime<Utc>,
        canonical_before: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<()>> + Send;
}

pub(crate) fn command_is_redundant(existing_mode: crate::model::Mode, existing_pool: &str, cmd: &Command) -> bool {
    cmd.command_type == crate::model::CommandType::Switch
        && cmd.target_mode == Some(existing_mode)
        && cmd.target_pool_id.as_deref() == Some(existing_pool)
}
