//! In-memory `Store` backend used by unit tests. Plain `Mutex`-guarded
//! maps with the same version-counter semantics as the Postgres backend;
//! never touches the network, following the teacher's own preference
//! for bare in-memory fixtures over a live exchange in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::decision::Decision;
use crate::model::{
    Agent, CanonicalPrice, Command, CommandStatus, ConsolidatedPrice, Instance, InstanceStatus,
    OnDemandPrice, Pool, PriceSample, SafetyViolation, SwitchRecord, SystemEvent, Tenant, Version,
};

use super::{command_is_redundant, CutoverBatch, Store, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    tenants: HashMap<Uuid, Tenant>,
    agents: HashMap<Uuid, Agent>,
    instances: HashMap<Uuid, Instance>,
    pools: HashMap<String, Pool>,
    commands: HashMap<Uuid, Command>,
    switches: Vec<SwitchRecord>,
    violations: Vec<SafetyViolation>,
    decisions: Vec<Decision>,
    system_events: Vec<SystemEvent>,
    raw_prices: Vec<PriceSample>,
    consolidated: HashMap<String, Vec<ConsolidatedPrice>>,
    canonical: HashMap<String, Vec<CanonicalPrice>>,
    ondemand: HashMap<(String, String), OnDemandPrice>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    /// Test convenience: seed a tenant/agent/instance directly.
    pub fn seed_tenant(&self, tenant: Tenant) {
        self.inner.lock().unwrap().tenants.insert(tenant.id, tenant);
    }

    pub fn seed_agent(&self, agent: Agent) {
        self.inner.lock().unwrap().agents.insert(agent.agent_id, agent);
    }

    pub fn seed_instance(&self, instance: Instance) {
        self.inner.lock().unwrap().instances.insert(instance.id, instance);
    }

    pub fn seed_pool(&self, pool: Pool) {
        self.inner.lock().unwrap().pools.insert(pool.id.clone(), pool);
    }

    /// Test convenience: count safety violations recorded for a tenant.
    pub fn violation_count(&self, tenant_id: Uuid) -> usize {
        self.inner.lock().unwrap().violations.iter().filter(|v| v.tenant_id == tenant_id).count()
    }

    /// Test convenience: count decisions persisted for an agent.
    pub fn decision_count(&self, agent_id: Uuid) -> usize {
        self.inner.lock().unwrap().decisions.iter().filter(|d| d.agent_id == agent_id).count()
    }
}

impl Store for MemoryStore {
    async fn get_tenant(&self, id: Uuid) -> StoreResult<Option<Tenant>> {
        Ok(self.inner.lock().unwrap().tenants.get(&id).cloned())
    }

    async fn get_tenant_by_token(&self, token: &str) -> StoreResult<Option<Tenant>> {
        Ok(self.inner.lock().unwrap().tenants.values().find(|t| t.auth_token == token).cloned())
    }

    async fn add_tenant_savings(&self, tenant_id: Uuid, delta: f64) -> StoreResult<()> {
        let mut g = self.inner.lock().unwrap();
        let t = g.tenants.get_mut(&tenant_id).ok_or(StoreError::NotFound)?;
        t.total_savings += delta;
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> StoreResult<Option<Agent>> {
        Ok(self.inner.lock().unwrap().agents.get(&id).cloned())
    }

    async fn get_agent_by_logical_id(&self, tenant_id: Uuid, logical_id: &str) -> StoreResult<Option<Agent>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .agents
            .values()
            .find(|a| a.tenant_id == tenant_id && a.logical_id == logical_id)
            .cloned())
    }

    async fn list_agents(&self, tenant_id: Uuid) -> StoreResult<Vec<Agent>> {
        Ok(self.inner.lock().unwrap().agents.values().filter(|a| a.tenant_id == tenant_id).cloned().collect())
    }

    async fn list_online_agents(&self) -> StoreResult<Vec<Agent>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .agents
            .values()
            .filter(|a| a.status == crate::model::AgentStatus::Online)
            .cloned()
            .collect())
    }

    async fn insert_agent(&self, agent: Agent) -> StoreResult<Agent> {
        let mut g = self.inner.lock().unwrap();
        g.agents.insert(agent.agent_id, agent.clone());
        Ok(agent)
    }

    async fn update_agent_if(&self, mut agent: Agent, expected_version: Version) -> StoreResult<Agent> {
        let mut g = self.inner.lock().unwrap();
        let current = g.agents.get(&agent.agent_id).ok_or(StoreError::NotFound)?;
        if current.version != expected_version {
            return Err(StoreError::Conflict);
        }
        agent.version = expected_version + 1;
        g.agents.insert(agent.agent_id, agent.clone());
        Ok(agent)
    }

    async fn get_instance(&self, id: Uuid) -> StoreResult<Option<Instance>> {
        Ok(self.inner.lock().unwrap().instances.get(&id).cloned())
    }

    async fn list_instances_for_agent(&self, agent_id: Uuid) -> StoreResult<Vec<Instance>> {
        Ok(self.inner.lock().unwrap().instances.values().filter(|i| i.agent_id == agent_id).cloned().collect())
    }

    async fn list_instances(&self, tenant_id: Uuid) -> StoreResult<Vec<Instance>> {
        Ok(self.inner.lock().unwrap().instances.values().filter(|i| i.tenant_id == tenant_id).cloned().collect())
    }

    async fn insert_instance(&self, instance: Instance) -> StoreResult<Instance> {
        let mut g = self.inner.lock().unwrap();
        g.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn update_instance_if(&self, mut instance: Instance, expected_version: Version) -> StoreResult<Instance> {
        let mut g = self.inner.lock().unwrap();
        let current = g.instances.get(&instance.id).ok_or(StoreError::NotFound)?;
        if current.version != expected_version {
            return Err(StoreError::Conflict);
        }
        instance.version = expected_version + 1;
        instance.updated_at = Utc::now();
        g.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn list_zombies_past_wait(&self, now: DateTime<Utc>) -> StoreResult<Vec<Instance>> {
        let g = self.inner.lock().unwrap();
        Ok(g.instances
            .values()
            .filter(|i| i.status == InstanceStatus::Zombie)
            .filter(|i| {
                let agent_wait = g
                    .agents
                    .get(&i.agent_id)
                    .map(|a| a.config.terminate_wait_seconds)
                    .unwrap_or(300);
                (now - i.updated_at).num_seconds() >= agent_wait
            })
            .cloned()
            .collect())
    }

    async fn list_unconfirmed_terminations(&self, now: DateTime<Utc>) -> StoreResult<Vec<Instance>> {
        let g = self.inner.lock().unwrap();
        Ok(g.instances
            .values()
            .filter(|i| i.status == InstanceStatus::Terminating && !i.termination_confirmed)
            .filter(|i| match i.termination_attempted_at {
                None => true,
                Some(t) => (now - t).num_seconds() >= 300,
            })
            .cloned()
            .collect())
    }

    async fn get_pool(&self, id: &str) -> StoreResult<Option<Pool>> {
        Ok(self.inner.lock().unwrap().pools.get(id).cloned())
    }

    async fn upsert_pool(&self, pool: Pool) -> StoreResult<Pool> {
        let mut g = self.inner.lock().unwrap();
        g.pools.insert(pool.id.clone(), pool.clone());
        Ok(pool)
    }

    async fn list_pools(&self) -> StoreResult<Vec<Pool>> {
        Ok(self.inner.lock().unwrap().pools.values().cloned().collect())
    }

    async fn enqueue_command(&self, command: Command) -> StoreResult<Command> {
        let mut g = self.inner.lock().unwrap();
        if let Some(existing) = g
            .commands
            .values()
            .find(|c| c.agent_id == command.agent_id && c.request_id == command.request_id)
        {
            return Ok(existing.clone());
        }
        // redundant-target rejection per §4.6
        if let Some(agent) = g.agents.get(&command.agent_id) {
            if let Some(pool) = agent.current_pool_id.as_deref() {
                if command_is_redundant(agent.mode, pool, &command) {
                    return Err(StoreError::Backend(anyhow::anyhow!(
                        "redundant command: target already matches current state"
                    )));
                }
            }
        }
        g.commands.insert(command.id, command.clone());
        Ok(command)
    }

    async fn get_command(&self, id: Uuid) -> StoreResult<Option<Command>> {
        Ok(self.inner.lock().unwrap().commands.get(&id).cloned())
    }

    async fn poll_commands(&self, agent_id: Uuid, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<Command>> {
        let mut g = self.inner.lock().unwrap();
        let mut candidates: Vec<Uuid> = g
            .commands
            .values()
            .filter(|c| c.agent_id == agent_id && c.status == CommandStatus::Pending && now <= c.deadline)
            .map(|c| c.id)
            .collect();
        candidates.sort_by_key(|id| {
            let c = &g.commands[id];
            (std::cmp::Reverse(c.priority), c.created_at)
        });
        candidates.truncate(limit);
        let mut out = Vec::with_capacity(candidates.len());
        for id in candidates {
            let c = g.commands.get_mut(&id).unwrap();
            c.status = CommandStatus::InFlight;
            out.push(c.clone());
        }
        Ok(out)
    }

    async fn report_command(
        &self,
        agent_id: Uuid,
        command_id: Uuid,
        success: bool,
        message: Option<String>,
    ) -> StoreResult<Command> {
        let mut g = self.inner.lock().unwrap();
        let c = g.commands.get_mut(&command_id).ok_or(StoreError::NotFound)?;
        if c.agent_id != agent_id {
            return Err(StoreError::NotFound);
        }
        if c.status == CommandStatus::Completed || c.status == CommandStatus::Failed {
            return Ok(c.clone());
        }
        c.status = if success { CommandStatus::Completed } else { CommandStatus::Failed };
        c.executed_at = Some(Utc::now());
        c.success = Some(success);
        c.message = message;
        Ok(c.clone())
    }

    async fn expire_pending_commands(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut g = self.inner.lock().unwrap();
        let mut n = 0u64;
        for c in g.commands.values_mut() {
            if c.is_expired(now) {
                c.status = CommandStatus::Expired;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn apply_cutover(&self, batch: CutoverBatch) -> StoreResult<()> {
        let mut g = self.inner.lock().unwrap();
        {
            let cur = g.instances.get(&batch.new_primary.id).ok_or(StoreError::NotFound)?;
            if cur.version != batch.new_primary_expected_version {
                return Err(StoreError::Conflict);
            }
        }
        {
            let cur = g.instances.get(&batch.old_primary.id).ok_or(StoreError::NotFound)?;
            if cur.version != batch.old_primary_expected_version {
                return Err(StoreError::Conflict);
            }
        }
        {
            let cur = g.agents.get(&batch.agent.agent_id).ok_or(StoreError::NotFound)?;
            if cur.version != batch.agent_expected_version {
                return Err(StoreError::Conflict);
            }
        }
        let mut new_primary = batch.new_primary;
        new_primary.version += 1;
        new_primary.updated_at = Utc::now();
        let mut old_primary = batch.old_primary;
        old_primary.version += 1;
        old_primary.updated_at = Utc::now();
        let mut agent = batch.agent;
        agent.version += 1;

        g.instances.insert(new_primary.id, new_primary);
        g.instances.insert(old_primary.id, old_primary);
        g.agents.insert(agent.agent_id, agent);
        g.switches.push(batch.switch_record);
        Ok(())
    }

    async fn list_switch_records_since(&self, agent_id: Uuid, since: DateTime<Utc>) -> StoreResult<Vec<SwitchRecord>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .switches
            .iter()
            .filter(|s| s.agent_id == agent_id && s.created_at >= since)
            .cloned()
            .collect())
    }

    async fn insert_safety_violation(&self, violation: SafetyViolation) -> StoreResult<()> {
        self.inner.lock().unwrap().violations.push(violation);
        Ok(())
    }

    async fn insert_decision(&self, decision: Decision) -> StoreResult<()> {
        self.inner.lock().unwrap().decisions.push(decision);
        Ok(())
    }

    async fn insert_system_event(&self, event: SystemEvent) -> StoreResult<()> {
        self.inner.lock().unwrap().system_events.push(event);
        Ok(())
    }

    async fn insert_raw_prices(&self, samples: Vec<PriceSample>) -> StoreResult<()> {
        self.inner.lock().unwrap().raw_prices.extend(samples);
        Ok(())
    }

    async fn raw_prices_in_window(&self, pool_id: &str, since: DateTime<Utc>) -> StoreResult<Vec<PriceSample>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .raw_prices
            .iter()
            .filter(|p| p.pool_id == pool_id && p.captured_at >= since)
            .cloned()
            .collect())
    }

    async fn list_pool_ids_with_raw_prices(&self, since: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let g = self.inner.lock().unwrap();
        let mut ids: Vec<String> = g
            .raw_prices
            .iter()
            .filter(|p| p.captured_at >= since)
            .map(|p| p.pool_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn replace_consolidated(&self, pool_id: &str, rows: Vec<ConsolidatedPrice>) -> StoreResult<()> {
        let mut g = self.inner.lock().unwrap();
        let existing = g.consolidated.entry(pool_id.to_string()).or_default();
        for row in rows {
            if let Some(slot) = existing.iter_mut().find(|r| r.timestamp == row.timestamp) {
                *slot = row;
            } else {
                existing.push(row);
            }
        }
        existing.sort_by_key(|r| r.timestamp);
        Ok(())
    }

    async fn consolidated_in_window(&self, pool_id: &str, since: DateTime<Utc>) -> StoreResult<Vec<ConsolidatedPrice>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .consolidated
            .get(pool_id)
            .map(|rows| rows.iter().filter(|r| r.timestamp >= since).cloned().collect())
            .unwrap_or_default())
    }

    async fn replace_canonical(&self, pool_id: &str, rows: Vec<CanonicalPrice>) -> StoreResult<()> {
        let mut g = self.inner.lock().unwrap();
        let existing = g.canonical.entry(pool_id.to_string()).or_default();
        for row in rows {
            if let Some(slot) = existing.iter_mut().find(|r| r.timestamp == row.timestamp) {
                *slot = row;
            } else {
                existing.push(row);
            }
        }
        existing.sort_by_key(|r| r.timestamp);
        Ok(())
    }

    async fn canonical_latest(&self, pool_id: &str) -> StoreResult<Option<CanonicalPrice>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .canonical
            .get(pool_id)
            .and_then(|rows| rows.last().cloned()))
    }

    async fn upsert_ondemand_price(&self, price: OnDemandPrice) -> StoreResult<()> {
        let mut g = self.inner.lock().unwrap();
        g.ondemand.insert((price.region.clone(), price.instance_type.clone()), price);
        Ok(())
    }

    async fn latest_ondemand_price(&self, region: &str, instance_type: &str) -> StoreResult<Option<OnDemandPrice>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .ondemand
            .get(&(region.to_string(), instance_type.to_string()))
            .cloned())
    }

    async fn enforce_retention(
        &self,
        raw_before: DateTime<Utc>,
        consolidated_before: DateTime<Utc>,
        canonical_before: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut g = self.inner.lock().unwrap();
        g.raw_prices.retain(|p| p.captured_at >= raw_before);
        for rows in g.consolidated.values_mut() {
            rows.retain(|r| r.timestamp >= consolidated_before);
        }
        for rows in g.canonical.values_mut() {
            rows.retain(|r| r.timestamp >= canonical_before);
        }
        Ok(())
    }
}
