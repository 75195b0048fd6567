//! Emergency Orchestrator (§4.8). Ported from
//! `examples/original_source/new-version/central-server/core/emergency.py`:
//! rebalance and termination entry points that bypass normal policy and
//! safety gates but still persist their actions, plus the three-tier
//! `fastest_boot_pool` ranking.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::EmergencyConfig;
use crate::model::{priority, Command, CommandType, Instance, NoticeStatus, Pool};
use crate::state_machine::StateMachine;
use crate::store::{retry_on_conflict, Store, StoreError};

pub struct EmergencyOrchestrator<S: Store> {
    store: Arc<S>,
    state_machine: Arc<StateMachine<S>>,
    config: EmergencyConfig,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EmergencyAction {
    pub agent_id: Uuid,
    pub command_id: Option<Uuid>,
    pub chosen_pool_id: Option<String>,
    pub note: String,
}

impl<S: Store> EmergencyOrchestrator<S> {
    pub fn new(store: Arc<S>, state_machine: Arc<StateMachine<S>>, config: EmergencyConfig) -> Self {
        Self { store, state_machine, config }
    }

    /// The cutover authority used once the agent reports a promoted
    /// replica executed successfully (`api::routes::report_switch`).
    pub fn state_machine(&self) -> &Arc<StateMachine<S>> {
        &self.state_machine
    }

    /// `on_rebalance_recommendation`: best-case path, >= 2 minute horizon.
    pub async fn on_rebalance_recommendation(&self, agent_id: Uuid, notice_time: DateTime<Utc>) -> anyhow::Result<EmergencyAction> {
        let deadline = notice_time + chrono::Duration::seconds(self.config.rebalance_horizon.as_secs() as i64);

        let agent = retry_on_conflict(|| async {
            let Some(agent) = self.store.get_agent(agent_id).await? else {
                return Err(StoreError::NotFound);
            };
            let mut updated = agent.clone();
            updated.notice_status = NoticeStatus::Rebalance;
            updated.notice_deadline = Some(deadline);
            self.store.update_agent_if(updated, agent.version).await
        })
        .await?;

        let pool = self.fastest_boot_pool(&agent.region, &self.current_instance_type(&agent).await?).await?;
        let Some(pool) = pool else {
            tracing::warn!(%agent_id, "no pool available for rebalance replica, scheduler will retry");
            return Ok(EmergencyAction { agent_id, command_id: None, chosen_pool_id: None, note: "no pool history, deferred to scheduler".into() });
        };

        let command = Command::new(
            agent.tenant_id,
            agent_id,
            agent.instance_id,
            CommandType::CreateReplica,
            Some(agent.mode),
            Some(pool.id.clone()),
            priority::EMERGENCY_CREATE_REPLICA,
            format!("rebalance-{agent_id}-{}", notice_time.timestamp()),
            self.config.rebalance_create_replica_deadline.as_secs() as i64,
        );
        let command = self.store.enqueue_command(command).await?;

        Ok(EmergencyAction { agent_id, command_id: Some(command.id), chosen_pool_id: Some(pool.id), note: "create_replica issued".into() })
    }

    /// `on_termination_notice`: worst case, <= 2 minutes. Promotes an
    /// existing ready replica immediately, or creates one under a 60s
    /// deadline.
    pub async fn on_termination_notice(&self, agent_id: Uuid, termination_time: DateTime<Utc>) -> anyhow::Result<EmergencyAction> {
        let agent = retry_on_conflict(|| async {
            let Some(agent) = self.store.get_agent(agent_id).await? else {
                return Err(StoreError::NotFound);
            };
            let mut updated = agent.clone();
            updated.notice_status = NoticeStatus::Termination;
            updated.notice_deadline = Some(termination_time + chrono::Duration::seconds(120));
            self.store.update_agent_if(updated, agent.version).await
        })
        .await?;

        let instances = self.store.list_instances_for_agent(agent_id).await?;
        if let Some(replica) = instances.iter().find(|i| self.verify_replica_health(i, true)) {
            let command = Command::new(
                agent.tenant_id,
                agent_id,
                Some(replica.id),
                CommandType::PromoteReplica,
                Some(replica.mode),
                Some(replica.pool_id.clone()),
                priority::EMERGENCY_PROMOTE,
                format!("termination-promote-{agent_id}-{}", termination_time.timestamp()),
                self.config.termination_promote_deadline.as_secs() as i64,
            );
            let command = self.store.enqueue_command(command).await?;
            return Ok(EmergencyAction {
                agent_id,
                command_id: Some(command.id),
                chosen_pool_id: Some(replica.pool_id.clone()),
                note: "promote_replica issued for ready replica".into(),
            });
        }

        let instance_type = self.current_instance_type(&agent).await?;
        let pool = self.fastest_boot_pool(&agent.region, &instance_type).await?;
        let pool = match pool {
            Some(p) => p,
            None => {
                tracing::warn!(%agent_id, "no pool history for termination path, falling back to current pool");
                let fallback_id = agent.current_pool_id.clone().unwrap_or_else(|| Pool::id_for(&instance_type, &agent.az));
                self.store.get_pool(&fallback_id).await?.unwrap_or_else(|| Pool::new(instance_type.clone(), agent.az.clone(), agent.region.clone()))
            }
        };

        let command = Command::new(
            agent.tenant_id,
            agent_id,
            agent.instance_id,
            CommandType::CreateReplica,
            Some(agent.mode),
            Some(pool.id.clone()),
            priority::EMERGENCY_PROMOTE,
            format!("termination-create-{agent_id}-{}", termination_time.timestamp()),
            self.config.termination_create_replica_deadline.as_secs() as i64,
        );
        let command = self.store.enqueue_command(command).await?;
        Ok(EmergencyAction { agent_id, command_id: Some(command.id), chosen_pool_id: Some(pool.id), note: "emergency create_replica issued".into() })
    }

    /// `verify_replica_health`: bypasses only the `sync_recent` bit
    /// during an emergency; all other health bits are still required.
    fn verify_replica_health(&self, instance: &Instance, bypass_sync_recent: bool) -> bool {
        let base_ready = instance.status == crate::model::InstanceStatus::RunningReplica && instance.boot_completed_at.is_some();
        if !base_ready {
            return false;
        }
        bypass_sync_recent || instance.replica_synced_at.is_some()
    }

    /// `fastest_boot_pool`: historical mean (>=3 samples) -> cached pool
    /// average -> `None` (caller falls back to the agent's current pool
    /// for the termination path only).
    async fn fastest_boot_pool(&self, region: &str, instance_type: &str) -> anyhow::Result<Option<Pool>> {
        let pools = self.store.list_pools().await?;
        let mut candidates: Vec<Pool> = pools
            .into_iter()
            .filter(|p| p.region == region && p.instance_type == instance_type && p.is_active)
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        candidates.sort_by(|a, b| {
            let rank_a = (a.boot_time_sample_count < self.config.min_boot_time_samples, a.avg_boot_time_seconds.unwrap_or(f64::MAX));
            let rank_b = (b.boot_time_sample_count < self.config.min_boot_time_samples, b.avg_boot_time_seconds.unwrap_or(f64::MAX));
            rank_a.partial_cmp(&rank_b).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(candidates.into_iter().next())
    }

    async fn current_instance_type(&self, agent: &crate::model::Agent) -> anyhow::Result<String> {
        if let Some(instance_id) = agent.instance_id {
            if let Some(instance) = self.store.get_instance(instance_id).await? {
                return Ok(instance.instance_type);
            }
        }
        Ok(String::new())
    }

    /// Records a completed promotion's boot duration against its pool,
    /// feeding the historical-mean tier of `fastest_boot_pool`.
    pub async fn record_boot_duration(&self, pool_id: &str, seconds: f64) -> anyhow::Result<()> {
        if let Some(mut pool) = self.store.get_pool(pool_id).await? {
            pool.record_boot_time(seconds);
            self.store.upsert_pool(pool).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Agent, InstanceStatus, Mode, Tenant};
    use crate::store::MemoryStore;

    async fn setup() -> (Arc<MemoryStore>, Agent) {
        let store = Arc::new(MemoryStore::new());
        let tenant = Tenant::new("tok");
        store.seed_tenant(tenant.clone());
        let agent = Agent::new(tenant.id, "a1", "us-east-1".into(), "us-east-1a".into(), Mode::Spot);
        store.seed_agent(agent.clone());
        (store, agent)
    }

    #[tokio::test]
    async fn s5_termination_with_ready_replica_promotes_immediately() {
        let (store, agent) = setup().await;
        let mut replica = Instance::new(
            agent.agent_id,
            agent.tenant_id,
            "m5.large".into(),
            "us-east-1".into(),
            "us-east-1b".into(),
            "m5.large.us-east-1b".into(),
            Mode::Spot,
            InstanceStatus::RunningReplica,
            false,
        );
        replica.boot_completed_at = Some(Utc::now() - chrono::Duration::seconds(20));
        replica.replica_synced_at = Some(Utc::now() - chrono::Duration::seconds(20));
        store.seed_instance(replica.clone());

        let sm = Arc::new(StateMachine::new(store.clone()));
        let orchestrator = EmergencyOrchestrator::new(store.clone(), sm, EmergencyConfig::default());
        let action = orchestrator.on_termination_notice(agent.agent_id, Utc::now()).await.unwrap();
        assert!(action.note.contains("promote_replica"));

        let cmd = store.get_command(action.command_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(cmd.priority, priority::EMERGENCY_PROMOTE);
    }

    #[tokio::test]
    async fn s6_termination_no_replica_falls_back_to_current_pool() {
        let (store, agent) = setup().await;
        store.seed_pool(Pool::new("m5.large", "us-east-1a", "us-east-1"));
        let mut agent = agent;
        agent.current_pool_id = Some("m5.large.us-east-1a".into());
        store.seed_agent(agent.clone());

        let sm = Arc::new(StateMachine::new(store.clone()));
        let orchestrator = EmergencyOrchestrator::new(store.clone(), sm, EmergencyConfig::default());
        let action = orchestrator.on_termination_notice(agent.agent_id, Utc::now()).await.unwrap();
        assert_eq!(action.chosen_pool_id.as_deref(), Some("m5.large.us-east-1a"));
    }
}
