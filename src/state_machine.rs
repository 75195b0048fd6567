//! Instance/agent state machine (§4.7). The only component allowed to
//! write Instance/Agent status fields; every transition goes through
//! `Store.update_if` so two concurrent observations of the same
//! instance can never both win.

use chrono::Utc;
use uuid::Uuid;

use crate::model::{Instance, InstanceStatus, SwitchRecord, SwitchTrigger};
use crate::store::{retry_on_conflict, CutoverBatch, Store, StoreError, StoreResult};

pub struct StateMachine<S: Store> {
    store: std::sync::Arc<S>,
}

/// Permitted edges, per the diagram in §4.7. Anything else is a
/// programming error, not a request error.
fn transition_allowed(from: InstanceStatus, to: InstanceStatus) -> bool {
    use InstanceStatus::*;
    matches!(
        (from, to),
        (Launching, RunningPrimary)
            | (Launching, RunningReplica)
            | (RunningReplica, Promoting)
            | (Promoting, RunningPrimary)
            | (RunningPrimary, Zombie)
            | (Zombie, Terminating)
            | (Terminating, Terminated)
    )
}

impl<S: Store> StateMachine<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }

    pub async fn transition(&self, mut instance: Instance, to: InstanceStatus) -> anyhow::Result<Instance> {
        if !transition_allowed(instance.status, to) {
            anyhow::bail!("fatal: illegal instance transition {:?} -> {:?}", instance.status, to);
        }
        let expected_version = instance.version;
        instance.status = to;
        match self.store.update_instance_if(instance, expected_version).await {
            Ok(i) => Ok(i),
            Err(StoreError::Conflict) => anyhow::bail!("conflict: instance version changed concurrently"),
            Err(e) => Err(e.into()),
        }
    }

    /// Heartbeat handling: refuses to resurrect a zombie/terminated/non-
    /// primary instance (§4.7, scenario S7). Returns `true` if the
    /// agent's `instance_id` pointer was updated.
    pub async fn accept_heartbeat(&self, agent_id: Uuid, claimed_instance_id: Uuid) -> anyhow::Result<bool> {
        let instance = self.store.get_instance(claimed_instance_id).await?;
        let Some(instance) = instance else {
            return Ok(false);
        };
        if instance.rejects_heartbeat() {
            tracing::warn!(%agent_id, instance_id = %claimed_instance_id, "rejected heartbeat from non-primary/zombie instance");
            return Ok(false);
        }

        retry_on_conflict(|| async {
            let Some(agent) = self.store.get_agent(agent_id).await? else {
                return Err(StoreError::NotFound);
            };
            if agent.instance_id == Some(claimed_instance_id) {
                return Ok(());
            }
            let mut updated = agent.clone();
            updated.instance_id = Some(claimed_instance_id);
            self.store.update_agent_if(updated, agent.version).await?;
            Ok(())
        })
        .await?;
        Ok(true)
    }

    /// One atomic four-write batch (§4.7): new replica -> primary, old
    /// primary -> zombie, agent pointer update, switch record insert.
    pub async fn cutover(
        &self,
        new_replica: Instance,
        old_primary: Instance,
        trigger: SwitchTrigger,
        downtime_seconds: f64,
    ) -> StoreResult<()> {
        if new_replica.status != InstanceStatus::RunningReplica && new_replica.status != InstanceStatus::Promoting {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "fatal: cutover target is not a replica/promoting instance"
            )));
        }
        let Some(agent) = self.store.get_agent(new_replica.agent_id).await? else {
            return Err(StoreError::NotFound);
        };

        let old_price = old_primary.spot_price.or(old_primary.ondemand_price).unwrap_or(0.0);
        let new_price = new_replica.spot_price.or(new_replica.ondemand_price).unwrap_or(0.0);

        let mut new_primary = new_replica.clone();
        new_primary.status = InstanceStatus::RunningPrimary;
        new_primary.is_primary = true;
        new_primary.is_active = true;
        new_primary.promoted_at = Some(Utc::now());

        let mut zombie = old_primary.clone();
        zombie.status = InstanceStatus::Zombie;
        zombie.is_primary = false;
        zombie.is_active = false;

        let switch_record = SwitchRecord::new(
            agent.tenant_id,
            agent.agent_id,
            old_primary.id,
            new_replica.id,
            old_primary.pool_id.clone(),
            new_replica.pool_id.clone(),
            old_primary.mode,
            new_replica.mode,
            old_price,
            new_price,
            downtime_seconds,
            trigger,
        );

        let mut updated_agent = agent.clone();
        updated_agent.instance_id = Some(new_replica.id);
        updated_agent.mode = new_replica.mode;
        updated_agent.current_pool_id = Some(new_replica.pool_id.clone());
        updated_agent.last_switch_at = Some(Utc::now());

        let batch = CutoverBatch {
            new_primary,
            new_primary_expected_version: new_replica.version,
            old_primary: zombie,
            old_primary_expected_version: old_primary.version,
            agent: updated_agent,
            agent_expected_version: agent.version,
            switch_record,
        };

        self.store.apply_cutover(batch).await?;
        self.store.add_tenant_savings(agent.tenant_id, switch_record_daily(old_price, new_price)).await?;
        Ok(())
    }
}

fn switch_record_daily(old_price: f64, new_price: f64) -> f64 {
    (old_price - new_price) * 24.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Agent, Mode, Tenant};
    use crate::store::MemoryStore;

    fn setup() -> (std::sync::Arc<MemoryStore>, Uuid, Instance, Instance) {
        let store = std::sync::Arc::new(MemoryStore::new());
        let tenant = Tenant::new("tok");
        store.seed_tenant(tenant.clone());
        let agent = Agent::new(tenant.id, "logical-1", "us-east-1".into(), "us-east-1a".into(), Mode::Spot);
        let old_primary = Instance::new(
            agent.agent_id,
            tenant.id,
            "m5.large".into(),
            "us-east-1".into(),
            "us-east-1a".into(),
            "m5.large.us-east-1a".into(),
            Mode::Spot,
            InstanceStatus::RunningPrimary,
            true,
        );
        let mut agent = agent;
        agent.instance_id = Some(old_primary.id);
        let mut replica = Instance::new(
            agent.agent_id,
            tenant.id,
            "m5.large".into(),
            "us-east-1".into(),
            "us-east-1b".into(),
            "m5.large.us-east-1b".into(),
            Mode::Spot,
            InstanceStatus::RunningReplica,
            false,
        );
        replica.replica_synced_at = Some(Utc::now());
        store.seed_agent(agent.clone());
        store.seed_instance(old_primary.clone());
        store.seed_instance(replica.clone());
        (store, agent.agent_id, old_primary, replica)
    }

    #[tokio::test]
    async fn s1_cutover_promotes_replica_and_zombifies_primary() {
        let (store, agent_id, old_primary, replica) = setup();
        let sm = StateMachine::new(store.clone());
        sm.cutover(replica.clone(), old_primary.clone(), SwitchTrigger::Automatic, 2.0).await.unwrap();

        let agent = store.get_agent(agent_id).await.unwrap().unwrap();
        assert_eq!(agent.instance_id, Some(replica.id));

        let new_primary = store.get_instance(replica.id).await.unwrap().unwrap();
        assert!(new_primary.is_primary);
        assert_eq!(new_primary.status, InstanceStatus::RunningPrimary);

        let zombie = store.get_instance(old_primary.id).await.unwrap().unwrap();
        assert!(!zombie.is_primary);
        assert_eq!(zombie.status, InstanceStatus::Zombie);
    }

    #[tokio::test]
    async fn s7_zombie_heartbeat_does_not_resurrect() {
        let (store, agent_id, old_primary, replica) = setup();
        let sm = StateMachine::new(store.clone());
        sm.cutover(replica.clone(), old_primary.clone(), SwitchTrigger::Automatic, 2.0).await.unwrap();

        let updated = sm.accept_heartbeat(agent_id, old_primary.id).await.unwrap();
        assert!(!updated);
        let agent = store.get_agent(agent_id).await.unwrap().unwrap();
        assert_eq!(agent.instance_id, Some(replica.id));
    }
}
