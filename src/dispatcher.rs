//! Command Dispatcher (§4.6): enqueue/poll/report with idempotency,
//! priority ordering, deadline expiry, and the zombie termination list.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::model::{priority, Command, CommandType, Mode};
use crate::store::{Store, StoreError};

pub struct Dispatcher<S: Store> {
    store: Arc<S>,
    config: DispatcherConfig,
}

impl<S: Store> Dispatcher<S> {
    pub fn new(store: Arc<S>, config: DispatcherConfig) -> Self {
        Self { store, config }
    }

    pub async fn enqueue(&self, command: Command) -> anyhow::Result<Command> {
        match self.store.enqueue_command(command).await {
            Ok(c) => Ok(c),
            Err(StoreError::Backend(e)) => anyhow::bail!("validation: {e}"),
            Err(e) => Err(e.into()),
        }
    }

    pub fn default_deadline_seconds(&self) -> i64 {
        self.config.default_deadline.as_secs() as i64
    }

    pub fn emergency_deadline_seconds(&self) -> i64 {
        self.config.emergency_deadline.as_secs() as i64
    }

    pub async fn poll(&self, agent_id: Uuid, limit: usize) -> anyhow::Result<Vec<Command>> {
        Ok(self.store.poll_commands(agent_id, limit, Utc::now()).await?)
    }

    pub async fn report(
        &self,
        agent_id: Uuid,
        command_id: Uuid,
        success: bool,
        message: Option<String>,
    ) -> anyhow::Result<Command> {
        Ok(self.store.report_command(agent_id, command_id, success, message).await?)
    }

    pub async fn expire_due(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        Ok(self.store.expire_pending_commands(now).await?)
    }

    /// `instances_to_terminate(agent_id)` (§4.6): zombies past
    /// `terminate_wait_seconds` plus unconfirmed terminate attempts,
    /// filtering anything attempted within the last 5 minutes.
    pub async fn instances_to_terminate(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<crate::model::Instance>> {
        let mut out = self.store.list_zombies_past_wait(now).await?;
        out.extend(self.store.list_unconfirmed_terminations(now).await?);
        Ok(out)
    }

    pub fn routine_terminate_command(&self, tenant_id: Uuid, agent_id: Uuid, instance_id: Uuid, wait_seconds: i64) -> Command {
        let mut cmd = Command::new(
            tenant_id,
            agent_id,
            Some(instance_id),
            CommandType::Terminate,
            None,
            None,
            priority::ROUTINE_TERMINATE,
            format!("terminate-{instance_id}"),
            self.default_deadline_seconds(),
        );
        cmd.terminate_wait_seconds = Some(wait_seconds);
        cmd
    }

    pub fn scorer_switch_command(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        instance_id: Uuid,
        target_mode: Mode,
        target_pool_id: String,
        request_id: String,
    ) -> Command {
        Command::new(
            tenant_id,
            agent_id,
            Some(instance_id),
            CommandType::Switch,
            Some(target_mode),
            Some(target_pool_id),
            priority::SCORER_SWITCH,
            request_id,
            self.default_deadline_seconds(),
        )
    }

    pub fn manual_switch_command(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        instance_id: Uuid,
        target_mode: Mode,
        target_pool_id: String,
        request_id: String,
    ) -> Command {
        Command::new(
            tenant_id,
            agent_id,
            Some(instance_id),
            CommandType::Switch,
            Some(target_mode),
            Some(target_pool_id),
            priority::MANUAL_SWITCH,
            request_id,
            self.default_deadline_seconds(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Agent, Tenant};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn duplicate_request_id_returns_existing_command_id() {
        let store = Arc::new(MemoryStore::new());
        let tenant = Tenant::new("tok");
        store.seed_tenant(tenant.clone());
        let agent = Agent::new(tenant.id, "logical-1", "us-east-1".into(), "us-east-1a".into(), Mode::Spot);
        store.seed_agent(agent.clone());
        let dispatcher = Dispatcher::new(store, DispatcherConfig::default());

        let cmd = dispatcher.scorer_switch_command(
            tenant.id,
            agent.agent_id,
            Uuid::new_v4(),
            Mode::Spot,
            "m5.large.us-east-1b".into(),
            "req-1".into(),
        );
        let first = dispatcher.enqueue(cmd.clone()).await.unwrap();
        let second = dispatcher.enqueue(cmd).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn poll_orders_by_priority_then_creation() {
        let store = Arc::new(MemoryStore::new());
        let tenant = Tenant::new("tok");
        store.seed_tenant(tenant.clone());
        let agent = Agent::new(tenant.id, "logical-1", "us-east-1".into(), "us-east-1a".into(), Mode::Spot);
        store.seed_agent(agent.clone());
        let dispatcher = Dispatcher::new(store, DispatcherConfig::default());

        let low = dispatcher.routine_terminate_command(tenant.id, agent.agent_id, Uuid::new_v4(), 300);
        let high = dispatcher.scorer_switch_command(
            tenant.id,
            agent.agent_id,
            Uuid::new_v4(),
            Mode::Spot,
            "pool-b".into(),
            "req-high".into(),
        );
        dispatcher.enqueue(low).await.unwrap();
        dispatcher.enqueue(high.clone()).await.unwrap();

        let polled = dispatcher.poll(agent.agent_id, 10).await.unwrap();
        assert_eq!(polled[0].id, high.id);
        assert!(polled.iter().all(|c| c.status == crate::model::CommandStatus::InFlight));
    }
}
