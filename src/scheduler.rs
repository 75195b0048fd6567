//! Clock/Scheduler (§4.2): five independent periodic jobs, each an
//! actor-style `tokio::spawn`ed loop in the teacher's `tokio::select!`
//! idiom, with jittered cadence and cooperative cancellation. Shutdown
//! uses a hand-rolled `Arc<Notify>` + `AtomicBool` token rather than
//! `tokio_util::sync::CancellationToken`, since nothing else in the
//! dependency stack needs that crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::decision::scorer::{Action, AlternativePool, ScorerInput};
use crate::decision::{DecisionEngineHarness, DecisionInput};
use crate::dispatcher::Dispatcher;
use crate::events::{Event, EventBus};
use crate::model::{Agent, AgentStatus, Instance, Mode};
use crate::pricing::PricingPipeline;
use crate::safety::{FleetRecommendation, PoolAllocation, SafetyEnforcer, SafetyOutcome};
use crate::store::Store;

#[derive(Clone)]
pub struct ShutdownToken {
    notified: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self { notified: Arc::new(Notify::new()), stopped: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notified.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notified.notified().await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

fn jittered(base: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 10).max(1));
    base + Duration::from_millis(jitter_ms)
}

pub struct Scheduler<S: Store> {
    store: Arc<S>,
    dispatcher: Arc<Dispatcher<S>>,
    pricing: Arc<PricingPipeline<S>>,
    decision: Arc<DecisionEngineHarness<S>>,
    safety: Arc<SafetyEnforcer<S>>,
    events: EventBus,
    config: SchedulerConfig,
    shutdown: ShutdownToken,
}

impl<S: Store> Scheduler<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<Dispatcher<S>>,
        pricing: Arc<PricingPipeline<S>>,
        decision: Arc<DecisionEngineHarness<S>>,
        safety: Arc<SafetyEnforcer<S>>,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self { store, dispatcher, pricing, decision, safety, events, config, shutdown: ShutdownToken::new() }
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Spawns all five jobs; returns their join handles so `main` can
    /// await a clean exit after calling `shutdown_token().cancel()`.
    pub fn spawn_all(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.spawn_heartbeat_sweep(),
            self.spawn_command_expiry(),
            self.spawn_zombie_reaper(),
            self.spawn_pricing_consolidation(),
            self.spawn_decision_cycle(),
        ]
    }

    fn spawn_heartbeat_sweep(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let events = self.events.clone();
        let interval = self.config.heartbeat_sweep_interval;
        let timeout = self.config.heartbeat_timeout;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(jittered(interval)) => {}
                    _ = shutdown.cancelled() => break,
                }
                if shutdown.is_cancelled() {
                    break;
                }
                if let Err(err) = sweep_heartbeats(&store, &events, timeout.as_secs() as i64).await {
                    tracing::error!(%err, "heartbeat sweep failed");
                }
            }
            tracing::info!("heartbeat sweep job stopped");
        })
    }

    fn spawn_command_expiry(&self) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let interval = self.config.command_expiry_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(jittered(interval)) => {}
                    _ = shutdown.cancelled() => break,
                }
                if shutdown.is_cancelled() {
                    break;
                }
                match dispatcher.expire_due(Utc::now()).await {
                    Ok(n) if n > 0 => tracing::info!(expired = n, "commands expired"),
                    Ok(_) => {}
                    Err(err) => tracing::error!(%err, "command expiry sweep failed"),
                }
            }
            tracing::info!("command expiry job stopped");
        })
    }

    fn spawn_zombie_reaper(&self) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let interval = self.config.zombie_reaper_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(jittered(interval)) => {}
                    _ = shutdown.cancelled() => break,
                }
                if shutdown.is_cancelled() {
                    break;
                }
                if let Err(err) = reap_zombies(&dispatcher).await {
                    tracing::error!(%err, "zombie reaper failed");
                }
            }
            tracing::info!("zombie reaper job stopped");
        })
    }

    fn spawn_pricing_consolidation(&self) -> tokio::task::JoinHandle<()> {
        let pricing = self.pricing.clone();
        let interval = self.config.pricing_consolidation_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(jittered(interval)) => {}
                    _ = shutdown.cancelled() => break,
                }
                if shutdown.is_cancelled() {
                    break;
                }
                match pricing.run().await {
                    Ok(Some(run_id)) => tracing::info!(%run_id, "pricing consolidation complete"),
                    Ok(None) => tracing::debug!("pricing consolidation skipped, already running"),
                    Err(err) => tracing::error!(%err, "pricing consolidation failed"),
                }
            }
            tracing::info!("pricing consolidation job stopped");
        })
    }

    /// §2's data-flow paragraph: "Decision Engine periodically reads
    /// canonical prices + current state, produces candidate
    /// recommendations, passes them to Safety Enforcer, then to Command
    /// Dispatcher."
    fn spawn_decision_cycle(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let decision = self.decision.clone();
        let safety = self.safety.clone();
        let dispatcher = self.dispatcher.clone();
        let interval = self.config.decision_cycle_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(jittered(interval)) => {}
                    _ = shutdown.cancelled() => break,
                }
                if shutdown.is_cancelled() {
                    break;
                }
                if let Err(err) = run_decision_cycle(&store, &decision, &safety, &dispatcher).await {
                    tracing::error!(%err, "decision cycle failed");
                }
            }
            tracing::info!("decision cycle job stopped");
        })
    }
}

async fn sweep_heartbeats<S: Store>(store: &Arc<S>, events: &EventBus, heartbeat_timeout_seconds: i64) -> anyhow::Result<()> {
    let now = Utc::now();
    for agent in store.list_online_agents().await? {
        if agent.is_heartbeat_stale(now, heartbeat_timeout_seconds) {
            let mut updated = agent.clone();
            updated.status = AgentStatus::Offline;
            match store.update_agent_if(updated, agent.version).await {
                Ok(_) => {
                    crate::events::record(store.as_ref(), events, Event::AgentWentOffline { agent_id: agent.agent_id }).await;
                    tracing::info!(agent_id = %agent.agent_id, "agent marked offline");
                }
                Err(crate::store::StoreError::Conflict) => {
                    tracing::debug!(agent_id = %agent.agent_id, "heartbeat sweep lost race, skipping");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}

async fn reap_zombies<S: Store>(dispatcher: &Arc<Dispatcher<S>>) -> anyhow::Result<()> {
    let now = Utc::now();
    for instance in dispatcher.instances_to_terminate(now).await? {
        let cmd = dispatcher.routine_terminate_command(
            instance.tenant_id,
            instance.agent_id,
            instance.id,
            0,
        );
        match dispatcher.enqueue(cmd).await {
            Ok(_) => {}
            Err(err) => tracing::warn!(instance_id = %instance.id, %err, "failed to enqueue terminate command"),
        }
    }
    Ok(())
}

struct SwitchCandidate {
    agent: Agent,
    instance: Instance,
    target_pool_id: String,
    target_az: String,
    target_mode: Mode,
    risk_score: f64,
    decision_id: Uuid,
}

/// One pass of the routine (non-emergency) rebalance loop: scores every
/// online agent against current canonical prices, groups the resulting
/// switch candidates by tenant, and runs each tenant's batch through the
/// Safety Enforcer before dispatching the ones that survive.
async fn run_decision_cycle<S: Store>(
    store: &Arc<S>,
    decision: &Arc<DecisionEngineHarness<S>>,
    safety: &Arc<SafetyEnforcer<S>>,
    dispatcher: &Arc<Dispatcher<S>>,
) -> anyhow::Result<()> {
    let agents = store.list_online_agents().await?;
    let mut by_tenant: HashMap<Uuid, Vec<Agent>> = HashMap::new();
    for agent in agents {
        by_tenant.entry(agent.tenant_id).or_default().push(agent);
    }

    for (tenant_id, tenant_agents) in by_tenant {
        let candidates = score_tenant_agents(store, decision, &tenant_agents).await?;
        if candidates.is_empty() {
            continue;
        }
        dispatch_approved(safety, dispatcher, tenant_id, candidates).await?;
    }
    Ok(())
}

async fn score_tenant_agents<S: Store>(
    store: &Arc<S>,
    decision: &Arc<DecisionEngineHarness<S>>,
    agents: &[Agent],
) -> anyhow::Result<Vec<SwitchCandidate>> {
    let mut candidates = Vec::new();
    for agent in agents {
        let Some(instance_id) = agent.instance_id else { continue };
        let Some(instance) = store.get_instance(instance_id).await? else { continue };
        let Some(current_pool_id) = agent.current_pool_id.clone() else { continue };
        let Some(current_price) = store.canonical_latest(&current_pool_id).await?.map(|c| c.price) else { continue };
        let Some(ondemand_price) =
            store.latest_ondemand_price(&agent.region, &instance.instance_type).await?.map(|p| p.price)
        else {
            continue;
        };

        let mut alternatives = Vec::new();
        for pool in store.list_pools().await? {
            if !pool.is_active || pool.id == current_pool_id || pool.instance_type != instance.instance_type {
                continue;
            }
            if let Some(canonical) = store.canonical_latest(&pool.id).await? {
                alternatives.push(AlternativePool { pool_id: pool.id.clone(), az: pool.az.clone(), canonical_price: canonical.price });
            }
        }

        let scorer_input = ScorerInput {
            current_pool_id,
            current_mode: agent.mode,
            current_price,
            ondemand_price,
            alternatives,
            risk_threshold: agent.config.risk_threshold,
            min_savings_percent: agent.config.min_savings_percent,
        };

        let d = decision
            .decide(DecisionInput {
                agent,
                instance: &instance,
                scorer_input,
                recent_switches_in_7d: agent.recent_switches_in_7d,
            })
            .await;

        if d.filtered || d.action != Action::Switch {
            continue;
        }
        let (Some(target_pool_id), Some(target_mode)) = (d.target_pool_id.clone(), d.target_mode) else { continue };
        let target_az = store.get_pool(&target_pool_id).await?.map(|p| p.az).unwrap_or_else(|| agent.az.clone());

        candidates.push(SwitchCandidate {
            agent: agent.clone(),
            instance,
            target_pool_id,
            target_az,
            target_mode,
            risk_score: d.risk_score,
            decision_id: d.id,
        });
    }
    Ok(candidates)
}

async fn dispatch_approved<S: Store>(
    safety: &Arc<SafetyEnforcer<S>>,
    dispatcher: &Arc<Dispatcher<S>>,
    tenant_id: Uuid,
    candidates: Vec<SwitchCandidate>,
) -> anyhow::Result<()> {
    let pools: Vec<PoolAllocation> = candidates
        .iter()
        .map(|c| PoolAllocation { pool_id: c.target_pool_id.clone(), az: c.target_az.clone(), risk_score: c.risk_score, allocation: 1.0 })
        .collect();
    let on_demand_count = candidates.iter().filter(|c| c.target_mode == Mode::Ondemand).count() as f64;
    let rec = FleetRecommendation { pools, total_capacity: candidates.len() as f64, on_demand_count };

    let outcome = safety.validate(tenant_id, rec).await?;
    let approved_pools: Vec<String> = match outcome {
        SafetyOutcome::Approved(rec) => rec.pools.into_iter().map(|p| p.pool_id).collect(),
        SafetyOutcome::Modified { safe, .. } => safe.pools.into_iter().map(|p| p.pool_id).collect(),
        SafetyOutcome::Rejected { violated_constraints } => {
            tracing::warn!(%tenant_id, ?violated_constraints, "decision cycle recommendation rejected by safety enforcer");
            return Ok(());
        }
    };

    for c in candidates {
        if !approved_pools.contains(&c.target_pool_id) {
            tracing::info!(agent_id = %c.agent.agent_id, pool_id = %c.target_pool_id, "switch dropped by safety enforcer");
            continue;
        }
        let cmd = dispatcher.scorer_switch_command(
            tenant_id,
            c.agent.agent_id,
            c.instance.id,
            c.target_mode,
            c.target_pool_id,
            format!("scorer-{}", c.decision_id),
        );
        if let Err(err) = dispatcher.enqueue(cmd).await {
            tracing::warn!(agent_id = %c.agent.agent_id, %err, "failed to enqueue scorer switch command");
        }
    }
    Ok(())
}
