//! Cross-component flows strung together the way a real deployment
//! would drive them, against `MemoryStore` the same way each unit's own
//! `#[cfg(test)]` module does, but crossing component boundaries instead
//! of exercising one at a time.

use std::sync::Arc;

use fleet_control_plane::config::AppConfig;
use fleet_control_plane::decision::scorer::{Action, AlternativePool, ScorerInput};
use fleet_control_plane::decision::{DecisionEngineHarness, DecisionInput, RuleBasedScorer};
use fleet_control_plane::dispatcher::Dispatcher;
use fleet_control_plane::emergency::EmergencyOrchestrator;
use fleet_control_plane::model::{Agent, Instance, InstanceStatus, Mode, Pool, SwitchTrigger, Tenant};
use fleet_control_plane::safety::{FleetRecommendation, PoolAllocation, SafetyEnforcer, SafetyOutcome};
use fleet_control_plane::state_machine::StateMachine;
use fleet_control_plane::store::MemoryStore;

fn make_agent_with_primary(store: &Arc<MemoryStore>) -> (Tenant, Agent, Instance) {
    let tenant = Tenant::new("test-token");
    store.seed_tenant(tenant.clone());

    let mut agent = Agent::new(tenant.id, "logical-1", "us-east-1".into(), "us-east-1a".into(), Mode::Spot);
    let primary = Instance::new(
        agent.agent_id,
        tenant.id,
        "m5.large".into(),
        "us-east-1".into(),
        "us-east-1a".into(),
        Pool::id_for("m5.large", "us-east-1a"),
        Mode::Spot,
        InstanceStatus::RunningPrimary,
        true,
    );
    agent.instance_id = Some(primary.id);
    agent.current_pool_id = Some(primary.pool_id.clone());

    store.seed_pool(Pool::new("m5.large", "us-east-1a", "us-east-1"));
    store.seed_pool(Pool::new("m5.large", "us-east-1b", "us-east-1"));
    store.seed_agent(agent.clone());
    store.seed_instance(primary.clone());

    (tenant, agent, primary)
}

/// S1: the decision engine recommends a switch, the dispatcher carries
/// it to the agent as a command, and the reported cutover runs through
/// the state machine's atomic four-write batch.
#[tokio::test]
async fn decision_to_dispatch_to_cutover() {
    let store = Arc::new(MemoryStore::new());
    let (tenant, agent, mut primary) = make_agent_with_primary(&store);
    primary.spot_price = Some(0.09);

    let config = AppConfig::default();
    let dispatcher = Dispatcher::new(store.clone(), config.dispatcher.clone());
    let state_machine = Arc::new(StateMachine::new(store.clone()));
    let harness = DecisionEngineHarness::new(store.clone(), Arc::new(RuleBasedScorer));

    let scorer_input = ScorerInput {
        current_pool_id: primary.pool_id.clone(),
        current_mode: Mode::Spot,
        current_price: 0.09,
        ondemand_price: 0.20,
        alternatives: vec![AlternativePool {
            pool_id: Pool::id_for("m5.large", "us-east-1b"),
            az: "us-east-1b".into(),
            canonical_price: 0.04,
        }],
        risk_threshold: agent.config.risk_threshold,
        min_savings_percent: agent.config.min_savings_percent,
    };
    let decision = harness
        .decide(DecisionInput { agent: &agent, instance: &primary, scorer_input, recent_switches_in_7d: 0 })
        .await;

    // The rule-based fallback never recommends a switch (§4.4) so the
    // dispatcher path is exercised with a manually constructed switch
    // command here, the way a loaded scorer's `Action::Switch` output
    // would have been turned into one downstream of `decide`.
    assert_eq!(decision.action, Action::Stay);

    let command = dispatcher.scorer_switch_command(
        tenant.id,
        agent.agent_id,
        primary.id,
        Mode::Spot,
        Pool::id_for("m5.large", "us-east-1b"),
        "switch-req-1".into(),
    );
    let enqueued = dispatcher.enqueue(command).await.unwrap();

    let polled = dispatcher.poll(agent.agent_id, 10).await.unwrap();
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0].id, enqueued.id);

    dispatcher.report(agent.agent_id, enqueued.id, true, None).await.unwrap();

    // Agent executed the switch command: a replica instance comes up in
    // the target pool and is reported synced.
    let mut replica = Instance::new(
        agent.agent_id,
        tenant.id,
        "m5.large".into(),
        "us-east-1".into(),
        "us-east-1b".into(),
        Pool::id_for("m5.large", "us-east-1b"),
        Mode::Spot,
        InstanceStatus::RunningReplica,
        false,
    );
    replica.replica_synced_at = Some(chrono::Utc::now());
    replica.spot_price = Some(0.04);
    let replica = store.insert_instance(replica).await.unwrap();

    state_machine.cutover(replica.clone(), primary.clone(), SwitchTrigger::Automatic, 1.5).await.unwrap();

    let updated_agent = store.get_agent(agent.agent_id).await.unwrap().unwrap();
    assert_eq!(updated_agent.instance_id, Some(replica.id));
    assert_eq!(updated_agent.current_pool_id, Some(Pool::id_for("m5.large", "us-east-1b")));

    let zombie = store.get_instance(primary.id).await.unwrap().unwrap();
    assert_eq!(zombie.status, InstanceStatus::Zombie);

    let tenant_after = store.get_tenant(tenant.id).await.unwrap().unwrap();
    assert!(tenant_after.total_savings > 0.0);
}

/// S3/S4: a fleet recommendation that violates AZ diversity is rejected
/// outright, and a concentration violation is silently corrected into a
/// safe alternative rather than applied as-is.
#[tokio::test]
async fn safety_enforcer_rejects_and_repairs_fleet_recommendations() {
    let store = Arc::new(MemoryStore::new());
    let tenant = Tenant::new("tok");
    store.seed_tenant(tenant.clone());
    let config = AppConfig::default();
    let enforcer = SafetyEnforcer::new(store.clone(), config.safety.clone());

    let too_concentrated = FleetRecommendation {
        pools: vec![
            PoolAllocation { pool_id: "a".into(), az: "us-east-1a".into(), risk_score: 0.9, allocation: 70.0 },
            PoolAllocation { pool_id: "b".into(), az: "us-east-1b".into(), risk_score: 0.9, allocation: 15.0 },
            PoolAllocation { pool_id: "c".into(), az: "us-east-1c".into(), risk_score: 0.9, allocation: 15.0 },
        ],
        total_capacity: 100.0,
        on_demand_count: 20.0,
    };
    match enforcer.validate(tenant.id, too_concentrated).await.unwrap() {
        SafetyOutcome::Modified { safe, .. } => {
            let max_share = safe.pools.iter().map(|p| p.allocation / safe.total_capacity).fold(0.0, f64::max);
            assert!(max_share <= config.safety.max_pool_concentration + 1e-9);
        }
        other => panic!("expected a modified-safe outcome, got {other:?}"),
    }

    let single_az = FleetRecommendation {
        pools: vec![PoolAllocation { pool_id: "a".into(), az: "us-east-1a".into(), risk_score: 0.9, allocation: 100.0 }],
        total_capacity: 100.0,
        on_demand_count: 20.0,
    };
    match enforcer.validate(tenant.id, single_az).await.unwrap() {
        SafetyOutcome::Rejected { violated_constraints } => {
            assert!(violated_constraints.contains(&"az_diversity".to_string()));
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    assert_eq!(store.violation_count(tenant.id), 2, "both the modified and rejected outcomes record an audit row");
}

/// S5/S6: a termination notice with a ready replica promotes it under
/// the emergency deadline instead of waiting on a fresh `create_replica`.
#[tokio::test]
async fn emergency_termination_promotes_ready_replica() {
    let store = Arc::new(MemoryStore::new());
    let (tenant, agent, primary) = make_agent_with_primary(&store);

    let mut replica = Instance::new(
        agent.agent_id,
        tenant.id,
        "m5.large".into(),
        "us-east-1".into(),
        "us-east-1b".into(),
        Pool::id_for("m5.large", "us-east-1b"),
        Mode::Spot,
        InstanceStatus::RunningReplica,
        false,
    );
    replica.replica_synced_at = Some(chrono::Utc::now());
    replica.boot_completed_at = Some(chrono::Utc::now());
    store.seed_instance(replica.clone());

    let config = AppConfig::default();
    let state_machine = Arc::new(StateMachine::new(store.clone()));
    let orchestrator = EmergencyOrchestrator::new(store.clone(), state_machine.clone(), config.emergency.clone());

    let action = orchestrator.on_termination_notice(agent.agent_id, chrono::Utc::now()).await.unwrap();
    assert_eq!(action.chosen_pool_id.as_deref(), Some(replica.pool_id.as_str()));
    assert!(action.note.contains("promote_replica"));

    let updated_agent = store.get_agent(agent.agent_id).await.unwrap().unwrap();
    assert_eq!(updated_agent.notice_status, fleet_control_plane::model::NoticeStatus::Termination);

    // The old primary is untouched until the agent actually reports the
    // promotion back through `state_machine::cutover`.
    let primary_after = store.get_instance(primary.id).await.unwrap().unwrap();
    assert_eq!(primary_after.status, InstanceStatus::RunningPrimary);
}
