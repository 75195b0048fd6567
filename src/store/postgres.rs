//! Postgres-backed `Store`. Grounded on
//! `examples/ultrasoundlabs-untron-intents/apps/solver/src/db.rs`: a
//! `PgPoolOptions`-built pool, migrations tracked in a `schema_migrations`
//! table and applied one-per-transaction under a held Postgres advisory
//! lock, and hand-written `sqlx::query` (not the `query!` compile-time
//! macro — there is no live database available to validate against at
//! build time here).

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::decision::scorer::Action;
use crate::decision::Decision;
use crate::model::*;

use super::{CutoverBatch, Store, StoreError, StoreResult};

/// `(version, sql)` pairs applied in order. Mirrors the solver crate's
/// `MIGRATIONS` const array.
const MIGRATIONS: &[(i32, &str)] = &[
    (1, include_str!("../../db/migrations/0001_init.sql")),
    (2, include_str!("../../db/migrations/0002_pricing.sql")),
    (3, include_str!("../../db/migrations/0003_decisions.sql")),
];

const ADVISORY_LOCK_KEY: i64 = 0x4637_4c45_4554; // "FLEET" in hex, arbitrary constant

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(ADVISORY_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = self.run_migrations(&mut conn).await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(ADVISORY_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        result
    }

    async fn run_migrations(&self, conn: &mut sqlx::pool::PoolConnection<sqlx::Postgres>) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at TIMESTAMPTZ NOT NULL DEFAULT now())",
        )
        .execute(&mut **conn)
        .await?;

        for (version, sql) in MIGRATIONS {
            let already: Option<i32> = sqlx::query_scalar("SELECT version FROM schema_migrations WHERE version = $1")
                .bind(version)
                .fetch_optional(&mut **conn)
                .await?;
            if already.is_some() {
                continue;
            }
            tracing::info!(version, "applying migration");
            let mut tx = conn.begin().await?;
            sqlx::raw_sql(sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO schema_migrations (version) VALUES ($1)")
                .bind(version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }
}

// -- enum <-> TEXT mapping -------------------------------------------------

fn mode_str(m: Mode) -> &'static str {
    match m {
        Mode::Spot => "spot",
        Mode::Ondemand => "ondemand",
    }
}
fn mode_from(s: &str) -> Mode {
    match s {
        "ondemand" => Mode::Ondemand,
        _ => Mode::Spot,
    }
}

fn agent_status_str(s: AgentStatus) -> &'static str {
    match s {
        AgentStatus::Online => "online",
        AgentStatus::Offline => "offline",
        AgentStatus::Deleted => "deleted",
    }
}
fn agent_status_from(s: &str) -> AgentStatus {
    match s {
        "offline" => AgentStatus::Offline,
        "deleted" => AgentStatus::Deleted,
        _ => AgentStatus::Online,
    }
}

fn notice_status_str(s: NoticeStatus) -> &'static str {
    match s {
        NoticeStatus::None => "none",
        NoticeStatus::Rebalance => "rebalance",
        NoticeStatus::Termination => "termination",
    }
}
fn notice_status_from(s: &str) -> NoticeStatus {
    match s {
        "rebalance" => NoticeStatus::Rebalance,
        "termination" => NoticeStatus::Termination,
        _ => NoticeStatus::None,
    }
}

fn instance_status_str(s: InstanceStatus) -> &'static str {
    match s {
        InstanceStatus::Launching => "launching",
        InstanceStatus::RunningPrimary => "running_primary",
        InstanceStatus::RunningReplica => "running_replica",
        InstanceStatus::Promoting => "promoting",
        InstanceStatus::Zombie => "zombie",
        InstanceStatus::Terminating => "terminating",
        InstanceStatus::Terminated => "terminated",
    }
}
fn instance_status_from(s: &str) -> InstanceStatus {
    match s {
        "running_primary" => InstanceStatus::RunningPrimary,
        "running_replica" => InstanceStatus::RunningReplica,
        "promoting" => InstanceStatus::Promoting,
        "zombie" => InstanceStatus::Zombie,
        "terminating" => InstanceStatus::Terminating,
        "terminated" => InstanceStatus::Terminated,
        _ => InstanceStatus::Launching,
    }
}

fn command_type_str(s: CommandType) -> &'static str {
    match s {
        CommandType::Switch => "switch",
        CommandType::Launch => "launch",
        CommandType::Terminate => "terminate",
        CommandType::CreateReplica => "create_replica",
        CommandType::PromoteReplica => "promote_replica",
    }
}
fn command_type_from(s: &str) -> CommandType {
    match s {
        "launch" => CommandType::Launch,
        "terminate" => CommandType::Terminate,
        "create_replica" => CommandType::CreateReplica,
        "promote_replica" => CommandType::PromoteReplica,
        _ => CommandType::Switch,
    }
}

fn command_status_str(s: CommandStatus) -> &'static str {
    match s {
        CommandStatus::Pending => "pending",
        CommandStatus::InFlight => "in_flight",
        CommandStatus::Completed => "completed",
        CommandStatus::Failed => "failed",
        CommandStatus::Expired => "expired",
    }
}
fn command_status_from(s: &str) -> CommandStatus {
    match s {
        "in_flight" => CommandStatus::InFlight,
        "completed" => CommandStatus::Completed,
        "failed" => CommandStatus::Failed,
        "expired" => CommandStatus::Expired,
        _ => CommandStatus::Pending,
    }
}

fn price_source_str(s: PriceSource) -> &'static str {
    match s {
        PriceSource::Agent => "agent",
        PriceSource::ProviderApi => "provider_api",
        PriceSource::Interpolated => "interpolated",
    }
}
fn price_source_from(s: &str) -> PriceSource {
    match s {
        "provider_api" => PriceSource::ProviderApi,
        "interpolated" => PriceSource::Interpolated,
        _ => PriceSource::Agent,
    }
}

fn price_role_str(s: PriceSampleRole) -> &'static str {
    match s {
        PriceSampleRole::Primary => "primary",
        PriceSampleRole::Replica => "replica",
    }
}
fn price_role_from(s: &str) -> PriceSampleRole {
    match s {
        "replica" => PriceSampleRole::Replica,
        _ => PriceSampleRole::Primary,
    }
}

fn switch_trigger_str(s: SwitchTrigger) -> &'static str {
    match s {
        SwitchTrigger::Automatic => "automatic",
        SwitchTrigger::Manual => "manual",
        SwitchTrigger::Emergency => "emergency",
    }
}
fn switch_trigger_from(s: &str) -> SwitchTrigger {
    match s {
        "manual" => SwitchTrigger::Manual,
        "emergency" => SwitchTrigger::Emergency,
        _ => SwitchTrigger::Automatic,
    }
}

fn severity_str(s: ViolationSeverity) -> &'static str {
    match s {
        ViolationSeverity::High => "high",
        ViolationSeverity::Critical => "critical",
    }
}
fn severity_from(s: &str) -> ViolationSeverity {
    match s {
        "critical" => ViolationSeverity::Critical,
        _ => ViolationSeverity::High,
    }
}

fn action_str(a: Action) -> &'static str {
    match a {
        Action::Stay => "stay",
        Action::Switch => "switch",
    }
}

fn row_to_agent(row: &sqlx::postgres::PgRow) -> Agent {
    Agent {
        agent_id: row.get("agent_id"),
        tenant_id: row.get("tenant_id"),
        logical_id: row.get("logical_id"),
        instance_id: row.get("instance_id"),
        mode: mode_from(row.get::<String, _>("mode").as_str()),
        current_pool_id: row.get("current_pool_id"),
        region: row.get("region"),
        az: row.get("az"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        status: agent_status_from(row.get::<String, _>("status").as_str()),
        config: AgentConfig {
            enabled: row.get("cfg_enabled"),
            auto_switch_enabled: row.get("cfg_auto_switch_enabled"),
            manual_replica_enabled: row.get("cfg_manual_replica_enabled"),
            auto_terminate_enabled: row.get("cfg_auto_terminate_enabled"),
            terminate_wait_seconds: row.get("cfg_terminate_wait_seconds"),
            min_savings_percent: row.get("cfg_min_savings_percent"),
            risk_threshold: row.get("cfg_risk_threshold"),
            max_switches_per_week: row.get::<i32, _>("cfg_max_switches_per_week") as u32,
            min_pool_duration_hours: row.get("cfg_min_pool_duration_hours"),
        },
        config_version: row.get("config_version"),
        notice_status: notice_status_from(row.get::<String, _>("notice_status").as_str()),
        notice_deadline: row.get("notice_deadline"),
        last_switch_at: row.get("last_switch_at"),
        recent_switches_in_7d: row.get::<i32, _>("recent_switches_in_7d") as u32,
        version: row.get("version"),
    }
}

fn row_to_instance(row: &sqlx::postgres::PgRow) -> Instance {
    Instance {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        tenant_id: row.get("tenant_id"),
        instance_type: row.get("instance_type"),
        region: row.get("region"),
        az: row.get("az"),
        pool_id: row.get("pool_id"),
        mode: mode_from(row.get::<String, _>("mode").as_str()),
        status: instance_status_from(row.get::<String, _>("status").as_str()),
        is_primary: row.get("is_primary"),
        is_active: row.get("is_active"),
        version: row.get("version"),
        spot_price: row.get("spot_price"),
        ondemand_price: row.get("ondemand_price"),
        baseline_ondemand_price: row.get("baseline_ondemand_price"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        promoted_at: row.get("promoted_at"),
        boot_completed_at: row.get("boot_completed_at"),
        termination_attempted_at: row.get("termination_attempted_at"),
        termination_confirmed: row.get("termination_confirmed"),
        boot_duration_seconds: row.get("boot_duration_seconds"),
        replica_synced_at: row.get("replica_synced_at"),
    }
}

fn row_to_command(row: &sqlx::postgres::PgRow) -> Command {
    Command {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        agent_id: row.get("agent_id"),
        instance_id: row.get("instance_id"),
        command_type: command_type_from(row.get::<String, _>("command_type").as_str()),
        target_mode: row.get::<Option<String>, _>("target_mode").map(|s| mode_from(&s)),
        target_pool_id: row.get("target_pool_id"),
        priority: row.get("priority"),
        terminate_wait_seconds: row.get("terminate_wait_seconds"),
        status: command_status_from(row.get::<String, _>("status").as_str()),
        request_id: row.get("request_id"),
        created_at: row.get("created_at"),
        deadline: row.get("deadline"),
        executed_at: row.get("executed_at"),
        success: row.get("success"),
        message: row.get("message"),
    }
}

fn row_to_pool(row: &sqlx::postgres::PgRow) -> Pool {
    Pool {
        id: row.get("id"),
        instance_type: row.get("instance_type"),
        az: row.get("az"),
        region: row.get("region"),
        avg_boot_time_seconds: row.get("avg_boot_time_seconds"),
        boot_time_sample_count: row.get::<i32, _>("boot_time_sample_count") as u32,
        is_active: row.get("is_active"),
    }
}

fn row_to_tenant(row: &sqlx::postgres::PgRow) -> Tenant {
    Tenant {
        id: row.get("id"),
        auth_token: row.get("auth_token"),
        enabled: row.get("enabled"),
        total_savings: row.get("total_savings"),
    }
}

fn row_to_switch(row: &sqlx::postgres::PgRow) -> SwitchRecord {
    SwitchRecord {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        agent_id: row.get("agent_id"),
        from_instance_id: row.get("from_instance_id"),
        to_instance_id: row.get("to_instance_id"),
        from_pool_id: row.get("from_pool_id"),
        to_pool_id: row.get("to_pool_id"),
        from_mode: mode_from(row.get::<String, _>("from_mode").as_str()),
        to_mode: mode_from(row.get::<String, _>("to_mode").as_str()),
        old_price: row.get("old_price"),
        new_price: row.get("new_price"),
        savings_impact_per_hour: row.get("savings_impact_per_hour"),
        downtime_seconds: row.get("downtime_seconds"),
        trigger: switch_trigger_from(row.get::<String, _>("trigger").as_str()),
        created_at: row.get("created_at"),
    }
}

impl Store for PgStore {
    async fn get_tenant(&self, id: Uuid) -> StoreResult<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(row.map(|r| row_to_tenant(&r)))
    }

    async fn get_tenant_by_token(&self, token: &str) -> StoreResult<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE auth_token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(row.map(|r| row_to_tenant(&r)))
    }

    async fn add_tenant_savings(&self, tenant_id: Uuid, delta: f64) -> StoreResult<()> {
        sqlx::query("UPDATE tenants SET total_savings = total_savings + $1 WHERE id = $2")
            .bind(delta)
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> StoreResult<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE agent_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(row.map(|r| row_to_agent(&r)))
    }

    async fn get_agent_by_logical_id(&self, tenant_id: Uuid, logical_id: &str) -> StoreResult<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE tenant_id = $1 AND logical_id = $2")
            .bind(tenant_id)
            .bind(logical_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(row.map(|r| row_to_agent(&r)))
    }

    async fn list_agents(&self, tenant_id: Uuid) -> StoreResult<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(rows.iter().map(row_to_agent).collect())
    }

    async fn list_online_agents(&self) -> StoreResult<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE status = 'online'")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(rows.iter().map(row_to_agent).collect())
    }

    async fn insert_agent(&self, agent: Agent) -> StoreResult<Agent> {
        sqlx::query(
            "INSERT INTO agents (agent_id, tenant_id, logical_id, instance_id, mode, current_pool_id, region, az,
                last_heartbeat_at, status, cfg_enabled, cfg_auto_switch_enabled, cfg_manual_replica_enabled,
                cfg_auto_terminate_enabled, cfg_terminate_wait_seconds, cfg_min_savings_percent, cfg_risk_threshold,
                cfg_max_switches_per_week, cfg_min_pool_duration_hours, config_version, notice_status,
                notice_deadline, last_switch_at, recent_switches_in_7d, version)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24,$25)",
        )
        .bind(agent.agent_id)
        .bind(agent.tenant_id)
        .bind(&agent.logical_id)
        .bind(agent.instance_id)
        .bind(mode_str(agent.mode))
        .bind(&agent.current_pool_id)
        .bind(&agent.region)
        .bind(&agent.az)
        .bind(agent.last_heartbeat_at)
        .bind(agent_status_str(agent.status))
        .bind(agent.config.enabled)
        .bind(agent.config.auto_switch_enabled)
        .bind(agent.config.manual_replica_enabled)
        .bind(agent.config.auto_terminate_enabled)
        .bind(agent.config.terminate_wait_seconds)
        .bind(agent.config.min_savings_percent)
        .bind(agent.config.risk_threshold)
        .bind(agent.config.max_switches_per_week as i32)
        .bind(agent.config.min_pool_duration_hours)
        .bind(agent.config_version)
        .bind(notice_status_str(agent.notice_status))
        .bind(agent.notice_deadline)
        .bind(agent.last_switch_at)
        .bind(agent.recent_switches_in_7d as i32)
        .bind(agent.version)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(agent)
    }

    async fn update_agent_if(&self, mut agent: Agent, expected_version: Version) -> StoreResult<Agent> {
        agent.version = expected_version + 1;
        let result = sqlx::query(
            "UPDATE agents SET instance_id=$1, mode=$2, current_pool_id=$3, region=$4, az=$5,
                last_heartbeat_at=$6, status=$7, cfg_enabled=$8, cfg_auto_switch_enabled=$9,
                cfg_manual_replica_enabled=$10, cfg_auto_terminate_enabled=$11, cfg_terminate_wait_seconds=$12,
                cfg_min_savings_percent=$13, cfg_risk_threshold=$14, cfg_max_switches_per_week=$15,
                cfg_min_pool_duration_hours=$16, config_version=$17, notice_status=$18, notice_deadline=$19,
                last_switch_at=$20, recent_switches_in_7d=$21, version=$22
             WHERE agent_id=$23 AND version=$24",
        )
        .bind(agent.instance_id)
        .bind(mode_str(agent.mode))
        .bind(&agent.current_pool_id)
        .bind(&agent.region)
        .bind(&agent.az)
        .bind(agent.last_heartbeat_at)
        .bind(agent_status_str(agent.status))
        .bind(agent.config.enabled)
        .bind(agent.config.auto_switch_enabled)
        .bind(agent.config.manual_replica_enabled)
        .bind(agent.config.auto_terminate_enabled)
        .bind(agent.config.terminate_wait_seconds)
        .bind(agent.config.min_savings_percent)
        .bind(agent.config.risk_threshold)
        .bind(agent.config.max_switches_per_week as i32)
        .bind(agent.config.min_pool_duration_hours)
        .bind(agent.config_version)
        .bind(notice_status_str(agent.notice_status))
        .bind(agent.notice_deadline)
        .bind(agent.last_switch_at)
        .bind(agent.recent_switches_in_7d as i32)
        .bind(agent.version)
        .bind(agent.agent_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }
        Ok(agent)
    }

    async fn get_instance(&self, id: Uuid) -> StoreResult<Option<Instance>> {
        let row = sqlx::query("SELECT * FROM instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(row.map(|r| row_to_instance(&r)))
    }

    async fn list_instances_for_agent(&self, agent_id: Uuid) -> StoreResult<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(rows.iter().map(row_to_instance).collect())
    }

    async fn list_instances(&self, tenant_id: Uuid) -> StoreResult<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(rows.iter().map(row_to_instance).collect())
    }

    async fn insert_instance(&self, instance: Instance) -> StoreResult<Instance> {
        sqlx::query(
            "INSERT INTO instances (id, agent_id, tenant_id, instance_type, region, az, pool_id, mode, status,
                is_primary, is_active, version, spot_price, ondemand_price, baseline_ondemand_price, created_at,
                updated_at, promoted_at, boot_completed_at, termination_attempted_at, termination_confirmed,
                boot_duration_seconds, replica_synced_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23)",
        )
        .bind(instance.id)
        .bind(instance.agent_id)
        .bind(instance.tenant_id)
        .bind(&instance.instance_type)
        .bind(&instance.region)
        .bind(&instance.az)
        .bind(&instance.pool_id)
        .bind(mode_str(instance.mode))
        .bind(instance_status_str(instance.status))
        .bind(instance.is_primary)
        .bind(instance.is_active)
        .bind(instance.version)
        .bind(instance.spot_price)
        .bind(instance.ondemand_price)
        .bind(instance.baseline_ondemand_price)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(instance.promoted_at)
        .bind(instance.boot_completed_at)
        .bind(instance.termination_attempted_at)
        .bind(instance.termination_confirmed)
        .bind(instance.boot_duration_seconds)
        .bind(instance.replica_synced_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(instance)
    }

    async fn update_instance_if(&self, mut instance: Instance, expected_version: Version) -> StoreResult<Instance> {
        instance.version = expected_version + 1;
        instance.updated_at = Utc::now();
        let result = sqlx::query(
            "UPDATE instances SET status=$1, is_primary=$2, is_active=$3, version=$4, spot_price=$5,
                ondemand_price=$6, updated_at=$7, promoted_at=$8, boot_completed_at=$9,
                termination_attempted_at=$10, termination_confirmed=$11, boot_duration_seconds=$12,
                replica_synced_at=$13, mode=$14, pool_id=$15
             WHERE id=$16 AND version=$17",
        )
        .bind(instance_status_str(instance.status))
        .bind(instance.is_primary)
        .bind(instance.is_active)
        .bind(instance.version)
        .bind(instance.spot_price)
        .bind(instance.ondemand_price)
        .bind(instance.updated_at)
        .bind(instance.promoted_at)
        .bind(instance.boot_completed_at)
        .bind(instance.termination_attempted_at)
        .bind(instance.termination_confirmed)
        .bind(instance.boot_duration_seconds)
        .bind(instance.replica_synced_at)
        .bind(mode_str(instance.mode))
        .bind(&instance.pool_id)
        .bind(instance.id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }
        Ok(instance)
    }

    async fn list_zombies_past_wait(&self, now: DateTime<Utc>) -> StoreResult<Vec<Instance>> {
        let rows = sqlx::query(
            "SELECT i.* FROM instances i JOIN agents a ON a.agent_id = i.agent_id
             WHERE i.status = 'zombie' AND EXTRACT(EPOCH FROM ($1 - i.updated_at)) >= a.cfg_terminate_wait_seconds",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(rows.iter().map(row_to_instance).collect())
    }

    async fn list_unconfirmed_terminations(&self, now: DateTime<Utc>) -> StoreResult<Vec<Instance>> {
        let rows = sqlx::query(
            "SELECT * FROM instances WHERE status = 'terminating' AND termination_confirmed = false
             AND (termination_attempted_at IS NULL OR EXTRACT(EPOCH FROM ($1 - termination_attempted_at)) >= 300)",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(rows.iter().map(row_to_instance).collect())
    }

    async fn get_pool(&self, id: &str) -> StoreResult<Option<Pool>> {
        let row = sqlx::query("SELECT * FROM pools WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(row.map(|r| row_to_pool(&r)))
    }

    async fn upsert_pool(&self, pool: Pool) -> StoreResult<Pool> {
        sqlx::query(
            "INSERT INTO pools (id, instance_type, az, region, avg_boot_time_seconds, boot_time_sample_count, is_active)
             VALUES ($1,$2,$3,$4,$5,$6,$7)
             ON CONFLICT (id) DO UPDATE SET avg_boot_time_seconds=$5, boot_time_sample_count=$6, is_active=$7",
        )
        .bind(&pool.id)
        .bind(&pool.instance_type)
        .bind(&pool.az)
        .bind(&pool.region)
        .bind(pool.avg_boot_time_seconds)
        .bind(pool.boot_time_sample_count as i32)
        .bind(pool.is_active)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(pool)
    }

    async fn list_pools(&self) -> StoreResult<Vec<Pool>> {
        let rows = sqlx::query("SELECT * FROM pools")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(rows.iter().map(row_to_pool).collect())
    }

    async fn enqueue_command(&self, command: Command) -> StoreResult<Command> {
        if let Some(existing) = sqlx::query("SELECT * FROM commands WHERE agent_id = $1 AND request_id = $2")
            .bind(command.agent_id)
            .bind(&command.request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?
        {
            return Ok(row_to_command(&existing));
        }

        sqlx::query(
            "INSERT INTO commands (id, tenant_id, agent_id, instance_id, command_type, target_mode, target_pool_id,
                priority, terminate_wait_seconds, status, request_id, created_at, deadline, executed_at, success, message)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)",
        )
        .bind(command.id)
        .bind(command.tenant_id)
        .bind(command.agent_id)
        .bind(command.instance_id)
        .bind(command_type_str(command.command_type))
        .bind(command.target_mode.map(mode_str))
        .bind(&command.target_pool_id)
        .bind(command.priority)
        .bind(command.terminate_wait_seconds)
        .bind(command_status_str(command.status))
        .bind(&command.request_id)
        .bind(command.created_at)
        .bind(command.deadline)
        .bind(command.executed_at)
        .bind(command.success)
        .bind(&command.message)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(command)
    }

    async fn get_command(&self, id: Uuid) -> StoreResult<Option<Command>> {
        let row = sqlx::query("SELECT * FROM commands WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(row.map(|r| row_to_command(&r)))
    }

    async fn poll_commands(&self, agent_id: Uuid, limit: usize, now: DateTime<Utc>) -> StoreResult<Vec<Command>> {
        // `FOR UPDATE SKIP LOCKED` leasing, same shape as the solver's
        // job-lease query.
        let rows = sqlx::query(
            "WITH leased AS (
                SELECT id FROM commands
                WHERE agent_id = $1 AND status = 'pending' AND deadline >= $2
                ORDER BY priority DESC, created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
             )
             UPDATE commands SET status = 'in_flight'
             WHERE id IN (SELECT id FROM leased)
             RETURNING *",
        )
        .bind(agent_id)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(rows.iter().map(row_to_command).collect())
    }

    async fn report_command(
        &self,
        agent_id: Uuid,
        command_id: Uuid,
        success: bool,
        message: Option<String>,
    ) -> StoreResult<Command> {
        let row = sqlx::query(
            "UPDATE commands SET status = CASE WHEN $1 THEN 'completed' ELSE 'failed' END,
                executed_at = now(), success = $1, message = $2
             WHERE id = $3 AND agent_id = $4 AND status IN ('pending','in_flight')
             RETURNING *",
        )
        .bind(success)
        .bind(&message)
        .bind(command_id)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        match row {
            Some(r) => Ok(row_to_command(&r)),
            None => self
                .get_command(command_id)
                .await?
                .ok_or(StoreError::NotFound),
        }
    }

    async fn expire_pending_commands(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE commands SET status = 'expired' WHERE status = 'pending' AND deadline < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(result.rows_affected())
    }

    async fn apply_cutover(&self, batch: CutoverBatch) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;

        let r1 = sqlx::query(
            "UPDATE instances SET status='running_primary', is_primary=true, is_active=true, version=version+1, updated_at=now()
             WHERE id=$1 AND version=$2",
        )
        .bind(batch.new_primary.id)
        .bind(batch.new_primary_expected_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        if r1.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }

        let r2 = sqlx::query(
            "UPDATE instances SET status='zombie', is_primary=false, is_active=false, version=version+1, updated_at=now()
             WHERE id=$1 AND version=$2",
        )
        .bind(batch.old_primary.id)
        .bind(batch.old_primary_expected_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        if r2.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }

        let r3 = sqlx::query(
            "UPDATE agents SET instance_id=$1, mode=$2, current_pool_id=$3, last_switch_at=now(), version=version+1
             WHERE agent_id=$4 AND version=$5",
        )
        .bind(batch.new_primary.id)
        .bind(mode_str(batch.new_primary.mode))
        .bind(&batch.new_primary.pool_id)
        .bind(batch.agent.agent_id)
        .bind(batch.agent_expected_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        if r3.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }

        let s = &batch.switch_record;
        sqlx::query(
            "INSERT INTO switches (id, tenant_id, agent_id, from_instance_id, to_instance_id, from_pool_id, to_pool_id,
                from_mode, to_mode, old_price, new_price, savings_impact_per_hour, downtime_seconds, trigger, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
        )
        .bind(s.id)
        .bind(s.tenant_id)
        .bind(s.agent_id)
        .bind(s.from_instance_id)
        .bind(s.to_instance_id)
        .bind(&s.from_pool_id)
        .bind(&s.to_pool_id)
        .bind(mode_str(s.from_mode))
        .bind(mode_str(s.to_mode))
        .bind(s.old_price)
        .bind(s.new_price)
        .bind(s.savings_impact_per_hour)
        .bind(s.downtime_seconds)
        .bind(switch_trigger_str(s.trigger))
        .bind(s.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn list_switch_records_since(&self, agent_id: Uuid, since: DateTime<Utc>) -> StoreResult<Vec<SwitchRecord>> {
        let rows = sqlx::query("SELECT * FROM switches WHERE agent_id = $1 AND created_at >= $2")
            .bind(agent_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(rows.iter().map(row_to_switch).collect())
    }

    async fn insert_safety_violation(&self, violation: SafetyViolation) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO safety_violations (id, tenant_id, severity, violated_constraints, original, safe_alternative, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(violation.id)
        .bind(violation.tenant_id)
        .bind(severity_str(violation.severity))
        .bind(serde_json::to_value(&violation.violated_constraints).unwrap_or_default())
        .bind(violation.original)
        .bind(violation.safe_alternative)
        .bind(violation.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn insert_decision(&self, decision: Decision) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO decisions (id, tenant_id, agent_id, action, target_mode, target_pool_id, risk_score,
                                     expected_savings_per_hour, confidence, reason, filtered, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
        )
        .bind(decision.id)
        .bind(decision.tenant_id)
        .bind(decision.agent_id)
        .bind(action_str(decision.action))
        .bind(decision.target_mode.map(mode_str))
        .bind(decision.target_pool_id)
        .bind(decision.risk_score)
        .bind(decision.expected_savings_per_hour)
        .bind(decision.confidence)
        .bind(decision.reason)
        .bind(decision.filtered)
        .bind(decision.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn insert_system_event(&self, event: SystemEvent) -> StoreResult<()> {
        sqlx::query("INSERT INTO system_events (id, tenant_id, kind, payload, created_at) VALUES ($1,$2,$3,$4,$5)")
            .bind(event.id)
            .bind(event.tenant_id)
            .bind(event.kind)
            .bind(event.payload)
            .bind(event.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn insert_raw_prices(&self, samples: Vec<PriceSample>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;
        for s in samples {
            sqlx::query(
                "INSERT INTO prices_raw (id, pool_id, price, captured_at, source, role, agent_id)
                 VALUES ($1,$2,$3,$4,$5,$6,$7)",
            )
            .bind(s.id)
            .bind(&s.pool_id)
            .bind(s.price)
            .bind(s.captured_at)
            .bind(price_source_str(s.source))
            .bind(price_role_str(s.role))
            .bind(s.agent_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        }
        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn raw_prices_in_window(&self, pool_id: &str, since: DateTime<Utc>) -> StoreResult<Vec<PriceSample>> {
        let rows = sqlx::query("SELECT * FROM prices_raw WHERE pool_id = $1 AND captured_at >= $2 ORDER BY captured_at")
            .bind(pool_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(rows
            .iter()
            .map(|r| PriceSample {
                id: r.get("id"),
                pool_id: r.get("pool_id"),
                price: r.get("price"),
                captured_at: r.get("captured_at"),
                source: price_source_from(r.get::<String, _>("source").as_str()),
                role: price_role_from(r.get::<String, _>("role").as_str()),
                agent_id: r.get("agent_id"),
            })
            .collect())
    }

    async fn list_pool_ids_with_raw_prices(&self, since: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT DISTINCT pool_id FROM prices_raw WHERE captured_at >= $1")
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(rows)
    }

    async fn replace_consolidated(&self, pool_id: &str, rows: Vec<ConsolidatedPrice>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;
        for r in rows {
            sqlx::query(
                "INSERT INTO prices_consolidated (pool_id, timestamp, price, source, confidence, run_id)
                 VALUES ($1,$2,$3,$4,$5,$6)
                 ON CONFLICT (pool_id, timestamp) DO UPDATE SET price=$3, source=$4, confidence=$5, run_id=$6",
            )
            .bind(pool_id)
            .bind(r.timestamp)
            .bind(r.price)
            .bind(price_source_str(r.source))
            .bind(r.confidence)
            .bind(r.run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        }
        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn consolidated_in_window(&self, pool_id: &str, since: DateTime<Utc>) -> StoreResult<Vec<ConsolidatedPrice>> {
        let rows = sqlx::query(
            "SELECT * FROM prices_consolidated WHERE pool_id = $1 AND timestamp >= $2 ORDER BY timestamp",
        )
        .bind(pool_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(rows
            .iter()
            .map(|r| ConsolidatedPrice {
                pool_id: r.get("pool_id"),
                timestamp: r.get("timestamp"),
                price: r.get("price"),
                source: price_source_from(r.get::<String, _>("source").as_str()),
                confidence: r.get("confidence"),
                run_id: r.get("run_id"),
            })
            .collect())
    }

    async fn replace_canonical(&self, pool_id: &str, rows: Vec<CanonicalPrice>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;
        for r in rows {
            sqlx::query(
                "INSERT INTO prices_canonical (pool_id, timestamp, price, source, confidence)
                 VALUES ($1,$2,$3,$4,$5)
                 ON CONFLICT (pool_id, timestamp) DO UPDATE SET price=$3, source=$4, confidence=$5",
            )
            .bind(pool_id)
            .bind(r.timestamp)
            .bind(r.price)
            .bind(price_source_str(r.source))
            .bind(r.confidence)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        }
        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn canonical_latest(&self, pool_id: &str) -> StoreResult<Option<CanonicalPrice>> {
        let row = sqlx::query("SELECT * FROM prices_canonical WHERE pool_id = $1 ORDER BY timestamp DESC LIMIT 1")
            .bind(pool_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(row.map(|r| CanonicalPrice {
            pool_id: r.get("pool_id"),
            timestamp: r.get("timestamp"),
            price: r.get("price"),
            source: price_source_from(r.get::<String, _>("source").as_str()),
            confidence: r.get("confidence"),
        }))
    }

    async fn upsert_ondemand_price(&self, price: OnDemandPrice) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO ondemand_prices (region, instance_type, price, effective_at)
             VALUES ($1,$2,$3,$4)
             ON CONFLICT (region, instance_type) DO UPDATE SET price=$3, effective_at=$4",
        )
        .bind(&price.region)
        .bind(&price.instance_type)
        .bind(price.price)
        .bind(price.effective_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn latest_ondemand_price(&self, region: &str, instance_type: &str) -> StoreResult<Option<OnDemandPrice>> {
        let row = sqlx::query("SELECT * FROM ondemand_prices WHERE region = $1 AND instance_type = $2")
            .bind(region)
            .bind(instance_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(row.map(|r| OnDemandPrice {
            region: r.get("region"),
            instance_type: r.get("instance_type"),
            price: r.get("price"),
            effective_at: r.get("effective_at"),
        }))
    }

    async fn enforce_retention(
        &self,
        raw_before: DateTime<Utc>,
        consolidated_before: DateTime<Utc>,
        canonical_before: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query("DELETE FROM prices_raw WHERE captured_at < $1")
            .bind(raw_before)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query("DELETE FROM prices_consolidated WHERE timestamp < $1")
            .bind(consolidated_before)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        sqlx::query("DELETE FROM prices_canonical WHERE timestamp < $1")
            .bind(canonical_before)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }
}
