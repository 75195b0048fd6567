//! Agent-facing and operator-facing handlers (§4.9 / §6). Each agent
//! endpoint re-reads its target row, mutates only through the component
//! that owns that row (State Machine for status, Dispatcher for
//! commands), and never trusts path/body ids across tenants.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::auth::TenantAuth;
use crate::api::error::ApiError;
use crate::api::AppState;
use crate::error::ControlPlaneError;
use crate::model::{
    Agent, AgentConfig, AgentStatus, Command, CommandType, Instance, InstanceStatus, Mode, NoticeStatus,
    Pool, PriceSample, PriceSampleRole, PriceSource, SwitchTrigger,
};
use crate::store::{retry_on_conflict, Store, StoreError};

/// `X-Request-ID` (§4.9): the transport for the Dispatcher idempotency
/// key. Takes precedence over a body-level `request_id` field when both
/// are present.
fn request_id_header(headers: &HeaderMap) -> Option<String> {
    headers.get("x-request-id").and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

fn require_tenant_owns_agent(agent: &Agent, tenant_id: Uuid) -> Result<(), ApiError> {
    if agent.tenant_id != tenant_id {
        return Err(ApiError(ControlPlaneError::NotFound("agent not found".into())));
    }
    Ok(())
}

async fn load_agent<S: Store>(store: &S, agent_id: Uuid, tenant_id: Uuid) -> Result<Agent, ApiError> {
    let agent = store
        .get_agent(agent_id)
        .await?
        .ok_or_else(|| ApiError(ControlPlaneError::NotFound("agent not found".into())))?;
    require_tenant_owns_agent(&agent, tenant_id)?;
    Ok(agent)
}

// -- register --

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub logical_agent_id: String,
    pub instance_id: Option<Uuid>,
    pub instance_type: String,
    pub region: String,
    pub az: String,
    pub mode: Mode,
    #[allow(dead_code)]
    pub hostname: Option<String>,
    #[allow(dead_code)]
    pub ami_id: Option<String>,
    #[allow(dead_code)]
    pub agent_version: Option<String>,
    #[allow(dead_code)]
    pub ip: Option<String>,
    pub config: Option<AgentConfig>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub agent_id: Uuid,
    pub config: AgentConfig,
    pub config_version: i64,
}

pub async fn register<S: Store>(
    State(state): State<AppState<S>>,
    TenantAuth { tenant }: TenantAuth,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    if let Some(ref config) = body.config {
        if !config.is_valid() {
            return Err(ApiError(ControlPlaneError::Validation(
                "agent config: auto_switch_enabled and manual_replica_enabled are mutually exclusive".into(),
            )));
        }
    }

    let existing = state.store.get_agent_by_logical_id(tenant.id, &body.logical_agent_id).await?;

    let pool_id = Pool::id_for(&body.instance_type, &body.az);
    if state.store.get_pool(&pool_id).await?.is_none() {
        state.store.upsert_pool(Pool::new(body.instance_type.clone(), body.az.clone(), body.region.clone())).await?;
    }

    let agent = match existing {
        Some(agent) => agent,
        None => {
            let mut agent = Agent::new(tenant.id, body.logical_agent_id.clone(), body.region.clone(), body.az.clone(), body.mode);
            if let Some(ref config) = body.config {
                agent.config = config.clone();
            }
            state.store.insert_agent(agent).await?
        }
    };

    let instance = match body.instance_id.map(|id| state.store.get_instance(id)) {
        Some(fut) => fut.await?,
        None => None,
    };
    let instance = match instance {
        Some(i) => i,
        None => {
            state
                .store
                .insert_instance(Instance::new(
                    agent.agent_id,
                    tenant.id,
                    body.instance_type.clone(),
                    body.region.clone(),
                    body.az.clone(),
                    pool_id.clone(),
                    body.mode,
                    InstanceStatus::RunningPrimary,
                    true,
                ))
                .await?
        }
    };

    let agent = retry_on_conflict(|| async {
        let Some(agent) = state.store.get_agent(agent.agent_id).await? else {
            return Err(StoreError::NotFound);
        };
        let mut updated = agent.clone();
        updated.instance_id = Some(instance.id);
        updated.mode = body.mode;
        updated.region = body.region.clone();
        updated.az = body.az.clone();
        updated.current_pool_id = Some(pool_id.clone());
        updated.status = AgentStatus::Online;
        updated.last_heartbeat_at = Utc::now();
        if let Some(ref config) = body.config {
            updated.config = config.clone();
            updated.config_version += 1;
        }
        state.store.update_agent_if(updated, agent.version).await
    })
    .await?;

    Ok(Json(RegisterResponse { agent_id: agent.agent_id, config: agent.config, config_version: agent.config_version }))
}

// -- heartbeat --

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub status: AgentStatus,
    pub instance_id: Option<Uuid>,
    pub mode: Option<Mode>,
    pub az: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub config_version: i64,
}

pub async fn heartbeat<S: Store>(
    State(state): State<AppState<S>>,
    Path(agent_id): Path<Uuid>,
    TenantAuth { tenant }: TenantAuth,
    Json(body): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    load_agent(state.store.as_ref(), agent_id, tenant.id).await?;

    if let Some(claimed) = body.instance_id {
        state.state_machine.accept_heartbeat(agent_id, claimed).await?;
    }

    let config_version = retry_on_conflict(|| async {
        let Some(agent) = state.store.get_agent(agent_id).await? else {
            return Err(StoreError::NotFound);
        };
        let mut updated = agent.clone();
        updated.status = body.status;
        updated.last_heartbeat_at = Utc::now();
        if let Some(mode) = body.mode {
            updated.mode = mode;
        }
        if let Some(ref az) = body.az {
            updated.az = az.clone();
        }
        let config_version = updated.config_version;
        state.store.update_agent_if(updated, agent.version).await.map(|_| config_version)
    })
    .await?;

    Ok(Json(HeartbeatResponse { ok: true, config_version }))
}

// -- poll --

pub async fn poll_commands<S: Store>(
    State(state): State<AppState<S>>,
    Path(agent_id): Path<Uuid>,
    TenantAuth { tenant }: TenantAuth,
) -> Result<Json<Vec<Command>>, ApiError> {
    load_agent(state.store.as_ref(), agent_id, tenant.id).await?;
    let commands = state.dispatcher.poll(agent_id, 20).await?;
    Ok(Json(commands))
}

// -- report_execution --

/// Filled in when reporting success on a `create_replica` command: the
/// instance the agent just launched, handed back so the control plane
/// can track it as a replica before a later `switch_report` promotes it.
#[derive(Debug, Deserialize)]
pub struct ReplicaDetails {
    pub instance_id: Uuid,
    pub instance_type: String,
    pub region: String,
    pub az: String,
    pub pool_id: String,
    pub mode: Mode,
    pub spot_price: Option<f64>,
    pub ondemand_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ReportExecutionRequest {
    pub success: bool,
    pub message: Option<String>,
    pub replica: Option<ReplicaDetails>,
}

pub async fn report_execution<S: Store>(
    State(state): State<AppState<S>>,
    Path((agent_id, command_id)): Path<(Uuid, Uuid)>,
    TenantAuth { tenant }: TenantAuth,
    Json(body): Json<ReportExecutionRequest>,
) -> Result<Json<Command>, ApiError> {
    let agent = load_agent(state.store.as_ref(), agent_id, tenant.id).await?;
    let command = state.dispatcher.report(agent_id, command_id, body.success, body.message).await?;

    if body.success && command.command_type == CommandType::CreateReplica {
        if let Some(replica) = body.replica {
            let mut instance = Instance::new(
                agent_id,
                agent.tenant_id,
                replica.instance_type,
                replica.region,
                replica.az,
                replica.pool_id,
                replica.mode,
                InstanceStatus::RunningReplica,
                false,
            );
            instance.id = replica.instance_id;
            instance.spot_price = replica.spot_price;
            instance.ondemand_price = replica.ondemand_price;
            state.store.insert_instance(instance).await?;
        }
    }

    Ok(Json(command))
}

// -- switch_report --

#[derive(Debug, Deserialize)]
pub struct SwitchReportRequest {
    pub old_instance_id: Uuid,
    pub new_instance_id: Uuid,
    pub new_spot_price: Option<f64>,
    pub new_ondemand_price: Option<f64>,
    pub trigger: SwitchTrigger,
    pub downtime_seconds: f64,
}

pub async fn switch_report<S: Store>(
    State(state): State<AppState<S>>,
    Path(agent_id): Path<Uuid>,
    TenantAuth { tenant }: TenantAuth,
    Json(body): Json<SwitchReportRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    load_agent(state.store.as_ref(), agent_id, tenant.id).await?;

    let old_primary = state
        .store
        .get_instance(body.old_instance_id)
        .await?
        .ok_or_else(|| ApiError(ControlPlaneError::NotFound("old instance not found".into())))?;
    let mut new_replica = state
        .store
        .get_instance(body.new_instance_id)
        .await?
        .ok_or_else(|| ApiError(ControlPlaneError::NotFound("new instance not found".into())))?;

    if let Some(price) = body.new_spot_price {
        new_replica.spot_price = Some(price);
    }
    if let Some(price) = body.new_ondemand_price {
        new_replica.ondemand_price = Some(price);
    }
    if new_replica.boot_completed_at.is_none() {
        new_replica.boot_completed_at = Some(Utc::now());
    }
    let boot_duration_seconds = new_replica.boot_duration_seconds;
    let new_pool_id = new_replica.pool_id.clone();

    state.state_machine.cutover(new_replica, old_primary, body.trigger, body.downtime_seconds).await?;

    if let Some(seconds) = boot_duration_seconds {
        state.emergency.record_boot_duration(&new_pool_id, seconds as f64).await?;
    }

    crate::events::record(
        state.store.as_ref(),
        &state.events,
        crate::events::Event::SwitchCompleted { agent_id, savings_per_hour: body.new_spot_price.unwrap_or(0.0) },
    )
    .await;

    Ok(Json(serde_json::json!({ "ok": true })))
}

// -- pricing_report --

#[derive(Debug, Deserialize)]
pub struct PoolPriceSample {
    pub pool_id: String,
    pub price: f64,
    pub captured_at: DateTime<Utc>,
    pub role: PriceSampleRole,
}

#[derive(Debug, Deserialize)]
pub struct OnDemandSample {
    pub region: String,
    pub instance_type: String,
    pub price: f64,
}

#[derive(Debug, Deserialize)]
pub struct PricingReportRequest {
    pub samples: Vec<PoolPriceSample>,
    pub ondemand: Option<OnDemandSample>,
}

pub async fn pricing_report<S: Store>(
    State(state): State<AppState<S>>,
    Path(agent_id): Path<Uuid>,
    TenantAuth { tenant }: TenantAuth,
    Json(body): Json<PricingReportRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    load_agent(state.store.as_ref(), agent_id, tenant.id).await?;

    let mut admitted = Vec::with_capacity(body.samples.len());
    let mut dropped = 0u32;
    for s in body.samples {
        if state.price_buffer.admit(&s.pool_id) {
            admitted.push(PriceSample {
                id: Uuid::new_v4(),
                pool_id: s.pool_id,
                price: s.price,
                captured_at: s.captured_at,
                source: PriceSource::Agent,
                role: s.role,
                agent_id: Some(agent_id),
            });
        } else {
            dropped += 1;
            crate::events::record(state.store.as_ref(), &state.events, crate::events::Event::PriceSamplesDropped { pool_id: s.pool_id, dropped: 1 })
                .await;
        }
    }
    let accepted = admitted.len();
    if !admitted.is_empty() {
        state.store.insert_raw_prices(admitted).await?;
    }

    if let Some(od) = body.ondemand {
        state
            .store
            .upsert_ondemand_price(crate::model::OnDemandPrice {
                region: od.region,
                instance_type: od.instance_type,
                price: od.price,
                effective_at: Utc::now(),
            })
            .await?;
    }

    Ok(Json(serde_json::json!({ "accepted": accepted, "dropped": dropped })))
}

// -- emergency --

#[derive(Debug, Deserialize, Default)]
pub struct EmergencyNoticeRequest {
    pub notice_time: Option<DateTime<Utc>>,
}

pub async fn rebalance_recommendation<S: Store>(
    State(state): State<AppState<S>>,
    Path(agent_id): Path<Uuid>,
    TenantAuth { tenant }: TenantAuth,
    Json(body): Json<EmergencyNoticeRequest>,
) -> Result<Json<crate::emergency::EmergencyAction>, ApiError> {
    load_agent(state.store.as_ref(), agent_id, tenant.id).await?;
    let action = state.emergency.on_rebalance_recommendation(agent_id, body.notice_time.unwrap_or_else(Utc::now)).await?;
    crate::events::record(
        state.store.as_ref(),
        &state.events,
        crate::events::Event::EmergencyTriggered { agent_id, notice: "rebalance_recommendation".into() },
    )
    .await;
    Ok(Json(action))
}

pub async fn termination_imminent<S: Store>(
    State(state): State<AppState<S>>,
    Path(agent_id): Path<Uuid>,
    TenantAuth { tenant }: TenantAuth,
    Json(body): Json<EmergencyNoticeRequest>,
) -> Result<Json<crate::emergency::EmergencyAction>, ApiError> {
    load_agent(state.store.as_ref(), agent_id, tenant.id).await?;
    let action = state.emergency.on_termination_notice(agent_id, body.notice_time.unwrap_or_else(Utc::now)).await?;
    crate::events::record(
        state.store.as_ref(),
        &state.events,
        crate::events::Event::EmergencyTriggered { agent_id, notice: "termination_imminent".into() },
    )
    .await;
    Ok(Json(action))
}

#[derive(Debug, Deserialize)]
pub struct TerminationReportRequest {
    pub instance_id: Uuid,
    pub confirmed: bool,
}

pub async fn termination_report<S: Store>(
    State(state): State<AppState<S>>,
    Path(agent_id): Path<Uuid>,
    TenantAuth { tenant }: TenantAuth,
    Json(body): Json<TerminationReportRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let agent = load_agent(state.store.as_ref(), agent_id, tenant.id).await?;
    let mut instance = state
        .store
        .get_instance(body.instance_id)
        .await?
        .ok_or_else(|| ApiError(ControlPlaneError::NotFound("instance not found".into())))?;
    if instance.tenant_id != agent.tenant_id {
        return Err(ApiError(ControlPlaneError::NotFound("instance not found".into())));
    }

    if instance.status == InstanceStatus::Zombie {
        instance = state.state_machine.transition(instance, InstanceStatus::Terminating).await?;
    }
    if body.confirmed && instance.status == InstanceStatus::Terminating {
        instance.termination_confirmed = true;
        instance.termination_attempted_at = Some(Utc::now());
        state.state_machine.transition(instance, InstanceStatus::Terminated).await?;
    }

    Ok(Json(serde_json::json!({ "ok": true })))
}

// -- operator surface --

pub async fn list_instances<S: Store>(
    State(state): State<AppState<S>>,
    TenantAuth { tenant }: TenantAuth,
) -> Result<Json<Vec<Instance>>, ApiError> {
    Ok(Json(state.store.list_instances(tenant.id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ForceSwitchRequest {
    pub target_mode: Mode,
    pub target_pool_id: String,
    pub request_id: Option<String>,
}

pub async fn force_switch<S: Store>(
    State(state): State<AppState<S>>,
    Path(agent_id): Path<Uuid>,
    TenantAuth { tenant }: TenantAuth,
    headers: HeaderMap,
    Json(body): Json<ForceSwitchRequest>,
) -> Result<Json<Command>, ApiError> {
    let agent = load_agent(state.store.as_ref(), agent_id, tenant.id).await?;
    let instance_id = agent.instance_id.ok_or_else(|| ApiError(ControlPlaneError::Validation("agent has no active instance".into())))?;
    let request_id = request_id_header(&headers)
        .or(body.request_id)
        .unwrap_or_else(|| format!("force-switch-{agent_id}-{}", Utc::now().timestamp()));
    let command = state.dispatcher.manual_switch_command(tenant.id, agent_id, instance_id, body.target_mode, body.target_pool_id, request_id);
    let command = state.dispatcher.enqueue(command).await?;
    Ok(Json(command))
}

#[derive(Debug, Serialize)]
pub struct EmergencyStatusResponse {
    pub notice_status: NoticeStatus,
    pub notice_deadline: Option<DateTime<Utc>>,
}

pub async fn emergency_status<S: Store>(
    State(state): State<AppState<S>>,
    Path(agent_id): Path<Uuid>,
    TenantAuth { tenant }: TenantAuth,
) -> Result<Json<EmergencyStatusResponse>, ApiError> {
    let agent = load_agent(state.store.as_ref(), agent_id, tenant.id).await?;
    Ok(Json(EmergencyStatusResponse { notice_status: agent.notice_status, notice_deadline: agent.notice_deadline }))
}

pub async fn notifications<S: Store>(
    State(state): State<AppState<S>>,
    TenantAuth { .. }: TenantAuth,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    })
    .map(|event| Ok(SseEvent::default().json_data(event).unwrap_or_else(|_| SseEvent::default().data("serialization error"))));

    Sse::new(stream).keep_alive(KeepAlive::default())
}
