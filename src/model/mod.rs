//! Core domain types shared by every component.
//!
//! These are plain data structs with no behavior beyond small invariant
//! helpers; the components in `crate::{dispatcher, state_machine, safety,
//! emergency, pricing, decision}` own the behavior that operates on them.

mod agent;
mod command;
mod instance;
mod pool;
mod price;
mod safety_violation;
mod switch;
mod system_event;
mod tenant;

pub use agent::{Agent, AgentConfig, AgentStatus, NoticeStatus};
pub use command::{priority, Command, CommandStatus, CommandType};
pub use instance::{Instance, InstanceStatus};
pub use pool::Pool;
pub use price::{CanonicalPrice, ConsolidatedPrice, OnDemandPrice, PriceSample, PriceSampleRole, PriceSource};
pub use safety_violation::{SafetyViolation, ViolationSeverity};
pub use switch::{SwitchRecord, SwitchTrigger};
pub use system_event::SystemEvent;
pub use tenant::Tenant;

/// Purchasing mode of an agent/instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Spot,
    Ondemand,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Spot => write!(f, "spot"),
            Mode::Ondemand => write!(f, "ondemand"),
        }
    }
}

/// Row version used for optimistic concurrency across every mutable entity.
pub type Version = i64;
