//! Async runtime pieces of Tether: the scheduler loop and everything it
//! drives.

pub mod broker;
pub mod capability;
pub mod engine;
pub mod event_bus;
pub mod gateway;
pub mod permissions;
pub mod reasoner;
pub mod scheduler;

pub use broker::InterruptBroker;
pub use capability::{CallContext, Capability, CapabilityOutput, CapabilityRegistry};
pub use engine::{Execution, ExecutionEngine, Outcome};
pub use event_bus::EventBus;
pub use gateway::ResumeGateway;
pub use permissions::PermissionService;
pub use reasoner::{PlanReasoner, PlannedCall, Reasoner, Step};
pub use scheduler::{CycleReport, Scheduler};
