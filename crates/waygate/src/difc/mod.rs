//! Decentralized information-flow control (DIFC).
//!
//! When enabled, every tool invocation passes through a labeling and
//! policy-evaluation pipeline: the backend's guard labels the resource, the
//! monitor checks the agent's accumulated state against it, the backend
//! call runs, the guard labels the response, collections are filtered
//! item-by-item, and delivered labels accumulate into the agent.

pub mod guard;
pub mod label;
pub mod monitor;

pub use guard::{BackendCaller, Guard, GuardRegistry, PassThroughGuard};
pub use label::{
    AgentState, CollectionLabeledData, Label, LabeledData, LabeledItem, LabeledResource,
    OperationKind,
};
pub use monitor::{FilterOutcome, PolicyDecision, PolicyMonitor};
