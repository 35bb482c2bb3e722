//! The central DIFC monitor.
//!
//! Tags are capabilities: reading requires the agent to cover the
//! resource's secrecy label, writing requires it to cover the integrity
//! label. Agents acquire tags by reading labeled data; acquisition is
//! atomic per call and monotonic across a session.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::difc::label::{
    AgentState, CollectionLabeledData, Label, LabeledItem, LabeledResource,
};
use crate::error::{GatewayError, GatewayResult};

/// Outcome of the coarse policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The operation may proceed
    Allowed,
    /// The operation is denied
    Denied {
        /// Violated label component: "secrecy" or "integrity"
        component: &'static str,
        /// Tags the agent lacks
        missing: Vec<String>,
    },
}

/// Result of fine-grained collection filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    /// Values the agent may read, in original order
    pub kept: Vec<serde_json::Value>,
    /// Count of accessible items
    pub accessible: usize,
    /// Count of items dropped by the filter
    pub filtered: usize,
}

/// Compares agent labels against resource labels and tracks per-agent
/// accumulated state.
#[derive(Debug, Default)]
pub struct PolicyMonitor {
    agents: DashMap<String, Arc<Mutex<AgentState>>>,
}

impl PolicyMonitor {
    /// Create a monitor with no known agents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch-or-create the accumulating state for an agent.
    pub fn agent(&self, agent_id: &str) -> Arc<Mutex<AgentState>> {
        Arc::clone(
            &self
                .agents
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(AgentState::default()))),
        )
    }

    /// Coarse policy check of an agent against a resource.
    pub fn evaluate(agent: &AgentState, resource: &LabeledResource) -> PolicyDecision {
        if resource.operation.reads() && !resource.secrecy.is_subset(&agent.secrecy) {
            return PolicyDecision::Denied {
                component: "secrecy",
                missing: resource.secrecy.missing_from(&agent.secrecy),
            };
        }
        if resource.operation.writes() && !resource.integrity.is_subset(&agent.integrity) {
            return PolicyDecision::Denied {
                component: "integrity",
                missing: resource.integrity.missing_from(&agent.integrity),
            };
        }
        PolicyDecision::Allowed
    }

    /// Run the coarse check for `agent_id`, mapping denial to a structured
    /// error that names the violated component and the offending tags.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::PolicyDenied` when the check fails.
    pub fn check(&self, agent_id: &str, resource: &LabeledResource) -> GatewayResult<()> {
        let state = self.agent(agent_id);
        let agent = state.lock();
        match Self::evaluate(&agent, resource) {
            PolicyDecision::Allowed => Ok(()),
            PolicyDecision::Denied { component, missing } => {
                debug!(
                    agent = agent_id,
                    resource = %resource.description,
                    component,
                    ?missing,
                    "policy denied"
                );
                Err(GatewayError::PolicyDenied {
                    component,
                    missing,
                    resource: resource.description.clone(),
                })
            }
        }
    }

    /// Whether the agent may read one labeled item.
    fn readable(agent: &AgentState, item: &LabeledItem) -> bool {
        item.secrecy.is_subset(&agent.secrecy)
    }

    /// Walk a labeled collection, dropping items the agent may not read,
    /// and merge the labels of the delivered items (plus the collection's
    /// overall label) into the agent's state when `accumulate` is set.
    ///
    /// The whole step runs under the agent's lock so accumulation is atomic
    /// per call.
    pub fn filter_collection(
        &self,
        agent_id: &str,
        collection: &CollectionLabeledData,
        accumulate: bool,
    ) -> FilterOutcome {
        let state = self.agent(agent_id);
        let mut agent = state.lock();

        let mut kept = Vec::with_capacity(collection.items.len());
        let mut filtered = 0usize;
        for item in &collection.items {
            if Self::readable(&agent, item) {
                if accumulate {
                    agent.absorb(&item.secrecy, &item.integrity);
                }
                kept.push(item.value.clone());
            } else {
                filtered += 1;
            }
        }
        if accumulate {
            agent.absorb(&collection.secrecy, &collection.integrity);
        }

        let accessible = kept.len();
        info!(agent = agent_id, accessible, filtered, "collection filtered");
        FilterOutcome {
            kept,
            accessible,
            filtered,
        }
    }

    /// Merge a pair of labels into the agent's state (reads only).
    pub fn absorb(&self, agent_id: &str, secrecy: &Label, integrity: &Label) {
        let state = self.agent(agent_id);
        state.lock().absorb(secrecy, integrity);
    }

    /// Snapshot of an agent's accumulated labels.
    pub fn snapshot(&self, agent_id: &str) -> AgentState {
        self.agent(agent_id).lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::difc::label::OperationKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn resource(
        secrecy: &[&str],
        integrity: &[&str],
        operation: OperationKind,
    ) -> LabeledResource {
        LabeledResource {
            description: "test resource".to_string(),
            secrecy: Label::from_tags(secrecy.iter().copied()),
            integrity: Label::from_tags(integrity.iter().copied()),
            operation,
        }
    }

    #[test]
    fn test_unlabeled_resources_always_pass() {
        let agent = AgentState::default();
        let decision =
            PolicyMonitor::evaluate(&agent, &resource(&[], &[], OperationKind::ReadWrite));
        assert_eq!(decision, PolicyDecision::Allowed);
    }

    #[test]
    fn test_read_requires_secrecy_coverage() {
        let agent = AgentState::default();
        let decision =
            PolicyMonitor::evaluate(&agent, &resource(&["pii"], &[], OperationKind::Read));
        assert_eq!(
            decision,
            PolicyDecision::Denied {
                component: "secrecy",
                missing: vec!["pii".to_string()],
            }
        );
    }

    #[test]
    fn test_write_requires_integrity_coverage() {
        let mut agent = AgentState::default();
        agent.secrecy = Label::from_tags(["pii"]);
        let decision = PolicyMonitor::evaluate(
            &agent,
            &resource(&[], &["endorsed"], OperationKind::Write),
        );
        assert_eq!(
            decision,
            PolicyDecision::Denied {
                component: "integrity",
                missing: vec!["endorsed".to_string()],
            }
        );
    }

    #[test]
    fn test_readwrite_checks_both_components() {
        let mut agent = AgentState::default();
        agent.secrecy = Label::from_tags(["s"]);
        agent.integrity = Label::from_tags(["i"]);
        let decision = PolicyMonitor::evaluate(
            &agent,
            &resource(&["s"], &["i"], OperationKind::ReadWrite),
        );
        assert_eq!(decision, PolicyDecision::Allowed);
    }

    #[test]
    fn test_check_surfaces_structured_denial() {
        let monitor = PolicyMonitor::new();
        let err = monitor
            .check("alice", &resource(&["secret"], &[], OperationKind::Read))
            .unwrap_err();
        match err {
            GatewayError::PolicyDenied {
                component, missing, ..
            } => {
                assert_eq!(component, "secrecy");
                assert_eq!(missing, vec!["secret".to_string()]);
            }
            other => panic!("wrong error: {other:?}"),
        }
    }

    fn item(value: serde_json::Value, secrecy: &[&str]) -> LabeledItem {
        LabeledItem {
            value,
            secrecy: Label::from_tags(secrecy.iter().copied()),
            integrity: Label::empty(),
        }
    }

    #[test]
    fn test_filtering_drops_unreadable_items_and_counts() {
        let monitor = PolicyMonitor::new();
        monitor.absorb("alice", &Label::from_tags(["public"]), &Label::empty());

        let collection = CollectionLabeledData {
            items: vec![
                item(json!("a"), &[]),
                item(json!("b"), &["public"]),
                item(json!("c"), &["secret"]),
            ],
            secrecy: Label::empty(),
            integrity: Label::empty(),
        };

        let outcome = monitor.filter_collection("alice", &collection, true);
        assert_eq!(outcome.kept, vec![json!("a"), json!("b")]);
        assert_eq!(outcome.accessible, 2);
        assert_eq!(outcome.filtered, 1);
    }

    #[test]
    fn test_accumulation_is_monotonic_across_reads() {
        let monitor = PolicyMonitor::new();
        monitor.absorb("a", &Label::from_tags(["s1"]), &Label::from_tags(["i1"]));

        let collection = CollectionLabeledData {
            items: vec![item(json!(1), &[])],
            secrecy: Label::from_tags(["s2"]),
            integrity: Label::empty(),
        };
        monitor.filter_collection("a", &collection, true);

        let state = monitor.snapshot("a");
        // Nothing from the earlier read was lost.
        assert!(state.secrecy.contains("s1"));
        assert!(state.secrecy.contains("s2"));
        assert!(state.integrity.contains("i1"));
    }

    #[test]
    fn test_writes_do_not_accumulate() {
        let monitor = PolicyMonitor::new();
        let collection = CollectionLabeledData {
            items: vec![item(json!(1), &[])],
            secrecy: Label::from_tags(["s"]),
            integrity: Label::empty(),
        };
        monitor.filter_collection("w", &collection, false);
        assert!(monitor.snapshot("w").secrecy.is_empty());
    }

    #[test]
    fn test_same_agent_id_shares_state() {
        let monitor = PolicyMonitor::new();
        let a = monitor.agent("x");
        let b = monitor.agent("x");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_reading_granted_tags_unlocks_later_reads() {
        let monitor = PolicyMonitor::new();
        // First read of data labeled {team} grants the team tag...
        let collection = CollectionLabeledData {
            items: vec![item(json!("roster"), &[])],
            secrecy: Label::from_tags(["team"]),
            integrity: Label::empty(),
        };
        monitor.filter_collection("bob", &collection, true);

        // ...which satisfies a subsequent read of a team-labeled resource.
        assert!(
            monitor
                .check("bob", &resource(&["team"], &[], OperationKind::Read))
                .is_ok()
        );
    }
}
