use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;
use tracing::debug;

use beep_core::{CancellationToken, ProgressSink};

use crate::action::{ActionResult, WorkflowAction};
use crate::events::ActionId;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("action {0} is already part of the chain")]
    DuplicateAction(ActionId),
    #[error("action {0} is not part of the chain")]
    UnknownAction(ActionId),
    #[error("linking {from} -> {to} would create a cycle")]
    CycleDetected { from: ActionId, to: ActionId },
}

/// Per-action outcome of a chain run.
#[derive(Clone, Debug)]
pub enum ChainOutcome {
    Executed(ActionResult),
    /// A predecessor did not finish with `Success`.
    Skipped,
}

/// A DAG of actions. Successors are evaluated only when every predecessor
/// ended with `eventType=Success`; everything downstream of a failure is
/// skipped, not run.
#[derive(Default)]
pub struct ActionChain {
    graph: DiGraph<Arc<WorkflowAction>, ()>,
    nodes: HashMap<ActionId, NodeIndex>,
}

impl ActionChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, action: Arc<WorkflowAction>) -> Result<ActionId, ChainError> {
        let id = action.id().clone();
        if self.nodes.contains_key(&id) {
            return Err(ChainError::DuplicateAction(id));
        }
        let node = self.graph.add_node(action);
        self.nodes.insert(id.clone(), node);
        Ok(id)
    }

    /// Declare `to` a successor of `from`.
    pub fn link(&mut self, from: &ActionId, to: &ActionId) -> Result<(), ChainError> {
        let from_node = *self
            .nodes
            .get(from)
            .ok_or_else(|| ChainError::UnknownAction(from.clone()))?;
        let to_node = *self
            .nodes
            .get(to)
            .ok_or_else(|| ChainError::UnknownAction(to.clone()))?;
        let edge = self.graph.add_edge(from_node, to_node, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(ChainError::CycleDetected {
                from: from.clone(),
                to: to.clone(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Run the chain in dependency order.
    pub fn run(
        &self,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Vec<(ActionId, ChainOutcome)> {
        // `link` keeps the graph acyclic, so a topological order exists.
        let order = toposort(&self.graph, None).unwrap_or_default();
        let mut outcomes: HashMap<NodeIndex, bool> = HashMap::new();
        let mut results = Vec::with_capacity(order.len());
        for node in order {
            let action = &self.graph[node];
            let runnable = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .all(|pred| outcomes.get(&pred).copied().unwrap_or(false));
            if !runnable {
                debug!(action = %action.id(), "skipping: predecessor did not succeed");
                outcomes.insert(node, false);
                results.push((action.id().clone(), ChainOutcome::Skipped));
                continue;
            }
            let result = action.perform(progress, cancel);
            outcomes.insert(node, result.is_success());
            results.push((action.id().clone(), ChainOutcome::Executed(result)));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionBody, ActionEventType};
    use crate::params::{ParameterValue, Parameters};

    struct FlagBody {
        fail: bool,
    }

    impl ActionBody for FlagBody {
        fn type_name(&self) -> &'static str {
            "flag"
        }

        fn required_inputs(&self) -> &'static [&'static str] {
            &[]
        }

        fn execute(
            &self,
            _inputs: &Parameters,
            _progress: &ProgressSink,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<ActionResult> {
            if self.fail {
                Ok(ActionResult::error("flagged failure"))
            } else {
                Ok(ActionResult::success(
                    "ok",
                    Some(ParameterValue::Int(1)),
                ))
            }
        }
    }

    fn chain_of(specs: &[bool]) -> (ActionChain, Vec<ActionId>) {
        let mut chain = ActionChain::new();
        let mut ids = Vec::new();
        for (index, fail) in specs.iter().enumerate() {
            let action = WorkflowAction::new(
                format!("step-{index}"),
                Box::new(FlagBody { fail: *fail }),
            );
            ids.push(chain.add(action).expect("add action"));
        }
        (chain, ids)
    }

    #[test]
    fn successors_run_only_after_success() {
        let (mut chain, ids) = chain_of(&[false, false]);
        chain.link(&ids[0], &ids[1]).expect("link");
        let results = chain.run(&ProgressSink::null(), &CancellationToken::new());
        assert_eq!(results.len(), 2);
        for (_, outcome) in &results {
            assert!(matches!(
                outcome,
                ChainOutcome::Executed(result) if result.is_success()
            ));
        }
    }

    #[test]
    fn failures_skip_everything_downstream() {
        let (mut chain, ids) = chain_of(&[true, false, false]);
        chain.link(&ids[0], &ids[1]).expect("link");
        chain.link(&ids[1], &ids[2]).expect("link");
        let results = chain.run(&ProgressSink::null(), &CancellationToken::new());

        assert!(matches!(
            &results[0].1,
            ChainOutcome::Executed(result) if result.event_type == ActionEventType::Error
        ));
        assert!(matches!(results[1].1, ChainOutcome::Skipped));
        assert!(matches!(results[2].1, ChainOutcome::Skipped));
    }

    #[test]
    fn independent_branches_are_unaffected_by_a_failure() {
        let (chain, ids) = chain_of(&[true, false]);
        // No link: both roots run regardless of the other's outcome.
        let _ = &ids;
        let results = chain.run(&ProgressSink::null(), &CancellationToken::new());
        let executed = results
            .iter()
            .filter(|(_, outcome)| matches!(outcome, ChainOutcome::Executed(_)))
            .count();
        assert_eq!(executed, 2);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn cycles_are_rejected() {
        let (mut chain, ids) = chain_of(&[false, false]);
        chain.link(&ids[0], &ids[1]).expect("link");
        let err = chain.link(&ids[1], &ids[0]).expect_err("cycle");
        assert!(matches!(err, ChainError::CycleDetected { .. }));
        // The rejected edge must not linger: the chain still runs.
        let results = chain.run(&ProgressSink::null(), &CancellationToken::new());
        assert_eq!(results.len(), 2);
    }
}
