//! Dependency-ordered execution.
//!
//! Every node gets a one-shot completion signal. A node's task waits for
//! the signals of everything it depends on, then runs; if any of them
//! failed (or was itself skipped) the node is skipped and reported as
//! failed. Nodes without a path between them run concurrently.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::{ConfigError, DeployError, EngineError, Result};

use super::pool::join_task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Pending,
    Succeeded,
    Failed,
}

/// Sends the node's completion signal exactly once; a task that unwinds
/// without sending reports failure.
struct SignalGuard {
    tx: Option<watch::Sender<Signal>>,
}

impl SignalGuard {
    const fn new(tx: watch::Sender<Signal>) -> Self {
        Self { tx: Some(tx) }
    }

    fn send(mut self, signal: Signal) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(signal);
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Signal::Failed);
        }
    }
}

/// Outcome of one node.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The task ran and succeeded.
    Succeeded,
    /// The task ran and failed.
    Failed(DeployError),
    /// The task never ran because a dependency failed.
    Skipped {
        /// First failed dependency.
        dependency: String,
    },
}

/// Outcomes of one phase, by node.
#[derive(Debug, Default)]
pub struct PhaseReport {
    /// Outcome per node name.
    pub outcomes: BTreeMap<String, TaskOutcome>,
}

impl PhaseReport {
    /// Nodes that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, TaskOutcome::Succeeded))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Nodes that were skipped.
    #[must_use]
    pub fn skipped(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, TaskOutcome::Skipped { .. }))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Turns the report into the phase result: the single error when one
    /// node failed, an aggregate naming every failed or skipped node
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns the phase error if any node did not succeed.
    pub fn into_result(self) -> Result<()> {
        let failures: Vec<(String, DeployError)> = self
            .outcomes
            .into_iter()
            .filter_map(|(name, outcome)| match outcome {
                TaskOutcome::Succeeded => None,
                TaskOutcome::Failed(err) => Some((name, err)),
                TaskOutcome::Skipped { dependency } => Some((
                    name.clone(),
                    EngineError::DependencyFailed { name, dependency }.into(),
                )),
            })
            .collect();
        DeployError::from_failures(failures).map_or(Ok(()), Err)
    }
}

/// Nodes and the nodes each one waits for.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    waits_for: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node that starts only after every node in `waits_for` has
    /// finished. Edges to nodes never added are ignored.
    pub fn add_node(&mut self, name: impl Into<String>, waits_for: BTreeSet<String>) {
        self.waits_for.insert(name.into(), waits_for);
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waits_for.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waits_for.is_empty()
    }

    fn edges<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a String> + use<'a> {
        self.waits_for
            .get(name)
            .into_iter()
            .flatten()
            .filter(|dep| self.waits_for.contains_key(*dep))
    }

    /// Finds a cycle, returned as the path around it (first node repeated
    /// at the end).
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a DependencyGraph,
            node: &'a String,
            marks: &mut BTreeMap<&'a String, Mark>,
            path: &mut Vec<&'a String>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|n| *n == node).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|n| (*n).clone()).collect();
                    cycle.push(node.clone());
                    return Some(cycle);
                }
                None => {}
            }

            marks.insert(node, Mark::Visiting);
            path.push(node);
            for dep in graph.edges(node) {
                if let Some(cycle) = visit(graph, dep, marks, path) {
                    return Some(cycle);
                }
            }
            path.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        let mut path = Vec::new();
        self.waits_for
            .keys()
            .find_map(|node| visit(self, node, &mut marks, &mut path))
    }

    /// Fails if the graph has a cycle.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::CircularDependency`] naming the cycle.
    pub fn ensure_acyclic(&self) -> Result<()> {
        match self.find_cycle() {
            Some(cycle) => Err(ConfigError::CircularDependency {
                cycle: cycle.join(" -> "),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Runs `f` on every node, each on its own task, in dependency order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::CircularDependency`] before running anything
    /// if the graph has a cycle. Task failures are reported in the
    /// [`PhaseReport`], not as an error.
    pub async fn run<F, Fut>(&self, f: F) -> Result<PhaseReport>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.ensure_acyclic()?;

        let mut senders = BTreeMap::new();
        let mut receivers = BTreeMap::new();
        for name in self.waits_for.keys() {
            let (tx, rx) = watch::channel(Signal::Pending);
            senders.insert(name.clone(), tx);
            receivers.insert(name.clone(), rx);
        }

        let f = Arc::new(f);
        let mut handles = Vec::with_capacity(senders.len());
        for (name, tx) in senders {
            let deps: Vec<(String, watch::Receiver<Signal>)> = self
                .edges(&name)
                .filter_map(|dep| receivers.get(dep).map(|rx| (dep.clone(), rx.clone())))
                .collect();
            let f = Arc::clone(&f);
            let task_name = name.clone();
            let handle = tokio::spawn(async move {
                let guard = SignalGuard::new(tx);
                let outcome = run_node(task_name, deps, f.as_ref()).await;
                guard.send(match outcome {
                    TaskOutcome::Succeeded => Signal::Succeeded,
                    _ => Signal::Failed,
                });
                Ok(outcome)
            });
            handles.push((name, handle));
        }

        let mut report = PhaseReport::default();
        for (name, handle) in handles {
            let outcome = join_task(&name, handle)
                .await
                .unwrap_or_else(TaskOutcome::Failed);
            report.outcomes.insert(name, outcome);
        }
        Ok(report)
    }
}

async fn run_node<F, Fut>(
    name: String,
    deps: Vec<(String, watch::Receiver<Signal>)>,
    f: &F,
) -> TaskOutcome
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut failed_dependency = None;
    for (dep, mut rx) in deps {
        let signal = match rx.wait_for(|s| *s != Signal::Pending).await {
            Ok(signal) => *signal,
            Err(_) => Signal::Failed,
        };
        if signal == Signal::Failed && failed_dependency.is_none() {
            failed_dependency = Some(dep);
        }
    }

    if let Some(dependency) = failed_dependency {
        warn!(resource = %name, "skipped because '{dependency}' failed");
        return TaskOutcome::Skipped { dependency };
    }

    debug!(resource = %name, "dependencies done; starting");
    match f(name.clone()).await {
        Ok(()) => TaskOutcome::Succeeded,
        Err(err) => {
            error!(resource = %name, "{err}");
            TaskOutcome::Failed(err)
        }
    }
}
