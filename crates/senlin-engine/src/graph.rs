//! Dependency graph over actions.
//!
//! An in-memory DAG of `depends_on` / `depended_by` edges, rebuildable from
//! the store. Tracks which dependencies of every node are still unresolved so
//! that a completion only touches its direct dependents.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use senlin_core::types::{Action, ActionId, ActionStatus};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Pending,
    Succeeded,
    /// FAILED or CANCELLED, directly or through an ancestor.
    Dead(ActionStatus),
}

#[derive(Debug, Clone)]
struct Node {
    depends_on: BTreeSet<ActionId>,
    depended_by: BTreeSet<ActionId>,
    unresolved: BTreeSet<ActionId>,
    resolution: Resolution,
}

impl Node {
    fn from_status(status: ActionStatus) -> Resolution {
        match status {
            ActionStatus::Succeeded => Resolution::Succeeded,
            ActionStatus::Failed | ActionStatus::Cancelled => Resolution::Dead(status),
            _ => Resolution::Pending,
        }
    }
}

/// Directed acyclic graph of action dependencies.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<ActionId, Node>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the graph from a snapshot of stored records.
    ///
    /// Dependencies missing from the snapshot count as resolved.
    pub fn rebuild(actions: &[Action]) -> Self {
        let status: HashMap<ActionId, ActionStatus> =
            actions.iter().map(|a| (a.id, a.status)).collect();

        let nodes = actions
            .iter()
            .map(|a| {
                let unresolved = a
                    .depends_on
                    .iter()
                    .filter(|dep| {
                        status
                            .get(*dep)
                            .is_some_and(|s| *s != ActionStatus::Succeeded)
                    })
                    .copied()
                    .collect();
                let node = Node {
                    depends_on: a.depends_on.clone(),
                    depended_by: a.depended_by.clone(),
                    unresolved,
                    resolution: Node::from_status(a.status),
                };
                (a.id, node)
            })
            .collect();

        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: ActionId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Add a stored record that this graph has not seen yet, e.g. one
    /// registered by another engine sharing the store.
    pub fn adopt(&mut self, action: &Action) {
        if self.contains(action.id) {
            return;
        }
        let unresolved = action
            .depends_on
            .iter()
            .filter(|dep| {
                self.nodes
                    .get(*dep)
                    .is_some_and(|n| n.resolution != Resolution::Succeeded)
            })
            .copied()
            .collect();
        for dep in &action.depends_on {
            if let Some(parent) = self.nodes.get_mut(dep) {
                parent.depended_by.insert(action.id);
            }
        }
        self.nodes.insert(
            action.id,
            Node {
                depends_on: action.depends_on.clone(),
                depended_by: action.depended_by.clone(),
                unresolved,
                resolution: Node::from_status(action.status),
            },
        );
    }

    /// Check that `batch` can be inserted: ids are new, every dependency is
    /// either in the batch or already in the graph and still able to
    /// succeed, and no cycle forms. The graph is not modified.
    pub fn check(&self, batch: &[Action]) -> Result<(), EngineError> {
        let mut edges: HashMap<ActionId, &BTreeSet<ActionId>> = HashMap::new();
        for action in batch {
            if self.contains(action.id) || edges.insert(action.id, &action.depends_on).is_some() {
                return Err(EngineError::Validation(format!(
                    "duplicate action id {}",
                    action.id
                )));
            }
        }

        for action in batch {
            for dep in &action.depends_on {
                if edges.contains_key(dep) {
                    continue;
                }
                match self.nodes.get(dep).map(|n| n.resolution) {
                    None => return Err(EngineError::UnknownDependency(*dep)),
                    Some(Resolution::Dead(status)) => {
                        return Err(EngineError::Validation(format!(
                            "dependency {} already ended {}",
                            dep, status
                        )))
                    }
                    Some(_) => {}
                }
            }
        }

        let mut roots: Vec<ActionId> = edges.keys().copied().collect();
        roots.sort();
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        for root in roots {
            if let Some(at) = self.find_cycle(root, &edges, &mut visiting, &mut done) {
                return Err(EngineError::CycleDetected(at));
            }
        }
        Ok(())
    }

    fn find_cycle(
        &self,
        id: ActionId,
        batch: &HashMap<ActionId, &BTreeSet<ActionId>>,
        visiting: &mut HashSet<ActionId>,
        done: &mut HashSet<ActionId>,
    ) -> Option<ActionId> {
        if done.contains(&id) {
            return None;
        }
        if !visiting.insert(id) {
            return Some(id);
        }
        let deps = batch
            .get(&id)
            .copied()
            .or_else(|| self.nodes.get(&id).map(|n| &n.depends_on));
        if let Some(deps) = deps {
            for dep in deps {
                if let Some(at) = self.find_cycle(*dep, batch, visiting, done) {
                    return Some(at);
                }
            }
        }
        visiting.remove(&id);
        done.insert(id);
        None
    }

    /// Insert a batch of new actions after validating it with [`check`].
    ///
    /// On error the graph is unchanged.
    ///
    /// [`check`]: DependencyGraph::check
    pub fn register(&mut self, batch: &[Action]) -> Result<(), EngineError> {
        self.check(batch)?;

        for action in batch {
            self.nodes.insert(
                action.id,
                Node {
                    depends_on: action.depends_on.clone(),
                    depended_by: BTreeSet::new(),
                    unresolved: BTreeSet::new(),
                    resolution: Resolution::Pending,
                },
            );
        }
        for action in batch {
            for dep in &action.depends_on {
                let dep_succeeded = match self.nodes.get_mut(dep) {
                    Some(parent) => {
                        parent.depended_by.insert(action.id);
                        parent.resolution == Resolution::Succeeded
                    }
                    None => true,
                };
                if !dep_succeeded {
                    if let Some(node) = self.nodes.get_mut(&action.id) {
                        node.unresolved.insert(*dep);
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether every dependency of `id` has succeeded.
    pub fn is_resolved(&self, id: ActionId) -> bool {
        self.nodes
            .get(&id)
            .is_some_and(|n| n.unresolved.is_empty())
    }

    /// Dependencies of `id` that have not succeeded yet.
    pub fn unresolved(&self, id: ActionId) -> Vec<ActionId> {
        self.nodes
            .get(&id)
            .map(|n| n.unresolved.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self, id: ActionId) -> Vec<ActionId> {
        self.nodes
            .get(&id)
            .map(|n| n.depended_by.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Record that `id` reached SUCCEEDED.
    ///
    /// Returns the direct dependents whose dependencies are now all
    /// satisfied. Repeated calls for the same action return nothing.
    pub fn on_completed(&mut self, id: ActionId) -> Vec<ActionId> {
        let dependents = match self.nodes.get_mut(&id) {
            Some(node) if node.resolution == Resolution::Pending => {
                node.resolution = Resolution::Succeeded;
                node.depended_by.clone()
            }
            _ => return Vec::new(),
        };

        let mut ready = Vec::new();
        for dependent in dependents {
            if let Some(node) = self.nodes.get_mut(&dependent) {
                if node.unresolved.remove(&id)
                    && node.unresolved.is_empty()
                    && node.resolution == Resolution::Pending
                {
                    ready.push(dependent);
                }
            }
        }
        ready
    }

    /// Record that `id` ended FAILED or CANCELLED.
    ///
    /// Returns every transitive dependent not already dead, in breadth-first
    /// order; each is marked dead so that it is returned exactly once across
    /// all calls.
    pub fn on_terminal_failure(&mut self, id: ActionId, status: ActionStatus) -> Vec<ActionId> {
        let start = match self.nodes.get_mut(&id) {
            Some(node) => {
                if node.resolution == Resolution::Pending {
                    node.resolution = Resolution::Dead(status);
                }
                node.depended_by.clone()
            }
            None => return Vec::new(),
        };

        let mut cascade = Vec::new();
        let mut queue: VecDeque<ActionId> = start.into_iter().collect();
        while let Some(next) = queue.pop_front() {
            let Some(node) = self.nodes.get_mut(&next) else {
                continue;
            };
            if node.resolution != Resolution::Pending {
                continue;
            }
            node.resolution = Resolution::Dead(ActionStatus::Cancelled);
            cascade.push(next);
            queue.extend(node.depended_by.iter().copied());
        }
        cascade
    }
}
