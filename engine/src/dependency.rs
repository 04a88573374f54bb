//! Entity-type ordering.
//!
//! The [`DependencyResolver`] turns a static [`DependencyGraph`] into a
//! deterministic sync order. Prerequisite types always come first; ties
//! between independent types are broken by ascending rank.

use crate::local::LocalStore;
use crate::{error::SyncResult, EntityType, SyncError};
use std::collections::{BTreeMap, BTreeSet};

/// One entity type in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    pub entity_type: EntityType,
    /// Tie-break rank (lower syncs first)
    pub rank: u32,
    /// Types that must be synced before this one
    pub dependencies: BTreeSet<EntityType>,
}

/// Static `entity_type -> {dependencies, rank}` graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: BTreeMap<EntityType, DependencyNode>,
}

impl DependencyGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// The graph declared by the entity dispatch table.
    pub fn standard() -> Self {
        EntityType::ALL.into_iter().fold(Self::new(), |graph, t| {
            let handler = t.handler();
            let deps: Vec<EntityType> = handler.references.iter().map(|r| r.target).collect();
            graph.with_node(t, handler.rank, &deps)
        })
    }

    /// Builder-style insert.
    pub fn with_node(mut self, entity_type: EntityType, rank: u32, dependencies: &[EntityType]) -> Self {
        self.insert(entity_type, rank, dependencies);
        self
    }

    /// Add or replace a node.
    pub fn insert(&mut self, entity_type: EntityType, rank: u32, dependencies: &[EntityType]) {
        self.nodes.insert(
            entity_type,
            DependencyNode {
                entity_type,
                rank,
                dependencies: dependencies.iter().copied().collect(),
            },
        );
    }

    pub fn get(&self, entity_type: EntityType) -> Option<&DependencyNode> {
        self.nodes.get(&entity_type)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Resolved, immutable sync order over a [`DependencyGraph`].
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    graph: DependencyGraph,
    order: Vec<EntityType>,
    prerequisites: BTreeMap<EntityType, BTreeSet<EntityType>>,
}

impl DependencyResolver {
    /// Validate `graph` and compute its order.
    ///
    /// Fails with [`SyncError::CyclicDependency`] if the graph is not a DAG and
    /// with [`SyncError::InvalidConfiguration`] if a dependency is undeclared.
    pub fn new(graph: DependencyGraph) -> SyncResult<Self> {
        for node in graph.nodes() {
            for dep in &node.dependencies {
                if *dep == node.entity_type {
                    return Err(SyncError::CyclicDependency(format!("{dep} depends on itself")));
                }
                if graph.get(*dep).is_none() {
                    return Err(SyncError::InvalidConfiguration(format!(
                        "{} depends on undeclared type {dep}",
                        node.entity_type
                    )));
                }
            }
        }

        let order = topological_order(&graph)?;

        let mut prerequisites: BTreeMap<EntityType, BTreeSet<EntityType>> = BTreeMap::new();
        // Walking in order means every dependency's closure is already known.
        for t in &order {
            let mut closure = BTreeSet::new();
            if let Some(node) = graph.get(*t) {
                for dep in &node.dependencies {
                    closure.insert(*dep);
                    if let Some(inherited) = prerequisites.get(dep) {
                        closure.extend(inherited.iter().copied());
                    }
                }
            }
            prerequisites.insert(*t, closure);
        }

        Ok(Self {
            graph,
            order,
            prerequisites,
        })
    }

    /// Resolver over [`DependencyGraph::standard`].
    pub fn standard() -> SyncResult<Self> {
        Self::new(DependencyGraph::standard())
    }

    /// Deterministic sync order, prerequisites first.
    pub fn resolve_order(&self) -> Vec<EntityType> {
        self.order.clone()
    }

    /// Position of `entity_type` in the sync order.
    pub fn position(&self, entity_type: EntityType) -> Option<usize> {
        self.order.iter().position(|t| *t == entity_type)
    }

    /// Direct dependencies.
    pub fn dependencies_of(&self, entity_type: EntityType) -> BTreeSet<EntityType> {
        self.graph
            .get(entity_type)
            .map(|n| n.dependencies.clone())
            .unwrap_or_default()
    }

    /// Transitive dependencies.
    pub fn prerequisites_of(&self, entity_type: EntityType) -> BTreeSet<EntityType> {
        self.prerequisites
            .get(&entity_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Fails with [`SyncError::DependencyNotMet`] while any prerequisite type
    /// still has local entities waiting for their first upload.
    ///
    /// Entities parked in `Error` or `Conflict` do not hold the type back;
    /// operations that reference one are deferred one by one instead.
    pub fn check_ready(&self, entity_type: EntityType, local: &dyn LocalStore) -> SyncResult<()> {
        let mut missing = Vec::new();
        for prerequisite in self.prerequisites_of(entity_type) {
            let count = local.count_missing_remote_id(prerequisite)?;
            if count > 0 {
                missing.push(format!("{count} {prerequisite} without remote id"));
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SyncError::DependencyNotMet {
                entity_type,
                detail: missing.join(", "),
            })
        }
    }

    /// Boolean form of [`check_ready`](Self::check_ready).
    pub fn is_ready(&self, entity_type: EntityType, local: &dyn LocalStore) -> bool {
        self.check_ready(entity_type, local).is_ok()
    }
}

/// Kahn's algorithm; the ready set is ordered by `(rank, type)`.
fn topological_order(graph: &DependencyGraph) -> SyncResult<Vec<EntityType>> {
    let mut in_degree: BTreeMap<EntityType, usize> = graph
        .nodes()
        .map(|n| (n.entity_type, n.dependencies.len()))
        .collect();

    let mut ready: BTreeSet<(u32, EntityType)> = graph
        .nodes()
        .filter(|n| n.dependencies.is_empty())
        .map(|n| (n.rank, n.entity_type))
        .collect();

    let mut order = Vec::with_capacity(graph.len());
    while let Some(next) = ready.pop_first() {
        let (_, current) = next;
        order.push(current);

        for node in graph.nodes().filter(|n| n.dependencies.contains(&current)) {
            if let Some(degree) = in_degree.get_mut(&node.entity_type) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert((node.rank, node.entity_type));
                }
            }
        }
    }

    if order.len() != graph.len() {
        let stuck: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(t, _)| t.to_string())
            .collect();
        return Err(SyncError::CyclicDependency(stuck.join(", ")));
    }

    Ok(order)
}
