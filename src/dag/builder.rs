//! DAG builder for constructing the stage graph.
//!
//! Stages live in an arena indexed by position; edges are adjacency lists of
//! indices, so the graph holds no pointers between stages.

use std::collections::HashMap;

use crate::dag::stage::StageDef;
use crate::errors::PlanError;

/// Index into the stage arena.
pub type StageIndex = usize;

/// A directed acyclic graph of stages.
#[derive(Debug, Clone)]
pub struct StageGraph {
    /// Stages in declaration order
    stages: Vec<StageDef>,
    /// Map from stage id to index
    index_map: HashMap<String, StageIndex>,
    /// index -> stages that depend on it
    forward_edges: Vec<Vec<StageIndex>>,
    /// index -> stages it depends on
    reverse_edges: Vec<Vec<StageIndex>>,
}

impl StageGraph {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, index: StageIndex) -> Option<&StageDef> {
        self.stages.get(index)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&StageDef> {
        self.index_map.get(id).and_then(|&i| self.stages.get(i))
    }

    pub fn index_of(&self, id: &str) -> Option<StageIndex> {
        self.index_map.get(id).copied()
    }

    pub fn stages(&self) -> &[StageDef] {
        &self.stages
    }

    /// Stages that depend on the given stage.
    pub fn dependents(&self, index: StageIndex) -> &[StageIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Stages the given stage depends on.
    pub fn dependencies(&self, index: StageIndex) -> &[StageIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Stages with no dependencies.
    pub fn root_stages(&self) -> Vec<StageIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Stages belonging to one scope, in declaration order.
    pub fn scope_stages<'a>(&'a self, scope: &'a str) -> impl Iterator<Item = &'a StageDef> + 'a {
        self.stages.iter().filter(move |s| s.scope == scope)
    }

    /// Whether every dependency of `index` satisfies `done`.
    pub fn dependencies_satisfied(
        &self,
        index: StageIndex,
        done: impl Fn(StageIndex) -> bool,
    ) -> bool {
        self.dependencies(index).iter().all(|&dep| done(dep))
    }
}

/// Builder for constructing stage graphs.
pub struct DagBuilder {
    stages: Vec<StageDef>,
}

impl DagBuilder {
    pub fn new(stages: Vec<StageDef>) -> Self {
        Self { stages }
    }

    /// Build the stage graph.
    ///
    /// Rejects duplicate ids, unknown prerequisites and cycles.
    pub fn build(self) -> Result<StageGraph, PlanError> {
        let mut index_map = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if index_map.contains_key(&stage.id) {
                return Err(PlanError::InvalidGraph(format!(
                    "Duplicate stage id: {}",
                    stage.id
                )));
            }
            index_map.insert(stage.id.clone(), i);
        }

        let mut forward_edges: Vec<Vec<StageIndex>> = vec![Vec::new(); self.stages.len()];
        let mut reverse_edges: Vec<Vec<StageIndex>> = vec![Vec::new(); self.stages.len()];

        for (to_idx, stage) in self.stages.iter().enumerate() {
            for dep in &stage.prerequisites {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    PlanError::InvalidGraph(format!(
                        "Unknown dependency '{}' in stage '{}': no stage with that id exists",
                        dep, stage.id
                    ))
                })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = StageGraph {
            stages: self.stages,
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Kahn's algorithm; any node left with positive in-degree is on a cycle.
    fn validate_no_cycles(graph: &StageGraph) -> Result<(), PlanError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<StageIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let cycle_stages: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.get(i).map(|s| s.id.as_str()))
                .collect();

            return Err(PlanError::InvalidGraph(format!(
                "Cycle detected in stage dependencies. Involved stages: {:?}",
                cycle_stages
            )));
        }

        Ok(())
    }
}
