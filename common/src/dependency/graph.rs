// Dependency graph validation
//
// Edges point from a job to the jobs it depends on. Validation runs only when a
// dependency list is written; nothing re-checks the graph in the background.

use crate::errors::ValidationError;
use crate::models::{Job, JobId, JobStatus};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Adjacency view over the registry's jobs
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: HashMap<JobId, Vec<JobId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let edges = jobs
            .into_iter()
            .map(|job| (job.id, job.dependencies.clone()))
            .collect();
        Self { edges }
    }

    /// Insert or replace the outgoing edges of `id`
    pub fn set_dependencies(&mut self, id: JobId, dependencies: Vec<JobId>) {
        self.edges.insert(id, dependencies);
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.edges.contains_key(id)
    }

    /// Direct dependencies of `id`; unknown ids have none
    pub fn dependencies_of(&self, id: &JobId) -> &[JobId] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Jobs that list `id` as a dependency
    pub fn dependents_of(&self, id: &JobId) -> Vec<JobId> {
        let mut dependents: Vec<JobId> = self
            .edges
            .iter()
            .filter(|(_, deps)| deps.contains(id))
            .map(|(job, _)| *job)
            .collect();
        dependents.sort();
        dependents
    }

    /// Validate a proposed dependency list for `candidate`.
    ///
    /// Missing ids are reported before any traversal. `candidate` itself counts
    /// as known even when it is not yet part of the graph (create path), so a
    /// self-reference is reported as the cycle `[candidate, candidate]`.
    pub fn validate(&self, candidate: JobId, proposed: &[JobId]) -> Result<(), ValidationError> {
        if let Some(missing) = proposed
            .iter()
            .find(|id| **id != candidate && !self.contains(id))
        {
            return Err(ValidationError::UnknownDependency {
                job_id: candidate,
                dependency_id: *missing,
            });
        }

        let mut view = self.clone();
        view.set_dependencies(candidate, proposed.to_vec());

        let mut proven = HashSet::new();
        match view.find_cycle_from(candidate, &mut proven) {
            Some(path) => Err(ValidationError::CyclicDependency { path }),
            None => Ok(()),
        }
    }

    /// Depth-first search from `start` with an explicit stack.
    ///
    /// `proven` holds nodes already shown to reach no cycle and is extended as
    /// the walk finishes nodes, so it can be shared across several starts. The
    /// returned path runs from the repeated node back to itself.
    pub fn find_cycle_from(
        &self,
        start: JobId,
        proven: &mut HashSet<JobId>,
    ) -> Option<Vec<JobId>> {
        if proven.contains(&start) {
            return None;
        }

        let mut path = vec![start];
        let mut on_path: HashSet<JobId> = HashSet::from([start]);
        let mut stack: Vec<(JobId, usize)> = vec![(start, 0)];

        while let Some(frame) = stack.last_mut() {
            let (node, next_child) = *frame;
            frame.1 += 1;

            match self.dependencies_of(&node).get(next_child).copied() {
                Some(child) => {
                    if on_path.contains(&child) {
                        let from = path.iter().position(|id| *id == child).unwrap_or(0);
                        let mut cycle = path[from..].to_vec();
                        cycle.push(child);
                        return Some(cycle);
                    }
                    if proven.contains(&child) {
                        continue;
                    }
                    path.push(child);
                    on_path.insert(child);
                    stack.push((child, 0));
                }
                None => {
                    stack.pop();
                    path.pop();
                    on_path.remove(&node);
                    proven.insert(node);
                }
            }
        }

        None
    }

    /// First cycle found anywhere in the graph, scanning ids in sorted order
    pub fn find_any_cycle(&self) -> Option<Vec<JobId>> {
        let mut ids: Vec<JobId> = self.edges.keys().copied().collect();
        ids.sort();

        let mut proven = HashSet::new();
        ids.into_iter()
            .find_map(|id| self.find_cycle_from(id, &mut proven))
    }

    /// Upstream tree rooted at `root`, for display.
    ///
    /// `describe` supplies name and status for known jobs; ids it cannot
    /// resolve are stale references and are marked missing.
    pub fn tree<F>(&self, root: JobId, describe: F) -> DependencyNode
    where
        F: Fn(&JobId) -> Option<(String, JobStatus)>,
    {
        let mut on_path = HashSet::new();
        self.build_node(root, &describe, &mut on_path)
    }

    fn build_node<F>(&self, id: JobId, describe: &F, on_path: &mut HashSet<JobId>) -> DependencyNode
    where
        F: Fn(&JobId) -> Option<(String, JobStatus)>,
    {
        let described = describe(&id);
        let mut node = DependencyNode {
            id,
            name: described.as_ref().map(|(name, _)| name.clone()),
            status: described.map(|(_, status)| status),
            cycle: false,
            children: Vec::new(),
        };

        if !on_path.insert(id) {
            node.cycle = true;
            return node;
        }
        for dep in self.dependencies_of(&id) {
            node.children.push(self.build_node(*dep, describe, on_path));
        }
        on_path.remove(&id);
        node
    }
}

/// One node of a dependency tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyNode {
    pub id: JobId,
    /// `None` when the id no longer resolves to a job
    pub name: Option<String>,
    pub status: Option<JobStatus>,
    /// The node already appears higher up on this branch
    pub cycle: bool,
    pub children: Vec<DependencyNode>,
}

impl DependencyNode {
    pub fn is_missing(&self) -> bool {
        self.name.is_none()
    }

    /// Indented text rendering, one node per line
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(0, &mut out);
        out
    }

    fn render_into(&self, depth: usize, out: &mut String) {
        let label = match (&self.name, self.status) {
            (Some(name), Some(status)) => format!("{name} ({}) [{status}]", self.id),
            _ => format!("{} [missing]", self.id),
        };
        out.push_str(&"  ".repeat(depth));
        out.push_str(&label);
        if self.cycle {
            out.push_str(" (cycle)");
        }
        out.push('\n');
        for child in &self.children {
            child.render_into(depth + 1, out);
        }
    }
}
