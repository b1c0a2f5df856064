//! Dependency graph for step execution ordering.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::step::Step;
use crate::core::errors::{FlowError, Result};

/// Validated dependency graph with a level ordering.
///
/// Node index `i` of the inner graph is the `i`-th declared step; edges run
/// from a dependency to its dependent.
#[derive(Clone)]
pub struct StepGraph {
    steps: Vec<Step>,
    index: HashMap<String, NodeIndex>,
    graph: DiGraph<String, ()>,
    levels: Vec<Vec<String>>,
    level_of: HashMap<String, usize>,
}

impl StepGraph {
    /// Validates the steps and computes their levels.
    pub fn build(steps: Vec<Step>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::with_capacity(steps.len());
        let mut normalized = Vec::with_capacity(steps.len());

        for mut step in steps {
            if step.id.trim().is_empty() {
                return Err(FlowError::invalid_step("step ids must not be empty"));
            }
            if index.contains_key(&step.id) {
                return Err(FlowError::duplicate_step(step.id));
            }
            // Dependencies are an ordered set
            let mut seen = HashSet::new();
            step.depends_on.retain(|dep| seen.insert(dep.clone()));

            let idx = graph.add_node(step.id.clone());
            index.insert(step.id.clone(), idx);
            normalized.push(step);
        }

        for step in &normalized {
            for dep in &step.depends_on {
                if *dep == step.id {
                    return Err(FlowError::self_dependency(&step.id));
                }
                let Some(&from) = index.get(dep) else {
                    return Err(FlowError::unknown_dependency(&step.id, dep));
                };
                graph.add_edge(from, index[&step.id], ());
            }
        }

        let order = match toposort(&graph, None) {
            Ok(order) => order,
            Err(cycle) => {
                let path = find_cycle(&normalized, &index)
                    .unwrap_or_else(|| vec![graph[cycle.node_id()].clone()]);
                return Err(FlowError::cycle(path));
            }
        };

        let (levels, level_of) = compute_levels(&graph, &order);
        debug!(
            steps = normalized.len(),
            levels = levels.len(),
            "Built step graph"
        );

        Ok(Self {
            steps: normalized,
            index,
            graph,
            levels,
            level_of,
        })
    }

    /// Steps grouped by level; within a level, in declaration order.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn level_of(&self, step_id: &str) -> Option<usize> {
        self.level_of.get(step_id).copied()
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.index.get(step_id).map(|idx| &self.steps[idx.index()])
    }

    /// All steps in declaration order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.index.contains_key(step_id)
    }

    pub fn dependencies_of(&self, step_id: &str) -> Option<&[String]> {
        self.step(step_id).map(|s| s.depends_on.as_slice())
    }

    /// Steps that depend directly on `step_id`, in declaration order.
    pub fn dependents_of(&self, step_id: &str) -> Vec<String> {
        let Some(&idx) = self.index.get(step_id) else {
            return Vec::new();
        };
        let mut dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        dependents.sort();
        dependents.dedup();
        dependents
            .into_iter()
            .map(|i| self.graph[i].clone())
            .collect()
    }

    /// Every dependency edge as `(dependency, dependent)`.
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges: Vec<(NodeIndex, NodeIndex)> = self
            .graph
            .edge_references()
            .map(|e| (e.source(), e.target()))
            .collect();
        edges.sort_by_key(|(s, t)| (t.index(), s.index()));
        edges
            .into_iter()
            .map(|(s, t)| (self.graph[s].clone(), self.graph[t].clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Graphviz rendering, one rank per level.
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph Steps {\n");
        dot.push_str("  graph [rankdir=LR];\n");
        dot.push_str("  node [shape=box, style=rounded];\n\n");

        for (level, ids) in self.levels.iter().enumerate() {
            dot.push_str(&format!("  subgraph level_{} {{\n    rank=same;\n", level));
            for id in ids {
                dot.push_str(&format!("    \"{}\";\n", escape_dot(id)));
            }
            dot.push_str("  }\n");
        }
        dot.push('\n');
        for (from, to) in self.edges() {
            dot.push_str(&format!(
                "  \"{}\" -> \"{}\";\n",
                escape_dot(&from),
                escape_dot(&to)
            ));
        }
        dot.push_str("}\n");
        dot
    }
}

fn escape_dot(id: &str) -> String {
    id.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Depth-first search with a three-colour marker over the dependency edges,
/// driven by an explicit frame stack. Returns the cycle with its first step
/// repeated at the end.
fn find_cycle(steps: &[Step], index: &HashMap<String, NodeIndex>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color = vec![Color::White; steps.len()];
    // (step, next dependency to look at); the frames are the current path
    let mut frames: Vec<(usize, usize)> = Vec::new();

    for root in 0..steps.len() {
        if color[root] != Color::White {
            continue;
        }
        color[root] = Color::Gray;
        frames.push((root, 0));

        while let Some(&(node, cursor)) = frames.last() {
            let Some(dep) = steps[node].depends_on.get(cursor) else {
                frames.pop();
                color[node] = Color::Black;
                continue;
            };
            if let Some(top) = frames.last_mut() {
                top.1 += 1;
            }
            let next = index.get(dep)?.index();
            match color[next] {
                Color::Gray => {
                    let start = frames.iter().position(|&(n, _)| n == next).unwrap_or(0);
                    let mut path: Vec<String> = frames[start..]
                        .iter()
                        .map(|&(n, _)| steps[n].id.clone())
                        .collect();
                    path.push(steps[next].id.clone());
                    return Some(path);
                }
                Color::White => {
                    color[next] = Color::Gray;
                    frames.push((next, 0));
                }
                Color::Black => {}
            }
        }
    }
    None
}

/// Level of a step is one more than the deepest of its dependencies.
///
/// Depths are filled in topological order; levels are then bucketed by node
/// index, which is declaration order.
fn compute_levels(
    graph: &DiGraph<String, ()>,
    order: &[NodeIndex],
) -> (Vec<Vec<String>>, HashMap<String, usize>) {
    let mut depth = vec![0usize; graph.node_count()];
    for &node in order {
        depth[node.index()] = graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|dep| depth[dep.index()] + 1)
            .max()
            .unwrap_or(0);
    }

    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut level_of = HashMap::with_capacity(graph.node_count());
    for node in graph.node_indices() {
        let level = depth[node.index()];
        while levels.len() <= level {
            levels.push(Vec::new());
        }
        levels[level].push(graph[node].clone());
        level_of.insert(graph[node].clone(), level);
    }

    (levels, level_of)
}
