// benchline/src/pipeline/graph.rs

//! The stage graph of one pipeline: edges, entry/exit stages and a
//! deterministic topological order.

use crate::config::StageSpec;
use crate::core::StageId;
use crate::error::{BenchError, BenchResult};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, Default)]
struct Node {
  successors: Vec<StageId>,
  predecessors: Vec<StageId>,
}

/// Validated, acyclic stage graph. Construction is pure; nothing here runs stages.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
  nodes: BTreeMap<StageId, Node>,
  order: Vec<StageId>,
  entries: Vec<StageId>,
  exits: Vec<StageId>,
}

impl PipelineGraph {
  /// Builds the graph from stage specs and the pipeline-level entry/exit lists.
  ///
  /// An edge `a -> b` exists when `a.outputs` lists `b` or `b.inputs` lists `a`.
  /// Empty `entries`/`exits` are derived as the stages without predecessors /
  /// successors. Every stage must be reachable from an entry stage.
  pub fn build(stages: &[StageSpec], entries: &[StageId], exits: &[StageId]) -> BenchResult<Self> {
    if stages.is_empty() {
      return Err(BenchError::config("stages", "pipeline defines no stages"));
    }

    let mut nodes: BTreeMap<StageId, Node> = BTreeMap::new();
    for (idx, stage) in stages.iter().enumerate() {
      if nodes.insert(stage.id, Node::default()).is_some() {
        return Err(BenchError::config(
          format!("stages[{}].id", idx),
          format!("duplicate stage id {}", stage.id),
        ));
      }
    }

    let mut edges: BTreeSet<(StageId, StageId)> = BTreeSet::new();
    for stage in stages {
      for &to in &stage.outputs {
        ensure_known(&nodes, to, || format!("stage {} outputs", stage.id))?;
        edges.insert((stage.id, to));
      }
      for &from in &stage.inputs {
        ensure_known(&nodes, from, || format!("stage {} inputs", stage.id))?;
        edges.insert((from, stage.id));
      }
    }
    for &(from, to) in &edges {
      if from == to {
        return Err(BenchError::Cycle { stages: vec![from] });
      }
      if let Some(node) = nodes.get_mut(&from) {
        node.successors.push(to);
      }
      if let Some(node) = nodes.get_mut(&to) {
        node.predecessors.push(from);
      }
    }

    let order = topological_order(&nodes)?;

    let entries = resolve_endpoints(&nodes, entries, "inputs", |n| &n.predecessors, "predecessors")?;
    let exits = resolve_endpoints(&nodes, exits, "outputs", |n| &n.successors, "successors")?;

    // A stage no entry can reach would never run for any query.
    let mut reached: BTreeSet<StageId> = BTreeSet::new();
    let mut queue: VecDeque<StageId> = entries.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
      if reached.insert(id) {
        if let Some(node) = nodes.get(&id) {
          queue.extend(node.successors.iter().copied());
        }
      }
    }
    if let Some(orphan) = nodes.keys().find(|id| !reached.contains(id)) {
      return Err(BenchError::config(
        "stages",
        format!("stage {} is not reachable from the pipeline inputs {:?}", orphan, entries),
      ));
    }

    Ok(Self {
      nodes,
      order,
      entries,
      exits,
    })
  }

  pub fn entry_stages(&self) -> &[StageId] {
    &self.entries
  }

  pub fn exit_stages(&self) -> &[StageId] {
    &self.exits
  }

  /// Topological order, ties broken by ascending stage id.
  pub fn order(&self) -> &[StageId] {
    &self.order
  }

  pub fn successors(&self, id: StageId) -> &[StageId] {
    self.nodes.get(&id).map(|n| n.successors.as_slice()).unwrap_or_default()
  }

  pub fn predecessors(&self, id: StageId) -> &[StageId] {
    self.nodes.get(&id).map(|n| n.predecessors.as_slice()).unwrap_or_default()
  }

  pub fn contains(&self, id: StageId) -> bool {
    self.nodes.contains_key(&id)
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }
}

fn ensure_known(
  nodes: &BTreeMap<StageId, Node>,
  id: StageId,
  referenced_by: impl FnOnce() -> String,
) -> BenchResult<()> {
  if nodes.contains_key(&id) {
    Ok(())
  } else {
    Err(BenchError::UnknownId {
      referenced_by: referenced_by(),
      id,
    })
  }
}

/// Kahn's algorithm over an ordered ready set. Whatever is left unvisited sits
/// on (or behind) a cycle and is reported.
fn topological_order(nodes: &BTreeMap<StageId, Node>) -> BenchResult<Vec<StageId>> {
  let mut in_degree: BTreeMap<StageId, usize> = nodes.iter().map(|(&id, n)| (id, n.predecessors.len())).collect();
  let mut ready: BTreeSet<StageId> = in_degree.iter().filter(|&(_, &d)| d == 0).map(|(&id, _)| id).collect();

  let mut order = Vec::with_capacity(nodes.len());
  while let Some(id) = ready.pop_first() {
    order.push(id);
    for succ in &nodes[&id].successors {
      if let Some(d) = in_degree.get_mut(succ) {
        *d -= 1;
        if *d == 0 {
          ready.insert(*succ);
        }
      }
    }
  }

  if order.len() == nodes.len() {
    Ok(order)
  } else {
    let stages = in_degree.into_iter().filter(|(_, d)| *d > 0).map(|(id, _)| id).collect();
    Err(BenchError::Cycle { stages })
  }
}

fn resolve_endpoints(
  nodes: &BTreeMap<StageId, Node>,
  declared: &[StageId],
  field: &str,
  neighbours: impl Fn(&Node) -> &Vec<StageId>,
  neighbour_kind: &str,
) -> BenchResult<Vec<StageId>> {
  if declared.is_empty() {
    return Ok(
      nodes
        .iter()
        .filter(|&(_, n)| neighbours(n).is_empty())
        .map(|(&id, _)| id)
        .collect(),
    );
  }
  let mut seen = BTreeSet::new();
  let mut resolved = Vec::with_capacity(declared.len());
  for &id in declared {
    let node = nodes.get(&id).ok_or_else(|| BenchError::UnknownId {
      referenced_by: format!("pipeline {}", field),
      id,
    })?;
    if !neighbours(node).is_empty() {
      return Err(BenchError::config(
        field,
        format!("stage {} has {} {:?} inside the pipeline", id, neighbour_kind, neighbours(node)),
      ));
    }
    if seen.insert(id) {
      resolved.push(id);
    }
  }
  Ok(resolved)
}
