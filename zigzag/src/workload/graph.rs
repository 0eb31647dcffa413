use crate::workload::{LayerNode, WorkloadError};
use std::collections::VecDeque;
use std::sync::Arc;

/// A node of the workload graph. Dummy nodes keep the graph connected (e.g. reshapes from a model
/// importer) but carry no computation.
#[derive(Debug, Clone)]
pub enum WorkloadNode {
    Layer(Arc<LayerNode>),
    Dummy {
        id: usize,
        name: String,
        sources: Vec<usize>,
    },
}

impl WorkloadNode {
    pub fn id(&self) -> usize {
        match self {
            WorkloadNode::Layer(l) => l.id,
            WorkloadNode::Dummy { id, .. } => *id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            WorkloadNode::Layer(l) => &l.name,
            WorkloadNode::Dummy { name, .. } => name,
        }
    }

    pub fn layer(&self) -> Option<&Arc<LayerNode>> {
        match self {
            WorkloadNode::Layer(l) => Some(l),
            WorkloadNode::Dummy { .. } => None,
        }
    }

    fn sources(&self) -> Vec<usize> {
        match self {
            WorkloadNode::Layer(l) => l
                .operand_source
                .values()
                .flatten()
                .copied()
                .collect(),
            WorkloadNode::Dummy { sources, .. } => sources.clone(),
        }
    }
}

/// A DAG of layers stored as an arena with adjacency lists; edges run from producer to consumer.
#[derive(Debug, Clone, Default)]
pub struct Workload {
    nodes: Vec<WorkloadNode>,
    successors: Vec<Vec<usize>>,
    predecessor_counts: Vec<usize>,
}

impl Workload {
    pub fn new(nodes: Vec<WorkloadNode>) -> Result<Self, WorkloadError> {
        let mut successors = vec![Vec::new(); nodes.len()];
        let mut predecessor_counts = vec![0; nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].iter().any(|n| n.id() == node.id()) {
                return Err(WorkloadError::DuplicateLayerId(node.id()));
            }
        }
        for (consumer, node) in nodes.iter().enumerate() {
            for source_id in node.sources() {
                let Some(producer) = nodes.iter().position(|n| n.id() == source_id) else {
                    return Err(WorkloadError::UnknownSource {
                        layer: node.name().to_owned(),
                        source_id,
                    });
                };
                successors[producer].push(consumer);
                predecessor_counts[consumer] += 1;
            }
        }
        let workload = Workload {
            nodes,
            successors,
            predecessor_counts,
        };
        workload.topological_order()?;
        Ok(workload)
    }

    /// A workload of unconnected layers, in the given order.
    pub fn from_layers(layers: impl IntoIterator<Item = LayerNode>) -> Result<Self, WorkloadError> {
        Workload::new(
            layers
                .into_iter()
                .map(|l| WorkloadNode::Layer(Arc::new(l)))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node indices in topological order. Among ready nodes, the one inserted first goes first.
    fn topological_order(&self) -> Result<Vec<usize>, WorkloadError> {
        let mut remaining = self.predecessor_counts.clone();
        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| remaining[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            let mut newly_ready = Vec::new();
            for &s in &self.successors[i] {
                remaining[s] -= 1;
                if remaining[s] == 0 {
                    newly_ready.push(s);
                }
            }
            newly_ready.sort_unstable();
            ready.extend(newly_ready);
        }
        if order.len() != self.nodes.len() {
            let stuck = (0..self.nodes.len())
                .find(|i| !order.contains(i))
                .map(|i| self.nodes[i].name().to_owned())
                .unwrap_or_default();
            return Err(WorkloadError::Cycle(stuck));
        }
        Ok(order)
    }

    /// All nodes in topological order, dummy nodes included.
    pub fn topological_sort(&self) -> Vec<&WorkloadNode> {
        self.topological_order()
            .unwrap_or_default()
            .into_iter()
            .map(|i| &self.nodes[i])
            .collect()
    }

    /// Layers (dummy nodes skipped) in topological order.
    pub fn layers(&self) -> Vec<Arc<LayerNode>> {
        self.topological_sort()
            .into_iter()
            .filter_map(|n| n.layer().cloned())
            .collect()
    }

    /// The same graph with every layer replaced by `f` of it.
    pub fn map_layers(&self, f: impl Fn(&LayerNode) -> LayerNode) -> Workload {
        let nodes = self
            .nodes
            .iter()
            .map(|n| match n {
                WorkloadNode::Layer(l) => WorkloadNode::Layer(Arc::new(f(l))),
                dummy => dummy.clone(),
            })
            .collect();
        Workload {
            nodes,
            successors: self.successors.clone(),
            predecessor_counts: self.predecessor_counts.clone(),
        }
    }

    fn index_of(&self, id: usize) -> Option<usize> {
        self.nodes.iter().position(|n| n.id() == id)
    }

    /// The layers feeding node `id`, looking through dummy nodes.
    pub fn layer_predecessors(&self, id: usize) -> Vec<Arc<LayerNode>> {
        let Some(start) = self.index_of(id) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        let mut pending: Vec<usize> = self.nodes[start]
            .sources()
            .into_iter()
            .filter_map(|s| self.index_of(s))
            .collect();
        let mut seen = vec![false; self.nodes.len()];
        while let Some(i) = pending.pop() {
            if std::mem::replace(&mut seen[i], true) {
                continue;
            }
            match &self.nodes[i] {
                WorkloadNode::Layer(l) => found.push(l.clone()),
                dummy => pending.extend(
                    dummy
                        .sources()
                        .into_iter()
                        .filter_map(|s| self.index_of(s)),
                ),
            }
        }
        found.sort_by_key(|l| l.id);
        found
    }

    /// The layers consuming node `id`'s output, looking through dummy nodes.
    pub fn layer_successors(&self, id: usize) -> Vec<Arc<LayerNode>> {
        let Some(start) = self.index_of(id) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        let mut pending = self.successors[start].clone();
        let mut seen = vec![false; self.nodes.len()];
        while let Some(i) = pending.pop() {
            if std::mem::replace(&mut seen[i], true) {
                continue;
            }
            match &self.nodes[i] {
                WorkloadNode::Layer(l) => found.push(l.clone()),
                WorkloadNode::Dummy { .. } => pending.extend(&self.successors[i]),
            }
        }
        found.sort_by_key(|l| l.id);
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LayerOperand;
    use crate::workload::layer::tests::gemm_attrs;

    fn gemm(id: usize, name: &str, sources: &[usize]) -> WorkloadNode {
        let mut attrs = gemm_attrs(4, 4, 4);
        attrs
            .operand_source
            .insert(LayerOperand::new("A"), sources.to_vec());
        WorkloadNode::Layer(Arc::new(LayerNode::new(id, name, attrs).unwrap()))
    }

    #[test]
    fn test_topological_sort_follows_sources() {
        let w = Workload::new(vec![
            gemm(2, "c", &[1]),
            WorkloadNode::Dummy {
                id: 1,
                name: "reshape".to_owned(),
                sources: vec![0],
            },
            gemm(0, "a", &[]),
        ])
        .unwrap();
        let names: Vec<_> = w.topological_sort().iter().map(|n| n.name()).collect();
        assert_eq!(names, ["a", "reshape", "c"]);
        let layers: Vec<_> = w.layers().iter().map(|l| l.name.clone()).collect();
        assert_eq!(layers, ["a", "c"]);
    }

    #[test]
    fn test_layer_neighbours_look_through_dummies() {
        let w = Workload::new(vec![
            gemm(0, "a", &[]),
            WorkloadNode::Dummy {
                id: 1,
                name: "reshape".to_owned(),
                sources: vec![0],
            },
            gemm(2, "b", &[1]),
            gemm(3, "c", &[0]),
        ])
        .unwrap();
        let names = |layers: Vec<Arc<LayerNode>>| -> Vec<String> {
            layers.iter().map(|l| l.name.clone()).collect()
        };
        assert_eq!(names(w.layer_successors(0)), ["b", "c"]);
        assert_eq!(names(w.layer_predecessors(2)), ["a"]);
        assert!(w.layer_predecessors(0).is_empty());
        assert!(w.layer_successors(2).is_empty());
        assert!(w.layer_successors(9).is_empty());
    }

    #[test]
    fn test_cycles_and_unknown_sources_are_rejected() {
        assert!(matches!(
            Workload::new(vec![gemm(0, "a", &[1]), gemm(1, "b", &[0])]),
            Err(WorkloadError::Cycle(_))
        ));
        assert!(matches!(
            Workload::new(vec![gemm(0, "a", &[9])]),
            Err(WorkloadError::UnknownSource { .. })
        ));
        assert!(matches!(
            Workload::new(vec![gemm(0, "a", &[]), gemm(0, "b", &[])]),
            Err(WorkloadError::DuplicateLayerId(0))
        ));
    }
}
