//! The DAG of constant, deterministic and stochastic nodes that a model is
//! built from.
//!
//! Nodes are appended to a flat arena and referenced by a dense integer
//! [`NodeId`] rather than by pointer or `Rc`, mirroring the reference
//! implementation's `Graph`/`NodeId` split but without the allocation
//! overhead of heap-boxed node objects. Node *values* are never stored here:
//! they live per-particle (see [`crate::particle`]). The graph only carries
//! the static structure — shapes, parents, observedness — needed to build
//! samplers and compute closures once, before any particle runs.

mod build;

use crate::error::{EngineError, Result};
use crate::registry::{DistKind, FuncKind};
use crate::tensor::{checks_integer, Tensor};

pub use build::{LikelihoodChildren, StochasticChildren, StochasticParents};

/// Dense index into a [`Graph`]'s node arena.
pub type NodeId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Constant,
    Deterministic(FuncKind),
    Stochastic(DistKind),
    /// Assembles a tensor from scalar slots of other nodes, e.g. `x[2:4]` or
    /// `c(a, b)` in BUGS syntax. Carries no registry tag of its own — the
    /// per-slot `(parent, offset)` pairs live in [`NodeData::agg_slots`].
    Aggregate,
}

#[derive(Clone, Debug)]
pub(crate) struct NodeData {
    pub kind: NodeKind,
    /// Constant: unused. Deterministic: operands in call order.
    /// Stochastic: distribution parameters in call order.
    /// Aggregate: one entry per distinct parent referenced by `agg_slots`,
    /// in first-use order (duplicates collapsed).
    pub parents: Vec<NodeId>,
    pub shape: Vec<usize>,
    /// Only meaningful for `Stochastic` nodes.
    pub observed_flag: bool,
    pub obs_value: Option<Tensor>,
    pub const_value: Option<Tensor>,
    pub bounds: Option<(NodeId, NodeId)>,
    /// Only meaningful for `Aggregate` nodes: one `(source node, flat offset
    /// within that node)` pair per output element, in output column-major
    /// order.
    pub agg_slots: Option<Vec<(NodeId, usize)>>,
}

/// A DAG of constant, deterministic and stochastic nodes.
///
/// Construction is append-only and unordered until [`Graph::build`] is
/// called, after which the topological order and the stochastic-parent /
/// stochastic-child / likelihood-child closures are frozen. Most sampler and
/// inference code only makes sense post-build, so those accessors return a
/// [`EngineError::Logic`] if called first.
pub struct Graph {
    pub(crate) nodes: Vec<NodeData>,
    pub(crate) built: bool,
    pub(crate) topo_order: Vec<NodeId>,
    pub(crate) stochastic_parents: Vec<Vec<NodeId>>,
    pub(crate) stochastic_children: Vec<Vec<NodeId>>,
    pub(crate) likelihood_children: Vec<Vec<NodeId>>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            nodes: Vec::new(),
            built: false,
            topo_order: Vec::new(),
            stochastic_parents: Vec::new(),
            stochastic_children: Vec::new(),
            likelihood_children: Vec::new(),
        }
    }

    fn require_unbuilt(&self) -> Result<()> {
        if self.built {
            return Err(EngineError::Logic(
                "graph is already built; no further nodes may be added".to_string(),
            ));
        }
        Ok(())
    }

    pub fn require_built(&self) -> Result<()> {
        if !self.built {
            return Err(EngineError::Logic(
                "graph has not been built yet".to_string(),
            ));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn shape(&self, id: NodeId) -> &[usize] {
        &self.nodes[id].shape
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.nodes[id].kind
    }

    pub fn parents(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].parents
    }

    pub fn bounds(&self, id: NodeId) -> Option<(NodeId, NodeId)> {
        self.nodes[id].bounds
    }

    pub fn const_value(&self, id: NodeId) -> Option<&Tensor> {
        self.nodes[id].const_value.as_ref()
    }

    pub fn obs_value(&self, id: NodeId) -> Option<&Tensor> {
        self.nodes[id].obs_value.as_ref()
    }

    /// Whether `id` carries (or, for a deterministic node, is wholly
    /// determined by ancestors carrying) an observed value. Computed on
    /// demand rather than cached and invalidated, since observedness only
    /// ever changes through [`Graph::set_observed_value`] /
    /// [`Graph::set_unobserved`], both of which are rare, pre-build calls.
    pub fn is_observed(&self, id: NodeId) -> bool {
        match self.nodes[id].kind {
            NodeKind::Constant => true,
            NodeKind::Stochastic(_) => self.nodes[id].observed_flag,
            NodeKind::Deterministic(_) | NodeKind::Aggregate => self.nodes[id]
                .parents
                .iter()
                .all(|&p| self.is_observed(p)),
        }
    }

    pub fn is_discrete(&self, id: NodeId) -> bool {
        match self.nodes[id].kind {
            NodeKind::Constant => self
                .nodes[id]
                .const_value
                .as_ref()
                .map(|v| v.is_discrete())
                .unwrap_or(false),
            NodeKind::Deterministic(f) => {
                let mask: Vec<bool> = self.nodes[id]
                    .parents
                    .iter()
                    .map(|&p| self.is_discrete(p))
                    .collect();
                f.is_discrete_valued(&mask)
            }
            NodeKind::Stochastic(d) => {
                let mask: Vec<bool> = self.nodes[id]
                    .parents
                    .iter()
                    .map(|&p| self.is_discrete(p))
                    .collect();
                d.is_discrete_valued(&mask)
            }
            NodeKind::Aggregate => self.nodes[id].parents.iter().all(|&p| self.is_discrete(p)),
        }
    }

    fn shapes_of<'a>(&'a self, ids: &[NodeId], buf: &'a mut Vec<Vec<usize>>) -> Vec<&'a [usize]> {
        buf.clear();
        for &id in ids {
            buf.push(self.shape(id).to_vec());
        }
        buf.iter().map(|s| s.as_slice()).collect()
    }

    pub fn add_constant(&mut self, value: Tensor) -> Result<NodeId> {
        self.require_unbuilt()?;
        let shape = value.shape().to_vec();
        self.nodes.push(NodeData {
            kind: NodeKind::Constant,
            parents: Vec::new(),
            shape,
            observed_flag: true,
            obs_value: None,
            const_value: Some(value),
            bounds: None,
            agg_slots: None,
        });
        Ok(self.nodes.len() - 1)
    }

    pub fn add_deterministic(&mut self, func: FuncKind, parents: Vec<NodeId>) -> Result<NodeId> {
        self.require_unbuilt()?;
        let mut buf = Vec::new();
        let shapes = self.shapes_of(&parents, &mut buf);
        if !func.check_param_dims(&shapes) {
            return Err(EngineError::Dimension(format!(
                "{}: incompatible operand shapes",
                func.name()
            )));
        }
        let shape = func.dim(&shapes);
        self.nodes.push(NodeData {
            kind: NodeKind::Deterministic(func),
            parents,
            shape,
            observed_flag: false,
            obs_value: None,
            const_value: None,
            bounds: None,
            agg_slots: None,
        });
        Ok(self.nodes.len() - 1)
    }

    /// Assembles a compound value out of scalar slots of other nodes — the
    /// graph-building counterpart of BUGS constructs like `x[2:4]` or
    /// `c(a, b, c)`. `slots[k] = (source, offset)` says output element `k`
    /// (in column-major order over `shape`) comes from flat position
    /// `offset` of node `source`.
    pub fn add_aggregation(&mut self, shape: Vec<usize>, slots: Vec<(NodeId, usize)>) -> Result<NodeId> {
        self.require_unbuilt()?;
        if shape.is_empty() || shape.iter().any(|&d| d == 0) {
            return Err(EngineError::Dimension(format!(
                "aggregate shape must be non-empty with positive extents, got {:?}",
                shape
            )));
        }
        let expected: usize = shape.iter().product();
        if expected != slots.len() {
            return Err(EngineError::Dimension(format!(
                "aggregate shape {:?} implies {} slots, got {}",
                shape,
                expected,
                slots.len()
            )));
        }
        for &(source, offset) in &slots {
            if source >= self.nodes.len() {
                return Err(EngineError::Logic(format!(
                    "aggregate slot references unknown node {}",
                    source
                )));
            }
            let source_len: usize = self.nodes[source].shape.iter().product();
            if offset >= source_len {
                return Err(EngineError::Dimension(format!(
                    "aggregate slot offset {} out of range for node {} of length {}",
                    offset, source, source_len
                )));
            }
        }
        let mut parents = Vec::new();
        for &(source, _) in &slots {
            if !parents.contains(&source) {
                parents.push(source);
            }
        }
        self.nodes.push(NodeData {
            kind: NodeKind::Aggregate,
            parents,
            shape,
            observed_flag: false,
            obs_value: None,
            const_value: None,
            bounds: None,
            agg_slots: Some(slots),
        });
        Ok(self.nodes.len() - 1)
    }

    /// The per-slot `(source node, flat offset)` pairs of an `Aggregate`
    /// node, in output column-major order.
    pub fn agg_slots(&self, id: NodeId) -> Option<&[(NodeId, usize)]> {
        self.nodes[id].agg_slots.as_deref()
    }

    /// Adds a latent (unobserved) stochastic node.
    pub fn add_stochastic(
        &mut self,
        dist: DistKind,
        params: Vec<NodeId>,
        bounds: Option<(NodeId, NodeId)>,
    ) -> Result<NodeId> {
        self.add_stochastic_node(dist, params, bounds, false, None)
    }

    /// Adds a stochastic node with an observed value fixed at construction.
    pub fn add_observed(
        &mut self,
        dist: DistKind,
        params: Vec<NodeId>,
        value: Tensor,
        bounds: Option<(NodeId, NodeId)>,
    ) -> Result<NodeId> {
        self.add_stochastic_node(dist, params, bounds, true, Some(value))
    }

    fn add_stochastic_node(
        &mut self,
        dist: DistKind,
        params: Vec<NodeId>,
        bounds: Option<(NodeId, NodeId)>,
        observed: bool,
        value: Option<Tensor>,
    ) -> Result<NodeId> {
        self.require_unbuilt()?;
        let mut buf = Vec::new();
        let shapes = self.shapes_of(&params, &mut buf);
        if !dist.check_param_dims(&shapes) {
            return Err(EngineError::Dimension(format!(
                "{}: incompatible parameter shapes",
                dist.name()
            )));
        }
        if bounds.is_some() && !dist.can_bound() {
            return Err(EngineError::Distribution(format!(
                "{} does not support truncation bounds",
                dist.name()
            )));
        }
        if let Some(v) = &value {
            let mask: Vec<bool> = params.iter().map(|&p| self.is_discrete(p)).collect();
            if dist.is_discrete_valued(&mask) && !v.values().iter().all(|&x| checks_integer(x)) {
                return Err(EngineError::Domain(format!(
                    "{}: observed value must be integral for a discrete-valued distribution",
                    dist.name()
                )));
            }
        }
        let shape = dist.dim(&shapes)?;
        self.nodes.push(NodeData {
            kind: NodeKind::Stochastic(dist),
            parents: params,
            shape,
            observed_flag: observed,
            obs_value: value,
            const_value: None,
            bounds,
            agg_slots: None,
        });
        Ok(self.nodes.len() - 1)
    }

    /// Removes the most recently added node, provided the graph has not
    /// been built and nothing else references it yet.
    pub fn pop_last(&mut self) -> Result<()> {
        self.require_unbuilt()?;
        let last = self
            .nodes
            .len()
            .checked_sub(1)
            .ok_or_else(|| EngineError::Logic("graph is empty".to_string()))?;
        for (id, node) in self.nodes.iter().enumerate() {
            if id == last {
                continue;
            }
            if node.parents.contains(&last) {
                return Err(EngineError::Logic(format!(
                    "cannot pop node {}: still referenced by node {}",
                    last, id
                )));
            }
        }
        self.nodes.pop();
        Ok(())
    }

    /// Fixes the observed value of an existing stochastic node.
    pub fn set_observed_value(&mut self, id: NodeId, value: Tensor) -> Result<()> {
        match self.nodes[id].kind {
            NodeKind::Stochastic(_) => {
                self.nodes[id].observed_flag = true;
                self.nodes[id].obs_value = Some(value);
                Ok(())
            }
            _ => Err(EngineError::Logic(
                "only stochastic nodes can be set observed".to_string(),
            )),
        }
    }

    /// Reverts a stochastic node to latent. Deterministic descendants are
    /// not eagerly touched: [`Graph::is_observed`] recomputes their status
    /// from current ancestors on every call.
    pub fn set_unobserved(&mut self, id: NodeId) -> Result<()> {
        match self.nodes[id].kind {
            NodeKind::Stochastic(_) => {
                self.nodes[id].observed_flag = false;
                self.nodes[id].obs_value = None;
                Ok(())
            }
            _ => Err(EngineError::Logic(
                "only stochastic nodes can be set unobserved".to_string(),
            )),
        }
    }

    pub fn topological_order(&self) -> Result<&[NodeId]> {
        self.require_built()?;
        Ok(&self.topo_order)
    }

    pub fn stochastic_parents_of(&self, id: NodeId) -> Result<&[NodeId]> {
        self.require_built()?;
        Ok(&self.stochastic_parents[id])
    }

    pub fn stochastic_children_of(&self, id: NodeId) -> Result<&[NodeId]> {
        self.require_built()?;
        Ok(&self.stochastic_children[id])
    }

    pub fn likelihood_children_of(&self, id: NodeId) -> Result<&[NodeId]> {
        self.require_built()?;
        Ok(&self.likelihood_children[id])
    }

    pub fn stochastic_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).filter(move |&id| matches!(self.nodes[id].kind, NodeKind::Stochastic(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregation_rejects_slot_count_mismatch() {
        let mut g = Graph::new();
        let a = g.add_constant(Tensor::vector(vec![1.0, 2.0])).unwrap();
        assert!(g.add_aggregation(vec![3], vec![(a, 0), (a, 1)]).is_err());
    }

    #[test]
    fn aggregation_rejects_out_of_range_offset() {
        let mut g = Graph::new();
        let a = g.add_constant(Tensor::vector(vec![1.0, 2.0])).unwrap();
        assert!(g.add_aggregation(vec![1], vec![(a, 5)]).is_err());
    }

    #[test]
    fn aggregation_rejects_unknown_source_node() {
        let mut g = Graph::new();
        let _a = g.add_constant(Tensor::scalar(1.0)).unwrap();
        assert!(g.add_aggregation(vec![1], vec![(99, 0)]).is_err());
    }

    #[test]
    fn aggregation_dedupes_repeated_parents() {
        let mut g = Graph::new();
        let a = g.add_constant(Tensor::vector(vec![1.0, 2.0])).unwrap();
        let agg = g.add_aggregation(vec![2], vec![(a, 0), (a, 1)]).unwrap();
        assert_eq!(g.parents(agg), &[a]);
    }

    #[test]
    fn aggregation_is_observed_only_if_every_source_is() {
        let mut g = Graph::new();
        let a = g.add_constant(Tensor::scalar(1.0)).unwrap();
        let mean0 = g.add_constant(Tensor::scalar(0.0)).unwrap();
        let prec0 = g.add_constant(Tensor::scalar(1.0)).unwrap();
        let latent = g.add_stochastic(DistKind::Norm, vec![mean0, prec0], None).unwrap();
        let agg_const = g.add_aggregation(vec![1], vec![(a, 0)]).unwrap();
        let agg_latent = g.add_aggregation(vec![1], vec![(latent, 0)]).unwrap();
        assert!(g.is_observed(agg_const));
        assert!(!g.is_observed(agg_latent));
    }

    #[test]
    fn observed_binomial_rejects_a_non_integer_value() {
        let mut g = Graph::new();
        let n = g.add_constant(Tensor::scalar(10.0)).unwrap();
        let p = g.add_constant(Tensor::scalar(0.3)).unwrap();
        let err = g
            .add_observed(DistKind::Binomial, vec![n, p], Tensor::scalar(3.4), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Domain(_)));
    }

    #[test]
    fn observed_binomial_accepts_an_integral_value() {
        let mut g = Graph::new();
        let n = g.add_constant(Tensor::scalar(10.0)).unwrap();
        let p = g.add_constant(Tensor::scalar(0.3)).unwrap();
        assert!(g
            .add_observed(DistKind::Binomial, vec![n, p], Tensor::scalar(3.0), None)
            .is_ok());
    }
}
