//! Graph finalisation: cycle detection, topological sort, and the three
//! closures ([`StochasticParents`], [`StochasticChildren`],
//! [`LikelihoodChildren`]) samplers are built from. Grounded on
//! `Graph::Build`'s `TopologicalSortVisitor`, `buildStochasticParents`,
//! `buildStochasticChildren` and `buildLikelihoodChildren` (the last via its
//! `anyUnknownParent` helper).

use super::{Graph, NodeId, NodeKind};
use crate::error::{EngineError, Result};

pub type StochasticParents = Vec<Vec<NodeId>>;
pub type StochasticChildren = Vec<Vec<NodeId>>;
pub type LikelihoodChildren = Vec<Vec<NodeId>>;

impl Graph {
    /// Finalises the graph: detects cycles, computes a topological order,
    /// and derives the stochastic-parent, stochastic-child and
    /// likelihood-child closures every sampler and monitor needs. Idempotent
    /// only in the sense that calling it twice is rejected — once built, a
    /// graph is immutable.
    pub fn build(&mut self) -> Result<()> {
        if self.built {
            return Err(EngineError::Logic("graph is already built".to_string()));
        }
        let order = self.topological_sort()?;
        self.topo_order = order;
        self.stochastic_parents = self.build_stochastic_parents();
        self.stochastic_children = self.build_stochastic_children(&self.stochastic_parents);
        self.likelihood_children = self.build_likelihood_children(&self.stochastic_children);
        self.built = true;
        Ok(())
    }

    fn topological_sort(&self) -> Result<Vec<NodeId>> {
        let n = self.nodes.len();
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let mut mark = vec![Mark::Unvisited; n];
        let mut order = Vec::with_capacity(n);

        fn visit(
            id: NodeId,
            nodes: &[super::NodeData],
            mark: &mut [Mark],
            order: &mut Vec<NodeId>,
        ) -> Result<()> {
            match mark[id] {
                Mark::Done => return Ok(()),
                Mark::InProgress => {
                    return Err(EngineError::Logic(format!(
                        "graph contains a cycle through node {}",
                        id
                    )))
                }
                Mark::Unvisited => {}
            }
            mark[id] = Mark::InProgress;
            for &parent in &nodes[id].parents {
                visit(parent, nodes, mark, order)?;
            }
            if let Some((lo, hi)) = nodes[id].bounds {
                visit(lo, nodes, mark, order)?;
                visit(hi, nodes, mark, order)?;
            }
            mark[id] = Mark::Done;
            order.push(id);
            Ok(())
        }

        for id in 0..n {
            visit(id, &self.nodes, &mut mark, &mut order)?;
        }
        Ok(order)
    }

    /// The nearest stochastic ancestor of each parent edge, skipping through
    /// deterministic nodes — the structure conjugacy detectors walk.
    fn build_stochastic_parents(&self) -> StochasticParents {
        let n = self.nodes.len();
        let mut result = vec![Vec::new(); n];
        for &id in &self.topo_order {
            let mut parents = Vec::new();
            for &p in &self.nodes[id].parents {
                collect_nearest_stochastic(p, &self.nodes, &mut parents);
            }
            result[id] = parents;
        }
        result
    }

    /// For each stochastic node, the nearest stochastic descendants reached
    /// by following deterministic/stochastic-parameter edges forward.
    fn build_stochastic_children(&self, stochastic_parents: &StochasticParents) -> StochasticChildren {
        let n = self.nodes.len();
        let mut result = vec![Vec::new(); n];
        for child in 0..n {
            for &parent in &stochastic_parents[child] {
                result[parent].push(child);
            }
        }
        result
    }

    /// Observed stochastic descendants reachable from `id` through a path of
    /// deterministic nodes only (i.e. nodes whose distribution is a genuine
    /// function of `id`'s value, not merely of another stochastic node
    /// downstream of it) — the set a node's sampler must fold into its
    /// likelihood contribution. An unobserved descendant carries no data to
    /// score against and so is never a likelihood child, even when reached
    /// deterministic-only; it instead starts its own group with its own
    /// likelihood children.
    fn build_likelihood_children(&self, stochastic_children: &StochasticChildren) -> LikelihoodChildren {
        let n = self.nodes.len();
        let mut result = vec![Vec::new(); n];
        for id in 0..n {
            if !matches!(self.nodes[id].kind, NodeKind::Stochastic(_)) {
                continue;
            }
            let mut likelihood = Vec::new();
            for &child in &stochastic_children[id] {
                if self.nodes[child].observed_flag
                    && self.reachable_through_deterministic_only(id, child)
                {
                    likelihood.push(child);
                }
            }
            result[id] = likelihood;
        }
        result
    }

    /// True if every path from `target`'s parameters back to `from` passes
    /// only through deterministic nodes (never through another stochastic
    /// node), mirroring `anyUnknownParent`'s negation.
    fn reachable_through_deterministic_only(&self, from: NodeId, target: NodeId) -> bool {
        fn walk(
            from: NodeId,
            id: NodeId,
            nodes: &[super::NodeData],
            seen: &mut Vec<bool>,
        ) -> bool {
            if id == from {
                return true;
            }
            if seen[id] {
                return false;
            }
            seen[id] = true;
            match nodes[id].kind {
                NodeKind::Stochastic(_) => false,
                NodeKind::Constant => false,
                NodeKind::Deterministic(_) | NodeKind::Aggregate => nodes[id]
                    .parents
                    .iter()
                    .any(|&p| walk(from, p, nodes, seen)),
            }
        }
        let mut found_direct = false;
        let mut seen = vec![false; self.nodes.len()];
        for &param in &self.nodes[target].parents {
            if param == from {
                found_direct = true;
                continue;
            }
            if walk(from, param, &self.nodes, &mut seen) {
                found_direct = true;
            }
        }
        found_direct
    }
}

fn collect_nearest_stochastic(id: NodeId, nodes: &[super::NodeData], out: &mut Vec<NodeId>) {
    match nodes[id].kind {
        NodeKind::Stochastic(_) => {
            if !out.contains(&id) {
                out.push(id);
            }
        }
        NodeKind::Constant => {}
        NodeKind::Deterministic(_) | NodeKind::Aggregate => {
            for &p in &nodes[id].parents {
                collect_nearest_stochastic(p, nodes, out);
            }
        }
    }
}
