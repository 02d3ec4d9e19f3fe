//! Structural linearity check: does a node's value, as a function of one
//! designated target node, reduce to `A * target + B` for constant
//! (w.r.t. the target) `A` and `B`? Grounded on `GetLinearTransformVisitor`
//! and `IsLinearVisitor`, used by the conjugate-normal-with-linear-mean
//! sampler to decide whether it applies to a given likelihood child.

use crate::error::Result;
use crate::eval::eval_node;
use crate::graph::{Graph, NodeId, NodeKind};
use crate::particle::Particle;
use crate::registry::FuncKind;

/// Whether `id`'s subgraph contains `target`, walking only deterministic
/// edges (a stochastic node other than `target` is treated as opaque: its
/// sampled value stands on its own, it is not "made of" `target`).
fn depends_on(graph: &Graph, id: NodeId, target: NodeId) -> bool {
    if id == target {
        return true;
    }
    match graph.kind(id) {
        NodeKind::Deterministic(_) => graph.parents(id).iter().any(|&p| depends_on(graph, p, target)),
        _ => false,
    }
}

/// Returns `Some((a, b))` if `node`'s scalar value can be written as
/// `a * target_value + b`, or `None` if the dependency is non-linear.
pub fn linear_coeffs(
    graph: &Graph,
    particle: &mut Particle,
    target: NodeId,
    node: NodeId,
) -> Result<Option<(f64, f64)>> {
    if node == target {
        return Ok(Some((1.0, 0.0)));
    }
    if !depends_on(graph, node, target) {
        let value = eval_node(graph, particle, node)?.scalar_view()?;
        return Ok(Some((0.0, value)));
    }
    let func = match graph.kind(node) {
        NodeKind::Deterministic(f) => f,
        _ => return Ok(None),
    };
    let parents = graph.parents(node).to_vec();
    match func {
        FuncKind::Identity => linear_coeffs(graph, particle, target, parents[0]),
        FuncKind::Add => {
            let lhs = linear_coeffs(graph, particle, target, parents[0])?;
            let rhs = linear_coeffs(graph, particle, target, parents[1])?;
            Ok(match (lhs, rhs) {
                (Some((a1, b1)), Some((a2, b2))) => Some((a1 + a2, b1 + b2)),
                _ => None,
            })
        }
        FuncKind::Multiply => {
            let lhs_depends = depends_on(graph, parents[0], target);
            let rhs_depends = depends_on(graph, parents[1], target);
            if lhs_depends && rhs_depends {
                return Ok(None);
            }
            if lhs_depends {
                let (a, b) = linear_coeffs(graph, particle, target, parents[0])?.unwrap();
                let k = eval_node(graph, particle, parents[1])?.scalar_view()?;
                Ok(Some((a * k, b * k)))
            } else {
                let (a, b) = linear_coeffs(graph, particle, target, parents[1])?.unwrap();
                let k = eval_node(graph, particle, parents[0])?.scalar_view()?;
                Ok(Some((a * k, b * k)))
            }
        }
        _ => Ok(None),
    }
}
