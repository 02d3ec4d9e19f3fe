//! Lazy evaluation of deterministic node values within a particle.
//!
//! Deterministic nodes are not swept eagerly in value order; samplers and
//! weight computations instead pull the value of whatever node they need,
//! which recursively forces any unevaluated deterministic ancestors and
//! caches the results back into the particle. A stochastic node must
//! already carry a sampled value — asking for one that doesn't is a caller
//! bug, not a recoverable condition.

use crate::error::{EngineError, Result};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::particle::Particle;
use crate::tensor::{Tensor, TensorView};

/// Returns the value of `id`, evaluating and caching deterministic
/// ancestors as needed.
pub fn eval_node(graph: &Graph, particle: &mut Particle, id: NodeId) -> Result<Tensor> {
    if let Some(v) = particle.value(id) {
        return Ok(v.clone());
    }
    match graph.kind(id) {
        NodeKind::Constant => {
            let v = graph
                .const_value(id)
                .expect("constant node always carries a value")
                .clone();
            particle.set_value(id, v.clone());
            Ok(v)
        }
        NodeKind::Stochastic(_) => Err(EngineError::Logic(format!(
            "stochastic node {} has no sampled value yet",
            id
        ))),
        NodeKind::Deterministic(func) => {
            let parents = graph.parents(id).to_vec();
            let mut owned = Vec::with_capacity(parents.len());
            for &p in &parents {
                owned.push(eval_node(graph, particle, p)?);
            }
            let views: Vec<TensorView> = owned.iter().map(|t| t.as_view()).collect();
            let value = func.eval(&views)?;
            particle.set_value(id, value.clone());
            Ok(value)
        }
        NodeKind::Aggregate => {
            let slots = graph
                .agg_slots(id)
                .expect("aggregate node always carries its slots")
                .to_vec();
            let mut data = Vec::with_capacity(slots.len());
            for (source, offset) in slots {
                let v = eval_node(graph, particle, source)?;
                data.push(v.values()[offset]);
            }
            let value = Tensor::new(graph.shape(id).to_vec(), data)?;
            particle.set_value(id, value.clone());
            Ok(value)
        }
    }
}

/// Evaluates the distribution parameters of a stochastic (or any) node,
/// forcing deterministic ancestors as needed.
pub fn eval_params(graph: &Graph, particle: &mut Particle, id: NodeId) -> Result<Vec<Tensor>> {
    let parents = graph.parents(id).to_vec();
    let mut owned = Vec::with_capacity(parents.len());
    for &p in &parents {
        owned.push(eval_node(graph, particle, p)?);
    }
    Ok(owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DistKind, FuncKind};

    #[test]
    fn deterministic_chain_is_cached_after_first_eval() {
        let mut g = Graph::new();
        let a = g.add_constant(Tensor::scalar(4.0)).unwrap();
        let b = g.add_deterministic(FuncKind::Sqrt, vec![a]).unwrap();
        let c = g.add_deterministic(FuncKind::Sqrt, vec![b]).unwrap();
        g.build().unwrap();
        let mut p = Particle::new(g.len());
        let v = eval_node(&g, &mut p, c).unwrap();
        assert!((v.scalar_view().unwrap() - 4f64.sqrt().sqrt()).abs() < 1e-12);
        assert!(p.has_value(b));
    }

    #[test]
    fn unset_stochastic_node_is_a_logic_error() {
        let mut g = Graph::new();
        let mean = g.add_constant(Tensor::scalar(0.0)).unwrap();
        let prec = g.add_constant(Tensor::scalar(1.0)).unwrap();
        let x = g.add_stochastic(DistKind::Norm, vec![mean, prec], None).unwrap();
        g.build().unwrap();
        let mut p = Particle::new(g.len());
        assert!(eval_node(&g, &mut p, x).is_err());
    }

    #[test]
    fn aggregate_node_assembles_slots_in_order() {
        let mut g = Graph::new();
        let a = g.add_constant(Tensor::vector(vec![1.0, 2.0, 3.0])).unwrap();
        let b = g.add_constant(Tensor::scalar(9.0)).unwrap();
        let agg = g
            .add_aggregation(vec![3], vec![(a, 2), (a, 0), (b, 0)])
            .unwrap();
        g.build().unwrap();
        let mut p = Particle::new(g.len());
        let v = eval_node(&g, &mut p, agg).unwrap();
        assert_eq!(v.values(), &[3.0, 1.0, 9.0]);
    }
}
