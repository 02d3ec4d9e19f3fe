//! Variance-parameterised normal/normal conjugacy with an affine-in-target
//! mean: prior `target ~ dnormvar(mean0, var0)`, each likelihood child
//! `y_i ~ dnorm(a_i * target + b_i, prec_i)` or
//! `y_i ~ dnormvar(a_i * target + b_i, var_i)`, with the child's dispersion
//! parameter not itself a function of `target`. Grounded on
//! `ConjugateNormalVarLinear.cpp`.

use rand::Rng;

use crate::error::Result;
use crate::eval::{eval_node, eval_params};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::particle::Particle;
use crate::registry::DistKind;
use crate::samplers::linear::linear_coeffs;
use crate::tensor::Tensor;

fn child_dispersion(graph: &Graph, particle: &mut Particle, child: NodeId) -> Result<f64> {
    let parents = graph.parents(child);
    let param = eval_node(graph, particle, parents[1])?.scalar_view()?;
    match graph.kind(child) {
        NodeKind::Stochastic(DistKind::Norm) => Ok(1.0 / param),
        NodeKind::Stochastic(DistKind::NormVar) => Ok(param),
        _ => unreachable!("checked in is_applicable"),
    }
}

pub fn is_applicable(graph: &Graph, particle: &mut Particle, id: NodeId) -> Result<bool> {
    if graph.is_observed(id) {
        return Ok(false);
    }
    if graph.bounds(id).is_some() {
        // Truncation bounds on the target itself have no closed-form conjugate
        // posterior here; fall back to the default sampler's inverse-CDF path.
        return Ok(false);
    }
    if !matches!(graph.kind(id), NodeKind::Stochastic(DistKind::NormVar)) {
        return Ok(false);
    }
    for &child in graph.likelihood_children_of(id)? {
        if !matches!(
            graph.kind(child),
            NodeKind::Stochastic(DistKind::Norm) | NodeKind::Stochastic(DistKind::NormVar)
        ) {
            return Ok(false);
        }
        if !graph.is_observed(child) {
            return Ok(false);
        }
        let parents = graph.parents(child);
        match linear_coeffs(graph, particle, id, parents[0])? {
            Some((a, _)) if a != 0.0 => {}
            _ => return Ok(false),
        }
        if depends_on_target(graph, parents[1], id) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn depends_on_target(graph: &Graph, node: NodeId, target: NodeId) -> bool {
    if node == target {
        return true;
    }
    match graph.kind(node) {
        NodeKind::Deterministic(_) => graph.parents(node).iter().any(|&p| depends_on_target(graph, p, target)),
        _ => false,
    }
}

pub fn sample<R: Rng + ?Sized>(
    graph: &Graph,
    particle: &mut Particle,
    id: NodeId,
    rng: &mut R,
) -> Result<()> {
    let prior_params = eval_params(graph, particle, id)?;
    let prior_mean = prior_params[0].scalar_view()?;
    let prior_var = prior_params[1].scalar_view()?;

    let mut post_prec = 1.0 / prior_var;
    let mut post_mean_contrib = prior_mean / prior_var;
    let mut log_prior_predictive = 0.0;

    for &child in graph.likelihood_children_of(id)? {
        let parents = graph.parents(child);
        let (a, b) = linear_coeffs(graph, particle, id, parents[0])?.expect("checked applicable");
        let var_i = child_dispersion(graph, particle, child)?;
        let y = graph
            .obs_value(child)
            .expect("checked observed")
            .scalar_view()?;

        let pre_mean = post_mean_contrib / post_prec;
        let pred_var = var_i + (a * a) / post_prec;
        log_prior_predictive += -0.5
            * ((y - (a * pre_mean + b)).powi(2) / pred_var
                + pred_var.ln()
                + (2.0 * std::f64::consts::PI).ln());

        post_prec += (a * a) / var_i;
        post_mean_contrib += a * (y - b) / var_i;
    }

    let post_var = 1.0 / post_prec;
    let post_mean = post_mean_contrib * post_var;
    let dist = statrs::distribution::Normal::new(post_mean, post_var.sqrt())
        .map_err(|e| crate::error::EngineError::Distribution(e.to_string()))?;
    let draw = rand::distributions::Distribution::<f64>::sample(&dist, rng);
    particle.set_value(id, Tensor::scalar(draw));
    particle.add_to_log_weight(log_prior_predictive)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use rand::SeedableRng;

    #[test]
    fn detects_conjugacy_with_normvar_prior_and_norm_children() {
        let mut g = Graph::new();
        let mean0 = g.add_constant(Tensor::scalar(0.0)).unwrap();
        let var0 = g.add_constant(Tensor::scalar(1.0)).unwrap();
        let theta = g.add_stochastic(DistKind::NormVar, vec![mean0, var0], None).unwrap();
        let prec_obs = g.add_constant(Tensor::scalar(0.5)).unwrap();
        let _y = g
            .add_observed(DistKind::Norm, vec![theta, prec_obs], Tensor::scalar(2.0), None)
            .unwrap();
        g.build().unwrap();
        let mut p = Particle::new(g.len());
        assert!(is_applicable(&g, &mut p, theta).unwrap());
    }

    #[test]
    fn sampling_produces_a_finite_value_and_weight() {
        let mut g = Graph::new();
        let mean0 = g.add_constant(Tensor::scalar(0.0)).unwrap();
        let var0 = g.add_constant(Tensor::scalar(1.0)).unwrap();
        let theta = g.add_stochastic(DistKind::NormVar, vec![mean0, var0], None).unwrap();
        let var_obs = g.add_constant(Tensor::scalar(0.5)).unwrap();
        let _y = g
            .add_observed(DistKind::NormVar, vec![theta, var_obs], Tensor::scalar(2.0), None)
            .unwrap();
        g.build().unwrap();
        let mut p = Particle::new(g.len());
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        sample(&g, &mut p, theta, &mut rng).unwrap();
        assert!(p.value(theta).unwrap().scalar_view().unwrap().is_finite());
        assert!(p.log_weight().is_finite());
    }
}
