//! Normal/normal conjugacy with a known-precision, affine-in-target mean:
//! prior `target ~ dnorm(mean0, prec0)`, each likelihood child
//! `y_i ~ dnorm(a_i * target + b_i, prec_i)` with `prec_i` not itself a
//! function of `target`. Grounded on `ConjugateNormal.cpp`'s
//! `formLikeParamContrib`/`postParam`, generalised to an affine mean via the
//! same linear-coefficient extraction `ConjugateNormalVarLinear.cpp` uses.

use rand::Rng;

use crate::error::Result;
use crate::eval::{eval_node, eval_params};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::particle::Particle;
use crate::registry::DistKind;
use crate::samplers::linear::linear_coeffs;
use crate::tensor::Tensor;

pub fn is_applicable(graph: &Graph, particle: &mut Particle, id: NodeId) -> Result<bool> {
    if graph.is_observed(id) {
        return Ok(false);
    }
    if graph.bounds(id).is_some() {
        // Truncation bounds on the target itself have no closed-form conjugate
        // posterior here; fall back to the default sampler's inverse-CDF path.
        return Ok(false);
    }
    if !matches!(graph.kind(id), NodeKind::Stochastic(DistKind::Norm)) {
        return Ok(false);
    }
    for &child in graph.likelihood_children_of(id)? {
        if !matches!(graph.kind(child), NodeKind::Stochastic(DistKind::Norm)) {
            return Ok(false);
        }
        if !graph.is_observed(child) {
            return Ok(false);
        }
        let parents = graph.parents(child);
        let mean_param = parents[0];
        let prec_param = parents[1];
        match linear_coeffs(graph, particle, id, mean_param)? {
            Some((a, _)) if a != 0.0 => {}
            _ => return Ok(false),
        }
        if depends_on_target(graph, prec_param, id) {
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
    let prior_prec = prior_params[1].scalar_view()?;

    let mut post_prec = prior_prec;
    let mut post_mean_contrib = prior_prec * prior_mean;
    let mut log_prior_predictive = 0.0;

    for &child in graph.likelihood_children_of(id)? {
        let parents = graph.parents(child);
        let (a, b) = linear_coeffs(graph, particle, id, parents[0])?.expect("checked applicable");
        let prec_i = eval_node(graph, particle, parents[1])?.scalar_view()?;
        let y = graph
            .obs_value(child)
            .expect("checked observed")
            .scalar_view()?;

        // Predictive density of `y` under the running (pre-update) posterior
        // on target, marginalising target out: y | data_so_far ~
        // Normal(a*mean + b, 1/prec_i + a^2/post_prec).
        let pre_mean = post_mean_contrib / post_prec;
        let pred_var = 1.0 / prec_i + (a * a) / post_prec;
        log_prior_predictive += -0.5
            * ((y - (a * pre_mean + b)).powi(2) / pred_var
                + pred_var.ln()
                + (2.0 * std::f64::consts::PI).ln());

        post_prec += a * a * prec_i;
        post_mean_contrib += a * prec_i * (y - b);
    }

    let post_mean = post_mean_contrib / post_prec;
    let dist = statrs::distribution::Normal::new(post_mean, (1.0 / post_prec).sqrt())
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
    fn detects_conjugacy_with_observed_normal_children() {
        let mut g = Graph::new();
        let mean0 = g.add_constant(Tensor::scalar(0.0)).unwrap();
        let prec0 = g.add_constant(Tensor::scalar(1.0)).unwrap();
        let theta = g.add_stochastic(DistKind::Norm, vec![mean0, prec0], None).unwrap();
        let prec_obs = g.add_constant(Tensor::scalar(4.0)).unwrap();
        let _y = g
            .add_observed(DistKind::Norm, vec![theta, prec_obs], Tensor::scalar(1.5), None)
            .unwrap();
        g.build().unwrap();
        let mut p = Particle::new(g.len());
        assert!(is_applicable(&g, &mut p, theta).unwrap());
    }

    #[test]
    fn bounded_target_falls_back_to_default_sampler() {
        let mut g = Graph::new();
        let mean0 = g.add_constant(Tensor::scalar(0.0)).unwrap();
        let prec0 = g.add_constant(Tensor::scalar(1.0)).unwrap();
        let lo = g.add_constant(Tensor::scalar(-10.0)).unwrap();
        let hi = g.add_constant(Tensor::scalar(10.0)).unwrap();
        let theta = g
            .add_stochastic(DistKind::Norm, vec![mean0, prec0], Some((lo, hi)))
            .unwrap();
        let prec_obs = g.add_constant(Tensor::scalar(4.0)).unwrap();
        let _y = g
            .add_observed(DistKind::Norm, vec![theta, prec_obs], Tensor::scalar(1.5), None)
            .unwrap();
        g.build().unwrap();
        let mut p = Particle::new(g.len());
        assert!(!is_applicable(&g, &mut p, theta).unwrap());
    }

    #[test]
    fn sampling_produces_a_finite_value_and_weight() {
        let mut g = Graph::new();
        let mean0 = g.add_constant(Tensor::scalar(0.0)).unwrap();
        let prec0 = g.add_constant(Tensor::scalar(1.0)).unwrap();
        let theta = g.add_stochastic(DistKind::Norm, vec![mean0, prec0], None).unwrap();
        let prec_obs = g.add_constant(Tensor::scalar(4.0)).unwrap();
        let _y = g
            .add_observed(DistKind::Norm, vec![theta, prec_obs], Tensor::scalar(1.5), None)
            .unwrap();
        g.build().unwrap();
        let mut p = Particle::new(g.len());
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        sample(&g, &mut p, theta, &mut rng).unwrap();
        assert!(p.value(theta).unwrap().scalar_view().unwrap().is_finite());
        assert!(p.log_weight().is_finite());
    }
}
