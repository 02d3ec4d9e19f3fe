//! Beta/binomial conjugacy: prior `target ~ dbeta(alpha0, beta0)`, each
//! likelihood child `y_i ~ dbin(n_i, target)` observed, with `target`
//! appearing directly as the success probability and `n_i` not a function
//! of `target`. Grounded on `ConjugateBeta.cpp`.

use rand::Rng;

use crate::error::Result;
use crate::eval::{eval_node, eval_params};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::particle::Particle;
use crate::registry::DistKind;
use crate::tensor::Tensor;

pub fn is_applicable(graph: &Graph, _particle: &mut Particle, id: NodeId) -> Result<bool> {
    if graph.is_observed(id) {
        return Ok(false);
    }
    if graph.bounds(id).is_some() {
        // Truncation bounds on the target itself have no closed-form conjugate
        // posterior here; fall back to the default sampler's inverse-CDF path.
        return Ok(false);
    }
    if !matches!(graph.kind(id), NodeKind::Stochastic(DistKind::Beta)) {
        return Ok(false);
    }
    for &child in graph.likelihood_children_of(id)? {
        if !matches!(graph.kind(child), NodeKind::Stochastic(DistKind::Binomial)) {
            return Ok(false);
        }
        if !graph.is_observed(child) {
            return Ok(false);
        }
        let parents = graph.parents(child);
        if parents[1] != id {
            return Ok(false);
        }
        if depends_on_target(graph, parents[0], id) {
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
    let prior_alpha = prior_params[0].scalar_view()?;
    let prior_beta = prior_params[1].scalar_view()?;

    let mut trials_sum = 0.0;
    let mut successes_sum = 0.0;
    for &child in graph.likelihood_children_of(id)? {
        let parents = graph.parents(child);
        let n = eval_node(graph, particle, parents[0])?.scalar_view()?;
        let k = graph
            .obs_value(child)
            .expect("checked observed")
            .scalar_view()?;
        trials_sum += n;
        successes_sum += k;
    }

    let post_alpha = prior_alpha + successes_sum;
    let post_beta = prior_beta + trials_sum - successes_sum;

    // Marginal likelihood `p(y) = C(n,k) * B(post_alpha, post_beta) / B(prior_alpha, prior_beta)`,
    // in log space.
    let log_like = log_binomial_coeff_sum(graph, particle, id)?;
    let log_post_norm = log_beta_norm_const(post_alpha, post_beta);
    let log_prior_norm = log_beta_norm_const(prior_alpha, prior_beta);
    let log_incremental_weight = log_like + log_post_norm - log_prior_norm;

    let dist = statrs::distribution::Beta::new(post_alpha, post_beta)
        .map_err(|e| crate::error::EngineError::Distribution(e.to_string()))?;
    let draw = rand::distributions::Distribution::<f64>::sample(&dist, rng);
    particle.set_value(id, Tensor::scalar(draw));
    particle.add_to_log_weight(log_incremental_weight)?;
    Ok(())
}

fn log_beta_norm_const(alpha: f64, beta: f64) -> f64 {
    statrs::function::gamma::ln_gamma(alpha) + statrs::function::gamma::ln_gamma(beta)
        - statrs::function::gamma::ln_gamma(alpha + beta)
}

/// `log C(n_i, k_i)` summed over likelihood children: the part of the
/// binomial density that does not cancel against the beta normalising
/// constants in the predictive weight.
fn log_binomial_coeff_sum(graph: &Graph, particle: &mut Particle, id: NodeId) -> Result<f64> {
    let mut total = 0.0;
    for &child in graph.likelihood_children_of(id)? {
        let parents = graph.parents(child);
        let n = eval_node(graph, particle, parents[0])?.scalar_view()?;
        let k = graph
            .obs_value(child)
            .expect("checked observed")
            .scalar_view()?;
        total += statrs::function::gamma::ln_gamma(n + 1.0)
            - statrs::function::gamma::ln_gamma(k + 1.0)
            - statrs::function::gamma::ln_gamma(n - k + 1.0);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use rand::SeedableRng;

    #[test]
    fn detects_conjugacy_with_observed_binomial_children() {
        let mut g = Graph::new();
        let alpha0 = g.add_constant(Tensor::scalar(1.0)).unwrap();
        let beta0 = g.add_constant(Tensor::scalar(1.0)).unwrap();
        let theta = g.add_stochastic(DistKind::Beta, vec![alpha0, beta0], None).unwrap();
        let n = g.add_constant(Tensor::scalar(10.0)).unwrap();
        let _y = g
            .add_observed(DistKind::Binomial, vec![n, theta], Tensor::scalar(7.0), None)
            .unwrap();
        g.build().unwrap();
        let mut p = Particle::new(g.len());
        assert!(is_applicable(&g, &mut p, theta).unwrap());
    }

    #[test]
    fn posterior_draw_lies_in_unit_interval() {
        let mut g = Graph::new();
        let alpha0 = g.add_constant(Tensor::scalar(1.0)).unwrap();
        let beta0 = g.add_constant(Tensor::scalar(1.0)).unwrap();
        let theta = g.add_stochastic(DistKind::Beta, vec![alpha0, beta0], None).unwrap();
        let n = g.add_constant(Tensor::scalar(10.0)).unwrap();
        let _y = g
            .add_observed(DistKind::Binomial, vec![n, theta], Tensor::scalar(7.0), None)
            .unwrap();
        g.build().unwrap();
        let mut p = Particle::new(g.len());
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        sample(&g, &mut p, theta, &mut rng).unwrap();
        let v = p.value(theta).unwrap().scalar_view().unwrap();
        assert!(v > 0.0 && v < 1.0);
        assert!(p.log_weight().is_finite());
    }
}
