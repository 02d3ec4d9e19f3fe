//! Normal/multivariate-normal conjugacy: `target ~ dmnorm(mean0, prec0)`,
//! each likelihood child `y_i ~ dmnorm(target, prec_i)` with `target`
//! appearing directly (not through an affine transform) as the child's
//! mean and `prec_i` not a function of `target`. Grounded on
//! `ConjugateNormal.cpp`'s vector/matrix specialisation; the direct-mean
//! restriction (vs. the scalar sampler's affine generalisation) is recorded
//! as an open decision in the design ledger.

use ndarray::{Array1, Array2, ShapeBuilder};
use rand::Rng;

use crate::error::Result;
use crate::eval::{eval_node, eval_params};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::linalg::{cholesky_lower, solve_upper_transpose};
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
    if !matches!(graph.kind(id), NodeKind::Stochastic(DistKind::MNorm)) {
        return Ok(false);
    }
    for &child in graph.likelihood_children_of(id)? {
        if !matches!(graph.kind(child), NodeKind::Stochastic(DistKind::MNorm)) {
            return Ok(false);
        }
        if !graph.is_observed(child) {
            return Ok(false);
        }
        let parents = graph.parents(child);
        if parents[0] != id {
            return Ok(false);
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

fn as_matrix(t: &Tensor, n: usize) -> Result<Array2<f64>> {
    Array2::from_shape_vec((n, n).f(), t.values().to_vec())
        .map_err(|e| crate::error::EngineError::Dimension(e.to_string()))
}

pub fn sample<R: Rng + ?Sized>(
    graph: &Graph,
    particle: &mut Particle,
    id: NodeId,
    rng: &mut R,
) -> Result<()> {
    let prior_params = eval_params(graph, particle, id)?;
    let n = prior_params[0].values().len();
    let prior_mean = Array1::from_vec(prior_params[0].values().to_vec());
    let mut post_prec = as_matrix(&prior_params[1], n)?;
    let mut post_mean_contrib = post_prec.dot(&prior_mean);

    let mut log_prior_predictive = 0.0;
    for &child in graph.likelihood_children_of(id)? {
        let parents = graph.parents(child);
        let prec_i_tensor = eval_node(graph, particle, parents[1])?;
        let prec_i = as_matrix(&prec_i_tensor, n)?;
        let y = Array1::from_vec(
            graph
                .obs_value(child)
                .expect("checked observed")
                .values()
                .to_vec(),
        );

        let pre_mean = solve_posterior_mean(&post_prec, &post_mean_contrib, id)?;
        let diff = &y - &pre_mean;
        let pred_prec = invert(&post_prec, &prec_i, id)?;
        let chol = cholesky_lower(&pred_prec, id)?;
        log_prior_predictive += crate::linalg::mvnormal_log_density_centered(&diff, &chol);

        post_prec = post_prec + &prec_i;
        post_mean_contrib = post_mean_contrib + prec_i.dot(&y);
    }

    let post_mean = solve_posterior_mean(&post_prec, &post_mean_contrib, id)?;
    let chol = cholesky_lower(&post_prec, id)?;
    let z: Array1<f64> = {
        let std_normal = statrs::distribution::Normal::new(0.0, 1.0).expect("valid");
        (0..n)
            .map(|_| rand::distributions::Distribution::<f64>::sample(&std_normal, rng))
            .collect()
    };
    let deviate = solve_upper_transpose(&chol, &z);
    let draw = post_mean + deviate;
    particle.set_value(id, Tensor::vector(draw.to_vec()));
    particle.add_to_log_weight(log_prior_predictive)?;
    Ok(())
}

/// Solves `post_prec * mean = post_mean_contrib` via the precision matrix's
/// Cholesky factor.
fn solve_posterior_mean(post_prec: &Array2<f64>, contrib: &Array1<f64>, node: NodeId) -> Result<Array1<f64>> {
    let chol = cholesky_lower(post_prec, node)?;
    let n = contrib.len();
    let mut w = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = contrib[i];
        for k in 0..i {
            sum -= chol[[i, k]] * w[k];
        }
        w[i] = sum / chol[[i, i]];
    }
    Ok(solve_upper_transpose(&chol, &w))
}

/// Precision of the predictive distribution `y | data_so_far`, i.e. the
/// harmonic combination `(post_prec^-1 + prec_i^-1)^-1`, computed from the
/// two precision matrices directly.
fn invert(post_prec: &Array2<f64>, prec_i: &Array2<f64>, node: NodeId) -> Result<Array2<f64>> {
    let n = post_prec.nrows();
    let post_cov = invert_matrix(post_prec, node)?;
    let obs_cov = invert_matrix(prec_i, node)?;
    let combined_cov = post_cov + obs_cov;
    invert_matrix(&combined_cov, node).map(|m| {
        debug_assert_eq!(m.nrows(), n);
        m
    })
}

fn invert_matrix(mat: &Array2<f64>, node: NodeId) -> Result<Array2<f64>> {
    let n = mat.nrows();
    let chol = cholesky_lower(mat, node)?;
    let mut inv = Array2::<f64>::zeros((n, n));
    for col in 0..n {
        let mut e = Array1::<f64>::zeros(n);
        e[col] = 1.0;
        let mut w = Array1::<f64>::zeros(n);
        for i in 0..n {
            let mut sum = e[i];
            for k in 0..i {
                sum -= chol[[i, k]] * w[k];
            }
            w[i] = sum / chol[[i, i]];
        }
        let x = solve_upper_transpose(&chol, &w);
        for row in 0..n {
            inv[[row, col]] = x[row];
        }
    }
    Ok(inv)
}
