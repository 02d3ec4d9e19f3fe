//! The fallback node sampler: sample a latent node from its prior, or score
//! an observed node's fixed value against its density. Every node type is
//! handled by this sampler; conjugate samplers exist only to replace it
//! where a closed-form posterior is available. Grounded on the generic
//! branch of `NodeSampler::sample` / `SMCSampler::moveParticle`.

use rand::Rng;

use crate::error::Result;
use crate::eval::{eval_node, eval_params};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::particle::Particle;
use crate::tensor::Tensor;

/// Log density of an already-observed node's fixed value under its own
/// distribution (truncated to its bounds, if any), recorded into `particle`'s
/// cache as a side effect. Shared between scoring a standalone observed node
/// and folding a latent node's likelihood children into its own weight.
fn observed_log_density(graph: &Graph, particle: &mut Particle, id: NodeId) -> Result<f64> {
    let dist = match graph.kind(id) {
        NodeKind::Stochastic(d) => d,
        _ => {
            return Err(crate::error::EngineError::Logic(
                "observed_log_density only applies to stochastic nodes".to_string(),
            ))
        }
    };
    let params = eval_params(graph, particle, id)?;
    let views: Vec<_> = params.iter().map(|t| t.as_view()).collect();
    let value = graph
        .obs_value(id)
        .expect("observed node carries an obs_value")
        .clone();
    let mut ld = dist.log_density(value.as_view(), &views, id)?;
    if let Some((lo, hi)) = graph.bounds(id) {
        let (lo, hi) = (
            eval_node(graph, particle, lo)?.scalar_view()?,
            eval_node(graph, particle, hi)?.scalar_view()?,
        );
        let mass = dist.cdf(hi, &views)? - dist.cdf(lo, &views)?;
        ld -= mass.ln();
    }
    particle.set_value(id, value);
    Ok(ld)
}

pub fn sample<R: Rng + ?Sized>(
    graph: &Graph,
    particle: &mut Particle,
    id: NodeId,
    rng: &mut R,
) -> Result<()> {
    if graph.is_observed(id) {
        let ld = observed_log_density(graph, particle, id)?;
        particle.add_to_log_weight(ld)?;
        return Ok(());
    }

    let dist = match graph.kind(id) {
        NodeKind::Stochastic(d) => d,
        _ => {
            return Err(crate::error::EngineError::Logic(
                "default sampler only applies to stochastic nodes".to_string(),
            ))
        }
    };
    let params = eval_params(graph, particle, id)?;
    let views: Vec<_> = params.iter().map(|t| t.as_view()).collect();
    let bounds = graph.bounds(id);
    let value = match bounds {
        Some((lo, hi)) => {
            let lo = eval_node(graph, particle, lo)?.scalar_view()?;
            let hi = eval_node(graph, particle, hi)?.scalar_view()?;
            let p_lo = dist.cdf(lo, &views)?;
            let p_hi = dist.cdf(hi, &views)?;
            let u = p_lo + rng.gen::<f64>() * (p_hi - p_lo);
            Tensor::scalar(dist.quantile(u, &views)?)
        }
        None => dist.sample(&views, rng, id)?,
    };
    particle.set_value(id, value);

    // This is the prior-proposal (bootstrap) weight update: the sampled
    // value came from the prior, so the incremental weight is the predictive
    // density of every observed descendant it drives, exactly mirroring what
    // the conjugate samplers compute from their closed-form posteriors.
    for &child in graph.likelihood_children_of(id)? {
        let ld = observed_log_density(graph, particle, child)?;
        particle.add_to_log_weight(ld)?;
    }
    Ok(())
}
