//! Node samplers: conjugacy-aware closed-form posteriors where the local
//! graph structure permits one, falling back to prior sampling / density
//! scoring otherwise. Grounded on `BuildNodeSamplers`' fixed-priority
//! factory list in `SMCSampler.cpp` — each candidate is tried in a fixed
//! order and the first applicable one wins, with the default sampler as a
//! catch-all at the end.

mod conjugate_beta;
mod conjugate_mnormal;
mod conjugate_normal;
mod conjugate_normal_var_linear;
mod default;
pub mod linear;

use rand::Rng;
use tracing::trace;

use crate::error::Result;
use crate::graph::{Graph, NodeId};
use crate::particle::Particle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerKind {
    ConjugateNormal,
    ConjugateMNormal,
    ConjugateNormalVarLinear,
    ConjugateBeta,
    Default,
}

/// Picks the first applicable sampler for `id` in fixed priority order.
pub fn select(graph: &Graph, particle: &mut Particle, id: NodeId) -> Result<SamplerKind> {
    if conjugate_normal::is_applicable(graph, particle, id)? {
        return Ok(SamplerKind::ConjugateNormal);
    }
    if conjugate_mnormal::is_applicable(graph, particle, id)? {
        return Ok(SamplerKind::ConjugateMNormal);
    }
    if conjugate_normal_var_linear::is_applicable(graph, particle, id)? {
        return Ok(SamplerKind::ConjugateNormalVarLinear);
    }
    if conjugate_beta::is_applicable(graph, particle, id)? {
        return Ok(SamplerKind::ConjugateBeta);
    }
    Ok(SamplerKind::Default)
}

impl SamplerKind {
    pub fn sample<R: Rng + ?Sized>(
        &self,
        graph: &Graph,
        particle: &mut Particle,
        id: NodeId,
        rng: &mut R,
    ) -> Result<()> {
        match self {
            SamplerKind::ConjugateNormal => conjugate_normal::sample(graph, particle, id, rng),
            SamplerKind::ConjugateMNormal => conjugate_mnormal::sample(graph, particle, id, rng),
            SamplerKind::ConjugateNormalVarLinear => {
                conjugate_normal_var_linear::sample(graph, particle, id, rng)
            }
            SamplerKind::ConjugateBeta => conjugate_beta::sample(graph, particle, id, rng),
            SamplerKind::Default => default::sample(graph, particle, id, rng),
        }
    }
}

/// Samples `id`'s value into `particle`, choosing a sampler each time
/// (bounded stochastic parents can make a node's conjugacy status depend on
/// values sampled earlier in this same particle's trajectory, per node).
pub fn sample_node<R: Rng + ?Sized>(
    graph: &Graph,
    particle: &mut Particle,
    id: NodeId,
    rng: &mut R,
) -> Result<()> {
    let kind = select(graph, particle, id)?;
    trace!(node = id, sampler = ?kind, "sampling node");
    kind.sample(graph, particle, id, rng)
}
