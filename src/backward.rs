//! Backward smoothing over a single-chain hidden state: given the forward
//! sampler's retained filter history `(particles, log_weights)` at every
//! time, and the sequence of state node ids forming a Markov chain, runs
//! the standard particle forward-filtering/backward-smoothing recursion.
//! Grounded on `BackwardSmoother.hpp`'s `Initialize`/`IterateBack` pair.
//!
//! Scope note: the transition density `p(x_t | x_{t-1})` is evaluated by
//! substituting a hypothetical `x_{t-1}` into a scratch copy of a particle
//! at time `t` and re-evaluating the state node's distribution parameters.
//! This assumes the only stochastic influence on `state_nodes[t]` coming
//! from time `t-1` is `state_nodes[t-1]` itself — true of the state-space
//! chains this engine targets, not of arbitrary multi-variable graphs.

use crate::error::{EngineError, Result};
use crate::eval::eval_params;
use crate::graph::{Graph, NodeId, NodeKind};
use crate::monitor::{normalize, Monitor};
use crate::particle::Particle;
use crate::tensor::Tensor;

pub struct BackwardSmoother {
    state_nodes: Vec<NodeId>,
    history: Vec<(Vec<Particle>, Vec<f64>)>,
    smooth_weights: Vec<f64>,
    t: usize,
    initialized: bool,
}

impl BackwardSmoother {
    pub fn new(state_nodes: Vec<NodeId>, history: Vec<(Vec<Particle>, Vec<f64>)>) -> Result<Self> {
        if state_nodes.len() != history.len() {
            return Err(EngineError::Logic(
                "backward smoother requires one state node per retained time step".to_string(),
            ));
        }
        if state_nodes.is_empty() {
            return Err(EngineError::Logic(
                "backward smoother requires at least one time step".to_string(),
            ));
        }
        Ok(BackwardSmoother {
            state_nodes,
            history,
            smooth_weights: Vec::new(),
            t: 0,
            initialized: false,
        })
    }

    /// Starts the backward pass at the last time step, where the smoothing
    /// and filtering distributions coincide.
    pub fn initialize(&mut self) -> Result<()> {
        self.t = self.history.len() - 1;
        let (_, log_w) = &self.history[self.t];
        self.smooth_weights = normalize(log_w);
        self.initialized = true;
        Ok(())
    }

    pub fn time(&self) -> usize {
        self.t
    }

    pub fn at_end(&self) -> bool {
        self.t == 0
    }

    pub fn current_node(&self) -> NodeId {
        self.state_nodes[self.t]
    }

    /// Moves the smoothing weights one time step back, from `t` to `t - 1`.
    pub fn iterate_back(&mut self, graph: &Graph) -> Result<()> {
        if !self.initialized {
            return Err(EngineError::Logic(
                "backward smoother must be initialized before iterating".to_string(),
            ));
        }
        if self.at_end() {
            return Err(EngineError::Logic(
                "backward smoother has already reached the first time step".to_string(),
            ));
        }

        let prev_node = self.state_nodes[self.t - 1];
        let next_node = self.state_nodes[self.t];
        let (prev_particles, prev_log_w) = self.history[self.t - 1].clone();
        let (next_particles, _) = self.history[self.t].clone();
        let prev_filter_w = normalize(&prev_log_w);

        let n_prev = prev_particles.len();
        let n_next = next_particles.len();

        // Transition densities `p(x_next_j | x_prev_i)` for every pair.
        let mut trans = vec![vec![0.0_f64; n_next]; n_prev];
        for (i, p) in prev_particles.iter().enumerate() {
            let prev_value = p
                .value(prev_node)
                .ok_or_else(|| EngineError::Logic("missing retained state value".to_string()))?
                .clone();
            for (j, q) in next_particles.iter().enumerate() {
                trans[i][j] = transition_log_density(graph, &prev_value, prev_node, q, next_node)?.exp();
            }
        }

        let mut denom = vec![0.0_f64; n_next];
        for j in 0..n_next {
            denom[j] = (0..n_prev).map(|i| prev_filter_w[i] * trans[i][j]).sum();
        }

        let mut new_weights = vec![0.0_f64; n_prev];
        for i in 0..n_prev {
            let mut acc = 0.0;
            for j in 0..n_next {
                if denom[j] > 0.0 {
                    acc += self.smooth_weights[j] * trans[i][j] / denom[j];
                }
            }
            new_weights[i] = prev_filter_w[i] * acc;
        }
        let sum: f64 = new_weights.iter().sum();
        if sum <= 0.0 {
            return Err(EngineError::numeric(
                prev_node,
                "backward smoother normalising constant degenerated to zero",
            ));
        }
        for w in &mut new_weights {
            *w /= sum;
        }

        self.smooth_weights = new_weights;
        self.t -= 1;
        Ok(())
    }

    /// The current time step's smoothing distribution, as a [`Monitor`]
    /// (log-weights only; values come straight from the retained particles).
    pub fn monitor(&self) -> Monitor {
        let node = self.state_nodes[self.t];
        let values: Vec<Tensor> = self.history[self.t]
            .0
            .iter()
            .map(|p| p.value(node).expect("state always set").clone())
            .collect();
        let log_weights: Vec<f64> = self.smooth_weights.iter().map(|w| w.ln()).collect();
        Monitor::new(node, self.t, values, log_weights)
    }
}

fn transition_log_density(
    graph: &Graph,
    prev_value: &Tensor,
    prev_node: NodeId,
    next_particle: &Particle,
    next_node: NodeId,
) -> Result<f64> {
    let dist = match graph.kind(next_node) {
        NodeKind::Stochastic(d) => d,
        _ => {
            return Err(EngineError::Logic(
                "backward smoother state nodes must be stochastic".to_string(),
            ))
        }
    };
    let mut scratch = next_particle.clone();
    scratch.reset_values();
    scratch.set_value(prev_node, prev_value.clone());
    let params = eval_params(graph, &mut scratch, next_node)?;
    let views: Vec<_> = params.iter().map(|t| t.as_view()).collect();
    let actual = next_particle
        .value(next_node)
        .expect("forward sampler always sets the state value")
        .clone();
    dist.log_density(actual.as_view(), &views, next_node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::registry::DistKind;
    use crate::rng::RngSplitter;
    use crate::samplers::sample_node;

    fn chain(steps: usize) -> (Graph, Vec<NodeId>) {
        let mut g = Graph::new();
        let mean0 = g.add_constant(Tensor::scalar(0.0)).unwrap();
        let prec0 = g.add_constant(Tensor::scalar(1.0)).unwrap();
        let trans_prec = g.add_constant(Tensor::scalar(4.0)).unwrap();
        let mut nodes = Vec::new();
        let mut prev = g.add_stochastic(DistKind::Norm, vec![mean0, prec0], None).unwrap();
        nodes.push(prev);
        for _ in 0..steps {
            let next = g
                .add_stochastic(DistKind::Norm, vec![prev, trans_prec], None)
                .unwrap();
            nodes.push(next);
            prev = next;
        }
        g.build().unwrap();
        (g, nodes)
    }

    #[test]
    fn backward_pass_produces_normalised_weights_at_every_step() {
        let (g, nodes) = chain(3);
        let n = 100;
        let mut particles: Vec<Particle> = (0..n).map(|_| Particle::new(g.len())).collect();
        let mut splitter = RngSplitter::new(7);
        let mut history = Vec::new();
        for &node in &nodes {
            let mut rngs = splitter.split(n);
            for (p, r) in particles.iter_mut().zip(rngs.iter_mut()) {
                sample_node(&g, p, node, r).unwrap();
            }
            let log_w: Vec<f64> = particles.iter().map(|p| p.log_weight()).collect();
            history.push((particles.clone(), log_w));
        }

        let mut smoother = BackwardSmoother::new(nodes.clone(), history).unwrap();
        smoother.initialize().unwrap();
        while !smoother.at_end() {
            smoother.iterate_back(&g).unwrap();
            let m = smoother.monitor();
            let total: f64 = m.normalized_weights().iter().sum();
            assert!((total - 1.0).abs() < 1e-8);
        }
    }
}
