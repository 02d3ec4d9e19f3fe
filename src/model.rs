//! Top-level inference API: owns the graph, the forward sampler, the
//! backward smoother, and the monitor records collected along the way.
//! Grounded on `Model.hpp`'s public surface, minus the BUGS-parsing and
//! file-I/O pieces that belong to `Console` rather than the inference core.

use std::collections::HashMap;

use tracing::info;

use crate::backward::BackwardSmoother;
use crate::error::{EngineError, Result};
use crate::forward::ForwardSampler;
use crate::graph::{Graph, NodeId};
use crate::monitor::{
    weighted_central_moment, weighted_histogram, weighted_kurtosis, weighted_mean_tensor,
    weighted_mean_variance, weighted_quantile, weighted_skewness, weighted_sum, Histogram, Monitor,
    StatTag,
};
use crate::resample::ResamplingMode;
use crate::rng::RngSplitter;
use crate::tensor::Tensor;

pub struct Model {
    graph: Graph,
    sampler: Option<ForwardSampler>,
    rng_splitter: Option<RngSplitter>,
    backward: Option<BackwardSmoother>,
    filter_monitor_nodes: Vec<NodeId>,
    filter_monitors: HashMap<NodeId, Vec<Monitor>>,
    backward_smooth_monitors: HashMap<NodeId, Monitor>,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn new() -> Self {
        Model {
            graph: Graph::new(),
            sampler: None,
            rng_splitter: None,
            backward: None,
            filter_monitor_nodes: Vec::new(),
            filter_monitors: HashMap::new(),
            backward_smooth_monitors: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn build_graph(&mut self) -> Result<()> {
        self.graph.build()
    }

    /// Registers `id` for filter monitoring. Silently rejects observed
    /// nodes (their value is fixed data, not something to summarise) by
    /// returning `Ok(false)`, matching `Model::SetFilterMonitor`.
    pub fn set_filter_monitor(&mut self, id: NodeId) -> Result<bool> {
        self.graph.require_built()?;
        if self.graph.is_observed(id) {
            return Ok(false);
        }
        if !self.filter_monitor_nodes.contains(&id) {
            self.filter_monitor_nodes.push(id);
        }
        Ok(true)
    }

    pub fn build_sampler(
        &mut self,
        n_particles: usize,
        seed: u64,
        resampling_mode: ResamplingMode,
        ess_threshold: f64,
        retain_history: bool,
    ) -> Result<()> {
        self.graph.require_built()?;
        info!(n_particles, seed, ess_threshold, retain_history, "building forward sampler");
        self.sampler = Some(ForwardSampler::initialize(
            &self.graph,
            n_particles,
            seed,
            resampling_mode,
            ess_threshold,
            retain_history,
        )?);
        self.rng_splitter = Some(RngSplitter::new(seed));
        self.filter_monitors.clear();
        Ok(())
    }

    pub fn at_end(&self) -> Result<bool> {
        Ok(self.sampler()?.at_end())
    }

    pub fn ess(&self) -> Result<f64> {
        Ok(self.sampler()?.ess())
    }

    pub fn log_norm_const(&self) -> Result<f64> {
        Ok(self.sampler()?.log_norm_const())
    }

    fn sampler(&self) -> Result<&ForwardSampler> {
        self.sampler.as_ref().ok_or_else(|| {
            EngineError::Logic("forward sampler has not been built yet".to_string())
        })
    }

    /// Advances the forward sampler one group and records any watched
    /// node's value/weight for this time step.
    pub fn iterate_sampler(&mut self) -> Result<()> {
        let time = self
            .sampler
            .as_ref()
            .ok_or_else(|| EngineError::Logic("forward sampler has not been built yet".to_string()))?
            .time();
        let group = self
            .sampler
            .as_ref()
            .unwrap()
            .current_group()
            .map(|g| g.to_vec())
            .unwrap_or_default();

        {
            let sampler = self.sampler.as_mut().ok_or_else(|| {
                EngineError::Logic("forward sampler has not been built yet".to_string())
            })?;
            let splitter = self
                .rng_splitter
                .as_mut()
                .expect("rng splitter is set alongside the sampler");
            sampler.iterate(&self.graph, splitter)?;
        }

        let sampler = self.sampler.as_ref().unwrap();
        for &node in &self.filter_monitor_nodes {
            if group.contains(&node) {
                let values: Vec<Tensor> = sampler
                    .particles()
                    .iter()
                    .map(|p| p.value(node).expect("just sampled").clone())
                    .collect();
                let log_weights: Vec<f64> = sampler.particles().iter().map(|p| p.log_weight()).collect();
                self.filter_monitors
                    .entry(node)
                    .or_default()
                    .push(Monitor::new(node, time, values, log_weights));
            }
        }
        Ok(())
    }

    pub fn run_forward_sampler(&mut self) -> Result<()> {
        while !self.at_end()? {
            self.iterate_sampler()?;
        }
        Ok(())
    }

    pub fn filter_monitors(&self, node: NodeId) -> Option<&[Monitor]> {
        self.filter_monitors.get(&node).map(|v| v.as_slice())
    }

    pub fn clear_filter_monitors(&mut self) {
        self.filter_monitors.clear();
    }

    /// Starts a backward smoothing pass over `state_nodes`, a Markov chain
    /// of stochastic nodes one per forward-sampler time step, using the
    /// forward sampler's retained pre-resample history.
    pub fn init_backward_smoother(&mut self, state_nodes: Vec<NodeId>) -> Result<()> {
        let history = self
            .sampler()?
            .history()
            .ok_or_else(|| {
                EngineError::Logic(
                    "forward sampler was not built with retain_history=true".to_string(),
                )
            })?
            .to_vec();
        let mut smoother = BackwardSmoother::new(state_nodes, history)?;
        smoother.initialize()?;
        self.backward_smooth_monitors.clear();
        let m = smoother.monitor();
        self.backward_smooth_monitors.insert(m.node, m);
        self.backward = Some(smoother);
        Ok(())
    }

    pub fn iterate_backward_smoother(&mut self) -> Result<()> {
        let smoother = self.backward.as_mut().ok_or_else(|| {
            EngineError::Logic("backward smoother has not been initialized".to_string())
        })?;
        smoother.iterate_back(&self.graph)?;
        let m = smoother.monitor();
        self.backward_smooth_monitors.insert(m.node, m);
        Ok(())
    }

    pub fn backward_smoother_at_end(&self) -> Result<bool> {
        Ok(self
            .backward
            .as_ref()
            .ok_or_else(|| EngineError::Logic("backward smoother has not been initialized".to_string()))?
            .at_end())
    }

    pub fn run_backward_smoother(&mut self, state_nodes: Vec<NodeId>) -> Result<()> {
        info!(n_steps = state_nodes.len(), "running backward smoother");
        self.init_backward_smoother(state_nodes)?;
        while !self.backward_smoother_at_end()? {
            self.iterate_backward_smoother()?;
        }
        Ok(())
    }

    pub fn backward_smooth_monitor(&self, node: NodeId) -> Option<&Monitor> {
        self.backward_smooth_monitors.get(&node)
    }

    pub fn extract_filter_stat(&self, node: NodeId, stat: StatTag, quantile: Option<f64>) -> Result<f64> {
        let monitors = self.filter_monitors(node).ok_or_else(|| {
            EngineError::Logic(format!("node {} is not filter-monitored", node))
        })?;
        let latest = monitors
            .last()
            .ok_or_else(|| EngineError::Logic("monitor has no recorded iterations".to_string()))?;
        match stat {
            StatTag::Sum => weighted_sum(latest),
            StatTag::Mean => Ok(weighted_mean_variance(latest)?.0),
            StatTag::Variance => Ok(weighted_mean_variance(latest)?.1),
            StatTag::Moment2 => weighted_central_moment(latest, 2),
            StatTag::Moment3 => weighted_central_moment(latest, 3),
            StatTag::Moment4 => weighted_central_moment(latest, 4),
            StatTag::Skewness => weighted_skewness(latest),
            StatTag::Kurtosis => weighted_kurtosis(latest),
            StatTag::Quantile => weighted_quantile(
                latest,
                quantile.ok_or_else(|| EngineError::Logic("quantile stat requires a probability".to_string()))?,
            ),
        }
    }

    pub fn extract_filter_mean_tensor(&self, node: NodeId) -> Result<Tensor> {
        let monitors = self.filter_monitors(node).ok_or_else(|| {
            EngineError::Logic(format!("node {} is not filter-monitored", node))
        })?;
        let latest = monitors
            .last()
            .ok_or_else(|| EngineError::Logic("monitor has no recorded iterations".to_string()))?;
        weighted_mean_tensor(latest)
    }

    pub fn extract_filter_pdf(&self, node: NodeId, num_bins: usize, cache_fraction: f64) -> Result<Histogram> {
        let monitors = self.filter_monitors(node).ok_or_else(|| {
            EngineError::Logic(format!("node {} is not filter-monitored", node))
        })?;
        let latest = monitors
            .last()
            .ok_or_else(|| EngineError::Logic("monitor has no recorded iterations".to_string()))?;
        weighted_histogram(latest, num_bins, cache_fraction)
    }
}

/// Default bin count for [`Model::extract_filter_pdf`], matching the
/// reference console's default.
pub const DEFAULT_NUM_BINS: usize = 40;
/// Default reservoir fraction for [`Model::extract_filter_pdf`].
pub const DEFAULT_CACHE_FRACTION: f64 = 0.25;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DistKind;

    #[test]
    fn linear_gaussian_filter_mean_tracks_observation() {
        let mut model = Model::new();
        let mean0 = model.graph_mut().add_constant(Tensor::scalar(0.0)).unwrap();
        let prec0 = model.graph_mut().add_constant(Tensor::scalar(0.01)).unwrap();
        let obs_prec = model.graph_mut().add_constant(Tensor::scalar(100.0)).unwrap();
        let theta = model
            .graph_mut()
            .add_stochastic(DistKind::Norm, vec![mean0, prec0], None)
            .unwrap();
        let _y = model
            .graph_mut()
            .add_observed(DistKind::Norm, vec![theta, obs_prec], Tensor::scalar(5.0), None)
            .unwrap();
        model.build_graph().unwrap();
        model.set_filter_monitor(theta).unwrap();
        model
            .build_sampler(500, 123, ResamplingMode::Systematic, 0.2, false)
            .unwrap();
        model.run_forward_sampler().unwrap();
        let mean = model.extract_filter_stat(theta, StatTag::Mean, None).unwrap();
        assert!((mean - 5.0).abs() < 0.5);
    }

    /// Exact Kalman recursion for a scalar linear-Gaussian HMM with an
    /// identity transition, used as the reference the particle filter's
    /// filtering mean and log normalising constant are checked against.
    fn kalman_1d(mean0: f64, var0: f64, trans_var: f64, obs_var: f64, obs: &[f64]) -> (Vec<f64>, f64) {
        let mut mean = mean0;
        let mut var = var0;
        let mut means = Vec::with_capacity(obs.len());
        let mut log_marginal = 0.0;
        for &y in obs {
            let pred_mean = mean;
            let pred_var = var + trans_var;
            let innovation_var = pred_var + obs_var;
            log_marginal += -0.5
                * ((y - pred_mean).powi(2) / innovation_var
                    + innovation_var.ln()
                    + (2.0 * std::f64::consts::PI).ln());
            let post_prec = 1.0 / pred_var + 1.0 / obs_var;
            let post_var = 1.0 / post_prec;
            let post_mean = post_var * (pred_mean / pred_var + y / obs_var);
            mean = post_mean;
            var = post_var;
            means.push(mean);
        }
        (means, log_marginal)
    }

    #[test]
    fn linear_gaussian_1d_matches_kalman_reference() {
        let mean0 = 0.0;
        let var0 = 1.0;
        let trans_var = 0.25;
        let obs_var = 1.0 / 9.0;
        let obs = [0.3, 0.6, 0.5, 0.8];
        let (kalman_means, kalman_log_marginal) = kalman_1d(mean0, var0, trans_var, obs_var, &obs);

        let mut model = Model::new();
        let mean0_n = model.graph_mut().add_constant(Tensor::scalar(mean0)).unwrap();
        let prec0_n = model.graph_mut().add_constant(Tensor::scalar(1.0 / var0)).unwrap();
        let trans_prec_n = model.graph_mut().add_constant(Tensor::scalar(1.0 / trans_var)).unwrap();
        let obs_prec_n = model.graph_mut().add_constant(Tensor::scalar(1.0 / obs_var)).unwrap();
        let mut prev = model
            .graph_mut()
            .add_stochastic(DistKind::Norm, vec![mean0_n, prec0_n], None)
            .unwrap();
        let mut states = Vec::new();
        for &y in &obs {
            let next = model
                .graph_mut()
                .add_stochastic(DistKind::Norm, vec![prev, trans_prec_n], None)
                .unwrap();
            model
                .graph_mut()
                .add_observed(DistKind::Norm, vec![next, obs_prec_n], Tensor::scalar(y), None)
                .unwrap();
            states.push(next);
            prev = next;
        }
        model.build_graph().unwrap();
        for &s in &states {
            model.set_filter_monitor(s).unwrap();
        }
        model
            .build_sampler(10_000, 99, ResamplingMode::Systematic, 0.2, false)
            .unwrap();
        model.run_forward_sampler().unwrap();

        let mut sq_err = 0.0;
        for (&s, &km) in states.iter().zip(&kalman_means) {
            let mean = model.extract_filter_stat(s, StatTag::Mean, None).unwrap();
            sq_err += (mean - km).powi(2);
        }
        let mse = sq_err / states.len() as f64;
        assert!(mse < 0.01, "mse {mse} too large against kalman reference");
        assert!((model.log_norm_const().unwrap() - kalman_log_marginal).abs() < 0.5);
    }

    #[test]
    fn linear_gaussian_4d_matches_kalman_reference_per_dimension() {
        let mean0 = vec![0.0, 1.0, -1.0, 2.0];
        let var0 = 1.0;
        let trans_var = 0.25;
        let obs_var = 0.2;
        let obs = [
            vec![0.2, 0.9, -0.8, 2.1],
            vec![0.4, 0.7, -1.1, 1.9],
            vec![0.1, 1.0, -0.9, 2.2],
        ];
        let kalman_means: Vec<Vec<f64>> = (0..4)
            .map(|d| {
                let series: Vec<f64> = obs.iter().map(|o| o[d]).collect();
                kalman_1d(mean0[d], var0, trans_var, obs_var, &series).0
            })
            .collect();

        let mut model = Model::new();
        let mean0_n = model
            .graph_mut()
            .add_constant(Tensor::vector(mean0.clone()))
            .unwrap();
        let prec0_n = model
            .graph_mut()
            .add_constant(Tensor::matrix(4, 4, diag(1.0 / var0, 4)).unwrap())
            .unwrap();
        let trans_prec_n = model
            .graph_mut()
            .add_constant(Tensor::matrix(4, 4, diag(1.0 / trans_var, 4)).unwrap())
            .unwrap();
        let obs_prec_n = model
            .graph_mut()
            .add_constant(Tensor::matrix(4, 4, diag(1.0 / obs_var, 4)).unwrap())
            .unwrap();
        let mut prev = model
            .graph_mut()
            .add_stochastic(DistKind::MNorm, vec![mean0_n, prec0_n], None)
            .unwrap();
        let mut states = Vec::new();
        for y in &obs {
            let next = model
                .graph_mut()
                .add_stochastic(DistKind::MNorm, vec![prev, trans_prec_n], None)
                .unwrap();
            model
                .graph_mut()
                .add_observed(DistKind::MNorm, vec![next, obs_prec_n], Tensor::vector(y.clone()), None)
                .unwrap();
            states.push(next);
            prev = next;
        }
        model.build_graph().unwrap();
        for &s in &states {
            model.set_filter_monitor(s).unwrap();
        }
        model
            .build_sampler(10_000, 17, ResamplingMode::Systematic, 0.2, false)
            .unwrap();
        model.run_forward_sampler().unwrap();

        let final_state = *states.last().unwrap();
        let mean_tensor = model.extract_filter_mean_tensor(final_state).unwrap();
        let mut sq_err = 0.0;
        for (d, km) in kalman_means.iter().map(|s| *s.last().unwrap()).enumerate() {
            sq_err += (mean_tensor.values()[d] - km).powi(2);
        }
        let mse = sq_err / 4.0;
        assert!(mse < 0.05, "per-dimension mse {mse} too large against kalman reference");
    }

    fn diag(value: f64, n: usize) -> Vec<f64> {
        let mut m = vec![0.0; n * n];
        for i in 0..n {
            m[i + i * n] = value;
        }
        m
    }

    #[test]
    fn beta_binomial_chain_matches_analytic_posterior_mean() {
        let mut model = Model::new();
        let alpha0 = model.graph_mut().add_constant(Tensor::scalar(2.0)).unwrap();
        let beta0 = model.graph_mut().add_constant(Tensor::scalar(2.0)).unwrap();
        let theta = model
            .graph_mut()
            .add_stochastic(DistKind::Beta, vec![alpha0, beta0], None)
            .unwrap();
        let n = model.graph_mut().add_constant(Tensor::scalar(10.0)).unwrap();
        let successes = [6.0, 5.0, 4.0, 5.0, 5.0];
        for &k in &successes {
            model
                .graph_mut()
                .add_observed(DistKind::Binomial, vec![n, theta], Tensor::scalar(k), None)
                .unwrap();
        }
        model.build_graph().unwrap();
        model.set_filter_monitor(theta).unwrap();
        model
            .build_sampler(10_000, 5, ResamplingMode::Systematic, 0.2, false)
            .unwrap();
        model.run_forward_sampler().unwrap();

        let post_alpha = 2.0 + successes.iter().sum::<f64>();
        let post_beta = 2.0 + successes.len() as f64 * 10.0 - successes.iter().sum::<f64>();
        let analytic_mean = post_alpha / (post_alpha + post_beta);
        let mean = model.extract_filter_stat(theta, StatTag::Mean, None).unwrap();
        assert!((mean - analytic_mean).abs() < 0.005);
    }

    #[test]
    fn histogram_pdf_of_standard_normal_integrates_to_one_with_centered_mode() {
        let mut model = Model::new();
        let mean0 = model.graph_mut().add_constant(Tensor::scalar(0.0)).unwrap();
        let prec0 = model.graph_mut().add_constant(Tensor::scalar(1.0)).unwrap();
        let theta = model
            .graph_mut()
            .add_stochastic(DistKind::Norm, vec![mean0, prec0], None)
            .unwrap();
        model.build_graph().unwrap();
        model.set_filter_monitor(theta).unwrap();
        model
            .build_sampler(10_000, 31, ResamplingMode::Systematic, 0.2, false)
            .unwrap();
        model.run_forward_sampler().unwrap();

        let hist = model.extract_filter_pdf(theta, DEFAULT_NUM_BINS, DEFAULT_CACHE_FRACTION).unwrap();
        let total: f64 = hist.bin_mass.iter().sum();
        assert!((total - 1.0).abs() < 0.01);

        let (peak_bin, _) = hist
            .bin_mass
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .unwrap();
        let peak_center = (hist.bin_edges[peak_bin] + hist.bin_edges[peak_bin + 1]) / 2.0;
        assert!((-0.2..=0.2).contains(&peak_center), "mode {peak_center} not centered");
    }

    #[test]
    fn set_filter_monitor_rejects_observed_nodes() {
        let mut model = Model::new();
        let mean0 = model.graph_mut().add_constant(Tensor::scalar(0.0)).unwrap();
        let prec0 = model.graph_mut().add_constant(Tensor::scalar(1.0)).unwrap();
        let y = model
            .graph_mut()
            .add_observed(DistKind::Norm, vec![mean0, prec0], Tensor::scalar(0.0), None)
            .unwrap();
        model.build_graph().unwrap();
        assert!(!model.set_filter_monitor(y).unwrap());
    }
}
