//! Weighted particle records kept for a monitored node, and the statistical
//! accumulators used to turn them into summaries. Grounded on Biips'
//! `Monitor` (the raw per-iteration (value, weight) record, needed again
//! later by the backward smoother) and its `Accumulator`/`DensityAccumulator`
//! family (`ExtractFilterStat`/`ExtractFilterPdf`).

use bisection::bisect_left;
use ordered_float::OrderedFloat;

use crate::error::Result;
use crate::graph::NodeId;
use crate::tensor::Tensor;

/// One iteration's worth of (value, log-weight) pairs recorded for a single
/// node. Filter monitors keep one of these per iteration so the backward
/// smoother can revisit them; gen-tree and backward-smooth monitors keep
/// only the current one.
#[derive(Clone)]
pub struct Monitor {
    pub node: NodeId,
    pub iteration: usize,
    pub values: Vec<Tensor>,
    pub log_weights: Vec<f64>,
}

impl Monitor {
    pub fn new(node: NodeId, iteration: usize, values: Vec<Tensor>, log_weights: Vec<f64>) -> Self {
        Monitor {
            node,
            iteration,
            values,
            log_weights,
        }
    }

    /// Weights normalised to sum to one, via the usual max-subtraction for
    /// numerical stability.
    pub fn normalized_weights(&self) -> Vec<f64> {
        normalize(&self.log_weights)
    }

    pub fn n_particles(&self) -> usize {
        self.values.len()
    }
}

pub fn normalize(log_weights: &[f64]) -> Vec<f64> {
    let max = log_weights.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = log_weights.iter().map(|w| (w - max).exp()).collect();
    let sum: f64 = exp.iter().sum();
    exp.iter().map(|e| e / sum).collect()
}

/// Requested summary statistic, mirroring `StatTag` in the console API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatTag {
    Sum,
    Mean,
    Variance,
    Moment2,
    Moment3,
    Moment4,
    Skewness,
    Kurtosis,
    Quantile,
}

/// The power sums `sum(w*x^k)` for `k` in `0..=4`, plus the raw (unweighted)
/// sum of values — the single pass every moment-based statistic below is
/// derived from, mirroring Biips' `ScalarAccumulator`.
struct PowerSums {
    raw_sum: f64,
    sum_w: f64,
    sum_wx: f64,
    sum_wx2: f64,
    sum_wx3: f64,
    sum_wx4: f64,
}

fn power_sums(monitor: &Monitor) -> Result<PowerSums> {
    let weights = monitor.normalized_weights();
    let mut acc = PowerSums {
        raw_sum: 0.0,
        sum_w: 0.0,
        sum_wx: 0.0,
        sum_wx2: 0.0,
        sum_wx3: 0.0,
        sum_wx4: 0.0,
    };
    for (value, &w) in monitor.values.iter().zip(&weights) {
        let x = value.scalar_view()?;
        acc.raw_sum += x;
        acc.sum_w += w;
        acc.sum_wx += w * x;
        acc.sum_wx2 += w * x * x;
        acc.sum_wx3 += w * x * x * x;
        acc.sum_wx4 += w * x * x * x * x;
    }
    Ok(acc)
}

/// Weighted scalar mean and variance, via a single pass accumulating
/// `sum(w)`, `sum(w*x)`, `sum(w*x^2)` (the power-sum form Biips'
/// `ScalarAccumulator` uses, avoiding a second pass over the particles).
pub fn weighted_mean_variance(monitor: &Monitor) -> Result<(f64, f64)> {
    let sums = power_sums(monitor)?;
    let mean = sums.sum_wx / sums.sum_w;
    let var = sums.sum_wx2 / sums.sum_w - mean * mean;
    Ok((mean, var.max(0.0)))
}

/// The raw (unweighted) sum of a monitored node's recorded values.
pub fn weighted_sum(monitor: &Monitor) -> Result<f64> {
    Ok(power_sums(monitor)?.raw_sum)
}

/// The `k`-th central moment (`k` in `2..=4`), derived from the power sums
/// via the standard binomial expansion around the weighted mean.
pub fn weighted_central_moment(monitor: &Monitor, k: u32) -> Result<f64> {
    let sums = power_sums(monitor)?;
    let mean = sums.sum_wx / sums.sum_w;
    let raw2 = sums.sum_wx2 / sums.sum_w;
    let raw3 = sums.sum_wx3 / sums.sum_w;
    let raw4 = sums.sum_wx4 / sums.sum_w;
    let moment = match k {
        2 => raw2 - mean * mean,
        3 => raw3 - 3.0 * mean * raw2 + 2.0 * mean.powi(3),
        4 => raw4 - 4.0 * mean * raw3 + 6.0 * mean * mean * raw2 - 3.0 * mean.powi(4),
        _ => {
            return Err(crate::error::EngineError::Logic(format!(
                "central moment order {} is not supported",
                k
            )))
        }
    };
    Ok(moment)
}

/// Weighted skewness: the third central moment normalised by the variance's
/// `3/2` power.
pub fn weighted_skewness(monitor: &Monitor) -> Result<f64> {
    let m2 = weighted_central_moment(monitor, 2)?.max(0.0);
    let m3 = weighted_central_moment(monitor, 3)?;
    Ok(m3 / m2.powf(1.5))
}

/// Weighted (non-excess) kurtosis: the fourth central moment normalised by
/// the squared variance.
pub fn weighted_kurtosis(monitor: &Monitor) -> Result<f64> {
    let m2 = weighted_central_moment(monitor, 2)?.max(0.0);
    let m4 = weighted_central_moment(monitor, 4)?;
    Ok(m4 / (m2 * m2))
}

/// Elementwise weighted mean for a tensor-valued (vector/matrix) node.
pub fn weighted_mean_tensor(monitor: &Monitor) -> Result<Tensor> {
    let weights = monitor.normalized_weights();
    let shape = monitor.values[0].shape().to_vec();
    let n = monitor.values[0].len();
    let mut acc = vec![0.0; n];
    for (value, &w) in monitor.values.iter().zip(&weights) {
        for (a, &x) in acc.iter_mut().zip(value.values()) {
            *a += w * x;
        }
    }
    Tensor::new(shape, acc)
}

/// The `p`-quantile of the weighted empirical distribution: sort by value,
/// walk the cumulative weight, and report the first value at which the
/// cumulative mass reaches `p`.
pub fn weighted_quantile(monitor: &Monitor, p: f64) -> Result<f64> {
    let weights = monitor.normalized_weights();
    let mut pairs: Vec<(f64, f64)> = monitor
        .values
        .iter()
        .map(|v| v.scalar_view())
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .zip(weights)
        .collect();
    pairs.sort_by_key(|&(x, _)| OrderedFloat(x));
    let sorted_values: Vec<f64> = pairs.iter().map(|&(x, _)| x).collect();
    let mut cumulative = Vec::with_capacity(pairs.len());
    let mut running = 0.0;
    for &(_, w) in &pairs {
        running += w;
        cumulative.push(running);
    }
    let idx = bisect_left(&cumulative, &p).min(sorted_values.len().saturating_sub(1));
    Ok(sorted_values[idx])
}

/// A fixed-bin weighted histogram over `[min, max]`, the density summary
/// `ExtractFilterPdf` returns. `cache_fraction` mirrors Biips' reservoir
/// fraction, retained here as the share of the mass each tail bin is
/// allowed before being folded into its neighbour — with few particles the
/// binning below is exact, so the parameter mainly documents intent.
pub struct Histogram {
    pub bin_edges: Vec<f64>,
    pub bin_mass: Vec<f64>,
}

pub fn weighted_histogram(monitor: &Monitor, num_bins: usize, cache_fraction: f64) -> Result<Histogram> {
    debug_assert!((0.0..=1.0).contains(&cache_fraction));
    let weights = monitor.normalized_weights();
    let values: Vec<f64> = monitor
        .values
        .iter()
        .map(|v| v.scalar_view())
        .collect::<Result<Vec<_>>>()?;
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let width = (max - min).max(f64::EPSILON) / num_bins as f64;
    let mut bin_mass = vec![0.0; num_bins];
    for (&x, &w) in values.iter().zip(&weights) {
        let bin = (((x - min) / width) as usize).min(num_bins - 1);
        bin_mass[bin] += w;
    }
    let bin_edges: Vec<f64> = (0..=num_bins).map(|i| min + i as f64 * width).collect();
    Ok(Histogram { bin_edges, bin_mass })
}

/// Weighted mode of a discrete-valued node: the value carrying the most
/// accumulated probability mass.
pub fn weighted_mode(monitor: &Monitor) -> Result<f64> {
    let weights = monitor.normalized_weights();
    let mut mass: Vec<(f64, f64)> = Vec::new();
    for (value, &w) in monitor.values.iter().zip(&weights) {
        let x = value.scalar_view()?;
        match mass.iter_mut().find(|(v, _)| *v == x) {
            Some((_, m)) => *m += w,
            None => mass.push((x, w)),
        }
    }
    mass.into_iter()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).expect("weights are finite"))
        .map(|(v, _)| v)
        .ok_or_else(|| crate::error::EngineError::Logic("monitor has no particles".to_string()))
}
