//! A single particle: one value per graph node, plus the accumulated log
//! weight from the moves made so far. Grounded on `core/src/sampler/Particle.cpp`.

use crate::error::Result;
use crate::graph::NodeId;
use crate::tensor::Tensor;

#[derive(Clone)]
pub struct Particle {
    values: Vec<Option<Tensor>>,
    log_weight: f64,
}

impl Particle {
    pub fn new(n_nodes: usize) -> Self {
        Particle {
            values: vec![None; n_nodes],
            log_weight: 0.0,
        }
    }

    pub fn value(&self, id: NodeId) -> Option<&Tensor> {
        self.values[id].as_ref()
    }

    pub fn set_value(&mut self, id: NodeId, value: Tensor) {
        self.values[id] = Some(value);
    }

    pub fn has_value(&self, id: NodeId) -> bool {
        self.values[id].is_some()
    }

    pub fn log_weight(&self) -> f64 {
        self.log_weight
    }

    pub fn set_log_weight(&mut self, w: f64) {
        self.log_weight = w;
    }

    /// Adds `delta` to this particle's log weight, rejecting non-finite
    /// increments the way the reference sampler's `AddToLogWeight` does:
    /// a `NaN` increment is always a bug, but `-inf` (a zero-likelihood
    /// move) is a legitimate way for a particle to become degenerate.
    pub fn add_to_log_weight(&mut self, delta: f64) -> Result<()> {
        if delta.is_nan() {
            return Err(crate::error::EngineError::Numeric {
                node: 0,
                message: "log weight increment is NaN".to_string(),
            });
        }
        self.log_weight += delta;
        Ok(())
    }

    pub fn is_degenerate(&self) -> bool {
        self.log_weight == f64::NEG_INFINITY
    }

    pub fn reset_values(&mut self) {
        for v in &mut self.values {
            *v = None;
        }
    }
}
