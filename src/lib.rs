//! Sequential Monte Carlo inference over a directed acyclic graph of
//! constant, deterministic, aggregate and stochastic nodes: a forward
//! particle filter with conjugacy-aware node samplers, a backward particle
//! smoother, and weighted statistical accumulators for summarising the
//! results.

pub mod backward;
pub mod error;
pub mod eval;
pub mod forward;
pub mod graph;
pub mod linalg;
pub mod model;
pub mod monitor;
pub mod particle;
pub mod registry;
pub mod resample;
pub mod rng;
pub mod samplers;
pub mod tensor;

pub use error::{EngineError, Result};
pub use graph::{Graph, NodeId};
pub use model::Model;
pub use monitor::StatTag;
pub use resample::ResamplingMode;
pub use tensor::Tensor;
