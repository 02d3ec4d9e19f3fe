//! Deterministic function registry: scalar and reduction operators used by
//! logical (deterministic) nodes, as a tagged variant rather than a trait
//! object per function.

use crate::error::{EngineError, Result};
use crate::tensor::{checks_integer, Tensor, TensorView};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuncKind {
    Pow,
    PowInfix,
    Sqrt,
    Log,
    Probit,
    Phi,
    Multiply,
    Add,
    Sum,
    And,
    Or,
    Not,
    Identity,
}

pub const ALL_FUNCTIONS: &[FuncKind] = &[
    FuncKind::Pow,
    FuncKind::PowInfix,
    FuncKind::Sqrt,
    FuncKind::Log,
    FuncKind::Probit,
    FuncKind::Phi,
    FuncKind::Multiply,
    FuncKind::Add,
    FuncKind::Sum,
    FuncKind::And,
    FuncKind::Or,
    FuncKind::Not,
    FuncKind::Identity,
];

impl FuncKind {
    pub fn name(&self) -> &'static str {
        match self {
            FuncKind::Pow => "pow",
            FuncKind::PowInfix => "pow_infix",
            FuncKind::Sqrt => "sqrt",
            FuncKind::Log => "log",
            FuncKind::Probit => "probit",
            FuncKind::Phi => "phi",
            FuncKind::Multiply => "multiply",
            FuncKind::Add => "add",
            FuncKind::Sum => "sum",
            FuncKind::And => "and",
            FuncKind::Or => "or",
            FuncKind::Not => "not",
            FuncKind::Identity => "identity",
        }
    }

    pub fn by_name(name: &str) -> Option<FuncKind> {
        ALL_FUNCTIONS.iter().copied().find(|f| f.name() == name)
    }

    pub fn arity(&self) -> Arity {
        match self {
            FuncKind::Pow | FuncKind::PowInfix | FuncKind::Multiply | FuncKind::Add | FuncKind::And | FuncKind::Or => {
                Arity::Exact(2)
            }
            FuncKind::Sqrt | FuncKind::Log | FuncKind::Probit | FuncKind::Phi | FuncKind::Not | FuncKind::Identity => {
                Arity::Exact(1)
            }
            FuncKind::Sum => Arity::AtLeast(1),
        }
    }

    /// Dimension check for the parameters as given: binary scalar functions
    /// require either side scalar, or matching dropped shapes; `Sum` accepts
    /// any arity and always reduces to a scalar.
    pub fn check_param_dims(&self, shapes: &[&[usize]]) -> bool {
        match self.arity() {
            Arity::Exact(1) => true,
            Arity::Exact(2) => {
                let a = shapes[0];
                let b = shapes[1];
                let a_scalar = a.iter().product::<usize>() == 1;
                let b_scalar = b.iter().product::<usize>() == 1;
                a_scalar || b_scalar || dropped(a) == dropped(b)
            }
            Arity::AtLeast(_) => true,
        }
    }

    pub fn dim(&self, shapes: &[&[usize]]) -> Vec<usize> {
        match self {
            FuncKind::Sum | FuncKind::And | FuncKind::Or | FuncKind::Not => vec![1],
            FuncKind::Sqrt | FuncKind::Log | FuncKind::Probit | FuncKind::Phi | FuncKind::Identity => {
                shapes[0].to_vec()
            }
            FuncKind::Pow | FuncKind::PowInfix | FuncKind::Multiply | FuncKind::Add => {
                let a = shapes[0];
                let b = shapes[1];
                if a.iter().product::<usize>() >= b.iter().product::<usize>() {
                    a.to_vec()
                } else {
                    b.to_vec()
                }
            }
        }
    }

    pub fn check_param_values(&self, params: &[TensorView]) -> Result<bool> {
        let ok = match self {
            FuncKind::Pow | FuncKind::PowInfix => {
                let base = params[0].values();
                let exponent = params[1].values();
                base.iter().zip(broadcast(exponent, base.len())).all(|(&b, e)| {
                    if b < 0.0 {
                        checks_integer(e)
                    } else if b == 0.0 {
                        e >= 0.0
                    } else {
                        true
                    }
                })
            }
            FuncKind::Sqrt => params[0].values().iter().all(|&x| x >= 0.0),
            FuncKind::Log => params[0].values().iter().all(|&x| x > 0.0),
            FuncKind::Probit => params[0].values().iter().all(|&x| x > 0.0 && x < 1.0),
            FuncKind::Phi | FuncKind::Multiply | FuncKind::Add | FuncKind::Sum | FuncKind::And | FuncKind::Or
            | FuncKind::Not | FuncKind::Identity => true,
        };
        Ok(ok)
    }

    pub fn is_discrete_valued(&self, mask: &[bool]) -> bool {
        match self {
            FuncKind::And | FuncKind::Or | FuncKind::Not => true,
            FuncKind::Sum => mask.first().copied().unwrap_or(false),
            _ => mask.iter().all(|&m| m),
        }
    }

    pub fn eval(&self, params: &[TensorView]) -> Result<Tensor> {
        match self {
            FuncKind::Pow | FuncKind::PowInfix => {
                let base = params[0].values();
                let exponent = params[1].values();
                let n = base.len().max(exponent.len());
                let shape = if base.len() >= exponent.len() {
                    params[0].shape().to_vec()
                } else {
                    params[1].shape().to_vec()
                };
                let data: Vec<f64> = (0..n)
                    .map(|i| broadcast(base, n)[i].powf(broadcast(exponent, n)[i]))
                    .collect();
                Tensor::new(shape, data)
            }
            FuncKind::Sqrt => map_unary(params[0], f64::sqrt),
            FuncKind::Log => map_unary(params[0], f64::ln),
            FuncKind::Probit => map_unary(params[0], probit_scalar),
            FuncKind::Phi => map_unary(params[0], phi_scalar),
            FuncKind::Multiply => {
                let a = params[0].values();
                let b = params[1].values();
                let n = a.len().max(b.len());
                let shape = if a.len() >= b.len() {
                    params[0].shape().to_vec()
                } else {
                    params[1].shape().to_vec()
                };
                let data: Vec<f64> = (0..n)
                    .map(|i| broadcast(a, n)[i] * broadcast(b, n)[i])
                    .collect();
                Tensor::new(shape, data)
            }
            FuncKind::Add => {
                let a = params[0].values();
                let b = params[1].values();
                let n = a.len().max(b.len());
                let shape = if a.len() >= b.len() {
                    params[0].shape().to_vec()
                } else {
                    params[1].shape().to_vec()
                };
                let data: Vec<f64> = (0..n)
                    .map(|i| broadcast(a, n)[i] + broadcast(b, n)[i])
                    .collect();
                Tensor::new(shape, data)
            }
            FuncKind::Sum => Ok(Tensor::scalar(params.iter().flat_map(|p| p.values()).sum())),
            FuncKind::And => Ok(Tensor::scalar(
                (params[0].scalar_view()? != 0.0 && params[1].scalar_view()? != 0.0) as u8 as f64,
            )),
            FuncKind::Or => Ok(Tensor::scalar(
                (params[0].scalar_view()? != 0.0 || params[1].scalar_view()? != 0.0) as u8 as f64,
            )),
            FuncKind::Not => Ok(Tensor::scalar((params[0].scalar_view()? == 0.0) as u8 as f64)),
            FuncKind::Identity => Ok(params[0].to_owned()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

fn dropped(shape: &[usize]) -> Vec<usize> {
    let d: Vec<usize> = shape.iter().copied().filter(|&x| x != 1).collect();
    if d.is_empty() {
        vec![1]
    } else {
        d
    }
}

fn broadcast(values: &[f64], n: usize) -> Vec<f64> {
    if values.len() == n {
        values.to_vec()
    } else {
        vec![values[0]; n]
    }
}

fn map_unary(p: TensorView, f: impl Fn(f64) -> f64) -> Result<Tensor> {
    Tensor::new(p.shape().to_vec(), p.values().iter().map(|&x| f(x)).collect())
}

/// Quantile of the standard normal, via `statrs`'s inverse CDF.
fn probit_scalar(x: f64) -> f64 {
    use statrs::distribution::{ContinuousCDF, Normal};
    Normal::new(0.0, 1.0)
        .expect("standard normal is always valid")
        .inverse_cdf(x)
}

/// CDF of the standard normal, clamped away from the exact 0/1 boundary as
/// the reference implementation does to keep downstream log-densities finite.
fn phi_scalar(x: f64) -> f64 {
    use statrs::distribution::{ContinuousCDF, Normal};
    let p = Normal::new(0.0, 1.0)
        .expect("standard normal is always valid")
        .cdf(x);
    p.clamp(f64::EPSILON, 1.0 - f64::EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow_rejects_negative_base_with_noninteger_exponent() {
        let base = Tensor::scalar(-2.0);
        let exp = Tensor::scalar(0.5);
        let params = [base.as_view(), exp.as_view()];
        assert!(!FuncKind::Pow.check_param_values(&params).unwrap());
    }

    #[test]
    fn pow_accepts_negative_base_with_integer_exponent() {
        let base = Tensor::scalar(-2.0);
        let exp = Tensor::scalar(3.0);
        let params = [base.as_view(), exp.as_view()];
        assert!(FuncKind::Pow.check_param_values(&params).unwrap());
        let out = FuncKind::Pow.eval(&params).unwrap();
        assert_eq!(out.scalar_view().unwrap(), -8.0);
    }

    #[test]
    fn sum_is_discrete_only_if_first_operand_is() {
        assert!(FuncKind::Sum.is_discrete_valued(&[true, false]));
        assert!(!FuncKind::Sum.is_discrete_valued(&[false, true]));
    }

    #[test]
    fn probit_and_phi_round_trip() {
        let x = Tensor::scalar(0.3);
        let q = FuncKind::Probit.eval(&[x.as_view()]).unwrap();
        let back = FuncKind::Phi.eval(&[q.as_view()]).unwrap();
        assert!((back.scalar_view().unwrap() - 0.3).abs() < 1e-8);
    }

    #[test]
    fn pow_elementwise_check_fails_if_any_slot_is_invalid() {
        let base = Tensor::vector(vec![-1.0, 0.0, 1.0]);
        let exp = Tensor::vector(vec![0.5, 1.0, 2.0]);
        let params = [base.as_view(), exp.as_view()];
        assert!(!FuncKind::Pow.check_param_values(&params).unwrap());
    }

    #[test]
    fn pow_scalar_two_to_the_half_is_root_two() {
        let base = Tensor::scalar(2.0);
        let exp = Tensor::scalar(0.5);
        let params = [base.as_view(), exp.as_view()];
        assert!(FuncKind::Pow.check_param_values(&params).unwrap());
        let out = FuncKind::Pow.eval(&params).unwrap();
        assert!((out.scalar_view().unwrap() - std::f64::consts::SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn multiply_broadcasts_scalar_over_vector() {
        let a = Tensor::scalar(2.0);
        let b = Tensor::vector(vec![1.0, 2.0, 3.0]);
        let out = FuncKind::Multiply.eval(&[a.as_view(), b.as_view()]).unwrap();
        assert_eq!(out.values(), &[2.0, 4.0, 6.0]);
    }
}
