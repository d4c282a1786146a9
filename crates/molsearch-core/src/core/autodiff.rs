//! Forward-mode automatic differentiation.
//!
//! Descriptor code is written once, generically over [`Real`], and evaluated either with
//! plain `f64` or with [`Dual`] numbers to obtain exact directional derivatives with
//! respect to atomic coordinates.

use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};

/// The arithmetic a differentiable descriptor needs.
pub trait Real:
    Copy
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
{
    fn constant(value: f64) -> Self;
    fn value(self) -> f64;
    fn exp(self) -> Self;
    fn sqrt(self) -> Self;
    fn cos(self) -> Self;
    fn acos(self) -> Self;
    fn powi(self, n: i32) -> Self;
    fn powf(self, p: f64) -> Self;

    fn scale(self, factor: f64) -> Self {
        self * Self::constant(factor)
    }
}

impl Real for f64 {
    fn constant(value: f64) -> Self {
        value
    }
    fn value(self) -> f64 {
        self
    }
    fn exp(self) -> Self {
        f64::exp(self)
    }
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
    fn cos(self) -> Self {
        f64::cos(self)
    }
    fn acos(self) -> Self {
        f64::acos(self)
    }
    fn powi(self, n: i32) -> Self {
        f64::powi(self, n)
    }
    fn powf(self, p: f64) -> Self {
        f64::powf(self, p)
    }
    fn scale(self, factor: f64) -> Self {
        self * factor
    }
}

/// A dual number `re + eps * ε` with `ε² = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Dual {
    pub re: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(re: f64, eps: f64) -> Self {
        Self { re, eps }
    }

    /// A variable seeded with unit tangent.
    pub fn variable(re: f64) -> Self {
        Self { re, eps: 1.0 }
    }

    fn chain(self, value: f64, derivative: f64) -> Self {
        Self {
            re: value,
            eps: self.eps * derivative,
        }
    }
}

impl Add for Dual {
    type Output = Dual;
    fn add(self, rhs: Dual) -> Dual {
        Dual::new(self.re + rhs.re, self.eps + rhs.eps)
    }
}

impl AddAssign for Dual {
    fn add_assign(&mut self, rhs: Dual) {
        self.re += rhs.re;
        self.eps += rhs.eps;
    }
}

impl Sub for Dual {
    type Output = Dual;
    fn sub(self, rhs: Dual) -> Dual {
        Dual::new(self.re - rhs.re, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Dual;
    fn mul(self, rhs: Dual) -> Dual {
        Dual::new(self.re * rhs.re, self.eps * rhs.re + self.re * rhs.eps)
    }
}

impl Div for Dual {
    type Output = Dual;
    fn div(self, rhs: Dual) -> Dual {
        Dual::new(
            self.re / rhs.re,
            (self.eps * rhs.re - self.re * rhs.eps) / (rhs.re * rhs.re),
        )
    }
}

impl Neg for Dual {
    type Output = Dual;
    fn neg(self) -> Dual {
        Dual::new(-self.re, -self.eps)
    }
}

impl Real for Dual {
    fn constant(value: f64) -> Self {
        Dual::new(value, 0.0)
    }
    fn value(self) -> f64 {
        self.re
    }
    fn exp(self) -> Self {
        let e = self.re.exp();
        self.chain(e, e)
    }
    fn sqrt(self) -> Self {
        let s = self.re.sqrt();
        self.chain(s, 0.5 / s)
    }
    fn cos(self) -> Self {
        self.chain(self.re.cos(), -self.re.sin())
    }
    fn acos(self) -> Self {
        self.chain(self.re.acos(), -1.0 / (1.0 - self.re * self.re).sqrt())
    }
    fn powi(self, n: i32) -> Self {
        if n == 0 {
            return Dual::constant(1.0);
        }
        self.chain(self.re.powi(n), f64::from(n) * self.re.powi(n - 1))
    }
    fn powf(self, p: f64) -> Self {
        self.chain(self.re.powf(p), p * self.re.powf(p - 1.0))
    }
    fn scale(self, factor: f64) -> Self {
        Dual::new(self.re * factor, self.eps * factor)
    }
}

/// Evaluates `f` and its Jacobian with respect to `x` by one forward pass per input.
///
/// Returns `(values, jacobian)` where `jacobian[k][i] = ∂f_k/∂x_i`.
pub fn jacobian<F>(x: &[f64], f: F) -> (Vec<f64>, Vec<Vec<f64>>)
where
    F: Fn(&[Dual]) -> Vec<Dual>,
{
    let mut seeded: Vec<Dual> = x.iter().map(|&v| Dual::constant(v)).collect();
    let mut values = Vec::new();
    let mut jac: Vec<Vec<f64>> = Vec::new();
    for i in 0..x.len() {
        seeded[i].eps = 1.0;
        let out = f(&seeded);
        seeded[i].eps = 0.0;
        if i == 0 {
            values = out.iter().map(|d| d.re).collect();
            jac = vec![vec![0.0; x.len()]; out.len()];
        }
        for (row, d) in jac.iter_mut().zip(&out) {
            row[i] = d.eps;
        }
    }
    if x.is_empty() {
        let out = f(&seeded);
        values = out.iter().map(|d| d.re).collect();
    }
    (values, jac)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-10
    }

    #[test]
    fn product_and_quotient_rules() {
        let x = Dual::variable(3.0);
        let y = x * x / (x + Dual::constant(1.0));
        // d/dx x^2/(x+1) = (x^2 + 2x)/(x+1)^2
        assert!(close(y.re, 9.0 / 4.0));
        assert!(close(y.eps, 15.0 / 16.0));
    }

    #[test]
    fn elementary_functions_match_analytic_derivatives() {
        let x = Dual::variable(0.3);
        assert!(close(x.exp().eps, 0.3f64.exp()));
        assert!(close(x.sqrt().eps, 0.5 / 0.3f64.sqrt()));
        assert!(close(x.cos().eps, -0.3f64.sin()));
        assert!(close(x.acos().eps, -1.0 / (1.0 - 0.09f64).sqrt()));
        assert!(close(x.powi(3).eps, 3.0 * 0.09));
        assert!(close(x.powf(2.5).eps, 2.5 * 0.3f64.powf(1.5)));
    }

    #[test]
    fn jacobian_of_distance() {
        let (values, jac) = jacobian(&[0.0, 0.0, 0.0, 3.0, 4.0, 0.0], |x| {
            let d: Vec<Dual> = (0..3).map(|k| x[3 + k] - x[k]).collect();
            vec![(d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt()]
        });
        assert!(close(values[0], 5.0));
        let expected = [-0.6, -0.8, 0.0, 0.6, 0.8, 0.0];
        for (got, want) in jac[0].iter().zip(expected) {
            assert!(close(*got, want));
        }
    }
}
