//! Gaussian kernel algebra over descriptor points.
//!
//! With `d = x_a - x_b` and `k = exp(-|d|² / 2σ²)` the derivatives with respect to the
//! Cartesian coordinates of either geometry follow from the descriptor Jacobians:
//!
//! - `∂k/∂R_a = -(k/σ²) J_aᵀ d`
//! - `∂k/∂R_b = (k/σ²) J_bᵀ d`
//! - `∂²k/∂R_a∂R_bᵀ = (k/σ²) J_aᵀ (I - d dᵀ/σ²) J_b`

use crate::core::descriptors::relative::DescriptorPoint;
use nalgebra::{DMatrix, DVector};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianKernel {
    pub sigma: f64,
}

/// Kernel value and the derivatives that were requested for one geometry pair.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelTerms {
    pub value: f64,
    pub gradient_a: Option<DVector<f64>>,
    pub gradient_b: Option<DVector<f64>>,
    pub mixed_hessian: Option<DMatrix<f64>>,
}

impl GaussianKernel {
    pub fn new(sigma: f64) -> Self {
        Self { sigma }
    }

    pub fn value(&self, a: &DVector<f64>, b: &DVector<f64>) -> f64 {
        let d = a - b;
        (-d.norm_squared() / (2.0 * self.sigma * self.sigma)).exp()
    }

    /// Evaluates the kernel between `a` and `b` with the requested derivatives.
    pub fn terms(
        &self,
        a: &DescriptorPoint,
        b: &DescriptorPoint,
        gradient_a: bool,
        gradient_b: bool,
        mixed_hessian: bool,
    ) -> KernelTerms {
        let s2 = self.sigma * self.sigma;
        let d = &a.values - &b.values;
        let k = (-d.norm_squared() / (2.0 * s2)).exp();
        let scale = k / s2;
        let ga = gradient_a.then(|| a.jacobian.tr_mul(&d) * (-scale));
        let gb = gradient_b.then(|| b.jacobian.tr_mul(&d) * scale);
        let h = mixed_hessian.then(|| {
            let m = d.len();
            let inner = DMatrix::<f64>::identity(m, m) - (&d * d.transpose()) / s2;
            a.jacobian.tr_mul(&(inner * &b.jacobian)) * scale
        });
        KernelTerms {
            value: k,
            gradient_a: ga,
            gradient_b: gb,
            mixed_hessian: h,
        }
    }

    /// Assembles the training kernel matrix without the ridge term.
    ///
    /// The first `N` rows/columns hold kernel values. When `with_gradients` is set, a block of
    /// `3 * natoms` rows/columns per geometry follows, holding the derivative of the kernel
    /// with respect to that geometry's coordinates, and the mixed second derivatives.
    pub fn assemble(&self, points: &[DescriptorPoint], with_gradients: bool) -> DMatrix<f64> {
        let n = points.len();
        let dim = points.first().map_or(0, |p| p.jacobian.ncols());
        let size = if with_gradients { n + n * dim } else { n };
        let mut matrix = DMatrix::<f64>::zeros(size, size);

        let pairs: Vec<(usize, usize)> = (0..n).flat_map(|i| (i..n).map(move |j| (i, j))).collect();

        #[cfg(not(feature = "parallel"))]
        let iterator = pairs.iter();

        #[cfg(feature = "parallel")]
        let iterator = pairs.par_iter();

        let blocks: Vec<((usize, usize), KernelTerms)> = iterator
            .map(|&(i, j)| {
                let terms = self.terms(
                    &points[i],
                    &points[j],
                    with_gradients,
                    with_gradients,
                    with_gradients,
                );
                ((i, j), terms)
            })
            .collect();

        for ((i, j), terms) in blocks {
            matrix[(i, j)] = terms.value;
            matrix[(j, i)] = terms.value;
            if !with_gradients {
                continue;
            }
            let oi = n + i * dim;
            let oj = n + j * dim;
            if let Some(gb) = &terms.gradient_b {
                // row i, derivative block of j; mirrored into column i of block j
                for c in 0..dim {
                    matrix[(i, oj + c)] = gb[c];
                    matrix[(oj + c, i)] = gb[c];
                }
            }
            if let Some(ga) = &terms.gradient_a {
                for c in 0..dim {
                    matrix[(j, oi + c)] = ga[c];
                    matrix[(oi + c, j)] = ga[c];
                }
            }
            if let Some(h) = &terms.mixed_hessian {
                for r in 0..dim {
                    for c in 0..dim {
                        matrix[(oi + r, oj + c)] = h[(r, c)];
                        matrix[(oj + c, oi + r)] = h[(r, c)];
                    }
                }
            }
        }
        matrix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptors::relative::RelativeDescriptor;
    use crate::core::models::molecule::Molecule;

    fn geometries() -> Vec<Molecule> {
        [0.95, 1.0, 1.07, 1.15]
            .iter()
            .map(|s| {
                Molecule::from_numbers_and_coordinates(&[
                    (8, [0.0, 0.0, 0.0]),
                    (1, [0.96 * s, 0.0, 0.0]),
                    (1, [-0.24, 0.93 * s, 0.05]),
                ])
            })
            .collect()
    }

    fn points() -> Vec<DescriptorPoint> {
        let mols = geometries();
        let desc = RelativeDescriptor::from_equilibrium(&mols[1]);
        mols.iter()
            .map(|m| desc.evaluate_with_jacobian(m).unwrap())
            .collect()
    }

    #[test]
    fn kernel_matrix_is_symmetric() {
        let k = GaussianKernel::new(0.7).assemble(&points(), true);
        assert_eq!(k.shape(), (4 + 4 * 9, 4 + 4 * 9));
        let asym = (&k - k.transpose()).amax();
        assert!(asym < 1e-12);
    }

    #[test]
    fn value_block_has_unit_diagonal() {
        let k = GaussianKernel::new(2.0).assemble(&points(), false);
        for i in 0..4 {
            assert!((k[(i, i)] - 1.0).abs() < 1e-15);
        }
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let mols = geometries();
        let desc = RelativeDescriptor::from_equilibrium(&mols[1]);
        let kernel = GaussianKernel::new(0.5);
        let a = desc.evaluate_with_jacobian(&mols[0]).unwrap();
        let b = desc.evaluate_with_jacobian(&mols[3]).unwrap();
        let terms = kernel.terms(&a, &b, true, true, false);
        let h = 1e-6;
        let coords = mols[0].flat_coordinates();
        for c in 0..coords.len() {
            let mut plus = mols[0].clone();
            let mut minus = mols[0].clone();
            let mut xp = coords.clone();
            let mut xm = coords.clone();
            xp[c] += h;
            xm[c] -= h;
            plus.set_flat_coordinates(&xp);
            minus.set_flat_coordinates(&xm);
            let kp = kernel.value(&desc.evaluate(&plus).unwrap(), &b.values);
            let km = kernel.value(&desc.evaluate(&minus).unwrap(), &b.values);
            let numeric = (kp - km) / (2.0 * h);
            assert!((numeric - terms.gradient_a.as_ref().unwrap()[c]).abs() < 1e-6);
        }
    }

    #[test]
    fn mixed_hessian_matches_finite_difference_of_gradient() {
        let mols = geometries();
        let desc = RelativeDescriptor::from_equilibrium(&mols[1]);
        let kernel = GaussianKernel::new(0.5);
        let a = desc.evaluate_with_jacobian(&mols[0]).unwrap();
        let b = desc.evaluate_with_jacobian(&mols[2]).unwrap();
        let hess = kernel.terms(&a, &b, false, false, true).mixed_hessian.unwrap();
        let h = 1e-6;
        let coords = mols[2].flat_coordinates();
        for c in [0, 4, 8] {
            let mut xp = coords.clone();
            let mut xm = coords.clone();
            xp[c] += h;
            xm[c] -= h;
            let mut plus = mols[2].clone();
            let mut minus = mols[2].clone();
            plus.set_flat_coordinates(&xp);
            minus.set_flat_coordinates(&xm);
            let bp = desc.evaluate_with_jacobian(&plus).unwrap();
            let bm = desc.evaluate_with_jacobian(&minus).unwrap();
            let gp = kernel.terms(&a, &bp, true, false, false).gradient_a.unwrap();
            let gm = kernel.terms(&a, &bm, true, false, false).gradient_a.unwrap();
            let numeric = (gp - gm) / (2.0 * h);
            for r in 0..9 {
                assert!((numeric[r] - hess[(r, c)]).abs() < 1e-5);
            }
        }
    }
}
