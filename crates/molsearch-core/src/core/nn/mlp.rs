use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

const CELU_ALPHA: f64 = 0.1;

fn celu(x: f64) -> f64 {
    if x > 0.0 {
        x
    } else {
        CELU_ALPHA * ((x / CELU_ALPHA).exp() - 1.0)
    }
}

fn celu_first(x: f64) -> f64 {
    if x > 0.0 { 1.0 } else { (x / CELU_ALPHA).exp() }
}

fn celu_second(x: f64) -> f64 {
    if x > 0.0 {
        0.0
    } else {
        (x / CELU_ALPHA).exp() / CELU_ALPHA
    }
}

/// A fully connected layer `z = W a + b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub weight: DMatrix<f64>,
    pub bias: DVector<f64>,
}

impl Dense {
    fn kaiming<R: Rng>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let mut layer = Self {
            weight: DMatrix::zeros(outputs, inputs),
            bias: DVector::zeros(outputs),
        };
        layer.reinitialize(rng);
        layer
    }

    /// Kaiming-normal weights (gain 1) and zero biases.
    fn reinitialize<R: Rng>(&mut self, rng: &mut R) {
        let fan_in = self.weight.ncols().max(1) as f64;
        let std = 1.0 / fan_in.sqrt();
        match Normal::new(0.0, std) {
            Ok(normal) => self.weight.iter_mut().for_each(|w| *w = normal.sample(rng)),
            Err(_) => self.weight.fill(0.0),
        }
        self.bias.fill(0.0);
    }
}

/// A scalar-output feed-forward network with CELU activations between layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    pub layers: Vec<Dense>,
}

/// Parameter gradients with the same layout as an [`Mlp`].
#[derive(Debug, Clone, PartialEq)]
pub struct MlpGradients {
    pub weights: Vec<DMatrix<f64>>,
    pub biases: Vec<DVector<f64>>,
}

impl MlpGradients {
    pub fn zeros_like(mlp: &Mlp) -> Self {
        Self {
            weights: mlp
                .layers
                .iter()
                .map(|l| DMatrix::zeros(l.weight.nrows(), l.weight.ncols()))
                .collect(),
            biases: mlp
                .layers
                .iter()
                .map(|l| DVector::zeros(l.bias.len()))
                .collect(),
        }
    }
}

struct LayerTrace {
    input: DVector<f64>,
    input_tangent: DVector<f64>,
    z: DVector<f64>,
    z_tangent: DVector<f64>,
}

impl Mlp {
    /// Builds a network `inputs -> hidden[0] -> ... -> 1`.
    pub fn new<R: Rng>(inputs: usize, hidden: &[usize], rng: &mut R) -> Self {
        let mut widths = Vec::with_capacity(hidden.len() + 2);
        widths.push(inputs);
        widths.extend_from_slice(hidden);
        widths.push(1);
        let layers = widths
            .windows(2)
            .map(|w| Dense::kaiming(w[0], w[1], rng))
            .collect();
        Self { layers }
    }

    pub fn reinitialize<R: Rng>(&mut self, rng: &mut R) {
        for layer in &mut self.layers {
            layer.reinitialize(rng);
        }
    }

    /// Widths of every layer's output, ending with the scalar output layer.
    pub fn widths(&self) -> Vec<usize> {
        self.layers.iter().map(|l| l.bias.len()).collect()
    }

    fn is_last(&self, l: usize) -> bool {
        l + 1 == self.layers.len()
    }

    pub fn forward(&self, x: &DVector<f64>) -> f64 {
        let mut a = x.clone();
        for (l, layer) in self.layers.iter().enumerate() {
            let z = &layer.weight * &a + &layer.bias;
            a = if self.is_last(l) { z } else { z.map(celu) };
        }
        a[0]
    }

    /// Returns the output and its directional derivative along `tangent`.
    pub fn forward_with_tangent(&self, x: &DVector<f64>, tangent: &DVector<f64>) -> (f64, f64) {
        let mut a = x.clone();
        let mut t = tangent.clone();
        for (l, layer) in self.layers.iter().enumerate() {
            let z = &layer.weight * &a + &layer.bias;
            let tz = &layer.weight * &t;
            if self.is_last(l) {
                a = z;
                t = tz;
            } else {
                t = tz.component_mul(&z.map(celu_first));
                a = z.map(celu);
            }
        }
        (a[0], t[0])
    }

    /// Gradient of the output with respect to the input vector.
    pub fn input_gradient(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut zs = Vec::with_capacity(self.layers.len());
        let mut a = x.clone();
        for (l, layer) in self.layers.iter().enumerate() {
            let z = &layer.weight * &a + &layer.bias;
            a = if self.is_last(l) { z.clone() } else { z.map(celu) };
            zs.push(z);
        }
        let mut g = DVector::from_element(1, 1.0);
        for (l, layer) in self.layers.iter().enumerate().rev() {
            let gz = if self.is_last(l) {
                g
            } else {
                g.component_mul(&zs[l].map(celu_first))
            };
            g = layer.weight.tr_mul(&gz);
        }
        g
    }

    /// Accumulates parameter gradients of `g_value * y + g_tangent * (∂y/∂x · tangent)`.
    ///
    /// The tangent term makes force-matching losses trainable: its parameter gradient
    /// requires the second derivative of the activation.
    pub fn accumulate_gradients(
        &self,
        x: &DVector<f64>,
        tangent: Option<&DVector<f64>>,
        g_value: f64,
        g_tangent: f64,
        grads: &mut MlpGradients,
    ) {
        let mut traces = Vec::with_capacity(self.layers.len());
        let mut a = x.clone();
        let mut t = tangent.cloned().unwrap_or_else(|| DVector::zeros(x.len()));
        for (l, layer) in self.layers.iter().enumerate() {
            let z = &layer.weight * &a + &layer.bias;
            let tz = &layer.weight * &t;
            let (next_a, next_t) = if self.is_last(l) {
                (z.clone(), tz.clone())
            } else {
                (z.map(celu), tz.component_mul(&z.map(celu_first)))
            };
            traces.push(LayerTrace {
                input: a,
                input_tangent: t,
                z,
                z_tangent: tz,
            });
            a = next_a;
            t = next_t;
        }

        let mut ga = DVector::from_element(1, g_value);
        let mut gta = DVector::from_element(1, g_tangent);
        for (l, layer) in self.layers.iter().enumerate().rev() {
            let trace = &traces[l];
            let (gz, gtz) = if self.is_last(l) {
                (ga, gta)
            } else {
                let s1 = trace.z.map(celu_first);
                let s2 = trace.z.map(celu_second);
                let gz = ga.component_mul(&s1)
                    + gta.component_mul(&trace.z_tangent).component_mul(&s2);
                let gtz = gta.component_mul(&s1);
                (gz, gtz)
            };
            grads.weights[l] += &gz * trace.input.transpose();
            if tangent.is_some() {
                grads.weights[l] += &gtz * trace.input_tangent.transpose();
            }
            grads.biases[l] += &gz;
            ga = layer.weight.tr_mul(&gz);
            gta = layer.weight.tr_mul(&gtz);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn network() -> Mlp {
        let mut rng = StdRng::seed_from_u64(3);
        Mlp::new(4, &[5, 3], &mut rng)
    }

    fn input() -> (DVector<f64>, DVector<f64>) {
        (
            DVector::from_vec(vec![0.3, -0.2, 0.8, -1.1]),
            DVector::from_vec(vec![0.5, 0.1, -0.4, 0.2]),
        )
    }

    #[test]
    fn widths_end_with_scalar_output() {
        assert_eq!(network().widths(), vec![5, 3, 1]);
    }

    #[test]
    fn input_gradient_matches_tangent_forward() {
        let mlp = network();
        let (x, t) = input();
        let (_, dy) = mlp.forward_with_tangent(&x, &t);
        assert!((mlp.input_gradient(&x).dot(&t) - dy).abs() < 1e-12);
    }

    #[test]
    fn weight_gradient_of_value_matches_finite_difference() {
        let mlp = network();
        let (x, _) = input();
        let mut grads = MlpGradients::zeros_like(&mlp);
        mlp.accumulate_gradients(&x, None, 1.0, 0.0, &mut grads);
        let h = 1e-6;
        for (r, c) in [(0, 0), (2, 3), (4, 1)] {
            let mut plus = mlp.clone();
            let mut minus = mlp.clone();
            plus.layers[0].weight[(r, c)] += h;
            minus.layers[0].weight[(r, c)] -= h;
            let numeric = (plus.forward(&x) - minus.forward(&x)) / (2.0 * h);
            assert!((numeric - grads.weights[0][(r, c)]).abs() < 1e-6);
        }
    }

    #[test]
    fn weight_gradient_of_tangent_matches_finite_difference() {
        let mlp = network();
        let (x, t) = input();
        let mut grads = MlpGradients::zeros_like(&mlp);
        mlp.accumulate_gradients(&x, Some(&t), 0.0, 1.0, &mut grads);
        let h = 1e-6;
        for layer in 0..3 {
            let mut plus = mlp.clone();
            let mut minus = mlp.clone();
            plus.layers[layer].weight[(0, 0)] += h;
            minus.layers[layer].weight[(0, 0)] -= h;
            let numeric = (plus.forward_with_tangent(&x, &t).1
                - minus.forward_with_tangent(&x, &t).1)
                / (2.0 * h);
            assert!((numeric - grads.weights[layer][(0, 0)]).abs() < 1e-6);

            let mut plus = mlp.clone();
            let mut minus = mlp.clone();
            plus.layers[layer].bias[0] += h;
            minus.layers[layer].bias[0] -= h;
            let numeric = (plus.forward_with_tangent(&x, &t).1
                - minus.forward_with_tangent(&x, &t).1)
                / (2.0 * h);
            assert!((numeric - grads.biases[layer][0]).abs() < 1e-6);
        }
    }

    #[test]
    fn reinitialize_zeroes_biases() {
        let mut mlp = network();
        mlp.layers[1].bias.fill(3.0);
        mlp.reinitialize(&mut StdRng::seed_from_u64(1));
        assert!(mlp.layers.iter().all(|l| l.bias.iter().all(|b| *b == 0.0)));
    }
}
