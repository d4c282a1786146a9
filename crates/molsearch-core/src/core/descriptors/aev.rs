use crate::core::autodiff::{Dual, Real};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Radial and angular symmetry-function parameters of an atomic environment vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AevParameters {
    /// Radial cutoff in Angstroms.
    pub rcr: f64,
    /// Angular cutoff in Angstroms.
    pub rca: f64,
    pub eta_r: Vec<f64>,
    pub shf_r: Vec<f64>,
    pub zeta: Vec<f64>,
    pub shf_z: Vec<f64>,
    pub eta_a: Vec<f64>,
    pub shf_a: Vec<f64>,
}

impl Default for AevParameters {
    fn default() -> Self {
        Self {
            rcr: 5.2,
            rca: 3.5,
            eta_r: vec![16.0],
            shf_r: vec![
                0.9, 1.16875, 1.4375, 1.70625, 1.975, 2.24375, 2.5125, 2.78125, 3.05, 3.31875,
                3.5875, 3.85625, 4.125, 4.39375, 4.6625, 4.93125,
            ],
            zeta: vec![32.0],
            shf_z: vec![
                0.19634954, 0.58904862, 0.9817477, 1.37444679, 1.76714587, 2.15984495,
                2.55254403, 2.94524311,
            ],
            eta_a: vec![8.0],
            shf_a: vec![0.9, 1.55, 2.2, 2.85],
        }
    }
}

/// Computes ANI-style atomic environment vectors for molecules whose atoms have been
/// mapped to species indices `0..num_species`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AevComputer {
    pub parameters: AevParameters,
    pub num_species: usize,
}

fn cutoff<T: Real>(r: T, rc: f64) -> T {
    (r.scale(PI / rc)).cos().scale(0.5) + T::constant(0.5)
}

impl AevComputer {
    pub fn new(parameters: AevParameters, num_species: usize) -> Self {
        Self {
            parameters,
            num_species,
        }
    }

    fn radial_sublength(&self) -> usize {
        self.parameters.eta_r.len() * self.parameters.shf_r.len()
    }

    fn angular_sublength(&self) -> usize {
        let p = &self.parameters;
        p.eta_a.len() * p.zeta.len() * p.shf_a.len() * p.shf_z.len()
    }

    fn pair_index(&self, a: usize, b: usize) -> usize {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        // row-major index into the upper triangle (including diagonal)
        a * self.num_species - a * (a + 1) / 2 + b
    }

    pub fn radial_length(&self) -> usize {
        self.num_species * self.radial_sublength()
    }

    pub fn angular_length(&self) -> usize {
        self.num_species * (self.num_species + 1) / 2 * self.angular_sublength()
    }

    pub fn aev_length(&self) -> usize {
        self.radial_length() + self.angular_length()
    }

    /// Computes one AEV per atom from flattened coordinates.
    ///
    /// Neighbours are selected by comparing the plain distance value against the cutoffs.
    pub fn compute<T: Real>(&self, species: &[usize], coordinates: &[T]) -> Vec<Vec<T>> {
        let n = species.len();
        let p = &self.parameters;
        let radial_sub = self.radial_sublength();
        let angular_sub = self.angular_sublength();
        let radial_len = self.radial_length();

        let mut dist = vec![T::constant(0.0); n * n];
        let mut delta = vec![[T::constant(0.0); 3]; n * n];
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let mut r2 = T::constant(0.0);
                let mut d = [T::constant(0.0); 3];
                for (c, dc) in d.iter_mut().enumerate() {
                    *dc = coordinates[3 * j + c] - coordinates[3 * i + c];
                    r2 += *dc * *dc;
                }
                dist[i * n + j] = r2.sqrt();
                delta[i * n + j] = d;
            }
        }

        let mut out = vec![vec![T::constant(0.0); self.aev_length()]; n];
        for i in 0..n {
            let aev = &mut out[i];
            for j in 0..n {
                if i == j {
                    continue;
                }
                let r = dist[i * n + j];
                if r.value() >= p.rcr {
                    continue;
                }
                let fc = cutoff(r, p.rcr);
                let base = species[j] * radial_sub;
                let mut k = 0;
                for &eta in &p.eta_r {
                    for &shf in &p.shf_r {
                        let dr = r - T::constant(shf);
                        let term = (-(dr * dr).scale(eta)).exp().scale(0.25) * fc;
                        aev[base + k] += term;
                        k += 1;
                    }
                }
            }

            let neighbours: Vec<usize> = (0..n)
                .filter(|&j| j != i && dist[i * n + j].value() < p.rca)
                .collect();
            for (a, &j) in neighbours.iter().enumerate() {
                for &k in &neighbours[a + 1..] {
                    let rij = dist[i * n + j];
                    let rik = dist[i * n + k];
                    let dj = delta[i * n + j];
                    let dk = delta[i * n + k];
                    let dot = dj[0] * dk[0] + dj[1] * dk[1] + dj[2] * dk[2];
                    let cos_angle = dot / (rij * rik);
                    let angle = cos_angle.scale(0.95).acos();
                    let fcj = cutoff(rij, p.rca);
                    let fck = cutoff(rik, p.rca);
                    let mean_r = (rij + rik).scale(0.5);
                    let base = radial_len + self.pair_index(species[j], species[k]) * angular_sub;
                    let mut m = 0;
                    for &eta in &p.eta_a {
                        for &zeta in &p.zeta {
                            for &shf_a in &p.shf_a {
                                let dr = mean_r - T::constant(shf_a);
                                let radial = (-(dr * dr).scale(eta)).exp();
                                for &shf_z in &p.shf_z {
                                    let angular = ((angle - T::constant(shf_z)).cos()
                                        + T::constant(1.0))
                                    .scale(0.5)
                                    .powf(zeta);
                                    aev[base + m] += (angular * radial * fcj * fck).scale(2.0);
                                    m += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        out
    }

    /// Computes AEVs in double precision.
    pub fn compute_values(&self, species: &[usize], coordinates: &[f64]) -> Vec<DVector<f64>> {
        self.compute(species, coordinates)
            .into_iter()
            .map(DVector::from_vec)
            .collect()
    }

    /// Computes AEVs together with their derivatives along every Cartesian coordinate.
    ///
    /// Returns `(aevs, tangents)` with `tangents[c][i] = ∂aev_i/∂x_c`.
    pub fn compute_with_tangents(
        &self,
        species: &[usize],
        coordinates: &[f64],
    ) -> (Vec<DVector<f64>>, Vec<Vec<DVector<f64>>>) {
        let values = self.compute_values(species, coordinates);
        let mut seeded: Vec<Dual> = coordinates.iter().map(|&x| Dual::constant(x)).collect();
        let mut tangents = Vec::with_capacity(coordinates.len());
        for c in 0..coordinates.len() {
            seeded[c].eps = 1.0;
            let duals = self.compute(species, &seeded);
            seeded[c].eps = 0.0;
            tangents.push(
                duals
                    .into_iter()
                    .map(|aev| DVector::from_iterator(aev.len(), aev.into_iter().map(|d| d.eps)))
                    .collect(),
            );
        }
        (values, tangents)
    }
}
