//! Search strategies over a bounded box of hyperparameters.
//!
//! Every strategy works in search coordinates (the logarithm of log-space hyperparameters),
//! converts points back to hyperparameter values and hands them to the objective in the
//! order of the dimensions. A failing objective aborts the search.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::f64::consts::PI;
use tracing::{debug, trace};

use super::config::{LocalSearchConfig, TpeConfig};
use crate::core::hyperparameters::{Hyperparameter, OptimizationSpace};
use crate::engine::error::ModelError;

/// One searched hyperparameter, with bounds and start point in search coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchDimension {
    pub name: String,
    pub space: OptimizationSpace,
    pub lower: f64,
    pub upper: f64,
    pub initial: f64,
}

impl SearchDimension {
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidArgument`] for hyperparameters without numeric value or
    /// bounds, inverted bounds, and non-positive bounds in log space.
    pub fn from_hyperparameter(hyperparameter: &Hyperparameter) -> Result<Self, ModelError> {
        let (lo, hi) = hyperparameter.bounds()?;
        let value = hyperparameter.as_f64()?;
        let name = &hyperparameter.name;
        if !(lo <= hi) {
            return Err(ModelError::InvalidArgument(format!(
                "hyperparameter '{name}' has inverted bounds [{lo}, {hi}]"
            )));
        }
        if hyperparameter.optimization_space == OptimizationSpace::Log && lo <= 0.0 {
            return Err(ModelError::InvalidArgument(format!(
                "log-space hyperparameter '{name}' needs positive bounds, got [{lo}, {hi}]"
            )));
        }
        let (lower, upper) = hyperparameter.search_bounds()?;
        let initial = hyperparameter.to_search(value.clamp(lo, hi));
        Ok(Self {
            name: name.clone(),
            space: hyperparameter.optimization_space,
            lower,
            upper,
            initial,
        })
    }

    /// A linear-space dimension.
    pub fn linear(name: &str, lower: f64, upper: f64, initial: f64) -> Self {
        Self {
            name: name.to_string(),
            space: OptimizationSpace::Linear,
            lower,
            upper,
            initial: initial.clamp(lower, upper),
        }
    }

    /// Converts a search coordinate into a hyperparameter value.
    pub fn value(&self, coordinate: f64) -> f64 {
        match self.space {
            OptimizationSpace::Linear => coordinate,
            OptimizationSpace::Log => coordinate.exp(),
        }
    }

    fn clamp(&self, coordinate: f64) -> f64 {
        coordinate.clamp(self.lower, self.upper)
    }

    fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// `size` evenly spaced coordinates from `lower` to `upper` (geometrically spaced values
    /// in log space).
    pub fn grid(&self, size: usize) -> Vec<f64> {
        match size {
            0 => Vec::new(),
            1 => vec![self.lower],
            _ => {
                let step = self.width() / (size - 1) as f64;
                (0..size)
                    .map(|i| {
                        if i + 1 == size {
                            self.upper
                        } else {
                            self.lower + step * i as f64
                        }
                    })
                    .collect()
            }
        }
    }
}

/// Maps hyperparameter values, ordered like the search dimensions, to a loss.
pub type Objective<'a> = dyn FnMut(&[f64]) -> Result<f64, ModelError> + 'a;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    /// Hyperparameter values of the best point.
    pub values: Vec<f64>,
    pub loss: f64,
    pub evaluations: usize,
}

enum Stop {
    Budget,
    Failed(ModelError),
}

impl From<ModelError> for Stop {
    fn from(e: ModelError) -> Self {
        Stop::Failed(e)
    }
}

struct Evaluator<'d, 'o, 'a> {
    dimensions: &'d [SearchDimension],
    objective: &'o mut Objective<'a>,
    budget: usize,
    evaluations: usize,
    best: Option<(Vec<f64>, f64)>,
}

impl<'d, 'o, 'a> Evaluator<'d, 'o, 'a> {
    fn new(dimensions: &'d [SearchDimension], objective: &'o mut Objective<'a>, budget: usize) -> Self {
        Self {
            dimensions,
            objective,
            budget,
            evaluations: 0,
            best: None,
        }
    }

    fn evaluate(&mut self, coordinates: &[f64]) -> Result<f64, Stop> {
        if self.evaluations >= self.budget {
            return Err(Stop::Budget);
        }
        let values: Vec<f64> = self
            .dimensions
            .iter()
            .zip(coordinates)
            .map(|(d, &c)| d.value(c))
            .collect();
        let loss = (self.objective)(&values)?;
        self.evaluations += 1;
        trace!(evaluation = self.evaluations, ?values, loss, "Objective evaluated");
        let improved = match &self.best {
            None => true,
            Some((_, best)) => loss < *best || best.is_nan(),
        };
        if improved {
            self.best = Some((values, loss));
        }
        Ok(loss)
    }

    fn finish(self, run: Result<(), Stop>) -> Result<SearchOutcome, ModelError> {
        match run {
            Ok(()) | Err(Stop::Budget) => {}
            Err(Stop::Failed(e)) => return Err(e),
        }
        let (values, loss) = self.best.ok_or_else(|| {
            ModelError::InvalidArgument("the search budget allows no evaluation".into())
        })?;
        debug!(evaluations = self.evaluations, loss, "Search finished");
        Ok(SearchOutcome {
            values,
            loss,
            evaluations: self.evaluations,
        })
    }
}

/// Bounded Nelder-Mead minimization starting from the current hyperparameter values.
///
/// Points leaving the box are clipped onto it. The search stops when both the simplex and
/// the spread of its losses fall below the configured tolerances, or when
/// `maximum_evaluations` is reached.
pub fn nelder_mead(
    dimensions: &[SearchDimension],
    settings: &LocalSearchConfig,
    maximum_evaluations: usize,
    objective: &mut Objective<'_>,
) -> Result<SearchOutcome, ModelError> {
    let mut evaluator = Evaluator::new(dimensions, objective, maximum_evaluations);
    let run = run_nelder_mead(&mut evaluator, settings);
    evaluator.finish(run)
}

fn run_nelder_mead(evaluator: &mut Evaluator<'_, '_, '_>, settings: &LocalSearchConfig) -> Result<(), Stop> {
    const RHO: f64 = 1.0;
    const CHI: f64 = 2.0;
    const PSI: f64 = 0.5;
    const SIGMA: f64 = 0.5;

    let dims = evaluator.dimensions;
    let n = dims.len();
    let clip = |x: Vec<f64>| -> Vec<f64> { x.iter().zip(dims).map(|(&c, d)| d.clamp(c)).collect() };
    let along = |from: &[f64], to: &[f64], t: f64| -> Vec<f64> {
        from.iter().zip(to).map(|(a, b)| a + t * (b - a)).collect()
    };

    let x0: Vec<f64> = dims.iter().map(|d| d.clamp(d.initial)).collect();
    let mut simplex = vec![x0.clone()];
    for (k, d) in dims.iter().enumerate() {
        let step = if d.width() > 0.0 { 0.05 * d.width() } else { 0.00025 };
        let mut x = x0.clone();
        x[k] = if x0[k] + step <= d.upper { x0[k] + step } else { x0[k] - step };
        simplex.push(clip(x));
    }
    let mut losses = Vec::with_capacity(n + 1);
    for x in &simplex {
        losses.push(evaluator.evaluate(x)?);
    }

    loop {
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&a, &b| losses[a].total_cmp(&losses[b]));
        simplex = order.iter().map(|&i| simplex[i].clone()).collect();
        losses = order.iter().map(|&i| losses[i]).collect();

        let x_spread = simplex[1..]
            .iter()
            .flat_map(|x| x.iter().zip(&simplex[0]).map(|(a, b)| (a - b).abs()))
            .fold(0.0, f64::max);
        let f_spread = losses[1..]
            .iter()
            .map(|f| (f - losses[0]).abs())
            .fold(0.0, f64::max);
        if x_spread <= settings.xatol && f_spread <= settings.fatol {
            return Ok(());
        }

        let worst = simplex[n].clone();
        let centroid: Vec<f64> = (0..n)
            .map(|k| simplex[..n].iter().map(|x| x[k]).sum::<f64>() / n as f64)
            .collect();

        let reflected = clip(along(&centroid, &worst, -RHO));
        let f_reflected = evaluator.evaluate(&reflected)?;

        let mut shrink = false;
        if f_reflected < losses[0] {
            let expanded = clip(along(&centroid, &worst, -RHO * CHI));
            let f_expanded = evaluator.evaluate(&expanded)?;
            if f_expanded < f_reflected {
                simplex[n] = expanded;
                losses[n] = f_expanded;
            } else {
                simplex[n] = reflected;
                losses[n] = f_reflected;
            }
        } else if f_reflected < losses[n - 1] {
            simplex[n] = reflected;
            losses[n] = f_reflected;
        } else if f_reflected < losses[n] {
            let contracted = clip(along(&centroid, &worst, -PSI * RHO));
            let f_contracted = evaluator.evaluate(&contracted)?;
            if f_contracted <= f_reflected {
                simplex[n] = contracted;
                losses[n] = f_contracted;
            } else {
                shrink = true;
            }
        } else {
            let contracted = clip(along(&centroid, &worst, PSI));
            let f_contracted = evaluator.evaluate(&contracted)?;
            if f_contracted < losses[n] {
                simplex[n] = contracted;
                losses[n] = f_contracted;
            } else {
                shrink = true;
            }
        }

        if shrink {
            for j in 1..=n {
                simplex[j] = along(&simplex[0], &simplex[j], SIGMA);
                losses[j] = evaluator.evaluate(&simplex[j])?;
            }
        }
    }
}

/// Bounded steepest descent with forward-difference gradients.
///
/// Each iteration estimates the gradient in search coordinates, drops the components that
/// push against an active bound and backtracks along the projected direction until the loss
/// decreases sufficiently. The search stops when an accepted step moves less than `xatol`,
/// improves the loss by less than `fatol`, or no descent step can be found.
pub fn projected_gradient(
    dimensions: &[SearchDimension],
    settings: &LocalSearchConfig,
    maximum_evaluations: usize,
    objective: &mut Objective<'_>,
) -> Result<SearchOutcome, ModelError> {
    let mut evaluator = Evaluator::new(dimensions, objective, maximum_evaluations);
    let run = run_projected_gradient(&mut evaluator, settings);
    evaluator.finish(run)
}

fn run_projected_gradient(
    evaluator: &mut Evaluator<'_, '_, '_>,
    settings: &LocalSearchConfig,
) -> Result<(), Stop> {
    const SUFFICIENT_DECREASE: f64 = 1e-4;
    const MAX_HALVINGS: usize = 40;

    let dims = evaluator.dimensions;
    let project = |x: Vec<f64>| -> Vec<f64> { x.iter().zip(dims).map(|(&c, d)| d.clamp(c)).collect() };
    let max_width = dims.iter().map(SearchDimension::width).fold(0.0, f64::max);

    let mut x: Vec<f64> = dims.iter().map(|d| d.clamp(d.initial)).collect();
    let mut fx = evaluator.evaluate(&x)?;
    if max_width == 0.0 {
        return Ok(());
    }
    let mut alpha = 0.25 * max_width;

    loop {
        let mut gradient = vec![0.0; dims.len()];
        for (k, d) in dims.iter().enumerate() {
            if d.width() == 0.0 {
                continue;
            }
            let h = 1e-7 * x[k].abs().max(1.0);
            let h = if x[k] + h <= d.upper { h } else { -h };
            let mut shifted = x.clone();
            shifted[k] += h;
            gradient[k] = (evaluator.evaluate(&shifted)? - fx) / h;
        }
        for (k, d) in dims.iter().enumerate() {
            let blocked = (x[k] <= d.lower && gradient[k] > 0.0) || (x[k] >= d.upper && gradient[k] < 0.0);
            if blocked {
                gradient[k] = 0.0;
            }
        }
        let scale = gradient.iter().fold(0.0, |m: f64, g| m.max(g.abs()));
        if scale == 0.0 || !scale.is_finite() {
            return Ok(());
        }
        let direction: Vec<f64> = gradient.iter().map(|g| -g / scale).collect();

        let mut accepted = None;
        for _ in 0..MAX_HALVINGS {
            let candidate = project(x.iter().zip(&direction).map(|(a, d)| a + alpha * d).collect());
            let slope: f64 = gradient.iter().zip(&candidate).zip(&x).map(|((g, c), a)| g * (c - a)).sum();
            if slope == 0.0 {
                break;
            }
            let f_candidate = evaluator.evaluate(&candidate)?;
            if f_candidate <= fx + SUFFICIENT_DECREASE * slope {
                accepted = Some((candidate, f_candidate));
                break;
            }
            alpha *= 0.5;
        }
        let Some((candidate, f_candidate)) = accepted else {
            return Ok(());
        };

        let movement = candidate.iter().zip(&x).fold(0.0, |m: f64, (c, a)| m.max((c - a).abs()));
        let improvement = fx - f_candidate;
        trace!(alpha, movement, improvement, "Projected gradient step accepted");
        x = candidate;
        fx = f_candidate;
        if movement <= settings.xatol || improvement <= settings.fatol {
            return Ok(());
        }
        alpha = (2.0 * alpha).min(max_width);
    }
}

/// Coordinate-descent sweep over `grid_size` candidates per dimension.
///
/// All dimensions start at their first candidate. Each dimension in turn is scanned with the
/// others held at their current candidates and fixed at its best one. This matches a full
/// Cartesian scan when the loss is separable, at a cost linear in the number of dimensions.
///
/// This is intentionally not an exhaustive product scan: interacting hyperparameters may
/// end on a point that a full grid would beat. Use [`tpe`] or a local search when that
/// matters.
pub fn grid(
    dimensions: &[SearchDimension],
    grid_size: usize,
    maximum_evaluations: usize,
    objective: &mut Objective<'_>,
) -> Result<SearchOutcome, ModelError> {
    let mut evaluator = Evaluator::new(dimensions, objective, maximum_evaluations);
    let run = run_grid(&mut evaluator, grid_size);
    evaluator.finish(run)
}

fn run_grid(evaluator: &mut Evaluator<'_, '_, '_>, grid_size: usize) -> Result<(), Stop> {
    let axes: Vec<Vec<f64>> = evaluator.dimensions.iter().map(|d| d.grid(grid_size)).collect();
    if axes.iter().any(Vec::is_empty) {
        return Ok(());
    }
    let mut current: Vec<f64> = axes.iter().map(|a| a[0]).collect();
    let mut seen: Vec<(Vec<f64>, f64)> = Vec::new();

    let mut scanned = false;
    for (k, axis) in axes.iter().enumerate() {
        if axis.len() < 2 {
            continue;
        }
        scanned = true;
        let mut best: Option<(f64, f64)> = None;
        for &candidate in axis {
            let mut point = current.clone();
            point[k] = candidate;
            let loss = evaluate_once(evaluator, &mut seen, &point)?;
            if best.is_none_or(|(_, b)| loss < b) {
                best = Some((candidate, loss));
            }
        }
        if let Some((candidate, _)) = best {
            current[k] = candidate;
        }
    }
    if !scanned {
        evaluate_once(evaluator, &mut seen, &current)?;
    }
    Ok(())
}

fn evaluate_once(
    evaluator: &mut Evaluator<'_, '_, '_>,
    seen: &mut Vec<(Vec<f64>, f64)>,
    point: &[f64],
) -> Result<f64, Stop> {
    if let Some((_, loss)) = seen.iter().find(|(p, _)| p == point) {
        return Ok(*loss);
    }
    let loss = evaluator.evaluate(point)?;
    seen.push((point.to_vec(), loss));
    Ok(loss)
}

/// Tree-structured Parzen estimator search.
///
/// After `startup_trials` uniformly sampled points, each dimension is proposed independently:
/// observed points are split into a good and a bad group by loss, a truncated Gaussian
/// mixture is fitted to each group, and the candidate (sampled from the good mixture) with
/// the best good/bad density ratio is evaluated next.
pub fn tpe(
    dimensions: &[SearchDimension],
    settings: &TpeConfig,
    maximum_evaluations: usize,
    objective: &mut Objective<'_>,
) -> Result<SearchOutcome, ModelError> {
    let mut rng = match settings.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut evaluator = Evaluator::new(dimensions, objective, maximum_evaluations);
    let run = run_tpe(&mut evaluator, settings, maximum_evaluations, &mut rng);
    evaluator.finish(run)
}

/// Good trials are capped at this count.
const MAX_GOOD_TRIALS: usize = 25;

fn run_tpe(
    evaluator: &mut Evaluator<'_, '_, '_>,
    settings: &TpeConfig,
    maximum_evaluations: usize,
    rng: &mut StdRng,
) -> Result<(), Stop> {
    let dims = evaluator.dimensions;
    let mut history: Vec<(Vec<f64>, f64)> = Vec::new();
    for trial in 0..maximum_evaluations {
        let point: Vec<f64> = if trial < settings.startup_trials.max(2) {
            dims.iter()
                .map(|d| if d.width() > 0.0 { rng.gen_range(d.lower..=d.upper) } else { d.lower })
                .collect()
        } else {
            suggest(dims, &history, settings, rng)
        };
        let loss = evaluator.evaluate(&point)?;
        history.push((point, loss));
    }
    Ok(())
}

fn suggest(
    dims: &[SearchDimension],
    history: &[(Vec<f64>, f64)],
    settings: &TpeConfig,
    rng: &mut StdRng,
) -> Vec<f64> {
    let n = history.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| history[a].1.total_cmp(&history[b].1));
    let n_good = ((settings.gamma * (n as f64).sqrt()).ceil() as usize)
        .min(MAX_GOOD_TRIALS)
        .clamp(1, n - 1);
    let (good, bad) = order.split_at(n_good);

    dims.iter()
        .enumerate()
        .map(|(k, d)| {
            if d.width() <= 0.0 {
                return d.lower;
            }
            let column = |ids: &[usize]| ids.iter().map(|&i| history[i].0[k]).collect::<Vec<_>>();
            let below = ParzenEstimator::fit(&column(good), d.lower, d.upper);
            let above = ParzenEstimator::fit(&column(bad), d.lower, d.upper);
            (0..settings.candidates)
                .map(|_| below.sample(rng))
                .map(|x| (x, below.log_density(x) - above.log_density(x)))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map_or(d.initial, |(x, _)| x)
        })
        .collect()
}

/// A mixture of Gaussians truncated to `[lower, upper]`, one at each observation plus a
/// broad prior component at the centre of the interval.
#[derive(Debug, Clone)]
struct ParzenEstimator {
    means: Vec<f64>,
    sigmas: Vec<f64>,
    lower: f64,
    upper: f64,
}

impl ParzenEstimator {
    fn fit(observations: &[f64], lower: f64, upper: f64) -> Self {
        let prior_mean = 0.5 * (lower + upper);
        let prior_sigma = upper - lower;
        let mut points: Vec<(f64, bool)> = observations.iter().map(|&x| (x, false)).collect();
        points.push((prior_mean, true));
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        let min_sigma = prior_sigma / (1.0 + observations.len() as f64).min(100.0);
        let sigmas = (0..points.len())
            .map(|i| {
                let (x, is_prior) = points[i];
                if is_prior {
                    return prior_sigma;
                }
                let left = if i > 0 { x - points[i - 1].0 } else { x - lower };
                let right = match points.get(i + 1) {
                    Some((next, _)) => next - x,
                    None => upper - x,
                };
                left.max(right).clamp(min_sigma, prior_sigma)
            })
            .collect();
        Self {
            means: points.iter().map(|p| p.0).collect(),
            sigmas,
            lower,
            upper,
        }
    }

    fn sample(&self, rng: &mut StdRng) -> f64 {
        let i = rng.gen_range(0..self.means.len());
        let (mean, sigma) = (self.means[i], self.sigmas[i]);
        for _ in 0..100 {
            let z: f64 = rng.sample(StandardNormal);
            let x = mean + sigma * z;
            if (self.lower..=self.upper).contains(&x) {
                return x;
            }
        }
        mean.clamp(self.lower, self.upper)
    }

    fn log_density(&self, x: f64) -> f64 {
        let weight = 1.0 / self.means.len() as f64;
        let terms: Vec<f64> = self
            .means
            .iter()
            .zip(&self.sigmas)
            .map(|(&mean, &sigma)| {
                let mass = normal_cdf((self.upper - mean) / sigma) - normal_cdf((self.lower - mean) / sigma);
                let z = (x - mean) / sigma;
                weight.ln() - 0.5 * z * z - (sigma * (2.0 * PI).sqrt()).ln() - mass.max(1e-300).ln()
            })
            .collect();
        let top = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        top + terms.iter().map(|t| (t - top).exp()).sum::<f64>().ln()
    }
}

fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Complementary error function, accurate to about 1e-7.
fn erfc(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 10] = [
        -1.265_512_23,
        1.000_023_68,
        0.374_091_96,
        0.096_784_18,
        -0.186_288_06,
        0.278_868_07,
        -1.135_203_98,
        1.488_515_87,
        -0.822_152_23,
        0.170_872_77,
    ];
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = COEFFICIENTS.iter().rev().fold(0.0, |acc, c| acc * t + c);
    let r = t * (poly - z * z).exp();
    if x >= 0.0 { r } else { 2.0 - r }
}
