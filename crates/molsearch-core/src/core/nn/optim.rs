use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AdamState {
    step: u64,
    m: DMatrix<f64>,
    v: DMatrix<f64>,
}

/// Adam with decoupled weight decay, one state slot per registered parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamW {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// Decoupled weight decay per parameter slot.
    pub weight_decay: Vec<f64>,
    state: Vec<Option<AdamState>>,
}

impl AdamW {
    pub fn new(lr: f64, weight_decay: Vec<f64>) -> Self {
        let slots = weight_decay.len();
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            state: vec![None; slots],
        }
    }

    /// Drops moment estimates and step counts.
    pub fn reset_state(&mut self) {
        self.state.iter_mut().for_each(|s| *s = None);
    }

    /// Updates parameter `slot` with gradient `grad`.
    pub fn update(&mut self, slot: usize, param: &mut DMatrix<f64>, grad: &DMatrix<f64>) {
        if slot >= self.state.len() {
            self.state.resize(slot + 1, None);
            self.weight_decay.resize(slot + 1, 0.0);
        }
        let decay = self.weight_decay[slot];
        let state = self.state[slot].get_or_insert_with(|| AdamState {
            step: 0,
            m: DMatrix::zeros(param.nrows(), param.ncols()),
            v: DMatrix::zeros(param.nrows(), param.ncols()),
        });
        state.step += 1;
        let (b1, b2) = (self.beta1, self.beta2);
        state.m.zip_apply(grad, |m, g| *m = b1 * *m + (1.0 - b1) * g);
        state.v.zip_apply(grad, |v, g| *v = b2 * *v + (1.0 - b2) * g * g);
        let bias1 = 1.0 - b1.powi(state.step as i32);
        let bias2 = 1.0 - b2.powi(state.step as i32);
        let lr = self.lr;
        let eps = self.eps;
        param.apply(|p| *p *= 1.0 - lr * decay);
        for ((p, m), v) in param.iter_mut().zip(state.m.iter()).zip(state.v.iter()) {
            let m_hat = m / bias1;
            let v_hat = v / bias2;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        }
    }
}

/// Plain stochastic gradient descent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    pub lr: f64,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }

    pub fn update(&self, param: &mut DVector<f64>, grad: &DVector<f64>) {
        param.axpy(-self.lr, grad, 1.0);
    }
}

/// Reduces a learning rate when a monitored metric stops improving.
///
/// Uses relative thresholding in minimisation mode: a metric is an improvement when it
/// is below `best * (1 - threshold)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceLrOnPlateau {
    pub factor: f64,
    pub patience: u64,
    pub threshold: f64,
    pub min_lr: f64,
    pub best: f64,
    pub num_bad_epochs: u64,
    pub last_epoch: u64,
}

const MIN_LR_CHANGE: f64 = 1e-8;

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: u64, threshold: f64) -> Self {
        Self {
            factor,
            patience,
            threshold,
            min_lr: 0.0,
            best: f64::INFINITY,
            num_bad_epochs: 0,
            last_epoch: 0,
        }
    }

    pub fn is_better(&self, metric: f64, best: f64) -> bool {
        metric < best * (1.0 - self.threshold)
    }

    /// Records `metric` for one epoch and lowers `lr` if patience ran out.
    pub fn step(&mut self, metric: f64, lr: &mut f64) {
        self.last_epoch += 1;
        if self.is_better(metric, self.best) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }
        if self.num_bad_epochs > self.patience {
            let reduced = (*lr * self.factor).max(self.min_lr);
            if *lr - reduced > MIN_LR_CHANGE {
                *lr = reduced;
            }
            self.num_bad_epochs = 0;
        }
    }
}
