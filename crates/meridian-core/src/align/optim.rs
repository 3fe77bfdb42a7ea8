use std::collections::VecDeque;

use ndarray::{Array, Dimension, Zip};

use crate::consts::{EPSILON, PARALLEL_VOXEL_THRESHOLD};

/// Adam with bias-corrected first and second moment estimates.
#[derive(Clone, Debug)]
pub struct Adam<D: Dimension> {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    step: i32,
    m: Array<f64, D>,
    v: Array<f64, D>,
}

impl<D: Dimension> Adam<D> {
    pub fn new(learning_rate: f64, shape: D) -> Self {
        Self::with_betas(learning_rate, 0.9, 0.999, 1e-8, shape)
    }

    pub fn with_betas(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64, shape: D) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            step: 0,
            m: Array::zeros(shape.clone()),
            v: Array::zeros(shape),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Apply one descent update to `params` in place.
    pub fn step(&mut self, params: &mut Array<f64, D>, grads: &Array<f64, D>) {
        self.step = self.step.saturating_add(1);
        let (b1, b2, eps, lr) = (self.beta1, self.beta2, self.epsilon, self.learning_rate);
        let c1 = 1.0 - b1.powi(self.step);
        let c2 = 1.0 - b2.powi(self.step);
        let parallel = params.len() >= PARALLEL_VOXEL_THRESHOLD;

        let update = |p: &mut f64, m: &mut f64, v: &mut f64, &g: &f64| {
            *m = b1 * *m + (1.0 - b1) * g;
            *v = b2 * *v + (1.0 - b2) * g * g;
            let m_hat = *m / c1;
            let v_hat = *v / c2;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        };
        let zip = Zip::from(params).and(&mut self.m).and(&mut self.v).and(grads);
        if parallel {
            zip.par_for_each(update);
        } else {
            zip.for_each(update);
        }
    }
}

/// Detects stalled optimization from a trailing window of losses and keeps
/// track of the best loss seen.
#[derive(Clone, Debug)]
pub struct ConvergenceMonitor {
    window: usize,
    threshold: f64,
    history: VecDeque<f64>,
    best: f64,
    best_iteration: usize,
    iteration: usize,
}

impl ConvergenceMonitor {
    pub fn new(window: usize, threshold: f64) -> Self {
        Self {
            window: window.max(1),
            threshold,
            history: VecDeque::with_capacity(window.max(1) + 1),
            best: f64::INFINITY,
            best_iteration: 0,
            iteration: 0,
        }
    }

    /// Record a loss. Returns `true` when the loss improved on the best so far.
    pub fn record(&mut self, loss: f64) -> bool {
        let improved = loss < self.best;
        if improved {
            self.best = loss;
            self.best_iteration = self.iteration;
        }
        self.history.push_back(loss);
        if self.history.len() > self.window + 1 {
            self.history.pop_front();
        }
        self.iteration += 1;
        improved
    }

    /// True once a full window has passed with relative improvement below the threshold.
    pub fn converged(&self) -> bool {
        if self.history.len() <= self.window {
            return false;
        }
        let Some(&oldest) = self.history.front() else {
            return false;
        };
        let recent_best = self
            .history
            .iter()
            .skip(1)
            .copied()
            .fold(f64::INFINITY, f64::min);
        let improvement = (oldest - recent_best) / oldest.abs().max(EPSILON);
        improvement < self.threshold
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn best_iteration(&self) -> usize {
        self.best_iteration
    }

    pub fn iterations(&self) -> usize {
        self.iteration
    }
}
