use nalgebra::{Matrix3, Vector3};
use ndarray::{Array1, Array3, Ix1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compute::{ComputeBackend, SampledGradient};
use crate::consts::{
    DEFAULT_AFFINE_ITERATIONS, DEFAULT_CONVERGENCE_THRESHOLD, DEFAULT_CONVERGENCE_WINDOW,
    PARALLEL_VOXEL_THRESHOLD,
};
use crate::error::{MeridianError, Result};
use crate::similarity::{self, SimilarityConfig};
use crate::transform::{sampling_coordinates, AffineTransform, FillPolicy, Transform};
use crate::volume::{Grid, Volume};

use super::optim::{Adam, ConvergenceMonitor};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AffineConfig {
    pub max_iterations: usize,
    pub learning_rate: f64,
    /// Trailing window (iterations) over which improvement is measured.
    pub convergence_window: usize,
    /// Relative improvement over the window below which the stage stops.
    pub convergence_threshold: f64,
    /// Emit a debug line every this many iterations.
    pub log_interval: usize,
}

impl Default for AffineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_AFFINE_ITERATIONS,
            learning_rate: 0.05,
            convergence_window: DEFAULT_CONVERGENCE_WINDOW,
            convergence_threshold: DEFAULT_CONVERGENCE_THRESHOLD,
            log_interval: 100,
        }
    }
}

/// Loss of one affine estimate with its gradient with respect to the raw
/// matrix entries of `y = L x + b`.
#[derive(Clone, Debug)]
pub struct AffineEvaluation {
    pub loss: f64,
    pub overlap: f64,
    pub gradient_linear: Matrix3<f64>,
    pub gradient_translation: Vector3<f64>,
}

#[derive(Clone, Debug)]
pub struct AffineResult {
    /// Best estimate seen during optimization.
    pub transform: AffineTransform,
    pub converged: bool,
    pub iterations: usize,
    pub initial_loss: f64,
    pub best_loss: f64,
}

/// Similarity of `fixed` against `moving` resampled through an affine map.
pub struct AffineObjective<'a> {
    backend: &'a dyn ComputeBackend,
    fixed: Array3<f64>,
    fixed_grid: &'a Grid,
    moving: &'a Volume,
    similarity: &'a SimilarityConfig,
    fill: FillPolicy,
}

impl<'a> AffineObjective<'a> {
    pub fn new(
        backend: &'a dyn ComputeBackend,
        fixed: &'a Volume,
        moving: &'a Volume,
        similarity: &'a SimilarityConfig,
        fill: FillPolicy,
    ) -> Self {
        Self {
            backend,
            fixed: fixed.data().mapv(f64::from),
            fixed_grid: fixed.grid(),
            moving,
            similarity,
            fill,
        }
    }

    pub fn evaluate(&self, transform: &AffineTransform) -> Result<AffineEvaluation> {
        let coords =
            sampling_coordinates(&Transform::Affine(*transform), self.fixed_grid, self.moving.grid());
        let sampled = self
            .backend
            .resample_with_gradient(self.moving.data(), &coords, self.fill);
        let sim = similarity::evaluate(
            self.backend,
            self.similarity,
            &self.fixed,
            &sampled.values,
            &sampled.inside,
        )?;
        let (gradient_linear, gradient_translation) =
            self.chain_rule(&sampled, &sim.gradient);
        Ok(AffineEvaluation {
            loss: sim.loss,
            overlap: sim.overlap,
            gradient_linear,
            gradient_translation,
        })
    }

    /// Push `dL/dJ` back through the sampler onto `L` and `b`.
    fn chain_rule(
        &self,
        sampled: &SampledGradient,
        dloss: &Array3<f64>,
    ) -> (Matrix3<f64>, Vector3<f64>) {
        let [nx, ny, nz] = self.fixed_grid.dims();
        let to_index_t = self.moving.grid().physical_to_index_matrix().transpose();
        let grid = self.fixed_grid;

        let slab = |i: usize| {
            let mut gl = Matrix3::<f64>::zeros();
            let mut gb = Vector3::<f64>::zeros();
            for j in 0..ny {
                for k in 0..nz {
                    let d = dloss[[i, j, k]];
                    if d == 0.0 {
                        continue;
                    }
                    let g_idx = Vector3::new(
                        sampled.gradient[[i, j, k, 0]],
                        sampled.gradient[[i, j, k, 1]],
                        sampled.gradient[[i, j, k, 2]],
                    );
                    let g = to_index_t * g_idx * d;
                    let p = grid.index_to_physical([i as f64, j as f64, k as f64]);
                    gl += g * p.coords.transpose();
                    gb += g;
                }
            }
            (gl, gb)
        };
        let sum = |a: (Matrix3<f64>, Vector3<f64>), b: (Matrix3<f64>, Vector3<f64>)| {
            (a.0 + b.0, a.1 + b.1)
        };
        let zero = || (Matrix3::zeros(), Vector3::zeros());

        if grid.voxel_count() >= PARALLEL_VOXEL_THRESHOLD {
            (0..nx).into_par_iter().map(slab).reduce(zero, sum)
        } else {
            (0..nx).map(slab).fold(zero(), sum)
        }
    }
}

/// Parameterization about the fixed-grid center `c`:
/// `T(x) = M (x - c) + c + t` with `M = I + D / R`, where `R` is the grid
/// radius so that all twelve parameters move points by comparable distances.
struct CenteredParams {
    center: Vector3<f64>,
    radius: f64,
}

impl CenteredParams {
    fn encode(&self, transform: &AffineTransform) -> Array1<f64> {
        let m = transform.linear();
        let t = m * self.center + transform.translation() - self.center;
        let d = (m - Matrix3::identity()) * self.radius;
        let mut p = Array1::<f64>::zeros(12);
        for r in 0..3 {
            for s in 0..3 {
                p[r * 3 + s] = d[(r, s)];
            }
            p[9 + r] = t[r];
        }
        p
    }

    fn decode(&self, p: &Array1<f64>) -> AffineTransform {
        let mut m = Matrix3::identity();
        for r in 0..3 {
            for s in 0..3 {
                m[(r, s)] += p[r * 3 + s] / self.radius;
            }
        }
        let t = Vector3::new(p[9], p[10], p[11]);
        let b = self.center + t - m * self.center;
        AffineTransform::from_parts(&m, &b)
    }

    fn gradient(&self, eval: &AffineEvaluation) -> Array1<f64> {
        let gm = eval.gradient_linear - eval.gradient_translation * self.center.transpose();
        let mut g = Array1::<f64>::zeros(12);
        for r in 0..3 {
            for s in 0..3 {
                g[r * 3 + s] = gm[(r, s)] / self.radius;
            }
            g[9 + r] = eval.gradient_translation[r];
        }
        g
    }
}

/// Refine `initial` by Adam descent on the similarity loss.
///
/// Stops at the iteration cap or when the loss stalls over the convergence
/// window. Non-convergence is reported in the result, never as an error.
pub fn register_affine(
    backend: &dyn ComputeBackend,
    fixed: &Volume,
    moving: &Volume,
    initial: &AffineTransform,
    similarity: &SimilarityConfig,
    config: &AffineConfig,
    fill: FillPolicy,
) -> Result<AffineResult> {
    let objective = AffineObjective::new(backend, fixed, moving, similarity, fill);
    let params_map = CenteredParams {
        center: fixed.grid().center().coords,
        radius: fixed.grid().radius(),
    };
    let mut params = params_map.encode(initial);
    let mut adam = Adam::new(config.learning_rate, Ix1(12));
    let mut monitor = ConvergenceMonitor::new(config.convergence_window, config.convergence_threshold);
    let log_interval = config.log_interval.max(1);

    let mut best = *initial;
    let mut initial_loss = f64::NAN;
    let mut converged = false;

    for iteration in 0..config.max_iterations {
        let transform = params_map.decode(&params);
        let eval = match objective.evaluate(&transform) {
            Ok(eval) => eval,
            // A step that pushed the moving volume out of the fixed field of
            // view ends the run with the best iterate seen so far.
            Err(MeridianError::DegenerateOverlap { overlap }) if iteration > 0 => {
                warn!(iteration, overlap, "Affine step lost overlap, keeping best iterate");
                break;
            }
            Err(e) => return Err(e),
        };
        if iteration == 0 {
            initial_loss = eval.loss;
        }
        if monitor.record(eval.loss) {
            best = transform;
        }
        if iteration % log_interval == 0 {
            debug!(
                iteration,
                loss = eval.loss,
                overlap = eval.overlap,
                "Affine iteration"
            );
        }
        if monitor.converged() {
            converged = true;
            break;
        }
        adam.step(&mut params, &params_map.gradient(&eval));
    }

    if converged {
        info!(
            iterations = monitor.iterations(),
            loss = monitor.best(),
            "Affine registration converged"
        );
    } else {
        warn!(
            iterations = monitor.iterations(),
            loss = monitor.best(),
            "Affine registration stopped without converging"
        );
    }

    Ok(AffineResult {
        transform: best,
        converged,
        iterations: monitor.iterations(),
        initial_loss,
        best_loss: monitor.best(),
    })
}
