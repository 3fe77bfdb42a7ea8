use ndarray::{Array3, Array4, ArrayView1, ArrayViewMut1, Axis, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compute::ComputeBackend;
use crate::consts::{
    DEFAULT_CONVERGENCE_THRESHOLD, DEFAULT_CONVERGENCE_WINDOW, DEFAULT_DEFORMABLE_ITERATIONS,
    DEFAULT_INTEGRATION_STEPS, PARALLEL_VOXEL_THRESHOLD,
};
use crate::error::{MeridianError, Result};
use crate::similarity::{self, regularization, SimilarityConfig};
use crate::transform::interp::{sample_vector, sample_vector_with_jacobian, scatter_vector};
use crate::transform::{DeformationField, FillPolicy};
use crate::volume::Volume;

use super::optim::{Adam, ConvergenceMonitor};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeformableConfig {
    pub enabled: bool,
    pub max_iterations: usize,
    pub learning_rate: f64,
    /// Weight of the second-difference (bending) penalty.
    pub smoothness_weight: f64,
    /// Weight of the first-difference (gradient magnitude) penalty.
    pub gradient_weight: f64,
    /// Number of squarings used to exponentiate the velocity field.
    pub integration_steps: usize,
    /// Check the Jacobian determinant every this many iterations (0 disables).
    pub jacobian_check_interval: usize,
    pub convergence_window: usize,
    pub convergence_threshold: f64,
    pub log_interval: usize,
}

impl Default for DeformableConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: DEFAULT_DEFORMABLE_ITERATIONS,
            learning_rate: 0.05,
            smoothness_weight: 1.0,
            gradient_weight: 0.1,
            integration_steps: DEFAULT_INTEGRATION_STEPS,
            jacobian_check_interval: 250,
            convergence_window: DEFAULT_CONVERGENCE_WINDOW,
            convergence_threshold: DEFAULT_CONVERGENCE_THRESHOLD,
            log_interval: 250,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeformableEvaluation {
    /// Similarity plus weighted penalties.
    pub loss: f64,
    pub similarity_loss: f64,
    pub penalty: f64,
    pub overlap: f64,
    /// Derivative of `loss` with respect to every velocity component.
    pub gradient: Array4<f64>,
    /// Integrated displacement, voxel units of the fixed grid.
    pub displacement: Array4<f64>,
}

#[derive(Clone, Debug)]
pub struct DeformableResult {
    /// Best displacement seen, in mm on the fixed grid.
    pub field: DeformationField,
    pub converged: bool,
    pub iterations: usize,
    pub initial_loss: f64,
    pub best_loss: f64,
    pub min_jacobian: f64,
    /// Fraction of voxels with a non-positive Jacobian determinant.
    pub folding_fraction: f64,
}

/// One squaring: `u + u o (id + u)`, with `u` in voxel units.
fn squaring_step(u: &Array4<f64>) -> Array4<f64> {
    let mut out = Array4::<f64>::zeros(u.raw_dim());
    let parallel = out.len() / 3 >= PARALLEL_VOXEL_THRESHOLD;
    let kernel = |(i, j, k): (usize, usize, usize), mut o: ArrayViewMut1<f64>, ux: ArrayView1<f64>| {
        let p = [i as f64 + ux[0], j as f64 + ux[1], k as f64 + ux[2]];
        let s = sample_vector(u, p);
        for c in 0..3 {
            o[c] = ux[c] + s[c];
        }
    };
    let zip = Zip::indexed(out.lanes_mut(Axis(3))).and(u.lanes(Axis(3)));
    if parallel {
        zip.par_for_each(kernel);
    } else {
        zip.for_each(kernel);
    }
    out
}

/// Scaling and squaring of a stationary velocity field.
///
/// Returns the whole trajectory `u_0 = v / 2^steps, ..., u_steps`; the last
/// entry is the displacement of `exp(v)`.
pub fn integrate_velocity(velocity: &Array4<f64>, steps: usize) -> Vec<Array4<f64>> {
    let scale = 0.5f64.powi(steps as i32);
    let mut trajectory = Vec::with_capacity(steps + 1);
    trajectory.push(velocity * scale);
    for k in 0..steps {
        let next = squaring_step(&trajectory[k]);
        trajectory.push(next);
    }
    trajectory
}

/// Adjoint of one squaring step: given `dL/du_{k+1}`, return `dL/du_k`.
fn squaring_adjoint(u: &Array4<f64>, upstream: &Array4<f64>) -> Array4<f64> {
    let mut grad = upstream.clone();
    let parallel = grad.len() / 3 >= PARALLEL_VOXEL_THRESHOLD;

    // Dependence of the sampling position on u(x).
    let kernel = |(i, j, k): (usize, usize, usize),
                  mut g: ArrayViewMut1<f64>,
                  ux: ArrayView1<f64>,
                  up: ArrayView1<f64>| {
        let p = [i as f64 + ux[0], j as f64 + ux[1], k as f64 + ux[2]];
        let (_, jac) = sample_vector_with_jacobian(u, p);
        for a in 0..3 {
            g[a] += (0..3).map(|c| up[c] * jac[c][a]).sum::<f64>();
        }
    };
    let zip = Zip::indexed(grad.lanes_mut(Axis(3)))
        .and(u.lanes(Axis(3)))
        .and(upstream.lanes(Axis(3)));
    if parallel {
        zip.par_for_each(kernel);
    } else {
        zip.for_each(kernel);
    }

    // Dependence of the sampled value on the field nodes.
    let (nx, ny, nz, _) = u.dim();
    for i in 0..nx {
        for j in 0..ny {
            for k in 0..nz {
                let p = [
                    i as f64 + u[[i, j, k, 0]],
                    j as f64 + u[[i, j, k, 1]],
                    k as f64 + u[[i, j, k, 2]],
                ];
                let value = [
                    upstream[[i, j, k, 0]],
                    upstream[[i, j, k, 1]],
                    upstream[[i, j, k, 2]],
                ];
                scatter_vector(&mut grad, p, value);
            }
        }
    }
    grad
}

/// Objective of the deformable stage over a stationary velocity field on the
/// fixed grid.
pub struct DeformableObjective<'a> {
    backend: &'a dyn ComputeBackend,
    fixed: Array3<f64>,
    moving: &'a Volume,
    identity: Array4<f64>,
    similarity: &'a SimilarityConfig,
    config: &'a DeformableConfig,
    fill: FillPolicy,
}

impl<'a> DeformableObjective<'a> {
    /// `moving` must already be resampled onto the fixed grid.
    pub fn new(
        backend: &'a dyn ComputeBackend,
        fixed: &'a Volume,
        moving: &'a Volume,
        similarity: &'a SimilarityConfig,
        config: &'a DeformableConfig,
        fill: FillPolicy,
    ) -> Result<Self> {
        if fixed.dims() != moving.dims() {
            return Err(MeridianError::InvalidVolume(
                "deformable stage requires the moving volume on the fixed grid".into(),
            ));
        }
        let [nx, ny, nz] = fixed.dims();
        let identity = Array4::from_shape_fn((nx, ny, nz, 3), |(i, j, k, c)| {
            [i, j, k][c] as f64
        });
        Ok(Self {
            backend,
            fixed: fixed.data().mapv(f64::from),
            moving,
            identity,
            similarity,
            config,
            fill,
        })
    }

    pub fn evaluate(&self, velocity: &Array4<f64>) -> Result<DeformableEvaluation> {
        let steps = self.config.integration_steps;
        let mut trajectory = integrate_velocity(velocity, steps);
        let coords = &self.identity + &trajectory[steps];
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
        let (penalty, mut grad) = regularization(
            &trajectory[steps],
            self.config.smoothness_weight,
            self.config.gradient_weight,
        );

        Zip::from(grad.lanes_mut(Axis(3)))
            .and(sampled.gradient.lanes(Axis(3)))
            .and(&sim.gradient)
            .for_each(|mut g, sg, &d| {
                for c in 0..3 {
                    g[c] += d * sg[c];
                }
            });

        for k in (0..steps).rev() {
            grad = squaring_adjoint(&trajectory[k], &grad);
        }
        grad *= 0.5f64.powi(steps as i32);

        let displacement = trajectory.swap_remove(steps);
        Ok(DeformableEvaluation {
            loss: sim.loss + penalty,
            similarity_loss: sim.loss,
            penalty,
            overlap: sim.overlap,
            gradient: grad,
            displacement,
        })
    }
}

fn folding_stats(field: &DeformationField) -> (f64, f64) {
    let det = field.jacobian_determinant();
    let min = det.iter().copied().fold(f64::INFINITY, f64::min);
    let folded = det.iter().filter(|&&d| d <= 0.0).count() as f64 / det.len().max(1) as f64;
    (min, folded)
}

/// Optimize a diffeomorphic displacement aligning `moving` (already on the
/// fixed grid) to `fixed`.
///
/// The field is parameterized by a stationary velocity and exponentiated by
/// scaling and squaring, so every iterate is invertible up to discretization.
pub fn register_deformable(
    backend: &dyn ComputeBackend,
    fixed: &Volume,
    moving: &Volume,
    similarity: &SimilarityConfig,
    config: &DeformableConfig,
    fill: FillPolicy,
) -> Result<DeformableResult> {
    let objective = DeformableObjective::new(backend, fixed, moving, similarity, config, fill)?;
    let [nx, ny, nz] = fixed.dims();
    let mut velocity = Array4::<f64>::zeros((nx, ny, nz, 3));
    let mut adam = Adam::new(config.learning_rate, velocity.raw_dim());
    let mut monitor = ConvergenceMonitor::new(config.convergence_window, config.convergence_threshold);
    let log_interval = config.log_interval.max(1);

    let mut best = Array4::<f64>::zeros((nx, ny, nz, 3));
    let mut initial_loss = f64::NAN;
    let mut converged = false;

    for iteration in 0..config.max_iterations {
        let eval = match objective.evaluate(&velocity) {
            Ok(eval) => eval,
            // A step that pushed the moving volume out of the fixed field of
            // view ends the run with the best iterate seen so far.
            Err(MeridianError::DegenerateOverlap { overlap }) if iteration > 0 => {
                warn!(iteration, overlap, "Deformable step lost overlap, keeping best iterate");
                break;
            }
            Err(e) => return Err(e),
        };
        if iteration == 0 {
            initial_loss = eval.loss;
        }
        if monitor.record(eval.loss) {
            best = eval.displacement;
        }
        if iteration % log_interval == 0 {
            debug!(
                iteration,
                loss = eval.loss,
                similarity = eval.similarity_loss,
                penalty = eval.penalty,
                "Deformable iteration"
            );
        }
        if config.jacobian_check_interval > 0
            && iteration > 0
            && iteration % config.jacobian_check_interval == 0
        {
            let field = DeformationField::from_voxel_displacement(fixed.grid().clone(), &best)?;
            let (min_jacobian, folded) = folding_stats(&field);
            if folded > 0.0 {
                warn!(iteration, min_jacobian, folded, "Deformation field folds");
            } else {
                debug!(iteration, min_jacobian, "Jacobian check");
            }
        }
        if monitor.converged() {
            converged = true;
            break;
        }
        adam.step(&mut velocity, &eval.gradient);
    }

    let field = DeformationField::from_voxel_displacement(fixed.grid().clone(), &best)?;
    let (min_jacobian, folding_fraction) = folding_stats(&field);

    if converged {
        info!(
            iterations = monitor.iterations(),
            loss = monitor.best(),
            min_jacobian,
            "Deformable registration converged"
        );
    } else {
        warn!(
            iterations = monitor.iterations(),
            loss = monitor.best(),
            "Deformable registration stopped without converging"
        );
    }

    Ok(DeformableResult {
        field,
        converged,
        iterations: monitor.iterations(),
        initial_loss,
        best_loss: monitor.best(),
        min_jacobian,
        folding_fraction,
    })
}
