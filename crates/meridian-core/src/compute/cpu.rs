use ndarray::{Array3, Array4, ArrayView1, ArrayViewMut1, Axis, Zip};

use crate::consts::PARALLEL_VOXEL_THRESHOLD;
use crate::transform::interp::{sample, sample_with_gradient, FillPolicy, Interpolation};

use super::{ComputeBackend, SampledGradient};

/// CPU backend using Rayon for parallelism.
pub struct CpuBackend;

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "CPU/Rayon"
    }

    fn box_sum(&self, input: &Array3<f64>, radius: usize) -> Array3<f64> {
        if radius == 0 {
            return input.clone();
        }
        let x = box_sum_axis(input, 0, radius);
        let y = box_sum_axis(&x, 1, radius);
        box_sum_axis(&y, 2, radius)
    }

    fn resample(
        &self,
        source: &Array3<f32>,
        coords: &Array4<f64>,
        interpolation: Interpolation,
        fill: FillPolicy,
    ) -> Array3<f32> {
        let (nx, ny, nz, _) = coords.dim();
        let parallel = nx * ny * nz >= PARALLEL_VOXEL_THRESHOLD;
        let mut out = Array3::<f32>::zeros((nx, ny, nz));

        let zip = Zip::from(&mut out).and(coords.lanes(Axis(3)));
        let kernel = |o: &mut f32, c: ArrayView1<f64>| {
            *o = sample(source, [c[0], c[1], c[2]], interpolation, fill) as f32;
        };
        if parallel {
            zip.par_for_each(kernel);
        } else {
            zip.for_each(kernel);
        }
        out
    }

    fn resample_with_gradient(
        &self,
        source: &Array3<f32>,
        coords: &Array4<f64>,
        fill: FillPolicy,
    ) -> SampledGradient {
        let (nx, ny, nz, _) = coords.dim();
        let parallel = nx * ny * nz >= PARALLEL_VOXEL_THRESHOLD;
        let mut values = Array3::<f64>::zeros((nx, ny, nz));
        let mut gradient = Array4::<f64>::zeros((nx, ny, nz, 3));
        let mut inside = Array3::from_elem((nx, ny, nz), false);

        let zip = Zip::from(&mut values)
            .and(gradient.lanes_mut(Axis(3)))
            .and(&mut inside)
            .and(coords.lanes(Axis(3)));
        let kernel =
            |v: &mut f64, mut g: ArrayViewMut1<f64>, ins: &mut bool, c: ArrayView1<f64>| {
                let (value, grad, is_inside) = sample_with_gradient(source, [c[0], c[1], c[2]], fill);
                *v = value;
                g[0] = grad[0];
                g[1] = grad[1];
                g[2] = grad[2];
                *ins = is_inside;
            };
        if parallel {
            zip.par_for_each(kernel);
        } else {
            zip.for_each(kernel);
        }

        SampledGradient {
            values,
            gradient,
            inside,
        }
    }
}

/// One separable pass of the clipped box sum, via a prefix sum per lane.
fn box_sum_axis(input: &Array3<f64>, axis: usize, radius: usize) -> Array3<f64> {
    let n = input.len_of(Axis(axis));
    let parallel = input.len() >= PARALLEL_VOXEL_THRESHOLD;
    let mut out = Array3::<f64>::zeros(input.raw_dim());

    let zip = Zip::from(out.lanes_mut(Axis(axis))).and(input.lanes(Axis(axis)));
    let kernel = |mut o: ArrayViewMut1<f64>, lane: ArrayView1<f64>| {
        let mut prefix = vec![0.0f64; n + 1];
        for (t, v) in lane.iter().enumerate() {
            prefix[t + 1] = prefix[t] + v;
        }
        for t in 0..n {
            let lo = t.saturating_sub(radius);
            let hi = (t + radius + 1).min(n);
            o[t] = prefix[hi] - prefix[lo];
        }
    };
    if parallel {
        zip.par_for_each(kernel);
    } else {
        zip.for_each(kernel);
    }
    out
}
