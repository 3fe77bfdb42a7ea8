//! Penalties on dense displacement fields `(nx, ny, nz, 3)` in voxel units.
//!
//! Both penalties return `(value, d value / d field)`.

use ndarray::{Array4, Axis, Slice};

/// Mean squared forward difference along each spatial axis.
pub fn gradient_penalty(field: &Array4<f64>) -> (f64, Array4<f64>) {
    let mut grad = Array4::<f64>::zeros(field.raw_dim());
    let mut terms = 0usize;
    let mut diffs = Vec::with_capacity(3);
    for a in 0..3 {
        if field.len_of(Axis(a)) < 2 {
            continue;
        }
        let d = &field.slice_axis(Axis(a), Slice::from(1..))
            - &field.slice_axis(Axis(a), Slice::from(..-1));
        terms += d.len();
        diffs.push((a, d));
    }
    if terms == 0 {
        return (0.0, grad);
    }
    let m = terms as f64;
    let mut value = 0.0;
    for (a, d) in diffs {
        value += d.iter().map(|v| v * v).sum::<f64>();
        let scaled = d.mapv(|v| 2.0 * v / m);
        let mut hi = grad.slice_axis_mut(Axis(a), Slice::from(1..));
        hi += &scaled;
        let mut lo = grad.slice_axis_mut(Axis(a), Slice::from(..-1));
        lo -= &scaled;
    }
    (value / m, grad)
}

/// Mean squared second difference along each spatial axis (a discrete
/// bending penalty; affine-free fields cost nothing).
pub fn smoothness_penalty(field: &Array4<f64>) -> (f64, Array4<f64>) {
    let mut grad = Array4::<f64>::zeros(field.raw_dim());
    let mut terms = 0usize;
    let mut diffs = Vec::with_capacity(3);
    for a in 0..3 {
        if field.len_of(Axis(a)) < 3 {
            continue;
        }
        let lower = field.slice_axis(Axis(a), Slice::from(..-2));
        let middle = field.slice_axis(Axis(a), Slice::from(1..-1));
        let upper = field.slice_axis(Axis(a), Slice::from(2..));
        let d = &upper - &(&middle * 2.0) + &lower;
        terms += d.len();
        diffs.push((a, d));
    }
    if terms == 0 {
        return (0.0, grad);
    }
    let m = terms as f64;
    let mut value = 0.0;
    for (a, d) in diffs {
        value += d.iter().map(|v| v * v).sum::<f64>();
        let scaled = d.mapv(|v| 2.0 * v / m);
        let mut upper = grad.slice_axis_mut(Axis(a), Slice::from(2..));
        upper += &scaled;
        let mut middle = grad.slice_axis_mut(Axis(a), Slice::from(1..-1));
        middle.scaled_add(-2.0, &scaled);
        let mut lower = grad.slice_axis_mut(Axis(a), Slice::from(..-2));
        lower += &scaled;
    }
    (value / m, grad)
}

/// Weighted sum of both penalties.
pub fn regularization(
    field: &Array4<f64>,
    smoothness_weight: f64,
    gradient_weight: f64,
) -> (f64, Array4<f64>) {
    let mut value = 0.0;
    let mut grad = Array4::<f64>::zeros(field.raw_dim());
    if smoothness_weight > 0.0 {
        let (v, g) = smoothness_penalty(field);
        value += smoothness_weight * v;
        grad.scaled_add(smoothness_weight, &g);
    }
    if gradient_weight > 0.0 {
        let (v, g) = gradient_penalty(field);
        value += gradient_weight * v;
        grad.scaled_add(gradient_weight, &g);
    }
    (value, grad)
}
