//! Dense Farnebäck optical flow.
//!
//! Each frame is approximated locally by a quadratic polynomial
//! `x^T A x + b^T x + c`. Displacement is recovered from how the polynomial
//! coefficients change between frames, refined coarse to fine over a Gaussian
//! pyramid.

use ndarray::{Array2, Array3};

use super::raster::{box_blur, gaussian_blur, load_gray, resize, sample};
use super::{BackendError, BackendKind, FlowBackend, FlowRequest};
use crate::codec::{self, FlowField};

/// Tuning for the estimator. The fast backend always runs with
/// [`FARNEBACK_PARAMS`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FarnebackParams {
    /// Size ratio between consecutive pyramid levels.
    pub pyr_scale: f32,
    /// Pyramid levels including the full-resolution frame.
    pub levels: usize,
    /// Side of the averaging window for the displacement solve.
    pub win_size: usize,
    /// Refinement passes per pyramid level.
    pub iterations: usize,
    /// Half-width of the polynomial-fit neighbourhood.
    pub poly_n: usize,
    /// Gaussian weighting of the polynomial fit.
    pub poly_sigma: f32,
}

pub const FARNEBACK_PARAMS: FarnebackParams = FarnebackParams {
    pyr_scale: 0.5,
    levels: 3,
    win_size: 15,
    iterations: 3,
    poly_n: 5,
    poly_sigma: 1.2,
};

/// Coarser levels are skipped once either side would drop below this.
const MIN_LEVEL_SIZE: usize = 32;
/// Down-weights pixels within five pixels of the border.
const BORDER_WEIGHTS: [f32; 5] = [0.14, 0.14, 0.4472, 0.8669, 1.0];
/// Coefficients stored per pixel: `b1, b2, a11, a22, a12`.
const POLY_CHANNELS: usize = 5;

/// Estimates both directions in process and writes them with the codec.
#[derive(Debug, Clone)]
pub struct FarnebackBackend {
    params: FarnebackParams,
}

impl FarnebackBackend {
    pub fn new(params: FarnebackParams) -> Self {
        Self { params }
    }
}

impl FlowBackend for FarnebackBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fast
    }

    fn compute(&self, request: &FlowRequest<'_>) -> Result<(), BackendError> {
        let start = load_gray(request.start_frame)?;
        let end = load_gray(request.end_frame)?;
        if start.dim() != end.dim() {
            return Err(BackendError::FrameSizeMismatch {
                start: start.dim(),
                end: end.dim(),
            });
        }
        let params = self.params;
        let (forward, backward) = std::thread::scope(|scope| {
            let backward = scope.spawn(|| estimate_flow(&end, &start, &params));
            let forward = estimate_flow(&start, &end, &params);
            let backward = backward
                .join()
                .unwrap_or(Err(BackendError::EstimatorPanicked));
            (forward, backward)
        });
        codec::write_flow(request.forward, &forward?)?;
        codec::write_flow(request.backward, &backward?)?;
        Ok(())
    }
}

/// Flow from `prev` to `next`: for every pixel of `prev`, where it moved to.
pub fn estimate_flow(
    prev: &Array2<f32>,
    next: &Array2<f32>,
    params: &FarnebackParams,
) -> Result<FlowField, BackendError> {
    let expansion = PolyExpansion::new(params.poly_n, params.poly_sigma).ok_or(
        BackendError::SingularExpansion {
            poly_n: params.poly_n,
            poly_sigma: params.poly_sigma,
        },
    )?;
    let prev_pyramid = build_pyramid(prev, params);
    let next_pyramid = build_pyramid(next, params);

    let mut flow: Option<Array3<f32>> = None;
    for (prev_level, next_level) in prev_pyramid.iter().zip(&next_pyramid).rev() {
        let (height, width) = prev_level.dim();
        let mut level_flow = match flow.take() {
            Some(coarse) => upscale_flow(&coarse, height, width),
            None => Array3::zeros((height, width, 2)),
        };
        let r0 = expansion.apply(prev_level);
        let r1 = expansion.apply(next_level);
        for _ in 0..params.iterations.max(1) {
            let matrices = box_blur(&update_matrices(&r0, &r1, &level_flow), params.win_size);
            level_flow = solve_flow(&matrices);
        }
        flow = Some(level_flow);
    }
    let (height, width) = prev.dim();
    let flow = flow.unwrap_or_else(|| Array3::zeros((height, width, 2)));
    Ok(FlowField::from_array(flow).unwrap_or_else(|| FlowField::zeros(width, height)))
}

fn build_pyramid(image: &Array2<f32>, params: &FarnebackParams) -> Vec<Array2<f32>> {
    let mut levels = vec![image.clone()];
    let sigma = (1.0 / params.pyr_scale - 1.0) * 0.5;
    for _ in 1..params.levels {
        let Some(last) = levels.last() else { break };
        let (height, width) = last.dim();
        let next_h = (height as f32 * params.pyr_scale).round() as usize;
        let next_w = (width as f32 * params.pyr_scale).round() as usize;
        if next_h < MIN_LEVEL_SIZE || next_w < MIN_LEVEL_SIZE {
            break;
        }
        let smoothed = gaussian_blur(last, sigma.max(0.5));
        levels.push(resize(&smoothed, next_h, next_w));
    }
    levels
}

fn upscale_flow(coarse: &Array3<f32>, height: usize, width: usize) -> Array3<f32> {
    let (coarse_h, coarse_w, _) = coarse.dim();
    let scale_x = width as f32 / coarse_w as f32;
    let scale_y = height as f32 / coarse_h as f32;
    let dx = resize(&coarse.index_axis(ndarray::Axis(2), 0).to_owned(), height, width);
    let dy = resize(&coarse.index_axis(ndarray::Axis(2), 1).to_owned(), height, width);
    Array3::from_shape_fn((height, width, 2), |(y, x, c)| {
        if c == 0 {
            dx[(y, x)] * scale_x
        } else {
            dy[(y, x)] * scale_y
        }
    })
}

/// Weighted least-squares fit of a quadratic over a `(2n+1)^2` window.
///
/// The normal matrix depends only on the window, so its inverse is folded
/// into one projection vector per offset.
struct PolyExpansion {
    /// Per offset, weights producing `[c, b1, b2, a11, a22, a12]`.
    projections: Vec<(isize, isize, [f32; 6])>,
}

impl PolyExpansion {
    fn new(poly_n: usize, sigma: f32) -> Option<Self> {
        let radius = poly_n as isize;
        let mut samples = Vec::new();
        let mut normal = [[0.0f64; 6]; 6];
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let weight =
                    (-((dx * dx + dy * dy) as f64) / (2.0 * f64::from(sigma).powi(2))).exp();
                let (x, y) = (dx as f64, dy as f64);
                let basis = [1.0, x, y, x * x, y * y, x * y];
                for i in 0..6 {
                    for j in 0..6 {
                        normal[i][j] += weight * basis[i] * basis[j];
                    }
                }
                samples.push((dx, dy, weight, basis));
            }
        }
        let inverse = invert6(normal)?;
        let projections = samples
            .into_iter()
            .map(|(dx, dy, weight, basis)| {
                let mut row = [0.0f32; 6];
                for (k, value) in row.iter_mut().enumerate() {
                    let dot: f64 = (0..6).map(|j| inverse[k][j] * basis[j]).sum();
                    *value = (dot * weight) as f32;
                }
                (dx, dy, row)
            })
            .collect();
        Some(Self { projections })
    }

    /// Per-pixel `[b1, b2, a11, a22, a12]`, with `a12` the off-diagonal of `A`.
    fn apply(&self, image: &Array2<f32>) -> Array3<f32> {
        let (height, width) = image.dim();
        let max_x = width as isize - 1;
        let max_y = height as isize - 1;
        let mut out = Array3::zeros((height, width, POLY_CHANNELS));
        for y in 0..height {
            for x in 0..width {
                let mut coeffs = [0.0f32; 6];
                for (dx, dy, row) in &self.projections {
                    let sx = (x as isize + dx).clamp(0, max_x) as usize;
                    let sy = (y as isize + dy).clamp(0, max_y) as usize;
                    let value = image[(sy, sx)];
                    for (coeff, weight) in coeffs.iter_mut().zip(row) {
                        *coeff += weight * value;
                    }
                }
                out[(y, x, 0)] = coeffs[1];
                out[(y, x, 1)] = coeffs[2];
                out[(y, x, 2)] = coeffs[3];
                out[(y, x, 3)] = coeffs[4];
                out[(y, x, 4)] = coeffs[5] * 0.5;
            }
        }
        out
    }
}

fn invert6(mut matrix: [[f64; 6]; 6]) -> Option<[[f64; 6]; 6]> {
    let mut inverse = [[0.0f64; 6]; 6];
    for (i, row) in inverse.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    for col in 0..6 {
        let pivot = (col..6)
            .max_by(|&a, &b| matrix[a][col].abs().total_cmp(&matrix[b][col].abs()))?;
        if matrix[pivot][col].abs() < 1e-12 {
            return None;
        }
        matrix.swap(col, pivot);
        inverse.swap(col, pivot);
        let scale = 1.0 / matrix[col][col];
        for j in 0..6 {
            matrix[col][j] *= scale;
            inverse[col][j] *= scale;
        }
        for row in 0..6 {
            if row == col {
                continue;
            }
            let factor = matrix[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..6 {
                matrix[row][j] -= factor * matrix[col][j];
                inverse[row][j] -= factor * inverse[col][j];
            }
        }
    }
    Some(inverse)
}

fn border_weight(pos: usize, len: usize) -> f32 {
    let from_edge = pos.min(len.saturating_sub(1).saturating_sub(pos));
    BORDER_WEIGHTS
        .get(from_edge)
        .copied()
        .unwrap_or(1.0)
}

/// Per pixel `[g11, g12, g22, h1, h2]` of the normal equations `G d = h`.
fn update_matrices(r0: &Array3<f32>, r1: &Array3<f32>, flow: &Array3<f32>) -> Array3<f32> {
    let (height, width, _) = r0.dim();
    let mut out = Array3::zeros((height, width, 5));
    for y in 0..height {
        for x in 0..width {
            let dx = flow[(y, x, 0)];
            let dy = flow[(y, x, 1)];
            let Some(moved) = sample::<POLY_CHANNELS>(r1, x as f32 + dx, y as f32 + dy) else {
                continue;
            };
            let a11 = (r0[(y, x, 2)] + moved[2]) * 0.5;
            let a22 = (r0[(y, x, 3)] + moved[3]) * 0.5;
            let a12 = (r0[(y, x, 4)] + moved[4]) * 0.5;
            let db1 = (r0[(y, x, 0)] - moved[0]) * 0.5 + a11 * dx + a12 * dy;
            let db2 = (r0[(y, x, 1)] - moved[1]) * 0.5 + a12 * dx + a22 * dy;

            let scale = border_weight(x, width) * border_weight(y, height);
            let (a11, a22, a12) = (a11 * scale, a22 * scale, a12 * scale);
            let (db1, db2) = (db1 * scale, db2 * scale);

            out[(y, x, 0)] = a11 * a11 + a12 * a12;
            out[(y, x, 1)] = a12 * (a11 + a22);
            out[(y, x, 2)] = a22 * a22 + a12 * a12;
            out[(y, x, 3)] = a11 * db1 + a12 * db2;
            out[(y, x, 4)] = a12 * db1 + a22 * db2;
        }
    }
    out
}

fn solve_flow(matrices: &Array3<f32>) -> Array3<f32> {
    let (height, width, _) = matrices.dim();
    let mut flow = Array3::zeros((height, width, 2));
    for y in 0..height {
        for x in 0..width {
            let g11 = matrices[(y, x, 0)];
            let g12 = matrices[(y, x, 1)];
            let g22 = matrices[(y, x, 2)];
            let h1 = matrices[(y, x, 3)];
            let h2 = matrices[(y, x, 4)];
            let inv_det = 1.0 / (g11 * g22 - g12 * g12 + 1e-3);
            flow[(y, x, 0)] = (g22 * h1 - g12 * h2) * inv_det;
            flow[(y, x, 1)] = (g11 * h2 - g12 * h1) * inv_det;
        }
    }
    flow
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pattern(x: f32, y: f32) -> f32 {
        128.0 + 60.0 * (x * 0.31).sin() * (y * 0.23).cos() + 40.0 * ((x + y) * 0.17).sin()
    }

    fn shifted(width: usize, height: usize, shift_x: f32, shift_y: f32) -> Array2<f32> {
        Array2::from_shape_fn((height, width), |(y, x)| {
            pattern(x as f32 - shift_x, y as f32 - shift_y)
        })
    }

    fn interior_mean(field: &FlowField, margin: usize) -> (f32, f32) {
        let mut sum = (0.0, 0.0);
        let mut count = 0.0;
        for y in margin..field.height() - margin {
            for x in margin..field.width() - margin {
                let (dx, dy) = field.get(x, y).unwrap();
                sum.0 += dx;
                sum.1 += dy;
                count += 1.0;
            }
        }
        (sum.0 / count, sum.1 / count)
    }

    #[test]
    fn identical_frames_have_zero_flow() {
        let frame = shifted(40, 36, 0.0, 0.0);
        let field = estimate_flow(&frame, &frame, &FARNEBACK_PARAMS).unwrap();
        assert_eq!((field.width(), field.height()), (40, 36));
        assert!(field.view().iter().all(|v| v.abs() < 1e-4));
    }

    #[test]
    fn recovers_horizontal_translation() {
        let prev = shifted(72, 64, 0.0, 0.0);
        let next = shifted(72, 64, 2.0, 0.0);
        let forward = estimate_flow(&prev, &next, &FARNEBACK_PARAMS).unwrap();
        let (dx, dy) = interior_mean(&forward, 16);
        assert!((dx - 2.0).abs() < 0.6, "dx = {dx}");
        assert!(dy.abs() < 0.6, "dy = {dy}");

        let backward = estimate_flow(&next, &prev, &FARNEBACK_PARAMS).unwrap();
        let (bx, _) = interior_mean(&backward, 16);
        assert!((bx + 2.0).abs() < 0.6, "bx = {bx}");
    }

    #[test]
    fn expansion_recovers_quadratic_coefficients() {
        let expansion = PolyExpansion::new(5, 1.2).unwrap();
        let image = Array2::from_shape_fn((21, 21), |(y, x)| {
            let (x, y) = (x as f32 - 10.0, y as f32 - 10.0);
            3.0 + 2.0 * x - y + 0.5 * x * x + 0.25 * y * y + 0.3 * x * y
        });
        let coeffs = expansion.apply(&image);
        let at = |c| coeffs[(10, 10, c)];
        assert!((at(0) - 2.0).abs() < 1e-3);
        assert!((at(1) + 1.0).abs() < 1e-3);
        assert!((at(2) - 0.5).abs() < 1e-3);
        assert!((at(3) - 0.25).abs() < 1e-3);
        assert!((at(4) - 0.15).abs() < 1e-3);
    }

    #[test]
    fn pyramid_stops_at_minimum_size() {
        let big = Array2::zeros((128, 100));
        let sizes = build_pyramid(&big, &FARNEBACK_PARAMS)
            .iter()
            .map(|level| level.dim())
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![(128, 100), (64, 50)]);
        let small = Array2::zeros((20, 20));
        assert_eq!(build_pyramid(&small, &FARNEBACK_PARAMS).len(), 1);
    }

    #[test]
    fn backend_writes_both_fields() {
        let dir = tempdir().unwrap();
        let start = dir.path().join("frame_0001.ppm");
        let end = dir.path().join("frame_0002.ppm");
        for (path, shift) in [(&start, 0.0), (&end, 1.0)] {
            let frame = shifted(48, 40, shift, 0.0);
            let image = image::RgbImage::from_fn(48, 40, |x, y| {
                let level = frame[(y as usize, x as usize)].clamp(0.0, 255.0) as u8;
                image::Rgb([level, level, level])
            });
            image.save(path).unwrap();
        }
        let forward = dir.path().join("forward_1_2.flo");
        let backward = dir.path().join("backward_2_1.flo");
        FarnebackBackend::new(FARNEBACK_PARAMS)
            .compute(&FlowRequest {
                start_frame: &start,
                end_frame: &end,
                forward: &forward,
                backward: &backward,
            })
            .unwrap();
        assert_eq!(codec::read_dimensions(&forward).unwrap(), (48, 40));
        assert_eq!(codec::read_dimensions(&backward).unwrap(), (48, 40));
    }

    #[test]
    fn mismatched_frames_are_rejected() {
        let dir = tempdir().unwrap();
        let start = dir.path().join("a.ppm");
        let end = dir.path().join("b.ppm");
        image::RgbImage::new(8, 8).save(&start).unwrap();
        image::RgbImage::new(9, 8).save(&end).unwrap();
        let err = FarnebackBackend::new(FARNEBACK_PARAMS)
            .compute(&FlowRequest {
                start_frame: &start,
                end_frame: &end,
                forward: &dir.path().join("f.flo"),
                backward: &dir.path().join("b.flo"),
            })
            .unwrap_err();
        assert!(matches!(err, BackendError::FrameSizeMismatch { .. }));
    }
}
