// Episode augmentation: intensity (gamma) and geometric (affine + elastic)
// transforms applied on the host-side ndarray buffers before tensors are
// built. Geometric warps are applied jointly to image and mask channels so
// spatial correspondence is preserved exactly; masks are re-binarized by
// rounding after the warp.

use ndarray::{Array2, Array3, Array4, Array5, ArrayView2, Dimension};
use rand::rngs::StdRng;
use rand::Rng;

const GAMMA_RANGE: (f32, f32) = (0.5, 1.5);
const AFFINE_ROTATE_DEG: f32 = 5.0;
const AFFINE_SHIFT_PX: f32 = 5.0;
const AFFINE_SHEAR_DEG: f32 = 5.0;
const AFFINE_SCALE_RANGE: (f32, f32) = (0.9, 1.2);
const ELASTIC_ALPHA: f32 = 10.0;
const ELASTIC_SIGMA: f32 = 5.0;

// ---------------------------------------------------------------------------
// Gamma intensity transform
// ---------------------------------------------------------------------------

/// Draw a gamma exponent uniformly from [0.5, 1.5].
pub fn sample_gamma(rng: &mut StdRng) -> f32 {
    rng.gen_range(GAMMA_RANGE.0..GAMMA_RANGE.1)
}

/// In-place gamma transform over the whole buffer. Intensities are shifted
/// into a strictly positive range, raised to `gamma` with a range-preserving
/// rescale, and shifted back. Identity within float tolerance at gamma = 1.
pub fn gamma_transform<D: Dimension>(img: &mut ndarray::Array<f32, D>, gamma: f32) {
    let cmin = img.iter().copied().fold(f32::INFINITY, f32::min);
    let cmax = img.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !cmin.is_finite() || !cmax.is_finite() {
        return;
    }
    let irange = cmax - cmin + 1e-5;
    img.mapv_inplace(|v| {
        let shifted = v - cmin + 1e-5;
        irange * (shifted / irange).powf(gamma) + cmin
    });
}

// ---------------------------------------------------------------------------
// Geometric transform: random affine composed with elastic deformation
// ---------------------------------------------------------------------------

/// Parameters of one random affine draw.
#[derive(Debug, Clone, Copy)]
pub struct AffineParams {
    pub rotate_deg: f32,
    pub shift: (f32, f32),
    pub shear_deg: f32,
    pub scale: f32,
}

impl AffineParams {
    pub fn sample(rng: &mut StdRng) -> Self {
        Self {
            rotate_deg: rng.gen_range(-AFFINE_ROTATE_DEG..AFFINE_ROTATE_DEG),
            shift: (
                rng.gen_range(-AFFINE_SHIFT_PX..AFFINE_SHIFT_PX),
                rng.gen_range(-AFFINE_SHIFT_PX..AFFINE_SHIFT_PX),
            ),
            shear_deg: rng.gen_range(-AFFINE_SHEAR_DEG..AFFINE_SHEAR_DEG),
            scale: rng.gen_range(AFFINE_SCALE_RANGE.0..AFFINE_SCALE_RANGE.1),
        }
    }

    pub fn identity() -> Self {
        Self {
            rotate_deg: 0.0,
            shift: (0.0, 0.0),
            shear_deg: 0.0,
            scale: 1.0,
        }
    }

    /// Inverse of the 2x2 linear part (rotation * shear * isotropic scale).
    fn inverse_linear(&self) -> [f32; 4] {
        let th = self.rotate_deg.to_radians();
        let sh = self.shear_deg.to_radians().tan();
        let (sin, cos) = th.sin_cos();
        // A = R(theta) * Shear(sh) * scale
        let a00 = cos * self.scale;
        let a01 = (cos * sh - sin) * self.scale;
        let a10 = sin * self.scale;
        let a11 = (sin * sh + cos) * self.scale;
        let det = a00 * a11 - a01 * a10;
        [a11 / det, -a01 / det, -a10 / det, a00 / det]
    }
}

/// Smoothed random displacement fields (dy, dx) for elastic deformation:
/// uniform [-1, 1] noise, Gaussian-blurred with `sigma`, scaled by `alpha`.
pub fn elastic_fields(
    h: usize,
    w: usize,
    alpha: f32,
    sigma: f32,
    rng: &mut StdRng,
) -> (Array2<f32>, Array2<f32>) {
    let kernel = gaussian_kernel(sigma);
    let mut dy = Array2::zeros((h, w));
    let mut dx = Array2::zeros((h, w));
    dy.mapv_inplace(|_: f32| rng.gen_range(-1.0f32..1.0));
    dx.mapv_inplace(|_: f32| rng.gen_range(-1.0f32..1.0));
    let mut dy = gaussian_smooth(&dy, &kernel);
    let mut dx = gaussian_smooth(&dx, &kernel);
    dy.mapv_inplace(|v| v * alpha);
    dx.mapv_inplace(|v| v * alpha);
    (dy, dx)
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil() as i64;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i as f32).powi(2) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}

/// Separable Gaussian blur with clamped borders.
fn gaussian_smooth(field: &Array2<f32>, kernel: &[f32]) -> Array2<f32> {
    let (h, w) = field.dim();
    let radius = (kernel.len() / 2) as i64;
    let mut rows = Array2::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, &kv) in kernel.iter().enumerate() {
                let sx = (x as i64 + k as i64 - radius).clamp(0, w as i64 - 1) as usize;
                acc += kv * field[[y, sx]];
            }
            rows[[y, x]] = acc;
        }
    }
    let mut out = Array2::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, &kv) in kernel.iter().enumerate() {
                let sy = (y as i64 + k as i64 - radius).clamp(0, h as i64 - 1) as usize;
                acc += kv * rows[[sy, x]];
            }
            out[[y, x]] = acc;
        }
    }
    out
}

/// Bilinear sample with zero padding outside the image.
fn bilinear_sample(img: &ArrayView2<f32>, y: f32, x: f32) -> f32 {
    let (h, w) = img.dim();
    let y0 = y.floor() as i64;
    let x0 = x.floor() as i64;
    let fy = y - y0 as f32;
    let fx = x - x0 as f32;
    let mut acc = 0.0;
    for (dy, wy) in [(0i64, 1.0 - fy), (1, fy)] {
        for (dx, wx) in [(0i64, 1.0 - fx), (1, fx)] {
            let sy = y0 + dy;
            let sx = x0 + dx;
            if sy >= 0 && sy < h as i64 && sx >= 0 && sx < w as i64 {
                acc += wy * wx * img[[sy as usize, sx as usize]];
            }
        }
    }
    acc
}

/// Warp a (C, H, W) channel stack with an affine transform followed by an
/// elastic deformation, in a single resampling pass: the output pixel p
/// reads from inverse_affine(p + displacement(p)). All channels share the
/// same coordinates.
pub fn warp_stack(
    stack: &Array3<f32>,
    params: &AffineParams,
    dy: &Array2<f32>,
    dx: &Array2<f32>,
) -> Array3<f32> {
    let (ch, h, w) = stack.dim();
    let cy = (h as f32 - 1.0) / 2.0;
    let cx = (w as f32 - 1.0) / 2.0;
    let inv = params.inverse_linear();
    let mut out = Array3::zeros((ch, h, w));
    for y in 0..h {
        for x in 0..w {
            let qy = y as f32 + dy[[y, x]] - cy - params.shift.1;
            let qx = x as f32 + dx[[y, x]] - cx - params.shift.0;
            let sy = inv[2] * qx + inv[3] * qy + cy;
            let sx = inv[0] * qx + inv[1] * qy + cx;
            for c in 0..ch {
                out[[c, y, x]] = bilinear_sample(&stack.index_axis(ndarray::Axis(0), c), sy, sx);
            }
        }
    }
    out
}

fn sample_warp(rng: &mut StdRng, h: usize, w: usize) -> (AffineParams, Array2<f32>, Array2<f32>) {
    let params = AffineParams::sample(rng);
    let (dy, dx) = elastic_fields(h, w, ELASTIC_ALPHA, ELASTIC_SIGMA, rng);
    (params, dy, dx)
}

/// Geometric transform of the support branch: each (way, shot) pair gets an
/// independently drawn warp applied jointly to its 3 image channels and its
/// foreground mask.
pub fn geom_transform_support(img: &mut Array5<f32>, mask: &mut Array4<f32>, rng: &mut StdRng) {
    let (n_way, n_shot, chans, h, w) = img.dim();
    for way in 0..n_way {
        for shot in 0..n_shot {
            let (params, dy, dx) = sample_warp(rng, h, w);
            let mut stack = Array3::zeros((chans + 1, h, w));
            for c in 0..chans {
                stack
                    .index_axis_mut(ndarray::Axis(0), c)
                    .assign(&img.index_axis(ndarray::Axis(0), way).index_axis(
                        ndarray::Axis(0),
                        shot,
                    ).index_axis(ndarray::Axis(0), c));
            }
            stack
                .index_axis_mut(ndarray::Axis(0), chans)
                .assign(&mask.index_axis(ndarray::Axis(0), way).index_axis(
                    ndarray::Axis(0),
                    shot,
                ));
            let warped = warp_stack(&stack, &params, &dy, &dx);
            for c in 0..chans {
                img.index_axis_mut(ndarray::Axis(0), way)
                    .index_axis_mut(ndarray::Axis(0), shot)
                    .index_axis_mut(ndarray::Axis(0), c)
                    .assign(&warped.index_axis(ndarray::Axis(0), c));
            }
            let rounded = warped
                .index_axis(ndarray::Axis(0), chans)
                .mapv(|v| v.round().clamp(0.0, 1.0));
            mask.index_axis_mut(ndarray::Axis(0), way)
                .index_axis_mut(ndarray::Axis(0), shot)
                .assign(&rounded);
        }
    }
}

/// Geometric transform of the query branch: each query slice gets its own
/// warp over 3 image channels plus the label mask.
pub fn geom_transform_query(img: &mut Array4<f32>, mask: &mut Array3<f32>, rng: &mut StdRng) {
    let (n_query, chans, h, w) = img.dim();
    for q in 0..n_query {
        let (params, dy, dx) = sample_warp(rng, h, w);
        let mut stack = Array3::zeros((chans + 1, h, w));
        for c in 0..chans {
            stack
                .index_axis_mut(ndarray::Axis(0), c)
                .assign(&img.index_axis(ndarray::Axis(0), q).index_axis(ndarray::Axis(0), c));
        }
        stack
            .index_axis_mut(ndarray::Axis(0), chans)
            .assign(&mask.index_axis(ndarray::Axis(0), q));
        let warped = warp_stack(&stack, &params, &dy, &dx);
        for c in 0..chans {
            img.index_axis_mut(ndarray::Axis(0), q)
                .index_axis_mut(ndarray::Axis(0), c)
                .assign(&warped.index_axis(ndarray::Axis(0), c));
        }
        let rounded = warped
            .index_axis(ndarray::Axis(0), chans)
            .mapv(|v| v.round().clamp(0.0, 1.0));
        mask.index_axis_mut(ndarray::Axis(0), q).assign(&rounded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_gamma_one_is_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut img = Array3::zeros((3, 16, 16));
        img.mapv_inplace(|_: f32| rng.gen_range(-2.0f32..2.0));
        let orig = img.clone();
        gamma_transform(&mut img, 1.0);
        for (a, b) in img.iter().zip(orig.iter()) {
            assert!((a - b).abs() < 1e-4, "gamma=1 moved {b} to {a}");
        }
    }

    #[test]
    fn test_gamma_changes_intensities() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut img = Array2::zeros((16, 16));
        img.mapv_inplace(|_: f32| rng.gen_range(0.0f32..1.0));
        let orig = img.clone();
        gamma_transform(&mut img, 0.5);
        let moved = img
            .iter()
            .zip(orig.iter())
            .any(|(a, b)| (a - b).abs() > 1e-3);
        assert!(moved, "gamma=0.5 should change intensities");
    }

    #[test]
    fn test_identity_warp_preserves_image() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut stack = Array3::zeros((2, 12, 12));
        stack.mapv_inplace(|_: f32| rng.gen_range(0.0f32..1.0));
        let dy = Array2::zeros((12, 12));
        let dx = Array2::zeros((12, 12));
        let warped = warp_stack(&stack, &AffineParams::identity(), &dy, &dx);
        for (a, b) in warped.iter().zip(stack.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_warped_mask_stays_binary() {
        for seed in 0..8u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut img = Array4::zeros((1, 3, 24, 24));
            img.mapv_inplace(|_: f32| rng.gen_range(-1.0f32..1.0));
            let mut mask = Array3::zeros((1, 24, 24));
            for y in 8..16 {
                for x in 8..16 {
                    mask[[0, y, x]] = 1.0;
                }
            }
            geom_transform_query(&mut img, &mut mask, &mut rng);
            for &v in mask.iter() {
                assert!(v == 0.0 || v == 1.0, "seed {seed}: mask value {v}");
            }
        }
    }

    #[test]
    fn test_elastic_field_is_smooth() {
        let mut rng = StdRng::seed_from_u64(11);
        let (dy, _dx) = elastic_fields(32, 32, 10.0, 5.0, &mut rng);
        // Smoothed with sigma=5, neighboring displacements differ by far
        // less than the amplitude.
        for y in 0..31 {
            for x in 0..31 {
                let d = (dy[[y, x]] - dy[[y + 1, x]]).abs();
                assert!(d < 2.0, "rough field at ({y},{x}): {d}");
            }
        }
    }
}
