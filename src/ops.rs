// Gradient-safe tensor primitives shared by the attention, prior and
// prototype modules. Several candle_nn ops have unreliable backward passes
// (softmax_last_dim, LayerNorm over joint axes) and candle has no bilinear
// resize, so these are built from basic tensor ops with working autograd.

use anyhow::Result;
use candle_core::Tensor;

/// Numerically stable softmax along `dim` (max-shifted).
pub fn softmax(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?;
    let exp = x.broadcast_sub(&max)?.exp()?;
    let sum = exp.sum_keepdim(dim)?;
    exp.broadcast_div(&sum).map_err(Into::into)
}

/// Elementwise sigmoid. Inputs are clamped to [-30, 30]; both tails are
/// fully saturated there so the clamp does not change the value.
pub fn sigmoid(x: &Tensor) -> Result<Tensor> {
    let x = x.clamp(-30.0, 30.0)?;
    let exp_neg = x.neg()?.exp()?;
    (exp_neg + 1.0)?.recip().map_err(Into::into)
}

/// log(clamp(x, eps, 1 - eps)), the safe form used by the NLL-style losses.
pub fn log_clamped(x: &Tensor, eps: f64) -> Result<Tensor> {
    x.clamp(eps, 1.0 - eps)?.log().map_err(Into::into)
}

/// Interpolation weight row for 1-D bilinear resampling, as a flat
/// (out x inp) row-major matrix.
fn interp_weights(out: usize, inp: usize, align_corners: bool) -> Vec<f32> {
    let mut w = vec![0f32; out * inp];
    for i in 0..out {
        let src = if inp == 1 || (align_corners && out == 1) {
            0.0
        } else if align_corners {
            i as f32 * (inp - 1) as f32 / (out - 1) as f32
        } else {
            ((i as f32 + 0.5) * inp as f32 / out as f32 - 0.5).clamp(0.0, (inp - 1) as f32)
        };
        let i0 = src.floor() as usize;
        let i1 = (i0 + 1).min(inp - 1);
        let frac = src - i0 as f32;
        w[i * inp + i0] += 1.0 - frac;
        w[i * inp + i1] += frac;
    }
    w
}

/// Bilinear resize of a (B, C, H, W) tensor to (B, C, out_h, out_w).
///
/// Separable: out = Rh @ x @ Rw^T with precomputed interpolation matrices,
/// so gradients flow through plain matmuls.
pub fn resize_bilinear(
    x: &Tensor,
    out_h: usize,
    out_w: usize,
    align_corners: bool,
) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    if h == out_h && w == out_w {
        return Ok(x.clone());
    }
    let device = x.device();
    let rh = Tensor::from_vec(interp_weights(out_h, h, align_corners), (out_h, h), device)?;
    let rw = Tensor::from_vec(interp_weights(out_w, w, align_corners), (out_w, w), device)?;

    let flat = x.contiguous()?.reshape((b * c, h, w))?;
    let rows = rh.unsqueeze(0)?.broadcast_matmul(&flat)?; // (b*c, out_h, w)
    let cols = rows.broadcast_matmul(&rw.t()?.contiguous()?.unsqueeze(0)?)?; // (b*c, out_h, out_w)
    cols.reshape((b, c, out_h, out_w)).map_err(Into::into)
}

/// Adaptive average pooling of the last dimension of a (B, S, C) tensor
/// down to `out` channels, with the standard floor/ceil window rule.
pub fn adaptive_avg_pool_1d(x: &Tensor, out: usize) -> Result<Tensor> {
    let (_, _, c) = x.dims3()?;
    if c == out {
        return Ok(x.clone());
    }
    let mut p = vec![0f32; c * out];
    for j in 0..out {
        let start = j * c / out;
        let end = ((j + 1) * c + out - 1) / out;
        let weight = 1.0 / (end - start) as f32;
        for i in start..end {
            p[i * out + j] = weight;
        }
    }
    let pool = Tensor::from_vec(p, (c, out), x.device())?;
    x.broadcast_matmul(&pool.unsqueeze(0)?).map_err(Into::into)
}

/// Per-row min-max normalization of a (B, S) tensor into [0, 1].
/// Constant rows degrade to zeros rather than NaN.
pub fn minmax_normalize_rows(x: &Tensor, eps: f64) -> Result<Tensor> {
    let min = x.min_keepdim(1)?;
    let max = x.max_keepdim(1)?;
    let range = ((max - min.clone())? + eps)?;
    x.broadcast_sub(&min)?
        .broadcast_div(&range)
        .map_err(Into::into)
}

/// Global min-max rescale of a tensor into [0, 1]. The range endpoints are
/// taken as detached constants so gradients only flow through the numerator.
pub fn minmax01(x: &Tensor, eps: f64) -> Result<Tensor> {
    let lo = x.detach().min_all()?;
    let hi = x.detach().max_all()?;
    let range = ((hi - lo.clone())? + eps)?;
    x.broadcast_sub(&lo)?
        .broadcast_div(&range)
        .map_err(Into::into)
}
