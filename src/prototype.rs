// Prototype extraction and prediction: masked average pooling of support
// features, cosine scoring of query features against class prototypes,
// threshold-based foreground probabilities, and unsupervised per-episode
// prototype refinement at inference time.

use crate::ops::{log_clamped, minmax01, resize_bilinear, sigmoid};
use anyhow::{ensure, Result};
use candle_core::{IndexOp, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

const POOL_EPS: f64 = 1e-5;
const COSINE_EPS: f64 = 1e-8;

/// Masked average pooling. `features`: (1, C, h, w), `mask`: (1, Hm, Wm)
/// binary. Features are resized to the mask grid, gated, and averaged over
/// the foreground. Finite even for an all-zero mask.
pub fn masked_average_pool(features: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (_, hm, wm) = mask.dims3()?;
    let fts = resize_bilinear(features, hm, wm, false)?;
    let masked = fts.broadcast_mul(&mask.unsqueeze(1)?)?;
    let summed = masked.sum(3)?.sum(2)?; // (1, C)
    let count = (mask.sum_all()? + POOL_EPS)?;
    summed.broadcast_div(&count).map_err(Into::into)
}

/// Mean of per-shot prototype vectors, keeping the (1, C) layout.
pub fn mean_prototype(shots: &[Tensor]) -> Result<Tensor> {
    ensure!(!shots.is_empty(), "prototype needs at least one shot");
    let stacked = Tensor::cat(shots, 0)?; // (S, C)
    stacked.mean_keepdim(0).map_err(Into::into)
}

/// Negative cosine similarity of every spatial position of `features`
/// (N, C, h, w) against `prototype` (1, C), scaled by the temperature.
/// Output (N, h, w); lower values mean more similar.
pub fn negative_similarity(features: &Tensor, prototype: &Tensor, scaler: f64) -> Result<Tensor> {
    let (_, c, _, _) = features.dims4()?;
    let proto = prototype.reshape((1, c, 1, 1))?;
    let numer = features.broadcast_mul(&proto)?.sum(1)?; // (N, h, w)
    let f_norm = features.sqr()?.sum(1)?.sqrt()?; // (N, h, w)
    let p_norm = proto.sqr()?.sum_all()?.sqrt()?; // scalar
    let denom = (f_norm.broadcast_mul(&p_norm)? + COSINE_EPS)?;
    let cos = numer.broadcast_div(&denom)?;
    cos.affine(-scaler, 0.0).map_err(Into::into)
}

/// Foreground probability from a similarity map and a learned threshold:
/// 1 - sigmoid(0.5 * (sim - threshold)). Monotonically non-increasing in
/// `sim - threshold`.
pub fn predict(sim: &Tensor, threshold: &Tensor) -> Result<Tensor> {
    let shifted = sim.broadcast_sub(threshold)?.affine(0.5, 0.0)?;
    sigmoid(&shifted)?.affine(-1.0, 1.0).map_err(Into::into)
}

/// Stack per-way foreground predictions into (N, Wa, h, w).
pub fn predict_ways(
    features: &Tensor,
    prototypes: &[Tensor],
    threshold: &Tensor,
    scaler: f64,
) -> Result<Tensor> {
    let mut preds = Vec::with_capacity(prototypes.len());
    for proto in prototypes {
        let sim = negative_similarity(features, proto, scaler)?;
        preds.push(predict(&sim, threshold)?);
    }
    Tensor::stack(&preds, 1).map_err(Into::into)
}

/// Unsupervised per-episode prototype refinement, used at inference only.
///
/// The stacked prototypes become the single optimizable variable; the query
/// features, threshold and running prediction are detached, so the
/// optimization scope is limited to the prototype itself. Each step blends
/// background features with the prototype broadcast over the currently
/// predicted foreground, scores the blend against the original features
/// with a binary cross-entropy on sigmoid-normalized intensities, takes one
/// AdamW step, and recomputes the prediction with the updated prototype.
///
/// `iters == 0` returns the input prototypes unchanged.
pub fn refine_prototypes(
    query_features: &Tensor,
    prototypes: &[Tensor],
    prediction: &Tensor,
    threshold: &Tensor,
    scaler: f64,
    iters: usize,
    lr: f64,
) -> Result<Vec<Tensor>> {
    if iters == 0 {
        return Ok(prototypes.to_vec());
    }
    let n_ways = prototypes.len();
    let fts = query_features.detach();
    let thresh = threshold.detach();
    let mut pred = prediction.detach();

    let stacked = Tensor::stack(prototypes, 0)?.detach(); // (Wa, 1, C)
    let proto_var = Var::from_tensor(&stacked)?;
    let params = ParamsAdamW {
        lr,
        weight_decay: 0.0,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(vec![proto_var.clone()], params)?;

    let (_, c, _, _) = fts.dims4()?;
    for _ in 0..iters {
        // Binarize the summed per-way prediction into a foreground region.
        let region = pred.sum(1)?.gt(0.5)?.to_dtype(fts.dtype())?.unsqueeze(1)?; // (N, 1, h, w)
        let background = fts.broadcast_mul(&region.affine(-1.0, 1.0)?)?;
        let mut blended = background;
        for way in 0..n_ways {
            let proto = proto_var.as_tensor().i(way)?.reshape((1, c, 1, 1))?;
            let fg = region.broadcast_mul(&proto)?;
            blended = (blended + fg)?;
        }

        let target = sigmoid(&minmax01(&blended, COSINE_EPS)?)?;
        let reference = sigmoid(&minmax01(&fts, COSINE_EPS)?)?;
        // BCE(reference as input, blend as target): the gradient flows
        // through the target term, which carries the prototype.
        let log_ref = log_clamped(&reference, 1e-7)?;
        let log_ref_inv = log_clamped(&reference.affine(-1.0, 1.0)?, 1e-7)?;
        let loss = target
            .broadcast_mul(&log_ref)?
            .broadcast_add(&target.affine(-1.0, 1.0)?.broadcast_mul(&log_ref_inv)?)?
            .mean_all()?
            .neg()?;
        optimizer.backward_step(&loss)?;

        let protos: Vec<Tensor> = (0..n_ways)
            .map(|w| proto_var.as_tensor().i(w))
            .collect::<candle_core::Result<_>>()?;
        pred = predict_ways(&fts, &protos, &thresh, scaler)?.detach();
    }

    (0..n_ways)
        .map(|w| Ok(proto_var.as_tensor().i(w)?.detach()))
        .collect()
}
