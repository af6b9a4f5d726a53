// Evaluation harness: Dice overlap on held-out volumes, with support
// slices drawn from a separate support volume at fixed percentile
// intervals of its labeled range.

use crate::encoder::Encoder;
use crate::model::FewShotSeg;
use crate::sampler::LabeledVolume;
use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use ndarray::Axis;

const DICE_EPS: f64 = 1e-5;

// ---------------------------------------------------------------------------
// Dice metric
// ---------------------------------------------------------------------------

/// Sorensen-Dice overlap between a foreground probability map and a binary
/// label, both (H, W). The prediction is binarized at `threshold`.
pub fn dice_score(pred_fg: &Tensor, label: &Tensor, threshold: f64) -> Result<f32> {
    let pred_bin = pred_fg.gt(threshold)?.to_dtype(label.dtype())?;
    let inter = pred_bin.broadcast_mul(label)?.sum_all()?.to_scalar::<f32>()? as f64;
    let denom = pred_bin.sum_all()?.to_scalar::<f32>()? as f64
        + label.sum_all()?.to_scalar::<f32>()? as f64;
    Ok(((2.0 * inter + DICE_EPS) / (denom + DICE_EPS)) as f32)
}

// ---------------------------------------------------------------------------
// Support slice selection
// ---------------------------------------------------------------------------

/// Indices into a run of `n_labeled` labeled slices at the midpoints of
/// `n_shot` equal partitions: one shot takes the middle slice, k shots
/// spread evenly across the labeled range.
pub fn support_slice_indices(n_shot: usize, n_labeled: usize) -> Vec<usize> {
    let pcts: Vec<f64> = if n_shot == 1 {
        vec![0.5]
    } else {
        let half_part = 1.0 / (n_shot as f64 * 2.0);
        let part_interval = (1.0 - 1.0 / n_shot as f64) / (n_shot as f64 - 1.0);
        (0..n_shot)
            .map(|i| half_part + part_interval * i as f64)
            .collect()
    };
    pcts.iter()
        .map(|p| ((p * n_labeled as f64) as usize).min(n_labeled.saturating_sub(1)))
        .collect()
}

// ---------------------------------------------------------------------------
// Volume evaluation
// ---------------------------------------------------------------------------

/// Slices of a volume where `class_id` occupies at least one pixel,
/// following the evaluation protocol of scoring labeled slices only.
fn labeled_slices(volume: &LabeledVolume, class_id: i64) -> Vec<usize> {
    volume.class_slice_indices(class_id)
}

fn slice_image_tensor(volume: &LabeledVolume, slice: usize, device: &Device) -> Result<Tensor> {
    let img = volume.image.index_axis(Axis(0), slice).to_owned();
    let (h, w) = img.dim();
    let flat = img.into_raw_vec();
    let one = Tensor::from_vec(flat, (1, 1, h, w), device)?;
    // Replicate the gray channel to the 3-channel layout the encoder expects.
    Tensor::cat(&[&one, &one, &one], 1).map_err(Into::into)
}

fn slice_mask_tensor(
    volume: &LabeledVolume,
    slice: usize,
    class_id: i64,
    device: &Device,
) -> Result<Tensor> {
    let mask = volume
        .label
        .index_axis(Axis(0), slice)
        .mapv(|c| if c == class_id { 1.0f32 } else { 0.0 });
    let (h, w) = mask.dim();
    Tensor::from_vec(mask.into_raw_vec(), (1, h, w), device).map_err(Into::into)
}

/// Evaluate one query volume against one support volume for `class_id`.
/// Support slices are chosen at percentile intervals of the support
/// volume's labeled range; every labeled query slice is scored and the
/// mean Dice returned. Runs in inference mode, so prototype refinement is
/// active when the model's `n_iters` is positive.
pub fn evaluate_volume<E: Encoder>(
    model: &FewShotSeg<E>,
    support: &LabeledVolume,
    query: &LabeledVolume,
    class_id: i64,
    n_shot: usize,
    device: &Device,
) -> Result<f32> {
    let supp_slices = labeled_slices(support, class_id);
    ensure!(
        !supp_slices.is_empty(),
        "support volume has no slices labeled with class {class_id}"
    );
    let qry_slices = labeled_slices(query, class_id);
    ensure!(
        !qry_slices.is_empty(),
        "query volume has no slices labeled with class {class_id}"
    );

    let chosen: Vec<usize> = support_slice_indices(n_shot, supp_slices.len())
        .into_iter()
        .map(|i| supp_slices[i])
        .collect();
    let mut supp_imgs = Vec::with_capacity(n_shot);
    let mut supp_masks = Vec::with_capacity(n_shot);
    for &s in &chosen {
        supp_imgs.push(slice_image_tensor(support, s, device)?);
        supp_masks.push(slice_mask_tensor(support, s, class_id, device)?);
    }
    let supp_imgs = vec![supp_imgs];
    let supp_masks = vec![supp_masks];

    let mut total = 0.0f32;
    for &q in &qry_slices {
        let qry_img = vec![slice_image_tensor(query, q, device)?];
        let (out, _) = model.forward(&supp_imgs, &supp_masks, &qry_img, false)?;
        let pred_fg = out.narrow(1, 1, 1)?.squeeze(1)?.squeeze(0)?; // (H, W)
        let label = slice_mask_tensor(query, q, class_id, device)?.squeeze(0)?;
        total += dice_score(&pred_fg, &label, 0.5)?;
    }
    let mean = total / qry_slices.len() as f32;
    eprintln!(
        "[EVAL] class {class_id}: {} query slices, mean dice {mean:.4}",
        qry_slices.len()
    );
    Ok(mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_dice_perfect_overlap() -> Result<()> {
        let device = Device::Cpu;
        let label = Tensor::ones((8, 8), DType::F32, &device)?;
        let pred = Tensor::full(0.9f32, (8, 8), &device)?;
        let d = dice_score(&pred, &label, 0.5)?;
        assert!((d - 1.0).abs() < 1e-4, "dice {d}");
        Ok(())
    }

    #[test]
    fn test_dice_no_overlap() -> Result<()> {
        let device = Device::Cpu;
        let label = Tensor::ones((8, 8), DType::F32, &device)?;
        let pred = Tensor::full(0.1f32, (8, 8), &device)?;
        let d = dice_score(&pred, &label, 0.5)?;
        assert!(d < 1e-3, "dice {d}");
        Ok(())
    }

    #[test]
    fn test_dice_empty_both_is_finite() -> Result<()> {
        let device = Device::Cpu;
        let label = Tensor::zeros((8, 8), DType::F32, &device)?;
        let pred = Tensor::zeros((8, 8), DType::F32, &device)?;
        let d = dice_score(&pred, &label, 0.5)?;
        assert!(d.is_finite());
        assert!((d - 1.0).abs() < 1e-4, "empty/empty counts as full agreement");
        Ok(())
    }

    #[test]
    fn test_support_indices_single_shot_is_middle() {
        assert_eq!(support_slice_indices(1, 10), vec![5]);
        assert_eq!(support_slice_indices(1, 1), vec![0]);
    }

    #[test]
    fn test_support_indices_spread() {
        assert_eq!(support_slice_indices(2, 8), vec![2, 6]);
        let idx = support_slice_indices(3, 30);
        assert_eq!(idx.len(), 3);
        assert!(idx[0] < idx[1] && idx[1] < idx[2]);
    }

    #[test]
    fn test_support_indices_stay_in_range() {
        for n_shot in 1..=5 {
            for n_labeled in 1..=12 {
                for i in support_slice_indices(n_shot, n_labeled) {
                    assert!(i < n_labeled, "index {i} out of {n_labeled}");
                }
            }
        }
    }
}
