// Few-shot segmentation model: encoder features are refined by
// self-attention, correlated into a prior, fused, exchanged through
// cross-attention, and scored against masked-average prototypes with a
// learned threshold. Training adds a prototype-alignment loss; inference
// optionally refines the prototypes against the model's own predictions.

use crate::attention::{CrossAttention, SelfAttention};
use crate::encoder::Encoder;
use crate::ops::{log_clamped, resize_bilinear};
use crate::prior::PriorGenerator;
use crate::prototype::{
    masked_average_pool, mean_prototype, negative_similarity, predict, predict_ways,
    refine_prototypes,
};
use anyhow::{ensure, Result};
use candle_core::{DType, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use serde::{Deserialize, Serialize};

const ALIGN_EPS: f64 = 1e-7;
const POOL_EPS: f64 = 1e-5;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Encoder output channels; also the width of the modulation blocks.
    pub feat_dim: usize,
    /// Working feature grid, image size divided by the encoder stride.
    pub feat_h: usize,
    pub feat_w: usize,
    pub img_h: usize,
    pub img_w: usize,
    /// Cosine similarity temperature.
    pub scaler: f64,
    /// Channel width both feature maps are pooled to for the prior.
    pub pooled_channels: usize,
    /// Number of cross-modulation rounds per forward pass.
    pub n_cmat: usize,
    /// Prototype refinement steps at inference (0 disables).
    pub n_iters: usize,
    pub refine_lr: f64,
}

impl ModelConfig {
    pub fn default_config() -> Self {
        Self {
            feat_dim: 256,
            feat_h: 32,
            feat_w: 32,
            img_h: 256,
            img_w: 256,
            scaler: 20.0,
            pooled_channels: 256,
            n_cmat: 1,
            n_iters: 1,
            refine_lr: 0.01,
        }
    }

    /// Tiny tier for CPU tests.
    pub fn test_config() -> Self {
        Self {
            feat_dim: 16,
            feat_h: 4,
            feat_w: 4,
            img_h: 32,
            img_w: 32,
            scaler: 20.0,
            pooled_channels: 8,
            n_cmat: 1,
            n_iters: 1,
            refine_lr: 0.01,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.n_cmat >= 1, "n_cmat must be at least 1");
        ensure!(self.feat_dim % 8 == 0, "feat_dim must be divisible by 8");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-call episode context
// ---------------------------------------------------------------------------

/// Shape bookkeeping for one forward pass. Built up front from the inputs
/// and threaded through every helper, so the model object itself carries no
/// per-call mutable state.
#[derive(Debug, Clone, Copy)]
pub struct EpisodeContext {
    pub n_ways: usize,
    pub n_shots: usize,
    pub n_queries: usize,
    pub batch: usize,
    pub img_h: usize,
    pub img_w: usize,
    pub feat_h: usize,
    pub feat_w: usize,
}

impl EpisodeContext {
    fn from_inputs(
        supp_imgs: &[Vec<Tensor>],
        fore_masks: &[Vec<Tensor>],
        qry_imgs: &[Tensor],
        config: &ModelConfig,
    ) -> Result<Self> {
        let n_ways = supp_imgs.len();
        ensure!(n_ways == 1, "only 1-way episodes are supported, got {n_ways}");
        ensure!(
            qry_imgs.len() == 1,
            "only single-query episodes are supported, got {}",
            qry_imgs.len()
        );
        ensure!(
            fore_masks.len() == n_ways && fore_masks[0].len() == supp_imgs[0].len(),
            "foreground masks must mirror the support layout"
        );
        let n_shots = supp_imgs[0].len();
        ensure!(n_shots >= 1, "episode needs at least one support shot");

        let (batch, _, img_h, img_w) = supp_imgs[0][0].dims4()?;
        let batch_q = qry_imgs[0].dims4()?.0;
        ensure!(
            batch == batch_q,
            "support batch {batch} != query batch {batch_q}"
        );
        ensure!(
            (img_h, img_w) == (config.img_h, config.img_w),
            "episode images are {img_h}x{img_w}, model expects {}x{}",
            config.img_h,
            config.img_w
        );
        Ok(Self {
            n_ways,
            n_shots,
            n_queries: qry_imgs.len(),
            batch,
            img_h,
            img_w,
            feat_h: config.feat_h,
            feat_w: config.feat_w,
        })
    }

    /// Row of (way, shot, batch item) in the flattened support features.
    fn supp_row(&self, way: usize, shot: usize, epi: usize) -> usize {
        (way * self.n_shots + shot) * self.batch + epi
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

pub struct FewShotSeg<E: Encoder> {
    encoder: E,
    self_attention: SelfAttention,
    cross_attention: CrossAttention,
    conv_fusion: Conv2d,
    prior: PriorGenerator,
    thresh: Tensor,
    config: ModelConfig,
}

impl<E: Encoder> FewShotSeg<E> {
    pub fn new(encoder: E, config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        ensure!(
            encoder.out_channels() == config.feat_dim,
            "encoder emits {} channels, model configured for {}",
            encoder.out_channels(),
            config.feat_dim
        );
        let dim = config.feat_dim;
        let feat_hw = (config.feat_h, config.feat_w);
        let self_attention = SelfAttention::new(dim, feat_hw, vb.pp("self_attention"))?;
        let cross_attention = CrossAttention::new(dim, feat_hw, vb.pp("cross_attention"))?;
        let conv_fusion = conv2d(
            dim + 1,
            dim,
            1,
            Conv2dConfig::default(),
            vb.pp("conv_fusion"),
        )?;
        let thresh = vb.get_with_hints(1, "thresh", candle_nn::Init::Const(-10.0))?;
        let prior = PriorGenerator::new(config.pooled_channels);
        Ok(Self {
            encoder,
            self_attention,
            cross_attention,
            conv_fusion,
            prior,
            thresh,
            config,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Threshold regularization term for the external total loss.
    pub fn threshold_loss(&self) -> Result<Tensor> {
        self.thresh
            .affine(1.0 / self.config.scaler, 0.0)
            .map_err(Into::into)
    }

    /// Run one episode. `supp_imgs`: way x shot of (B, 3, H, W);
    /// `fore_masks`: way x shot of (B, H, W) binary; `qry_imgs`: one
    /// (B, 3, H, W) group. Returns the upsampled two-channel
    /// (background, foreground) prediction (N*B, 2, H, W) and the
    /// alignment loss (zero unless `train`).
    pub fn forward(
        &self,
        supp_imgs: &[Vec<Tensor>],
        fore_masks: &[Vec<Tensor>],
        qry_imgs: &[Tensor],
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let ctx = EpisodeContext::from_inputs(supp_imgs, fore_masks, qry_imgs, &self.config)?;
        let device = qry_imgs[0].device();

        // One encoder pass over every support and query image.
        let mut all: Vec<Tensor> = Vec::new();
        for way in supp_imgs {
            for shot in way {
                all.push(shot.clone());
            }
        }
        for q in qry_imgs {
            all.push(q.clone());
        }
        let features = self.encoder.encode(&Tensor::cat(&all, 0)?)?;
        let (_, fc, fh, fw) = features.dims4()?;
        ensure!(
            fc == self.config.feat_dim && (fh, fw) == (ctx.feat_h, ctx.feat_w),
            "encoder produced {fc}x{fh}x{fw} features, expected {}x{}x{}",
            self.config.feat_dim,
            ctx.feat_h,
            ctx.feat_w
        );

        let n_supp = ctx.n_ways * ctx.n_shots * ctx.batch;
        let mut supp_fts = features.narrow(0, 0, n_supp)?;
        let mut qry_fts = features.narrow(0, n_supp, ctx.n_queries * ctx.batch)?;

        let mut align_loss = Tensor::zeros((), DType::F32, device)?;
        let mut output = None;
        for _ in 0..self.config.n_cmat {
            let (s, q, out, al) = self.modulation_round(&supp_fts, &qry_fts, fore_masks, ctx, train)?;
            supp_fts = s;
            qry_fts = q;
            output = Some(out);
            align_loss = (align_loss + al)?;
        }
        let align_loss = align_loss
            .affine(1.0 / self.config.n_cmat as f64, 0.0)?
            .affine(1.0 / ctx.batch as f64, 0.0)?;
        Ok((output.expect("n_cmat >= 1"), align_loss))
    }

    /// One cross-modulation round: attention refinement, prior generation,
    /// fusion, cross exchange, prototype scoring, optional refinement, and
    /// the alignment loss in training mode.
    fn modulation_round(
        &self,
        supp_fts: &Tensor,
        qry_fts: &Tensor,
        fore_masks: &[Vec<Tensor>],
        ctx: EpisodeContext,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let cfg = &self.config;
        let device = qry_fts.device();

        let supp_fts = self.self_attention.forward(supp_fts)?;
        let qry_fts = self.self_attention.forward(&qry_fts.contiguous()?)?;

        // Prior over the query, against the shot-concatenated support.
        let mut shot_fts = Vec::with_capacity(ctx.n_shots);
        for shot in 0..ctx.n_shots {
            shot_fts.push(supp_fts.narrow(0, shot * ctx.batch, ctx.batch)?);
        }
        let supp_cat = Tensor::cat(&shot_fts, 1)?; // (B, Sh*C, h, w)
        let prior = self.prior.generate(
            &qry_fts,
            &supp_cat,
            &fore_masks[0][0],
            (ctx.feat_h, ctx.feat_w),
        )?;

        // Fuse the prior into the query features.
        let fused = self
            .conv_fusion
            .forward(&Tensor::cat(&[&qry_fts, &prior], 1)?)?;

        // Per-shot support masks, in flattened row order.
        let mut mask_rows = Vec::with_capacity(ctx.n_ways * ctx.n_shots);
        for way in fore_masks {
            for mask in way {
                mask_rows.push(mask.unsqueeze(1)?);
            }
        }
        let supp_mask = Tensor::cat(&mask_rows, 0)?; // (Wa*Sh*B, 1, H, W)

        let (supp_fts, qry_fts) =
            self.cross_attention
                .forward(&supp_fts, &fused, Some(&supp_mask), Some(&prior))?;

        // Prototype scoring per batch item.
        let mut align_loss = Tensor::zeros((), DType::F32, device)?;
        let mut outputs = Vec::with_capacity(ctx.batch);
        for epi in 0..ctx.batch {
            let mut prototypes = Vec::with_capacity(ctx.n_ways);
            for way in 0..ctx.n_ways {
                let mut shots = Vec::with_capacity(ctx.n_shots);
                for shot in 0..ctx.n_shots {
                    let row = ctx.supp_row(way, shot, epi);
                    let fts = supp_fts.narrow(0, row, 1)?;
                    let mask = fore_masks[way][shot].narrow(0, epi, 1)?;
                    shots.push(masked_average_pool(&fts, &mask)?);
                }
                prototypes.push(mean_prototype(&shots)?);
            }

            let qry_epi = qry_fts.narrow(0, epi, 1)?;
            let mut pred = predict_ways(&qry_epi, &prototypes, &self.thresh, cfg.scaler)?;

            if !train && cfg.n_iters > 0 {
                let refined = refine_prototypes(
                    &qry_epi,
                    &prototypes,
                    &pred,
                    &self.thresh,
                    cfg.scaler,
                    cfg.n_iters,
                    cfg.refine_lr,
                )?;
                pred = predict_ways(&qry_epi, &refined, &self.thresh, cfg.scaler)?;
            }

            let pred_up = resize_bilinear(&pred, ctx.img_h, ctx.img_w, true)?;
            let two_channel = Tensor::cat(&[pred_up.affine(-1.0, 1.0)?, pred_up], 1)?;
            outputs.push(two_channel);

            if train {
                let full = Tensor::cat(&[pred.affine(-1.0, 1.0)?, pred.clone()], 1)?;
                let (loss, _evaluated) =
                    self.align_loss(&qry_epi, &full, &supp_fts, fore_masks, epi, ctx)?;
                align_loss = (align_loss + loss)?;
            }
        }

        let output = Tensor::cat(&outputs, 0)?; // (N*B, 2, H, W)
        Ok((supp_fts, qry_fts, output, align_loss))
    }

    /// Prototype alignment loss: the query's own predicted partition yields
    /// reverse prototypes that must reconstruct the true support masks.
    /// Ways with an empty predicted foreground are skipped, not penalized.
    /// Returns the loss and the number of ways actually evaluated.
    fn align_loss(
        &self,
        qry_fts: &Tensor,
        pred: &Tensor,
        supp_fts: &Tensor,
        fore_masks: &[Vec<Tensor>],
        epi: usize,
        ctx: EpisodeContext,
    ) -> Result<(Tensor, usize)> {
        let device = qry_fts.device();
        let n_classes = 1 + ctx.n_ways;

        // Partition the query by predicted class.
        let pred_class = pred.argmax(1)?.to_dtype(DType::F32)?; // (1, h, w)
        let mut region_masks = Vec::with_capacity(n_classes);
        for class in 0..n_classes {
            let m = pred_class.eq(class as f64)?.to_dtype(DType::F32)?;
            region_masks.push(m);
        }

        // Reverse prototypes from the predicted regions.
        let mut reverse_protos = Vec::with_capacity(n_classes);
        for mask in &region_masks {
            let gated = qry_fts.broadcast_mul(&mask.unsqueeze(1)?)?;
            let summed = gated.sum(3)?.sum(2)?; // (1, C)
            let count = (mask.sum_all()? + POOL_EPS)?;
            reverse_protos.push(summed.broadcast_div(&count)?);
        }

        let mut loss = Tensor::zeros((), DType::F32, device)?;
        let mut evaluated = 0usize;
        for way in 0..ctx.n_ways {
            let fg_pixels = region_masks[way + 1].sum_all()?.to_scalar::<f32>()?;
            if fg_pixels == 0.0 {
                continue;
            }
            evaluated += 1;
            for shot in 0..ctx.n_shots {
                let row = ctx.supp_row(way, shot, epi);
                let supp_epi = supp_fts.narrow(0, row, 1)?;
                let sim =
                    negative_similarity(&supp_epi, &reverse_protos[way + 1], self.config.scaler)?;
                let supp_pred = predict(&sim, &self.thresh)?.unsqueeze(1)?; // (1, 1, h, w)

                let label = fore_masks[way][shot].narrow(0, epi, 1)?; // (1, H, W)
                let up = resize_bilinear(&supp_pred, ctx.img_h, ctx.img_w, true)?;
                let two_channel = Tensor::cat(&[up.affine(-1.0, 1.0)?, up], 1)?;
                let nll = nll_binary(&two_channel, &label)?;
                loss = (loss + nll)?;
            }
        }
        if evaluated > 0 {
            loss = loss.affine(1.0 / (evaluated * ctx.n_shots) as f64, 0.0)?;
        }
        Ok((loss, evaluated))
    }
}

/// Negative log likelihood of a two-channel probability map (1, 2, H, W)
/// against a binary label (1, H, W), with eps-clamped logs.
pub fn nll_binary(probs: &Tensor, label: &Tensor) -> Result<Tensor> {
    let log_probs = log_clamped(probs, ALIGN_EPS)?;
    let log_bg = log_probs.narrow(1, 0, 1)?.squeeze(1)?; // (1, H, W)
    let log_fg = log_probs.narrow(1, 1, 1)?.squeeze(1)?;
    let picked = label
        .broadcast_mul(&log_fg)?
        .broadcast_add(&label.affine(-1.0, 1.0)?.broadcast_mul(&log_bg)?)?;
    picked.mean_all()?.neg().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::ConvEncoder;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn build_model(varmap: &VarMap) -> Result<FewShotSeg<ConvEncoder>> {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &device);
        let config = ModelConfig::test_config();
        let encoder = ConvEncoder::new(config.feat_dim, vb.pp("encoder"))?;
        FewShotSeg::new(encoder, config, vb.pp("model"))
    }

    fn episode_inputs(
        n_shot: usize,
        device: &Device,
    ) -> Result<(Vec<Vec<Tensor>>, Vec<Vec<Tensor>>, Vec<Tensor>)> {
        let mut shots = Vec::new();
        let mut masks = Vec::new();
        for _ in 0..n_shot {
            shots.push(Tensor::randn(0f32, 1.0, (1, 3, 32, 32), device)?);
            let mut m = vec![0f32; 32 * 32];
            for y in 8..20 {
                for x in 8..20 {
                    m[y * 32 + x] = 1.0;
                }
            }
            masks.push(Tensor::from_vec(m, (1, 32, 32), device)?);
        }
        let qry = vec![Tensor::randn(0f32, 1.0, (1, 3, 32, 32), device)?];
        Ok((vec![shots], vec![masks], qry))
    }

    #[test]
    fn test_forward_output_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = build_model(&varmap)?;
        let (supp, masks, qry) = episode_inputs(1, &device)?;
        let (out, align) = model.forward(&supp, &masks, &qry, false)?;
        assert_eq!(out.dims4()?, (1, 2, 32, 32));
        assert_eq!(align.to_scalar::<f32>()?, 0.0, "no align loss at inference");
        // Channels are complementary probabilities.
        let sum = out.sum(1)?.flatten_all()?.to_vec1::<f32>()?;
        for v in sum {
            assert!((v - 1.0).abs() < 1e-4, "channel sum {v} should be 1");
        }
        Ok(())
    }

    #[test]
    fn test_forward_training_align_loss_finite() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = build_model(&varmap)?;
        let (supp, masks, qry) = episode_inputs(1, &device)?;
        let (_, align) = model.forward(&supp, &masks, &qry, true)?;
        let v = align.to_scalar::<f32>()?;
        assert!(v.is_finite() && v >= 0.0, "align loss {v}");
        Ok(())
    }

    #[test]
    fn test_forward_multi_shot() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = build_model(&varmap)?;
        let (supp, masks, qry) = episode_inputs(2, &device)?;
        let (out, _) = model.forward(&supp, &masks, &qry, true)?;
        assert_eq!(out.dims4()?, (1, 2, 32, 32));
        Ok(())
    }

    #[test]
    fn test_two_way_episode_rejected() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = build_model(&varmap)?;
        let (supp, masks, qry) = episode_inputs(1, &device)?;
        let supp2 = vec![supp[0].clone(), supp[0].clone()];
        let masks2 = vec![masks[0].clone(), masks[0].clone()];
        let err = model.forward(&supp2, &masks2, &qry, false).unwrap_err();
        assert!(err.to_string().contains("1-way"));
        Ok(())
    }

    #[test]
    fn test_threshold_loss_initial_value() -> Result<()> {
        let varmap = VarMap::new();
        let model = build_model(&varmap)?;
        let t = model.threshold_loss()?.flatten_all()?.to_vec1::<f32>()?;
        assert!((t[0] - (-0.5)).abs() < 1e-5, "t/scaler should start at -0.5");
        Ok(())
    }

    #[test]
    fn test_backward_through_forward() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = build_model(&varmap)?;
        let (supp, masks, qry) = episode_inputs(1, &device)?;
        let (out, align) = model.forward(&supp, &masks, &qry, true)?;
        let loss = (out.mean_all()? + align)?;
        let grads = loss.backward()?;
        let mut any_grad = false;
        for var in varmap.all_vars() {
            if let Some(g) = grads.get(var.as_tensor()) {
                let m = g.abs()?.max_all()?.to_scalar::<f32>()?;
                assert!(m.is_finite(), "non-finite gradient");
                any_grad = true;
            }
        }
        assert!(any_grad, "at least one parameter should receive gradient");
        Ok(())
    }

    #[test]
    fn test_nll_binary_prefers_correct_prediction() -> Result<()> {
        let device = Device::Cpu;
        let label = Tensor::ones((1, 4, 4), DType::F32, &device)?;
        let fg = Tensor::full(0.9f32, (1, 1, 4, 4), &device)?;
        let good = Tensor::cat(&[fg.affine(-1.0, 1.0)?, fg.clone()], 1)?;
        let bad = Tensor::cat(&[fg.clone(), fg.affine(-1.0, 1.0)?], 1)?;
        let l_good = nll_binary(&good, &label)?.to_scalar::<f32>()?;
        let l_bad = nll_binary(&bad, &label)?.to_scalar::<f32>()?;
        assert!(l_good < l_bad);
        Ok(())
    }
}
