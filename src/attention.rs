// Feature modulation blocks: spatial self-attention over one feature map
// and bidirectional mask-gated cross-attention between the support and
// query feature maps.

use crate::ops::{resize_bilinear, softmax};
use anyhow::{ensure, Result};
use candle_core::{Module, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};

// ---------------------------------------------------------------------------
// FeatureNorm: layer normalization over (C, H, W) jointly
// ---------------------------------------------------------------------------

/// Layer norm across all of (channels, height, width) of each sample, with
/// a learnable elementwise affine of that full shape. The shape is a
/// constructor parameter tied to the working feature resolution, not a
/// hardcoded constant.
pub struct FeatureNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl FeatureNorm {
    pub fn new(shape: (usize, usize, usize), vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(shape, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(shape, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            eps: 1e-5,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let flat = x.reshape((b, c * h * w))?;
        let mean = flat.mean_keepdim(1)?;
        let centered = flat.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        let normed = normed.reshape((b, c, h, w))?;
        normed
            .broadcast_mul(&self.weight.unsqueeze(0)?)?
            .broadcast_add(&self.bias.unsqueeze(0)?)
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

fn conv1x1(c_in: usize, c_out: usize, vb: VarBuilder) -> Result<Conv2d> {
    conv2d(c_in, c_out, 1, Conv2dConfig::default(), vb).map_err(Into::into)
}

/// Position-wise two-layer MLP (dim -> dim, ReLU, dim -> dim) applied to
/// every spatial location of a (B, C, H, W) map.
fn mlp_forward(fc1: &Linear, fc2: &Linear, x: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    let flat = x
        .permute((0, 2, 3, 1))?
        .contiguous()?
        .reshape((b * h * w, c))?;
    let out = fc2.forward(&fc1.forward(&flat)?.relu()?)?;
    out.reshape((b, h, w, c))?
        .permute((0, 3, 1, 2))?
        .contiguous()
        .map_err(Into::into)
}

/// Flatten a (B, C, H, W) projection to (B, C', H*W).
fn to_tokens(x: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    x.reshape((b, c, h * w)).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Self-attention
// ---------------------------------------------------------------------------

/// Single-head spatial self-attention with 1x1-conv projections
/// (query/key at dim/8, value at dim), residual connection, position-wise
/// feed-forward, and joint (C, H, W) layer normalization.
pub struct SelfAttention {
    query: Conv2d,
    key: Conv2d,
    value: Conv2d,
    fc1: Linear,
    fc2: Linear,
    norm: FeatureNorm,
    dim: usize,
}

impl SelfAttention {
    pub fn new(dim: usize, feat_hw: (usize, usize), vb: VarBuilder) -> Result<Self> {
        ensure!(dim % 8 == 0, "attention dim {dim} must be divisible by 8");
        Ok(Self {
            query: conv1x1(dim, dim / 8, vb.pp("query"))?,
            key: conv1x1(dim, dim / 8, vb.pp("key"))?,
            value: conv1x1(dim, dim, vb.pp("value"))?,
            fc1: linear(dim, dim, vb.pp("mlp.0"))?,
            fc2: linear(dim, dim, vb.pp("mlp.2"))?,
            norm: FeatureNorm::new((dim, feat_hw.0, feat_hw.1), vb.pp("norm"))?,
            dim,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        ensure!(c == self.dim, "expected {} channels, got {c}", self.dim);
        let scale = ((self.dim / 8) as f64).powf(-0.5);

        let q = to_tokens(&self.query.forward(x)?)?
            .permute((0, 2, 1))?
            .contiguous()?
            .affine(scale, 0.0)?; // (B, HW, C')
        let k = to_tokens(&self.key.forward(x)?)?; // (B, C', HW)
        let v = to_tokens(&self.value.forward(x)?)?; // (B, C, HW)

        // Scores normalized along the query-position axis.
        let attn = softmax(&q.matmul(&k)?, 1)?; // (B, HWq, HWk)
        let out = v
            .matmul(&attn.transpose(1, 2)?.contiguous()?)?
            .reshape((b, c, h, w))?;

        let h1 = (x + out)?;
        let h2 = (&h1 + mlp_forward(&self.fc1, &self.fc2, &h1)?)?;
        self.norm.forward(&h2)
    }
}

// ---------------------------------------------------------------------------
// Cross-attention
// ---------------------------------------------------------------------------

/// Bidirectional cross-attention between the support features `x` and the
/// query features `y`. Each direction attends into the other map, is
/// optionally gated by an interpolated spatial mask, and is post-processed
/// by residual + norm + MLP residual + norm. When the support carries more
/// rows than the query (multiple shots), the query is replicated across
/// shots for the exchange and its direction is averaged back.
pub struct CrossAttention {
    query: Conv2d,
    key: Conv2d,
    value: Conv2d,
    fc1: Linear,
    fc2: Linear,
    norm1: FeatureNorm,
    norm2: FeatureNorm,
    dim: usize,
}

impl CrossAttention {
    pub fn new(dim: usize, feat_hw: (usize, usize), vb: VarBuilder) -> Result<Self> {
        ensure!(dim % 8 == 0, "attention dim {dim} must be divisible by 8");
        Ok(Self {
            query: conv1x1(dim, dim / 8, vb.pp("query"))?,
            key: conv1x1(dim, dim / 8, vb.pp("key"))?,
            value: conv1x1(dim, dim, vb.pp("value"))?,
            fc1: linear(dim, dim, vb.pp("mlp.0"))?,
            fc2: linear(dim, dim, vb.pp("mlp.2"))?,
            norm1: FeatureNorm::new((dim, feat_hw.0, feat_hw.1), vb.pp("norm1"))?,
            norm2: FeatureNorm::new((dim, feat_hw.0, feat_hw.1), vb.pp("norm2"))?,
            dim,
        })
    }

    /// One attention direction: queries from `from`, keys/values from `to`,
    /// gated by `gate` (already at feature resolution) when present.
    fn attend(&self, from: &Tensor, to: &Tensor, gate: Option<&Tensor>) -> Result<Tensor> {
        let (b, c, h, w) = from.dims4()?;
        let scale = ((self.dim / 8) as f64).powf(-0.5);

        let q = to_tokens(&self.query.forward(from)?)?
            .permute((0, 2, 1))?
            .contiguous()?
            .affine(scale, 0.0)?; // (B, HW, C')
        let k = to_tokens(&self.key.forward(to)?)?; // (B, C', HW)
        let v = to_tokens(&self.value.forward(to)?)?; // (B, C, HW)

        let attn = softmax(&q.matmul(&k)?, 2)?; // (B, HWq, HWk)
        let mut out = v
            .matmul(&attn.transpose(1, 2)?.contiguous()?)?
            .reshape((b, c, h, w))?;
        if let Some(gate) = gate {
            out = out.broadcast_mul(gate)?;
        }

        let h1 = self.norm1.forward(&(from + out)?)?;
        let h2 = (&h1 + mlp_forward(&self.fc1, &self.fc2, &h1)?)?;
        self.norm2.forward(&h2)
    }

    /// `x`: support features (Sx, C, h, w). `y`: query features (Sy, C, h, w)
    /// with Sx a multiple of Sy. `support_mask`: (Sx, 1, Hm, Wm) foreground
    /// mask at any resolution. `query_prior`: (Sy, 1, h, w) prior map at
    /// feature resolution. Returns the two modulated maps in input layout.
    pub fn forward(
        &self,
        x: &Tensor,
        y: &Tensor,
        support_mask: Option<&Tensor>,
        query_prior: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let (sx, _, h, w) = x.dims4()?;
        let sy = y.dims4()?.0;
        ensure!(
            sx % sy == 0,
            "support rows {sx} must be a multiple of query rows {sy}"
        );
        let rep = sx / sy;
        let y_rep = if rep == 1 {
            y.clone()
        } else {
            y.repeat((rep, 1, 1, 1))?
        };

        let s_gate = match support_mask {
            Some(m) => Some(resize_bilinear(m, h, w, true)?),
            None => None,
        };
        let q_gate = match query_prior {
            Some(p) if rep > 1 => Some(p.repeat((rep, 1, 1, 1))?),
            Some(p) => Some(p.clone()),
            None => None,
        };

        let out_x = self.attend(x, &y_rep, s_gate.as_ref())?;
        let out_y = self.attend(&y_rep, x, q_gate.as_ref())?;
        let out_y = if rep == 1 {
            out_y
        } else {
            let (_, c, _, _) = out_y.dims4()?;
            out_y.reshape((rep, sy, c, h, w))?.mean(0)?
        };
        Ok((out_x, out_y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    const DIM: usize = 16;
    const HW: (usize, usize) = (4, 4);

    fn vb(varmap: &VarMap) -> VarBuilder<'static> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_feature_norm_zero_mean_unit_var() -> Result<()> {
        let varmap = VarMap::new();
        let norm = FeatureNorm::new((DIM, HW.0, HW.1), vb(&varmap).pp("n"))?;
        let x = Tensor::randn(3f32, 2.0, (2, DIM, HW.0, HW.1), &Device::Cpu)?;
        let y = norm.forward(&x)?;
        let mean = y.mean_all()?.to_scalar::<f32>()?;
        assert!(mean.abs() < 1e-4, "mean {mean} should be ~0");
        let var = y.sqr()?.mean_all()?.to_scalar::<f32>()?;
        assert!((var - 1.0).abs() < 0.05, "variance {var} should be ~1");
        Ok(())
    }

    #[test]
    fn test_self_attention_preserves_shape() -> Result<()> {
        let varmap = VarMap::new();
        let attn = SelfAttention::new(DIM, HW, vb(&varmap).pp("sa"))?;
        let x = Tensor::randn(0f32, 1.0, (3, DIM, HW.0, HW.1), &Device::Cpu)?;
        let y = attn.forward(&x)?;
        assert_eq!(y.dims4()?, (3, DIM, HW.0, HW.1));
        for v in y.flatten_all()?.to_vec1::<f32>()? {
            assert!(v.is_finite());
        }
        Ok(())
    }

    #[test]
    fn test_self_attention_rejects_bad_dim() {
        let varmap = VarMap::new();
        assert!(SelfAttention::new(12, HW, vb(&varmap).pp("sa")).is_err());
    }

    #[test]
    fn test_cross_attention_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let attn = CrossAttention::new(DIM, HW, vb(&varmap).pp("ca"))?;
        let x = Tensor::randn(0f32, 1.0, (1, DIM, HW.0, HW.1), &Device::Cpu)?;
        let y = Tensor::randn(0f32, 1.0, (1, DIM, HW.0, HW.1), &Device::Cpu)?;
        let mask = Tensor::ones((1, 1, 16, 16), DType::F32, &Device::Cpu)?;
        let prior = Tensor::rand(0f32, 1.0, (1, 1, HW.0, HW.1), &Device::Cpu)?;
        let (ox, oy) = attn.forward(&x, &y, Some(&mask), Some(&prior))?;
        assert_eq!(ox.dims4()?, (1, DIM, HW.0, HW.1));
        assert_eq!(oy.dims4()?, (1, DIM, HW.0, HW.1));
        Ok(())
    }

    #[test]
    fn test_cross_attention_multi_shot_rows() -> Result<()> {
        let varmap = VarMap::new();
        let attn = CrossAttention::new(DIM, HW, vb(&varmap).pp("ca"))?;
        let x = Tensor::randn(0f32, 1.0, (3, DIM, HW.0, HW.1), &Device::Cpu)?;
        let y = Tensor::randn(0f32, 1.0, (1, DIM, HW.0, HW.1), &Device::Cpu)?;
        let (ox, oy) = attn.forward(&x, &y, None, None)?;
        assert_eq!(ox.dims4()?.0, 3, "support keeps per-shot rows");
        assert_eq!(oy.dims4()?.0, 1, "query direction is averaged back");
        Ok(())
    }

    #[test]
    fn test_mask_gating_changes_output() -> Result<()> {
        let varmap = VarMap::new();
        let attn = CrossAttention::new(DIM, HW, vb(&varmap).pp("ca"))?;
        let x = Tensor::randn(0f32, 1.0, (1, DIM, HW.0, HW.1), &Device::Cpu)?;
        let y = Tensor::randn(0f32, 1.0, (1, DIM, HW.0, HW.1), &Device::Cpu)?;
        let zero_mask = Tensor::zeros((1, 1, HW.0, HW.1), DType::F32, &Device::Cpu)?;
        let (gated, _) = attn.forward(&x, &y, Some(&zero_mask), None)?;
        let (open, _) = attn.forward(&x, &y, None, None)?;
        let diff = (gated - open)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff > 1e-6, "zero gate should suppress the attended term");
        Ok(())
    }
}
