// Prior generation: a single-channel spatial map highlighting query regions
// that resemble the masked support foreground, computed as the per-position
// maximum cosine similarity between channel-pooled query and support tokens.

use crate::ops::{adaptive_avg_pool_1d, minmax_normalize_rows, resize_bilinear};
use anyhow::{ensure, Result};
use candle_core::Tensor;

pub const COSINE_EPS: f64 = 1e-7;

/// Stateless prior generator. `pooled_channels` is the fixed channel width
/// both feature maps are adaptively pooled to before correlation.
pub struct PriorGenerator {
    pooled_channels: usize,
}

impl PriorGenerator {
    pub fn new(pooled_channels: usize) -> Self {
        Self { pooled_channels }
    }

    /// `query_feat`: (B, C, h, w). `support_feat`: (B, Cs, h, w); Cs may
    /// differ from C (support shots are channel-concatenated upstream).
    /// `support_mask`: (B, Hm, Wm) binary foreground mask at any
    /// resolution. Output: (B, 1, out_h, out_w) prior in [0, 1].
    pub fn generate(
        &self,
        query_feat: &Tensor,
        support_feat: &Tensor,
        support_mask: &Tensor,
        out_hw: (usize, usize),
    ) -> Result<Tensor> {
        let (b, _, h, w) = query_feat.dims4()?;
        let (bs, _, hs, ws) = support_feat.dims4()?;
        ensure!(b == bs, "query batch {b} != support batch {bs}");
        ensure!(
            (h, w) == (hs, ws),
            "query grid {h}x{w} != support grid {hs}x{ws}"
        );

        // Gate the support features by the interpolated foreground mask.
        let mask = resize_bilinear(&support_mask.unsqueeze(1)?, h, w, true)?;
        let supp = support_feat.broadcast_mul(&mask)?;

        // Channel-pool both maps to a common token width.
        let q = adaptive_avg_pool_1d(
            &query_feat
                .reshape((b, query_feat.dim(1)?, h * w))?
                .transpose(1, 2)?
                .contiguous()?,
            self.pooled_channels,
        )?; // (B, HW, P)
        let s = adaptive_avg_pool_1d(
            &supp
                .reshape((b, supp.dim(1)?, h * w))?
                .transpose(1, 2)?
                .contiguous()?,
            self.pooled_channels,
        )?; // (B, HW, P)

        // Cosine similarity of every support position to every query position.
        let q_t = q.transpose(1, 2)?.contiguous()?; // (B, P, HWq)
        let q_norm = q_t.sqr()?.sum_keepdim(1)?.sqrt()?; // (B, 1, HWq)
        let s_norm = s.sqr()?.sum_keepdim(2)?.sqrt()?; // (B, HWs, 1)
        let numer = s.matmul(&q_t)?; // (B, HWs, HWq)
        let denom = (s_norm.matmul(&q_norm)? + COSINE_EPS)?;
        let similarity = numer.broadcast_div(&denom)?;

        // Best support match per query position, min-max normalized per item.
        let best = similarity.max(1)?; // (B, HWq)
        let best = minmax_normalize_rows(&best, COSINE_EPS)?;
        let prior = best.reshape((b, 1, h, w))?;
        resize_bilinear(&prior, out_hw.0, out_hw.1, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_prior_shape_and_range() -> Result<()> {
        let device = Device::Cpu;
        let gen = PriorGenerator::new(8);
        let q = Tensor::randn(0f32, 1.0, (2, 16, 4, 4), &device)?;
        let s = Tensor::randn(0f32, 1.0, (2, 16, 4, 4), &device)?;
        let m = Tensor::ones((2, 16, 16), DType::F32, &device)?;
        let prior = gen.generate(&q, &s, &m, (4, 4))?;
        assert_eq!(prior.dims4()?, (2, 1, 4, 4));
        for v in prior.flatten_all()?.to_vec1::<f32>()? {
            assert!((-1e-5..=1.0 + 1e-5).contains(&v), "prior value {v}");
        }
        Ok(())
    }

    #[test]
    fn test_constant_similarity_no_nan() -> Result<()> {
        let device = Device::Cpu;
        let gen = PriorGenerator::new(8);
        // Identical features everywhere give a perfectly constant
        // similarity map; the epsilon keeps the normalization finite.
        let q = Tensor::ones((1, 16, 4, 4), DType::F32, &device)?;
        let s = Tensor::ones((1, 16, 4, 4), DType::F32, &device)?;
        let m = Tensor::ones((1, 16, 16), DType::F32, &device)?;
        let prior = gen.generate(&q, &s, &m, (4, 4))?;
        for v in prior.flatten_all()?.to_vec1::<f32>()? {
            assert!(v.is_finite(), "prior must not be NaN");
        }
        Ok(())
    }

    #[test]
    fn test_zero_mask_no_nan() -> Result<()> {
        let device = Device::Cpu;
        let gen = PriorGenerator::new(8);
        let q = Tensor::randn(0f32, 1.0, (1, 16, 4, 4), &device)?;
        let s = Tensor::randn(0f32, 1.0, (1, 16, 4, 4), &device)?;
        let m = Tensor::zeros((1, 16, 16), DType::F32, &device)?;
        let prior = gen.generate(&q, &s, &m, (4, 4))?;
        for v in prior.flatten_all()?.to_vec1::<f32>()? {
            assert!(v.is_finite());
        }
        Ok(())
    }

    #[test]
    fn test_matching_region_scores_high() -> Result<()> {
        let device = Device::Cpu;
        let gen = PriorGenerator::new(8);
        // Support has a distinctive foreground pattern; the query repeats
        // it in its top-left cell and is orthogonal elsewhere.
        let mut s_data = vec![0f32; 16 * 4];
        let mut q_data = vec![0f32; 16 * 4];
        for c in 0..8 {
            s_data[c * 4] = 1.0; // support position 0, channels 0..8
            q_data[c * 4] = 1.0; // query position 0 matches
        }
        for c in 8..16 {
            for p in 1..4 {
                q_data[c * 4 + p] = 1.0; // other query positions differ
            }
        }
        let s = Tensor::from_vec(s_data, (1, 16, 2, 2), &device)?;
        let q = Tensor::from_vec(q_data, (1, 16, 2, 2), &device)?;
        let mut m_data = vec![0f32; 4];
        m_data[0] = 1.0;
        let m = Tensor::from_vec(m_data, (1, 2, 2), &device)?;
        let prior = gen.generate(&q, &s, &m, (2, 2))?;
        let v = prior.flatten_all()?.to_vec1::<f32>()?;
        assert!(
            v[0] > v[3],
            "matching region should outrank non-matching: {v:?}"
        );
        Ok(())
    }
}
