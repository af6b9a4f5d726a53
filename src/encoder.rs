// Backbone collaborator: the segmentation core only requires a feature
// extractor mapping (N, 3, H, W) images to (N, C, H/8, W/8) features. A
// small strided convolutional reference implementation is provided for
// tests, selftests and synthetic training; real deployments plug a
// pretrained backbone in behind the same trait.

use anyhow::{bail, ensure, Context, Result};
use candle_core::{Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Feature-extraction contract. Implementations must be deterministic
/// given their weights and expose no mutable state to the caller.
pub trait Encoder {
    fn encode(&self, images: &Tensor) -> Result<Tensor>;
    fn out_channels(&self) -> usize;
    /// Spatial reduction factor from image to feature resolution.
    fn stride(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Reference convolutional encoder
// ---------------------------------------------------------------------------

/// Four-layer strided conv stack, 3 -> out_dim channels at 1/8 resolution.
pub struct ConvEncoder {
    layers: Vec<Conv2d>,
    out_dim: usize,
}

impl ConvEncoder {
    pub fn new(out_dim: usize, vb: VarBuilder) -> Result<Self> {
        ensure!(out_dim >= 8, "encoder output dim {out_dim} is too small");
        let strided = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let same = Conv2dConfig {
            padding: 1,
            stride: 1,
            ..Default::default()
        };
        let widths = [3, out_dim / 4, out_dim / 2, out_dim];
        let mut layers = Vec::new();
        for i in 0..3 {
            layers.push(conv2d(
                widths[i],
                widths[i + 1],
                3,
                strided,
                vb.pp(format!("conv{i}")),
            )?);
        }
        layers.push(conv2d(out_dim, out_dim, 3, same, vb.pp("conv3"))?);
        Ok(Self { layers, out_dim })
    }
}

impl Encoder for ConvEncoder {
    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let mut x = images.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i + 1 < self.layers.len() {
                x = x.relu()?;
            }
        }
        Ok(x)
    }

    fn out_channels(&self) -> usize {
        self.out_dim
    }

    fn stride(&self) -> usize {
        8
    }
}

// ---------------------------------------------------------------------------
// Pretrained weight fetch
// ---------------------------------------------------------------------------

/// Download descriptor for pretrained backbone weights. TLS verification
/// can be disabled per source via `allow_insecure_tls`, and only there;
/// there is no process-wide bypass.
pub struct WeightSource {
    pub url: String,
    pub dest: PathBuf,
    pub allow_insecure_tls: bool,
}

impl WeightSource {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            allow_insecure_tls: false,
        }
    }

    /// Fetch the weights unless already present. Returns the local path.
    pub fn fetch(&self) -> Result<&Path> {
        if self.dest.exists() {
            return Ok(&self.dest);
        }
        let mut cmd = Command::new("curl");
        cmd.args(["--fail", "--location", "--silent", "--show-error"]);
        if self.allow_insecure_tls {
            eprintln!(
                "[WEIGHTS] TLS verification disabled for {} (per-source opt-in)",
                self.url
            );
            cmd.arg("--insecure");
        }
        cmd.arg("--output").arg(&self.dest).arg(&self.url);
        let status = cmd
            .status()
            .with_context(|| format!("failed to run curl for {}", self.url))?;
        if !status.success() {
            bail!("weight download failed with {status}: {}", self.url);
        }
        eprintln!("[WEIGHTS] Fetched {} -> {}", self.url, self.dest.display());
        Ok(&self.dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(dim: usize) -> Result<ConvEncoder> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        ConvEncoder::new(dim, vb.pp("encoder"))
    }

    #[test]
    fn test_encoder_shape_and_stride() -> Result<()> {
        let enc = build(32)?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &Device::Cpu)?;
        let f = enc.encode(&x)?;
        assert_eq!(f.dims4()?, (2, 32, 4, 4));
        assert_eq!(enc.stride(), 8);
        assert_eq!(enc.out_channels(), 32);
        Ok(())
    }

    #[test]
    fn test_encoder_is_deterministic() -> Result<()> {
        let enc = build(16)?;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 16, 16), &Device::Cpu)?;
        let a = enc.encode(&x)?;
        let b = enc.encode(&x)?;
        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-7);
        Ok(())
    }

    #[test]
    fn test_weight_source_skips_existing_file() -> Result<()> {
        let dest = std::env::temp_dir().join("protoseg_test_weights.bin");
        std::fs::write(&dest, b"stub")?;
        let source = WeightSource::new("https://localhost/never-contacted", &dest);
        let path = source.fetch()?;
        assert_eq!(path, dest.as_path());
        std::fs::remove_file(&dest).ok();
        Ok(())
    }
}
