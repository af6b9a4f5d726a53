// Episodic sampling over labeled volumes: pick a class, find a contiguous
// run of slices containing it, split the run into support and query groups,
// and package the result (with augmentation) as one few-shot episode.

use crate::augment;
use anyhow::{bail, ensure, Result};
use candle_core::{Device, Tensor};
use ndarray::{Array3, Array4, Array5, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Labeled volume
// ---------------------------------------------------------------------------

/// One intensity volume with its aligned integer label volume. The image is
/// normalized to zero mean, unit variance at construction and immutable
/// afterwards. Label convention: 0 = background, positive ids = structures.
#[derive(Debug)]
pub struct LabeledVolume {
    pub image: Array3<f32>,
    pub label: Array3<i64>,
}

impl LabeledVolume {
    /// Build from raw arrays, normalizing intensities. The volumes must
    /// already be resized to the working grid by the loading collaborator.
    pub fn from_raw(image: Array3<f32>, label: Array3<i64>) -> Result<Self> {
        ensure!(
            image.dim() == label.dim(),
            "image shape {:?} does not match label shape {:?}",
            image.dim(),
            label.dim()
        );
        let n = image.len() as f32;
        let mean = image.sum() / n;
        let var = image.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        let std = (var + 1e-8).sqrt();
        let image = image.mapv(|v| (v - mean) / std);
        Ok(Self { image, label })
    }

    pub fn n_slices(&self) -> usize {
        self.image.dim().0
    }

    /// Distinct non-background class ids present in the label volume.
    pub fn classes(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.label.iter().copied().filter(|&c| c != 0).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Slice indices where `class` occupies at least one pixel.
    pub fn class_slice_indices(&self, class: i64) -> Vec<usize> {
        (0..self.n_slices())
            .filter(|&s| {
                self.label
                    .index_axis(Axis(0), s)
                    .iter()
                    .any(|&c| c == class)
            })
            .collect()
    }

    /// Foreground pixel count of `class` in one slice.
    pub fn fg_count(&self, slice: usize, class: i64) -> usize {
        self.label
            .index_axis(Axis(0), slice)
            .iter()
            .filter(|&&c| c == class)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Sampler configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub n_shot: usize,
    pub n_way: usize,
    pub n_query: usize,
    /// Supervoxel count of the pseudo-label source. Recognized for config
    /// compatibility; the ground-truth path implemented here does not use it.
    pub n_sv: usize,
    /// Minimum foreground pixel count required of the extremal slices.
    pub min_size: usize,
    /// Class ids held out for testing, never sampled.
    pub test_labels: Vec<i64>,
    /// Class ids excluded from sampling; slices containing them are also
    /// removed from the candidate set.
    pub exclude_labels: Vec<i64>,
    /// Sample from ground-truth labels. The only supported label source.
    pub use_gt: bool,
    /// Bound on the resample loop before giving up with an error.
    pub max_retries: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            n_shot: 1,
            n_way: 1,
            n_query: 1,
            n_sv: 5000,
            min_size: 200,
            test_labels: Vec::new(),
            exclude_labels: Vec::new(),
            use_gt: true,
            max_retries: 64,
        }
    }
}

impl SamplerConfig {
    /// Fail-fast validation, before any sampling work.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.use_gt,
            "use_gt=false requires a supervoxel label source, which is not implemented"
        );
        ensure!(self.n_way == 1, "n_way must be 1, got {}", self.n_way);
        ensure!(self.n_query == 1, "n_query must be 1, got {}", self.n_query);
        ensure!(self.n_shot >= 1, "n_shot must be at least 1");
        ensure!(self.max_retries >= 1, "max_retries must be at least 1");
        Ok(())
    }

    pub fn slices_needed(&self) -> usize {
        self.n_shot * self.n_way + self.n_query
    }
}

// ---------------------------------------------------------------------------
// Episode
// ---------------------------------------------------------------------------

/// One sampled few-shot task: support set, query set, padding masks, and
/// the provenance (class id and chosen slice indices in final order).
#[derive(Debug)]
pub struct Episode {
    /// way x shot x 3 x H x W, gray channel replicated to 3.
    pub support_images: Array5<f32>,
    /// way x shot x H x W, binary {0, 1}.
    pub support_fg_masks: Array4<f32>,
    /// n_query x 3 x H x W.
    pub query_images: Array4<f32>,
    /// n_query x H x W, binary {0, 1}.
    pub query_labels: Array3<f32>,
    /// n_query x H x W, zero-initialized (reserved for masking policy).
    pub padding_mask: Array3<f32>,
    /// way x shot x H x W, zero-initialized.
    pub support_padding_mask: Array4<f32>,
    pub class_id: i64,
    pub slice_indices: Vec<usize>,
}

/// Episode contents converted to candle tensors with batch dimension 1,
/// in the nested way x shot layout the model's forward pass expects.
pub struct EpisodeTensors {
    pub support_images: Vec<Vec<Tensor>>,
    pub support_fg_masks: Vec<Vec<Tensor>>,
    pub query_images: Vec<Tensor>,
    pub query_labels: Tensor,
}

impl Episode {
    pub fn to_tensors(&self, device: &Device) -> Result<EpisodeTensors> {
        let (n_way, n_shot, _, h, w) = self.support_images.dim();
        let n_query = self.query_images.dim().0;

        let mut support_images = Vec::with_capacity(n_way);
        let mut support_fg_masks = Vec::with_capacity(n_way);
        for way in 0..n_way {
            let mut imgs = Vec::with_capacity(n_shot);
            let mut masks = Vec::with_capacity(n_shot);
            for shot in 0..n_shot {
                let img = self
                    .support_images
                    .index_axis(Axis(0), way)
                    .index_axis(Axis(0), shot)
                    .to_owned();
                imgs.push(Tensor::from_vec(
                    img.into_raw_vec(),
                    (1, 3, h, w),
                    device,
                )?);
                let mask = self
                    .support_fg_masks
                    .index_axis(Axis(0), way)
                    .index_axis(Axis(0), shot)
                    .to_owned();
                masks.push(Tensor::from_vec(mask.into_raw_vec(), (1, h, w), device)?);
            }
            support_images.push(imgs);
            support_fg_masks.push(masks);
        }

        let mut query_images = Vec::with_capacity(n_query);
        for q in 0..n_query {
            let img = self.query_images.index_axis(Axis(0), q).to_owned();
            query_images.push(Tensor::from_vec(img.into_raw_vec(), (1, 3, h, w), device)?);
        }
        let query_labels = Tensor::from_vec(
            self.query_labels.clone().into_raw_vec(),
            (n_query, h, w),
            device,
        )?;

        Ok(EpisodeTensors {
            support_images,
            support_fg_masks,
            query_images,
            query_labels,
        })
    }
}

// ---------------------------------------------------------------------------
// Episodic sampler
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct EpisodeSampler {
    volumes: Vec<LabeledVolume>,
    config: SamplerConfig,
}

impl EpisodeSampler {
    pub fn new(volumes: Vec<LabeledVolume>, config: SamplerConfig) -> Result<Self> {
        config.validate()?;
        ensure!(!volumes.is_empty(), "sampler needs at least one volume");
        Ok(Self { volumes, config })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Sample one episode. Retries across volumes and classes up to
    /// `max_retries` times; exhaustion is an explicit error rather than
    /// unbounded recursion.
    pub fn sample(&self, rng: &mut StdRng) -> Result<Episode> {
        for _ in 0..self.config.max_retries {
            let volume = &self.volumes[rng.gen_range(0..self.volumes.len())];
            if let Some((class_id, window)) = self.try_pick_window(volume, rng) {
                let mut window = window;
                if rng.gen_bool(0.5) {
                    window.reverse();
                }
                return self.build_episode(volume, class_id, window, rng);
            }
        }
        bail!(
            "no eligible episode after {} attempts (need {} contiguous slices with >= {} foreground pixels)",
            self.config.max_retries,
            self.config.slices_needed(),
            self.config.min_size
        );
    }

    /// Classes of a volume that may be sampled: present, non-background,
    /// and not held out or excluded.
    fn eligible_classes(&self, volume: &LabeledVolume) -> Vec<i64> {
        volume
            .classes()
            .into_iter()
            .filter(|c| !self.config.test_labels.contains(c))
            .filter(|c| !self.config.exclude_labels.contains(c))
            .collect()
    }

    /// One sampling attempt: pick a class, collect its candidate slices,
    /// and draw a contiguous window satisfying the minimum-size constraint.
    /// Returns the window in ascending order (pre-reversal).
    fn try_pick_window(&self, volume: &LabeledVolume, rng: &mut StdRng) -> Option<(i64, Vec<usize>)> {
        let classes = self.eligible_classes(volume);
        if classes.is_empty() {
            return None;
        }
        let class_id = classes[rng.gen_range(0..classes.len())];

        let mut indices = volume.class_slice_indices(class_id);
        let excluded = self.excluded_slices(volume);
        indices.retain(|i| !excluded.contains(i));

        let needed = self.config.slices_needed();
        let runs: Vec<Vec<usize>> = contiguous_runs(&indices)
            .into_iter()
            .filter(|r| r.len() >= needed)
            .collect();
        if runs.is_empty() {
            return None;
        }

        let run = &runs[rng.gen_range(0..runs.len())];
        let start = rng.gen_range(0..=run.len() - needed);
        let window: Vec<usize> = run[start..start + needed].to_vec();

        let size = volume
            .fg_count(window[0], class_id)
            .max(volume.fg_count(window[1], class_id));
        if size < self.config.min_size {
            return None;
        }
        Some((class_id, window))
    }

    /// Slices containing any excluded class, removed from the candidate set.
    fn excluded_slices(&self, volume: &LabeledVolume) -> Vec<usize> {
        let mut out = Vec::new();
        for &class in &self.config.exclude_labels {
            out.extend(volume.class_slice_indices(class));
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    fn build_episode(
        &self,
        volume: &LabeledVolume,
        class_id: i64,
        window: Vec<usize>,
        rng: &mut StdRng,
    ) -> Result<Episode> {
        let cfg = &self.config;
        let (_, h, w) = volume.image.dim();
        let n_support = cfg.n_shot * cfg.n_way;

        let mut support_images: Array5<f32> = Array5::zeros((cfg.n_way, cfg.n_shot, 3, h, w));
        let mut support_fg_masks: Array4<f32> = Array4::zeros((cfg.n_way, cfg.n_shot, h, w));
        let mut query_images: Array4<f32> = Array4::zeros((cfg.n_query, 3, h, w));
        let mut query_labels: Array3<f32> = Array3::zeros((cfg.n_query, h, w));

        for (k, &slice) in window[..n_support].iter().enumerate() {
            let way = k / cfg.n_shot;
            let shot = k % cfg.n_shot;
            let img = volume.image.index_axis(Axis(0), slice);
            for c in 0..3 {
                support_images
                    .index_axis_mut(Axis(0), way)
                    .index_axis_mut(Axis(0), shot)
                    .index_axis_mut(Axis(0), c)
                    .assign(&img);
            }
            let mask = volume
                .label
                .index_axis(Axis(0), slice)
                .mapv(|c| if c == class_id { 1.0f32 } else { 0.0 });
            support_fg_masks
                .index_axis_mut(Axis(0), way)
                .index_axis_mut(Axis(0), shot)
                .assign(&mask);
        }

        for (q, &slice) in window[n_support..].iter().enumerate() {
            let img = volume.image.index_axis(Axis(0), slice);
            for c in 0..3 {
                query_images
                    .index_axis_mut(Axis(0), q)
                    .index_axis_mut(Axis(0), c)
                    .assign(&img);
            }
            let mask = volume
                .label
                .index_axis(Axis(0), slice)
                .mapv(|c| if c == class_id { 1.0f32 } else { 0.0 });
            query_labels.index_axis_mut(Axis(0), q).assign(&mask);
        }

        let padding_mask = Array3::zeros((cfg.n_query, h, w));
        let support_padding_mask = Array4::zeros((cfg.n_way, cfg.n_shot, h, w));

        // Intensity transform hits exactly one branch, geometric transform
        // hits one independently chosen branch.
        let gamma = augment::sample_gamma(rng);
        if rng.gen_bool(0.5) {
            augment::gamma_transform(&mut query_images, gamma);
        } else {
            augment::gamma_transform(&mut support_images, gamma);
        }
        if rng.gen_bool(0.5) {
            augment::geom_transform_query(&mut query_images, &mut query_labels, rng);
        } else {
            augment::geom_transform_support(&mut support_images, &mut support_fg_masks, rng);
        }

        Ok(Episode {
            support_images,
            support_fg_masks,
            query_images,
            query_labels,
            padding_mask,
            support_padding_mask,
            class_id,
            slice_indices: window,
        })
    }
}

/// Partition ascending indices into maximal runs of consecutive integers.
pub fn contiguous_runs(indices: &[usize]) -> Vec<Vec<usize>> {
    let mut runs: Vec<Vec<usize>> = Vec::new();
    for &i in indices {
        match runs.last_mut() {
            Some(run) if *run.last().unwrap() + 1 == i => run.push(i),
            _ => runs.push(vec![i]),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    /// 8-slice 64x64 volume with class 1 occupying a 12x12 square on
    /// slices `lo..=hi`.
    fn square_volume(lo: usize, hi: usize) -> LabeledVolume {
        let mut image = Array3::zeros((8, 64, 64));
        let mut label = Array3::<i64>::zeros((8, 64, 64));
        for s in lo..=hi {
            for y in 20..32 {
                for x in 20..32 {
                    label[[s, y, x]] = 1;
                    image[[s, y, x]] = 1.0;
                }
            }
        }
        LabeledVolume::from_raw(image, label).unwrap()
    }

    fn test_config() -> SamplerConfig {
        SamplerConfig {
            min_size: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_contiguous_runs() {
        let runs = contiguous_runs(&[1, 2, 3, 7, 8, 12]);
        assert_eq!(runs, vec![vec![1, 2, 3], vec![7, 8], vec![12]]);
        assert!(contiguous_runs(&[]).is_empty());
    }

    #[test]
    fn test_sampling_succeeds_with_contiguous_window() {
        let sampler = EpisodeSampler::new(vec![square_volume(2, 6)], test_config()).unwrap();
        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let ep = sampler.sample(&mut rng).unwrap();
            assert_eq!(ep.slice_indices.len(), 2);
            let mut sorted = ep.slice_indices.clone();
            sorted.sort_unstable();
            assert_eq!(sorted[1], sorted[0] + 1, "window must be contiguous");
            for &s in &sorted {
                assert!((2..=6).contains(&s), "slice {s} outside the labeled run");
            }
        }
    }

    #[test]
    fn test_reversal_changes_order_not_set() {
        let sampler = EpisodeSampler::new(vec![square_volume(2, 6)], test_config()).unwrap();
        let mut seen_forward = false;
        let mut seen_reversed = false;
        for seed in 0..64u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let ep = sampler.sample(&mut rng).unwrap();
            let s = &ep.slice_indices;
            if s[1] == s[0] + 1 {
                seen_forward = true;
            } else {
                assert_eq!(s[0], s[1] + 1, "reversal must only flip the order");
                seen_reversed = true;
            }
        }
        assert!(seen_forward && seen_reversed, "both orderings should occur");
    }

    #[test]
    fn test_episode_shapes_and_binary_masks() {
        let sampler = EpisodeSampler::new(vec![square_volume(1, 7)], test_config()).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let ep = sampler.sample(&mut rng).unwrap();
        assert_eq!(ep.support_images.dim(), (1, 1, 3, 64, 64));
        assert_eq!(ep.support_fg_masks.dim(), (1, 1, 64, 64));
        assert_eq!(ep.query_images.dim(), (1, 3, 64, 64));
        assert_eq!(ep.query_labels.dim(), (1, 64, 64));
        assert_eq!(ep.padding_mask.dim(), (1, 64, 64));
        assert!(ep.padding_mask.iter().all(|&v| v == 0.0));
        for &v in ep.support_fg_masks.iter().chain(ep.query_labels.iter()) {
            assert!(v == 0.0 || v == 1.0);
        }
        assert_eq!(ep.class_id, 1);
    }

    #[test]
    fn test_short_run_is_rejected() {
        // Only one labeled slice, but two contiguous are needed.
        let sampler = EpisodeSampler::new(
            vec![square_volume(4, 4)],
            SamplerConfig {
                min_size: 10,
                max_retries: 8,
                ..Default::default()
            },
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let err = sampler.sample(&mut rng).unwrap_err();
        assert!(err.to_string().contains("no eligible episode"));
    }

    #[test]
    fn test_min_size_exhaustion_is_error() {
        let sampler = EpisodeSampler::new(
            vec![square_volume(2, 6)],
            SamplerConfig {
                min_size: 100_000,
                max_retries: 8,
                ..Default::default()
            },
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sampler.sample(&mut rng).is_err());
    }

    #[test]
    fn test_use_gt_false_is_config_error() {
        let cfg = SamplerConfig {
            use_gt: false,
            ..Default::default()
        };
        let err = EpisodeSampler::new(vec![square_volume(2, 6)], cfg).unwrap_err();
        assert!(err.to_string().contains("supervoxel"));
    }

    #[test]
    fn test_excluded_class_never_sampled() {
        let mut volume = square_volume(0, 7);
        // Add class 2 on slices 0..=3.
        for s in 0..4 {
            for y in 40..50 {
                for x in 40..50 {
                    volume.label[[s, y, x]] = 2;
                }
            }
        }
        let cfg = SamplerConfig {
            min_size: 10,
            exclude_labels: vec![2],
            ..Default::default()
        };
        let sampler = EpisodeSampler::new(vec![volume], cfg).unwrap();
        for seed in 0..16u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let ep = sampler.sample(&mut rng).unwrap();
            assert_eq!(ep.class_id, 1);
            // Slices carrying the excluded class are also off limits.
            for &s in &ep.slice_indices {
                assert!(s >= 4, "slice {s} contains excluded class 2");
            }
        }
    }

    #[test]
    fn test_to_tensors_shapes() -> Result<()> {
        let sampler = EpisodeSampler::new(vec![square_volume(2, 6)], test_config()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let ep = sampler.sample(&mut rng).unwrap();
        let t = ep.to_tensors(&Device::Cpu)?;
        assert_eq!(t.support_images.len(), 1);
        assert_eq!(t.support_images[0].len(), 1);
        assert_eq!(t.support_images[0][0].dims4()?, (1, 3, 64, 64));
        assert_eq!(t.support_fg_masks[0][0].dims3()?, (1, 64, 64));
        assert_eq!(t.query_images[0].dims4()?, (1, 3, 64, 64));
        assert_eq!(t.query_labels.dims3()?, (1, 64, 64));
        Ok(())
    }
}
