use candle_core::{DType, Device, Tensor};
use rand::Rng;
use std::path::Path;

use crate::config::{DataConfig, DataSource, ModelConfig};
use crate::error::{DynamicsError, DynamicsResult};

/// Float images in [0, 1]; u8 observations are rescaled by 1/255.
pub fn normalize_obs(obs: &Tensor) -> DynamicsResult<Tensor> {
    match obs.dtype() {
        DType::U8 => Ok(obs.to_dtype(DType::F32)?.affine(1.0 / 255.0, 0.0)?),
        DType::F32 => Ok(obs.clone()),
        _ => Ok(obs.to_dtype(DType::F32)?),
    }
}

fn check_obs(obs: &Tensor) -> DynamicsResult<()> {
    match obs.dims() {
        [_, t, _, _, _] if *t >= 2 => Ok(()),
        dims => Err(DynamicsError::shape_mismatch(
            "[B, T >= 2, C, H, W]",
            format!("{dims:?}"),
        )),
    }
}

/// One training batch of observation sequences plus the labels filled in by the IDM.
#[derive(Debug, Clone)]
pub struct TransitionBatch {
    /// [B, T, C, H, W]
    pub obs: Tensor,
    /// [B, N, action_dim]
    pub la: Option<Tensor>,
    /// [B, N * action_dim], eval labeling only
    pub la_flat: Option<Tensor>,
    /// [B, N], nonzero marks a padded action slot
    pub la_mask: Option<Tensor>,
}

impl TransitionBatch {
    pub fn new(obs: Tensor) -> DynamicsResult<Self> {
        check_obs(&obs)?;
        Ok(Self {
            obs,
            la: None,
            la_flat: None,
            la_mask: None,
        })
    }

    /// Two-frame batch from a [B, C, H, W] before/after pair.
    pub fn from_pair(before: &Tensor, after: &Tensor) -> DynamicsResult<Self> {
        if before.dims() != after.dims() {
            return Err(DynamicsError::shape_mismatch(
                format!("{:?}", before.dims()),
                format!("{:?}", after.dims()),
            ));
        }
        Self::new(Tensor::stack(&[before, after], 1)?)
    }

    pub fn batch_size(&self) -> usize {
        self.obs.dims()[0]
    }

    pub fn num_frames(&self) -> usize {
        self.obs.dims()[1]
    }

    fn frame(&self, offset_from_end: usize) -> DynamicsResult<Tensor> {
        let t = self.num_frames();
        Ok(self
            .obs
            .narrow(1, t - offset_from_end, 1)?
            .squeeze(1)?
            .contiguous()?)
    }

    /// Frame at time offset -2.
    pub fn before(&self) -> DynamicsResult<Tensor> {
        self.frame(2)
    }

    /// Frame at time offset -1.
    pub fn after(&self) -> DynamicsResult<Tensor> {
        self.frame(1)
    }

    pub fn clear_labels(&mut self) {
        self.la = None;
        self.la_flat = None;
        self.la_mask = None;
    }
}

/// Anything that can hand the trainer a fresh batch of transitions.
pub trait TransitionSource {
    fn next_batch(
        &mut self,
        batch_size: usize,
        rng: &mut dyn rand::RngCore,
    ) -> DynamicsResult<TransitionBatch>;
}

/// Coloured squares bouncing around a dark background.
pub struct SyntheticTransitions {
    image_size: usize,
    channels: usize,
    frames: usize,
    device: Device,
}

impl SyntheticTransitions {
    pub fn new(image_size: usize, channels: usize, frames: usize, device: &Device) -> DynamicsResult<Self> {
        if frames < 2 || image_size < 4 || channels == 0 {
            return Err(DynamicsError::data(format!(
                "synthetic source needs frames >= 2, image_size >= 4 and channels >= 1 (got {frames}, {image_size}, {channels})"
            )));
        }
        Ok(Self {
            image_size,
            channels,
            frames,
            device: device.clone(),
        })
    }

    fn render_sample<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut Vec<f32>) {
        let size = self.image_size;
        let side = rng.gen_range(size / 8 + 1..=size / 4 + 1);
        let max_pos = (size - side) as f32;
        let mut x = rng.gen_range(0.0..=max_pos);
        let mut y = rng.gen_range(0.0..=max_pos);
        let speed = (size as f32 / 16.0).max(1.0);
        let mut vx = rng.gen_range(-speed..=speed);
        let mut vy = rng.gen_range(-speed..=speed);
        let background: f32 = rng.gen_range(0.0..0.2);
        let colour: Vec<f32> = (0..self.channels).map(|_| rng.gen_range(0.5..=1.0)).collect();

        for _ in 0..self.frames {
            let left = x.round() as usize;
            let top = y.round() as usize;
            for value in colour.iter() {
                for row in 0..size {
                    for col in 0..size {
                        let inside = (top..top + side).contains(&row) && (left..left + side).contains(&col);
                        out.push(if inside { *value } else { background });
                    }
                }
            }
            // Bounce off the borders.
            x += vx;
            y += vy;
            if x < 0.0 || x > max_pos {
                x = x.clamp(0.0, max_pos);
                vx = -vx;
            }
            if y < 0.0 || y > max_pos {
                y = y.clamp(0.0, max_pos);
                vy = -vy;
            }
        }
    }
}

impl TransitionSource for SyntheticTransitions {
    fn next_batch(
        &mut self,
        batch_size: usize,
        rng: &mut dyn rand::RngCore,
    ) -> DynamicsResult<TransitionBatch> {
        let per_sample = self.frames * self.channels * self.image_size * self.image_size;
        let mut buf = Vec::with_capacity(batch_size * per_sample);
        for _ in 0..batch_size {
            self.render_sample(rng, &mut buf);
        }
        let obs = Tensor::from_vec(
            buf,
            (
                batch_size,
                self.frames,
                self.channels,
                self.image_size,
                self.image_size,
            ),
            &self.device,
        )?;
        TransitionBatch::new(obs)
    }
}

/// Transitions drawn uniformly at random from an in-memory [N, T, C, H, W] tensor.
pub struct TensorTransitions {
    obs: Tensor,
    device: Device,
}

impl TensorTransitions {
    pub fn new(obs: Tensor, device: &Device) -> DynamicsResult<Self> {
        check_obs(&obs)?;
        if obs.dims()[0] == 0 {
            return Err(DynamicsError::data("observation tensor holds no samples"));
        }
        Ok(Self {
            obs: normalize_obs(&obs)?,
            device: device.clone(),
        })
    }

    /// Load the `obs` entry of a safetensors file.
    pub fn from_file(path: &Path, device: &Device) -> DynamicsResult<Self> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let obs = tensors
            .remove("obs")
            .ok_or_else(|| DynamicsError::data(format!("{} has no `obs` tensor", path.display())))?;
        Self::new(obs, device)
    }

    pub fn len(&self) -> usize {
        self.obs.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn obs(&self) -> &Tensor {
        &self.obs
    }
}

impl TransitionSource for TensorTransitions {
    fn next_batch(
        &mut self,
        batch_size: usize,
        rng: &mut dyn rand::RngCore,
    ) -> DynamicsResult<TransitionBatch> {
        let n = self.len();
        let picks: Vec<u32> = (0..batch_size).map(|_| rng.gen_range(0..n) as u32).collect();
        let index = Tensor::from_vec(picks, batch_size, self.obs.device())?;
        let obs = self.obs.index_select(&index, 0)?.to_device(&self.device)?;
        TransitionBatch::new(obs)
    }
}

/// Build the configured data source and check it matches the model geometry.
pub fn open_source(
    data: &DataConfig,
    model: &ModelConfig,
    device: &Device,
) -> DynamicsResult<Box<dyn TransitionSource>> {
    match &data.source {
        DataSource::Synthetic => Ok(Box::new(SyntheticTransitions::new(
            model.image_size,
            model.in_channels,
            data.frames_per_sample,
            device,
        )?)),
        DataSource::Safetensors { path } => {
            let source = TensorTransitions::from_file(path, device)?;
            let dims = source.obs().dims();
            let expected = [model.in_channels, model.image_size, model.image_size];
            if dims[2..] != expected {
                return Err(DynamicsError::shape_mismatch(
                    format!("[N, T, {}, {}, {}]", expected[0], expected[1], expected[2]),
                    format!("{dims:?}"),
                ));
            }
            Ok(Box::new(source))
        }
    }
}
