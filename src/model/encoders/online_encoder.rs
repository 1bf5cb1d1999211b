use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;

use super::shared::PatchEncoder;
use crate::config::ModelConfig;
use crate::error::DynamicsResult;

/// Online encoder: updated directly by gradients/optimizer each step.
pub struct OnlineEncoder {
    inner: PatchEncoder,
}

impl OnlineEncoder {
    pub fn new(vb: VarBuilder<'_>, config: &ModelConfig, device: &Device) -> DynamicsResult<Self> {
        Ok(Self {
            inner: PatchEncoder::new(vb, config, device)?,
        })
    }

    pub fn patch_and_embed(&self, images: &Tensor) -> DynamicsResult<Tensor> {
        self.inner.patch_and_embed(images)
    }

    pub fn run_transformer(&self, tokens: &Tensor) -> DynamicsResult<Tensor> {
        self.inner.run_transformer(tokens)
    }

    pub fn forward(&self, images: &Tensor) -> DynamicsResult<Tensor> {
        self.inner.forward(images)
    }

    pub fn check_images(&self, images: &Tensor) -> DynamicsResult<()> {
        self.inner.check_images(images)
    }

    pub fn depth(&self) -> usize {
        self.inner.depth()
    }

    pub fn num_patches(&self) -> usize {
        self.inner.num_patches()
    }

    pub fn embed_dim(&self) -> usize {
        self.inner.embed_dim()
    }
}
