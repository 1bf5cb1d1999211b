use candle_core::{Device, Module, Tensor};
use candle_nn::{self as nn, VarBuilder};

use super::super::attention::{patch_position_encoding, TransformerBlock};
use crate::config::ModelConfig;
use crate::error::{DynamicsError, DynamicsResult};

/// Patch-based vision transformer shared by the online and EMA encoders.
///
/// Images [B, C, H, W] are cut into a row-major grid of square patches, embedded
/// by a strided convolution, offset by a fixed 2-D sin/cos position encoding and
/// run through `depth` encoder blocks. Every block's output is kept, giving a
/// layerwise latent state [B, depth, P, E].
pub struct PatchEncoder {
    patch_embed: nn::Conv2d,
    pos_embed: Tensor,
    blocks: Vec<TransformerBlock>,
    image_size: usize,
    in_channels: usize,
    num_patches: usize,
    embed_dim: usize,
}

impl PatchEncoder {
    pub fn new(vb: VarBuilder<'_>, config: &ModelConfig, device: &Device) -> DynamicsResult<Self> {
        config.validate()?;
        let conv_cfg = nn::Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let patch_embed = nn::conv2d(
            config.in_channels,
            config.embed_dim,
            config.patch_size,
            conv_cfg,
            vb.pp("patch_embed"),
        )?;

        // Plain tensor, not a Var: never trained and never EMA-blended.
        let pos_embed = patch_position_encoding(config.grid_size(), config.embed_dim, device)?;

        let mut blocks = Vec::with_capacity(config.encoder_depth);
        for i in 0..config.encoder_depth {
            let block = TransformerBlock::new(
                vb.pp(format!("block_{}", i)),
                config.embed_dim,
                config.encoder_heads,
                config.embed_dim * 4,
            )?;
            blocks.push(block);
        }

        Ok(Self {
            patch_embed,
            pos_embed,
            blocks,
            image_size: config.image_size,
            in_channels: config.in_channels,
            num_patches: config.num_patches(),
            embed_dim: config.embed_dim,
        })
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_patches(&self) -> usize {
        self.num_patches
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn pos_embed(&self) -> &Tensor {
        &self.pos_embed
    }

    /// Fail fast on images that do not match the configured geometry.
    pub fn check_images(&self, images: &Tensor) -> DynamicsResult<()> {
        let expected = [self.in_channels, self.image_size, self.image_size];
        match images.dims() {
            [_, c, h, w] if [*c, *h, *w] == expected => Ok(()),
            dims => Err(DynamicsError::shape_mismatch(
                format!(
                    "[B, {}, {}, {}]",
                    self.in_channels, self.image_size, self.image_size
                ),
                format!("{dims:?}"),
            )),
        }
    }

    /// [B, C, H, W] -> [B, P, E] patch embeddings with position encoding added.
    pub fn patch_and_embed(&self, images: &Tensor) -> DynamicsResult<Tensor> {
        self.check_images(images)?;
        let x = self.patch_embed.forward(images)?; // [B, E, grid, grid]
        let x = x.flatten_from(2)?.transpose(1, 2)?.contiguous()?; // [B, P, E]
        Ok(x.broadcast_add(&self.pos_embed)?)
    }

    /// [B, N, E] -> [B, depth, N, E]; N may be any subset of the patch grid.
    pub fn run_transformer(&self, tokens: &Tensor) -> DynamicsResult<Tensor> {
        let mut h = tokens.clone();
        let mut layer_outputs = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            h = block.forward(&h)?;
            layer_outputs.push(h.clone());
        }
        Ok(Tensor::stack(&layer_outputs, 1)?)
    }

    pub fn forward(&self, images: &Tensor) -> DynamicsResult<Tensor> {
        let tokens = self.patch_and_embed(images)?;
        self.run_transformer(&tokens)
    }
}
