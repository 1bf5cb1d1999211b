use candle_core::{Device, Module, Tensor};
use candle_nn::{self as nn, VarBuilder, VarMap};

use super::attention::{key_padding_mask, layer_norm, LayerNorm, MultiHeadAttention};
use super::encoders::EmaEncoder;
use crate::config::ModelConfig;
use crate::data::TransitionBatch;
use crate::error::{DynamicsError, DynamicsResult};

/// State queries attend to the action memory, then a ReLU feed-forward.
/// Both sublayers are residual + layer norm.
pub struct CrossDecoderLayer {
    cross_attn: MultiHeadAttention,
    norm1: LayerNorm,
    norm2: LayerNorm,
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl CrossDecoderLayer {
    pub fn new(vb: VarBuilder<'_>, dim: usize, num_heads: usize) -> DynamicsResult<Self> {
        Ok(Self {
            cross_attn: MultiHeadAttention::new(vb.pp("cross_attn"), dim, num_heads)?,
            norm1: layer_norm(dim, 1e-5, vb.pp("norm1"))?,
            norm2: layer_norm(dim, 1e-5, vb.pp("norm2"))?,
            fc1: nn::linear(dim, dim, vb.pp("fc1"))?,
            fc2: nn::linear(dim, dim, vb.pp("fc2"))?,
        })
    }

    /// state: [B, P, D], actions: [B, T, D], mask: additive, broadcastable to [B, H, P, T].
    pub fn forward(
        &self,
        state: &Tensor,
        actions: &Tensor,
        mask: Option<&Tensor>,
    ) -> DynamicsResult<Tensor> {
        let x = self.cross_attn.forward_cross(state, actions, mask)?;
        let state = self.norm1.forward(&(state + x)?)?;

        let h = self.fc1.forward(&state)?.relu()?;
        let h = self.fc2.forward(&h)?;
        Ok(self.norm2.forward(&(state + h)?)?)
    }
}

/// Forward dynamics: predicts the layerwise latent state of the "after" frame from the
/// EMA latent of the "before" frame and a sequence of action tokens.
///
/// Only EMA features enter this model, so its loss trains the action projection and
/// decoder directly and reaches the online encoder only through the IDM's actions.
pub struct WorldModel {
    ema: EmaEncoder,
    action_encoder: nn::Linear,
    layers: Vec<CrossDecoderLayer>,
    action_dim: usize,
}

impl WorldModel {
    /// `online` must already hold the online encoder's variables; the EMA encoder
    /// starts as an exact copy of them.
    pub fn new(
        vb: VarBuilder<'_>,
        config: &ModelConfig,
        online: &VarMap,
        device: &Device,
    ) -> DynamicsResult<Self> {
        config.validate()?;
        let ema = EmaEncoder::from_online(online, config, device)?;
        let d_model = config.wm_model_dim();
        let action_encoder = nn::linear(config.action_dim, d_model, vb.pp("action_encoder"))?;
        let mut layers = Vec::with_capacity(config.wm_depth);
        for i in 0..config.wm_depth {
            layers.push(CrossDecoderLayer::new(
                vb.pp(format!("layer_{i}")),
                d_model,
                config.encoder_depth,
            )?);
        }
        Ok(Self {
            ema,
            action_encoder,
            layers,
            action_dim: config.action_dim,
        })
    }

    pub fn ema(&self) -> &EmaEncoder {
        &self.ema
    }

    pub fn ema_mut(&mut self) -> &mut EmaEncoder {
        &mut self.ema
    }

    /// Blend the online encoder into the EMA copy. Call once, after each optimizer step.
    pub fn update_ema(&mut self, online: &VarMap, momentum: f64) -> DynamicsResult<()> {
        self.ema.update(online, momentum)
    }

    fn check_actions(
        &self,
        batch: usize,
        actions: &Tensor,
        padding_mask: Option<&Tensor>,
    ) -> DynamicsResult<()> {
        let (b, t, a) = actions.dims3()?;
        if b != batch || a != self.action_dim {
            return Err(DynamicsError::shape_mismatch(
                format!("[{batch}, T, {}]", self.action_dim),
                format!("{:?}", actions.dims()),
            ));
        }
        if let Some(mask) = padding_mask {
            if mask.dims() != [b, t] {
                return Err(DynamicsError::shape_mismatch(
                    format!("[{b}, {t}] padding mask"),
                    format!("{:?}", mask.dims()),
                ));
            }
        }
        Ok(())
    }

    /// before: [B, C, H, W], actions: [B, T, action_dim], padding_mask: [B, T] with
    /// nonzero for padded slots. Returns [B, depth, P, E].
    pub fn predict(
        &self,
        before: &Tensor,
        actions: &Tensor,
        padding_mask: Option<&Tensor>,
    ) -> DynamicsResult<Tensor> {
        self.ema.check_images(before)?;
        let (b, _, _, _) = before.dims4()?;
        self.check_actions(b, actions, padding_mask)?;

        let state = self.ema.forward(before)?;
        let (_, d, p, e) = state.dims4()?;
        let mut state = state.permute((0, 2, 1, 3))?.contiguous()?.reshape((b, p, d * e))?;

        let memory = self.action_encoder.forward(actions)?;
        let mask = padding_mask.map(key_padding_mask).transpose()?;
        for layer in &self.layers {
            state = layer.forward(&state, &memory, mask.as_ref())?;
        }

        Ok(state.reshape((b, p, d, e))?.permute((0, 2, 1, 3))?.contiguous()?)
    }

    /// Per-layer squared error against the EMA latent of the "after" frame,
    /// averaged over batch, patches and channels. Returns [depth].
    pub fn label(&self, batch: &TransitionBatch) -> DynamicsResult<Tensor> {
        let la = batch.la.as_ref().ok_or(DynamicsError::MissingField("la"))?;
        let before = batch.before()?;
        let after = batch.after()?;

        let pred = self.predict(&before, la, batch.la_mask.as_ref())?;
        let target = self.ema.forward(&after)?;

        let diff = (pred - target)?.sqr()?;
        Ok(diff.mean(3)?.mean(2)?.mean(0)?)
    }
}
