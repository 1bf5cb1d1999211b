use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;

use super::shared::PatchEncoder;
use crate::config::ModelConfig;
use crate::error::{DynamicsError, DynamicsResult};

/// Variable prefix the online and EMA encoders share so their parameters match by name.
pub const ENCODER_PREFIX: &str = "encoder";

/// EMA encoder: updated by momentum interpolation from the online encoder (no optimizer updates).
///
/// Owns its own `VarMap`, which is never handed to an optimizer. The forward pass
/// reads detached views of those variables, so it records no autograd graph; the
/// views share storage with the variables and see every in-place update.
pub struct EmaEncoder {
    inner: PatchEncoder,
    varmap: VarMap,
}

impl EmaEncoder {
    pub fn new(config: &ModelConfig, device: &Device) -> DynamicsResult<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        // Allocates the shadow variables.
        PatchEncoder::new(vb.pp(ENCODER_PREFIX), config, device)?;
        let inner = shadow_encoder(&varmap, config, device)?;
        Ok(Self { inner, varmap })
    }

    /// Build a shadow that starts as an exact copy of the online parameters.
    pub fn from_online(
        online: &VarMap,
        config: &ModelConfig,
        device: &Device,
    ) -> DynamicsResult<Self> {
        let mut ema = Self::new(config, device)?;
        copy_matching_vars(online, &mut ema.varmap)?;
        Ok(ema)
    }

    /// shadow := momentum * shadow + (1 - momentum) * online, per parameter.
    pub fn update(&mut self, online: &VarMap, momentum: f64) -> DynamicsResult<()> {
        ema_update_matching_vars(online, &mut self.varmap, momentum)
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }

    /// [B, C, H, W] -> [B, depth, P, E], detached.
    pub fn forward(&self, images: &Tensor) -> DynamicsResult<Tensor> {
        Ok(self.inner.forward(images)?.detach())
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

/// Encoder over detached views of every variable in `varmap`.
fn shadow_encoder(varmap: &VarMap, config: &ModelConfig, device: &Device) -> DynamicsResult<PatchEncoder> {
    let tensors: HashMap<String, Tensor> = {
        let data = varmap.data().lock().map_err(|_| poisoned())?;
        data.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
            .collect()
    };
    let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
    PatchEncoder::new(vb.pp(ENCODER_PREFIX), config, device)
}

fn poisoned() -> DynamicsError {
    DynamicsError::invalid_config("variable map lock poisoned")
}

/// Copy variables that exist in both varmaps from src to dst.
pub fn copy_matching_vars(src: &VarMap, dst: &mut VarMap) -> DynamicsResult<()> {
    let src_data = src.data().lock().map_err(|_| poisoned())?;
    let dst_data = dst.data().lock().map_err(|_| poisoned())?;
    for (name, dst_var) in dst_data.iter() {
        if let Some(src_var) = src_data.get(name) {
            dst_var.set(&src_var.as_tensor().detach())?;
        }
    }
    Ok(())
}

/// EMA update for variables that exist in both varmaps: dst = decay * dst + (1 - decay) * src.
pub fn ema_update_matching_vars(src: &VarMap, dst: &mut VarMap, decay: f64) -> DynamicsResult<()> {
    let one_minus = 1.0 - decay;
    let src_data = src.data().lock().map_err(|_| poisoned())?;
    let dst_data = dst.data().lock().map_err(|_| poisoned())?;
    for (name, dst_var) in dst_data.iter() {
        if let Some(src_var) = src_data.get(name) {
            let dst_scaled = dst_var.as_tensor().detach().affine(decay, 0.0)?;
            let src_scaled = src_var.as_tensor().detach().affine(one_minus, 0.0)?;
            dst_var.set(&(dst_scaled + src_scaled)?)?;
        }
    }
    Ok(())
}
