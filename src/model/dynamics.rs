use candle_core::{DType, Device, Var};
use candle_nn::{VarBuilder, VarMap};
use std::fs;
use std::path::Path;

use super::encoders::{OnlineEncoder, ENCODER_PREFIX};
use super::idm::Idm;
use super::world_model::WorldModel;
use crate::config::ModelConfig;
use crate::error::DynamicsResult;

pub const MODEL_FILE: &str = "model.safetensors";
pub const EMA_FILE: &str = "ema.safetensors";

/// The IDM and world model plus the single trainable `VarMap` they share.
///
/// The online encoder lives inside the IDM; its EMA copy lives inside the world
/// model with its own `VarMap`, which never reaches the optimizer.
pub struct DynamicsModels {
    varmap: VarMap,
    pub idm: Idm,
    pub world_model: WorldModel,
    device: Device,
}

/// Build both models on `device`. The configuration is validated before any
/// weight is allocated.
pub fn create_dynamics_models(config: &ModelConfig, device: &Device) -> DynamicsResult<DynamicsModels> {
    config.validate()?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

    let encoder = OnlineEncoder::new(vb.pp(ENCODER_PREFIX), config, device)?;
    let idm = Idm::new(vb.pp("idm"), encoder, config, device)?;
    let world_model = WorldModel::new(vb.pp("world_model"), config, &varmap, device)?;

    Ok(DynamicsModels {
        varmap,
        idm,
        world_model,
        device: device.clone(),
    })
}

impl DynamicsModels {
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Everything the optimizer updates: online encoder, IDM and world model heads.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    pub fn update_ema(&mut self, momentum: f64) -> DynamicsResult<()> {
        self.world_model.update_ema(&self.varmap, momentum)
    }

    /// Write `model.safetensors` and `ema.safetensors` into `dir`.
    pub fn save(&self, dir: &Path) -> DynamicsResult<()> {
        fs::create_dir_all(dir)?;
        self.varmap.save(dir.join(MODEL_FILE))?;
        self.world_model.ema().varmap().save(dir.join(EMA_FILE))?;
        Ok(())
    }

    /// Restore both parameter sets written by [`DynamicsModels::save`].
    pub fn load(&mut self, dir: &Path) -> DynamicsResult<()> {
        self.varmap.load(dir.join(MODEL_FILE))?;
        self.world_model
            .ema_mut()
            .varmap_mut()
            .load(dir.join(EMA_FILE))?;
        Ok(())
    }
}
