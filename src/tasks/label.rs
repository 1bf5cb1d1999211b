use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::config::Config;
use crate::error::{DynamicsError, DynamicsResult};
use crate::model::{create_dynamics_models, LatentActions};

/// Label every sequence of a safetensors `obs` tensor with a trained IDM.
///
/// Reads the checkpoint written by training, labels in eval mode `chunk_size`
/// sequences at a time and writes `la` and `la_flat` to `output`.
pub fn run_label(
    config: &Config,
    checkpoint_dir: &Path,
    obs_path: &Path,
    output: &Path,
    chunk_size: usize,
    device: &Device,
) -> DynamicsResult<LatentActions> {
    let mut models = create_dynamics_models(&config.model, device)?;
    models.load(checkpoint_dir)?;

    let mut tensors = candle_core::safetensors::load(obs_path, &Device::Cpu)?;
    let obs = tensors
        .remove("obs")
        .ok_or_else(|| DynamicsError::data(format!("{} has no `obs` tensor", obs_path.display())))?;
    info!(
        "labelling {:?} observations from {} in chunks of {}",
        obs.dims(),
        obs_path.display(),
        chunk_size
    );

    let actions = models.idm.label_chunked(&obs, chunk_size)?;

    let mut out: HashMap<String, Tensor> = HashMap::new();
    out.insert("la".to_string(), actions.la.clone());
    if let Some(flat) = &actions.la_flat {
        out.insert("la_flat".to_string(), flat.clone());
    }
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    candle_core::safetensors::save(&out, output)?;
    info!(
        "wrote {} latent action sequences of {} tokens to {}",
        actions.la.dims()[0],
        actions.num_tokens(),
        output.display()
    );
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    #[test]
    fn test_label_roundtrip_through_checkpoint() {
        let device = Device::Cpu;
        let config = Config {
            model: ModelConfig::test(),
            ..Config::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let ckpt = dir.path().join("ckpt");
        create_dynamics_models(&config.model, &device)
            .unwrap()
            .save(&ckpt)
            .unwrap();

        let data: Vec<u8> = (0..3 * 2 * 3 * 16 * 16).map(|i| (i * 7 % 256) as u8).collect();
        let obs = Tensor::from_vec(data, (3, 2, 3, 16, 16), &device).unwrap();
        let obs_path = dir.path().join("obs.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("obs".to_string(), obs);
        candle_core::safetensors::save(&tensors, &obs_path).unwrap();

        let output = dir.path().join("labels").join("la.safetensors");
        let actions = run_label(&config, &ckpt, &obs_path, &output, 2, &device).unwrap();
        assert_eq!(actions.la.dims(), &[3, 3, 8]);

        let written = candle_core::safetensors::load(&output, &device).unwrap();
        assert_eq!(written["la"].dims(), &[3, 3, 8]);
        assert_eq!(written["la_flat"].dims(), &[3, 24]);
    }
}
