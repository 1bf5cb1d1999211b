pub mod attention;
pub mod augment;
pub mod dynamics;
pub mod encoders;
pub mod idm;
pub mod world_model;

pub use augment::{AugmentParams, ColorJitter, CropBox, PairedAugment};
pub use dynamics::{create_dynamics_models, DynamicsModels, EMA_FILE, MODEL_FILE};
pub use encoders::{
    copy_matching_vars, ema_update_matching_vars, EmaEncoder, OnlineEncoder, PatchEncoder,
    ENCODER_PREFIX,
};
pub use idm::{Idm, KeepMask, LatentActions, Mode};
pub use world_model::{CrossDecoderLayer, WorldModel};
