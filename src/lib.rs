//! Latent world model and inverse dynamics model learned from unlabeled image transitions.
//!
//! A patch transformer encodes each frame into a layerwise latent state. The inverse
//! dynamics model ([`model::Idm`]) reads a before/after pair and decodes a variable
//! length sequence of latent actions; the world model ([`model::WorldModel`]) predicts
//! the after-state from the EMA latent of the before-frame and those actions. Training
//! ([`tasks::Trainer`]) minimises the per-layer prediction error and keeps the EMA
//! encoder trailing the online one.

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod tasks;

pub use config::{Config, DataConfig, DataSource, ModelConfig, TrainConfig};
pub use error::{DynamicsError, DynamicsResult};
