#[allow(clippy::module_inception)]
pub mod data;

pub use data::{
    normalize_obs, open_source, SyntheticTransitions, TensorTransitions, TransitionBatch,
    TransitionSource,
};
