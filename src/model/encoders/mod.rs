pub mod ema_encoder;
pub mod online_encoder;
mod shared;

pub use ema_encoder::{copy_matching_vars, ema_update_matching_vars, EmaEncoder, ENCODER_PREFIX};
pub use online_encoder::OnlineEncoder;
pub use shared::PatchEncoder;
