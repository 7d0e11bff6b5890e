//! Layers shared by the predictor blocks
//!
//! - **attention**: scaled dot-product attention with per-device dispatch
//! - **norms**: parameter-free LayerNorm and RMSNorm
//! - **rope**: 1D rotary embedding for temporal attention

pub mod attention;
pub mod norms;
pub mod rope;

pub use attention::CrossPlatformAttention;
pub use norms::{LayerNormNoParams, RmsNorm};
pub use rope::RotaryEmbedding;
