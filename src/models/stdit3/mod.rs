//! STDiT3: spatial-temporal diffusion transformer
//!
//! Weight layout (under the predictor's root prefix):
//!
//! ```text
//! x_embedder.proj.{weight,bias}          Conv3d patchifier
//! t_embedder.mlp.{0,2}, fps_embedder.mlp.{0,2}, t_block.1
//! y_embedder.y_proj.{fc1,fc2}, y_embedder.y_embedding
//! {spatial,temporal}_blocks.{i}.scale_shift_table
//! {spatial,temporal}_blocks.{i}.self_atten.{proj_q,proj_k,proj_v,proj_out,q_norm,k_norm}
//! {spatial,temporal}_blocks.{i}.cross_atten.{proj_q,proj_k,proj_v,proj_out}
//! {spatial,temporal}_blocks.{i}.ff.net.{0.proj,2}
//! final_layer.{linear,scale_shift_table}
//! ```

pub mod blocks;
pub mod embeddings;
pub mod model;

pub use blocks::{Stdit3Block, T2IFinalLayer, t2i_modulate, t_mask_select};
pub use model::Stdit3;

use crate::config::{ConfigError, PredictorConfig, Stdit3Config};
use crate::models::Predictor;
use crate::parallel::ParallelContext;
use candle_nn::VarBuilder;

/// [`crate::models::PredictorFactory`] for `"stdit3"`
pub fn build_predictor(
    config: &PredictorConfig,
    vb: VarBuilder,
    ctx: &ParallelContext,
) -> Result<Box<dyn Predictor>, ConfigError> {
    let params: Stdit3Config = config.params()?;
    Ok(Box::new(Stdit3::new(params, vb, ctx)?))
}
