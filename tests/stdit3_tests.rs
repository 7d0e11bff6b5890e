//! STDiT3 predictor tests on a tiny randomly initialised configuration

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_sora::config::{ConfigError, PredictorConfig, Stdit3Config};
use candle_sora::models::stdit3::Stdit3;
use candle_sora::parallel::{LocalCommunicator, ProcessGroup};
use candle_sora::{ModelKwargs, ParallelContext, Predictor, PredictorRegistry};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn tiny_config() -> Stdit3Config {
    Stdit3Config {
        input_sq_size: 16,
        in_channels: 4,
        patch_size: [1, 2, 2],
        hidden_size: 8,
        depth: 1,
        num_heads: 2,
        mlp_ratio: 2.0,
        pred_sigma: true,
        caption_channels: 6,
        model_max_length: 4,
        qk_norm: true,
        enable_sequence_parallelism: false,
        use_accelerated_attention: false,
    }
}

fn build(varmap: &VarMap) -> Stdit3 {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    Stdit3::new(tiny_config(), vb, &ParallelContext::single()).unwrap()
}

fn captions(batch: usize) -> Tensor {
    Tensor::randn(0f32, 1.0, (batch, 1, 4, 6), &Device::Cpu).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    let diff = (a - b).unwrap().abs().unwrap().flatten_all().unwrap();
    diff.max(0).unwrap().to_scalar::<f32>().unwrap()
}

// =============================================================================
// Shapes
// =============================================================================

#[test]
fn test_output_shape_with_padding_crop() -> Result<()> {
    let varmap = VarMap::new();
    let model = build(&varmap);
    assert_eq!(model.in_channels(), 4);
    assert_eq!(model.out_channels(), 8);
    assert!(!model.shards_sequence());

    // odd height exercises patch padding and the crop back
    let x = Tensor::randn(0f32, 1.0, (2, 4, 3, 5, 6), &Device::Cpu)?;
    let t = Tensor::new(&[10f32, 900.0], &Device::Cpu)?;
    let kwargs = ModelKwargs::default().with_text(captions(2), None);

    let out = model.forward(&x, &t, &kwargs)?;
    assert_eq!(out.dims(), &[2, 8, 3, 5, 6]);
    assert_eq!(out.dtype(), DType::F32);
    assert!(out.flatten_all()?.to_vec1::<f32>()?.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn test_weight_layout() {
    let varmap = VarMap::new();
    let _model = build(&varmap);
    let data = varmap.data().lock().unwrap();
    for name in [
        "x_embedder.proj.weight",
        "t_embedder.mlp.0.weight",
        "fps_embedder.mlp.2.bias",
        "t_block.1.weight",
        "y_embedder.y_proj.fc1.weight",
        "y_embedder.y_embedding",
        "spatial_blocks.0.scale_shift_table",
        "spatial_blocks.0.self_atten.proj_q.weight",
        "spatial_blocks.0.self_atten.q_norm.weight",
        "temporal_blocks.0.cross_atten.proj_out.weight",
        "temporal_blocks.0.ff.net.0.proj.weight",
        "temporal_blocks.0.ff.net.2.bias",
        "final_layer.linear.weight",
        "final_layer.scale_shift_table",
    ] {
        assert!(data.contains_key(name), "missing {name}");
    }
    assert_eq!(data["x_embedder.proj.weight"].dims(), &[8, 4, 1, 2, 2]);
    assert_eq!(data["final_layer.scale_shift_table"].dims(), &[2, 8]);
    assert_eq!(data["spatial_blocks.0.scale_shift_table"].dims(), &[6, 8]);
}

// =============================================================================
// Conditioning
// =============================================================================

#[test]
fn test_encode_text_packs_valid_tokens() -> Result<()> {
    let varmap = VarMap::new();
    let model = build(&varmap);
    let mask = Tensor::new(&[[1u8, 1, 1, 1], [1, 1, 0, 0]], &Device::Cpu)?;

    let (packed, lens) = model.encode_text(&captions(2), Some(&mask))?;
    assert_eq!(lens, vec![4, 2]);
    assert_eq!(packed.dims(), &[1, 6, 8]);

    let (unmasked, lens) = model.encode_text(&captions(2), None)?;
    assert_eq!(lens, vec![4, 4]);
    assert_eq!(unmasked.dims(), &[1, 8, 8]);
    Ok(())
}

#[test]
fn test_masked_caption_tokens_are_ignored() -> Result<()> {
    let varmap = VarMap::new();
    let model = build(&varmap);
    let device = Device::Cpu;
    let x = Tensor::randn(0f32, 1.0, (1, 4, 2, 4, 4), &device)?;
    let t = Tensor::new(&[500f32], &device)?;
    let mask = Tensor::new(&[[1u8, 1, 0, 0]], &device)?;

    let y = captions(1);
    let noise = Tensor::randn(0f32, 1.0, (1, 1, 2, 6), &device)?;
    let y_other = Tensor::cat(&[&y.narrow(2, 0, 2)?, &noise], 2)?;

    let a = model.forward(
        &x,
        &t,
        &ModelKwargs::default().with_text(y, Some(mask.clone())),
    )?;
    let b = model.forward(&x, &t, &ModelKwargs::default().with_text(y_other, Some(mask)))?;
    assert!(max_abs_diff(&a, &b) < 1e-5);
    Ok(())
}

#[test]
fn test_all_valid_frame_mask_matches_no_mask() -> Result<()> {
    let varmap = VarMap::new();
    let model = build(&varmap);
    let device = Device::Cpu;
    let x = Tensor::randn(0f32, 1.0, (2, 4, 3, 4, 4), &device)?;
    let t = Tensor::new(&[250f32, 250.0], &device)?;
    let y = captions(2);

    let plain = model.forward(&x, &t, &ModelKwargs::default().with_text(y.clone(), None))?;

    let mut kwargs = ModelKwargs::default().with_text(y.clone(), None);
    kwargs.attention_mask = Some(Tensor::ones((2, 3), DType::F32, &device)?);
    let all_valid = model.forward(&x, &t, &kwargs)?;
    assert!(max_abs_diff(&plain, &all_valid) < 1e-6);

    // a per-position [B, T, H, W] mask reduces to frames the same way
    kwargs.attention_mask = Some(Tensor::ones((2, 3, 4, 4), DType::F32, &device)?);
    let spatial_mask = model.forward(&x, &t, &kwargs)?;
    assert!(max_abs_diff(&plain, &spatial_mask) < 1e-6);

    // an invalid frame switches that frame to the t = 0 modulation
    kwargs.attention_mask = Some(Tensor::new(&[[1f32, 1.0, 0.0], [1.0, 1.0, 1.0]], &device)?);
    let partial = model.forward(&x, &t, &kwargs)?;
    assert!(max_abs_diff(&plain, &partial) > 1e-6);
    Ok(())
}

#[test]
fn test_frame_mask_shape_mismatch_is_error() -> Result<()> {
    let varmap = VarMap::new();
    let model = build(&varmap);
    let device = Device::Cpu;
    let x = Tensor::randn(0f32, 1.0, (1, 4, 3, 4, 4), &device)?;
    let t = Tensor::new(&[1f32], &device)?;
    let mut kwargs = ModelKwargs::default().with_text(captions(1), None);
    kwargs.attention_mask = Some(Tensor::ones((1, 5), DType::F32, &device)?);
    assert!(model.forward(&x, &t, &kwargs).is_err());
    Ok(())
}

#[test]
fn test_requires_captions() -> Result<()> {
    let varmap = VarMap::new();
    let model = build(&varmap);
    let x = Tensor::zeros((1, 4, 1, 4, 4), DType::F32, &Device::Cpu)?;
    let t = Tensor::new(&[1f32], &Device::Cpu)?;
    assert!(model.forward(&x, &t, &ModelKwargs::default()).is_err());
    Ok(())
}

#[test]
fn test_fps_and_resolution_change_output() -> Result<()> {
    let varmap = VarMap::new();
    let model = build(&varmap);
    let device = Device::Cpu;
    let x = Tensor::randn(0f32, 1.0, (1, 4, 2, 4, 4), &device)?;
    let t = Tensor::new(&[100f32], &device)?;
    let y = captions(1);

    let default = model.forward(&x, &t, &ModelKwargs::default().with_text(y.clone(), None))?;
    let explicit = model.forward(
        &x,
        &t,
        &ModelKwargs::default().with_text(y.clone(), None).with_resolution(
            Tensor::new(&[24f32], &device)?,
            Tensor::new(&[16f32], &device)?,
            Tensor::new(&[16f32], &device)?,
        ),
    )?;
    // fps 24 and a resolution equal to input_sq_size are the defaults
    assert!(max_abs_diff(&default, &explicit) < 1e-5);

    let faster = model.forward(
        &x,
        &t,
        &ModelKwargs::default().with_text(y, None).with_resolution(
            Tensor::new(&[8f32], &device)?,
            Tensor::new(&[16f32], &device)?,
            Tensor::new(&[16f32], &device)?,
        ),
    )?;
    assert!(max_abs_diff(&default, &faster) > 1e-6);
    Ok(())
}

// =============================================================================
// Sequence parallelism
// =============================================================================

#[test]
fn test_sequence_parallel_matches_single_rank() -> Result<()> {
    let varmap = VarMap::new();
    let model = build(&varmap);
    let weights: HashMap<String, Tensor> = varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();

    let device = Device::Cpu;
    // 2x2 spatial tokens per frame, two per rank
    let x = Tensor::randn(0f32, 1.0, (2, 4, 2, 4, 4), &device)?;
    let t = Tensor::new(&[300f32, 40.0], &device)?;
    let y = captions(2);
    let mut kwargs = ModelKwargs::default().with_text(
        y,
        Some(Tensor::new(&[[1u8, 1, 1, 0], [1, 1, 0, 0]], &device)?),
    );
    kwargs.attention_mask = Some(Tensor::new(&[[1f32, 0.0], [1.0, 1.0]], &device)?);
    let expected = model.forward(&x, &t, &kwargs)?;

    let mut config = tiny_config();
    config.enable_sequence_parallelism = true;
    let outputs = std::thread::scope(|scope| {
        let handles: Vec<_> = LocalCommunicator::group(2)
            .into_iter()
            .map(|comm| {
                let (weights, config) = (weights.clone(), config.clone());
                let (x, t, kwargs) = (&x, &t, &kwargs);
                scope.spawn(move || {
                    let ctx =
                        ParallelContext::single().with_context(ProcessGroup::new(Arc::new(comm)));
                    let vb = VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu);
                    let sharded = Stdit3::new(config, vb, &ctx).unwrap();
                    assert!(sharded.shards_sequence());
                    sharded.forward(x, t, kwargs).unwrap()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    for out in &outputs {
        assert_eq!(out.dims(), expected.dims());
        assert!(max_abs_diff(out, &expected) < 1e-4);
    }
    Ok(())
}

// =============================================================================
// Registry
// =============================================================================

fn predictor_config(params: serde_json::Value) -> PredictorConfig {
    let mut config = PredictorConfig::new("stdit3");
    if let serde_json::Value::Object(map) = params {
        config.params = map;
    }
    config
}

#[test]
fn test_registry_builds_stdit3_from_json() {
    let config = predictor_config(json!({
        "hidden_size": 8,
        "depth": 1,
        "num_heads": 2,
        "caption_channels": 6,
        "model_max_length": 4,
        "pred_sigma": false,
        "use_accelerated_attention": false
    }));
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let predictor = PredictorRegistry::default()
        .build(&config, vb, &ParallelContext::single())
        .unwrap();
    assert_eq!(predictor.in_channels(), 4);
    assert_eq!(predictor.out_channels(), 4);
}

#[test]
fn test_registry_errors() {
    let registry = PredictorRegistry::default();
    assert!(registry.contains("stdit3"));
    let ctx = ParallelContext::single();

    let unknown = PredictorConfig::new("latte");
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    assert!(matches!(
        registry.build(&unknown, vb, &ctx),
        Err(ConfigError::UnknownModelId(id)) if id == "latte"
    ));

    let invalid = predictor_config(json!({ "hidden_size": "wide" }));
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    assert!(matches!(
        registry.build(&invalid, vb, &ctx),
        Err(ConfigError::InvalidParams { .. })
    ));
}
