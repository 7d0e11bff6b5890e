//! Checkpoint reconciliation
//!
//! Loads a pretrained checkpoint (`.pt`/`.pth` pickle or `.safetensors`) and
//! reconciles it with a live model:
//!
//! - EMA / `state_dict` / `gen_model` table selection for VAE checkpoints
//! - Masked-patch-embedding synthesis for inpainting checkpoints
//! - Ordered substring renaming of parameter names
//! - Tensor-parallel re-chunking of attention and feed-forward weights
//! - Non-strict transplant into a `VarMap`, reporting missing/unexpected keys

use crate::parallel::ProcessGroup;
use candle_core::pickle::{Object, Stack, TensorInfo};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use std::collections::BTreeMap;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Disables EMA weight selection for VAE checkpoints when set to any value
pub const DISABLE_EMA_ENV: &str = "NOT_USE_EMA_MODEL";

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Could not find checkpoint at {path}")]
    FileNotFound { path: String },

    #[error("Invalid checkpoint path (unsupported format): {path}")]
    UnsupportedFormat { path: String },

    #[error("Cannot shard {name}: dim {dim} of size {len} is not divisible by {world_size}")]
    Indivisible {
        name: String,
        dim: usize,
        len: usize,
        world_size: usize,
    },

    #[error("Failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid safetensors file: {path}")]
    InvalidSafetensors {
        path: String,
        #[source]
        source: safetensors::SafeTensorError,
    },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

type Result<T> = std::result::Result<T, LoaderError>;

// =============================================================================
// Checkpoint
// =============================================================================

/// Ordered name -> tensor mapping
///
/// Nested tables of a pickled checkpoint (`ema_state_dict`, `state_dict`,
/// `state_dict.gen_model`) are kept as dotted name prefixes.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    tensors: BTreeMap<String, Tensor>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }

    /// Entries under `prefix.`, with the prefix stripped; `None` if there are none
    pub fn sub_table(&self, prefix: &str) -> Option<Checkpoint> {
        let dotted = format!("{prefix}.");
        let tensors: BTreeMap<_, _> = self
            .tensors
            .iter()
            .filter_map(|(name, t)| {
                name.strip_prefix(&dotted)
                    .map(|rest| (rest.to_string(), t.clone()))
            })
            .collect();
        if tensors.is_empty() {
            None
        } else {
            Some(Checkpoint { tensors })
        }
    }

    /// Rebuild the mapping with every name passed through `f`
    pub fn map_names(self, mut f: impl FnMut(&str) -> String) -> Checkpoint {
        let tensors = self
            .tensors
            .into_iter()
            .map(|(name, t)| (f(&name), t))
            .collect();
        Checkpoint { tensors }
    }
}

impl FromIterator<(String, Tensor)> for Checkpoint {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Checkpoint {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Checkpoint {
    type Item = (String, Tensor);
    type IntoIter = std::collections::btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

// =============================================================================
// Name Mapping
// =============================================================================

/// One name transformation; rules run in order, each seeing the previous output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingRule {
    /// Replace every occurrence of `pattern`
    Substring { pattern: String, replacement: String },
    /// Replace a leading `from_prefix`
    Prefix {
        from_prefix: String,
        to_prefix: String,
    },
    /// Whole-name replacement
    Exact { from: String, to: String },
}

impl MappingRule {
    pub fn substring(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        MappingRule::Substring {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }

    fn apply(&self, name: &str) -> Option<String> {
        match self {
            MappingRule::Substring {
                pattern,
                replacement,
            } => {
                if !pattern.is_empty() && name.contains(pattern.as_str()) {
                    Some(name.replace(pattern.as_str(), replacement))
                } else {
                    None
                }
            }
            MappingRule::Prefix {
                from_prefix,
                to_prefix,
            } => name
                .strip_prefix(from_prefix.as_str())
                .map(|rest| format!("{to_prefix}{rest}")),
            MappingRule::Exact { from, to } => (name == from).then(|| to.clone()),
        }
    }
}

/// Renames from the diffusers / DDP checkpoint lineage to this crate's layout
pub const DEFAULT_RENAMES: &[(&str, &str)] = &[
    ("module.", ""),
    ("transformer_blocks", "videodit_blocks"),
    ("attn1", "self_atten"),
    ("attn2", "cross_atten"),
    ("to_q", "proj_q"),
    ("to_k", "proj_k"),
    ("to_v", "proj_v"),
    ("to_out.0", "proj_out"),
    ("to_out.1", "dropout"),
];

pub fn default_rules() -> Vec<MappingRule> {
    DEFAULT_RENAMES
        .iter()
        .map(|(pattern, replacement)| MappingRule::substring(*pattern, *replacement))
        .collect()
}

/// Apply `rules` to `key` in order
pub fn rewrite_key(key: &str, rules: &[MappingRule]) -> String {
    let mut current = key.to_string();
    for rule in rules {
        if let Some(mapped) = rule.apply(&current) {
            current = mapped;
        }
    }
    current
}

// =============================================================================
// Tensor-parallel re-chunking
// =============================================================================

/// Parameters split along dim 0 (column-parallel outputs)
pub const TP_DIM0_SUFFIXES: &[&str] = &[
    "atten.proj_q.weight",
    "atten.proj_q.bias",
    "atten.proj_k.weight",
    "atten.proj_k.bias",
    "atten.proj_v.weight",
    "atten.proj_v.bias",
    "ff.net.0.proj.weight",
    "ff.net.0.proj.bias",
];

/// Parameters split along dim 1 (row-parallel inputs)
pub const TP_DIM1_SUFFIXES: &[&str] = &["atten.proj_out.weight", "ff.net.2.weight"];

/// How a parameter is distributed over the tensor-parallel group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStrategy {
    Replicate,
    Split { dim: usize },
}

pub fn shard_strategy_for(name: &str) -> ShardStrategy {
    if TP_DIM0_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        ShardStrategy::Split { dim: 0 }
    } else if TP_DIM1_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        ShardStrategy::Split { dim: 1 }
    } else {
        ShardStrategy::Replicate
    }
}

/// Keep `rank`'s contiguous chunk of `tensor` according to its name
pub fn shard_tensor(name: &str, tensor: &Tensor, rank: usize, world_size: usize) -> Result<Tensor> {
    let dim = match shard_strategy_for(name) {
        ShardStrategy::Split { dim } if world_size > 1 => dim,
        _ => return Ok(tensor.clone()),
    };
    let len = tensor.dim(dim)?;
    if !len.is_multiple_of(world_size) {
        return Err(LoaderError::Indivisible {
            name: name.to_string(),
            dim,
            len,
            world_size,
        });
    }
    let chunk = len / world_size;
    Ok(tensor.narrow(dim, rank * chunk, chunk)?.contiguous()?)
}

// =============================================================================
// Loader
// =============================================================================

/// Which checkpoint-layout quirks apply to the target model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelFamily {
    #[default]
    Generic,
    /// Video autoencoders: EMA / `state_dict` / `gen_model` table selection
    Vae,
    /// Inpainting predictors: masked patch embedding seeded from `pos_embed`
    Inpaint,
}

/// Outcome of a non-strict load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Model parameters left at their initial values
    pub missing: Vec<String>,
    /// Checkpoint entries with no counterpart in the model
    pub unexpected: Vec<String>,
    /// Subset of `missing` present in the checkpoint with a different element count
    pub mismatched: Vec<String>,
    pub loaded: usize,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Checkpoint reconciliation pipeline
#[derive(Debug, Clone)]
pub struct CheckpointLoader {
    family: ModelFamily,
    rules: Vec<MappingRule>,
    ignore_prefixes: Vec<String>,
    tp_rank: usize,
    tp_size: usize,
    use_ema: bool,
}

impl Default for CheckpointLoader {
    fn default() -> Self {
        Self::new(ModelFamily::Generic)
    }
}

impl CheckpointLoader {
    /// Loader with the default rename rules and no tensor parallelism
    ///
    /// EMA selection honours [`DISABLE_EMA_ENV`] as read at construction.
    pub fn new(family: ModelFamily) -> Self {
        Self {
            family,
            rules: default_rules(),
            ignore_prefixes: Vec::new(),
            tp_rank: 0,
            tp_size: 1,
            use_ema: std::env::var_os(DISABLE_EMA_ENV).is_none(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<MappingRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn add_rule(mut self, rule: MappingRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Drop checkpoint entries whose (selected-table) name starts with `prefix`
    pub fn with_ignore_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.ignore_prefixes.push(prefix.into());
        self
    }

    pub fn with_tensor_parallel(mut self, group: &ProcessGroup) -> Self {
        self.tp_rank = group.rank();
        self.tp_size = group.size();
        self
    }

    pub fn with_tensor_parallel_rank(mut self, rank: usize, size: usize) -> Self {
        self.tp_rank = rank;
        self.tp_size = size;
        self
    }

    pub fn with_ema(mut self, use_ema: bool) -> Self {
        self.use_ema = use_ema;
        self
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    /// Reconcile the checkpoint at `path` and transplant it into `varmap`
    pub fn load(&self, path: impl AsRef<Path>, varmap: &VarMap) -> Result<LoadReport> {
        let checkpoint = self.reconcile(path)?;
        let report = transplant(&checkpoint, varmap)?;
        info!(
            loaded = report.loaded,
            missing = report.missing.len(),
            unexpected = report.unexpected.len(),
            "checkpoint loaded"
        );
        info!("Missing keys: {:?}", report.missing);
        info!("Unexpected keys: {:?}", report.unexpected);
        Ok(report)
    }

    /// Read `path` and run every transformation, without touching a model
    pub fn reconcile(&self, path: impl AsRef<Path>) -> Result<Checkpoint> {
        let raw = read_checkpoint(path)?;
        self.transform(raw)
    }

    /// Selection, synthesis, renaming and re-chunking on an in-memory checkpoint
    pub fn transform(&self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        let mut checkpoint = match self.family {
            ModelFamily::Vae => self.select_vae_table(checkpoint),
            _ => checkpoint,
        };

        if self.family == ModelFamily::Inpaint {
            seed_masked_patch_embedding(&mut checkpoint);
        }

        let checkpoint = checkpoint.map_names(|name| rewrite_key(name, &self.rules));

        if self.tp_size == 1 {
            return Ok(checkpoint);
        }
        checkpoint
            .into_iter()
            .map(|(name, t)| {
                let sharded = shard_tensor(&name, &t, self.tp_rank, self.tp_size)?;
                Ok((name, sharded))
            })
            .collect()
    }

    fn select_vae_table(&self, checkpoint: Checkpoint) -> Checkpoint {
        let selected = match checkpoint.sub_table("ema_state_dict") {
            Some(ema) if self.use_ema => {
                info!("Load from ema model!");
                ema.map_names(|name| name.replace("module.", ""))
            }
            _ => match checkpoint.sub_table("state_dict") {
                Some(state_dict) => {
                    info!("Load from normal model!");
                    state_dict.sub_table("gen_model").unwrap_or(state_dict)
                }
                None => checkpoint,
            },
        };

        if self.ignore_prefixes.is_empty() {
            return selected;
        }
        selected
            .into_iter()
            .filter(|(name, _)| {
                let ignored = self.ignore_prefixes.iter().any(|p| name.starts_with(p));
                if ignored {
                    debug!("Deleting key {name} from state_dict.");
                }
                !ignored
            })
            .collect()
    }
}

fn seed_masked_patch_embedding(checkpoint: &mut Checkpoint) {
    if checkpoint.contains("pos_embed_masked_hidden_states.0.proj.weight") {
        return;
    }
    for suffix in ["weight", "bias"] {
        if let Some(t) = checkpoint.get(&format!("pos_embed.proj.{suffix}")).cloned() {
            checkpoint.insert(format!("pos_embed_masked_hidden_states.0.proj.{suffix}"), t);
        }
    }
}

/// Read a checkpoint file onto the CPU
///
/// Tensors inside nested tables of a pickled checkpoint are named by their
/// dotted path, e.g. `state_dict.gen_model.encoder.weight`.
pub fn read_checkpoint(path: impl AsRef<Path>) -> Result<Checkpoint> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(LoaderError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let name = path.to_string_lossy();
    if name.ends_with("pt") || name.ends_with("pth") {
        read_pickle(path)
    } else if name.ends_with(".safetensors") {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        Ok(tensors.into_iter().collect())
    } else {
        Err(LoaderError::UnsupportedFormat {
            path: path.display().to_string(),
        })
    }
}

fn read_pickle(path: &Path) -> Result<Checkpoint> {
    let file = std::fs::File::open(path).map_err(|e| LoaderError::FileRead {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).map_err(candle_core::Error::from)?;
    let pickles: Vec<String> = archive
        .file_names()
        .filter(|name| name.ends_with("data.pkl"))
        .map(String::from)
        .collect();

    let mut infos = Vec::new();
    for pickle in &pickles {
        let dir = PathBuf::from(pickle.trim_end_matches(".pkl"));
        let entry = archive.by_name(pickle).map_err(candle_core::Error::from)?;
        let mut stack = Stack::empty();
        stack.read_loop(&mut BufReader::new(entry))?;
        collect_tensor_infos(unwrap_module(stack.finalize()?), "", &dir, &mut infos);
    }

    let mut checkpoint = Checkpoint::new();
    for info in infos {
        let tensor = read_storage(&mut archive, &info)?;
        checkpoint.insert(info.name, tensor);
    }
    debug!(path = %path.display(), tensors = checkpoint.len(), "Read pickle checkpoint");
    Ok(checkpoint)
}

/// Scripted modules pickle their state as the args of a `__torch__.Module` build
fn unwrap_module(obj: Object) -> Object {
    match obj {
        Object::Build { callable, args } => match *callable {
            Object::Reduce { callable, .. }
                if matches!(
                    &*callable,
                    Object::Class { module_name, class_name }
                        if module_name == "__torch__" && class_name == "Module"
                ) =>
            {
                *args
            }
            callable => Object::Build {
                callable: Box::new(callable),
                args,
            },
        },
        obj => obj,
    }
}

fn collect_tensor_infos(obj: Object, prefix: &str, dir: &Path, infos: &mut Vec<TensorInfo>) {
    let Object::Dict(entries) = obj else {
        return;
    };
    for (key, value) in entries {
        let Object::Unicode(key) = key else {
            continue;
        };
        let name = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Object::Dict(_) => collect_tensor_infos(value, &name, dir, infos),
            value => match value.into_tensor_info(Object::Unicode(name.clone()), dir) {
                Ok(Some(info)) => infos.push(info),
                Ok(None) => {}
                Err(e) => debug!("Skipping {name}: {e}"),
            },
        }
    }
}

fn read_storage<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    info: &TensorInfo,
) -> Result<Tensor> {
    let mut bytes = Vec::new();
    archive
        .by_name(&info.path)
        .map_err(candle_core::Error::from)?
        .read_to_end(&mut bytes)
        .map_err(candle_core::Error::from)?;

    let layout = &info.layout;
    let start = layout.start_offset();
    let len = layout.shape().elem_count() * info.dtype.size_in_bytes();
    let data = bytes.get(start..start + len).ok_or_else(|| {
        candle_core::Error::Msg(format!("{}: storage holds {} bytes", info.name, bytes.len()))
    })?;

    if layout.is_contiguous() {
        Ok(Tensor::from_raw_buffer(data, info.dtype, layout.dims(), &Device::Cpu)?)
    } else if layout.is_fortran_contiguous() {
        let reversed: Vec<usize> = layout.dims().iter().rev().copied().collect();
        let axes: Vec<usize> = (0..reversed.len()).rev().collect();
        let tensor = Tensor::from_raw_buffer(data, info.dtype, &reversed, &Device::Cpu)?;
        Ok(tensor.permute(axes)?)
    } else {
        let msg = format!("{}: strided storage is not supported", info.name);
        Err(candle_core::Error::Msg(msg).into())
    }
}

/// Non-strict load: copy entries whose name and element count match a model variable
pub fn transplant(checkpoint: &Checkpoint, varmap: &VarMap) -> Result<LoadReport> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("varmap lock poisoned".to_string()))?;

    let mut report = LoadReport::default();
    for (name, var) in data.iter() {
        match checkpoint.get(name) {
            Some(t) if t.elem_count() == var.elem_count() => {
                let value = t
                    .reshape(var.shape().clone())?
                    .to_dtype(var.dtype())?
                    .to_device(var.device())?;
                var.set(&value)?;
                report.loaded += 1;
            }
            Some(t) => {
                debug!(
                    name = name.as_str(),
                    checkpoint = ?t.shape(),
                    model = ?var.shape(),
                    "element count mismatch"
                );
                report.mismatched.push(name.clone());
                report.missing.push(name.clone());
            }
            None => report.missing.push(name.clone()),
        }
    }
    report.unexpected = checkpoint
        .names()
        .filter(|name| !data.contains_key(*name))
        .map(str::to_string)
        .collect();

    report.missing.sort();
    report.mismatched.sort();
    report.unexpected.sort();
    Ok(report)
}

/// Save the variables of `varmap` as safetensors
pub fn save_checkpoint(path: impl AsRef<Path>, varmap: &VarMap) -> Result<()> {
    varmap.save(path)?;
    Ok(())
}

/// Tensor names and shapes from a safetensors header
pub fn list_tensor_info(path: impl AsRef<Path>) -> Result<Vec<(String, Vec<usize>)>> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|e| LoaderError::FileRead {
        path: path.display().to_string(),
        source: e,
    })?;
    let tensors = safetensors::SafeTensors::deserialize(&data).map_err(|e| {
        LoaderError::InvalidSafetensors {
            path: path.display().to_string(),
            source: e,
        }
    })?;
    let mut info: Vec<_> = tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| (name, view.shape().to_vec()))
        .collect();
    info.sort();
    Ok(info)
}

/// Sorted tensor names from a safetensors header
pub fn list_tensor_names(path: impl AsRef<Path>) -> Result<Vec<String>> {
    Ok(list_tensor_info(path)?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn rules(pairs: &[(&str, &str)]) -> Vec<MappingRule> {
        pairs
            .iter()
            .map(|(p, r)| MappingRule::substring(*p, *r))
            .collect()
    }

    #[test]
    fn test_rewrite_key_default_rules() {
        let rules = default_rules();
        assert_eq!(
            rewrite_key("module.transformer_blocks.0.attn1.to_q.weight", &rules),
            "videodit_blocks.0.self_atten.proj_q.weight"
        );
        assert_eq!(
            rewrite_key("transformer_blocks.3.attn2.to_out.0.bias", &rules),
            "videodit_blocks.3.cross_atten.proj_out.bias"
        );
        assert_eq!(
            rewrite_key("transformer_blocks.3.attn2.to_out.1.weight", &rules),
            "videodit_blocks.3.cross_atten.dropout.weight"
        );
    }

    #[test]
    fn test_rewrite_key_is_order_sensitive() {
        assert_eq!(rewrite_key("a", &rules(&[("a", "b"), ("b", "c")])), "c");
        assert_eq!(rewrite_key("a", &rules(&[("b", "c"), ("a", "b")])), "b");
    }

    #[test]
    fn test_rewrite_key_replaces_all_occurrences() {
        assert_eq!(
            rewrite_key("module.a.module.b", &rules(&[("module.", "")])),
            "a.b"
        );
    }

    #[test]
    fn test_prefix_and_exact_rules() {
        let rules = vec![
            MappingRule::Prefix {
                from_prefix: "model.".into(),
                to_prefix: "".into(),
            },
            MappingRule::Exact {
                from: "pos".into(),
                to: "pos_embed".into(),
            },
        ];
        assert_eq!(rewrite_key("model.pos", &rules), "pos_embed");
        assert_eq!(rewrite_key("x.model.pos", &rules), "x.model.pos");
    }

    #[test]
    fn test_shard_strategy() {
        assert_eq!(
            shard_strategy_for("videodit_blocks.0.self_atten.proj_q.weight"),
            ShardStrategy::Split { dim: 0 }
        );
        assert_eq!(
            shard_strategy_for("videodit_blocks.0.ff.net.0.proj.bias"),
            ShardStrategy::Split { dim: 0 }
        );
        assert_eq!(
            shard_strategy_for("videodit_blocks.0.cross_atten.proj_out.weight"),
            ShardStrategy::Split { dim: 1 }
        );
        assert_eq!(
            shard_strategy_for("videodit_blocks.0.cross_atten.proj_out.bias"),
            ShardStrategy::Replicate
        );
        assert_eq!(shard_strategy_for("pos_embed.proj.weight"), ShardStrategy::Replicate);
    }

    #[test]
    fn test_sub_table() -> candle_core::Result<()> {
        let t = Tensor::zeros(2, DType::F32, &Device::Cpu)?;
        let checkpoint: Checkpoint = [
            ("state_dict.gen_model.a".to_string(), t.clone()),
            ("state_dict.b".to_string(), t.clone()),
            ("c".to_string(), t),
        ]
        .into_iter()
        .collect();

        let state_dict = checkpoint.sub_table("state_dict").unwrap();
        assert_eq!(state_dict.names().collect::<Vec<_>>(), vec!["b", "gen_model.a"]);
        let gen_model = state_dict.sub_table("gen_model").unwrap();
        assert_eq!(gen_model.names().collect::<Vec<_>>(), vec!["a"]);
        assert!(checkpoint.sub_table("ema_state_dict").is_none());
        Ok(())
    }

    #[test]
    fn test_vae_selection_prefers_ema() -> candle_core::Result<()> {
        let t = Tensor::zeros(2, DType::F32, &Device::Cpu)?;
        let checkpoint: Checkpoint = [
            ("ema_state_dict.module.encoder.w".to_string(), t.clone()),
            ("state_dict.gen_model.encoder.w".to_string(), t.clone()),
            ("state_dict.gen_model.decoder.w".to_string(), t),
        ]
        .into_iter()
        .collect();

        let ema = CheckpointLoader::new(ModelFamily::Vae)
            .with_ema(true)
            .transform(checkpoint.clone())
            .unwrap();
        assert_eq!(ema.names().collect::<Vec<_>>(), vec!["encoder.w"]);

        let normal = CheckpointLoader::new(ModelFamily::Vae)
            .with_ema(false)
            .transform(checkpoint)
            .unwrap();
        assert_eq!(
            normal.names().collect::<Vec<_>>(),
            vec!["decoder.w", "encoder.w"]
        );
        Ok(())
    }

    #[test]
    fn test_inpaint_seeds_masked_embedding() -> candle_core::Result<()> {
        let w = Tensor::ones((4, 2), DType::F32, &Device::Cpu)?;
        let b = Tensor::zeros(4, DType::F32, &Device::Cpu)?;
        let checkpoint: Checkpoint = [
            ("pos_embed.proj.weight".to_string(), w),
            ("pos_embed.proj.bias".to_string(), b),
        ]
        .into_iter()
        .collect();

        let out = CheckpointLoader::new(ModelFamily::Inpaint)
            .transform(checkpoint)
            .unwrap();
        assert!(out.contains("pos_embed_masked_hidden_states.0.proj.weight"));
        assert!(out.contains("pos_embed_masked_hidden_states.0.proj.bias"));
        assert_eq!(out.len(), 4);
        Ok(())
    }
}
