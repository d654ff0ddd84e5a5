use crate::config::models::SamplingDefaults;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// ---------------------------------------------------------------------------
/// Public API
/// ---------------------------------------------------------------------------

/// Architecture facts derived from a checkpoint directory. Pure filesystem
/// introspection; recomputed whenever a config's checkpoint path changes and
/// cached alongside it, never hand-edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub hidden_size: u64,
    pub intermediate_size: u64,
    pub num_attention_heads: u32,
    pub num_key_value_heads: u32,
    pub num_hidden_layers: u32,
    pub vocab_size: u64,
    pub head_dim: u32,
    pub default_seq_len: u32,
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("checkpoint manifest unreadable: {0}")]
    Unreadable(#[from] std::io::Error),
    #[error("checkpoint manifest unparseable: {0}")]
    Unparseable(#[from] serde_json::Error),
    #[error("checkpoint manifest missing required field: {0}")]
    MissingField(&'static str),
}

/// Sequence length assumed when the manifest does not declare one.
const FALLBACK_SEQ_LEN: u32 = 2048;

/// Read the `config.json` manifest of a checkpoint directory and derive the
/// descriptor. No device interaction; safe to call repeatedly.
pub fn probe(dir: &Path) -> Result<ModelDescriptor, DescriptorError> {
    let raw = fs::read_to_string(dir.join("config.json"))?;
    let manifest: RawManifest = serde_json::from_str(&raw)?;

    let hidden_size = manifest.hidden_size.ok_or(DescriptorError::MissingField("hidden_size"))?;
    let intermediate_size = manifest
        .intermediate_size
        .ok_or(DescriptorError::MissingField("intermediate_size"))?;
    let num_attention_heads = manifest
        .num_attention_heads
        .ok_or(DescriptorError::MissingField("num_attention_heads"))?;
    let num_hidden_layers = manifest
        .num_hidden_layers
        .ok_or(DescriptorError::MissingField("num_hidden_layers"))?;
    let vocab_size = manifest.vocab_size.ok_or(DescriptorError::MissingField("vocab_size"))?;

    if num_attention_heads == 0 {
        return Err(DescriptorError::MissingField("num_attention_heads"));
    }

    // Grouped-query checkpoints declare fewer KV heads; older ones omit the
    // field and use one KV head per attention head.
    let num_key_value_heads = manifest.num_key_value_heads.unwrap_or(num_attention_heads);
    let head_dim = manifest
        .head_dim
        .unwrap_or((hidden_size / num_attention_heads as u64) as u32);
    let default_seq_len = manifest.max_position_embeddings.unwrap_or(FALLBACK_SEQ_LEN);

    Ok(ModelDescriptor {
        hidden_size,
        intermediate_size,
        num_attention_heads,
        num_key_value_heads,
        num_hidden_layers,
        vocab_size,
        head_dim,
        default_seq_len,
    })
}

/// Read sampling defaults from the optional `generation_config.json` side
/// file. Malformed files and wrong-typed fields are logged and skipped; this
/// never fails the probe.
pub fn sampling_sidecar(dir: &Path) -> SamplingDefaults {
    let mut defaults = SamplingDefaults::default();

    let path = dir.join("generation_config.json");
    if !path.exists() {
        return defaults;
    }

    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("could not read generation_config.json: {e}");
            return defaults;
        }
    };
    let parsed: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("could not parse generation_config.json: {e}");
            return defaults;
        }
    };
    if !parsed.is_object() {
        warn!("generation_config.json is not a JSON object, ignoring");
        return defaults;
    }

    info!("found generation_config.json in {}", dir.display());
    defaults.temperature = number_field(&parsed, "temperature").map(|v| v as f32);
    defaults.top_p = number_field(&parsed, "top_p").map(|v| v as f32);
    defaults.repetition_penalty = number_field(&parsed, "repetition_penalty").map(|v| v as f32);
    defaults.top_k = match parsed.get("top_k") {
        Some(Value::Number(n)) if n.as_u64().is_some() => n.as_u64().map(|v| v as u32),
        Some(other) => {
            warn!("invalid type for top_k in generation_config.json: {other}");
            None
        }
        None => None,
    };
    defaults
}

fn number_field(obj: &Value, key: &str) -> Option<f64> {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(other) => {
            warn!("invalid type for {key} in generation_config.json: {other}");
            None
        }
        None => None,
    }
}

/// ---------------------------------------------------------------------------
/// Manifest shape — only the keys we care about
/// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    hidden_size: Option<u64>,
    intermediate_size: Option<u64>,
    num_attention_heads: Option<u32>,
    num_key_value_heads: Option<u32>,
    num_hidden_layers: Option<u32>,
    vocab_size: Option<u64>,
    head_dim: Option<u32>,
    max_position_embeddings: Option<u32>,
}
