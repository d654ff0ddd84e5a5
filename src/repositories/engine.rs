use crate::config::settings::SamplingParams;
use crate::services::descriptor::ModelDescriptor;
use crate::services::placement::PlacementPlan;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// KV cache element precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Fp16,
    Fp8,
    Q4,
    Q6,
    Q8,
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FP16" => Ok(Self::Fp16),
            "FP8" => Ok(Self::Fp8),
            "Q4" => Ok(Self::Q4),
            "Q6" => Ok(Self::Q6),
            "Q8" => Ok(Self::Q8),
            _ => Err(format!("Unknown cache mode: {}", s)),
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = match self {
            CacheMode::Fp16 => "FP16",
            CacheMode::Fp8 => "FP8",
            CacheMode::Q4 => "Q4",
            CacheMode::Q6 => "Q6",
            CacheMode::Q8 => "Q8",
        };
        write!(f, "{}", str)
    }
}

/// How the cache is allocated across devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLayout {
    /// Allocated up front on the devices the model already occupies.
    Direct,
    /// Allocated within the remaining auto-split budgets.
    Lazy,
    /// Per-device shards wrapping the base precision, for tensor-parallel.
    Sharded,
}

/// Everything an engine needs to materialize one model.
#[derive(Debug, Clone)]
pub struct EngineModelSpec {
    pub checkpoint_dir: PathBuf,
    pub descriptor: ModelDescriptor,
    pub seq_len: u32,
    pub chunk_size: u32,
    pub rope_scale: f32,
    pub rope_alpha: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    OutOfMemory,
    Io,
    Runtime,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = match self {
            EngineErrorKind::OutOfMemory => "out of device memory",
            EngineErrorKind::Io => "engine I/O failure",
            EngineErrorKind::Runtime => "engine runtime failure",
        };
        write!(f, "{}", str)
    }
}

/// Engine failure, normalized to a kind plus the backend's own message.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn oom(message: impl Into<String>) -> Self {
        Self { kind: EngineErrorKind::OutOfMemory, message: message.into() }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self { kind: EngineErrorKind::Io, message: message.into() }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self { kind: EngineErrorKind::Runtime, message: message.into() }
    }
}

/// Vocabulary handle, usable without any loaded weights.
pub trait TokenizerHandle: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

impl fmt::Debug for dyn TokenizerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn TokenizerHandle")
    }
}

/// One model's device-side lifecycle. Handles start unloaded; the cache
/// allocated by `allocate_cache` stays owned by the handle, and `release`
/// frees weights and cache together.
#[async_trait]
pub trait EngineModel: Send {
    /// Number of loadable modules, known before loading.
    fn module_count(&self) -> usize;

    /// Place weights per the plan and load them, reporting the running
    /// module count through `progress` as each module lands.
    async fn place_and_load(
        &mut self,
        plan: &PlacementPlan,
        progress: &mut (dyn FnMut(usize) + Send),
    ) -> Result<(), EngineError>;

    async fn allocate_cache(&mut self, mode: CacheMode, layout: CacheLayout)
    -> Result<(), EngineError>;

    /// Run one forward pass over `len` placeholder positions to size the
    /// scratch buffers, without sampling.
    async fn dry_run_forward(&mut self, len: u32) -> Result<(), EngineError>;

    /// Free all device memory held by this handle. Idempotent.
    async fn release(&mut self);
}

/// Loaded parts handed over to generator assembly. The generator takes
/// ownership; releasing it releases every part.
pub struct GeneratorParts {
    pub tokenizer: Arc<dyn TokenizerHandle>,
    pub primary: Box<dyn EngineModel>,
    pub draft: Option<Box<dyn EngineModel>>,
}

/// Incremental text generation over the assembled parts.
#[async_trait]
pub trait StreamingGenerator: Send {
    /// Start a new generation. Any previous one on this generator is
    /// abandoned.
    async fn begin(
        &mut self,
        prompt: &str,
        params: SamplingParams,
        max_new_tokens: u32,
    ) -> Result<(), EngineError>;

    /// Produce the next decoded chunk; `None` once the stream is finished.
    async fn next_chunk(&mut self) -> Result<Option<String>, EngineError>;

    /// Free the owned parts. Idempotent.
    async fn release(&mut self);
}

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Backend identifier, e.g. "sim".
    fn name(&self) -> &str;

    /// Load the vocabulary only.
    async fn tokenizer(&self, spec: &EngineModelSpec)
    -> Result<Arc<dyn TokenizerHandle>, EngineError>;

    /// Construct an unloaded model handle from the spec.
    async fn prepare(&self, spec: &EngineModelSpec) -> Result<Box<dyn EngineModel>, EngineError>;

    /// Assemble a generator over loaded parts.
    async fn build_generator(
        &self,
        parts: GeneratorParts,
    ) -> Result<Box<dyn StreamingGenerator>, EngineError>;

    /// Return freed-but-cached device memory to the allocator, after
    /// releases and failed loads.
    async fn reclaim_device_memory(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_mode_parses_known_modes() {
        assert_eq!("FP16".parse::<CacheMode>().unwrap(), CacheMode::Fp16);
        assert_eq!("FP8".parse::<CacheMode>().unwrap(), CacheMode::Fp8);
        assert_eq!("Q4".parse::<CacheMode>().unwrap(), CacheMode::Q4);
        assert_eq!("Q6".parse::<CacheMode>().unwrap(), CacheMode::Q6);
        assert_eq!("Q8".parse::<CacheMode>().unwrap(), CacheMode::Q8);
    }

    #[test]
    fn test_cache_mode_rejects_unknown() {
        let err = "Q9".parse::<CacheMode>().unwrap_err();
        assert_eq!(err, "Unknown cache mode: Q9");
        assert!("fp16".parse::<CacheMode>().is_err(), "case sensitive");
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::oom("device 0 exhausted");
        assert_eq!(err.to_string(), "out of device memory: device 0 exhausted");
    }
}
