use crate::config::models::ModelConfig;
use crate::events::{EventSender, StreamEvent};
use crate::repositories::device_memory::DeviceMemoryOracle;
use crate::repositories::engine::{
    CacheLayout, CacheMode, EngineError, EngineErrorKind, EngineModel, EngineModelSpec,
    GeneratorParts, InferenceEngine, StreamingGenerator, TokenizerHandle,
};
use crate::services::descriptor::{self, DescriptorError, ModelDescriptor};
use crate::services::placement::{self, PlacementError, PlacementPlan, SplitStrategy};
use crate::util::expanduser;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// The live model: tokenizer, assembled generator (owning every device
/// allocation) and the config it was loaded from. At most one exists
/// process-wide; it is either fully assembled or not published at all.
pub struct RuntimeContainer {
    config: ModelConfig,
    tokenizer: Arc<dyn TokenizerHandle>,
    generator: Box<dyn StreamingGenerator>,
}

impl std::fmt::Debug for RuntimeContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContainer").field("config", &self.config).finish_non_exhaustive()
    }
}

impl RuntimeContainer {
    pub fn model_id(&self) -> Uuid {
        self.config.id
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &Arc<dyn TokenizerHandle> {
        &self.tokenizer
    }

    pub fn generator(&mut self) -> &mut Box<dyn StreamingGenerator> {
        &mut self.generator
    }

    /// Free every device allocation this container owns.
    pub async fn release(&mut self) {
        self.generator.release().await;
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{0}")]
    Config(#[from] DescriptorError),
    #[error("{0}")]
    Resource(String),
    #[error("{0}")]
    UnsupportedMode(String),
    #[error("{0}")]
    Engine(EngineError),
}

fn classify_placement(error: PlacementError) -> LoadError {
    match error {
        PlacementError::InsufficientMemory => LoadError::Resource(error.to_string()),
        PlacementError::InvalidSelection(message) => LoadError::UnsupportedMode(message),
    }
}

/// Engine OOM is a resource problem; everything else stays an opaque
/// engine failure carrying the backend's kind and text.
fn classify_engine(error: EngineError) -> LoadError {
    match error.kind {
        EngineErrorKind::OutOfMemory => LoadError::Resource(error.to_string()),
        _ => LoadError::Engine(error),
    }
}

/// Positional-scaling factor for a draft whose native context is shorter
/// than the primary's target length.
pub fn draft_auto_alpha(primary_seq_len: u32, draft_default_seq_len: u32) -> f32 {
    let ratio = primary_seq_len as f32 / draft_default_seq_len as f32;
    if ratio <= 1.0 {
        1.0
    } else {
        -0.13436 + 0.80541 * ratio + 0.28833 * ratio * ratio
    }
}

struct DraftPrep {
    spec: EngineModelSpec,
    plan: PlacementPlan,
}

/// One load attempt, front to back: validate, plan, then walk the device
/// phases. Progress events cover draft and primary modules under one
/// constant `num_modules` with a strictly non-decreasing index. On failure
/// every partial resource is released and device memory reclaimed before
/// the error is returned.
pub async fn load(
    engine: &dyn InferenceEngine,
    oracle: &dyn DeviceMemoryOracle,
    config: &ModelConfig,
    default_chunk: u32,
    events: &EventSender,
) -> Result<RuntimeContainer, LoadError> {
    let mut attempt = Attempt { engine, events, draft: None, primary: None };
    match attempt.run(oracle, config, default_chunk).await {
        Ok(container) => Ok(container),
        Err(error) => {
            warn!("load of {} failed: {}", config.name, error);
            attempt.teardown().await;
            Err(error)
        }
    }
}

struct Attempt<'a> {
    engine: &'a dyn InferenceEngine,
    events: &'a EventSender,
    draft: Option<Box<dyn EngineModel>>,
    primary: Option<Box<dyn EngineModel>>,
}

impl Attempt<'_> {
    async fn run(
        &mut self,
        oracle: &dyn DeviceMemoryOracle,
        config: &ModelConfig,
        default_chunk: u32,
    ) -> Result<RuntimeContainer, LoadError> {
        // Everything that can be rejected without touching a device comes
        // first: mode parsing, strategy selection, descriptor probes and
        // placement planning.
        let cache_mode: CacheMode =
            config.cache_mode.parse().map_err(LoadError::UnsupportedMode)?;
        let strategy =
            SplitStrategy::derive(config.tensor_parallel, config.gpu_split_auto, &config.gpu_split)
                .map_err(classify_placement)?;

        let checkpoint_dir = config.checkpoint_dir();
        let primary_descriptor = descriptor::probe(&checkpoint_dir)?;
        let seq_len = effective_seq_len(config, &primary_descriptor);
        let chunk_size = config.chunk_size.map(|c| c.tokens()).unwrap_or(default_chunk);
        let rope_scale = config.rope_scale.unwrap_or(1.0);

        let primary_spec = EngineModelSpec {
            checkpoint_dir,
            descriptor: primary_descriptor,
            seq_len,
            chunk_size,
            rope_scale,
            rope_alpha: config.rope_alpha.unwrap_or(1.0),
        };

        let draft_prep = match config.draft.as_ref() {
            Some(draft) => {
                let draft_dir = expanduser(&draft.model_dir);
                let draft_descriptor = descriptor::probe(&draft_dir)?;
                let alpha = if draft.rope_alpha_auto {
                    draft_auto_alpha(seq_len, draft_descriptor.default_seq_len)
                } else {
                    draft.rope_alpha
                };
                // The draft always auto-splits, reserving its own extra
                // margin on device 0, and is stretched to the primary's
                // target length.
                let plan = placement::plan(&SplitStrategy::Auto, oracle, true)
                    .await
                    .map_err(classify_placement)?;
                Some(DraftPrep {
                    spec: EngineModelSpec {
                        checkpoint_dir: draft_dir,
                        descriptor: draft_descriptor,
                        seq_len,
                        chunk_size,
                        rope_scale,
                        rope_alpha: alpha,
                    },
                    plan,
                })
            }
            None => None,
        };

        let primary_plan = placement::plan(&strategy, oracle, draft_prep.is_some())
            .await
            .map_err(classify_placement)?;

        // TokenizerReady. A fresh instance per load: no memoized token
        // state survives from a previously loaded checkpoint.
        let tokenizer =
            self.engine.tokenizer(&primary_spec).await.map_err(classify_engine)?;

        if let Some(prep) = &draft_prep {
            self.draft = Some(self.engine.prepare(&prep.spec).await.map_err(classify_engine)?);
        }
        self.primary =
            Some(self.engine.prepare(&primary_spec).await.map_err(classify_engine)?);

        let draft_modules = self.draft.as_ref().map(|d| d.module_count()).unwrap_or(0);
        let num_modules =
            draft_modules + self.primary.as_ref().map(|p| p.module_count()).unwrap_or(0);

        // DraftLoading → DraftReady.
        if let (Some(draft), Some(prep)) = (self.draft.as_mut(), &draft_prep) {
            info!("loading draft model from {}", prep.spec.checkpoint_dir.display());
            let events = self.events.clone();
            let mut progress = move |module: usize| {
                let _ = events.send(StreamEvent::Progress { module, num_modules });
            };
            draft.place_and_load(&prep.plan, &mut progress).await.map_err(classify_engine)?;
            draft
                .allocate_cache(CacheMode::Fp16, CacheLayout::Lazy)
                .await
                .map_err(classify_engine)?;
            draft.dry_run_forward(chunk_size).await.map_err(classify_engine)?;
        }

        // PrimaryLoading: one progress event per module, re-based past the
        // draft's modules.
        let Some(primary) = self.primary.as_mut() else {
            return Err(LoadError::Engine(EngineError::runtime("primary handle missing")));
        };
        info!("loading model from {}", primary_spec.checkpoint_dir.display());
        let events = self.events.clone();
        let mut progress = move |module: usize| {
            let _ = events
                .send(StreamEvent::Progress { module: draft_modules + module, num_modules });
        };
        primary.place_and_load(&primary_plan, &mut progress).await.map_err(classify_engine)?;

        // CacheReady.
        let layout = match &strategy {
            SplitStrategy::TensorParallel => CacheLayout::Sharded,
            SplitStrategy::Auto => CacheLayout::Lazy,
            SplitStrategy::Manual(_) => CacheLayout::Direct,
        };
        primary.allocate_cache(cache_mode, layout).await.map_err(classify_engine)?;

        // GeneratorReady: hand every part over; from here the generator
        // owns all device allocations.
        let Some(primary) = self.primary.take() else {
            return Err(LoadError::Engine(EngineError::runtime("primary handle missing")));
        };
        let generator = self
            .engine
            .build_generator(GeneratorParts {
                tokenizer: tokenizer.clone(),
                primary,
                draft: self.draft.take(),
            })
            .await
            .map_err(classify_engine)?;

        Ok(RuntimeContainer { config: config.clone(), tokenizer, generator })
    }

    /// Release whatever the failed attempt acquired, then force the
    /// engine to return the memory.
    async fn teardown(&mut self) {
        if let Some(mut draft) = self.draft.take() {
            draft.release().await;
        }
        if let Some(mut primary) = self.primary.take() {
            primary.release().await;
        }
        self.engine.reclaim_device_memory().await;
    }
}

fn effective_seq_len(config: &ModelConfig, descriptor: &ModelDescriptor) -> u32 {
    config.seq_len.map(|s| s.tokens()).unwrap_or(descriptor.default_seq_len)
}
