use crate::config::context_size::ContextSize;
use crate::services::descriptor::{self, ModelDescriptor};
use crate::util::expanduser;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Sampling defaults carried by a model config. Unset fields fall back to
/// the app-wide defaults at generation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingDefaults {
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub repetition_penalty: Option<f32>,
}

impl SamplingDefaults {
    /// Overlay `other` on top of `self`; set fields in `other` win.
    pub fn merge_from(&mut self, other: &SamplingDefaults) {
        if other.temperature.is_some() {
            self.temperature = other.temperature;
        }
        if other.top_k.is_some() {
            self.top_k = other.top_k;
        }
        if other.top_p.is_some() {
            self.top_p = other.top_p;
        }
        if other.repetition_penalty.is_some() {
            self.repetition_penalty = other.repetition_penalty;
        }
    }
}

/// Speculative-decoding draft model attached to a config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DraftConfig {
    pub model_dir: String,
    pub rope_alpha: f32,
    pub rope_alpha_auto: bool,
    /// Probed facts about the draft checkpoint; `None` after a failed probe.
    pub descriptor: Option<ModelDescriptor>,
    pub probe_error: Option<String>,
}

impl Default for DraftConfig {
    fn default() -> Self {
        Self {
            model_dir: String::new(),
            rope_alpha: 1.0,
            rope_alpha_auto: true,
            descriptor: None,
            probe_error: None,
        }
    }
}

/// Persisted model registration. `cache_mode` and the split fields stay
/// free-form here; the load prologue validates them so a bad selection is
/// rejected before any device allocation rather than at edit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub id: Uuid,
    pub name: String,
    pub model_dir: String,
    pub draft: Option<DraftConfig>,
    pub tensor_parallel: bool,
    pub gpu_split_auto: bool,
    /// Comma-separated per-device budgets in GB, used when auto is off.
    pub gpu_split: String,
    pub cache_mode: String,
    pub seq_len: Option<ContextSize>,
    pub rope_scale: Option<f32>,
    pub rope_alpha: Option<f32>,
    pub chunk_size: Option<ContextSize>,
    pub sampling: SamplingDefaults,
    /// Probed facts about the checkpoint; `None` after a failed probe.
    pub descriptor: Option<ModelDescriptor>,
    pub probe_error: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            name: "Unnamed model".to_string(),
            model_dir: String::new(),
            draft: None,
            tensor_parallel: false,
            gpu_split_auto: true,
            gpu_split: String::new(),
            cache_mode: "FP16".to_string(),
            seq_len: None,
            rope_scale: None,
            rope_alpha: None,
            chunk_size: None,
            sampling: SamplingDefaults::default(),
            descriptor: None,
            probe_error: None,
        }
    }
}

impl ModelConfig {
    pub fn checkpoint_dir(&self) -> PathBuf {
        expanduser(&self.model_dir)
    }
}

/// Partial edit payload; unset fields keep their current value. Draft
/// fields are flat, matching the UI form.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfigUpdate {
    pub name: Option<String>,
    pub model_dir: Option<String>,
    pub draft_enabled: Option<bool>,
    pub draft_model_dir: Option<String>,
    pub draft_rope_alpha: Option<f32>,
    pub draft_rope_alpha_auto: Option<bool>,
    pub tensor_parallel: Option<bool>,
    pub gpu_split_auto: Option<bool>,
    pub gpu_split: Option<String>,
    pub cache_mode: Option<String>,
    pub seq_len: Option<ContextSize>,
    pub rope_scale: Option<f32>,
    pub rope_alpha: Option<f32>,
    pub chunk_size: Option<ContextSize>,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub repetition_penalty: Option<f32>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model {0} not found")]
    NotFound(Uuid),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed registry file: {0}")]
    Malformed(#[from] serde_json::Error),
}

const REGISTRY_FILE: &str = "models.json";

/// On-disk model registry. Every mutation persists immediately.
pub struct ModelRegistry {
    path: PathBuf,
    models: HashMap<Uuid, ModelConfig>,
}

impl ModelRegistry {
    pub fn load(data_dir: &Path) -> Result<Self, RegistryError> {
        let path = data_dir.join(REGISTRY_FILE);
        let models = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            HashMap::new()
        };
        Ok(Self { path, models })
    }

    fn save(&self) -> Result<(), RegistryError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.models)?)?;
        Ok(())
    }

    /// `{id: name}` for the model picker, deterministically ordered.
    pub fn list(&self) -> BTreeMap<Uuid, String> {
        self.models.iter().map(|(id, m)| (*id, m.name.clone())).collect()
    }

    pub fn get(&self, id: Uuid) -> Option<&ModelConfig> {
        self.models.get(&id)
    }

    pub fn remove(&mut self, id: Uuid) -> Result<(), RegistryError> {
        if self.models.remove(&id).is_none() {
            return Err(RegistryError::NotFound(id));
        }
        self.save()
    }

    /// Register a new model and probe its checkpoint.
    pub fn create(&mut self, update: ModelConfigUpdate) -> Result<Uuid, RegistryError> {
        let id = Uuid::new_v4();
        let mut config = ModelConfig { id, ..ModelConfig::default() };
        apply_update(&mut config, &update);
        prepare(&mut config);
        prepare_draft(&mut config);
        self.models.insert(id, config);
        self.save()?;
        Ok(id)
    }

    /// Apply a partial edit; the checkpoint is re-probed when its path
    /// changed and the draft is re-probed when the draft settings changed.
    pub fn update(&mut self, id: Uuid, update: ModelConfigUpdate) -> Result<(), RegistryError> {
        let config = self.models.get_mut(&id).ok_or(RegistryError::NotFound(id))?;

        let prev_dir = config.model_dir.clone();
        let prev_draft = config.draft.as_ref().map(|d| d.model_dir.clone());
        apply_update(config, &update);

        if config.model_dir != prev_dir {
            prepare(config);
        }
        if config.draft.as_ref().map(|d| d.model_dir.clone()) != prev_draft {
            prepare_draft(config);
        }

        self.save()
    }
}

fn apply_update(config: &mut ModelConfig, update: &ModelConfigUpdate) {
    if let Some(v) = &update.name {
        config.name = v.clone();
    }
    if let Some(v) = &update.model_dir {
        config.model_dir = v.clone();
    }
    if let Some(v) = update.tensor_parallel {
        config.tensor_parallel = v;
    }
    if let Some(v) = update.gpu_split_auto {
        config.gpu_split_auto = v;
    }
    if let Some(v) = &update.gpu_split {
        config.gpu_split = v.clone();
    }
    if let Some(v) = &update.cache_mode {
        config.cache_mode = v.clone();
    }
    if let Some(v) = update.seq_len {
        config.seq_len = Some(v);
    }
    if let Some(v) = update.rope_scale {
        config.rope_scale = Some(v);
    }
    if let Some(v) = update.rope_alpha {
        config.rope_alpha = Some(v);
    }
    if let Some(v) = update.chunk_size {
        config.chunk_size = Some(v);
    }
    if let Some(v) = update.temperature {
        config.sampling.temperature = Some(v);
    }
    if let Some(v) = update.top_k {
        config.sampling.top_k = Some(v);
    }
    if let Some(v) = update.top_p {
        config.sampling.top_p = Some(v);
    }
    if let Some(v) = update.repetition_penalty {
        config.sampling.repetition_penalty = Some(v);
    }

    // Draft edits: disabling drops the draft config, enabling (or editing
    // the directory) creates or updates it in place.
    if update.draft_enabled == Some(false) {
        config.draft = None;
    } else if update.draft_enabled == Some(true)
        || update.draft_model_dir.is_some()
        || update.draft_rope_alpha.is_some()
        || update.draft_rope_alpha_auto.is_some()
    {
        let draft = config.draft.get_or_insert_with(DraftConfig::default);
        if let Some(v) = &update.draft_model_dir {
            draft.model_dir = v.clone();
        }
        if let Some(v) = update.draft_rope_alpha {
            draft.rope_alpha = v;
        }
        if let Some(v) = update.draft_rope_alpha_auto {
            draft.rope_alpha_auto = v;
        }
    }
}

/// Probe the checkpoint and refresh everything derived from it. Probe
/// failures are recorded on the config for the UI instead of failing the
/// edit.
fn prepare(config: &mut ModelConfig) {
    let dir = config.checkpoint_dir();
    match descriptor::probe(&dir) {
        Ok(desc) => {
            info!("probed checkpoint {}: {} layers", dir.display(), desc.num_hidden_layers);
            if config.seq_len.is_none() {
                config.seq_len = Some(ContextSize::new(desc.default_seq_len));
            }
            config.sampling.merge_from(&descriptor::sampling_sidecar(&dir));
            config.descriptor = Some(desc);
            config.probe_error = None;
        }
        Err(e) => {
            warn!("checkpoint probe failed for {}: {e}", dir.display());
            config.descriptor = None;
            config.probe_error = Some(e.to_string());
        }
    }
}

fn prepare_draft(config: &mut ModelConfig) {
    let Some(draft) = config.draft.as_mut() else {
        return;
    };
    let dir = expanduser(&draft.model_dir);
    match descriptor::probe(&dir) {
        Ok(desc) => {
            draft.descriptor = Some(desc);
            draft.probe_error = None;
        }
        Err(e) => {
            warn!("draft checkpoint probe failed for {}: {e}", dir.display());
            draft.descriptor = None;
            draft.probe_error = Some(e.to_string());
        }
    }
}
