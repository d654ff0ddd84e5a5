use crate::config::models::{
    ModelConfig, ModelConfigUpdate, ModelRegistry, RegistryError, SamplingDefaults,
};
use crate::config::settings::{AppSettings, SettingsError};
use crate::events::{EventSender, StreamEvent};
use crate::repositories::device_memory::DeviceMemoryOracle;
use crate::repositories::engine::InferenceEngine;
use crate::services::cancel::CancelFlag;
use crate::services::loader::{self, RuntimeContainer};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Owner of the registry, the settings and the single published
/// RuntimeContainer. Every state-mutating operation goes through the
/// `Mutex` around it; holding the guard is the exclusivity ticket, so at
/// most one load and one generation run system-wide. The cancel flag is
/// deliberately outside the lock.
pub struct ModelManager {
    engine: Arc<dyn InferenceEngine>,
    oracle: Arc<dyn DeviceMemoryOracle>,
    registry: ModelRegistry,
    settings: AppSettings,
    settings_path: PathBuf,
    cancel: CancelFlag,
    current: Option<RuntimeContainer>,
}

pub type ModelManagerState = Arc<Mutex<ModelManager>>;

impl ModelManager {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        oracle: Arc<dyn DeviceMemoryOracle>,
        registry: ModelRegistry,
        settings: AppSettings,
        settings_path: PathBuf,
        cancel: CancelFlag,
    ) -> Self {
        Self { engine, oracle, registry, settings, settings_path, cancel, current: None }
    }

    pub fn list_models(&self) -> BTreeMap<Uuid, String> {
        self.registry.list()
    }

    pub fn model_info(&self, id: Uuid) -> Option<&ModelConfig> {
        self.registry.get(id)
    }

    pub fn create_model(&mut self, update: ModelConfigUpdate) -> Result<Uuid, RegistryError> {
        self.registry.create(update)
    }

    pub fn update_model(
        &mut self,
        id: Uuid,
        update: ModelConfigUpdate,
    ) -> Result<(), RegistryError> {
        self.registry.update(id, update)
    }

    /// Remove from the registry only; a loaded instance stays resident
    /// until unloaded.
    pub fn remove_model(&mut self, id: Uuid) -> Result<(), RegistryError> {
        self.registry.remove(id)
    }

    pub fn current_model_id(&self) -> Option<Uuid> {
        self.current.as_ref().map(|c| c.model_id())
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn update_settings(&mut self, settings: AppSettings) -> Result<(), SettingsError> {
        settings.save_to(&self.settings_path)?;
        self.settings = settings;
        Ok(())
    }

    /// Token count against the active tokenizer; zero when unloaded.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.current.as_ref().map(|c| c.tokenizer().count_tokens(text)).unwrap_or(0)
    }

    /// Load a registered model, streaming progress through `events` and
    /// finishing with exactly one terminal event. The attempt begins by
    /// releasing whatever is currently published, so a failure leaves the
    /// process unloaded rather than half-swapped.
    pub async fn load_model(&mut self, id: Uuid, events: &EventSender) {
        let Some(config) = self.registry.get(id) else {
            let _ = events.send(StreamEvent::Fail { error: format!("model {} not found", id) });
            return;
        };
        let config = config.clone();

        self.unload_model().await;

        let chunk = self.settings.chunk_size;
        match loader::load(self.engine.as_ref(), self.oracle.as_ref(), &config, chunk, events)
            .await
        {
            Ok(container) => {
                info!("model {} ({}) published", config.name, config.id);
                self.current = Some(container);
                let _ = events.send(StreamEvent::Ok);
            }
            Err(error) => {
                let _ = events.send(StreamEvent::Fail { error: error.to_string() });
            }
        }
    }

    /// Release the published container and return its memory. Idempotent.
    pub async fn unload_model(&mut self) {
        if let Some(mut container) = self.current.take() {
            info!("unloading model {}", container.model_id());
            container.release().await;
            self.engine.reclaim_device_memory().await;
        }
    }

    /// Stream a generation through `events`. The cancel flag is observed
    /// between token steps: on observing it the stream ends with a normal
    /// `ok` and the flag is already cleared.
    pub async fn generate(
        &mut self,
        prompt: &str,
        max_new_tokens: u32,
        overrides: &SamplingDefaults,
        events: &EventSender,
    ) {
        self.cancel.clear();

        let Some(container) = self.current.as_mut() else {
            let _ = events.send(StreamEvent::Fail { error: "no model loaded".to_string() });
            return;
        };

        let params = self.settings.sampling.resolve(&container.config().sampling, overrides);
        let generator = container.generator();
        if let Err(error) = generator.begin(prompt, params, max_new_tokens).await {
            let _ = events.send(StreamEvent::Fail { error: error.to_string() });
            return;
        }

        loop {
            if self.cancel.is_raised() {
                self.cancel.clear();
                break;
            }
            match generator.next_chunk().await {
                Ok(Some(text)) => {
                    // A closed channel means the client went away; stop
                    // producing.
                    if events.send(StreamEvent::Chunk { text }).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    let _ = events.send(StreamEvent::Fail { error: error.to_string() });
                    return;
                }
            }
        }
        let _ = events.send(StreamEvent::Ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::device_memory::FixedOracle;
    use crate::repositories::sim_engine::SimEngine;
    use std::fs;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};
    use tokio::sync::mpsc;

    fn write_checkpoint(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join("config.json"),
            r#"{"hidden_size": 1024, "intermediate_size": 4096,
                "num_attention_heads": 16, "num_hidden_layers": 2,
                "vocab_size": 32768, "head_dim": 64,
                "max_position_embeddings": 1024}"#,
        )
        .unwrap();
    }

    struct Fixture {
        _data: TempDir,
        _checkpoints: TempDir,
        engine: Arc<SimEngine>,
        cancel: CancelFlag,
        state: ModelManagerState,
    }

    /// Manager over a sim device of the given size, with one registered
    /// model per requested checkpoint name. The oracle always reports a
    /// roomy 8 GiB so placement planning succeeds; the sim capacity is
    /// the constraint under test.
    fn make_fixture(device_mib: u64, checkpoints: &[&str]) -> (Fixture, Vec<Uuid>) {
        let data = tempdir().unwrap();
        let ckpt_root = tempdir().unwrap();
        let engine = Arc::new(SimEngine::new(&[device_mib]));
        let oracle = Arc::new(FixedOracle::from_mib(&[8192]));
        let registry = ModelRegistry::load(data.path()).unwrap();
        let cancel = CancelFlag::new();
        let mut manager = ModelManager::new(
            engine.clone(),
            oracle,
            registry,
            AppSettings::default(),
            data.path().join("settings.yaml"),
            cancel.clone(),
        );

        let mut ids = Vec::new();
        for name in checkpoints {
            let dir = ckpt_root.path().join(name);
            write_checkpoint(&dir);
            let id = manager
                .create_model(ModelConfigUpdate {
                    name: Some(name.to_string()),
                    model_dir: Some(dir.to_str().unwrap().to_string()),
                    ..Default::default()
                })
                .unwrap();
            ids.push(id);
        }

        let fixture = Fixture {
            _data: data,
            _checkpoints: ckpt_root,
            engine,
            cancel,
            state: Arc::new(Mutex::new(manager)),
        };
        (fixture, ids)
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn terminal(events: &[StreamEvent]) -> &StreamEvent {
        events.last().expect("stream must not be empty")
    }

    #[tokio::test]
    async fn test_load_publishes_single_container_and_swap_releases_first() {
        // The device fits exactly one loaded model (192 MiB weights plus
        // 8 MiB cache), so the swap only works if the first container is
        // released and reclaimed before the second loads.
        let (fixture, ids) = make_fixture(220, &["alpha-model", "bravo-model"]);
        let mut manager = fixture.state.lock().await;

        let (tx, rx) = mpsc::unbounded_channel();
        manager.load_model(ids[0], &tx).await;
        drop(tx);
        assert_eq!(terminal(&drain(rx).await), &StreamEvent::Ok);
        assert_eq!(manager.current_model_id(), Some(ids[0]));

        let (tx, rx) = mpsc::unbounded_channel();
        manager.load_model(ids[1], &tx).await;
        drop(tx);
        assert_eq!(terminal(&drain(rx).await), &StreamEvent::Ok);
        assert_eq!(manager.current_model_id(), Some(ids[1]));

        manager.unload_model().await;
        assert_eq!(manager.current_model_id(), None);
        assert_eq!(fixture.engine.used_bytes(), vec![0]);
        assert_eq!(fixture.engine.lingering_bytes(), vec![0]);
    }

    #[tokio::test]
    async fn test_failed_load_leaves_process_unloaded() {
        let (fixture, ids) = make_fixture(8192, &["alpha-model"]);
        let mut manager = fixture.state.lock().await;

        let (tx, rx) = mpsc::unbounded_channel();
        manager.load_model(ids[0], &tx).await;
        drop(tx);
        assert_eq!(terminal(&drain(rx).await), &StreamEvent::Ok);

        // Break the config, then watch the second attempt fail.
        manager
            .update_model(
                ids[0],
                ModelConfigUpdate { cache_mode: Some("Q9".to_string()), ..Default::default() },
            )
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        manager.load_model(ids[0], &tx).await;
        drop(tx);
        let events = drain(rx).await;
        assert_eq!(
            terminal(&events),
            &StreamEvent::Fail { error: "Unknown cache mode: Q9".to_string() }
        );
        assert_eq!(events.len(), 1, "rejected before any progress");
        assert_eq!(
            manager.current_model_id(),
            None,
            "the attempt begins by unpublishing, so a failure leaves nothing loaded"
        );
    }

    #[tokio::test]
    async fn test_load_unknown_id_keeps_current_model() {
        let (fixture, ids) = make_fixture(8192, &["alpha-model"]);
        let mut manager = fixture.state.lock().await;

        let (tx, rx) = mpsc::unbounded_channel();
        manager.load_model(ids[0], &tx).await;
        drop(tx);
        assert_eq!(terminal(&drain(rx).await), &StreamEvent::Ok);

        let (tx, rx) = mpsc::unbounded_channel();
        manager.load_model(Uuid::new_v4(), &tx).await;
        drop(tx);
        let events = drain(rx).await;
        assert!(matches!(terminal(&events), StreamEvent::Fail { .. }));
        assert_eq!(manager.current_model_id(), Some(ids[0]), "nothing was torn down");
    }

    #[tokio::test]
    async fn test_count_tokens_follows_lifecycle() {
        let (fixture, ids) = make_fixture(8192, &["alpha-model"]);
        let mut manager = fixture.state.lock().await;
        assert_eq!(manager.count_tokens("one two three"), 0);

        let (tx, rx) = mpsc::unbounded_channel();
        manager.load_model(ids[0], &tx).await;
        drop(tx);
        assert_eq!(terminal(&drain(rx).await), &StreamEvent::Ok);
        assert_eq!(manager.count_tokens("one two three"), 3);

        manager.unload_model().await;
        assert_eq!(manager.count_tokens("one two three"), 0);
    }

    #[tokio::test]
    async fn test_generate_streams_chunks_then_ok() {
        let (fixture, ids) = make_fixture(8192, &["alpha-model"]);
        let mut manager = fixture.state.lock().await;

        let (tx, rx) = mpsc::unbounded_channel();
        manager.load_model(ids[0], &tx).await;
        drop(tx);
        assert_eq!(terminal(&drain(rx).await), &StreamEvent::Ok);

        let (tx, rx) = mpsc::unbounded_channel();
        manager.generate("say something", 3, &SamplingDefaults::default(), &tx).await;
        drop(tx);
        let events = drain(rx).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk { text: "alpha ".to_string() },
                StreamEvent::Chunk { text: "bravo ".to_string() },
                StreamEvent::Chunk { text: "charlie ".to_string() },
                StreamEvent::Ok,
            ]
        );
    }

    #[tokio::test]
    async fn test_generate_without_model_fails() {
        let (fixture, _) = make_fixture(8192, &[]);
        let mut manager = fixture.state.lock().await;

        let (tx, rx) = mpsc::unbounded_channel();
        manager.generate("hello", 4, &SamplingDefaults::default(), &tx).await;
        drop(tx);
        let events = drain(rx).await;
        assert_eq!(events, vec![StreamEvent::Fail { error: "no model loaded".to_string() }]);
    }

    #[tokio::test]
    async fn test_cancellation_ends_with_ok_and_clears_flag() {
        let (fixture, ids) = make_fixture(8192, &["alpha-model"]);
        {
            let mut manager = fixture.state.lock().await;
            let (tx, rx) = mpsc::unbounded_channel();
            manager.load_model(ids[0], &tx).await;
            drop(tx);
            assert_eq!(terminal(&drain(rx).await), &StreamEvent::Ok);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = fixture.state.clone();
        let task = tokio::spawn(async move {
            let mut manager = state.lock().await;
            manager.generate("go on forever", 100_000, &SamplingDefaults::default(), &tx).await;
        });

        // Cancel after the first chunk arrives, without touching the
        // manager lock the generation is holding.
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, StreamEvent::Chunk { .. }));
        fixture.cancel.raise();

        task.await.unwrap();
        let mut tail = Vec::new();
        while let Some(event) = rx.recv().await {
            tail.push(event);
        }
        assert_eq!(tail.last(), Some(&StreamEvent::Ok), "cancellation is not an error");
        assert!(
            tail.len() <= 3,
            "observed within a token step, got {} trailing events",
            tail.len()
        );
        assert!(!fixture.cancel.is_raised(), "flag is reset before the gate is released");
    }

    #[tokio::test]
    async fn test_concurrent_loads_never_interleave() {
        let (fixture, ids) = make_fixture(8192, &["alpha-model", "bravo-model"]);

        let mut tasks = Vec::new();
        for id in ids {
            let state = fixture.state.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, rx) = mpsc::unbounded_channel();
                let mut manager = state.lock().await;
                manager.load_model(id, &tx).await;
                drop(manager);
                drop(tx);
                drain(rx).await
            }));
        }
        for task in tasks {
            let events = task.await.unwrap();
            assert_eq!(terminal(&events), &StreamEvent::Ok);
        }

        // Whichever got the gate first, its module placements form one
        // contiguous block in the engine's call order.
        let calls = fixture.engine.calls();
        let modules: Vec<&String> = calls.iter().filter(|c| c.contains(": module ")).collect();
        assert_eq!(modules.len(), 8);
        let alpha_indices: Vec<usize> = modules
            .iter()
            .enumerate()
            .filter(|(_, c)| c.starts_with("alpha-model"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(alpha_indices.len(), 4);
        let contiguous = alpha_indices.windows(2).all(|w| w[1] == w[0] + 1);
        assert!(contiguous, "placements interleaved: {:?}", modules);
    }
}
