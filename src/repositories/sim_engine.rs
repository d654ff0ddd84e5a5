use crate::config::settings::SamplingParams;
use crate::repositories::engine::{
    CacheLayout, CacheMode, EngineError, EngineModel, EngineModelSpec, GeneratorParts,
    InferenceEngine, StreamingGenerator, TokenizerHandle,
};
use crate::services::descriptor::ModelDescriptor;
use crate::services::placement::{BudgetLedger, PlacementPlan};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Chronological record of every device-touching call, kept by the sim
/// backend for inspection and tests.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, entry: String) {
        debug!("sim: {}", entry);
        lock(&self.0).push(entry);
    }

    pub fn snapshot(&self) -> Vec<String> {
        lock(&self.0).clone()
    }
}

struct SimDevices {
    capacity: Vec<u64>,
    used: Vec<u64>,
    /// Released but not yet returned to the allocator; still occupies the
    /// device until `reclaim`.
    lingering: Vec<u64>,
}

impl SimDevices {
    fn alloc(&mut self, device: usize, bytes: u64) -> Result<(), EngineError> {
        if device >= self.capacity.len() {
            return Err(EngineError::runtime(format!("no such device: {}", device)));
        }
        let occupied = self.used[device] + self.lingering[device];
        if occupied + bytes > self.capacity[device] {
            return Err(EngineError::oom(format!(
                "device {} exhausted ({} of {} bytes occupied, {} requested)",
                device, occupied, self.capacity[device], bytes
            )));
        }
        self.used[device] += bytes;
        Ok(())
    }

    fn free(&mut self, device: usize, bytes: u64) {
        let freed = self.used[device].min(bytes);
        self.used[device] -= freed;
        self.lingering[device] += freed;
    }

    fn reclaim(&mut self) {
        self.lingering.iter_mut().for_each(|b| *b = 0);
    }
}

/// Deterministic in-process backend. Models per-device byte budgets,
/// module-by-module placement, cache footprints per precision and a fixed
/// token stream, without touching any real accelerator.
pub struct SimEngine {
    devices: Arc<Mutex<SimDevices>>,
    log: CallLog,
}

impl SimEngine {
    pub fn new(device_mib: &[u64]) -> Self {
        let capacity: Vec<u64> = device_mib.iter().map(|m| m * 1024 * 1024).collect();
        let count = capacity.len();
        Self {
            devices: Arc::new(Mutex::new(SimDevices {
                capacity,
                used: vec![0; count],
                lingering: vec![0; count],
            })),
            log: CallLog::default(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.snapshot()
    }

    /// Live bytes per device.
    pub fn used_bytes(&self) -> Vec<u64> {
        lock(&self.devices).used.clone()
    }

    /// Released-but-unreclaimed bytes per device.
    pub fn lingering_bytes(&self) -> Vec<u64> {
        lock(&self.devices).lingering.clone()
    }
}

/// One module per transformer layer, plus the embedding and head.
fn module_sizes(descriptor: &ModelDescriptor) -> Vec<u64> {
    let h = descriptor.hidden_size;
    let embed = descriptor.vocab_size * h * 2;
    let layer = (4 * h * h + 3 * h * descriptor.intermediate_size) * 2;
    let mut sizes = vec![embed];
    sizes.extend((0..descriptor.num_hidden_layers).map(|_| layer));
    sizes.push(embed);
    sizes
}

fn cache_bytes(spec: &EngineModelSpec, mode: CacheMode) -> u64 {
    let d = &spec.descriptor;
    let per_position =
        2 * d.num_hidden_layers as u64 * d.num_key_value_heads as u64 * d.head_dim as u64;
    let full = spec.seq_len as u64 * per_position;
    match mode {
        CacheMode::Fp16 => full * 2,
        CacheMode::Fp8 | CacheMode::Q8 => full,
        CacheMode::Q6 => full * 3 / 4,
        CacheMode::Q4 => full / 2,
    }
}

fn label_for(spec: &EngineModelSpec) -> String {
    spec.checkpoint_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| spec.checkpoint_dir.display().to_string())
}

struct SimModel {
    devices: Arc<Mutex<SimDevices>>,
    log: CallLog,
    spec: EngineModelSpec,
    label: String,
    sizes: Vec<u64>,
    /// (device, bytes) actually allocated, including the cache.
    allocations: Vec<(usize, u64)>,
    ledger: Option<BudgetLedger>,
    tensor_parallel: bool,
    released: bool,
}

impl SimModel {
    fn charge(&mut self, device: usize, bytes: u64) -> Result<(), EngineError> {
        lock(&self.devices).alloc(device, bytes)?;
        self.allocations.push((device, bytes));
        Ok(())
    }

    fn device_count(&self) -> usize {
        lock(&self.devices).capacity.len()
    }

    fn shard_everywhere(&mut self, bytes: u64) -> Result<(), EngineError> {
        let count = self.device_count();
        if count == 0 {
            return Err(EngineError::oom("no devices visible"));
        }
        let share = bytes.div_ceil(count as u64);
        for device in 0..count {
            self.charge(device, share)?;
        }
        Ok(())
    }
}

#[async_trait]
impl EngineModel for SimModel {
    fn module_count(&self) -> usize {
        self.sizes.len()
    }

    async fn place_and_load(
        &mut self,
        plan: &PlacementPlan,
        progress: &mut (dyn FnMut(usize) + Send),
    ) -> Result<(), EngineError> {
        let num_modules = self.sizes.len();
        match plan {
            PlacementPlan::PerDevice(budgets) => {
                let mut ledger = BudgetLedger::new(budgets);
                for (index, bytes) in self.sizes.clone().into_iter().enumerate() {
                    let device = ledger.assign(bytes).map_err(|_| {
                        EngineError::oom(format!(
                            "module {} does not fit any remaining device budget",
                            index + 1
                        ))
                    })?;
                    self.charge(device, bytes)?;
                    self.log.push(format!(
                        "{}: module {}/{} -> device {}",
                        self.label,
                        index + 1,
                        num_modules,
                        device
                    ));
                    progress(index + 1);
                    tokio::task::yield_now().await;
                }
                self.ledger = Some(ledger);
            }
            PlacementPlan::TensorParallel => {
                self.tensor_parallel = true;
                for (index, bytes) in self.sizes.clone().into_iter().enumerate() {
                    self.shard_everywhere(bytes)?;
                    self.log
                        .push(format!("{}: module {}/{} sharded", self.label, index + 1, num_modules));
                    progress(index + 1);
                    tokio::task::yield_now().await;
                }
            }
        }
        Ok(())
    }

    async fn allocate_cache(
        &mut self,
        mode: CacheMode,
        layout: CacheLayout,
    ) -> Result<(), EngineError> {
        let bytes = cache_bytes(&self.spec, mode);
        match layout {
            CacheLayout::Sharded => {
                if !self.tensor_parallel {
                    return Err(EngineError::runtime(
                        "sharded cache requires tensor-parallel placement",
                    ));
                }
                self.shard_everywhere(bytes)?;
            }
            CacheLayout::Lazy => {
                let Some(ledger) = self.ledger.as_mut() else {
                    return Err(EngineError::runtime("lazy cache requires budgeted placement"));
                };
                let device = ledger.assign(bytes).map_err(|_| {
                    EngineError::oom("cache does not fit any remaining device budget")
                })?;
                self.charge(device, bytes)?;
            }
            CacheLayout::Direct => {
                let device = self.allocations.last().map(|(device, _)| *device).unwrap_or(0);
                self.charge(device, bytes)?;
            }
        }
        self.log.push(format!("{}: cache {} ({} bytes)", self.label, mode, bytes));
        Ok(())
    }

    async fn dry_run_forward(&mut self, len: u32) -> Result<(), EngineError> {
        // Transient attention scratch, charged nowhere but bounded by what
        // is left on the device holding the top of the model.
        let scratch = len as u64 * len as u64 * 2;
        let device = self.allocations.last().map(|(device, _)| *device).unwrap_or(0);
        {
            let devices = lock(&self.devices);
            if device >= devices.capacity.len() {
                return Err(EngineError::runtime(format!("no such device: {}", device)));
            }
            let occupied = devices.used[device] + devices.lingering[device];
            if occupied + scratch > devices.capacity[device] {
                return Err(EngineError::oom(format!(
                    "forward pass over {} positions does not fit on device {}",
                    len, device
                )));
            }
        }
        self.log.push(format!("{}: dry-run {} positions", self.label, len));
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let mut devices = lock(&self.devices);
            for (device, bytes) in self.allocations.drain(..) {
                devices.free(device, bytes);
            }
        }
        self.log.push(format!("{}: release", self.label));
    }
}

struct SimTokenizer;

impl TokenizerHandle for SimTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

const WORDS: [&str; 8] = ["alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel"];

struct SimGenerator {
    log: CallLog,
    parts: Vec<Box<dyn EngineModel>>,
    produced: usize,
    remaining: u32,
}

#[async_trait]
impl StreamingGenerator for SimGenerator {
    async fn begin(
        &mut self,
        prompt: &str,
        params: SamplingParams,
        max_new_tokens: u32,
    ) -> Result<(), EngineError> {
        self.produced = 0;
        self.remaining = max_new_tokens;
        self.log.push(format!(
            "generate: begin ({} prompt chars, temperature {})",
            prompt.len(),
            params.temperature
        ));
        Ok(())
    }

    async fn next_chunk(&mut self) -> Result<Option<String>, EngineError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let word = WORDS[self.produced % WORDS.len()];
        self.produced += 1;
        tokio::task::yield_now().await;
        Ok(Some(format!("{} ", word)))
    }

    async fn release(&mut self) {
        for part in &mut self.parts {
            part.release().await;
        }
    }
}

#[async_trait]
impl InferenceEngine for SimEngine {
    fn name(&self) -> &str {
        "sim"
    }

    async fn tokenizer(
        &self,
        spec: &EngineModelSpec,
    ) -> Result<Arc<dyn TokenizerHandle>, EngineError> {
        if !spec.checkpoint_dir.is_dir() {
            return Err(EngineError::io(format!(
                "no checkpoint at {}",
                spec.checkpoint_dir.display()
            )));
        }
        self.log.push(format!("{}: tokenizer", label_for(spec)));
        Ok(Arc::new(SimTokenizer))
    }

    async fn prepare(&self, spec: &EngineModelSpec) -> Result<Box<dyn EngineModel>, EngineError> {
        let label = label_for(spec);
        self.log.push(format!("{}: prepare", label));
        Ok(Box::new(SimModel {
            devices: self.devices.clone(),
            log: self.log.clone(),
            sizes: module_sizes(&spec.descriptor),
            spec: spec.clone(),
            label,
            allocations: Vec::new(),
            ledger: None,
            tensor_parallel: false,
            released: false,
        }))
    }

    async fn build_generator(
        &self,
        parts: GeneratorParts,
    ) -> Result<Box<dyn StreamingGenerator>, EngineError> {
        let mut owned: Vec<Box<dyn EngineModel>> = vec![parts.primary];
        if let Some(draft) = parts.draft {
            owned.push(draft);
        }
        self.log.push("generator: assembled".to_string());
        Ok(Box::new(SimGenerator {
            log: self.log.clone(),
            parts: owned,
            produced: 0,
            remaining: 0,
        }))
    }

    async fn reclaim_device_memory(&self) {
        lock(&self.devices).reclaim();
        self.log.push("reclaim".to_string());
    }
}
