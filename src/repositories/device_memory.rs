use async_trait::async_trait;
use serde_json::Value;
use std::str::FromStr;
use tokio::process::Command;
use tracing::error;

/// Per-device free-memory probe consulted by the split planner. Readings
/// are conservative: a probe failure reports zero free bytes.
#[async_trait]
pub trait DeviceMemoryOracle: Send + Sync {
    fn device_count(&self) -> usize;

    async fn free_bytes(&self, device: usize) -> u64;

    /// Free bytes for every device, indexed by ordinal.
    async fn snapshot(&self) -> Vec<u64> {
        let mut free = Vec::with_capacity(self.device_count());
        for device in 0..self.device_count() {
            free.push(self.free_bytes(device).await);
        }
        free
    }
}

#[derive(Default, Clone, Copy)]
struct DeviceMemory {
    total_bytes: u64,
    used_bytes: u64,
}

impl DeviceMemory {
    fn free(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

/// Oracle over `rocm-smi`, one reading per visible card.
pub struct SmiOracle {
    device_count: usize,
}

impl SmiOracle {
    /// Probe once; `None` when the tool is unavailable or reports no
    /// cards.
    pub async fn probe() -> Option<SmiOracle> {
        let devices = query_devices().await;
        if devices.is_empty() {
            return None;
        }
        Some(Self { device_count: devices.len() })
    }
}

#[async_trait]
impl DeviceMemoryOracle for SmiOracle {
    fn device_count(&self) -> usize {
        self.device_count
    }

    async fn free_bytes(&self, device: usize) -> u64 {
        query_devices().await.get(device).map(DeviceMemory::free).unwrap_or(0)
    }

    // One tool invocation for the whole snapshot.
    async fn snapshot(&self) -> Vec<u64> {
        let devices = query_devices().await;
        (0..self.device_count)
            .map(|i| devices.get(i).map(DeviceMemory::free).unwrap_or(0))
            .collect()
    }
}

/// Fixed per-device readings, for development and tests.
pub struct FixedOracle {
    free: Vec<u64>,
}

impl FixedOracle {
    pub fn new(free_bytes: Vec<u64>) -> Self {
        Self { free: free_bytes }
    }

    pub fn from_mib(mib: &[u64]) -> Self {
        Self { free: mib.iter().map(|m| m * 1024 * 1024).collect() }
    }
}

#[async_trait]
impl DeviceMemoryOracle for FixedOracle {
    fn device_count(&self) -> usize {
        self.free.len()
    }

    async fn free_bytes(&self, device: usize) -> u64 {
        self.free.get(device).copied().unwrap_or(0)
    }
}

async fn query_devices() -> Vec<DeviceMemory> {
    // Execute the CLI tool.
    let output = match Command::new("rocm-smi")
        .arg("--showmeminfo")
        .arg("vram")
        .arg("--json")
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            error!("failed to execute rocm-smi: {}", e);
            return Vec::new();
        }
    };

    if !output.status.success() {
        // If the tool failed we treat it as no devices (conservative).
        error!("rocm-smi returned a non‑zero exit code");
        return Vec::new();
    }

    parse_meminfo(&String::from_utf8_lossy(&output.stdout))
}

/// Parse the JSON payload: one `cardN` object per device, ordered by N.
fn parse_meminfo(stdout: &str) -> Vec<DeviceMemory> {
    let v: Value = match serde_json::from_str(stdout) {
        Ok(v) => v,
        Err(e) => {
            error!("Failed to parse rocm‑smi JSON output: {}", e);
            return Vec::new();
        }
    };

    let Some(obj) = v.as_object() else {
        error!("Unexpected rocm‑smi JSON structure");
        return Vec::new();
    };

    let mut cards: Vec<(usize, DeviceMemory)> = obj
        .iter()
        .filter_map(|(key, card)| {
            let index = key.strip_prefix("card")?.parse::<usize>().ok()?;

            // Extract the two fields we need.
            let total_str = card
                .get("VRAM Total Memory (B)")
                .and_then(|v| v.as_str())
                .unwrap_or("0");
            let used_str = card
                .get("VRAM Total Used Memory (B)")
                .and_then(|v| v.as_str())
                .unwrap_or("0");

            Some((
                index,
                DeviceMemory {
                    total_bytes: u64::from_str(total_str).unwrap_or(0),
                    used_bytes: u64::from_str(used_str).unwrap_or(0),
                },
            ))
        })
        .collect();
    cards.sort_by_key(|(index, _)| *index);
    cards.into_iter().map(|(_, memory)| memory).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo_orders_cards_numerically() {
        let json = r#"{
            "card1": {"VRAM Total Memory (B)": "1000", "VRAM Total Used Memory (B)": "400"},
            "card0": {"VRAM Total Memory (B)": "2000", "VRAM Total Used Memory (B)": "500"}
        }"#;
        let devices = parse_meminfo(json);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].free(), 1500);
        assert_eq!(devices[1].free(), 600);
    }

    #[test]
    fn test_parse_meminfo_tolerates_garbage() {
        assert!(parse_meminfo("not json").is_empty());
        assert!(parse_meminfo("[]").is_empty());

        let json = r#"{"card0": {"VRAM Total Memory (B)": "oops"}}"#;
        let devices = parse_meminfo(json);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].free(), 0, "unparseable reading counts as nothing free");
    }
}
