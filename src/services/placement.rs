use crate::repositories::device_memory::DeviceMemoryOracle;
use thiserror::Error;

/// Safety margin withheld from every device under automatic placement.
pub const AUTO_SPLIT_RESERVE_BYTES: u64 = 512 * 1024 * 1024;

/// Extra margin withheld from device 0 when a draft model shares it; the
/// draft's activations transiently live there.
pub const DRAFT_FIRST_DEVICE_RESERVE_BYTES: u64 = 96 * 1024 * 1024;

const BYTES_PER_GB: f64 = (1024u64 * 1024 * 1024) as f64;

/// Placement strategy selected by a model config. The three are mutually
/// exclusive; tensor-parallel wins over the split fields.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitStrategy {
    TensorParallel,
    /// Per-device allocations in GB, taken at face value.
    Manual(Vec<f32>),
    Auto,
}

impl SplitStrategy {
    pub fn derive(
        tensor_parallel: bool,
        gpu_split_auto: bool,
        gpu_split: &str,
    ) -> Result<SplitStrategy, PlacementError> {
        if tensor_parallel {
            return Ok(SplitStrategy::TensorParallel);
        }
        if gpu_split_auto {
            return Ok(SplitStrategy::Auto);
        }
        if gpu_split.trim().is_empty() {
            return Err(PlacementError::InvalidSelection(
                "manual split selected but no allocations given".to_string(),
            ));
        }
        let mut allocations = Vec::new();
        for part in gpu_split.split(',') {
            match part.trim().parse::<f32>() {
                Ok(gb) => allocations.push(gb),
                Err(_) => {
                    return Err(PlacementError::InvalidSelection(format!(
                        "bad split allocation: {}",
                        part.trim()
                    )));
                }
            }
        }
        Ok(SplitStrategy::Manual(allocations))
    }
}

/// Where the load may put things. Budgets are upper bounds; under Auto the
/// actual assignment is discovered module-by-module against them.
#[derive(Debug, Clone, PartialEq)]
pub enum PlacementPlan {
    /// Shard model and cache across every visible device, no budgets.
    TensorParallel,
    /// Ordered per-device byte budgets.
    PerDevice(Vec<u64>),
}

#[derive(Debug, Error, PartialEq)]
pub enum PlacementError {
    #[error("insufficient device memory")]
    InsufficientMemory,
    #[error("invalid split selection: {0}")]
    InvalidSelection(String),
}

/// Compute a placement plan. Only Auto consults the oracle; it fails before
/// any engine call when no device keeps a positive budget after reserves.
pub async fn plan(
    strategy: &SplitStrategy,
    oracle: &dyn DeviceMemoryOracle,
    draft_resident: bool,
) -> Result<PlacementPlan, PlacementError> {
    match strategy {
        SplitStrategy::TensorParallel => Ok(PlacementPlan::TensorParallel),
        SplitStrategy::Manual(allocations) => Ok(PlacementPlan::PerDevice(
            allocations.iter().map(|gb| (*gb as f64 * BYTES_PER_GB) as u64).collect(),
        )),
        SplitStrategy::Auto => {
            let budgets = auto_budgets(&oracle.snapshot().await, draft_resident);
            if budgets.iter().all(|b| *b == 0) {
                return Err(PlacementError::InsufficientMemory);
            }
            Ok(PlacementPlan::PerDevice(budgets))
        }
    }
}

fn auto_budgets(free: &[u64], draft_resident: bool) -> Vec<u64> {
    free.iter()
        .enumerate()
        .map(|(device, free)| {
            let mut reserve = AUTO_SPLIT_RESERVE_BYTES;
            if device == 0 && draft_resident {
                reserve += DRAFT_FIRST_DEVICE_RESERVE_BYTES;
            }
            free.saturating_sub(reserve)
        })
        .collect()
}

/// Incremental budget consumption during an auto-split load: each module
/// lands on the lowest-indexed device that still fits it, and the fill
/// never moves back to an earlier device.
pub struct BudgetLedger {
    remaining: Vec<u64>,
    cursor: usize,
}

impl BudgetLedger {
    pub fn new(budgets: &[u64]) -> Self {
        Self { remaining: budgets.to_vec(), cursor: 0 }
    }

    /// Charge `bytes` and return the device it landed on.
    pub fn assign(&mut self, bytes: u64) -> Result<usize, PlacementError> {
        while self.cursor < self.remaining.len() {
            if self.remaining[self.cursor] >= bytes {
                self.remaining[self.cursor] -= bytes;
                return Ok(self.cursor);
            }
            self.cursor += 1;
        }
        Err(PlacementError::InsufficientMemory)
    }

    pub fn remaining(&self, device: usize) -> u64 {
        self.remaining.get(device).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::device_memory::FixedOracle;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_derive_tensor_parallel_wins() {
        let strategy = SplitStrategy::derive(true, false, "10,24").unwrap();
        assert_eq!(strategy, SplitStrategy::TensorParallel);
    }

    #[test]
    fn test_derive_auto_and_manual() {
        assert_eq!(SplitStrategy::derive(false, true, "").unwrap(), SplitStrategy::Auto);
        assert_eq!(
            SplitStrategy::derive(false, false, "10, 22.5").unwrap(),
            SplitStrategy::Manual(vec![10.0, 22.5])
        );
    }

    #[test]
    fn test_derive_rejects_bad_selections() {
        assert!(matches!(
            SplitStrategy::derive(false, false, "  "),
            Err(PlacementError::InvalidSelection(_))
        ));
        assert!(matches!(
            SplitStrategy::derive(false, false, "10,two"),
            Err(PlacementError::InvalidSelection(_))
        ));
    }

    #[tokio::test]
    async fn test_plan_manual_takes_allocations_at_face_value() {
        let oracle = FixedOracle::new(vec![]);
        let plan = plan(&SplitStrategy::Manual(vec![2.0, 0.5]), &oracle, false).await.unwrap();
        assert_eq!(plan, PlacementPlan::PerDevice(vec![2048 * MIB, 512 * MIB]));
    }

    #[tokio::test]
    async fn test_plan_auto_subtracts_reserves() {
        let oracle = FixedOracle::from_mib(&[8192, 4096]);
        let plan = plan(&SplitStrategy::Auto, &oracle, false).await.unwrap();
        assert_eq!(plan, PlacementPlan::PerDevice(vec![7680 * MIB, 3584 * MIB]));

        let plan = super::plan(&SplitStrategy::Auto, &oracle, true).await.unwrap();
        assert_eq!(
            plan,
            PlacementPlan::PerDevice(vec![7584 * MIB, 3584 * MIB]),
            "draft residency reserves another 96 MiB on device 0 only"
        );
    }

    #[tokio::test]
    async fn test_plan_auto_without_positive_budget_is_resource_error() {
        // 512 MiB and less disappear entirely into the reserve.
        let oracle = FixedOracle::from_mib(&[512, 100]);
        let result = plan(&SplitStrategy::Auto, &oracle, false).await;
        assert_eq!(result.unwrap_err(), PlacementError::InsufficientMemory);

        let no_devices = FixedOracle::new(vec![]);
        let result = plan(&SplitStrategy::Auto, &no_devices, false).await;
        assert_eq!(result.unwrap_err(), PlacementError::InsufficientMemory);
    }

    #[test]
    fn test_ledger_fills_lowest_device_first_and_spills() {
        let mut ledger = BudgetLedger::new(&[10, 7]);
        assert_eq!(ledger.assign(4).unwrap(), 0);
        assert_eq!(ledger.assign(4).unwrap(), 0);
        // 2 left on device 0: a 3-byte module spills to device 1.
        assert_eq!(ledger.assign(3).unwrap(), 1);
        assert_eq!(ledger.remaining(0), 2);
        assert_eq!(ledger.remaining(1), 4);
        // The fill never moves back even though device 0 could hold this.
        assert_eq!(ledger.assign(2).unwrap(), 1);
    }

    #[test]
    fn test_ledger_exhaustion() {
        let mut ledger = BudgetLedger::new(&[5]);
        assert_eq!(ledger.assign(5).unwrap(), 0);
        assert_eq!(ledger.assign(1).unwrap_err(), PlacementError::InsufficientMemory);
    }
}
