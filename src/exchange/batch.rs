use std::fmt;

use crate::error::{PoolError, PoolResult};

/// Batch status. The numeric value is what the ledger stores and the order
/// is the only order a batch may move in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum BatchStatus {
    Inactive = 0,
    DepositsActive = 1,
    DepositsRegistered = 2,
    DepositsComplete = 3,
    TradesInactive = 4,
    TradesActiveStageOne = 5,
    TradesCompleteStageOne = 6,
    TradesActiveStageTwo = 7,
    TradesCompleteStageTwo = 8,
    WithdrawalsActive = 9,
    WithdrawalsComplete = 10,
    Complete = 11,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 12] = [
        BatchStatus::Inactive,
        BatchStatus::DepositsActive,
        BatchStatus::DepositsRegistered,
        BatchStatus::DepositsComplete,
        BatchStatus::TradesInactive,
        BatchStatus::TradesActiveStageOne,
        BatchStatus::TradesCompleteStageOne,
        BatchStatus::TradesActiveStageTwo,
        BatchStatus::TradesCompleteStageTwo,
        BatchStatus::WithdrawalsActive,
        BatchStatus::WithdrawalsComplete,
        BatchStatus::Complete,
    ];

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(raw: i32) -> PoolResult<Self> {
        BatchStatus::ALL
            .iter()
            .copied()
            .find(|s| s.as_i32() == raw)
            .ok_or_else(|| PoolError::invalid(format!("unknown batch status {}", raw)))
    }

    pub fn is_active(self) -> bool {
        self != BatchStatus::Complete
    }

    /// Status after a trade stage (1 or 2) has all its orders placed.
    pub fn stage_active(stage: i32) -> PoolResult<Self> {
        match stage {
            1 => Ok(BatchStatus::TradesActiveStageOne),
            2 => Ok(BatchStatus::TradesActiveStageTwo),
            _ => Err(PoolError::invalid(format!("unsupported trade stage {}", stage))),
        }
    }

    pub fn stage_complete(stage: i32) -> PoolResult<Self> {
        match stage {
            1 => Ok(BatchStatus::TradesCompleteStageOne),
            2 => Ok(BatchStatus::TradesCompleteStageTwo),
            _ => Err(PoolError::invalid(format!("unsupported trade stage {}", stage))),
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchStatus::Inactive => "INACTIVE",
            BatchStatus::DepositsActive => "DEPOSITS_ACTIVE",
            BatchStatus::DepositsRegistered => "DEPOSITS_REGISTERED",
            BatchStatus::DepositsComplete => "DEPOSITS_COMPLETE",
            BatchStatus::TradesInactive => "TRADES_INACTIVE",
            BatchStatus::TradesActiveStageOne => "TRADES_ACTIVE_STAGE_ONE",
            BatchStatus::TradesCompleteStageOne => "TRADES_COMPLETE_STAGE_ONE",
            BatchStatus::TradesActiveStageTwo => "TRADES_ACTIVE_STAGE_TWO",
            BatchStatus::TradesCompleteStageTwo => "TRADES_COMPLETE_STAGE_TWO",
            BatchStatus::WithdrawalsActive => "WITHDRAWALS_ACTIVE",
            BatchStatus::WithdrawalsComplete => "WITHDRAWALS_COMPLETE",
            BatchStatus::Complete => "COMPLETE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_totally_ordered() {
        for pair in BatchStatus::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[1].as_i32(), pair[0].as_i32() + 1);
        }
        assert_eq!(BatchStatus::from_i32(8).unwrap(), BatchStatus::TradesCompleteStageTwo);
        assert!(BatchStatus::from_i32(12).is_err());
        assert!(!BatchStatus::Complete.is_active());
    }

    #[test]
    fn stage_lookup() {
        assert_eq!(BatchStatus::stage_active(2).unwrap(), BatchStatus::TradesActiveStageTwo);
        assert_eq!(BatchStatus::stage_complete(1).unwrap(), BatchStatus::TradesCompleteStageOne);
        assert!(BatchStatus::stage_active(3).is_err());
    }
}
