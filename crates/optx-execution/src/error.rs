//! Execution error types.

use optx_core::{InstrumentId, SlotId};
use thiserror::Error;

use crate::slot::SlotStatus;

/// Order slot precondition violations.
#[derive(Debug, Error)]
pub enum SlotError {
    #[error("{op} not allowed on {slot} in state {state}")]
    InvalidState {
        slot: SlotId,
        op: &'static str,
        state: SlotStatus,
    },

    #[error("move_pair requires both slots active (got {first}, {second})")]
    PairNotActive { first: SlotStatus, second: SlotStatus },
}

pub type SlotResult<T> = Result<T, SlotError>;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error("Unknown slot {slot} on {instrument}")]
    UnknownSlot {
        instrument: InstrumentId,
        slot: SlotId,
    },

    #[error("Slot pair must be two different slots, got {0} twice")]
    SameSlot(SlotId),

    #[error("No executor registered for {0}")]
    UnknownInstrument(InstrumentId),

    #[error("Executor for {0} has stopped")]
    ExecutorClosed(InstrumentId),
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;
