//! Order execution for optx.
//!
//! - [`OrderSlot`]: dual-order lifecycle state machine turning desired quotes
//!   into New/Move/Cancel requests
//! - [`InstrumentExecutor`]: single-consumer task that owns an instrument's
//!   slots and its [`Strategy`]
//! - [`GatewayRouter`]: fans gateway events out to the owning executor
//! - [`Gateway`]: exchange adapter contract, plus [`RecordingGateway`] for tests

pub mod error;
pub mod executor;
pub mod gateway;
pub mod order;
pub mod router;
pub mod slot;
pub mod strategy;

pub use error::{ExecutionError, ExecutionResult, SlotError, SlotResult};
pub use executor::{
    ExecutorConfig, ExecutorServices, InstrumentContext, InstrumentExecutor, InstrumentHandle,
    InstrumentMessage,
};
pub use gateway::{
    DynGateway, EventSink, Gateway, GatewayCall, GatewayEvent, MoveLeg, OrderEventKind,
    OrderTicket, RecordingGateway,
};
pub use order::{DoneKind, LogicalOrder, OrderLifecycle};
pub use router::GatewayRouter;
pub use slot::{
    OrderSlot, RecheckSink, SlotConfig, SlotEvent, SlotServices, SlotStatus, StateChangeReason,
};
pub use strategy::Strategy;
