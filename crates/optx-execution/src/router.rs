//! Routes gateway callbacks to the owning instrument executor.

use dashmap::DashMap;
use std::time::Duration;

use optx_core::InstrumentId;
use optx_throttle::TransactionRateController;
use tracing::{debug, warn};

use crate::error::{ExecutionError, ExecutionResult};
use crate::executor::{InstrumentHandle, InstrumentMessage};
use crate::gateway::{EventSink, GatewayEvent};

/// Event sink shared by gateway adapters.
///
/// Exchange-reported transaction limit violations are forwarded to the rate
/// controller before the event itself is routed.
pub struct GatewayRouter {
    executors: DashMap<InstrumentId, InstrumentHandle>,
    controller: TransactionRateController,
}

impl GatewayRouter {
    pub fn new(controller: TransactionRateController) -> Self {
        Self {
            executors: DashMap::new(),
            controller,
        }
    }

    pub fn register(&self, handle: InstrumentHandle) {
        let instrument = handle.instrument().clone();
        if self.executors.insert(instrument.clone(), handle).is_some() {
            warn!(instrument = %instrument, "Executor replaced in router");
        }
    }

    pub fn deregister(&self, instrument: &InstrumentId) -> Option<InstrumentHandle> {
        self.executors.remove(instrument).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn route(&self, event: GatewayEvent) -> ExecutionResult<()> {
        // Clone out of the map so no shard lock is held while sending.
        let handle = self
            .executors
            .get(&event.route.instrument)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ExecutionError::UnknownInstrument(event.route.instrument.clone()))?;
        handle.post_message(InstrumentMessage::Gateway(event))
    }
}

impl EventSink for GatewayRouter {
    fn deliver(&self, event: GatewayEvent) {
        if let Some(fail) = event.kind.fail() {
            if fail.is_transaction_limit() {
                warn!(
                    route = %event.route,
                    txid = %event.txid,
                    penalty = ?fail.penalty_remaining(),
                    "Exchange rejected order for transaction limit"
                );
                self.controller.on_exchange_penalty(fail.penalty_remaining());
            }
        }

        let (route, txid) = (event.route.clone(), event.txid);
        match self.route(event) {
            Ok(()) => debug!(route = %route, txid = %txid, "Gateway event routed"),
            Err(e) => warn!(route = %route, txid = %txid, error = %e, "Gateway event dropped"),
        }
    }

    fn rate_violation(&self, penalty: Option<Duration>) {
        warn!(penalty = ?penalty, "Session rate violation reported");
        self.controller.on_exchange_penalty(penalty);
    }
}
