//! Per-instrument executor.
//!
//! Each instrument gets one tokio task that owns its slots and its strategy.
//! Everything that touches them (gateway events, timeout re-checks, strategy
//! timers, rate-controller restore callbacks, ad-hoc tasks) is posted to the
//! task's channel and handled strictly one message at a time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use optx_core::{
    InstrumentId, OrderAction, Scheduler, SlotId, StrategyKind, TimerHandle, TransactionId,
    TransactionIdGenerator, TransactionType,
};
use optx_throttle::{AdmitRequest, RestoreAction, TransactionRateController};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutionError, ExecutionResult};
use crate::gateway::{DynGateway, GatewayEvent};
use crate::slot::{OrderSlot, RecheckSink, SlotConfig, SlotEvent, SlotServices};
use crate::strategy::Strategy;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// After a stop request, slots still busy after this long are force reset.
    #[serde(default = "default_force_stop_timeout_ms")]
    pub force_stop_timeout_ms: u64,
    #[serde(default)]
    pub slot: SlotConfig,
}

fn default_force_stop_timeout_ms() -> u64 {
    10_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            force_stop_timeout_ms: default_force_stop_timeout_ms(),
            slot: SlotConfig::default(),
        }
    }
}

/// Process-wide collaborators handed to every executor.
#[derive(Clone)]
pub struct ExecutorServices {
    pub gateway: DynGateway,
    pub scheduler: Arc<dyn Scheduler>,
    pub ids: Arc<TransactionIdGenerator>,
    pub controller: TransactionRateController,
}

// ============================================================================
// Messages and handle
// ============================================================================

pub type ContextTask = Box<dyn FnOnce(&mut InstrumentContext) + Send + 'static>;

pub enum InstrumentMessage {
    Gateway(GatewayEvent),
    TimeoutRecheck { slot: SlotId, txid: TransactionId },
    /// Run a closure with the context on the executor.
    Task(ContextTask),
    StrategyTimer { token: u64 },
    /// Rate controller restore callback; delivered even while stopping.
    Restore { token: u64 },
    Stop,
    ForceStop,
}

impl fmt::Debug for InstrumentMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gateway(event) => f.debug_tuple("Gateway").field(event).finish(),
            Self::TimeoutRecheck { slot, txid } => f
                .debug_struct("TimeoutRecheck")
                .field("slot", slot)
                .field("txid", txid)
                .finish(),
            Self::Task(_) => f.write_str("Task"),
            Self::StrategyTimer { token } => {
                f.debug_struct("StrategyTimer").field("token", token).finish()
            }
            Self::Restore { token } => f.debug_struct("Restore").field("token", token).finish(),
            Self::Stop => f.write_str("Stop"),
            Self::ForceStop => f.write_str("ForceStop"),
        }
    }
}

/// Sending side of an executor's channel.
#[derive(Debug, Clone)]
pub struct InstrumentHandle {
    instrument: InstrumentId,
    tx: mpsc::UnboundedSender<InstrumentMessage>,
}

impl InstrumentHandle {
    pub fn channel(
        instrument: InstrumentId,
    ) -> (Self, mpsc::UnboundedReceiver<InstrumentMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { instrument, tx }, rx)
    }

    pub fn instrument(&self) -> &InstrumentId {
        &self.instrument
    }

    pub fn post_message(&self, message: InstrumentMessage) -> ExecutionResult<()> {
        self.tx
            .send(message)
            .map_err(|_| ExecutionError::ExecutorClosed(self.instrument.clone()))
    }

    /// Run `f` on the executor.
    pub fn post<F>(&self, f: F) -> ExecutionResult<()>
    where
        F: FnOnce(&mut InstrumentContext) + Send + 'static,
    {
        self.post_message(InstrumentMessage::Task(Box::new(f)))
    }

    /// Ask the executor to stop gracefully.
    pub fn stop(&self) -> ExecutionResult<()> {
        self.post_message(InstrumentMessage::Stop)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn post_or_log(&self, message: InstrumentMessage) {
        if let Err(e) = self.post_message(message) {
            debug!(error = %e, "Message dropped");
        }
    }
}

impl RecheckSink for InstrumentHandle {
    fn post_recheck(&self, slot: SlotId, txid: TransactionId) {
        self.post_or_log(InstrumentMessage::TimeoutRecheck { slot, txid });
    }
}

// ============================================================================
// Context
// ============================================================================

/// What a strategy sees of its instrument.
pub struct InstrumentContext {
    instrument: InstrumentId,
    kind: StrategyKind,
    slots: Vec<OrderSlot>,
    slot_services: SlotServices,
    slot_config: SlotConfig,
    controller: TransactionRateController,
    scheduler: Arc<dyn Scheduler>,
    handle: InstrumentHandle,
    timers: Vec<TimerHandle>,
    stopping: bool,
}

impl InstrumentContext {
    pub(crate) fn new(
        handle: InstrumentHandle,
        kind: StrategyKind,
        services: ExecutorServices,
        slot_config: SlotConfig,
    ) -> Self {
        let slot_services = SlotServices {
            gateway: services.gateway,
            scheduler: services.scheduler.clone(),
            ids: services.ids,
            recheck: Arc::new(handle.clone()),
        };
        Self {
            instrument: handle.instrument().clone(),
            kind,
            slots: Vec::new(),
            slot_services,
            slot_config,
            controller: services.controller,
            scheduler: services.scheduler,
            handle,
            timers: Vec::new(),
            stopping: false,
        }
    }

    pub fn instrument(&self) -> &InstrumentId {
        &self.instrument
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn now_ms(&self) -> u64 {
        self.scheduler.now_ms()
    }

    pub fn handle(&self) -> &InstrumentHandle {
        &self.handle
    }

    pub fn controller(&self) -> &TransactionRateController {
        &self.controller
    }

    // ------------------------------------------------------------------------
    // Slots
    // ------------------------------------------------------------------------

    pub fn add_slot(&mut self) -> SlotId {
        let id = SlotId::new(self.slots.len() as u32);
        self.slots.push(OrderSlot::new(
            id,
            self.instrument.clone(),
            self.slot_config.clone(),
            self.slot_services.clone(),
        ));
        debug!(instrument = %self.instrument, slot = %id, "Slot added");
        id
    }

    pub fn slots(&self) -> &[OrderSlot] {
        &self.slots
    }

    pub fn slot(&self, id: SlotId) -> ExecutionResult<&OrderSlot> {
        self.slots
            .get(id.index())
            .ok_or_else(|| self.unknown_slot(id))
    }

    pub fn slot_mut(&mut self, id: SlotId) -> ExecutionResult<&mut OrderSlot> {
        let err = self.unknown_slot(id);
        self.slots.get_mut(id.index()).ok_or(err)
    }

    /// Borrow two different slots mutably at once.
    pub fn slot_pair_mut(
        &mut self,
        first: SlotId,
        second: SlotId,
    ) -> ExecutionResult<(&mut OrderSlot, &mut OrderSlot)> {
        if first == second {
            return Err(ExecutionError::SameSlot(first));
        }
        for id in [first, second] {
            if id.index() >= self.slots.len() {
                return Err(self.unknown_slot(id));
            }
        }

        let (i, j) = (first.index(), second.index());
        if i < j {
            let (left, right) = self.slots.split_at_mut(j);
            Ok((&mut left[i], &mut right[0]))
        } else {
            let (left, right) = self.slots.split_at_mut(i);
            Ok((&mut right[0], &mut left[j]))
        }
    }

    /// Move the live orders of two slots in one gateway batch.
    pub fn move_pair(
        &mut self,
        first: SlotId,
        first_action: OrderAction,
        second: SlotId,
        second_action: OrderAction,
    ) -> ExecutionResult<(TransactionId, TransactionId)> {
        let (a, b) = self.slot_pair_mut(first, second)?;
        Ok(OrderSlot::move_pair(a, first_action, b, second_action)?)
    }

    pub fn all_inactive(&self) -> bool {
        self.slots.iter().all(OrderSlot::is_inactive)
    }

    pub fn force_reset_all(&mut self) {
        for slot in &mut self.slots {
            slot.force_reset();
        }
    }

    pub(crate) fn drain_events(&mut self) -> Vec<SlotEvent> {
        self.slots
            .iter_mut()
            .flat_map(OrderSlot::take_events)
            .collect()
    }

    fn unknown_slot(&self, slot: SlotId) -> ExecutionError {
        ExecutionError::UnknownSlot {
            instrument: self.instrument.clone(),
            slot,
        }
    }

    // ------------------------------------------------------------------------
    // Rate control and timers
    // ------------------------------------------------------------------------

    /// Ask the rate controller for one transaction.
    ///
    /// With `restore_token`, a rejection during the hard limit registers a
    /// restore callback that comes back as `on_timer(restore_token)`.
    pub fn try_admit(
        &self,
        tx_type: TransactionType,
        use_reserve: bool,
        restore_token: Option<u64>,
    ) -> bool {
        let mut request = AdmitRequest::new(self.instrument.clone(), self.kind, tx_type);
        if use_reserve {
            request = request.with_reserve();
        }
        let on_restore = restore_token.map(|token| {
            let handle = self.handle.clone();
            Box::new(move || handle.post_or_log(InstrumentMessage::Restore { token }))
                as RestoreAction
        });
        self.controller.try_admit(request, on_restore)
    }

    pub fn can_trade(&self) -> bool {
        self.controller.can_trade(Some(self.kind))
    }

    /// Deliver `on_timer(token)` after `delay`.
    pub fn schedule_timer(&mut self, delay: Duration, token: u64) -> TimerHandle {
        let handle = self.handle.clone();
        let timer = self.scheduler.schedule(
            delay,
            Box::new(move || handle.post_or_log(InstrumentMessage::StrategyTimer { token })),
        );
        self.timers.retain(TimerHandle::is_pending);
        self.timers.push(timer.clone());
        timer
    }

    fn cancel_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.cancel();
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

pub struct InstrumentExecutor {
    ctx: InstrumentContext,
    strategy: Box<dyn Strategy>,
    rx: mpsc::UnboundedReceiver<InstrumentMessage>,
    config: ExecutorConfig,
    force_stop_timer: Option<TimerHandle>,
}

impl InstrumentExecutor {
    pub fn new<S: Strategy>(
        instrument: InstrumentId,
        strategy: S,
        services: ExecutorServices,
        config: ExecutorConfig,
    ) -> (Self, InstrumentHandle) {
        let (handle, rx) = InstrumentHandle::channel(instrument);
        let ctx = InstrumentContext::new(
            handle.clone(),
            strategy.kind(),
            services,
            config.slot.clone(),
        );
        let executor = Self {
            ctx,
            strategy: Box::new(strategy),
            rx,
            config,
            force_stop_timer: None,
        };
        (executor, handle)
    }

    /// Create an executor and run it on the current tokio runtime.
    pub fn spawn<S: Strategy>(
        instrument: InstrumentId,
        strategy: S,
        services: ExecutorServices,
        config: ExecutorConfig,
    ) -> (InstrumentHandle, JoinHandle<()>) {
        let (executor, handle) = Self::new(instrument, strategy, services, config);
        let join = tokio::spawn(executor.run());
        (handle, join)
    }

    pub async fn run(mut self) {
        let instrument = self.ctx.instrument.clone();
        self.ctx.controller.register_strategy(self.ctx.kind);
        info!(instrument = %instrument, kind = %self.ctx.kind, "Instrument executor started");

        self.strategy.on_start(&mut self.ctx);
        self.dispatch();

        while let Some(message) = self.rx.recv().await {
            if !self.handle_message(message) {
                break;
            }
            self.dispatch();
            if self.ctx.stopping && self.ctx.all_inactive() {
                info!(instrument = %instrument, "All slots inactive");
                break;
            }
        }

        self.shutdown();
    }

    /// Returns false when the executor must exit immediately.
    fn handle_message(&mut self, message: InstrumentMessage) -> bool {
        match message {
            InstrumentMessage::Gateway(event) => {
                match self.ctx.slots.get_mut(event.route.slot.index()) {
                    Some(slot) => slot.handle_event(event.txid, event.kind),
                    None => warn!(
                        route = %event.route,
                        txid = %event.txid,
                        "Gateway event for unknown slot"
                    ),
                }
            }
            InstrumentMessage::TimeoutRecheck { slot, txid } => {
                if let Some(slot) = self.ctx.slots.get_mut(slot.index()) {
                    slot.on_timeout_recheck(txid);
                }
            }
            InstrumentMessage::Task(task) => task(&mut self.ctx),
            InstrumentMessage::StrategyTimer { token } => {
                if !self.ctx.stopping {
                    self.strategy.on_timer(&mut self.ctx, token);
                }
            }
            // A stop-time cancel rejected by the controller is retried from here.
            InstrumentMessage::Restore { token } => self.strategy.on_timer(&mut self.ctx, token),
            InstrumentMessage::Stop => self.begin_stop("requested"),
            InstrumentMessage::ForceStop => {
                let busy = self.ctx.slots.iter().filter(|s| !s.is_inactive()).count();
                warn!(
                    instrument = %self.ctx.instrument,
                    busy_slots = busy,
                    timeout_ms = self.config.force_stop_timeout_ms,
                    "Force stop, abandoning in-flight orders"
                );
                self.ctx.force_reset_all();
                // Drained so nothing is delivered after on_stop.
                self.ctx.drain_events();
                return false;
            }
        }
        true
    }

    /// Deliver queued slot events until none are left.
    fn dispatch(&mut self) {
        loop {
            let events = self.ctx.drain_events();
            if events.is_empty() {
                break;
            }
            for event in &events {
                self.strategy.on_slot_event(&mut self.ctx, event);
                if let SlotEvent::FatalError { slot, reason, .. } = event {
                    error!(
                        instrument = %self.ctx.instrument,
                        slot = %slot,
                        reason = %reason,
                        "Fatal slot error, halting strategy"
                    );
                    self.begin_stop("fatal");
                }
            }
        }
    }

    fn begin_stop(&mut self, reason: &'static str) {
        if self.ctx.stopping {
            return;
        }
        self.ctx.stopping = true;
        info!(instrument = %self.ctx.instrument, reason, "Stopping instrument executor");

        self.ctx.cancel_timers();
        self.strategy.on_stop(&mut self.ctx);
        self.ctx.controller.deregister_strategy(self.ctx.kind);

        let handle = self.ctx.handle.clone();
        self.force_stop_timer = Some(self.ctx.scheduler.schedule(
            Duration::from_millis(self.config.force_stop_timeout_ms),
            Box::new(move || handle.post_or_log(InstrumentMessage::ForceStop)),
        ));
    }

    fn shutdown(&mut self) {
        if let Some(timer) = self.force_stop_timer.take() {
            timer.cancel();
        }
        self.ctx.cancel_timers();
        if !self.ctx.stopping {
            self.ctx.controller.deregister_strategy(self.ctx.kind);
        }
        self.rx.close();
        info!(instrument = %self.ctx.instrument, "Instrument executor stopped");
    }
}
