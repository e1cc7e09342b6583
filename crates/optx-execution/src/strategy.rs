//! Strategy callbacks driven by an instrument executor.

use optx_core::StrategyKind;

use crate::executor::InstrumentContext;
use crate::slot::SlotEvent;

/// Quoting logic bound to one instrument.
///
/// All callbacks run on the instrument's executor task, one at a time, with
/// exclusive access to the instrument's slots through the context.
pub trait Strategy: Send + 'static {
    fn kind(&self) -> StrategyKind;

    fn on_start(&mut self, ctx: &mut InstrumentContext);

    fn on_slot_event(&mut self, ctx: &mut InstrumentContext, event: &SlotEvent);

    /// Timer scheduled with [`InstrumentContext::schedule_timer`] fired, or a
    /// rate-controller restore callback carrying `token` ran. Restore
    /// callbacks are still delivered after `on_stop`; plain timers are not.
    fn on_timer(&mut self, _ctx: &mut InstrumentContext, _token: u64) {}

    /// Executor is stopping: cancel what is live. Slot events keep arriving
    /// until every slot is inactive or the force-stop timeout elapses.
    fn on_stop(&mut self, ctx: &mut InstrumentContext);
}
