//! Static two-sided quoter.
//!
//! Keeps one bid and one ask around a reference price that walks a fixed
//! tick cycle, so every refresh produces a move. Used to drive the engine
//! against the paper gateway.

use std::time::Duration;

use optx_core::{
    CoreError, Direction, OrderAction, Price, SlotId, StrategyKind, TimerHandle, TransactionType,
    Volume,
};
use optx_execution::{InstrumentContext, SlotEvent, Strategy};
use tracing::{debug, error, info, warn};

use crate::config::InstrumentConfig;

/// Periodic refresh.
pub const TOKEN_REQUOTE: u64 = 1;
/// Rate controller left the hard limit.
pub const TOKEN_RESTORE: u64 = 2;
/// Retry a stop-time cancel the controller refused.
pub const TOKEN_FLATTEN: u64 = 3;

/// Mid offsets in ticks, one per refresh.
const OFFSET_CYCLE: [i64; 8] = [0, 1, 2, 1, 0, -1, -2, -1];

struct Side {
    slot: SlotId,
    direction: Direction,
}

pub struct StaticQuoter {
    config: InstrumentConfig,
    bid: Option<Side>,
    ask: Option<Side>,
    step: usize,
    requote_timer: Option<TimerHandle>,
}

impl StaticQuoter {
    #[must_use]
    pub fn new(config: InstrumentConfig) -> Self {
        Self {
            config,
            bid: None,
            ask: None,
            step: 0,
            requote_timer: None,
        }
    }

    /// Bid and ask for the current step.
    pub fn targets(&self) -> Result<(OrderAction, OrderAction), CoreError> {
        let tick = Price::new(self.config.tick_size);
        let offset = OFFSET_CYCLE[self.step % OFFSET_CYCLE.len()];
        let mid = Price::new(self.config.reference_price).offset_ticks(tick, offset);
        let volume = Volume::new(self.config.volume);

        let bid = Price::new(mid.inner() - self.config.half_spread).round_to_tick(tick);
        let ask_raw = mid.inner() + self.config.half_spread;
        // Round the ask up so the spread never narrows below the configured one.
        let ask = Price::new(ask_raw).round_to_tick(tick);
        let ask = if ask.inner() < ask_raw {
            ask.offset_ticks(tick, 1)
        } else {
            ask
        };

        Ok((
            OrderAction::new(Direction::Buy, bid, volume)?,
            OrderAction::new(Direction::Sell, ask, volume)?,
        ))
    }

    fn requote(&mut self, ctx: &mut InstrumentContext) {
        if ctx.is_stopping() {
            return;
        }
        let (Some(bid), Some(ask)) = (&self.bid, &self.ask) else {
            return;
        };
        let (bid_slot, ask_slot) = (bid.slot, ask.slot);

        let (bid_action, ask_action) = match self.targets() {
            Ok(targets) => targets,
            Err(e) => {
                error!(instrument = %ctx.instrument(), error = %e, "Invalid quote");
                return;
            }
        };

        let bid_moves = needs_move(ctx, bid_slot, &bid_action);
        let ask_moves = needs_move(ctx, ask_slot, &ask_action);

        if bid_moves && ask_moves {
            if !ctx.try_admit(TransactionType::Move, false, Some(TOKEN_RESTORE)) {
                return;
            }
            if ctx.try_admit(TransactionType::Move, false, Some(TOKEN_RESTORE)) {
                match ctx.move_pair(bid_slot, bid_action, ask_slot, ask_action) {
                    Ok((bid_txid, ask_txid)) => {
                        debug!(
                            instrument = %ctx.instrument(),
                            bid = %bid_action.price,
                            ask = %ask_action.price,
                            bid_txid = %bid_txid,
                            ask_txid = %ask_txid,
                            "Requoted both sides"
                        );
                    }
                    Err(e) => warn!(instrument = %ctx.instrument(), error = %e, "Move pair failed"),
                }
            } else {
                // Only one transaction left: move the bid alone.
                move_side(ctx, bid_slot, bid_action);
            }
            return;
        }

        quote_side(ctx, bid_slot, bid_action);
        quote_side(ctx, ask_slot, ask_action);
    }

    /// Cancel whatever can be cancelled, using the reserve.
    fn flatten(&mut self, ctx: &mut InstrumentContext) {
        let slots: Vec<SlotId> = [&self.bid, &self.ask]
            .into_iter()
            .flatten()
            .map(|side| side.slot)
            .collect();

        for slot in slots {
            let cancelable = ctx.slot(slot).is_ok_and(|s| s.can_cancel());
            if !cancelable {
                continue;
            }
            if !ctx.try_admit(TransactionType::Cancel, true, Some(TOKEN_FLATTEN)) {
                warn!(
                    instrument = %ctx.instrument(),
                    slot = %slot,
                    "Cancel not admitted, retrying on restore"
                );
                continue;
            }
            if let Err(e) = ctx.slot_mut(slot).and_then(|s| Ok(s.cancel()?)) {
                warn!(instrument = %ctx.instrument(), slot = %slot, error = %e, "Cancel failed");
            }
        }
    }

    fn schedule_requote(&mut self, ctx: &mut InstrumentContext) {
        let delay = Duration::from_millis(self.config.requote_interval_ms);
        self.requote_timer = Some(ctx.schedule_timer(delay, TOKEN_REQUOTE));
    }
}

fn quote_side(ctx: &mut InstrumentContext, slot: SlotId, action: OrderAction) {
    let Ok(state) = ctx.slot(slot) else {
        return;
    };

    if state.is_inactive() {
        if ctx.try_admit(TransactionType::NewOrder, false, Some(TOKEN_RESTORE)) {
            if let Err(e) = ctx.slot_mut(slot).and_then(|s| Ok(s.send_new(action)?)) {
                warn!(instrument = %ctx.instrument(), slot = %slot, error = %e, "New order failed");
            }
        }
    } else if needs_move(ctx, slot, &action)
        && ctx.try_admit(TransactionType::Move, false, Some(TOKEN_RESTORE))
    {
        move_side(ctx, slot, action);
    }
}

/// Issue a move already admitted by the caller.
fn move_side(ctx: &mut InstrumentContext, slot: SlotId, action: OrderAction) {
    if let Err(e) = ctx.slot_mut(slot).and_then(|s| Ok(s.move_to(action)?)) {
        warn!(instrument = %ctx.instrument(), slot = %slot, error = %e, "Move failed");
    }
}

/// Live order priced away from the target; in-flight slots are left alone.
fn needs_move(ctx: &InstrumentContext, slot: SlotId, action: &OrderAction) -> bool {
    ctx.slot(slot).is_ok_and(|s| {
        s.is_active()
            && !s.cancel_requested()
            && s.current().is_some_and(|order| order.price() != action.price)
    })
}

impl Strategy for StaticQuoter {
    fn kind(&self) -> StrategyKind {
        self.config.kind
    }

    fn on_start(&mut self, ctx: &mut InstrumentContext) {
        self.bid = Some(Side {
            slot: ctx.add_slot(),
            direction: Direction::Buy,
        });
        self.ask = Some(Side {
            slot: ctx.add_slot(),
            direction: Direction::Sell,
        });
        info!(
            instrument = %ctx.instrument(),
            reference_price = %self.config.reference_price,
            half_spread = %self.config.half_spread,
            "Quoter started"
        );
        self.requote(ctx);
        self.schedule_requote(ctx);
    }

    fn on_slot_event(&mut self, ctx: &mut InstrumentContext, event: &SlotEvent) {
        match event {
            SlotEvent::NotEnoughMoney { slot, txid } => {
                let side = [&self.bid, &self.ask]
                    .into_iter()
                    .flatten()
                    .find(|side| side.slot == *slot)
                    .map(|side| side.direction);
                warn!(
                    instrument = %ctx.instrument(),
                    slot = %slot,
                    txid = %txid,
                    side = ?side,
                    "Quote refused for lack of funds"
                );
            }
            SlotEvent::FatalError { slot, reason, .. } => {
                error!(instrument = %ctx.instrument(), slot = %slot, reason = %reason, "Quoter halted");
            }
            // Orders settling while stopping may become cancelable again.
            _ if ctx.is_stopping() => self.flatten(ctx),
            _ => {}
        }
    }

    fn on_timer(&mut self, ctx: &mut InstrumentContext, token: u64) {
        match token {
            TOKEN_RESTORE | TOKEN_FLATTEN if ctx.is_stopping() => {
                debug!(instrument = %ctx.instrument(), "Rate controller restored, flattening");
                self.flatten(ctx);
            }
            TOKEN_REQUOTE => {
                self.step = self.step.wrapping_add(1);
                self.requote(ctx);
                self.schedule_requote(ctx);
            }
            TOKEN_RESTORE => {
                debug!(instrument = %ctx.instrument(), "Rate controller restored, requoting");
                self.requote(ctx);
            }
            other => debug!(token = other, "Timer token ignored"),
        }
    }

    fn on_stop(&mut self, ctx: &mut InstrumentContext) {
        if let Some(timer) = self.requote_timer.take() {
            timer.cancel();
        }
        info!(instrument = %ctx.instrument(), "Quoter stopping, cancelling quotes");
        self.flatten(ctx);
    }
}
