// =============================================================================
// Position Reconciler — desired signal vs. live exchange position
// =============================================================================
//
// Emits an ordered Plan of primitive actions. The decision table is
// exhaustive over (live side, signal side, leverage match):
//
//   live FLAT,   HOLD                  -> []
//   live FLAT,   BUY/SELL              -> [SetLeverage, Open]
//   live open,   HOLD                  -> []
//   same side,   same leverage         -> [Resize(target - current)] or []
//   same side,   different leverage    -> [Close, SetLeverage, Open]
//   opposite side                      -> [Close, SetLeverage, Open]
//
// A leverage change with an open position is always close-then-reopen, never
// a bare leverage change. A plan can never leave the account long and short
// at once: any direction change closes first, and `validate_plan` asserts it.
// =============================================================================

use tracing::debug;

use crate::error::{BotError, BotResult};
use crate::policy::AdmittedSignal;
use crate::types::{OrderSide, Plan, PlanAction, Position, PositionSide, Suggestion};

/// Fresh per-plan inputs: equity and the instrument filters.
#[derive(Debug, Clone, Copy)]
pub struct SizingContext {
    /// Wallet equity in quote units, read fresh for this plan.
    pub equity_quote: f64,
    /// Minimum base-quantity increment.
    pub step_size: f64,
    /// Minimum order notional in quote units.
    pub min_notional: f64,
}

/// Largest multiple of `step` that is <= `qty` (sign preserved).
pub fn round_down_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    // The epsilon absorbs binary-representation noise like 5.999999999.
    qty.signum() * ((qty.abs() / step) + 1e-9).floor() * step
}

/// Build the action plan that moves `live` to what `admitted` asks for.
pub fn build_plan(
    admitted: &AdmittedSignal,
    live: &Position,
    ctx: &SizingContext,
) -> BotResult<Plan> {
    let signal = &admitted.signal;

    let desired_side = match signal.position_suggestion {
        Suggestion::Hold => {
            debug!(live_side = %live.side, "HOLD signal, empty plan");
            return Ok(Vec::new());
        }
        Suggestion::Buy => OrderSide::Buy,
        Suggestion::Sell => OrderSide::Sell,
    };

    let (entry, stop_loss, take_profit) =
        match (signal.entry_price, signal.stop_loss, signal.take_profit1) {
            (Some(e), Some(s), Some(t)) if e > 0.0 => (e, s, t),
            _ => {
                return Err(BotError::InvariantViolation(
                    "tradable signal reached the reconciler without entry/SL/TP levels".into(),
                ))
            }
        };

    // Target quantity from equity, size percentage and leverage, floored to
    // the instrument step and gated on notional.
    let raw_qty =
        ctx.equity_quote * (signal.position_size_pct / 100.0) * signal.leverage as f64 / entry;
    let target_qty = round_down_to_step(raw_qty, ctx.step_size);
    let target_tradable = target_qty > 0.0 && target_qty * entry >= ctx.min_notional;

    let open_action = PlanAction::OpenPosition {
        side: desired_side,
        qty_base: target_qty,
        entry_limit: entry,
        stop_loss,
        take_profit,
    };

    let plan: Plan = if live.is_flat() {
        if !target_tradable {
            debug!(target_qty, "target below step/notional gates, nothing to open");
            Vec::new()
        } else {
            vec![
                PlanAction::SetLeverage {
                    leverage: signal.leverage,
                },
                open_action,
            ]
        }
    } else if live.side == desired_side.opens() {
        if live.leverage == signal.leverage {
            // Same direction, same leverage: adjust size in place, keeping
            // the existing SL/TP untouched on a no-op.
            let delta = round_down_to_step(target_qty - live.size_base, ctx.step_size);
            if delta.abs() < ctx.step_size || delta.abs() * entry < ctx.min_notional {
                debug!(delta, "resize below step/notional gates, holding position");
                Vec::new()
            } else {
                vec![PlanAction::ResizePosition { delta_base: delta }]
            }
        } else {
            // Leverage change with an open position: always close-then-reopen.
            reopen_plan(signal.leverage, open_action, target_tradable)
        }
    } else {
        // Opposite direction: flip via close-then-reopen.
        reopen_plan(signal.leverage, open_action, target_tradable)
    };

    validate_plan(&plan, live)?;
    debug!(
        live_side = %live.side,
        desired = %desired_side,
        target_qty,
        actions = plan.len(),
        "plan built"
    );
    Ok(plan)
}

/// Close the live position, then re-establish at the requested leverage. If
/// the new target fails the size gates only the close survives.
fn reopen_plan(leverage: u32, open_action: PlanAction, target_tradable: bool) -> Plan {
    let mut plan = vec![PlanAction::ClosePosition];
    if target_tradable {
        plan.push(PlanAction::SetLeverage { leverage });
        plan.push(open_action);
    }
    plan
}

/// Structural invariants every plan must satisfy before execution:
/// an open only onto a flat book (no simultaneous long+short), and at most
/// one direction change.
pub fn validate_plan(plan: &Plan, live: &Position) -> BotResult<()> {
    let mut current_side = if live.is_flat() { None } else { Some(live.side) };
    let mut direction_changes = 0u32;

    for action in plan {
        match action {
            PlanAction::ClosePosition => {
                current_side = None;
            }
            PlanAction::OpenPosition { side, .. } => {
                let opens = side.opens();
                match current_side {
                    Some(existing) if existing != opens => {
                        return Err(BotError::InvariantViolation(format!(
                            "plan would hold {existing} and open {opens} simultaneously"
                        )));
                    }
                    Some(_) => {}
                    None => {
                        if !live.is_flat() && live.side != opens {
                            direction_changes += 1;
                        }
                        current_side = Some(opens);
                    }
                }
            }
            PlanAction::SetLeverage { .. } | PlanAction::ResizePosition { .. } => {}
        }
    }

    if direction_changes > 1 {
        return Err(BotError::InvariantViolation(
            "plan contains more than one direction change".into(),
        ));
    }
    Ok(())
}
