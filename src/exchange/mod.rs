// =============================================================================
// Exchange facade — the only surface the core talks to
// =============================================================================
//
// Everything the pipeline, reconciler and executor need from a derivatives
// venue, normalized: plain uppercase symbols (`BTCUSDT`, never
// colon-suffixed), base-unit quantities, quote-unit equity. Wire-format
// quirks (string numbers, `entryPrice` vs `entry_price`) stop at the
// implementing client.
// =============================================================================

pub mod bybit;

pub use bybit::BybitClient;

use async_trait::async_trait;

use crate::error::BotResult;
use crate::types::{Bar, OrderSide, Position, Timeframe};

/// Order type for [`OrderRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Limit,
    Market,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "Limit"),
            Self::Market => write!(f, "Market"),
        }
    }
}

/// A single order, fully specified by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Base-asset quantity, already rounded to the instrument step.
    pub qty: f64,
    /// Required for limit orders.
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl OrderRequest {
    /// A reduce-only market order, used to flatten or trim a position.
    pub fn reduce_market(symbol: &str, side: OrderSide, qty: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            reduce_only: true,
            stop_loss: None,
            take_profit: None,
        }
    }
}

/// The exchange contract the core depends on. Implemented by [`BybitClient`]
/// for production and by in-memory mocks in tests.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Pull up to `limit` most recent bars, oldest first.
    async fn get_ohlcv(&self, symbol: &str, timeframe: Timeframe, limit: usize)
        -> BotResult<Vec<Bar>>;

    /// Account equity in quote units (unified margin).
    async fn get_balance(&self) -> BotResult<f64>;

    /// Current position for `symbol`; a flat snapshot when none exists.
    async fn get_position(&self, symbol: &str) -> BotResult<Position>;

    /// Set leverage for `symbol`. Must succeed when the venue reports the
    /// leverage already matches.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> BotResult<()>;

    /// Submit an order, returning the venue order id.
    async fn create_order(&self, request: &OrderRequest) -> BotResult<String>;

    /// Cancel an open order by id.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> BotResult<()>;
}
