pub mod adx;
pub mod bollinger;
pub mod ichimoku;
pub mod macd;
pub mod rsi;
pub mod trend;
pub mod vwap;

// Re-export the latest-value entry points used by the market data adapter.
pub use adx::adx;
pub use bollinger::{bollinger, BollingerBands};
pub use ichimoku::{ichimoku, IchimokuLines};
pub use macd::{macd, MacdPoint};
pub use rsi::rsi;
pub use trend::{sma, volume_ratio};
pub use vwap::vwap;
