//! Auto-trading on sealed candles.
//!
//! The `AutoTrader` orchestrator runs the external decision model on each
//! sealed candle of one configured series and passes the proposal through the
//! pre-trade gates (step size, same-side cap, cost, throttle) before it
//! reaches the broker through an [`OrderGateway`].

pub mod config;
pub mod gateway;
pub mod orchestrator;
pub mod policy;
pub mod types;
pub mod window;

pub use config::AutoTradeConfig;
pub use gateway::{OrderGateway, SessionGateway};
pub use orchestrator::{spawn_autotrader, AutoTradeCommand, AutoTradeHandle, AutoTrader, DecisionModel};
pub use policy::{apply_exposure_cap, normalize_step, passes_cost_gate, CapOutcome, DecisionThrottle};
pub use types::{
    AutoTradeState, AutoTradeStatus, DecisionOutcome, OpenPosition, PositionBook, ProposedAction,
};
pub use window::CandleWindow;
