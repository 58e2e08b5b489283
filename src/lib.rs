//! Broker session and market-data client for the cTrader Open API, with an
//! auto-trading orchestrator driven by sealed candles.
//!
//! A session is one account context: [`spawn_session`] starts a driver task
//! that owns the connection, authentication, request correlation,
//! subscriptions, market data cache and liveness watchdog, and hands back a
//! cloneable [`SessionHandle`].

#![allow(clippy::too_many_arguments)]

extern crate serde;
extern crate serde_json;
extern crate serde_repr;

pub mod auth;
pub mod autotrade;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod errors;
pub mod framer;
pub mod market_data;
pub mod messages;
pub mod session;
pub mod subscriptions;
pub mod types;
pub mod watchdog;

pub use auth::{AuthState, AuthStateMachine, Credentials};
pub use autotrade::{
    AutoTradeConfig, AutoTradeHandle, AutoTradeState, AutoTradeStatus, AutoTrader,
    DecisionModel, DecisionOutcome, OrderGateway, ProposedAction, SessionGateway,
};
pub use config::{ReconnectPolicy, RequestPolicy, SessionConfig};
pub use connection::{
    ConnectionManager, ConnectionState, ExponentialBackoff, MessageSender, TcpTransport,
    Transport,
};
pub use correlator::{CorrelatorAction, PendingRequest, RequestCorrelator};
pub use errors::{classify_broker_code, BrokerCodeClass, ErrorKind, Result, SessionError};
pub use framer::{encode_frame, Envelope, FrameDecoder};
pub use market_data::{MarketDataCache, MarketSnapshot};
pub use messages::{InboundMessage, OutboundMessage};
pub use session::{
    spawn_session, BrokerRequester, SessionEvent, SessionHandle, SessionStatus, SubscriptionSink,
};
pub use subscriptions::{SubscriptionKind, SubscriptionManager, SubscriptionSpec};
pub use types::{
    AccountId, Candle, CorrelationId, OrderId, PositionId, Price, Quote, SymbolId, TradeSide,
    TrendbarPeriod, Volume,
};
pub use watchdog::{RecoveryAction, RecoveryWatchdog, WatchdogConfig, WatchdogRecord};

/// Installs a `fmt` subscriber filtered by `filter` (or `RUST_LOG`).
#[cfg(feature = "log-setup")]
pub fn init_tracing(filter: &str) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
