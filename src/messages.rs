//! Typed message catalog for the broker protocol.
//!
//! Bodies are serialized as JSON inside the binary [`Envelope`], with the
//! broker's camelCase field names.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::errors::{Result, SessionError};
use crate::framer::Envelope;
use crate::types::{
    AccountId, CorrelationId, OrderId, PositionId, SymbolId, TradeSide, TrendbarPeriod,
};

pub const PAYLOAD_ERROR_RES_COMMON: u32 = 50;
pub const PAYLOAD_HEARTBEAT_EVENT: u32 = 51;
pub const PAYLOAD_APPLICATION_AUTH_REQ: u32 = 2100;
pub const PAYLOAD_APPLICATION_AUTH_RES: u32 = 2101;
pub const PAYLOAD_ACCOUNT_AUTH_REQ: u32 = 2102;
pub const PAYLOAD_ACCOUNT_AUTH_RES: u32 = 2103;
pub const PAYLOAD_NEW_ORDER_REQ: u32 = 2106;
pub const PAYLOAD_CLOSE_POSITION_REQ: u32 = 2111;
pub const PAYLOAD_SYMBOL_BY_ID_REQ: u32 = 2116;
pub const PAYLOAD_SYMBOL_BY_ID_RES: u32 = 2117;
pub const PAYLOAD_RECONCILE_REQ: u32 = 2124;
pub const PAYLOAD_RECONCILE_RES: u32 = 2125;
pub const PAYLOAD_EXECUTION_EVENT: u32 = 2126;
pub const PAYLOAD_SUBSCRIBE_SPOTS_REQ: u32 = 2127;
pub const PAYLOAD_SUBSCRIBE_SPOTS_RES: u32 = 2128;
pub const PAYLOAD_UNSUBSCRIBE_SPOTS_REQ: u32 = 2129;
pub const PAYLOAD_UNSUBSCRIBE_SPOTS_RES: u32 = 2130;
pub const PAYLOAD_SPOT_EVENT: u32 = 2131;
pub const PAYLOAD_ORDER_ERROR_EVENT: u32 = 2132;
pub const PAYLOAD_SUBSCRIBE_LIVE_TRENDBAR_REQ: u32 = 2135;
pub const PAYLOAD_UNSUBSCRIBE_LIVE_TRENDBAR_REQ: u32 = 2136;
pub const PAYLOAD_GET_TRENDBARS_REQ: u32 = 2137;
pub const PAYLOAD_GET_TRENDBARS_RES: u32 = 2138;
pub const PAYLOAD_ERROR_RES: u32 = 2142;
pub const PAYLOAD_ACCOUNTS_TOKEN_INVALIDATED_EVENT: u32 = 2147;
pub const PAYLOAD_DEPTH_EVENT: u32 = 2155;
pub const PAYLOAD_SUBSCRIBE_DEPTH_QUOTES_REQ: u32 = 2156;
pub const PAYLOAD_SUBSCRIBE_DEPTH_QUOTES_RES: u32 = 2157;
pub const PAYLOAD_UNSUBSCRIBE_DEPTH_QUOTES_REQ: u32 = 2158;
pub const PAYLOAD_UNSUBSCRIBE_DEPTH_QUOTES_RES: u32 = 2159;
pub const PAYLOAD_ACCOUNT_LOGOUT_REQ: u32 = 2162;
pub const PAYLOAD_ACCOUNT_LOGOUT_RES: u32 = 2163;
pub const PAYLOAD_ACCOUNT_DISCONNECT_EVENT: u32 = 2164;
pub const PAYLOAD_SUBSCRIBE_LIVE_TRENDBAR_RES: u32 = 2165;
pub const PAYLOAD_UNSUBSCRIBE_LIVE_TRENDBAR_RES: u32 = 2166;
pub const PAYLOAD_REFRESH_TOKEN_REQ: u32 = 2173;
pub const PAYLOAD_REFRESH_TOKEN_RES: u32 = 2174;

pub const EXECUTION_ORDER_ACCEPTED: u8 = 2;
pub const EXECUTION_ORDER_FILLED: u8 = 3;
pub const EXECUTION_ORDER_CANCELLED: u8 = 5;
pub const EXECUTION_ORDER_REJECTED: u8 = 7;
pub const EXECUTION_ORDER_PARTIAL_FILL: u8 = 11;

pub const POSITION_STATUS_OPEN: u8 = 1;
pub const POSITION_STATUS_CLOSED: u8 = 2;
pub const POSITION_STATUS_CREATED: u8 = 3;

pub const ORDER_TYPE_MARKET: u8 = 1;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationAuthReq {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountAuthReq {
    pub ctid_trader_account_id: AccountId,
    pub access_token: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountReq {
    pub ctid_trader_account_id: AccountId,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenReq {
    pub refresh_token: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolsReq {
    pub ctid_trader_account_id: AccountId,
    pub symbol_id: Vec<SymbolId>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveTrendbarReq {
    pub ctid_trader_account_id: AccountId,
    pub period: TrendbarPeriod,
    pub symbol_id: SymbolId,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTrendbarsReq {
    pub ctid_trader_account_id: AccountId,
    pub from_timestamp: i64,
    pub to_timestamp: i64,
    pub period: TrendbarPeriod,
    pub symbol_id: SymbolId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderReq {
    pub ctid_trader_account_id: AccountId,
    pub symbol_id: SymbolId,
    pub order_type: u8,
    pub trade_side: TradeSide,
    pub volume: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePositionReq {
    pub ctid_trader_account_id: AccountId,
    pub position_id: PositionId,
    pub volume: i64,
}

#[derive(Clone, Debug)]
pub enum OutboundMessage {
    Heartbeat,
    ApplicationAuth(ApplicationAuthReq),
    AccountAuth(AccountAuthReq),
    AccountLogout(AccountReq),
    RefreshToken(RefreshTokenReq),
    SubscribeSpots(SymbolsReq),
    UnsubscribeSpots(SymbolsReq),
    SubscribeLiveTrendbar(LiveTrendbarReq),
    UnsubscribeLiveTrendbar(LiveTrendbarReq),
    SubscribeDepth(SymbolsReq),
    UnsubscribeDepth(SymbolsReq),
    GetTrendbars(GetTrendbarsReq),
    NewOrder(NewOrderReq),
    ClosePosition(ClosePositionReq),
    Reconcile(AccountReq),
    SymbolById(SymbolsReq),
}

impl OutboundMessage {
    pub fn payload_type(&self) -> u32 {
        match self {
            OutboundMessage::Heartbeat => PAYLOAD_HEARTBEAT_EVENT,
            OutboundMessage::ApplicationAuth(_) => PAYLOAD_APPLICATION_AUTH_REQ,
            OutboundMessage::AccountAuth(_) => PAYLOAD_ACCOUNT_AUTH_REQ,
            OutboundMessage::AccountLogout(_) => PAYLOAD_ACCOUNT_LOGOUT_REQ,
            OutboundMessage::RefreshToken(_) => PAYLOAD_REFRESH_TOKEN_REQ,
            OutboundMessage::SubscribeSpots(_) => PAYLOAD_SUBSCRIBE_SPOTS_REQ,
            OutboundMessage::UnsubscribeSpots(_) => PAYLOAD_UNSUBSCRIBE_SPOTS_REQ,
            OutboundMessage::SubscribeLiveTrendbar(_) => PAYLOAD_SUBSCRIBE_LIVE_TRENDBAR_REQ,
            OutboundMessage::UnsubscribeLiveTrendbar(_) => PAYLOAD_UNSUBSCRIBE_LIVE_TRENDBAR_REQ,
            OutboundMessage::SubscribeDepth(_) => PAYLOAD_SUBSCRIBE_DEPTH_QUOTES_REQ,
            OutboundMessage::UnsubscribeDepth(_) => PAYLOAD_UNSUBSCRIBE_DEPTH_QUOTES_REQ,
            OutboundMessage::GetTrendbars(_) => PAYLOAD_GET_TRENDBARS_REQ,
            OutboundMessage::NewOrder(_) => PAYLOAD_NEW_ORDER_REQ,
            OutboundMessage::ClosePosition(_) => PAYLOAD_CLOSE_POSITION_REQ,
            OutboundMessage::Reconcile(_) => PAYLOAD_RECONCILE_REQ,
            OutboundMessage::SymbolById(_) => PAYLOAD_SYMBOL_BY_ID_REQ,
        }
    }

    /// Account the request acts on; `None` for application-level traffic.
    pub fn account(&self) -> Option<AccountId> {
        match self {
            OutboundMessage::Heartbeat
            | OutboundMessage::ApplicationAuth(_)
            | OutboundMessage::RefreshToken(_) => None,
            OutboundMessage::AccountAuth(req) => Some(req.ctid_trader_account_id),
            OutboundMessage::AccountLogout(req) | OutboundMessage::Reconcile(req) => {
                Some(req.ctid_trader_account_id)
            }
            OutboundMessage::SubscribeSpots(req)
            | OutboundMessage::UnsubscribeSpots(req)
            | OutboundMessage::SubscribeDepth(req)
            | OutboundMessage::UnsubscribeDepth(req)
            | OutboundMessage::SymbolById(req) => Some(req.ctid_trader_account_id),
            OutboundMessage::SubscribeLiveTrendbar(req)
            | OutboundMessage::UnsubscribeLiveTrendbar(req) => Some(req.ctid_trader_account_id),
            OutboundMessage::GetTrendbars(req) => Some(req.ctid_trader_account_id),
            OutboundMessage::NewOrder(req) => Some(req.ctid_trader_account_id),
            OutboundMessage::ClosePosition(req) => Some(req.ctid_trader_account_id),
        }
    }

    /// Whether the request has financial side effects and must never be resent.
    pub fn is_trading(&self) -> bool {
        matches!(
            self,
            OutboundMessage::NewOrder(_) | OutboundMessage::ClosePosition(_)
        )
    }

    /// Session setup traffic, allowed before the account is authorised.
    pub fn is_pre_auth(&self) -> bool {
        matches!(
            self,
            OutboundMessage::Heartbeat
                | OutboundMessage::ApplicationAuth(_)
                | OutboundMessage::AccountAuth(_)
                | OutboundMessage::RefreshToken(_)
        )
    }

    fn body(&self) -> Result<Vec<u8>> {
        let body = match self {
            OutboundMessage::Heartbeat => b"{}".to_vec(),
            OutboundMessage::ApplicationAuth(req) => serde_json::to_vec(req)?,
            OutboundMessage::AccountAuth(req) => serde_json::to_vec(req)?,
            OutboundMessage::AccountLogout(req) | OutboundMessage::Reconcile(req) => {
                serde_json::to_vec(req)?
            }
            OutboundMessage::RefreshToken(req) => serde_json::to_vec(req)?,
            OutboundMessage::SubscribeSpots(req)
            | OutboundMessage::UnsubscribeSpots(req)
            | OutboundMessage::SubscribeDepth(req)
            | OutboundMessage::UnsubscribeDepth(req)
            | OutboundMessage::SymbolById(req) => serde_json::to_vec(req)?,
            OutboundMessage::SubscribeLiveTrendbar(req)
            | OutboundMessage::UnsubscribeLiveTrendbar(req) => serde_json::to_vec(req)?,
            OutboundMessage::GetTrendbars(req) => serde_json::to_vec(req)?,
            OutboundMessage::NewOrder(req) => serde_json::to_vec(req)?,
            OutboundMessage::ClosePosition(req) => serde_json::to_vec(req)?,
        };
        Ok(body)
    }

    pub fn to_envelope(&self, id: Option<CorrelationId>) -> Result<Envelope> {
        Ok(Envelope::new(
            self.payload_type(),
            id.map(CorrelationId::as_wire),
            self.body()?,
        ))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountRes {
    pub ctid_trader_account_id: AccountId,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRes {
    pub access_token: String,
    pub expires_in: u64,
    pub refresh_token: String,
}

/// A pushed live bar. `delta_low` is relative to the last sealed close of the
/// same (symbol, period); the other deltas are relative to the bar's low.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LiveBar {
    pub period: TrendbarPeriod,
    #[serde(default)]
    pub delta_low: i64,
    #[serde(default)]
    pub delta_open: i64,
    #[serde(default)]
    pub delta_close: i64,
    #[serde(default)]
    pub delta_high: i64,
    #[serde(default)]
    pub volume: i64,
    pub utc_timestamp_in_minutes: i64,
}

/// A historical bar with an absolute low.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryBar {
    pub low: i64,
    #[serde(default)]
    pub delta_open: i64,
    #[serde(default)]
    pub delta_close: i64,
    #[serde(default)]
    pub delta_high: i64,
    #[serde(default)]
    pub volume: i64,
    pub utc_timestamp_in_minutes: i64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GetTrendbarsRes {
    pub ctid_trader_account_id: AccountId,
    pub period: TrendbarPeriod,
    pub symbol_id: SymbolId,
    #[serde(default)]
    pub trendbar: Vec<HistoryBar>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpotEvent {
    pub ctid_trader_account_id: AccountId,
    pub symbol_id: SymbolId,
    #[serde(default)]
    pub bid: Option<i64>,
    #[serde(default)]
    pub ask: Option<i64>,
    #[serde(default)]
    pub trendbar: Vec<LiveBar>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DepthQuote {
    pub id: u64,
    pub size: i64,
    #[serde(default)]
    pub bid: Option<i64>,
    #[serde(default)]
    pub ask: Option<i64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DepthEvent {
    pub ctid_trader_account_id: AccountId,
    pub symbol_id: SymbolId,
    #[serde(default)]
    pub new_quotes: Vec<DepthQuote>,
    #[serde(default)]
    pub deleted_quotes: Vec<u64>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TradeData {
    pub symbol_id: SymbolId,
    pub volume: i64,
    pub trade_side: TradeSide,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PositionInfo {
    pub position_id: PositionId,
    pub trade_data: TradeData,
    pub position_status: u8,
}

impl PositionInfo {
    pub fn is_open(&self) -> bool {
        self.position_status == POSITION_STATUS_OPEN && self.trade_data.volume > 0
    }

    /// Accepted by the broker but not filled yet.
    pub fn is_pending(&self) -> bool {
        self.position_status == POSITION_STATUS_CREATED
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrderInfo {
    pub order_id: OrderId,
    #[serde(default)]
    pub position_id: Option<PositionId>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub ctid_trader_account_id: AccountId,
    pub execution_type: u8,
    #[serde(default)]
    pub position: Option<PositionInfo>,
    #[serde(default)]
    pub order: Option<OrderInfo>,
    #[serde(default)]
    pub error_code: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrderErrorEvent {
    pub ctid_trader_account_id: AccountId,
    pub error_code: String,
    #[serde(default)]
    pub order_id: Option<OrderId>,
    #[serde(default)]
    pub position_id: Option<PositionId>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRes {
    #[serde(default)]
    pub ctid_trader_account_id: Option<AccountId>,
    pub error_code: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRes {
    pub ctid_trader_account_id: AccountId,
    #[serde(default)]
    pub position: Vec<PositionInfo>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol_id: SymbolId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 0 means fully enabled; anything else restricts trading.
    #[serde(default)]
    pub trading_mode: u8,
    #[serde(default)]
    pub min_volume: Option<i64>,
    #[serde(default)]
    pub step_volume: Option<i64>,
}

fn default_enabled() -> bool {
    true
}

impl SymbolInfo {
    pub fn is_tradable(&self) -> bool {
        self.enabled && self.trading_mode == 0
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SymbolByIdRes {
    pub ctid_trader_account_id: AccountId,
    #[serde(default)]
    pub symbol: Vec<SymbolInfo>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenInvalidatedEvent {
    #[serde(default)]
    pub ctid_trader_account_ids: Vec<AccountId>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundMessage {
    Heartbeat,
    ApplicationAuthRes,
    AccountAuthRes(AccountRes),
    AccountLogoutRes(AccountRes),
    RefreshTokenRes(RefreshTokenRes),
    /// Subscribe/unsubscribe acknowledgements carry nothing beyond their type.
    SubscriptionAck(u32),
    GetTrendbarsRes(GetTrendbarsRes),
    SymbolByIdRes(SymbolByIdRes),
    ReconcileRes(ReconcileRes),
    SpotEvent(SpotEvent),
    DepthEvent(DepthEvent),
    ExecutionEvent(ExecutionEvent),
    OrderErrorEvent(OrderErrorEvent),
    ErrorRes(ErrorRes),
    TokenInvalidated(TokenInvalidatedEvent),
    AccountDisconnect(AccountRes),
    Unknown { payload_type: u32 },
}

fn parse_body<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    let body: &[u8] = if envelope.body.is_empty() {
        b"{}"
    } else {
        &envelope.body
    };
    serde_json::from_slice(body).map_err(|e| {
        SessionError::Protocol(format!(
            "malformed body for payload type {}: {e}",
            envelope.payload_type
        ))
    })
}

impl InboundMessage {
    /// Decodes a known payload type. Unknown types are not an error; a known
    /// type with a malformed body is.
    pub fn decode(envelope: &Envelope) -> Result<Self> {
        let message = match envelope.payload_type {
            PAYLOAD_HEARTBEAT_EVENT => InboundMessage::Heartbeat,
            PAYLOAD_APPLICATION_AUTH_RES => InboundMessage::ApplicationAuthRes,
            PAYLOAD_ACCOUNT_AUTH_RES => InboundMessage::AccountAuthRes(parse_body(envelope)?),
            PAYLOAD_ACCOUNT_LOGOUT_RES => InboundMessage::AccountLogoutRes(parse_body(envelope)?),
            PAYLOAD_REFRESH_TOKEN_RES => InboundMessage::RefreshTokenRes(parse_body(envelope)?),
            PAYLOAD_SUBSCRIBE_SPOTS_RES
            | PAYLOAD_UNSUBSCRIBE_SPOTS_RES
            | PAYLOAD_SUBSCRIBE_LIVE_TRENDBAR_RES
            | PAYLOAD_UNSUBSCRIBE_LIVE_TRENDBAR_RES
            | PAYLOAD_SUBSCRIBE_DEPTH_QUOTES_RES
            | PAYLOAD_UNSUBSCRIBE_DEPTH_QUOTES_RES => {
                InboundMessage::SubscriptionAck(envelope.payload_type)
            }
            PAYLOAD_GET_TRENDBARS_RES => InboundMessage::GetTrendbarsRes(parse_body(envelope)?),
            PAYLOAD_SYMBOL_BY_ID_RES => InboundMessage::SymbolByIdRes(parse_body(envelope)?),
            PAYLOAD_RECONCILE_RES => InboundMessage::ReconcileRes(parse_body(envelope)?),
            PAYLOAD_SPOT_EVENT => InboundMessage::SpotEvent(parse_body(envelope)?),
            PAYLOAD_DEPTH_EVENT => InboundMessage::DepthEvent(parse_body(envelope)?),
            PAYLOAD_EXECUTION_EVENT => InboundMessage::ExecutionEvent(parse_body(envelope)?),
            PAYLOAD_ORDER_ERROR_EVENT => InboundMessage::OrderErrorEvent(parse_body(envelope)?),
            PAYLOAD_ERROR_RES | PAYLOAD_ERROR_RES_COMMON => {
                InboundMessage::ErrorRes(parse_body(envelope)?)
            }
            PAYLOAD_ACCOUNTS_TOKEN_INVALIDATED_EVENT => {
                InboundMessage::TokenInvalidated(parse_body(envelope)?)
            }
            PAYLOAD_ACCOUNT_DISCONNECT_EVENT => {
                InboundMessage::AccountDisconnect(parse_body(envelope)?)
            }
            other => InboundMessage::Unknown {
                payload_type: other,
            },
        };
        Ok(message)
    }

    /// Broker error code and description when the message is a rejection.
    pub fn rejection(&self) -> Option<(String, String)> {
        match self {
            InboundMessage::ErrorRes(err) => Some((
                err.error_code.clone(),
                err.description.clone().unwrap_or_default(),
            )),
            InboundMessage::OrderErrorEvent(err) => Some((
                err.error_code.clone(),
                err.description.clone().unwrap_or_default(),
            )),
            InboundMessage::ExecutionEvent(event)
                if event.execution_type == EXECUTION_ORDER_REJECTED =>
            {
                Some((
                    event
                        .error_code
                        .clone()
                        .unwrap_or_else(|| "ORDER_REJECTED".to_string()),
                    "order rejected".to_string(),
                ))
            }
            _ => None,
        }
    }
}
