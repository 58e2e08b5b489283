use async_trait::async_trait;

use crate::connection::ConnectionState;
use crate::errors::{Result, SessionError};
use crate::messages::{
    AccountReq, ClosePositionReq, InboundMessage, NewOrderReq, OutboundMessage, PositionInfo,
    SymbolsReq, ORDER_TYPE_MARKET,
};
use crate::session::SessionHandle;
use crate::types::{AccountId, PositionId, SymbolId, TradeSide, Volume};

/// The trading surface the orchestrator needs from a session.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    fn account(&self) -> AccountId;

    fn is_ready(&self) -> bool;

    async fn symbol_tradable(&self, symbol: SymbolId) -> Result<bool>;

    /// Open positions as the broker sees them.
    async fn reconcile(&self) -> Result<Vec<PositionInfo>>;

    /// Market order. Returns the resulting position when the broker reports
    /// one in its response.
    async fn new_order(
        &self,
        symbol: SymbolId,
        side: TradeSide,
        volume: Volume,
        label: Option<String>,
    ) -> Result<Option<PositionInfo>>;

    async fn close_position(&self, position: PositionId, volume: Volume) -> Result<()>;
}

/// [`OrderGateway`] over a live session.
#[derive(Clone)]
pub struct SessionGateway {
    handle: SessionHandle,
}

impl SessionGateway {
    pub fn new(handle: SessionHandle) -> Self {
        Self { handle }
    }
}

fn unexpected(what: &str, message: InboundMessage) -> SessionError {
    SessionError::Protocol(format!("unexpected {what} response: {message:?}"))
}

#[async_trait]
impl OrderGateway for SessionGateway {
    fn account(&self) -> AccountId {
        self.handle.account()
    }

    fn is_ready(&self) -> bool {
        let status = self.handle.status();
        let current = status.borrow();
        current.state == ConnectionState::Ready && current.halted.is_none()
    }

    async fn symbol_tradable(&self, symbol: SymbolId) -> Result<bool> {
        let response = self
            .handle
            .request(OutboundMessage::SymbolById(SymbolsReq {
                ctid_trader_account_id: self.account(),
                symbol_id: vec![symbol],
            }))
            .await?;
        match response {
            InboundMessage::SymbolByIdRes(res) => Ok(res
                .symbol
                .iter()
                .any(|info| info.symbol_id == symbol && info.is_tradable())),
            other => Err(unexpected("symbol", other)),
        }
    }

    async fn reconcile(&self) -> Result<Vec<PositionInfo>> {
        let response = self
            .handle
            .request(OutboundMessage::Reconcile(AccountReq {
                ctid_trader_account_id: self.account(),
            }))
            .await?;
        match response {
            InboundMessage::ReconcileRes(res) => Ok(res.position),
            other => Err(unexpected("reconcile", other)),
        }
    }

    async fn new_order(
        &self,
        symbol: SymbolId,
        side: TradeSide,
        volume: Volume,
        label: Option<String>,
    ) -> Result<Option<PositionInfo>> {
        let response = self
            .handle
            .request(OutboundMessage::NewOrder(NewOrderReq {
                ctid_trader_account_id: self.account(),
                symbol_id: symbol,
                order_type: ORDER_TYPE_MARKET,
                trade_side: side,
                volume: volume.into_units(),
                label,
            }))
            .await?;
        match response {
            InboundMessage::ExecutionEvent(event) => Ok(event.position),
            _ => Ok(None),
        }
    }

    async fn close_position(&self, position: PositionId, volume: Volume) -> Result<()> {
        self.handle
            .request(OutboundMessage::ClosePosition(ClosePositionReq {
                ctid_trader_account_id: self.account(),
                position_id: position,
                volume: volume.into_units(),
            }))
            .await
            .map(|_| ())
    }
}
