use chrono::Utc;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::Instant,
};

use super::{
    config::AutoTradeConfig,
    gateway::OrderGateway,
    policy::{apply_exposure_cap, normalize_step, passes_cost_gate, CapOutcome, DecisionThrottle},
    types::{
        AutoTradeState, AutoTradeStatus, DecisionOutcome, OpenPosition, PositionBook,
        ProposedAction,
    },
    window::CandleWindow,
};
use crate::errors::{ErrorKind, Result, SessionError};
use crate::messages::ExecutionEvent;
use crate::session::SessionEvent;
use crate::types::{AccountId, Candle, SymbolId, TradeSide, TrendbarPeriod, Volume};

/// The external decision function. Loading and inference live outside this
/// crate; only its contract is fixed here.
pub trait DecisionModel: Send {
    /// Checked while validating, before any decision is requested.
    fn validate(&self) -> anyhow::Result<()>;

    fn decide(&mut self, window: &[Candle], book: &PositionBook) -> anyhow::Result<ProposedAction>;
}

/// Turns sealed candles into orders for one symbol and period.
pub struct AutoTrader<M, G> {
    config: AutoTradeConfig,
    symbol: SymbolId,
    period: TrendbarPeriod,
    model: M,
    gateway: G,
    window: CandleWindow,
    book: PositionBook,
    throttle: DecisionThrottle,
    status: AutoTradeStatus,
    awaiting_reconcile: bool,
    last_decision_at: Option<chrono::DateTime<Utc>>,
    last_decision_side: Option<TradeSide>,
    last_error: Option<String>,
    state_tx: watch::Sender<AutoTradeState>,
}

impl<M: DecisionModel, G: OrderGateway> AutoTrader<M, G> {
    pub fn new(config: AutoTradeConfig, model: M, gateway: G) -> Self {
        let symbol = config.symbol();
        let period = config.trendbar_period();
        let (state_tx, _) = watch::channel(AutoTradeState::default());
        Self {
            window: CandleWindow::new(config.window_len),
            book: PositionBook::new(symbol),
            throttle: DecisionThrottle::new(config.min_decision_interval()),
            config,
            symbol,
            period,
            model,
            gateway,
            status: AutoTradeStatus::Stopped,
            awaiting_reconcile: false,
            last_decision_at: None,
            last_decision_side: None,
            last_error: None,
            state_tx,
        }
    }

    pub fn status(&self) -> AutoTradeStatus {
        self.status
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn state(&self) -> watch::Receiver<AutoTradeState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> AutoTradeState {
        AutoTradeState {
            enabled: self.status == AutoTradeStatus::Running,
            status: self.status,
            positions: self.book.positions().copied().collect(),
            buy_exposure: self.book.exposure(TradeSide::Buy),
            sell_exposure: self.book.exposure(TradeSide::Sell),
            awaiting_reconcile: self.awaiting_reconcile,
            last_decision_at: self.last_decision_at,
            last_decision_side: self.last_decision_side,
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot());
    }

    fn set_status(&mut self, status: AutoTradeStatus) {
        if self.status != status {
            tracing::info!(from = ?self.status, to = ?status, symbol = %self.symbol, "autotrade_status");
            self.status = status;
        }
        self.publish();
    }

    /// `Stopped -> Validating -> Running`. Any failed check returns to
    /// `Stopped` with the reason recorded and returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.status != AutoTradeStatus::Stopped {
            return Ok(());
        }
        self.set_status(AutoTradeStatus::Validating);
        match self.validate().await {
            Ok(()) => {
                self.last_error = None;
                self.awaiting_reconcile = false;
                self.set_status(AutoTradeStatus::Running);
                Ok(())
            }
            Err(reason) => {
                tracing::warn!(symbol = %self.symbol, %reason, "autotrade_validation_failed");
                self.last_error = Some(reason.clone());
                self.set_status(AutoTradeStatus::Stopped);
                Err(SessionError::ValidationFailed(reason))
            }
        }
    }

    async fn validate(&mut self) -> std::result::Result<(), String> {
        self.model
            .validate()
            .map_err(|e| format!("decision model unavailable: {e:#}"))?;
        if !self.gateway.is_ready() {
            return Err("order pathway unavailable: session not ready".to_string());
        }
        match self.gateway.symbol_tradable(self.symbol).await {
            Ok(true) => {}
            Ok(false) => return Err(format!("symbol {} is not tradable", self.symbol)),
            Err(err) => return Err(format!("symbol check failed: {err}")),
        }
        let positions = self
            .gateway
            .reconcile()
            .await
            .map_err(|e| format!("reconcile failed: {e}"))?;
        self.book.replace(&positions);
        Ok(())
    }

    /// `Running -> Stopping -> Stopped`. Open positions are left alone.
    pub fn stop(&mut self) {
        if self.status == AutoTradeStatus::Stopped {
            return;
        }
        self.set_status(AutoTradeStatus::Stopping);
        self.set_status(AutoTradeStatus::Stopped);
    }

    fn hard_stop(&mut self, reason: String) {
        if self.status == AutoTradeStatus::Stopped {
            return;
        }
        tracing::error!(symbol = %self.symbol, %reason, "autotrade_hard_stop");
        self.last_error = Some(reason);
        self.set_status(AutoTradeStatus::Stopped);
    }

    pub fn on_auth_revoked(&mut self, account: AccountId) {
        if account == self.gateway.account() {
            self.hard_stop(SessionError::AuthRevoked { account }.to_string());
        }
    }

    pub fn on_halted(&mut self, reason: &str) {
        self.hard_stop(format!("session halted: {reason}"));
    }

    pub fn on_history(&mut self, symbol: SymbolId, period: TrendbarPeriod, candles: &[Candle]) {
        if symbol == self.symbol && period == self.period {
            self.window.seed(candles);
            tracing::debug!(symbol = %symbol, bars = self.window.len(), "autotrade_window_seeded");
        }
    }

    pub fn on_execution(&mut self, event: &ExecutionEvent) {
        if let Some(position) = &event.position {
            if position.trade_data.symbol_id == self.symbol {
                self.book.apply(position);
                self.publish();
            }
        }
    }

    /// Positions may have changed while the link was down; decisions wait
    /// until they are re-validated.
    pub async fn on_reconnected(&mut self) {
        self.awaiting_reconcile = true;
        self.publish();
        if self.status == AutoTradeStatus::Running {
            self.reconcile().await;
        }
    }

    async fn reconcile(&mut self) -> bool {
        match self.gateway.reconcile().await {
            Ok(positions) => {
                self.book.replace(&positions);
                self.awaiting_reconcile = false;
                tracing::info!(
                    symbol = %self.symbol,
                    buy = %self.book.exposure(TradeSide::Buy),
                    sell = %self.book.exposure(TradeSide::Sell),
                    "autotrade_reconciled"
                );
                self.publish();
                true
            }
            Err(err) => {
                tracing::warn!(%err, "autotrade_reconcile_failed");
                self.last_error = Some(err.to_string());
                self.publish();
                false
            }
        }
    }

    pub async fn on_sealed_candle(&mut self, candle: Candle) -> DecisionOutcome {
        if candle.symbol != self.symbol || candle.period != self.period {
            return DecisionOutcome::Ignored;
        }
        self.window.push(candle);
        if self.status != AutoTradeStatus::Running {
            return DecisionOutcome::NotRunning;
        }
        if self.awaiting_reconcile && !self.reconcile().await {
            return DecisionOutcome::AwaitingReconcile;
        }

        let now = Instant::now();
        if let Err(remaining) = self.throttle.check(now) {
            tracing::info!(?remaining, "decision_throttled");
            return DecisionOutcome::Throttled { remaining };
        }
        if self.window.len() < self.config.min_window {
            tracing::debug!(
                have = self.window.len(),
                need = self.config.min_window,
                "insufficient_window"
            );
            return DecisionOutcome::InsufficientWindow {
                have: self.window.len(),
                need: self.config.min_window,
            };
        }

        let window = self.window.to_vec();
        let action = match self.model.decide(&window, &self.book) {
            Ok(action) => action,
            Err(err) => {
                let reason = format!("decision failed: {err:#}");
                tracing::warn!(%reason, "decision_failed");
                self.last_error = Some(reason.clone());
                self.publish();
                return DecisionOutcome::Failed(reason);
            }
        };
        tracing::debug!(?action, "decision_proposed");

        let outcome = match action {
            ProposedAction::Hold => DecisionOutcome::Hold,
            ProposedAction::Flatten => {
                let positions = self.book.positions().copied().collect::<Vec<_>>();
                self.close_positions(positions, None, now).await
            }
            ProposedAction::Open {
                side,
                lots,
                expected_edge_bps,
            } => {
                let opposite = self.book.on_side(side.opposite());
                if opposite.is_empty() {
                    self.open(side, lots, expected_edge_bps, now).await
                } else {
                    tracing::info!(%side, count = opposite.len(), "reverse_close_first");
                    self.close_positions(opposite, Some(side), now).await
                }
            }
        };
        self.publish();
        outcome
    }

    fn accept(&mut self, side: Option<TradeSide>, now: Instant) {
        self.throttle.record(now);
        self.last_decision_at = Some(Utc::now());
        self.last_decision_side = side;
    }

    async fn open(
        &mut self,
        side: TradeSide,
        lots: f64,
        expected_edge_bps: f64,
        now: Instant,
    ) -> DecisionOutcome {
        let step = self.config.min_step();
        let volume = normalize_step(Volume::from_lots(lots), step);
        if volume.is_zero() {
            tracing::debug!(lots, "below_min_step");
            return DecisionOutcome::BelowStep;
        }
        if !passes_cost_gate(expected_edge_bps, self.config.cost_threshold_bps) {
            tracing::info!(
                edge_bps = expected_edge_bps,
                cost_bps = self.config.cost_threshold_bps,
                "cost_gated"
            );
            return DecisionOutcome::CostGated {
                edge_bps: expected_edge_bps,
                cost_bps: self.config.cost_threshold_bps,
            };
        }
        let current = self.book.exposure(side);
        let volume = match apply_exposure_cap(current, volume, self.config.same_side_cap(), step) {
            CapOutcome::Accepted(volume) => volume,
            CapOutcome::Clipped { requested, allowed } => {
                tracing::info!(%side, %requested, %allowed, %current, "volume_clipped");
                allowed
            }
            CapOutcome::Rejected => {
                tracing::info!(%side, %current, "same_side_capped");
                return DecisionOutcome::Capped;
            }
        };

        self.book.reserve(side, volume);
        let label = Some(self.config.order_label.clone());
        match self
            .gateway
            .new_order(self.symbol, side, volume, label)
            .await
        {
            Ok(position) => {
                self.accept(Some(side), now);
                self.last_error = None;
                match position {
                    Some(position) if position.is_open() => {
                        self.book.release(side, volume);
                        self.book.apply(&position);
                    }
                    Some(position) => {
                        self.book
                            .hold_until_filled(position.position_id, side, volume);
                    }
                    None => {
                        self.reconcile().await;
                    }
                }
                tracing::info!(%side, %volume, symbol = %self.symbol, "order_submitted");
                DecisionOutcome::Submitted { side, volume }
            }
            Err(err) => self.order_failed(side, volume, err, now).await,
        }
    }

    async fn order_failed(
        &mut self,
        side: TradeSide,
        volume: Volume,
        err: SessionError,
        now: Instant,
    ) -> DecisionOutcome {
        self.last_error = Some(err.to_string());
        match err.kind() {
            ErrorKind::BrokerRejected => {
                self.book.release(side, volume);
                tracing::error!(%side, %volume, %err, "order_rejected");
                let code = match err {
                    SessionError::BrokerRejected { code, .. } => code,
                    _ => String::new(),
                };
                DecisionOutcome::Rejected { code }
            }
            ErrorKind::Timeout | ErrorKind::Transport => {
                // Outcome unknown: keep the volume counted and never resend.
                tracing::warn!(%side, %volume, %err, "order_outcome_unknown");
                self.accept(Some(side), now);
                self.awaiting_reconcile = true;
                self.reconcile().await;
                DecisionOutcome::Unconfirmed { side, volume }
            }
            ErrorKind::AuthRevoked => {
                self.book.release(side, volume);
                self.hard_stop(err.to_string());
                DecisionOutcome::Failed(err.to_string())
            }
            ErrorKind::Protocol | ErrorKind::ValidationFailed => {
                self.book.release(side, volume);
                tracing::error!(%err, "order_failed");
                DecisionOutcome::Failed(err.to_string())
            }
        }
    }

    async fn close_positions(
        &mut self,
        positions: Vec<OpenPosition>,
        side: Option<TradeSide>,
        now: Instant,
    ) -> DecisionOutcome {
        if positions.is_empty() {
            return DecisionOutcome::Hold;
        }
        let mut closed = 0;
        for position in positions {
            match self
                .gateway
                .close_position(position.position_id, position.volume)
                .await
            {
                Ok(()) => closed += 1,
                Err(err) => {
                    tracing::error!(
                        position = %position.position_id,
                        %err,
                        "close_position_failed"
                    );
                    self.last_error = Some(err.to_string());
                    if err.kind() == ErrorKind::AuthRevoked {
                        self.hard_stop(err.to_string());
                        break;
                    }
                    if err.kind() != ErrorKind::BrokerRejected {
                        self.awaiting_reconcile = true;
                    }
                }
            }
        }
        if closed > 0 {
            self.accept(side, now);
        }
        if self.awaiting_reconcile {
            self.reconcile().await;
        }
        DecisionOutcome::Closing { positions: closed }
    }

    /// Consumes session events until the session goes away or a control
    /// channel asks to quit.
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<SessionEvent>,
        mut control: mpsc::Receiver<AutoTradeCommand>,
    ) -> Self {
        loop {
            tokio::select! {
                command = control.recv() => match command {
                    Some(AutoTradeCommand::Start(reply)) => {
                        let _ = reply.send(self.start().await);
                    }
                    Some(AutoTradeCommand::Stop) => self.stop(),
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => self.on_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "autotrade_events_lagged");
                        self.awaiting_reconcile = true;
                        self.publish();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.on_halted("session closed");
                        break;
                    }
                },
            }
        }
        self
    }

    async fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::SealedCandle(candle) => {
                self.on_sealed_candle(candle).await;
            }
            SessionEvent::History {
                symbol,
                period,
                candles,
            } => self.on_history(symbol, period, &candles),
            SessionEvent::Execution(event) => self.on_execution(&event),
            SessionEvent::Ready {
                reconnected: true, ..
            } => self.on_reconnected().await,
            SessionEvent::AuthRevoked { account } => self.on_auth_revoked(account),
            SessionEvent::Halted { reason } => self.on_halted(&reason),
            _ => {}
        }
    }
}

pub enum AutoTradeCommand {
    Start(oneshot::Sender<Result<()>>),
    Stop,
}

/// Control surface for an [`AutoTrader`] running on its own task.
#[derive(Clone)]
pub struct AutoTradeHandle {
    commands: mpsc::Sender<AutoTradeCommand>,
    state: watch::Receiver<AutoTradeState>,
}

impl AutoTradeHandle {
    pub async fn start(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(AutoTradeCommand::Start(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn stop(&self) -> Result<()> {
        self.commands
            .send(AutoTradeCommand::Stop)
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub fn state(&self) -> watch::Receiver<AutoTradeState> {
        self.state.clone()
    }
}

pub fn spawn_autotrader<M, G>(
    trader: AutoTrader<M, G>,
    events: broadcast::Receiver<SessionEvent>,
) -> (AutoTradeHandle, tokio::task::JoinHandle<AutoTrader<M, G>>)
where
    M: DecisionModel + 'static,
    G: OrderGateway + 'static,
{
    let (commands, control) = mpsc::channel(16);
    let state = trader.state();
    let task = tokio::spawn(trader.run(events, control));
    (AutoTradeHandle { commands, state }, task)
}
