//! Per-account session driver.
//!
//! One task owns the connection, auth machine, correlator, subscription set,
//! market data cache and watchdog. Everything else talks to it through a
//! [`SessionHandle`]: commands go in over a channel, results come back on
//! oneshots, state goes out as `watch` snapshots and typed events on a
//! per-session broadcast channel.

use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::OptionFuture;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{interval, sleep_until, Instant, MissedTickBehavior},
};

use crate::auth::{AuthState, AuthStateMachine, Credentials};
use crate::config::{RequestPolicy, SessionConfig};
use crate::connection::{
    ConnectionManager, ConnectionState, Link, LinkEvent, MessageSender, ReconnectDecision,
    Transport,
};
use crate::correlator::{CorrelatorAction, RequestCorrelator};
use crate::errors::{classify_broker_code, BrokerCodeClass, Result, SessionError};
use crate::framer::Envelope;
use crate::market_data::{history_is_fresh, MarketDataCache, MarketSnapshot, SeriesKey};
use crate::messages::{
    AccountReq, DepthEvent, ExecutionEvent, GetTrendbarsReq, InboundMessage, OrderErrorEvent,
    OutboundMessage, SpotEvent,
};
use crate::subscriptions::{
    SubscriptionCommand, SubscriptionKind, SubscriptionManager, SubscriptionSpec,
};
use crate::types::{utc_minutes, AccountId, Candle, CorrelationId, SymbolId, TrendbarPeriod};
use crate::watchdog::{ProbeResult, RecoveryAction, RecoveryWatchdog, WatchdogConfig};

const COMMAND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 1024;
/// Bars requested when seeding a series.
const HISTORY_BARS: i64 = 120;
/// Shortest history lookback; spans a weekend or holiday gap.
const MIN_HISTORY_LOOKBACK_MS: i64 = 7 * 24 * 60 * 60_000;

#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Connection reached `Ready`. `reconnected` is set for every `Ready`
    /// after the first one; open positions must be re-validated.
    Ready { generation: u64, reconnected: bool },
    SealedCandle(Candle),
    History {
        symbol: SymbolId,
        period: TrendbarPeriod,
        candles: Vec<Candle>,
    },
    Execution(ExecutionEvent),
    OrderError(OrderErrorEvent),
    Depth(SymbolId),
    AuthRevoked { account: AccountId },
    AuthFailed { reason: String },
    SubscriptionFailed { spec: SubscriptionSpec, error: String },
    BrokerError { code: String, description: String },
    Halted { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    pub account: AccountId,
    pub state: ConnectionState,
    pub auth: AuthState,
    pub generation: u64,
    pub halted: Option<String>,
}

enum Command {
    Request {
        message: OutboundMessage,
        policy: Option<RequestPolicy>,
        reply: oneshot::Sender<Result<InboundMessage>>,
    },
    Subscribe(SubscriptionSpec),
    Unsubscribe(SubscriptionSpec),
    Reconnect,
    Logout(oneshot::Sender<Result<()>>),
    Shutdown,
}

#[derive(Debug)]
enum Completion {
    Caller(oneshot::Sender<Result<InboundMessage>>),
    AppAuth,
    AccountAuth,
    Refresh,
    Subscribe(SubscriptionSpec),
    Unsubscribe(SubscriptionSpec),
    History { key: SeriesKey, probe: bool },
    Logout(oneshot::Sender<Result<()>>),
}

#[derive(Debug, Default)]
struct ProbeState {
    outstanding: usize,
    stale: bool,
    failed: bool,
}

/// Correlated request/response over the session.
#[async_trait]
pub trait BrokerRequester: Send + Sync {
    async fn request(
        &self,
        message: OutboundMessage,
        policy: Option<RequestPolicy>,
    ) -> Result<InboundMessage>;
}

/// Declarative subscription changes.
#[async_trait]
pub trait SubscriptionSink: Send + Sync {
    async fn desire(&self, spec: SubscriptionSpec) -> Result<()>;
    async fn withdraw(&self, spec: SubscriptionSpec) -> Result<()>;
}

#[derive(Clone)]
pub struct SessionHandle {
    account: AccountId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    market: watch::Receiver<Arc<MarketSnapshot>>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn account(&self) -> AccountId {
        self.account
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub async fn request(&self, message: OutboundMessage) -> Result<InboundMessage> {
        self.request_with(message, None).await
    }

    pub async fn request_with(
        &self,
        message: OutboundMessage,
        policy: Option<RequestPolicy>,
    ) -> Result<InboundMessage> {
        let (reply, response) = oneshot::channel();
        self.send_command(Command::Request {
            message,
            policy,
            reply,
        })
        .await?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn subscribe(&self, spec: SubscriptionSpec) -> Result<()> {
        self.send_command(Command::Subscribe(spec)).await
    }

    pub async fn unsubscribe(&self, spec: SubscriptionSpec) -> Result<()> {
        self.send_command(Command::Unsubscribe(spec)).await
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn market(&self) -> watch::Receiver<Arc<MarketSnapshot>> {
        self.market.clone()
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Clears a halt and redials immediately.
    pub async fn reconnect(&self) -> Result<()> {
        self.send_command(Command::Reconnect).await
    }

    pub async fn logout(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send_command(Command::Logout(reply)).await?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    /// Idempotent; a session that is already gone is not an error.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    /// Resolves once the session is `Ready`, or fails if it halts first.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut status = self.status.clone();
        loop {
            {
                let current = status.borrow_and_update();
                if current.state == ConnectionState::Ready {
                    return Ok(());
                }
                if let Some(reason) = &current.halted {
                    return Err(SessionError::Transport(reason.clone()));
                }
            }
            status.changed().await.map_err(|_| SessionError::Closed)?;
        }
    }
}

#[async_trait]
impl BrokerRequester for SessionHandle {
    async fn request(
        &self,
        message: OutboundMessage,
        policy: Option<RequestPolicy>,
    ) -> Result<InboundMessage> {
        self.request_with(message, policy).await
    }
}

#[async_trait]
impl SubscriptionSink for SessionHandle {
    async fn desire(&self, spec: SubscriptionSpec) -> Result<()> {
        self.subscribe(spec).await
    }

    async fn withdraw(&self, spec: SubscriptionSpec) -> Result<()> {
        self.unsubscribe(spec).await
    }
}

/// Starts the session driver on the current runtime and dials immediately.
pub fn spawn_session(config: SessionConfig, transport: Arc<dyn Transport>) -> SessionHandle {
    let account = AccountId::new(config.account_id);
    let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
    let (events, _) = broadcast::channel(EVENT_QUEUE);

    let auth = AuthStateMachine::new(
        Credentials {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            access_token: config.access_token.clone(),
            refresh_token: config.refresh_token.clone(),
            account,
        },
        config.token_lifetime(),
        config.token_refresh_margin(),
    );
    let connection =
        ConnectionManager::new(transport, config.reconnect_policy(), config.max_frame_len);
    let cache = MarketDataCache::new(account);
    let market = cache.subscribe();
    let watchdog = RecoveryWatchdog::new(
        WatchdogConfig {
            tick: config.watchdog_tick(),
            grace_multiple: config.watchdog_grace_multiple,
            miss_threshold: config.watchdog_miss_threshold,
        },
        Instant::now(),
    );
    let (status_tx, status) = watch::channel(SessionStatus {
        account,
        state: ConnectionState::Disconnected,
        auth: AuthState::Unauthenticated,
        generation: 0,
        halted: None,
    });

    let driver = SessionDriver {
        config,
        account,
        connection,
        link: None,
        auth,
        correlator: RequestCorrelator::new(),
        subscriptions: SubscriptionManager::new(),
        cache,
        watchdog,
        commands,
        events: events.clone(),
        status: status_tx,
        reconnect_at: None,
        login_deadline: None,
        halted: None,
        probe: None,
        history_in_flight: HashSet::new(),
    };
    tokio::spawn(driver.run());

    SessionHandle {
        account,
        commands: command_tx,
        events,
        market,
        status,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The broker trims to the newest `count` bars, so the range only needs to be
/// wide enough to reach past market closures.
fn history_from(period: TrendbarPeriod, to_ms: i64) -> i64 {
    let span = (HISTORY_BARS * period.minutes() * 60_000).max(MIN_HISTORY_LOOKBACK_MS);
    to_ms - span
}

fn cancellation(reason: &SessionError) -> SessionError {
    match reason {
        SessionError::Cancelled(why) => SessionError::Cancelled(*why),
        SessionError::AuthRevoked { account } => SessionError::AuthRevoked { account: *account },
        other => SessionError::Transport(other.to_string()),
    }
}

struct SessionDriver {
    config: SessionConfig,
    account: AccountId,
    connection: ConnectionManager,
    link: Option<Link>,
    auth: AuthStateMachine,
    correlator: RequestCorrelator<Completion>,
    subscriptions: SubscriptionManager,
    cache: MarketDataCache,
    watchdog: RecoveryWatchdog,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Sender<SessionStatus>,
    reconnect_at: Option<Instant>,
    login_deadline: Option<Instant>,
    halted: Option<String>,
    probe: Option<ProbeState>,
    history_in_flight: HashSet<SeriesKey>,
}

impl SessionDriver {
    async fn run(mut self) {
        let mut heartbeat = interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watchdog_tick = interval(self.config.watchdog_tick());
        watchdog_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.reconnect_at = Some(Instant::now());

        tracing::info!(account = %self.account, host = %self.config.host, "session_started");
        loop {
            let reconnect_at = self.reconnect_at;
            let request_deadline = self.correlator.next_deadline();
            let refresh_at = self.auth.refresh_deadline();
            let login_deadline = self.login_deadline;

            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown();
                        break;
                    };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(event) = OptionFuture::from(self.link.as_mut().map(|link| link.recv())) => {
                    self.handle_link_event(event);
                }
                _ = sleep_opt(reconnect_at), if reconnect_at.is_some() => {
                    self.dial().await;
                }
                _ = sleep_opt(request_deadline), if request_deadline.is_some() => {
                    self.poll_requests();
                }
                _ = sleep_opt(refresh_at), if refresh_at.is_some() => {
                    self.start_refresh();
                }
                _ = sleep_opt(login_deadline), if login_deadline.is_some() => {
                    self.on_login_timeout();
                }
                _ = heartbeat.tick() => {
                    self.send_heartbeat();
                }
                _ = watchdog_tick.tick() => {
                    self.on_watchdog_tick();
                }
            }
        }
        tracing::info!(account = %self.account, "session_stopped");
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn publish_status(&self) {
        self.status.send_replace(SessionStatus {
            account: self.account,
            state: self.connection.state(),
            auth: self.auth.state(),
            generation: self.connection.generation(),
            halted: self.halted.clone(),
        });
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Request {
                message,
                policy,
                reply,
            } => {
                let state = self.connection.state();
                if state != ConnectionState::Ready || self.halted.is_some() {
                    let _ = reply.send(Err(SessionError::NotReady(state)));
                    return true;
                }
                let policy = policy.unwrap_or_else(|| {
                    if message.is_trading() {
                        self.config.trading_policy()
                    } else {
                        self.config.request_policy()
                    }
                });
                self.dispatch(message, policy, Completion::Caller(reply));
            }
            Command::Subscribe(spec) => {
                for command in self.subscriptions.desire(spec) {
                    self.send_subscription(command);
                }
            }
            Command::Unsubscribe(spec) => {
                for command in self.subscriptions.withdraw(spec) {
                    self.send_subscription(command);
                }
            }
            Command::Reconnect => {
                tracing::info!(account = %self.account, "reconnect_requested");
                self.halted = None;
                self.connection.reset_failures();
                if self.link.is_some() {
                    self.teardown(&SessionError::Cancelled("reconnect requested"));
                }
                self.reconnect_at = Some(Instant::now());
                self.publish_status();
            }
            Command::Logout(reply) => {
                let state = self.connection.state();
                if state != ConnectionState::Ready {
                    let _ = reply.send(Err(SessionError::NotReady(state)));
                    return true;
                }
                for request in self.correlator.cancel_all() {
                    self.abandon(request.slot, SessionError::Cancelled("logout"));
                }
                let message = OutboundMessage::AccountLogout(AccountReq {
                    ctid_trader_account_id: self.account,
                });
                self.dispatch(
                    message,
                    self.config.request_policy(),
                    Completion::Logout(reply),
                );
            }
            Command::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn shutdown(&mut self) {
        self.teardown(&SessionError::Cancelled("shutdown"));
        self.reconnect_at = None;
        self.halted = Some("shut down".to_string());
        self.publish_status();
    }

    async fn dial(&mut self) {
        self.reconnect_at = None;
        if self.halted.is_some() {
            return;
        }
        self.publish_status();
        let connect_timeout = self.config.auth_policy().timeout;
        let opened = match tokio::time::timeout(connect_timeout, self.connection.open()).await {
            Ok(result) => result,
            Err(_) => {
                self.connection.close();
                Err(SessionError::Transport("connect timed out".into()))
            }
        };
        match opened {
            Ok(link) => {
                self.link = Some(link);
                self.connection.mark_authenticating();
                self.login_deadline = Some(Instant::now() + self.config.login_flow_timeout());
                self.publish_status();
                match self.auth.begin_app_auth() {
                    Ok(message) => {
                        self.dispatch(message, self.config.auth_policy(), Completion::AppAuth)
                    }
                    Err(err) => self.connection_lost(err),
                }
            }
            Err(err) => {
                tracing::warn!(account = %self.account, %err, "connect_failed");
                self.publish_status();
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.halted.is_some() {
            return;
        }
        match self.connection.on_disconnected() {
            ReconnectDecision::RetryAfter(delay) => {
                self.reconnect_at = Some(Instant::now() + delay);
            }
            ReconnectDecision::GiveUp { attempts } => {
                self.halt(SessionError::ReconnectExhausted { attempts }.to_string());
            }
        }
        self.publish_status();
    }

    fn halt(&mut self, reason: String) {
        tracing::error!(account = %self.account, %reason, "session_halted");
        self.reconnect_at = None;
        self.halted = Some(reason.clone());
        self.emit(SessionEvent::Halted { reason });
        self.publish_status();
    }

    fn connection_lost(&mut self, err: SessionError) {
        tracing::warn!(account = %self.account, %err, kind = %err.kind(), "connection_lost");
        self.teardown(&err);
        self.schedule_reconnect();
    }

    /// Drops the link and fails everything that was waiting on it.
    fn teardown(&mut self, reason: &SessionError) {
        self.link = None;
        self.login_deadline = None;
        self.probe = None;
        self.connection.close();
        self.auth.reset();
        self.subscriptions.on_disconnected();
        for request in self.correlator.cancel_all() {
            self.abandon(request.slot, cancellation(reason));
        }
        self.history_in_flight.clear();
        self.publish_status();
    }

    /// Finishes a completion that will never get its response. Internal
    /// continuations are dropped; their state is rebuilt on the next `Ready`.
    fn abandon(&mut self, slot: Completion, error: SessionError) {
        match slot {
            Completion::Caller(reply) => {
                let _ = reply.send(Err(error));
            }
            Completion::Logout(reply) => {
                let _ = reply.send(Err(error));
            }
            Completion::History { key, probe } => {
                if probe {
                    self.probe = None;
                } else {
                    self.history_in_flight.remove(&key);
                }
            }
            Completion::AppAuth
            | Completion::AccountAuth
            | Completion::Refresh
            | Completion::Subscribe(_)
            | Completion::Unsubscribe(_) => {}
        }
    }

    fn dispatch(&mut self, message: OutboundMessage, policy: RequestPolicy, completion: Completion) {
        if self.link.is_none() || !self.auth.can_send(&message) {
            let state = self.connection.state();
            self.abandon(completion, SessionError::NotReady(state));
            return;
        }
        let id = match self
            .correlator
            .register(message.clone(), policy, completion, Instant::now())
        {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(%err, "request_register_failed");
                return;
            }
        };
        let sent = match self.link.as_ref() {
            Some(link) => link.send_message(&message, Some(id)),
            None => Err(SessionError::NotReady(self.connection.state())),
        };
        if let Err(err) = sent {
            if let Some(request) = self.correlator.resolve(id) {
                self.abandon(request.slot, err);
            }
        }
    }

    fn send_subscription(&mut self, command: SubscriptionCommand) {
        let message = command.to_message(self.account);
        let completion = match command {
            SubscriptionCommand::Subscribe(spec) => Completion::Subscribe(spec),
            SubscriptionCommand::Unsubscribe(spec) => Completion::Unsubscribe(spec),
        };
        self.dispatch(message, self.config.request_policy(), completion);
    }

    fn request_history(&mut self, key: SeriesKey, probe: bool) {
        if !probe && !self.history_in_flight.insert(key) {
            return;
        }
        let (symbol, period) = key;
        let to = Utc::now().timestamp_millis();
        let from = history_from(period, to);
        let message = OutboundMessage::GetTrendbars(GetTrendbarsReq {
            ctid_trader_account_id: self.account,
            from_timestamp: from,
            to_timestamp: to,
            period,
            symbol_id: symbol,
            count: Some(HISTORY_BARS as u32),
        });
        self.dispatch(
            message,
            self.config.request_policy(),
            Completion::History { key, probe },
        );
    }

    fn handle_link_event(&mut self, event: Option<LinkEvent>) {
        match event {
            Some(LinkEvent::Frame(frame)) => {
                if let Err(err) = self.handle_frame(&frame) {
                    self.connection_lost(err);
                }
            }
            Some(LinkEvent::Failed(err)) => self.connection_lost(err),
            Some(LinkEvent::Closed) | None => {
                self.connection_lost(SessionError::Transport("connection closed by peer".into()))
            }
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) -> Result<()> {
        let envelope = Envelope::decode(frame)?;
        let message = InboundMessage::decode(&envelope)?;
        let now = Instant::now();
        match message {
            InboundMessage::Heartbeat => self.watchdog.on_heartbeat(now),
            _ => self.watchdog.on_market_data(now),
        }

        let mut consumed = false;
        if let Some(id) = envelope
            .client_msg_id
            .as_deref()
            .and_then(CorrelationId::parse_wire)
        {
            if self.correlator.contains(id) {
                self.complete(id, &message);
                consumed = true;
            } else {
                tracing::debug!(
                    correlation_id = %id,
                    payload_type = envelope.payload_type,
                    "dropping response for unknown request"
                );
            }
        }
        self.handle_push(message, consumed);
        Ok(())
    }

    fn complete(&mut self, id: CorrelationId, message: &InboundMessage) {
        if let Some((code, description)) = message.rejection() {
            let Some((request, error)) = self.correlator.reject(id, &code, &description) else {
                return;
            };
            let auth_request = matches!(
                request.slot,
                Completion::AppAuth | Completion::AccountAuth | Completion::Refresh
            );
            self.finish(request.slot, Err(error));
            if !auth_request && classify_broker_code(&code) == BrokerCodeClass::AuthInvalid {
                self.revoke(self.account, &code);
            }
        } else if let Some(request) = self.correlator.resolve(id) {
            self.finish(request.slot, Ok(message.clone()));
        }
    }

    fn handle_push(&mut self, message: InboundMessage, consumed: bool) {
        match message {
            InboundMessage::SpotEvent(event) => self.on_spot(&event),
            InboundMessage::DepthEvent(event) => self.on_depth(&event),
            InboundMessage::ExecutionEvent(event) => self.emit(SessionEvent::Execution(event)),
            InboundMessage::OrderErrorEvent(event) => self.emit(SessionEvent::OrderError(event)),
            InboundMessage::ErrorRes(err) if !consumed => {
                tracing::warn!(code = %err.error_code, description = ?err.description, "broker_error");
                let account = err.ctid_trader_account_id.unwrap_or(self.account);
                let auth_invalid =
                    classify_broker_code(&err.error_code) == BrokerCodeClass::AuthInvalid;
                self.emit(SessionEvent::BrokerError {
                    code: err.error_code.clone(),
                    description: err.description.unwrap_or_default(),
                });
                if auth_invalid {
                    self.revoke(account, &err.error_code);
                }
            }
            InboundMessage::TokenInvalidated(event) => {
                let reason = event
                    .reason
                    .unwrap_or_else(|| "token invalidated".to_string());
                for account in event.ctid_trader_account_ids {
                    self.revoke(account, &reason);
                }
            }
            InboundMessage::AccountDisconnect(event) => {
                self.revoke(event.ctid_trader_account_id, "account disconnected");
            }
            InboundMessage::Unknown { payload_type } if !consumed => {
                tracing::debug!(payload_type, "ignoring unknown payload type");
            }
            _ => {}
        }
    }

    fn on_spot(&mut self, event: &SpotEvent) {
        let events = &self.events;
        let outcome = self.cache.apply_spot(event, &mut |candle| {
            let _ = events.send(SessionEvent::SealedCandle(candle));
        });
        for key in outcome.needs_history {
            self.request_history(key, false);
        }
        self.cache.publish();
    }

    fn on_depth(&mut self, event: &DepthEvent) {
        self.cache.apply_depth(event);
        self.cache.publish();
        self.emit(SessionEvent::Depth(event.symbol_id));
    }

    /// Cancels the account's pending work; for the active account the link is
    /// dropped and authentication starts over.
    fn revoke(&mut self, account: AccountId, reason: &str) {
        tracing::warn!(account = %account, reason, "account_revoked");
        for request in self.correlator.cancel_account(account) {
            self.abandon(request.slot, SessionError::AuthRevoked { account });
        }
        self.emit(SessionEvent::AuthRevoked { account });
        if self.auth.revoke(account) {
            self.teardown(&SessionError::AuthRevoked { account });
            if self.halted.is_none() {
                self.reconnect_at = Some(Instant::now());
            }
        }
    }

    fn auth_failed(&mut self, err: SessionError) {
        let reason = err.to_string();
        self.auth.fail(&reason);
        self.emit(SessionEvent::AuthFailed {
            reason: reason.clone(),
        });
        self.teardown(&err);
        self.halt(format!("authentication failed: {reason}"));
    }

    fn finish(&mut self, slot: Completion, result: Result<InboundMessage>) {
        match slot {
            Completion::Caller(reply) => {
                let _ = reply.send(result);
            }
            Completion::AppAuth => match result {
                Ok(InboundMessage::ApplicationAuthRes) => {
                    let next = self
                        .auth
                        .app_auth_succeeded()
                        .and_then(|_| self.auth.begin_account_auth());
                    match next {
                        Ok(message) => self.dispatch(
                            message,
                            self.config.auth_policy(),
                            Completion::AccountAuth,
                        ),
                        Err(err) => self.auth_failed(err),
                    }
                }
                Ok(other) => self.auth_failed(SessionError::Protocol(format!(
                    "unexpected application auth response: {other:?}"
                ))),
                Err(err) => self.auth_failed(err),
            },
            Completion::AccountAuth => match result {
                Ok(InboundMessage::AccountAuthRes(res)) => {
                    match self
                        .auth
                        .account_auth_succeeded(res.ctid_trader_account_id, Instant::now())
                    {
                        Ok(()) => self.on_ready(),
                        Err(err) => self.auth_failed(err),
                    }
                }
                Ok(other) => self.auth_failed(SessionError::Protocol(format!(
                    "unexpected account auth response: {other:?}"
                ))),
                Err(err) => self.auth_failed(err),
            },
            Completion::Refresh => match result {
                Ok(InboundMessage::RefreshTokenRes(res)) => {
                    if let Err(err) = self.auth.refresh_succeeded(res, Instant::now()) {
                        self.auth_failed(err);
                    }
                    self.publish_status();
                }
                Ok(other) => self.auth_failed(SessionError::Protocol(format!(
                    "unexpected refresh response: {other:?}"
                ))),
                Err(err) => self.auth_failed(err),
            },
            Completion::Subscribe(spec) => match result {
                Ok(_) => self.on_subscribed(spec),
                Err(SessionError::BrokerRejected { ref code, .. })
                    if classify_broker_code(code) == BrokerCodeClass::AlreadySubscribed =>
                {
                    self.on_subscribed(spec)
                }
                Err(err) => {
                    self.subscriptions.on_failed(spec, &err);
                    self.emit(SessionEvent::SubscriptionFailed {
                        spec,
                        error: err.to_string(),
                    });
                }
            },
            Completion::Unsubscribe(spec) => match result {
                Ok(_) => {
                    if let Some(command) = self.subscriptions.on_unsubscribed(spec) {
                        self.send_subscription(command);
                    }
                }
                Err(err) => {
                    self.subscriptions.on_unsubscribe_failed(spec, &err);
                    self.emit(SessionEvent::SubscriptionFailed {
                        spec,
                        error: err.to_string(),
                    });
                }
            },
            Completion::History { key, probe } => self.on_history(key, probe, result),
            Completion::Logout(reply) => match result {
                Ok(_) => {
                    tracing::info!(account = %self.account, "logged_out");
                    self.teardown(&SessionError::Cancelled("logout"));
                    self.halted = Some("logged out".to_string());
                    self.reconnect_at = None;
                    self.publish_status();
                    let _ = reply.send(Ok(()));
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
        }
    }

    fn on_subscribed(&mut self, spec: SubscriptionSpec) {
        if let Some(command) = self.subscriptions.on_acknowledged(spec) {
            self.send_subscription(command);
        }
        if let SubscriptionKind::Trendbar(period) = spec.kind {
            if !self.cache.has_baseline(spec.symbol, period) {
                self.request_history((spec.symbol, period), false);
            }
        }
    }

    fn on_history(&mut self, key: SeriesKey, probe: bool, result: Result<InboundMessage>) {
        if !probe {
            self.history_in_flight.remove(&key);
        }
        let outcome = match result {
            Ok(InboundMessage::GetTrendbarsRes(res)) => {
                let now_minutes = utc_minutes(Utc::now());
                let fresh = history_is_fresh(&res, now_minutes);
                let candles = self.cache.seed_history(&res, now_minutes);
                self.cache.publish();
                self.emit(SessionEvent::History {
                    symbol: res.symbol_id,
                    period: res.period,
                    candles,
                });
                if fresh {
                    ProbeResult::Fresh
                } else {
                    ProbeResult::Stale
                }
            }
            Ok(other) => {
                tracing::warn!(?key, response = ?other, "unexpected history response");
                ProbeResult::Failed
            }
            Err(err) => {
                tracing::warn!(?key, %err, "history_fetch_failed");
                ProbeResult::Failed
            }
        };
        if outcome == ProbeResult::Failed && !probe {
            self.cache.history_unavailable(key, utc_minutes(Utc::now()));
        }
        if probe {
            self.on_probe_result(outcome);
        }
    }

    fn on_probe_result(&mut self, result: ProbeResult) {
        let Some(probe) = self.probe.as_mut() else {
            return;
        };
        probe.outstanding = probe.outstanding.saturating_sub(1);
        match result {
            ProbeResult::Stale => probe.stale = true,
            ProbeResult::Failed => probe.failed = true,
            ProbeResult::Fresh => {}
        }
        if probe.outstanding > 0 {
            return;
        }
        let overall = if probe.failed {
            ProbeResult::Failed
        } else if probe.stale {
            ProbeResult::Stale
        } else {
            ProbeResult::Fresh
        };
        self.probe = None;
        if let Some(RecoveryAction::Reconnect) =
            self.watchdog.on_probe_finished(overall, Instant::now())
        {
            self.force_reconnect("watchdog probe failed");
        }
    }

    fn on_ready(&mut self) {
        let reconnected = self.connection.mark_ready();
        let generation = self.connection.generation();
        self.login_deadline = None;
        self.watchdog.on_recovered(Instant::now());
        self.cache.reset_live();
        self.history_in_flight.clear();
        self.cache.publish();
        for command in self.subscriptions.replay() {
            self.send_subscription(command);
        }
        tracing::info!(account = %self.account, generation, reconnected, "session_ready");
        self.emit(SessionEvent::Ready {
            generation,
            reconnected,
        });
        self.publish_status();
    }

    fn on_login_timeout(&mut self) {
        self.login_deadline = None;
        if self.connection.state() == ConnectionState::Ready {
            return;
        }
        self.auth.fail("login flow timed out");
        self.connection_lost(SessionError::Transport("login flow timed out".into()));
    }

    fn poll_requests(&mut self) {
        for action in self.correlator.poll(Instant::now()) {
            match action {
                CorrelatorAction::Resend { id, message, .. } => {
                    let sent = match self.link.as_ref() {
                        Some(link) => link.send_message(&message, Some(id)),
                        None => Err(SessionError::NotReady(self.connection.state())),
                    };
                    if let Err(err) = sent {
                        tracing::warn!(correlation_id = %id, %err, "resend_failed");
                    }
                }
                CorrelatorAction::Expired { slot, error, .. } => self.finish(slot, Err(error)),
            }
        }
    }

    fn start_refresh(&mut self) {
        match self.auth.begin_refresh() {
            Ok(Some(message)) => {
                self.dispatch(message, self.config.auth_policy(), Completion::Refresh)
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(%err, "token_refresh_not_started"),
        }
        self.publish_status();
    }

    fn send_heartbeat(&self) {
        if let Some(link) = &self.link {
            if let Err(err) = link.send_message(&OutboundMessage::Heartbeat, None) {
                tracing::debug!(%err, "heartbeat_send_failed");
            }
        }
    }

    fn on_watchdog_tick(&mut self) {
        if self.connection.state() != ConnectionState::Ready || self.halted.is_some() {
            return;
        }
        for command in self.subscriptions.retry_unsubscribes() {
            self.send_subscription(command);
        }
        let has_subscriptions = self.subscriptions.has_market_data();
        match self.watchdog.tick(Instant::now(), has_subscriptions) {
            Some(RecoveryAction::Probe) => self.start_probe(),
            Some(RecoveryAction::Reconnect) => self.force_reconnect("watchdog liveness lost"),
            None => {}
        }
    }

    fn start_probe(&mut self) {
        let mut keys: BTreeSet<SeriesKey> = self.subscriptions.trendbars().collect();
        let symbols: Vec<SymbolId> = self
            .subscriptions
            .desired()
            .iter()
            .map(|spec| spec.symbol)
            .collect();
        for symbol in symbols {
            if !keys.iter().any(|(probed, _)| *probed == symbol) {
                keys.insert((symbol, TrendbarPeriod::M1));
            }
        }
        if keys.is_empty() {
            self.force_reconnect("watchdog liveness lost");
            return;
        }
        tracing::info!(series = keys.len(), "watchdog_probe");
        self.probe = Some(ProbeState {
            outstanding: keys.len(),
            ..ProbeState::default()
        });
        for key in keys {
            self.request_history(key, true);
        }
    }

    fn force_reconnect(&mut self, reason: &'static str) {
        tracing::warn!(account = %self.account, reason, "forcing_reconnect");
        self.teardown(&SessionError::Transport(reason.to_string()));
        if self.halted.is_none() {
            self.reconnect_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_keeps_revocation_and_cancel_reasons() {
        let account = AccountId::new(7);
        assert!(matches!(
            cancellation(&SessionError::AuthRevoked { account }),
            SessionError::AuthRevoked { account: a } if a == account
        ));
        assert!(matches!(
            cancellation(&SessionError::Cancelled("logout")),
            SessionError::Cancelled("logout")
        ));
        let mapped = cancellation(&SessionError::Protocol("bad frame".into()));
        assert!(matches!(mapped, SessionError::Transport(ref msg) if msg.contains("bad frame")));
    }

    #[test]
    fn history_lookback_spans_a_week_at_least() {
        let to = 1_700_000_000_000;
        assert_eq!(to - history_from(TrendbarPeriod::M1, to), MIN_HISTORY_LOOKBACK_MS);
        assert_eq!(to - history_from(TrendbarPeriod::H1, to), MIN_HISTORY_LOOKBACK_MS);
        assert_eq!(
            to - history_from(TrendbarPeriod::H4, to),
            HISTORY_BARS * 4 * 60 * 60_000
        );
    }

    #[tokio::test]
    async fn requests_before_ready_are_refused() {
        /// Accepts connections and never answers.
        #[derive(Default)]
        struct Silent {
            peers: std::sync::Mutex<Vec<tokio::io::DuplexStream>>,
        }

        #[async_trait]
        impl Transport for Silent {
            async fn connect(&self) -> std::io::Result<Box<dyn crate::connection::AsyncStream>> {
                let (client, server) = tokio::io::duplex(1024);
                self.peers.lock().unwrap().push(server);
                Ok(Box::new(client))
            }
        }

        let config = SessionConfig::from_toml_str("account_id = 9\n").unwrap();
        let handle = spawn_session(config, Arc::new(Silent::default()));
        let err = handle
            .request(OutboundMessage::Heartbeat)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotReady(_)));
        assert_ne!(handle.status().borrow().state, ConnectionState::Ready);
        handle.shutdown().await;
    }
}
