use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use ctrader_session::{
    connection::AsyncStream,
    messages::{
        OutboundMessage, NewOrderReq, SymbolsReq, ORDER_TYPE_MARKET, PAYLOAD_ACCOUNT_AUTH_REQ,
        PAYLOAD_ACCOUNT_AUTH_RES, PAYLOAD_ACCOUNT_DISCONNECT_EVENT, PAYLOAD_ACCOUNT_LOGOUT_REQ,
        PAYLOAD_ACCOUNT_LOGOUT_RES, PAYLOAD_APPLICATION_AUTH_REQ, PAYLOAD_APPLICATION_AUTH_RES,
        PAYLOAD_ERROR_RES, PAYLOAD_GET_TRENDBARS_REQ, PAYLOAD_GET_TRENDBARS_RES,
        PAYLOAD_NEW_ORDER_REQ, PAYLOAD_SPOT_EVENT, PAYLOAD_SUBSCRIBE_LIVE_TRENDBAR_REQ,
        PAYLOAD_SUBSCRIBE_LIVE_TRENDBAR_RES, PAYLOAD_SUBSCRIBE_SPOTS_REQ,
        PAYLOAD_SUBSCRIBE_SPOTS_RES, PAYLOAD_SYMBOL_BY_ID_REQ, PAYLOAD_SYMBOL_BY_ID_RES,
        PAYLOAD_ACCOUNTS_TOKEN_INVALIDATED_EVENT,
    },
    types::utc_minutes,
    encode_frame, Envelope, FrameDecoder, InboundMessage, Price, SessionConfig, SessionError,
    SessionEvent, SessionHandle, SubscriptionSpec, SymbolId, TradeSide, Transport, TrendbarPeriod,
};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::{broadcast, mpsc},
    time::{timeout, Instant},
};

const ACCOUNT: i64 = 42;
const SYMBOL: i64 = 1;
const MAX_FRAME: usize = 1024 * 1024;
const WAIT: Duration = Duration::from_secs(30);

/// Hands the client half of a fresh in-memory pipe to the session and the
/// server half to the fake broker.
struct DuplexTransport {
    accepted: mpsc::UnboundedSender<DuplexStream>,
    connections: AtomicUsize,
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn connect(&self) -> io::Result<Box<dyn AsyncStream>> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.accepted
            .send(server)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "broker gone"))?;
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(client))
    }
}

/// Request payload types the broker has seen, in arrival order.
type Seen = Arc<Mutex<Vec<u32>>>;

struct Harness {
    handle: SessionHandle,
    events: broadcast::Receiver<SessionEvent>,
    pushes: mpsc::UnboundedSender<Envelope>,
    transport: Arc<DuplexTransport>,
    seen: Seen,
    script: Arc<Script>,
}

/// Per-test deviations from the canned replies.
#[derive(Default)]
struct Script {
    /// Requests of a type left unanswered, counted down per request.
    unanswered: Mutex<HashMap<u32, usize>>,
    /// Broker error code sent instead of the reply.
    rejected: Mutex<HashMap<u32, &'static str>>,
    /// Reply payload type swapped for another one, keeping the message id.
    reply_as: Mutex<HashMap<u32, u32>>,
    /// Extra minutes subtracted from every history bar.
    history_age: AtomicI64,
    /// Arrival time of every request.
    arrivals: Mutex<Vec<(u32, Instant)>>,
}

impl Script {
    fn leave_unanswered(&self, payload_type: u32, times: usize) {
        self.unanswered.lock().unwrap().insert(payload_type, times);
    }

    fn reject(&self, payload_type: u32, code: &'static str) {
        self.rejected.lock().unwrap().insert(payload_type, code);
    }

    fn arrivals_of(&self, payload_type: u32) -> Vec<Instant> {
        self.arrivals
            .lock()
            .unwrap()
            .iter()
            .filter(|(seen, _)| *seen == payload_type)
            .map(|(_, at)| *at)
            .collect()
    }

    fn answer(&self, request: &Envelope) -> Option<Envelope> {
        let id = request.client_msg_id.clone();
        self.arrivals
            .lock()
            .unwrap()
            .push((request.payload_type, Instant::now()));
        if let Some(left) = self.unanswered.lock().unwrap().get_mut(&request.payload_type) {
            if *left > 0 {
                *left -= 1;
                return None;
            }
        }
        if let Some(code) = self.rejected.lock().unwrap().get(&request.payload_type) {
            return Some(envelope(
                PAYLOAD_ERROR_RES,
                id,
                json!({
                    "ctidTraderAccountId": ACCOUNT,
                    "errorCode": code,
                    "description": "refused by broker",
                }),
            ));
        }
        if let Some(payload_type) = self.reply_as.lock().unwrap().get(&request.payload_type) {
            return Some(envelope(*payload_type, id, json!({})));
        }
        respond(request, self.history_age.load(Ordering::SeqCst))
    }
}

fn envelope(payload_type: u32, id: Option<String>, body: Value) -> Envelope {
    Envelope::new(payload_type, id, body.to_string().into_bytes())
}

/// Canned reply for each request type. History ends at least two minutes ago
/// so both bars are sealed whatever the wall clock does meanwhile.
fn respond(request: &Envelope, history_age: i64) -> Option<Envelope> {
    let id = request.client_msg_id.clone();
    let account = json!({ "ctidTraderAccountId": ACCOUNT });
    let reply = match request.payload_type {
        PAYLOAD_APPLICATION_AUTH_REQ => envelope(PAYLOAD_APPLICATION_AUTH_RES, id, json!({})),
        PAYLOAD_ACCOUNT_AUTH_REQ => envelope(PAYLOAD_ACCOUNT_AUTH_RES, id, account),
        PAYLOAD_ACCOUNT_LOGOUT_REQ => envelope(PAYLOAD_ACCOUNT_LOGOUT_RES, id, account),
        PAYLOAD_SUBSCRIBE_SPOTS_REQ => envelope(PAYLOAD_SUBSCRIBE_SPOTS_RES, id, account),
        PAYLOAD_SUBSCRIBE_LIVE_TRENDBAR_REQ => {
            envelope(PAYLOAD_SUBSCRIBE_LIVE_TRENDBAR_RES, id, account)
        }
        PAYLOAD_SYMBOL_BY_ID_REQ => envelope(
            PAYLOAD_SYMBOL_BY_ID_RES,
            id,
            json!({
                "ctidTraderAccountId": ACCOUNT,
                "symbol": [{ "symbolId": SYMBOL, "enabled": true }],
            }),
        ),
        PAYLOAD_GET_TRENDBARS_REQ => {
            let now = utc_minutes(Utc::now()) - history_age;
            envelope(
                PAYLOAD_GET_TRENDBARS_RES,
                id,
                json!({
                    "ctidTraderAccountId": ACCOUNT,
                    "period": 1,
                    "symbolId": SYMBOL,
                    "trendbar": [
                        { "low": 109_990, "deltaOpen": 5, "deltaClose": 10, "deltaHigh": 20,
                          "volume": 3, "utcTimestampInMinutes": now - 3 },
                        { "low": 110_000, "deltaOpen": 4, "deltaClose": 20, "deltaHigh": 25,
                          "volume": 5, "utcTimestampInMinutes": now - 2 },
                    ],
                }),
            )
        }
        PAYLOAD_NEW_ORDER_REQ => envelope(
            PAYLOAD_ERROR_RES,
            id,
            json!({
                "ctidTraderAccountId": ACCOUNT,
                "errorCode": "NOT_ENOUGH_MONEY",
                "description": "insufficient margin",
            }),
        ),
        _ => return None,
    };
    Some(reply)
}

async fn write_envelope(stream: &mut DuplexStream, envelope: &Envelope) -> bool {
    let Ok(payload) = envelope.encode() else {
        return false;
    };
    let Ok(frame) = encode_frame(&payload, MAX_FRAME) else {
        return false;
    };
    stream.write_all(&frame).await.is_ok()
}

/// Serves one connection until the client drops it.
async fn serve(
    mut stream: DuplexStream,
    pushes: &mut mpsc::UnboundedReceiver<Envelope>,
    seen: &Seen,
    script: &Script,
) {
    let mut decoder = FrameDecoder::new(MAX_FRAME);
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                while let Ok(Some(frame)) = decoder.next_frame() {
                    let Ok(request) = Envelope::decode(&frame) else {
                        return;
                    };
                    seen.lock().unwrap().push(request.payload_type);
                    if let Some(reply) = script.answer(&request) {
                        if !write_envelope(&mut stream, &reply).await {
                            return;
                        }
                    }
                }
            }
            Some(push) = pushes.recv() => {
                if !write_envelope(&mut stream, &push).await {
                    return;
                }
            }
        }
    }
}

fn config() -> SessionConfig {
    config_with(&[])
}

/// Test config with some keys replaced or added.
fn config_with(overrides: &[(&str, &str)]) -> SessionConfig {
    let mut keys: Vec<(&str, String)> = [
        ("client_id", "\"client\""),
        ("client_secret", "\"secret\""),
        ("access_token", "\"token\""),
        ("account_id", "42"),
        ("request_timeout_secs", "2.0"),
        ("auth_timeout_secs", "2.0"),
        ("login_flow_timeout_secs", "5.0"),
        ("reconnect_delay_secs", "0.5"),
        ("reconnect_max_delay_secs", "1.0"),
        ("heartbeat_interval_secs", "3600.0"),
        ("watchdog_tick_secs", "3600.0"),
    ]
    .into_iter()
    .map(|(key, value)| (key, value.to_string()))
    .collect();
    for (key, value) in overrides {
        match keys.iter_mut().find(|(existing, _)| existing == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => keys.push((key, value.to_string())),
        }
    }
    let body: String = keys
        .iter()
        .map(|(key, value)| format!("{key} = {value}\n"))
        .collect();
    SessionConfig::from_toml_str(&format!("[session]\n{body}")).expect("test config is valid")
}

fn start() -> Harness {
    start_with(Script::default(), config())
}

fn start_with(script: Script, config: SessionConfig) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let script = Arc::new(script);

    let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
    let (pushes, mut push_rx) = mpsc::unbounded_channel();
    let seen: Seen = Arc::default();
    let broker_seen = seen.clone();
    let broker_script = script.clone();
    tokio::spawn(async move {
        while let Some(stream) = accepted.recv().await {
            serve(stream, &mut push_rx, &broker_seen, &broker_script).await;
        }
    });

    let transport = Arc::new(DuplexTransport {
        accepted: accepted_tx,
        connections: AtomicUsize::new(0),
    });
    let handle = ctrader_session::spawn_session(config, transport.clone());
    let events = handle.events();
    Harness {
        handle,
        events,
        pushes,
        transport,
        seen,
        script,
    }
}

async fn ready(harness: &Harness) {
    timeout(WAIT, harness.handle.wait_ready())
        .await
        .expect("ready in time")
        .expect("login succeeds");
}

fn count(seen: &Seen, payload_type: u32) -> usize {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|t| **t == payload_type)
        .count()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition holds in time")
}

fn symbol_lookup(handle: &SessionHandle) -> OutboundMessage {
    OutboundMessage::SymbolById(SymbolsReq {
        ctid_trader_account_id: handle.account(),
        symbol_id: vec![SymbolId::new(SYMBOL)],
    })
}

async fn next_matching<F>(events: &mut broadcast::Receiver<SessionEvent>, mut wanted: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("session event stream closed"),
            }
        }
    })
    .await
    .expect("event arrives in time")
}

fn spot(body: Value) -> Envelope {
    envelope(PAYLOAD_SPOT_EVENT, None, body)
}

#[tokio::test]
async fn login_reaches_ready_and_answers_correlated_requests() {
    let mut harness = start();
    timeout(WAIT, harness.handle.wait_ready())
        .await
        .expect("ready in time")
        .expect("login succeeds");

    let ready = next_matching(&mut harness.events, |e| matches!(e, SessionEvent::Ready { .. })).await;
    assert!(matches!(
        ready,
        SessionEvent::Ready {
            reconnected: false,
            ..
        }
    ));

    let response = harness
        .handle
        .request(OutboundMessage::SymbolById(SymbolsReq {
            ctid_trader_account_id: harness.handle.account(),
            symbol_id: vec![SymbolId::new(SYMBOL)],
        }))
        .await
        .expect("symbol lookup succeeds");
    match response {
        InboundMessage::SymbolByIdRes(res) => {
            assert_eq!(res.symbol.len(), 1);
            assert!(res.symbol[0].is_tradable());
        }
        other => panic!("unexpected response {other:?}"),
    }

    let seen = harness.seen.lock().unwrap().clone();
    assert_eq!(
        &seen[..2],
        &[PAYLOAD_APPLICATION_AUTH_REQ, PAYLOAD_ACCOUNT_AUTH_REQ]
    );
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn broker_rejection_surfaces_to_the_caller() {
    let harness = start();
    timeout(WAIT, harness.handle.wait_ready())
        .await
        .expect("ready in time")
        .expect("login succeeds");

    let err = harness
        .handle
        .request(OutboundMessage::NewOrder(NewOrderReq {
            ctid_trader_account_id: harness.handle.account(),
            symbol_id: SymbolId::new(SYMBOL),
            order_type: ORDER_TYPE_MARKET,
            trade_side: TradeSide::Buy,
            volume: 100_000,
            label: None,
        }))
        .await
        .expect_err("order is rejected");
    match err {
        SessionError::BrokerRejected { code, .. } => assert_eq!(code, "NOT_ENOUGH_MONEY"),
        other => panic!("unexpected error {other:?}"),
    }

    // A rejection is a verdict, not a transport failure: the session stays up.
    assert_eq!(harness.transport.connections.load(Ordering::SeqCst), 1);
    let orders = harness
        .seen
        .lock()
        .unwrap()
        .iter()
        .filter(|t| **t == PAYLOAD_NEW_ORDER_REQ)
        .count();
    assert_eq!(orders, 1);
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn live_trendbar_seals_candles_after_history_seed() {
    let mut harness = start();
    timeout(WAIT, harness.handle.wait_ready())
        .await
        .expect("ready in time")
        .expect("login succeeds");

    harness
        .handle
        .subscribe(SubscriptionSpec::trendbar(
            SymbolId::new(SYMBOL),
            TrendbarPeriod::M1,
        ))
        .await
        .expect("subscribe accepted");

    let history = next_matching(&mut harness.events, |e| matches!(e, SessionEvent::History { .. })).await;
    let SessionEvent::History { candles, .. } = history else {
        unreachable!()
    };
    assert_eq!(candles.len(), 2);
    assert!(candles.iter().all(|c| c.closed));
    let last_sealed = candles[1].open_minutes;
    assert_eq!(candles[1].close, Price::ticks(110_020));

    // Live bars are deltas against the last sealed close (110_020).
    let live_minute = last_sealed + 1;
    harness
        .pushes
        .send(spot(json!({
            "ctidTraderAccountId": ACCOUNT,
            "symbolId": SYMBOL,
            "bid": 110_030,
            "ask": 110_045,
            "trendbar": [{ "period": 1, "deltaLow": -10, "deltaOpen": 5, "deltaClose": 15,
                           "deltaHigh": 30, "volume": 7, "utcTimestampInMinutes": live_minute }],
        })))
        .unwrap();
    harness
        .pushes
        .send(spot(json!({
            "ctidTraderAccountId": ACCOUNT,
            "symbolId": SYMBOL,
            "trendbar": [{ "period": 1, "deltaLow": 0, "volume": 1,
                           "utcTimestampInMinutes": live_minute + 1 }],
        })))
        .unwrap();

    let sealed = next_matching(&mut harness.events, |e| matches!(e, SessionEvent::SealedCandle(_))).await;
    let SessionEvent::SealedCandle(candle) = sealed else {
        unreachable!()
    };
    assert!(candle.closed);
    assert_eq!(candle.open_minutes, live_minute);
    assert_eq!(candle.low, Price::ticks(110_010));
    assert_eq!(candle.open, Price::ticks(110_015));
    assert_eq!(candle.close, Price::ticks(110_025));
    assert_eq!(candle.high, Price::ticks(110_040));

    // The second spot carried no quote; the first one's bid/ask are kept.
    let market = harness.handle.market();
    let snapshot = market.borrow().clone();
    let quote = snapshot.quotes[&SymbolId::new(SYMBOL)];
    assert_eq!(quote.bid, Some(Price::ticks(110_030)));
    assert_eq!(quote.ask, Some(Price::ticks(110_045)));

    let seen = harness.seen.lock().unwrap().clone();
    assert!(seen.contains(&PAYLOAD_SUBSCRIBE_SPOTS_REQ));
    assert!(seen.contains(&PAYLOAD_SUBSCRIBE_LIVE_TRENDBAR_REQ));
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn account_disconnect_reauthenticates_and_replays_subscriptions() {
    let mut harness = start();
    timeout(WAIT, harness.handle.wait_ready())
        .await
        .expect("ready in time")
        .expect("login succeeds");
    harness
        .handle
        .subscribe(SubscriptionSpec::spot(SymbolId::new(SYMBOL)))
        .await
        .expect("subscribe accepted");

    harness
        .pushes
        .send(envelope(
            PAYLOAD_ACCOUNT_DISCONNECT_EVENT,
            None,
            json!({ "ctidTraderAccountId": ACCOUNT }),
        ))
        .unwrap();

    let revoked =
        next_matching(&mut harness.events, |e| matches!(e, SessionEvent::AuthRevoked { .. })).await;
    assert!(matches!(
        revoked,
        SessionEvent::AuthRevoked { account } if account.0 == ACCOUNT
    ));
    let ready = next_matching(&mut harness.events, |e| {
        matches!(e, SessionEvent::Ready { reconnected: true, .. })
    })
    .await;
    assert!(matches!(ready, SessionEvent::Ready { generation: 2, .. }));
    assert_eq!(harness.transport.connections.load(Ordering::SeqCst), 2);

    // Second login ran the full auth sequence and re-sent the spot subscription.
    let seen = harness.seen.lock().unwrap().clone();
    let app_auths = seen
        .iter()
        .filter(|t| **t == PAYLOAD_APPLICATION_AUTH_REQ)
        .count();
    assert_eq!(app_auths, 2);
    wait_until(|| count(&harness.seen, PAYLOAD_SUBSCRIBE_SPOTS_REQ) == 2).await;
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn logout_halts_and_refuses_further_requests() {
    let harness = start();
    timeout(WAIT, harness.handle.wait_ready())
        .await
        .expect("ready in time")
        .expect("login succeeds");

    harness.handle.logout().await.expect("logout acknowledged");
    let status = harness.handle.status().borrow().clone();
    assert_eq!(status.halted.as_deref(), Some("logged out"));

    let err = harness
        .handle
        .request(OutboundMessage::SymbolById(SymbolsReq {
            ctid_trader_account_id: harness.handle.account(),
            symbol_id: vec![SymbolId::new(SYMBOL)],
        }))
        .await
        .expect_err("session is halted");
    assert!(matches!(err, SessionError::NotReady(_)));
    assert!(harness
        .seen
        .lock()
        .unwrap()
        .contains(&PAYLOAD_ACCOUNT_LOGOUT_REQ));
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn token_invalidation_fails_pending_requests_and_reauthenticates() {
    let script = Script::default();
    script.leave_unanswered(PAYLOAD_SYMBOL_BY_ID_REQ, 1);
    let mut harness = start_with(script, config());
    ready(&harness).await;

    let handle = harness.handle.clone();
    let pending = tokio::spawn(async move { handle.request(symbol_lookup(&handle)).await });
    wait_until(|| count(&harness.seen, PAYLOAD_SYMBOL_BY_ID_REQ) == 1).await;

    harness
        .pushes
        .send(envelope(
            PAYLOAD_ACCOUNTS_TOKEN_INVALIDATED_EVENT,
            None,
            json!({ "ctidTraderAccountIds": [ACCOUNT], "reason": "token revoked" }),
        ))
        .unwrap();

    let err = timeout(WAIT, pending)
        .await
        .expect("request settles in time")
        .expect("request task joins")
        .expect_err("pending request is cancelled");
    assert!(matches!(err, SessionError::AuthRevoked { account } if account.0 == ACCOUNT));

    next_matching(&mut harness.events, |e| {
        matches!(e, SessionEvent::Ready { reconnected: true, .. })
    })
    .await;
    assert_eq!(harness.transport.connections.load(Ordering::SeqCst), 2);
    assert_eq!(count(&harness.seen, PAYLOAD_APPLICATION_AUTH_REQ), 2);
    // The cancelled request was not replayed on the new connection.
    assert_eq!(count(&harness.seen, PAYLOAD_SYMBOL_BY_ID_REQ), 1);
    harness.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stale_watchdog_history_forces_reconnect() {
    let config = config_with(&[("watchdog_tick_secs", "1.0")]);
    let mut harness = start_with(Script::default(), config);
    ready(&harness).await;
    harness
        .handle
        .subscribe(SubscriptionSpec::trendbar(
            SymbolId::new(SYMBOL),
            TrendbarPeriod::M1,
        ))
        .await
        .expect("subscribe accepted");
    next_matching(&mut harness.events, |e| matches!(e, SessionEvent::History { .. })).await;
    assert_eq!(count(&harness.seen, PAYLOAD_GET_TRENDBARS_REQ), 1);

    // From now on the broker only has an hour-old series, and no spots flow.
    harness.script.history_age.store(60, Ordering::SeqCst);
    let silent_since = Instant::now();

    next_matching(&mut harness.events, |e| {
        matches!(e, SessionEvent::Ready { reconnected: true, .. })
    })
    .await;
    assert_eq!(harness.transport.connections.load(Ordering::SeqCst), 2);

    let fetches = harness.script.arrivals_of(PAYLOAD_GET_TRENDBARS_REQ);
    let redial = harness.script.arrivals_of(PAYLOAD_APPLICATION_AUTH_REQ)[1];
    let check = fetches[1];
    // Three misses past a three-tick grace before the liveness fetch goes out.
    assert!(check - silent_since >= Duration::from_secs(3));
    assert!(check <= redial);
    harness.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn login_flow_timeout_redials() {
    let config = config_with(&[
        ("retry_max_attempts", "2"),
        ("retry_backoff_secs", "2.0"),
    ]);
    let script = Script::default();
    // Attempts go out at 0s and 4s; the 5s login deadline fires first.
    script.leave_unanswered(PAYLOAD_ACCOUNT_AUTH_REQ, 2);
    let harness = start_with(script, config);
    ready(&harness).await;

    assert_eq!(harness.transport.connections.load(Ordering::SeqCst), 2);
    assert_eq!(count(&harness.seen, PAYLOAD_ACCOUNT_AUTH_REQ), 3);
    let app_auths = harness.script.arrivals_of(PAYLOAD_APPLICATION_AUTH_REQ);
    assert_eq!(app_auths.len(), 2);
    assert!(app_auths[1] - app_auths[0] >= Duration::from_secs(5));
    assert!(harness.handle.status().borrow().halted.is_none());
    harness.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_account_auth_halts_without_redialing() {
    let script = Script::default();
    script.reject(PAYLOAD_ACCOUNT_AUTH_REQ, "CH_ACCESS_TOKEN_INVALID");
    let mut harness = start_with(script, config());

    let err = timeout(WAIT, harness.handle.wait_ready())
        .await
        .expect("login settles in time")
        .expect_err("login fails");
    assert!(matches!(err, SessionError::Transport(ref reason) if reason.contains("authentication failed")));

    let failed = next_matching(&mut harness.events, |e| matches!(e, SessionEvent::AuthFailed { .. })).await;
    assert!(matches!(
        failed,
        SessionEvent::AuthFailed { ref reason } if reason.contains("CH_ACCESS_TOKEN_INVALID")
    ));
    let halted = harness.handle.status().borrow().halted.clone();
    assert!(halted.unwrap().starts_with("authentication failed"));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.transport.connections.load(Ordering::SeqCst), 1);
    assert_eq!(count(&harness.seen, PAYLOAD_ACCOUNT_AUTH_REQ), 1);
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn unknown_payload_type_completes_the_matching_request() {
    let script = Script::default();
    script
        .reply_as
        .lock()
        .unwrap()
        .insert(PAYLOAD_SYMBOL_BY_ID_REQ, 9999);
    let harness = start_with(script, config());
    ready(&harness).await;

    let response = timeout(WAIT, harness.handle.request(symbol_lookup(&harness.handle)))
        .await
        .expect("request settles in time")
        .expect("unknown payloads still complete the request");
    assert_eq!(response, InboundMessage::Unknown { payload_type: 9999 });
    assert_eq!(count(&harness.seen, PAYLOAD_SYMBOL_BY_ID_REQ), 1);
    assert_eq!(harness.transport.connections.load(Ordering::SeqCst), 1);
    harness.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_is_resent_after_timeout_and_backoff() {
    let config = config_with(&[
        ("retry_max_attempts", "2"),
        ("retry_backoff_secs", "1.5"),
    ]);
    let script = Script::default();
    script.leave_unanswered(PAYLOAD_SYMBOL_BY_ID_REQ, 2);
    let harness = start_with(script, config);
    ready(&harness).await;

    let response = harness
        .handle
        .request(symbol_lookup(&harness.handle))
        .await
        .expect("third attempt is answered");
    assert!(matches!(response, InboundMessage::SymbolByIdRes(_)));
    let sends = harness.script.arrivals_of(PAYLOAD_SYMBOL_BY_ID_REQ);
    assert_eq!(sends.len(), 3);
    for pair in sends.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_millis(3500), "resent after {gap:?}");
        assert!(gap < Duration::from_secs(4), "resent after {gap:?}");
    }

    harness.script.leave_unanswered(PAYLOAD_SYMBOL_BY_ID_REQ, 3);
    let err = harness
        .handle
        .request(symbol_lookup(&harness.handle))
        .await
        .expect_err("every attempt goes unanswered");
    assert!(matches!(err, SessionError::Timeout { attempts: 3, .. }));
    assert_eq!(count(&harness.seen, PAYLOAD_SYMBOL_BY_ID_REQ), 6);
    assert_eq!(harness.transport.connections.load(Ordering::SeqCst), 1);
    harness.handle.shutdown().await;
}
