//! Last-known quotes, depth and in-progress candles for one session.
//!
//! Live bars arrive as deltas against the last sealed close of the same
//! (symbol, period). Without that baseline nothing can be decoded and the
//! owner must fetch history first.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use tokio::sync::watch;

use crate::messages::{DepthEvent, DepthQuote, GetTrendbarsRes, HistoryBar, LiveBar, SpotEvent};
use crate::types::{AccountId, Candle, Price, Quote, SymbolId, TrendbarPeriod};

pub type SeriesKey = (SymbolId, TrendbarPeriod);

/// Immutable view handed to readers on other tasks.
#[derive(Clone, Debug, Default)]
pub struct MarketSnapshot {
    pub account: AccountId,
    pub revision: u64,
    pub quotes: HashMap<SymbolId, Quote>,
    pub candles: HashMap<SeriesKey, Candle>,
    pub depth: HashMap<SymbolId, Vec<DepthQuote>>,
}

impl MarketSnapshot {
    pub fn quote(&self, symbol: SymbolId) -> Option<&Quote> {
        self.quotes.get(&symbol)
    }

    pub fn candle(&self, symbol: SymbolId, period: TrendbarPeriod) -> Option<&Candle> {
        self.candles.get(&(symbol, period))
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SpotOutcome {
    pub quote_updated: bool,
    pub needs_history: Vec<SeriesKey>,
    pub stale_bars: usize,
}

#[derive(Debug)]
pub struct MarketDataCache {
    account: AccountId,
    revision: u64,
    quotes: HashMap<SymbolId, Quote>,
    open: HashMap<SeriesKey, Candle>,
    baselines: HashMap<SeriesKey, Price>,
    awaiting_history: HashSet<SeriesKey>,
    /// Series whose last history fetch gave no baseline, keyed by the bucket
    /// that was current then. Retried once that bucket has rolled over.
    history_exhausted: HashMap<SeriesKey, i64>,
    depth: HashMap<SymbolId, BTreeMap<u64, DepthQuote>>,
    publisher: watch::Sender<Arc<MarketSnapshot>>,
}

impl MarketDataCache {
    pub fn new(account: AccountId) -> Self {
        let (publisher, _) = watch::channel(Arc::new(MarketSnapshot {
            account,
            ..MarketSnapshot::default()
        }));
        Self {
            account,
            revision: 0,
            quotes: HashMap::new(),
            open: HashMap::new(),
            baselines: HashMap::new(),
            awaiting_history: HashSet::new(),
            history_exhausted: HashMap::new(),
            depth: HashMap::new(),
            publisher,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MarketSnapshot>> {
        self.publisher.subscribe()
    }

    pub fn quote(&self, symbol: SymbolId) -> Option<&Quote> {
        self.quotes.get(&symbol)
    }

    pub fn current_candle(&self, symbol: SymbolId, period: TrendbarPeriod) -> Option<&Candle> {
        self.open.get(&(symbol, period))
    }

    pub fn has_baseline(&self, symbol: SymbolId, period: TrendbarPeriod) -> bool {
        self.baselines.contains_key(&(symbol, period))
    }

    pub fn depth(&self, symbol: SymbolId) -> Vec<DepthQuote> {
        self.depth
            .get(&symbol)
            .map(|book| book.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Applies a pushed spot event. Each candle sealed by a bucket rollover is
    /// passed to `on_sealed` before the new bucket's candle is stored.
    pub fn apply_spot(&mut self, event: &SpotEvent, on_sealed: &mut dyn FnMut(Candle)) -> SpotOutcome {
        let mut outcome = SpotOutcome::default();
        if event.ctid_trader_account_id != self.account {
            tracing::debug!(account = %event.ctid_trader_account_id, "spot event for foreign account");
            return outcome;
        }

        if event.bid.is_some() || event.ask.is_some() {
            let previous = self.quotes.get(&event.symbol_id).copied();
            let quote = Quote {
                symbol: event.symbol_id,
                bid: event
                    .bid
                    .map(Price::ticks)
                    .or_else(|| previous.and_then(|q| q.bid)),
                ask: event
                    .ask
                    .map(Price::ticks)
                    .or_else(|| previous.and_then(|q| q.ask)),
                server_timestamp_ms: event.timestamp.unwrap_or_default(),
            };
            self.quotes.insert(event.symbol_id, quote);
            outcome.quote_updated = true;
        }

        for bar in &event.trendbar {
            let key = (event.symbol_id, bar.period);
            self.apply_live_bar(key, bar, on_sealed, &mut outcome);
        }
        outcome
    }

    fn apply_live_bar(
        &mut self,
        key: SeriesKey,
        bar: &LiveBar,
        on_sealed: &mut dyn FnMut(Candle),
        outcome: &mut SpotOutcome,
    ) {
        let (symbol, period) = key;
        let bucket = period.bucket(bar.utc_timestamp_in_minutes);

        if let Some(current) = self.open.get(&key) {
            let current_bucket = current.bucket();
            if bucket < current_bucket {
                outcome.stale_bars += 1;
                return;
            }
            if bucket > current_bucket {
                let mut sealed = *current;
                sealed.closed = true;
                self.open.remove(&key);
                self.baselines.insert(key, sealed.close);
                tracing::debug!(%symbol, ?period, open_minutes = sealed.open_minutes, "candle_sealed");
                on_sealed(sealed);
            }
        }

        let Some(baseline) = self.baselines.get(&key).copied() else {
            if let Some(&tried) = self.history_exhausted.get(&key) {
                if bucket <= tried {
                    return;
                }
                self.history_exhausted.remove(&key);
            }
            if self.awaiting_history.insert(key) {
                tracing::info!(%symbol, ?period, "trendbar baseline missing, history required");
                outcome.needs_history.push(key);
            }
            return;
        };

        let low = baseline.offset(bar.delta_low);
        let candle = Candle {
            symbol,
            period,
            open: low.offset(bar.delta_open),
            high: low.offset(bar.delta_high),
            low,
            close: low.offset(bar.delta_close),
            volume: bar.volume,
            open_minutes: bucket * period.minutes(),
            closed: false,
        };
        self.open.insert(key, candle);
    }

    /// Seeds a series from history. Bars whose bucket is before `now_minutes`
    /// are sealed and returned oldest first; a bar in the current bucket
    /// becomes the open candle.
    pub fn seed_history(&mut self, res: &GetTrendbarsRes, now_minutes: i64) -> Vec<Candle> {
        let key = (res.symbol_id, res.period);
        let current_bucket = res.period.bucket(now_minutes);
        let mut bars: Vec<&HistoryBar> = res.trendbar.iter().collect();
        bars.sort_by_key(|bar| bar.utc_timestamp_in_minutes);

        let mut sealed = Vec::with_capacity(bars.len());
        let mut in_progress = None;
        for bar in bars {
            let candle = history_candle(res.symbol_id, res.period, bar);
            if candle.bucket() >= current_bucket {
                in_progress = Some(Candle {
                    closed: false,
                    ..candle
                });
            } else {
                sealed.push(candle);
            }
        }

        self.awaiting_history.remove(&key);
        if let Some(last) = sealed.last() {
            self.baselines.insert(key, last.close);
            self.history_exhausted.remove(&key);
        } else if !self.baselines.contains_key(&key) {
            // Live deltas cannot be decoded against an in-progress bar, and a
            // cached copy of it would never move.
            tracing::warn!(
                symbol = %res.symbol_id,
                period = ?res.period,
                bars = res.trendbar.len(),
                "history_without_sealed_bar"
            );
            self.history_exhausted.insert(key, current_bucket);
            self.open.remove(&key);
            return sealed;
        }
        match in_progress {
            Some(candle) => {
                self.open.insert(key, candle);
            }
            None => {
                if let (Some(open), Some(last)) = (self.open.get(&key), sealed.last()) {
                    if open.bucket() <= last.bucket() {
                        self.open.remove(&key);
                    }
                }
            }
        }
        tracing::info!(
            symbol = %res.symbol_id,
            period = ?res.period,
            sealed = sealed.len(),
            baseline = self.baselines.contains_key(&key),
            "history_seeded"
        );
        sealed
    }

    /// A history fetch failed; live bars retry it after the current bucket.
    pub fn history_unavailable(&mut self, key: SeriesKey, now_minutes: i64) {
        self.awaiting_history.remove(&key);
        if !self.baselines.contains_key(&key) {
            self.history_exhausted.insert(key, key.1.bucket(now_minutes));
        }
    }

    pub fn apply_depth(&mut self, event: &DepthEvent) {
        if event.ctid_trader_account_id != self.account {
            return;
        }
        let book = self.depth.entry(event.symbol_id).or_default();
        for id in &event.deleted_quotes {
            book.remove(id);
        }
        for quote in &event.new_quotes {
            book.insert(quote.id, quote.clone());
        }
    }

    /// Drops decoding state after a reconnect; quotes stay as last-known values.
    pub fn reset_live(&mut self) {
        self.open.clear();
        self.baselines.clear();
        self.awaiting_history.clear();
        self.history_exhausted.clear();
        self.depth.clear();
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        MarketSnapshot {
            account: self.account,
            revision: self.revision,
            quotes: self.quotes.clone(),
            candles: self.open.clone(),
            depth: self
                .depth
                .iter()
                .map(|(symbol, book)| (*symbol, book.values().cloned().collect()))
                .collect(),
        }
    }

    pub fn publish(&mut self) {
        self.revision = self.revision.wrapping_add(1);
        let snapshot = Arc::new(self.snapshot());
        self.publisher.send_replace(snapshot);
    }
}

fn history_candle(symbol: SymbolId, period: TrendbarPeriod, bar: &HistoryBar) -> Candle {
    let low = Price::ticks(bar.low);
    Candle {
        symbol,
        period,
        open: low.offset(bar.delta_open),
        high: low.offset(bar.delta_high),
        low,
        close: low.offset(bar.delta_close),
        volume: bar.volume,
        open_minutes: period.bucket(bar.utc_timestamp_in_minutes) * period.minutes(),
        closed: true,
    }
}

/// History is fresh when its newest bar opened within two periods of `now_minutes`.
pub fn history_is_fresh(res: &GetTrendbarsRes, now_minutes: i64) -> bool {
    let window = 2 * res.period.minutes();
    res.trendbar
        .iter()
        .map(|bar| bar.utc_timestamp_in_minutes)
        .max()
        .map(|newest| now_minutes - newest <= window)
        .unwrap_or(false)
}
