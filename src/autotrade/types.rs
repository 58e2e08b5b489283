use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};

use crate::messages::PositionInfo;
use crate::types::{PositionId, SymbolId, TradeSide, Volume};

/// What the decision model wants to do on a sealed candle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProposedAction {
    Hold,
    Open {
        side: TradeSide,
        lots: f64,
        expected_edge_bps: f64,
    },
    /// Close everything on the configured symbol.
    Flatten,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoTradeStatus {
    Stopped,
    Validating,
    Running,
    Stopping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenPosition {
    pub position_id: PositionId,
    pub side: TradeSide,
    pub volume: Volume,
}

/// Open positions on one symbol plus volume reserved by orders whose outcome
/// is not known yet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PositionBook {
    symbol: Option<SymbolId>,
    positions: BTreeMap<PositionId, OpenPosition>,
    reserved_buy: Volume,
    reserved_sell: Volume,
    /// Accepted orders whose position has not reported OPEN yet.
    awaiting_fill: BTreeMap<PositionId, (TradeSide, Volume)>,
}

impl PositionBook {
    pub fn new(symbol: SymbolId) -> Self {
        Self {
            symbol: Some(symbol),
            ..Self::default()
        }
    }

    fn tracks(&self, info: &PositionInfo) -> bool {
        self.symbol.map_or(true, |symbol| symbol == info.trade_data.symbol_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &OpenPosition> {
        self.positions.values()
    }

    pub fn on_side(&self, side: TradeSide) -> Vec<OpenPosition> {
        self.positions
            .values()
            .filter(|p| p.side == side)
            .copied()
            .collect()
    }

    pub fn reserved(&self, side: TradeSide) -> Volume {
        match side {
            TradeSide::Buy => self.reserved_buy,
            TradeSide::Sell => self.reserved_sell,
        }
    }

    fn reserved_mut(&mut self, side: TradeSide) -> &mut Volume {
        match side {
            TradeSide::Buy => &mut self.reserved_buy,
            TradeSide::Sell => &mut self.reserved_sell,
        }
    }

    /// Open plus reserved volume on `side`.
    pub fn exposure(&self, side: TradeSide) -> Volume {
        let open = self
            .positions
            .values()
            .filter(|p| p.side == side)
            .map(|p| p.volume)
            .sum::<Volume>();
        let unfilled = self
            .awaiting_fill
            .values()
            .filter(|(held, _)| *held == side)
            .map(|(_, volume)| *volume)
            .sum::<Volume>();
        open + unfilled + self.reserved(side)
    }

    pub fn reserve(&mut self, side: TradeSide, volume: Volume) {
        *self.reserved_mut(side) += volume;
    }

    pub fn release(&mut self, side: TradeSide, volume: Volume) {
        let slot = self.reserved_mut(side);
        *slot = slot.saturating_sub(volume);
    }

    /// Moves a reservation onto an accepted position that is not open yet.
    /// It stays counted until that position reports OPEN, CLOSED or is
    /// reconciled away.
    pub fn hold_until_filled(&mut self, position: PositionId, side: TradeSide, volume: Volume) {
        self.release(side, volume);
        self.awaiting_fill.insert(position, (side, volume));
    }

    /// Inserts, updates or removes a position from a broker report.
    pub fn apply(&mut self, info: &PositionInfo) {
        if !self.tracks(info) {
            return;
        }
        if info.is_open() {
            self.positions.insert(
                info.position_id,
                OpenPosition {
                    position_id: info.position_id,
                    side: info.trade_data.trade_side,
                    volume: Volume::units(info.trade_data.volume),
                },
            );
            self.awaiting_fill.remove(&info.position_id);
        } else if info.is_pending() {
            self.positions.remove(&info.position_id);
        } else {
            self.positions.remove(&info.position_id);
            self.awaiting_fill.remove(&info.position_id);
        }
    }

    /// Authoritative reconcile: replaces positions and drops reservations.
    pub fn replace(&mut self, positions: &[PositionInfo]) {
        self.positions.clear();
        self.reserved_buy = Volume::ZERO;
        self.reserved_sell = Volume::ZERO;
        self.awaiting_fill.clear();
        for info in positions {
            self.apply(info);
        }
    }

    pub fn is_flat(&self) -> bool {
        self.positions.is_empty()
            && self.awaiting_fill.is_empty()
            && self.reserved_buy.is_zero()
            && self.reserved_sell.is_zero()
    }
}

/// Read-only view published to other tasks.
#[derive(Clone, Debug, PartialEq)]
pub struct AutoTradeState {
    pub enabled: bool,
    pub status: AutoTradeStatus,
    pub positions: Vec<OpenPosition>,
    pub buy_exposure: Volume,
    pub sell_exposure: Volume,
    pub awaiting_reconcile: bool,
    pub last_decision_at: Option<DateTime<Utc>>,
    pub last_decision_side: Option<TradeSide>,
    pub last_error: Option<String>,
}

impl Default for AutoTradeState {
    fn default() -> Self {
        Self {
            enabled: false,
            status: AutoTradeStatus::Stopped,
            positions: Vec::new(),
            buy_exposure: Volume::ZERO,
            sell_exposure: Volume::ZERO,
            awaiting_reconcile: false,
            last_decision_at: None,
            last_decision_side: None,
            last_error: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DecisionOutcome {
    /// Candle for another series.
    Ignored,
    NotRunning,
    AwaitingReconcile,
    Throttled { remaining: Duration },
    InsufficientWindow { have: usize, need: usize },
    Hold,
    BelowStep,
    CostGated { edge_bps: f64, cost_bps: f64 },
    Capped,
    Submitted { side: TradeSide, volume: Volume },
    /// Submitted with unknown outcome; exposure kept until reconciled.
    Unconfirmed { side: TradeSide, volume: Volume },
    Closing { positions: usize },
    Rejected { code: String },
    Failed(String),
}
