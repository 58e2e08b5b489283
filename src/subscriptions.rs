use std::collections::BTreeSet;

use crate::errors::SessionError;
use crate::messages::{LiveTrendbarReq, OutboundMessage, SymbolsReq};
use crate::types::{AccountId, SymbolId, TrendbarPeriod};

/// Ordering puts spot before depth before trendbars so replays subscribe the
/// quote stream a live trendbar depends on first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubscriptionKind {
    Spot,
    Depth,
    Trendbar(TrendbarPeriod),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionSpec {
    pub kind: SubscriptionKind,
    pub symbol: SymbolId,
}

impl SubscriptionSpec {
    pub fn spot(symbol: SymbolId) -> Self {
        Self {
            kind: SubscriptionKind::Spot,
            symbol,
        }
    }

    pub fn depth(symbol: SymbolId) -> Self {
        Self {
            kind: SubscriptionKind::Depth,
            symbol,
        }
    }

    pub fn trendbar(symbol: SymbolId, period: TrendbarPeriod) -> Self {
        Self {
            kind: SubscriptionKind::Trendbar(period),
            symbol,
        }
    }

    pub fn subscribe_message(&self, account: AccountId) -> OutboundMessage {
        match self.kind {
            SubscriptionKind::Spot => OutboundMessage::SubscribeSpots(SymbolsReq {
                ctid_trader_account_id: account,
                symbol_id: vec![self.symbol],
            }),
            SubscriptionKind::Depth => OutboundMessage::SubscribeDepth(SymbolsReq {
                ctid_trader_account_id: account,
                symbol_id: vec![self.symbol],
            }),
            SubscriptionKind::Trendbar(period) => {
                OutboundMessage::SubscribeLiveTrendbar(LiveTrendbarReq {
                    ctid_trader_account_id: account,
                    period,
                    symbol_id: self.symbol,
                })
            }
        }
    }

    pub fn unsubscribe_message(&self, account: AccountId) -> OutboundMessage {
        match self.kind {
            SubscriptionKind::Spot => OutboundMessage::UnsubscribeSpots(SymbolsReq {
                ctid_trader_account_id: account,
                symbol_id: vec![self.symbol],
            }),
            SubscriptionKind::Depth => OutboundMessage::UnsubscribeDepth(SymbolsReq {
                ctid_trader_account_id: account,
                symbol_id: vec![self.symbol],
            }),
            SubscriptionKind::Trendbar(period) => {
                OutboundMessage::UnsubscribeLiveTrendbar(LiveTrendbarReq {
                    ctid_trader_account_id: account,
                    period,
                    symbol_id: self.symbol,
                })
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionCommand {
    Subscribe(SubscriptionSpec),
    Unsubscribe(SubscriptionSpec),
}

impl SubscriptionCommand {
    pub fn spec(&self) -> SubscriptionSpec {
        match *self {
            SubscriptionCommand::Subscribe(spec) | SubscriptionCommand::Unsubscribe(spec) => spec,
        }
    }

    pub fn to_message(&self, account: AccountId) -> OutboundMessage {
        match self {
            SubscriptionCommand::Subscribe(spec) => spec.subscribe_message(account),
            SubscriptionCommand::Unsubscribe(spec) => spec.unsubscribe_message(account),
        }
    }
}

/// Desired subscriptions as a set, plus what the server has acknowledged on
/// the current connection.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    /// What callers asked for. `desired` adds the spot streams their
    /// trendbars depend on.
    requested: BTreeSet<SubscriptionSpec>,
    desired: BTreeSet<SubscriptionSpec>,
    acknowledged: BTreeSet<SubscriptionSpec>,
    in_flight: BTreeSet<SubscriptionSpec>,
    /// Withdrawn specs the server refused to drop.
    lingering: BTreeSet<SubscriptionSpec>,
    connected: bool,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn desired(&self) -> &BTreeSet<SubscriptionSpec> {
        &self.desired
    }

    pub fn acknowledged(&self) -> &BTreeSet<SubscriptionSpec> {
        &self.acknowledged
    }

    pub fn is_converged(&self) -> bool {
        self.desired == self.acknowledged
    }

    pub fn has_market_data(&self) -> bool {
        !self.desired.is_empty()
    }

    pub fn trendbars(&self) -> impl Iterator<Item = (SymbolId, TrendbarPeriod)> + '_ {
        self.desired.iter().filter_map(|spec| match spec.kind {
            SubscriptionKind::Trendbar(period) => Some((spec.symbol, period)),
            _ => None,
        })
    }

    fn has_trendbar(&self, symbol: SymbolId) -> bool {
        self.requested
            .iter()
            .any(|spec| spec.symbol == symbol && matches!(spec.kind, SubscriptionKind::Trendbar(_)))
    }

    fn unsubscribe(&self, spec: SubscriptionSpec) -> Option<SubscriptionCommand> {
        if self.connected && self.acknowledged.contains(&spec) && !self.desired.contains(&spec) {
            Some(SubscriptionCommand::Unsubscribe(spec))
        } else {
            None
        }
    }

    fn request(&mut self, spec: SubscriptionSpec) -> Option<SubscriptionCommand> {
        if !self.connected || self.acknowledged.contains(&spec) || !self.in_flight.insert(spec) {
            return None;
        }
        Some(SubscriptionCommand::Subscribe(spec))
    }

    /// Adds `spec` to the desired set. A live trendbar also needs the
    /// symbol's spot stream. Commands are returned only while connected.
    pub fn desire(&mut self, spec: SubscriptionSpec) -> Vec<SubscriptionCommand> {
        self.requested.insert(spec);
        let mut specs = Vec::with_capacity(2);
        if matches!(spec.kind, SubscriptionKind::Trendbar(_)) {
            specs.push(SubscriptionSpec::spot(spec.symbol));
        }
        specs.push(spec);

        let mut commands = Vec::new();
        for spec in specs {
            self.desired.insert(spec);
            if let Some(command) = self.request(spec) {
                commands.push(command);
            }
        }
        commands
    }

    /// Removes `spec` from the desired set, together with the spot stream it
    /// implied once no other trendbar of the symbol needs it. Unsubscribes
    /// whatever the server currently holds.
    pub fn withdraw(&mut self, spec: SubscriptionSpec) -> Vec<SubscriptionCommand> {
        if !self.requested.remove(&spec) {
            return Vec::new();
        }
        let mut dropped = Vec::with_capacity(2);
        match spec.kind {
            SubscriptionKind::Spot if self.has_trendbar(spec.symbol) => {}
            SubscriptionKind::Trendbar(_) => {
                dropped.push(spec);
                let spot = SubscriptionSpec::spot(spec.symbol);
                if !self.requested.contains(&spot) && !self.has_trendbar(spec.symbol) {
                    dropped.push(spot);
                }
            }
            _ => dropped.push(spec),
        }

        let mut commands = Vec::new();
        for spec in dropped {
            self.desired.remove(&spec);
            commands.extend(self.unsubscribe(spec));
        }
        commands
    }

    /// Full re-subscribe on every `Ready`: the server keeps nothing across
    /// connections.
    pub fn replay(&mut self) -> Vec<SubscriptionCommand> {
        self.connected = true;
        self.acknowledged.clear();
        self.lingering.clear();
        self.in_flight = self.desired.clone();
        tracing::info!(count = self.desired.len(), "subscriptions_replay");
        self.desired
            .iter()
            .copied()
            .map(SubscriptionCommand::Subscribe)
            .collect()
    }

    /// A subscribe was acknowledged. If the spec was withdrawn meanwhile the
    /// unsubscribe is returned.
    pub fn on_acknowledged(&mut self, spec: SubscriptionSpec) -> Option<SubscriptionCommand> {
        self.in_flight.remove(&spec);
        if !self.connected {
            return None;
        }
        self.acknowledged.insert(spec);
        if self.desired.contains(&spec) {
            None
        } else {
            Some(SubscriptionCommand::Unsubscribe(spec))
        }
    }

    /// The spec stays desired and is retried on the next `Ready`.
    pub fn on_failed(&mut self, spec: SubscriptionSpec, error: &SessionError) {
        self.in_flight.remove(&spec);
        tracing::warn!(?spec, %error, "subscription_failed");
    }

    /// An unsubscribe failed; the server keeps streaming until a retry
    /// succeeds or the connection is replaced.
    pub fn on_unsubscribe_failed(&mut self, spec: SubscriptionSpec, error: &SessionError) {
        tracing::warn!(?spec, %error, "unsubscribe_failed");
        if self.unsubscribe(spec).is_some() {
            self.lingering.insert(spec);
        }
    }

    /// Unsubscribes for earlier failures that still apply.
    pub fn retry_unsubscribes(&mut self) -> Vec<SubscriptionCommand> {
        let lingering = std::mem::take(&mut self.lingering);
        lingering
            .into_iter()
            .filter_map(|spec| self.unsubscribe(spec))
            .collect()
    }

    /// An unsubscribe completed. Re-subscribes if the spec was desired again.
    pub fn on_unsubscribed(&mut self, spec: SubscriptionSpec) -> Option<SubscriptionCommand> {
        self.acknowledged.remove(&spec);
        if self.desired.contains(&spec) {
            self.request(spec)
        } else {
            None
        }
    }

    pub fn on_disconnected(&mut self) {
        self.connected = false;
        self.acknowledged.clear();
        self.in_flight.clear();
        self.lingering.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M1: TrendbarPeriod = TrendbarPeriod::M1;

    fn sym(id: i64) -> SymbolId {
        SymbolId::new(id)
    }

    /// Server that acknowledges whatever it receives.
    fn ack_all(manager: &mut SubscriptionManager, mut commands: Vec<SubscriptionCommand>) {
        while let Some(command) = commands.pop() {
            let follow_up = match command {
                SubscriptionCommand::Subscribe(spec) => manager.on_acknowledged(spec),
                SubscriptionCommand::Unsubscribe(spec) => manager.on_unsubscribed(spec),
            };
            commands.extend(follow_up);
        }
    }

    #[test]
    fn disconnected_changes_only_update_desired_state() {
        let mut manager = SubscriptionManager::new();
        assert!(manager.desire(SubscriptionSpec::spot(sym(1))).is_empty());
        assert!(manager.withdraw(SubscriptionSpec::spot(sym(1))).is_empty());
        assert!(manager.desired().is_empty());
    }

    #[test]
    fn replay_puts_spots_before_trendbars() {
        let mut manager = SubscriptionManager::new();
        manager.desire(SubscriptionSpec::trendbar(sym(2), M1));
        manager.desire(SubscriptionSpec::depth(sym(1)));
        let replay = manager.replay();
        assert_eq!(
            replay,
            vec![
                SubscriptionCommand::Subscribe(SubscriptionSpec::spot(sym(2))),
                SubscriptionCommand::Subscribe(SubscriptionSpec::depth(sym(1))),
                SubscriptionCommand::Subscribe(SubscriptionSpec::trendbar(sym(2), M1)),
            ]
        );
    }

    #[test]
    fn failure_keeps_spec_desired_until_next_ready() {
        let mut manager = SubscriptionManager::new();
        manager.desire(SubscriptionSpec::spot(sym(1)));
        manager.replay();
        manager.on_failed(
            SubscriptionSpec::spot(sym(1)),
            &SessionError::rejected("SYMBOL_NOT_FOUND", "", None),
        );
        assert!(!manager.is_converged());
        assert!(manager.desired().contains(&SubscriptionSpec::spot(sym(1))));

        manager.on_disconnected();
        let replay = manager.replay();
        ack_all(&mut manager, replay);
        assert!(manager.is_converged());
    }

    #[test]
    fn withdraw_while_in_flight_unsubscribes_after_ack() {
        let mut manager = SubscriptionManager::new();
        manager.replay();
        let spec = SubscriptionSpec::spot(sym(4));
        assert_eq!(manager.desire(spec), vec![SubscriptionCommand::Subscribe(spec)]);
        assert!(manager.withdraw(spec).is_empty());
        assert_eq!(
            manager.on_acknowledged(spec),
            Some(SubscriptionCommand::Unsubscribe(spec))
        );
        assert!(manager.on_unsubscribed(spec).is_none());
        assert!(manager.is_converged());
        assert!(manager.acknowledged().is_empty());
    }

    #[test]
    fn withdrawing_trendbar_drops_its_implied_spot() {
        let mut manager = SubscriptionManager::new();
        manager.replay();
        let m1 = SubscriptionSpec::trendbar(sym(1), M1);
        let h1 = SubscriptionSpec::trendbar(sym(1), TrendbarPeriod::H1);
        let spot = SubscriptionSpec::spot(sym(1));
        let subscribed = manager.desire(m1);
        ack_all(&mut manager, subscribed);
        let subscribed = manager.desire(h1);
        ack_all(&mut manager, subscribed);

        assert_eq!(manager.withdraw(m1), vec![SubscriptionCommand::Unsubscribe(m1)]);
        assert!(manager.withdraw(spot).is_empty());
        assert!(manager.desired().contains(&spot));

        assert_eq!(
            manager.withdraw(h1),
            vec![
                SubscriptionCommand::Unsubscribe(h1),
                SubscriptionCommand::Unsubscribe(spot),
            ]
        );
        assert!(manager.desired().is_empty());
    }

    #[test]
    fn explicit_spot_outlives_its_trendbar() {
        let mut manager = SubscriptionManager::new();
        manager.replay();
        let spot = SubscriptionSpec::spot(sym(2));
        let bar = SubscriptionSpec::trendbar(sym(2), M1);
        let subscribed = manager.desire(spot);
        ack_all(&mut manager, subscribed);
        let subscribed = manager.desire(bar);
        ack_all(&mut manager, subscribed);

        assert_eq!(manager.withdraw(bar), vec![SubscriptionCommand::Unsubscribe(bar)]);
        assert!(manager.desired().contains(&spot));
    }

    #[test]
    fn failed_unsubscribe_is_retried_until_replaced() {
        let mut manager = SubscriptionManager::new();
        manager.replay();
        let spec = SubscriptionSpec::depth(sym(3));
        let subscribed = manager.desire(spec);
        ack_all(&mut manager, subscribed);
        assert_eq!(manager.withdraw(spec), vec![SubscriptionCommand::Unsubscribe(spec)]);

        let error = SessionError::Timeout {
            correlation_id: crate::types::CorrelationId::new(9),
            attempts: 1,
        };
        manager.on_unsubscribe_failed(spec, &error);
        assert!(!manager.is_converged());
        assert_eq!(
            manager.retry_unsubscribes(),
            vec![SubscriptionCommand::Unsubscribe(spec)]
        );
        assert!(manager.retry_unsubscribes().is_empty());

        manager.on_unsubscribe_failed(spec, &error);
        manager.on_disconnected();
        assert!(manager.retry_unsubscribes().is_empty());
        manager.replay();
        assert!(manager.is_converged());
    }

    #[test]
    fn acknowledged_set_converges_across_reconnect_sequences() {
        let mut manager = SubscriptionManager::new();
        let specs = [
            SubscriptionSpec::spot(sym(1)),
            SubscriptionSpec::trendbar(sym(1), M1),
            SubscriptionSpec::depth(sym(2)),
            SubscriptionSpec::trendbar(sym(3), TrendbarPeriod::H1),
        ];
        for round in 0..12usize {
            let spec = specs[round % specs.len()];
            if round % 3 == 0 {
                manager.withdraw(spec);
            } else {
                manager.desire(spec);
            }
            manager.on_disconnected();
            if round % 2 == 1 {
                // changes while offline
                manager.desire(specs[(round + 1) % specs.len()]);
            }
            let replay = manager.replay();
            ack_all(&mut manager, replay);
            assert!(manager.is_converged(), "round {round}");

            let changes = manager.desire(specs[(round + 2) % specs.len()]);
            ack_all(&mut manager, changes);
            let removal = manager.withdraw(specs[round % specs.len()]);
            ack_all(&mut manager, removal);
            assert!(manager.is_converged(), "round {round} live");
        }
    }
}
