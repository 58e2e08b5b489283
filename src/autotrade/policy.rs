//! Pure pre-trade gates applied to every proposed action.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::Volume;

/// Rounds `volume` down to a whole number of `step`s.
pub fn normalize_step(volume: Volume, step: Volume) -> Volume {
    let step = step.into_units();
    if step <= 0 {
        return volume;
    }
    let units = volume.into_units().max(0);
    Volume::units(units - units % step)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapOutcome {
    Accepted(Volume),
    Clipped { requested: Volume, allowed: Volume },
    Rejected,
}

/// Clips an addition so same-side exposure never exceeds `cap`. The clipped
/// amount stays a multiple of `step`.
pub fn apply_exposure_cap(current: Volume, add: Volume, cap: Volume, step: Volume) -> CapOutcome {
    let headroom = normalize_step(cap.saturating_sub(current), step);
    if headroom.is_zero() || add.is_zero() {
        CapOutcome::Rejected
    } else if add <= headroom {
        CapOutcome::Accepted(add)
    } else {
        CapOutcome::Clipped {
            requested: add,
            allowed: headroom,
        }
    }
}

/// Edge must strictly exceed cost. A zero cost disables the gate.
pub fn passes_cost_gate(expected_edge_bps: f64, cost_bps: f64) -> bool {
    cost_bps <= 0.0 || expected_edge_bps > cost_bps
}

/// Drops decisions that arrive too soon after the last accepted one.
#[derive(Clone, Debug)]
pub struct DecisionThrottle {
    min_interval: Duration,
    last_accepted: Option<Instant>,
}

impl DecisionThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_accepted: None,
        }
    }

    /// `Err` carries the remaining wait. Never mutates.
    pub fn check(&self, now: Instant) -> Result<(), Duration> {
        match self.last_accepted {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < self.min_interval {
                    Err(self.min_interval - elapsed)
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.last_accepted = Some(now);
    }

    pub fn last_accepted(&self) -> Option<Instant> {
        self.last_accepted
    }
}
