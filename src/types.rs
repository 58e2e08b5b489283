use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Prices travel as integers in 1e-5 units.
pub const PRICE_SCALE: i64 = 100_000;
/// Volumes travel in hundredths of a base unit; one standard lot is 100,000 units.
pub const LOT_VOLUME: i64 = 10_000_000;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            pub const fn into_inner(self) -> $inner {
                self.0
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for $inner {
            fn from(value: $name) -> Self {
                value.into_inner()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Broker trading account (ctidTraderAccountId).
    AccountId(i64)
);
id_newtype!(
    /// Broker symbol identifier.
    SymbolId(i64)
);
id_newtype!(
    /// Client message id used to match a response to its request.
    CorrelationId(u64)
);
id_newtype!(PositionId(i64));
id_newtype!(OrderId(i64));

impl CorrelationId {
    pub fn as_wire(self) -> String {
        self.0.to_string()
    }

    pub fn parse_wire(raw: &str) -> Option<Self> {
        raw.parse::<u64>().ok().map(Self)
    }
}

/// Representation of a price using integer ticks of 1e-5.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(i64);

impl Price {
    pub const fn ticks(value: i64) -> Self {
        Self(value)
    }

    pub const fn into_ticks(self) -> i64 {
        self.0
    }

    pub fn offset(self, delta: i64) -> Self {
        Self(self.0 + delta)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / PRICE_SCALE as f64
    }
}

impl From<i64> for Price {
    fn from(value: i64) -> Self {
        Self::ticks(value)
    }
}

impl From<Price> for i64 {
    fn from(value: Price) -> Self {
        value.into_ticks()
    }
}

/// Volume in broker units (0.01 of a base unit). Signed arithmetic keeps
/// exposure bookkeeping exact.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Volume(i64);

impl Volume {
    pub const ZERO: Volume = Volume(0);

    pub const fn units(value: i64) -> Self {
        Self(value)
    }

    pub const fn into_units(self) -> i64 {
        self.0
    }

    pub fn from_lots(lots: f64) -> Self {
        Self((lots * LOT_VOLUME as f64).round() as i64)
    }

    pub fn to_lots(self) -> f64 {
        self.0 as f64 / LOT_VOLUME as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: Volume) -> Volume {
        Volume((self.0 - other.0).max(0))
    }
}

impl std::ops::Add for Volume {
    type Output = Volume;

    fn add(self, rhs: Volume) -> Volume {
        Volume(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Volume {
    fn add_assign(&mut self, rhs: Volume) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for Volume {
    type Output = Volume;

    fn sub(self, rhs: Volume) -> Volume {
        Volume(self.0 - rhs.0)
    }
}

impl std::iter::Sum for Volume {
    fn sum<I: Iterator<Item = Volume>>(iter: I) -> Volume {
        iter.fold(Volume::ZERO, |acc, v| acc + v)
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} lots", self.to_lots())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum TradeSide {
    Buy = 1,
    Sell = 2,
}

impl TradeSide {
    pub fn opposite(self) -> Self {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        })
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize_repr, Deserialize_repr,
)]
#[repr(u8)]
pub enum TrendbarPeriod {
    M1 = 1,
    M2 = 2,
    M3 = 3,
    M4 = 4,
    M5 = 5,
    M10 = 6,
    M15 = 7,
    M30 = 8,
    H1 = 9,
    H4 = 10,
    H12 = 11,
    D1 = 12,
    W1 = 13,
    MN1 = 14,
}

impl TrendbarPeriod {
    /// Bucket width in minutes. Months are approximated as 30 days.
    pub fn minutes(self) -> i64 {
        match self {
            TrendbarPeriod::M1 => 1,
            TrendbarPeriod::M2 => 2,
            TrendbarPeriod::M3 => 3,
            TrendbarPeriod::M4 => 4,
            TrendbarPeriod::M5 => 5,
            TrendbarPeriod::M10 => 10,
            TrendbarPeriod::M15 => 15,
            TrendbarPeriod::M30 => 30,
            TrendbarPeriod::H1 => 60,
            TrendbarPeriod::H4 => 240,
            TrendbarPeriod::H12 => 720,
            TrendbarPeriod::D1 => 1_440,
            TrendbarPeriod::W1 => 10_080,
            TrendbarPeriod::MN1 => 43_200,
        }
    }

    pub fn bucket(self, utc_minutes: i64) -> i64 {
        utc_minutes.div_euclid(self.minutes())
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let period = match name.to_ascii_uppercase().as_str() {
            "M1" => TrendbarPeriod::M1,
            "M2" => TrendbarPeriod::M2,
            "M3" => TrendbarPeriod::M3,
            "M4" => TrendbarPeriod::M4,
            "M5" => TrendbarPeriod::M5,
            "M10" => TrendbarPeriod::M10,
            "M15" => TrendbarPeriod::M15,
            "M30" => TrendbarPeriod::M30,
            "H1" => TrendbarPeriod::H1,
            "H4" => TrendbarPeriod::H4,
            "H12" => TrendbarPeriod::H12,
            "D1" => TrendbarPeriod::D1,
            "W1" => TrendbarPeriod::W1,
            "MN1" => TrendbarPeriod::MN1,
            _ => return None,
        };
        Some(period)
    }
}

/// Last-known bid/ask for a symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quote {
    pub symbol: SymbolId,
    pub bid: Option<Price>,
    pub ask: Option<Price>,
    /// Informational only; never used for ordering.
    pub server_timestamp_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candle {
    pub symbol: SymbolId,
    pub period: TrendbarPeriod,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: i64,
    pub open_minutes: i64,
    pub closed: bool,
}

impl Candle {
    pub fn open_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.open_minutes * 60, 0).single()
    }

    pub fn bucket(&self) -> i64 {
        self.period.bucket(self.open_minutes)
    }
}

pub fn utc_minutes(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(60)
}
