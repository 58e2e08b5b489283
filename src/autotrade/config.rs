use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::{override_f64, override_string, override_usize};
use crate::types::{SymbolId, TrendbarPeriod, Volume};

#[derive(Debug, Clone, Deserialize)]
pub struct AutoTradeConfig {
    pub symbol_id: i64,
    /// Trendbar period name, e.g. `M5` or `H1`.
    #[serde(default = "default_period")]
    pub period: String,
    /// Cap on cumulative open volume per side, in lots.
    #[serde(default = "default_same_side_cap")]
    pub same_side_cap_lots: f64,
    #[serde(default = "default_min_step")]
    pub min_step_lots: f64,
    #[serde(default = "default_min_decision_interval")]
    pub min_decision_interval_secs: f64,
    #[serde(default = "default_cost_threshold")]
    pub cost_threshold_bps: f64,
    #[serde(default = "default_window_len")]
    pub window_len: usize,
    #[serde(default = "default_min_window")]
    pub min_window: usize,
    #[serde(default = "default_order_label")]
    pub order_label: String,
}

fn default_period() -> String {
    "M5".to_string()
}

fn default_same_side_cap() -> f64 {
    1.0
}

fn default_min_step() -> f64 {
    0.01
}

fn default_min_decision_interval() -> f64 {
    60.0
}

fn default_cost_threshold() -> f64 {
    1.5
}

fn default_window_len() -> usize {
    128
}

fn default_min_window() -> usize {
    30
}

fn default_order_label() -> String {
    "autotrade".to_string()
}

impl AutoTradeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<Self> {
        let mut raw: toml::Value = toml::from_str(data).context("Failed to parse TOML config")?;
        // Support a nested [autotrade] table or top-level entries.
        let table = if let Some(table) = raw
            .get_mut("autotrade")
            .and_then(|v| v.as_table_mut())
            .cloned()
        {
            table
        } else {
            raw.try_into()
                .map_err(|_| anyhow::anyhow!("Invalid autotrade config structure"))?
        };
        let mut cfg: AutoTradeConfig = toml::from_str(&toml::to_string(&table)?)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("AUTOTRADE_SYMBOL_ID") {
            if let Ok(parsed) = value.parse::<i64>() {
                self.symbol_id = parsed;
            }
        }
        override_string("AUTOTRADE_PERIOD", &mut self.period);
        override_f64("AUTOTRADE_SAME_SIDE_CAP_LOTS", &mut self.same_side_cap_lots);
        override_f64("AUTOTRADE_MIN_STEP_LOTS", &mut self.min_step_lots);
        override_f64(
            "AUTOTRADE_MIN_DECISION_INTERVAL",
            &mut self.min_decision_interval_secs,
        );
        override_f64("AUTOTRADE_COST_THRESHOLD_BPS", &mut self.cost_threshold_bps);
        override_usize("AUTOTRADE_WINDOW_LEN", &mut self.window_len);
        override_usize("AUTOTRADE_MIN_WINDOW", &mut self.min_window);
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.symbol_id > 0, "symbol_id must be positive");
        anyhow::ensure!(
            TrendbarPeriod::from_name(&self.period).is_some(),
            "unknown trendbar period {}",
            self.period
        );
        anyhow::ensure!(
            self.min_step_lots > 0.0 && !self.min_step().is_zero(),
            "min_step_lots must be at least one volume unit"
        );
        anyhow::ensure!(
            self.same_side_cap_lots >= self.min_step_lots,
            "same_side_cap_lots must be >= min_step_lots"
        );
        anyhow::ensure!(
            self.min_decision_interval_secs >= 0.0,
            "min_decision_interval_secs must be non-negative"
        );
        anyhow::ensure!(
            self.cost_threshold_bps >= 0.0,
            "cost_threshold_bps must be non-negative"
        );
        anyhow::ensure!(
            self.min_window >= 1 && self.window_len >= self.min_window,
            "window_len must be >= min_window >= 1"
        );
        Ok(())
    }

    pub fn symbol(&self) -> SymbolId {
        SymbolId::new(self.symbol_id)
    }

    /// Validated by `validate`; falls back to M5 for hand-built configs.
    pub fn trendbar_period(&self) -> TrendbarPeriod {
        TrendbarPeriod::from_name(&self.period).unwrap_or(TrendbarPeriod::M5)
    }

    pub fn same_side_cap(&self) -> Volume {
        Volume::from_lots(self.same_side_cap_lots)
    }

    pub fn min_step(&self) -> Volume {
        Volume::from_lots(self.min_step_lots)
    }

    pub fn min_decision_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_decision_interval_secs.max(0.0))
    }
}
