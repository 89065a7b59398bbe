//! Account configuration and runtime state.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::AccountSnapshot;

/// How a slave derives its order volume from the master's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LotMode {
    /// Same volume as the master
    Exact,
    /// `lot_value` lots regardless of master volume
    Fixed,
    /// Master volume times `lot_value`
    Multiplier,
    /// Master volume scaled by slave balance / master balance
    Proportional,
}

impl LotMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LotMode::Exact => "exact",
            LotMode::Fixed => "fixed",
            LotMode::Multiplier => "multiplier",
            LotMode::Proportional => "proportional",
        }
    }

    /// Whether a partial close on the master can be mirrored as a partial
    /// close on the slave. Fixed sizing does not follow master volume.
    pub fn scales_with_master(&self) -> bool {
        !matches!(self, LotMode::Fixed)
    }
}

impl fmt::Display for LotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LotMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exact" => Ok(LotMode::Exact),
            "fixed" => Ok(LotMode::Fixed),
            "multiplier" => Ok(LotMode::Multiplier),
            "proportional" => Ok(LotMode::Proportional),
            other => Err(format!(
                "invalid lot_mode '{}', expected exact, fixed, multiplier or proportional",
                other
            )),
        }
    }
}

/// Which master symbols a slave copies.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<Vec<String>>", into = "Option<Vec<String>>")]
pub enum SymbolFilter {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl SymbolFilter {
    pub fn admits(&self, symbol: &str) -> bool {
        match self {
            SymbolFilter::All => true,
            SymbolFilter::Only(symbols) => symbols.contains(symbol),
        }
    }
}

impl From<Option<Vec<String>>> for SymbolFilter {
    fn from(value: Option<Vec<String>>) -> Self {
        match value {
            None => SymbolFilter::All,
            Some(symbols) => SymbolFilter::Only(symbols.into_iter().collect()),
        }
    }
}

impl From<SymbolFilter> for Option<Vec<String>> {
    fn from(value: SymbolFilter) -> Self {
        match value {
            SymbolFilter::All => None,
            SymbolFilter::Only(symbols) => Some(symbols.into_iter().collect()),
        }
    }
}

/// How to reach an account's trading terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConnectionDescriptor {
    /// In-process simulated terminal
    Paper {
        #[serde(default = "default_paper_balance")]
        balance: Decimal,
        /// Defaults to the balance
        #[serde(default)]
        equity: Option<Decimal>,
    },
    /// JSON bridge in front of a terminal
    Http {
        base_url: String,
        #[serde(default)]
        login: Option<i64>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        server: Option<String>,
    },
}

fn default_paper_balance() -> Decimal {
    dec!(10000)
}

impl ConnectionDescriptor {
    /// Human-readable endpoint without credentials.
    pub fn endpoint(&self) -> String {
        match self {
            ConnectionDescriptor::Paper { .. } => "paper".to_string(),
            ConnectionDescriptor::Http { base_url, .. } => base_url.clone(),
        }
    }
}

impl Default for ConnectionDescriptor {
    fn default() -> Self {
        ConnectionDescriptor::Paper {
            balance: default_paper_balance(),
            equity: None,
        }
    }
}

/// Master account configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default = "default_master_name")]
    pub name: String,

    #[serde(default)]
    pub connection: ConnectionDescriptor,
}

fn default_master_name() -> String {
    "master".to_string()
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            name: default_master_name(),
            connection: ConnectionDescriptor::default(),
        }
    }
}

/// Copy configuration for one slave account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveConfig {
    /// Unique account name
    pub name: String,

    #[serde(default)]
    pub connection: ConnectionDescriptor,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_lot_mode")]
    pub lot_mode: LotMode,

    /// Meaning depends on `lot_mode`
    #[serde(default = "default_lot_value")]
    pub lot_value: Decimal,

    #[serde(default = "default_min_lot")]
    pub min_lot: Decimal,

    #[serde(default = "default_max_lot")]
    pub max_lot: Decimal,

    /// Tag stamped on every order the engine places for this slave
    #[serde(default = "default_magic")]
    pub magic_number: i64,

    /// Open the opposite side of every master position
    #[serde(default)]
    pub invert_trades: bool,

    /// Allowed deviation in points
    #[serde(default = "default_slippage")]
    pub max_slippage: i32,

    #[serde(default)]
    pub symbols_filter: SymbolFilter,
}

fn default_true() -> bool {
    true
}

fn default_lot_mode() -> LotMode {
    LotMode::Exact
}

fn default_lot_value() -> Decimal {
    dec!(1.0)
}

fn default_min_lot() -> Decimal {
    dec!(0.01)
}

fn default_max_lot() -> Decimal {
    dec!(10.0)
}

fn default_magic() -> i64 {
    123456
}

fn default_slippage() -> i32 {
    20
}

impl SlaveConfig {
    /// Slave with default copy settings.
    pub fn new(name: impl Into<String>, connection: ConnectionDescriptor) -> Self {
        Self {
            name: name.into(),
            connection,
            enabled: true,
            lot_mode: default_lot_mode(),
            lot_value: default_lot_value(),
            min_lot: default_min_lot(),
            max_lot: default_max_lot(),
            magic_number: default_magic(),
            invert_trades: false,
            max_slippage: default_slippage(),
            symbols_filter: SymbolFilter::All,
        }
    }

    /// Check the invariants the sizing and registry code rely on.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("slave name must not be empty".to_string());
        }
        if self.min_lot < Decimal::ZERO {
            return Err(format!("{}: min_lot must not be negative", self.name));
        }
        if self.max_lot <= Decimal::ZERO {
            return Err(format!("{}: max_lot must be positive", self.name));
        }
        if self.min_lot > self.max_lot {
            return Err(format!(
                "{}: min_lot {} exceeds max_lot {}",
                self.name, self.min_lot, self.max_lot
            ));
        }
        if matches!(self.lot_mode, LotMode::Fixed | LotMode::Multiplier)
            && self.lot_value <= Decimal::ZERO
        {
            return Err(format!(
                "{}: lot_value must be positive for {} mode",
                self.name, self.lot_mode
            ));
        }
        if self.max_slippage < 0 {
            return Err(format!("{}: max_slippage must not be negative", self.name));
        }
        Ok(())
    }
}

/// Partial update of the mutable copy settings of a slave.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlaveUpdate {
    pub lot_mode: Option<LotMode>,
    pub lot_value: Option<Decimal>,
    pub min_lot: Option<Decimal>,
    pub max_lot: Option<Decimal>,
    pub magic_number: Option<i64>,
    pub invert_trades: Option<bool>,
    pub max_slippage: Option<i32>,
    pub symbols_filter: Option<SymbolFilter>,
}

impl SlaveUpdate {
    pub fn is_empty(&self) -> bool {
        self.lot_mode.is_none()
            && self.lot_value.is_none()
            && self.min_lot.is_none()
            && self.max_lot.is_none()
            && self.magic_number.is_none()
            && self.invert_trades.is_none()
            && self.max_slippage.is_none()
            && self.symbols_filter.is_none()
    }

    /// Apply onto a copy of `config`; the caller validates the result.
    pub fn apply_to(&self, config: &SlaveConfig) -> SlaveConfig {
        let mut updated = config.clone();
        if let Some(mode) = self.lot_mode {
            updated.lot_mode = mode;
        }
        if let Some(value) = self.lot_value {
            updated.lot_value = value;
        }
        if let Some(min) = self.min_lot {
            updated.min_lot = min;
        }
        if let Some(max) = self.max_lot {
            updated.max_lot = max;
        }
        if let Some(magic) = self.magic_number {
            updated.magic_number = magic;
        }
        if let Some(invert) = self.invert_trades {
            updated.invert_trades = invert;
        }
        if let Some(slippage) = self.max_slippage {
            updated.max_slippage = slippage;
        }
        if let Some(filter) = &self.symbols_filter {
            updated.symbols_filter = filter.clone();
        }
        updated
    }
}

/// Whether an account is the copy source or a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    Master,
    Slave,
}

/// Runtime connection state of an account, refreshed by polls and heartbeats.
#[derive(Debug, Clone, Serialize)]
pub struct AccountState {
    pub name: String,
    pub role: AccountRole,
    pub connected: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub positions_count: usize,
    pub balance: Decimal,
    pub equity: Decimal,
    pub error_count: u32,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub lot_steps: HashMap<String, Decimal>,
}

impl AccountState {
    pub fn new(name: impl Into<String>, role: AccountRole) -> Self {
        Self {
            name: name.into(),
            role,
            connected: false,
            last_heartbeat: None,
            positions_count: 0,
            balance: Decimal::ZERO,
            equity: Decimal::ZERO,
            error_count: 0,
            last_error: None,
            lot_steps: HashMap::new(),
        }
    }

    /// Refresh from a successful snapshot.
    pub fn update_from_snapshot(&mut self, snapshot: &AccountSnapshot) {
        self.balance = snapshot.balance;
        self.equity = snapshot.equity;
        self.positions_count = snapshot.positions.len();
        self.last_heartbeat = Some(Utc::now());
        self.connected = true;
        self.error_count = 0;
        self.last_error = None;
        if !snapshot.lot_steps.is_empty() {
            self.lot_steps = snapshot.lot_steps.clone();
        }
    }

    pub fn record_error(&mut self, error: &str) {
        self.error_count += 1;
        self.last_error = Some(error.to_string());
        self.connected = false;
    }

    /// Lot step for `symbol`, falling back to `default_step`.
    pub fn lot_step(&self, symbol: &str, default_step: Decimal) -> Decimal {
        self.lot_steps
            .get(symbol)
            .copied()
            .filter(|step| *step > Decimal::ZERO)
            .unwrap_or(default_step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_filter() {
        assert!(SymbolFilter::All.admits("XAUUSD"));

        let filter = SymbolFilter::from(Some(vec!["EURUSD".to_string(), "GBPUSD".to_string()]));
        assert!(filter.admits("EURUSD"));
        assert!(!filter.admits("XAUUSD"));
    }

    #[test]
    fn test_slave_config_defaults_from_toml() {
        let config: SlaveConfig = toml::from_str(
            r#"
            name = "hedge"
            lot_mode = "multiplier"
            lot_value = 2
            invert_trades = true
            symbols_filter = ["EURUSD"]
            "#,
        )
        .unwrap();

        assert_eq!(config.lot_mode, LotMode::Multiplier);
        assert_eq!(config.lot_value, dec!(2));
        assert_eq!(config.min_lot, dec!(0.01));
        assert!(config.enabled);
        assert!(config.invert_trades);
        assert!(!config.symbols_filter.admits("GBPUSD"));
        assert!(matches!(config.connection, ConnectionDescriptor::Paper { .. }));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config = SlaveConfig::new("s1", ConnectionDescriptor::default());
        config.min_lot = dec!(1.0);
        config.max_lot = dec!(0.5);
        assert!(config.validate().is_err());

        config.max_lot = dec!(2.0);
        config.lot_mode = LotMode::Fixed;
        config.lot_value = Decimal::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_update_applies_only_given_fields() {
        let config = SlaveConfig::new("s1", ConnectionDescriptor::default());
        let update = SlaveUpdate {
            lot_mode: Some(LotMode::Fixed),
            lot_value: Some(dec!(0.3)),
            ..Default::default()
        };

        let updated = update.apply_to(&config);
        assert_eq!(updated.lot_mode, LotMode::Fixed);
        assert_eq!(updated.lot_value, dec!(0.3));
        assert_eq!(updated.max_lot, config.max_lot);
        assert!(!update.is_empty());
        assert!(SlaveUpdate::default().is_empty());
    }

    #[test]
    fn test_lot_step_fallback() {
        let mut state = AccountState::new("s1", AccountRole::Slave);
        assert_eq!(state.lot_step("EURUSD", dec!(0.01)), dec!(0.01));

        state.lot_steps.insert("XAUUSD".to_string(), dec!(0.1));
        assert_eq!(state.lot_step("XAUUSD", dec!(0.01)), dec!(0.1));
    }
}
