//! Core data types for the lease replay harness

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use crate::error::ParseError;

/// Fixed-point scale: `FRAC_SCALE` represents 1.0
pub const FRAC_SCALE: i64 = 1_000_000_000_000_000;

/// Convert a fixed-point fraction to a float for display
pub fn frac_to_f64(frac: i64) -> f64 {
    frac as f64 / FRAC_SCALE as f64
}

/// Scale `amount` by the fixed-point fraction `frac`, truncating toward zero
pub fn apply_frac(frac: i64, amount: i64) -> i64 {
    let scaled = i128::from(frac) * i128::from(amount) / i128::from(FRAC_SCALE);
    i64::try_from(scaled).unwrap_or(if scaled < 0 { i64::MIN } else { i64::MAX })
}

/// The two divisible resources sold by the market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Net,
    Cpu,
}

impl Resource {
    pub const ALL: [Resource; 2] = [Resource::Net, Resource::Cpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Net => "net",
            Resource::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation kinds the harness knows how to dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Rent,
    ExecuteQueue,
}

impl OperationKind {
    /// Map a log `function` column to a kind; anything unrecognized is `None`
    pub fn from_function(function: &str) -> Option<Self> {
        match function.trim() {
            "rent" => Some(OperationKind::Rent),
            "execute-queue" => Some(OperationKind::ExecuteQueue),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Rent => "rent",
            OperationKind::ExecuteQueue => "execute-queue",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token quantity with a fixed decimal precision and a currency symbol,
/// written as `"<amount> <SYMBOL>"`, e.g. `"1.0000 TST"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Asset {
    amount: i64,
    precision: u8,
    symbol: String,
}

impl Asset {
    /// Create an asset from raw units (`amount` counts `10^-precision` steps)
    pub fn new(amount: i64, precision: u8, symbol: impl Into<String>) -> Self {
        Self {
            amount,
            precision,
            symbol: symbol.into(),
        }
    }

    /// Zero quantity of the same currency
    pub fn zero_like(&self) -> Self {
        Self::new(0, self.precision, self.symbol.clone())
    }

    /// Same currency, different raw amount
    pub fn with_amount(&self, amount: i64) -> Self {
        Self::new(amount, self.precision, self.symbol.clone())
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// True when both assets share symbol and precision
    pub fn is_compatible(&self, other: &Asset) -> bool {
        self.symbol == other.symbol && self.precision == other.precision
    }

    pub fn checked_add(&self, other: &Asset) -> Option<Asset> {
        if !self.is_compatible(other) {
            return None;
        }
        self.amount.checked_add(other.amount).map(|a| self.with_amount(a))
    }

    pub fn checked_sub(&self, other: &Asset) -> Option<Asset> {
        if !self.is_compatible(other) {
            return None;
        }
        self.amount.checked_sub(other.amount).map(|a| self.with_amount(a))
    }

    /// Decimal value of the quantity
    pub fn to_decimal(&self) -> f64 {
        self.amount as f64 / 10f64.powi(i32::from(self.precision))
    }

    /// Quantity formatted without the symbol
    pub fn decimal_string(&self) -> String {
        let scale = 10i128.pow(u32::from(self.precision));
        let amount = i128::from(self.amount);
        let sign = if amount < 0 { "-" } else { "" };
        let whole = amount.abs() / scale;
        if self.precision == 0 {
            return format!("{}{}", sign, whole);
        }
        let fraction = amount.abs() % scale;
        format!(
            "{}{}.{:0width$}",
            sign,
            whole,
            fraction,
            width = usize::from(self.precision)
        )
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.decimal_string(), self.symbol)
    }
}

impl FromStr for Asset {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ParseError::InvalidAsset {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = s.split_whitespace();
        let quantity = parts.next().ok_or_else(|| invalid("empty asset"))?;
        let symbol = parts.next().ok_or_else(|| invalid("missing symbol"))?;
        if parts.next().is_some() {
            return Err(invalid("unexpected trailing text"));
        }
        if symbol.is_empty()
            || symbol.len() > 7
            || !symbol.chars().all(|c| c.is_ascii_uppercase())
        {
            return Err(invalid("symbol must be 1-7 uppercase letters"));
        }

        let (negative, digits) = match quantity.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, quantity),
        };
        let (whole, fraction) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty()
            || !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid("quantity must be a decimal number"));
        }
        let precision = u8::try_from(fraction.len())
            .ok()
            .filter(|p| *p <= 18)
            .ok_or_else(|| invalid("precision too large"))?;

        let overflow = || invalid("quantity out of range");
        let whole: i64 = whole.parse().map_err(|_| overflow())?;
        let fraction: i64 = if fraction.is_empty() {
            0
        } else {
            fraction.parse().map_err(|_| overflow())?
        };
        let mut amount = whole
            .checked_mul(10i64.pow(u32::from(precision)))
            .and_then(|a| a.checked_add(fraction))
            .ok_or_else(overflow)?;
        if negative {
            amount = -amount;
        }

        Ok(Asset::new(amount, precision, symbol))
    }
}

impl Serialize for Asset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Asset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Canonical ledger account identifier: 1-12 chars of `a-z`, `1-5` and `.`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountName(String);

impl AccountName {
    /// Wrap a name already known to be canonical
    pub(crate) fn from_canonical(name: &str) -> Self {
        debug_assert!(name.parse::<AccountName>().is_ok(), "non-canonical account {}", name);
        AccountName(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AccountName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let invalid = |reason: &str| ParseError::InvalidAccount {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        if name.is_empty() || name.len() > 12 {
            return Err(invalid("length must be 1-12 characters"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || ('1'..='5').contains(&c) || c == '.')
        {
            return Err(invalid("allowed characters are a-z, 1-5 and '.'"));
        }
        if name.ends_with('.') {
            return Err(invalid("name cannot end with '.'"));
        }
        Ok(AccountName(name))
    }
}

impl TryFrom<String> for AccountName {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AccountName> for String {
    fn from(name: AccountName) -> Self {
        name.0
    }
}

impl fmt::Display for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource limits the ledger reports for one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub ram: i64,
    pub net: i64,
    pub cpu: i64,
}

impl ResourceLimits {
    pub fn get(&self, resource: Resource) -> i64 {
        match resource {
            Resource::Net => self.net,
            Resource::Cpu => self.cpu,
        }
    }
}

/// Limits and liquid balance of one account at one instant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account: AccountName,
    pub ram: i64,
    pub net: i64,
    pub cpu: i64,
    pub liquid: Asset,
}

impl AccountSnapshot {
    pub fn resource(&self, resource: Resource) -> i64 {
        match resource {
            Resource::Net => self.net,
            Resource::Cpu => self.cpu,
        }
    }
}

/// Market state for a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub version: u8,
    pub weight: i64,
    pub weight_ratio: i64,
    pub assumed_stake_weight: i64,
    pub initial_weight_ratio: i64,
    pub target_weight_ratio: i64,
    pub initial_timestamp: DateTime<Utc>,
    pub target_timestamp: DateTime<Utc>,
    pub exponent: f64,
    pub decay_secs: u32,
    pub min_price: Asset,
    pub max_price: Asset,
    pub utilization: i64,
    pub adjusted_utilization: i64,
    pub utilization_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fee: Option<Asset>,
}

/// Read-only projection of the lease market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    pub version: u8,
    pub net: ResourceState,
    pub cpu: ResourceState,
    pub rent_days: u32,
    pub min_rent_fee: Asset,
}

impl MarketState {
    pub fn resource(&self, resource: Resource) -> &ResourceState {
        match resource {
            Resource::Net => &self.net,
            Resource::Cpu => &self.cpu,
        }
    }
}

/// blake3 digest of recorded harness state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateHash(pub [u8; 32]);

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Performance metrics for a replay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_duration_ms: u64,
    pub rows_per_second: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_parse_and_display() {
        let asset: Asset = "1000000.0000 TST".parse().unwrap();
        assert_eq!(asset.amount(), 10_000_000_000);
        assert_eq!(asset.precision(), 4);
        assert_eq!(asset.symbol(), "TST");
        assert_eq!(asset.to_string(), "1000000.0000 TST");

        let negative: Asset = "-0.0500 TST".parse().unwrap();
        assert_eq!(negative.amount(), -500);
        assert_eq!(negative.to_string(), "-0.0500 TST");
    }

    #[test]
    fn test_asset_rejects_malformed_input() {
        assert!("".parse::<Asset>().is_err());
        assert!("1.0000".parse::<Asset>().is_err());
        assert!("1.0000 tst".parse::<Asset>().is_err());
        assert!("abc TST".parse::<Asset>().is_err());
        assert!("1.0 TST extra".parse::<Asset>().is_err());
    }

    #[test]
    fn test_asset_arithmetic_requires_same_currency() {
        let a: Asset = "2.0000 TST".parse().unwrap();
        let b: Asset = "0.5000 TST".parse().unwrap();
        let c: Asset = "0.50 TST".parse().unwrap();

        assert_eq!(a.checked_sub(&b).unwrap().to_string(), "1.5000 TST");
        assert_eq!(a.checked_add(&b).unwrap().to_string(), "2.5000 TST");
        assert!(a.checked_sub(&c).is_none());
    }

    #[test]
    fn test_account_name_canonicalization() {
        let name: AccountName = " Eosio.Reserv ".parse().unwrap();
        assert_eq!(name.as_str(), "eosio.reserv");

        assert!("aaaaaaaaaaaaa".parse::<AccountName>().is_err());
        assert!("alice6".parse::<AccountName>().is_err());
        assert!("alice.".parse::<AccountName>().is_err());
        assert!("".parse::<AccountName>().is_err());
    }

    #[test]
    fn test_apply_frac() {
        let stake_weight = 1_000_000_000_000;
        assert_eq!(apply_frac(FRAC_SCALE / 10, stake_weight), stake_weight / 10);
        assert_eq!(apply_frac(FRAC_SCALE, i64::MAX), i64::MAX);
        assert_eq!(frac_to_f64(FRAC_SCALE / 2), 0.5);
    }

    #[test]
    fn test_operation_kind_from_function() {
        assert_eq!(OperationKind::from_function("rent"), Some(OperationKind::Rent));
        assert_eq!(
            OperationKind::from_function(" execute-queue "),
            Some(OperationKind::ExecuteQueue)
        );
        assert_eq!(OperationKind::from_function("comment"), None);
    }
}
