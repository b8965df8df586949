//! Error types for the harness

use thiserror::Error;
use crate::types::{OperationKind, Resource};
use std::fmt;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Time error: {0}")]
    Time(#[from] TimeError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Malformed config {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid asset '{input}': {reason}")]
    InvalidAsset { input: String, reason: String },

    #[error("Invalid account name '{input}': {reason}")]
    InvalidAccount { input: String, reason: String },

    #[error("Invalid timestamp '{input}' on line {line}: {reason}")]
    InvalidTimestamp { line: usize, input: String, reason: String },

    #[error("Invalid {field} '{input}' on line {line}: {reason}")]
    InvalidField {
        line: usize,
        field: String,
        input: String,
        reason: String,
    },

    #[error("Missing column {column} on line {line}")]
    MissingColumn { line: usize, column: String },

    #[error("Failed to read event log: {reason}")]
    Io { reason: String },
}

/// Errors reported by the ledger collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Market is not configured")]
    MarketNotConfigured,

    #[error("Calculated fee {fee} exceeds max payment {max_payment}")]
    PriceCapExceeded { fee: String, max_payment: String },

    #[error("Malformed request: {reason}")]
    MalformedRequest { reason: String },

    #[error("Invalid market configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Insufficient market capacity for {resource}: requested {requested}, available {available}")]
    InsufficientCapacity {
        resource: Resource,
        requested: i64,
        available: i64,
    },

    #[error("Account {account} has insufficient balance: needs {needed}, has {available}")]
    InsufficientBalance {
        account: String,
        needed: String,
        available: String,
    },

    #[error("Unknown account: {account}")]
    UnknownAccount { account: String },

    #[error("Ledger failure: {reason}")]
    Internal { reason: String },
}

impl LedgerError {
    /// Domain rejections are recovered per row; anything else ends the session
    pub fn is_domain(&self) -> bool {
        !matches!(
            self,
            LedgerError::UnknownAccount { .. } | LedgerError::Internal { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum TimeError {
    #[error("Local time {local} does not exist in the configured timezone")]
    NonexistentLocalTime { local: String },
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Serialization failed: {reason}")]
    SerializationFailed { reason: String },
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to write telemetry to {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("Telemetry session is already closed")]
    Closed,
}

/// Conservation law or bookkeeping rule checked around each operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invariant {
    PayerLimitsUnchanged(ResourceField),
    PayerBalanceUnchanged,
    PayerCurrencyUnchanged,
    ReceiverBalanceUnchanged,
    ReceiverRamUnchanged,
    ReceiverDelta(Resource),
    ReserveConservation(Resource),
    UtilizationDelta(Resource),
    TrajectoryTowardTarget(Resource),
}

/// Account limit field named by a payer-limits invariant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceField {
    Ram,
    Net,
    Cpu,
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invariant::PayerLimitsUnchanged(field) => {
                let name = match field {
                    ResourceField::Ram => "ram",
                    ResourceField::Net => "net",
                    ResourceField::Cpu => "cpu",
                };
                write!(f, "payer {} limit unchanged", name)
            }
            Invariant::PayerBalanceUnchanged => write!(f, "payer liquid balance unchanged"),
            Invariant::PayerCurrencyUnchanged => write!(f, "payer balance keeps its currency"),
            Invariant::ReceiverBalanceUnchanged => write!(f, "receiver liquid balance unchanged"),
            Invariant::ReceiverRamUnchanged => write!(f, "receiver ram unchanged"),
            Invariant::ReceiverDelta(r) => write!(f, "receiver {} delta equals resolved amount", r),
            Invariant::ReserveConservation(r) => {
                write!(f, "reserve {} decrease equals receiver increase", r)
            }
            Invariant::UtilizationDelta(r) => {
                write!(f, "market {} utilization delta equals resolved amount", r)
            }
            Invariant::TrajectoryTowardTarget(r) => {
                write!(f, "market {} weight ratio moves toward target", r)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{invariant} on line {line} ({operation}): expected {expected}, got {actual}")]
pub struct InvariantViolation {
    pub line: usize,
    pub operation: OperationKind,
    pub invariant: Invariant,
    pub expected: String,
    pub actual: String,
}
