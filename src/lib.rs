//! Bandwidth Lease Replay Harness
//!
//! Replays a timestamped log of bandwidth-lease operations against a ledger,
//! advancing the ledger clock to each event's simulated instant, checking the
//! conservation laws around every operation and recording a telemetry row per
//! verified operation.

pub mod checker;
pub mod config;
pub mod error;
pub mod event;
pub mod hasher;
pub mod replay_driver;
pub mod scenario;
pub mod session;
pub mod sim_ledger;
pub mod telemetry;
pub mod time_sync;
pub mod traits;
pub mod types;

// Re-export core types and traits
pub use checker::{CheckOutcome, ExpectedDelta, InvariantChecker, Snapshot, Strictness};
pub use config::{
    ConfigLoader, ConfigSource, HarnessSettings, LoadedConfig, MalformedPolicy, MarketConfig,
    MarketConfigFile, ResourceConfig,
};
pub use error::{
    ConfigError, HarnessError, Invariant, InvariantViolation, LedgerError, ParseError,
    SerializationError, TelemetryError, TimeError,
};
pub use event::{AccountDirectory, Event, EventLog, LogRow, Operation, QueueRequest, RentRequest};
pub use hasher::SnapshotHasher;
pub use replay_driver::{ReplayDriver, ReplayDriverBuilder, ReplayReport, RowOutcome};
pub use session::Session;
pub use sim_ledger::SimLedger;
pub use telemetry::{TelemetryRow, TelemetrySink};
pub use time_sync::{SyncOutcome, TimeCursor, TimeSynchronizer};
pub use traits::{Ledger, LedgerClock};
pub use types::{
    AccountName, AccountSnapshot, Asset, MarketState, OperationKind, PerformanceMetrics, Resource,
    ResourceLimits, ResourceState, StateHash, FRAC_SCALE,
};
