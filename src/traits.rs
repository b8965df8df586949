//! Capability traits for the ledger collaborator

use chrono::{DateTime, Duration, Utc};
use crate::config::MarketConfig;
use crate::error::LedgerError;
use crate::event::RentRequest;
use crate::types::{AccountName, Asset, MarketState, ResourceLimits};

/// Clock primitive exposed by a ledger whose time only moves through block production
pub trait LedgerClock {
    /// Head block time
    fn now(&self) -> DateTime<Utc>;

    /// Skip `skip` and produce one block; `now` moves by `skip` plus one block interval
    fn advance_clock(&mut self, skip: Duration) -> Result<(), LedgerError>;
}

/// Operations the harness consumes from the lease market and its host ledger
pub trait Ledger: LedgerClock {
    /// Apply a partial market configuration; unset fields keep their current value
    fn configure_market(&mut self, config: &MarketConfig) -> Result<(), LedgerError>;

    /// Purchase a lease on behalf of `request.payer` for `request.receiver`
    fn rent(&mut self, request: &RentRequest) -> Result<(), LedgerError>;

    /// Process up to `max` due lease-queue entries
    fn execute_queue(&mut self, invoker: &AccountName, max: u32) -> Result<(), LedgerError>;

    /// Fresh read of the market state
    fn market_state(&self) -> Result<MarketState, LedgerError>;

    /// Resource limits of `account`
    fn account_limits(&self, account: &AccountName) -> Result<ResourceLimits, LedgerError>;

    /// Liquid balance of `account`
    fn balance(&self, account: &AccountName) -> Result<Asset, LedgerError>;
}
