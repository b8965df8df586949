//! Snapshot-and-invariant checking around a single ledger operation
//!
//! Each row moves through a fixed sequence: the before-state is captured, the
//! operation is dispatched, and then either the ledger rejects it (the row is
//! aborted and nothing is recorded) or the after-state is captured, validated
//! and recorded. A row never moves backwards through that sequence.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use crate::config::HarnessSettings;
use crate::error::{HarnessError, Invariant, InvariantViolation, LedgerError, ResourceField};
use crate::event::{Operation, RentRequest};
use crate::hasher::{ObservedState, SnapshotHasher};
use crate::telemetry::{TelemetryRow, TelemetrySink};
use crate::traits::Ledger;
use crate::types::{
    apply_frac, AccountName, AccountSnapshot, Asset, MarketState, Resource, StateHash,
};

/// How many invariants are enforced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Payer limits and receiver balance for rents, balances for queue runs
    #[default]
    Lenient,
    /// Adds exact receiver deltas, reserve conservation, utilization deltas
    /// and trajectory direction
    Strict,
}

/// Resource amounts a rent is expected to move to the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedDelta {
    pub net: i64,
    pub cpu: i64,
}

impl ExpectedDelta {
    /// Resolve a rent's fractions against the market weights it will be priced at
    pub fn resolve(request: &RentRequest, market: &MarketState) -> Self {
        Self {
            net: apply_frac(request.net_frac, market.net.weight),
            cpu: apply_frac(request.cpu_frac, market.cpu.weight),
        }
    }

    pub fn get(&self, resource: Resource) -> i64 {
        match resource {
            Resource::Net => self.net,
            Resource::Cpu => self.cpu,
        }
    }
}

/// Payer, receiver, reserve and market state at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub payer: AccountSnapshot,
    pub receiver: AccountSnapshot,
    pub reserve: AccountSnapshot,
    pub market: MarketState,
}

impl Snapshot {
    pub fn capture<L>(
        ledger: &L,
        payer: &AccountName,
        receiver: &AccountName,
        reserve: &AccountName,
    ) -> Result<Self, LedgerError>
    where
        L: Ledger + ?Sized,
    {
        Ok(Self {
            payer: account_snapshot(ledger, payer)?,
            receiver: account_snapshot(ledger, receiver)?,
            reserve: account_snapshot(ledger, reserve)?,
            market: ledger.market_state()?,
        })
    }
}

/// Limits plus liquid balance of `account`
pub fn account_snapshot<L>(ledger: &L, account: &AccountName) -> Result<AccountSnapshot, LedgerError>
where
    L: Ledger + ?Sized,
{
    let limits = ledger.account_limits(account)?;
    Ok(AccountSnapshot {
        account: account.clone(),
        ram: limits.ram,
        net: limits.net,
        cpu: limits.cpu,
        liquid: ledger.balance(account)?,
    })
}

/// Result of checking one row
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Recorded(TelemetryRow),
    /// The ledger rejected the operation; nothing was recorded
    Aborted { reason: LedgerError },
}

/// Brackets each operation with snapshots and enforces the conservation laws
#[derive(Debug, Clone)]
pub struct InvariantChecker {
    strictness: Strictness,
    reserve: AccountName,
    invoker: AccountName,
    hasher: SnapshotHasher,
}

impl InvariantChecker {
    pub fn new(reserve: AccountName, invoker: AccountName) -> Self {
        Self {
            strictness: Strictness::default(),
            reserve,
            invoker,
            hasher: SnapshotHasher::new(),
        }
    }

    pub fn from_settings(settings: &HarnessSettings) -> Self {
        Self::new(settings.reserve_account.clone(), settings.queue_invoker.clone())
            .with_strictness(settings.strictness)
    }

    pub fn with_strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    pub fn reserve(&self) -> &AccountName {
        &self.reserve
    }

    /// Chain digest over every recorded row so far
    pub fn digest(&self) -> StateHash {
        self.hasher.digest()
    }

    /// Check one operation, deriving strict-mode rent deltas from the before-state
    pub fn check<L>(
        &mut self,
        ledger: &mut L,
        sink: &mut TelemetrySink,
        line: usize,
        operation: &Operation,
    ) -> Result<CheckOutcome, HarnessError>
    where
        L: Ledger + ?Sized,
    {
        self.run(ledger, sink, line, operation, None)
    }

    /// Check one operation against deltas known ahead of time
    pub fn check_expecting<L>(
        &mut self,
        ledger: &mut L,
        sink: &mut TelemetrySink,
        line: usize,
        operation: &Operation,
        expected: ExpectedDelta,
    ) -> Result<CheckOutcome, HarnessError>
    where
        L: Ledger + ?Sized,
    {
        self.run(ledger, sink, line, operation, Some(expected))
    }

    fn run<L>(
        &mut self,
        ledger: &mut L,
        sink: &mut TelemetrySink,
        line: usize,
        operation: &Operation,
        expected: Option<ExpectedDelta>,
    ) -> Result<CheckOutcome, HarnessError>
    where
        L: Ledger + ?Sized,
    {
        let payer = operation.payer();
        let receiver = operation.receiver();
        let before = Snapshot::capture(&*ledger, payer, receiver, &self.reserve)?;

        let dispatched = match operation {
            Operation::Rent(request) => ledger.rent(request),
            Operation::ExecuteQueue(request) => ledger.execute_queue(&self.invoker, request.max),
        };
        if let Err(err) = dispatched {
            if err.is_domain() {
                warn!(line, operation = %operation.kind(), reason = %err, "ledger rejected operation, row aborted");
                return Ok(CheckOutcome::Aborted { reason: err });
            }
            return Err(err.into());
        }

        let after = Snapshot::capture(&*ledger, payer, receiver, &self.reserve)?;

        let violations = self.validate(line, operation, &before, &after, expected);
        if let Some(first) = violations.first() {
            for violation in &violations {
                error!(%violation, "invariant violated");
            }
            return Err(first.clone().into());
        }

        let row = build_row(line, operation, &before, &after, ledger.now())?;
        let hash = self.hasher.record(&ObservedState {
            line,
            market: &after.market,
            payer: &after.payer,
            receiver: &after.receiver,
            reserve: &after.reserve,
        })?;
        debug!(line, operation = %operation.kind(), %hash, "row verified");
        sink.record(row.clone())?;
        Ok(CheckOutcome::Recorded(row))
    }

    fn validate(
        &self,
        line: usize,
        operation: &Operation,
        before: &Snapshot,
        after: &Snapshot,
        expected: Option<ExpectedDelta>,
    ) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let mut require = |invariant: Invariant, expected: String, actual: String| {
            if expected != actual {
                violations.push(InvariantViolation {
                    line,
                    operation: operation.kind(),
                    invariant,
                    expected,
                    actual,
                });
            }
        };

        let currency = |a: &Asset| format!("{},{}", a.precision(), a.symbol());
        require(
            Invariant::PayerCurrencyUnchanged,
            currency(&before.payer.liquid),
            currency(&after.payer.liquid),
        );

        match operation {
            Operation::Rent(request) => {
                if request.payer != request.receiver {
                    for (field, b, a) in [
                        (ResourceField::Ram, before.payer.ram, after.payer.ram),
                        (ResourceField::Net, before.payer.net, after.payer.net),
                        (ResourceField::Cpu, before.payer.cpu, after.payer.cpu),
                    ] {
                        require(Invariant::PayerLimitsUnchanged(field), b.to_string(), a.to_string());
                    }
                    require(
                        Invariant::ReceiverBalanceUnchanged,
                        before.receiver.liquid.to_string(),
                        after.receiver.liquid.to_string(),
                    );
                }

                if self.strictness == Strictness::Strict {
                    let expected =
                        expected.unwrap_or_else(|| ExpectedDelta::resolve(request, &before.market));
                    require(
                        Invariant::ReceiverRamUnchanged,
                        before.receiver.ram.to_string(),
                        after.receiver.ram.to_string(),
                    );
                    for resource in Resource::ALL {
                        let want = expected.get(resource).to_string();
                        let received =
                            after.receiver.resource(resource) - before.receiver.resource(resource);
                        let released =
                            before.reserve.resource(resource) - after.reserve.resource(resource);
                        let utilized = after.market.resource(resource).utilization
                            - before.market.resource(resource).utilization;
                        require(Invariant::ReceiverDelta(resource), want.clone(), received.to_string());
                        require(Invariant::ReserveConservation(resource), want.clone(), released.to_string());
                        require(Invariant::UtilizationDelta(resource), want, utilized.to_string());
                    }
                }
            }
            Operation::ExecuteQueue(request) => {
                require(
                    Invariant::PayerBalanceUnchanged,
                    before.payer.liquid.to_string(),
                    after.payer.liquid.to_string(),
                );
                if request.receiver != request.payer {
                    require(
                        Invariant::ReceiverBalanceUnchanged,
                        before.receiver.liquid.to_string(),
                        after.receiver.liquid.to_string(),
                    );
                }
            }
        }

        if self.strictness == Strictness::Strict {
            for resource in Resource::ALL {
                let b = before.market.resource(resource);
                let a = after.market.resource(resource);
                let target = i128::from(a.target_weight_ratio);
                let gap_before = (i128::from(b.weight_ratio) - target).abs();
                let gap_after = (i128::from(a.weight_ratio) - target).abs();
                if gap_after > gap_before {
                    require(
                        Invariant::TrajectoryTowardTarget(resource),
                        format!("|ratio - target| <= {}", gap_before),
                        format!("|ratio - target| = {}", gap_after),
                    );
                }
            }
        }

        violations
    }
}

fn build_row(
    line: usize,
    operation: &Operation,
    before: &Snapshot,
    after: &Snapshot,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> Result<TelemetryRow, LedgerError> {
    let (net_frac, cpu_frac) = match operation {
        Operation::Rent(r) => (r.net_frac, r.cpu_frac),
        Operation::ExecuteQueue(_) => (0, 0),
    };
    // Negative when the payer was refunded
    let payer_cost = before
        .payer
        .liquid
        .checked_sub(&after.payer.liquid)
        .ok_or_else(|| LedgerError::Internal {
            reason: format!(
                "payer balance moved from {} to {}",
                before.payer.liquid, after.payer.liquid
            ),
        })?;

    Ok(TelemetryRow {
        line,
        operation: operation.kind(),
        timestamp,
        before_net_assumed_stake_weight: before.market.net.assumed_stake_weight,
        before_net_weight_ratio: before.market.net.weight_ratio,
        before_net_weight: before.market.net.weight,
        before_receiver_net: before.receiver.net,
        after_receiver_net: after.receiver.net,
        requested_net_frac: net_frac,
        requested_cpu_frac: cpu_frac,
        receiver_net_delta: after.receiver.net - before.receiver.net,
        receiver_cpu_delta: after.receiver.cpu - before.receiver.cpu,
        payer_cost,
        before_reserve_net: before.reserve.net,
        after_reserve_net: after.reserve.net,
        before_reserve_cpu: before.reserve.cpu,
        after_reserve_cpu: after.reserve.cpu,
        after_market: after.market.clone(),
    })
}
