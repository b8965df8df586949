//! In-memory reference ledger
//!
//! `SimLedger` hosts accounts, a block clock and a lease market with the same
//! observable bookkeeping as the real contract: leased resources move between
//! the reserve account and receivers, utilization tracks outstanding leases,
//! and the weight ratio follows a linear trajectory from its initial to its
//! target value. A lease is priced by integrating
//! `min_price + (max_price - min_price) * u^exponent` over the utilization
//! fraction `u` it adds, starting from the adjusted utilization.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;
use crate::config::{MarketConfig, ResourceConfig};
use crate::error::LedgerError;
use crate::event::RentRequest;
use crate::traits::{Ledger, LedgerClock};
use crate::types::{
    apply_frac, AccountName, Asset, MarketState, Resource, ResourceLimits, ResourceState, FRAC_SCALE,
};

/// Time added by producing one block
pub const BLOCK_INTERVAL_MS: i64 = 500;

#[derive(Debug, Clone)]
struct SimAccount {
    limits: ResourceLimits,
    liquid: Asset,
}

#[derive(Debug, Clone)]
struct Lease {
    receiver: AccountName,
    net: i64,
    cpu: i64,
    expires: DateTime<Utc>,
}

/// Ledger stand-in for running the harness without a chain
#[derive(Debug, Clone)]
pub struct SimLedger {
    now: DateTime<Utc>,
    block_interval: Duration,
    accounts: BTreeMap<AccountName, SimAccount>,
    reserve: AccountName,
    market: Option<MarketState>,
    queue: VecDeque<Lease>,
    fees_collected: Option<Asset>,
}

impl SimLedger {
    /// Empty ledger whose head block time is `genesis`; the reserve account is created empty
    pub fn new(genesis: DateTime<Utc>, reserve: AccountName) -> Self {
        let mut accounts = BTreeMap::new();
        accounts.insert(
            reserve.clone(),
            SimAccount {
                limits: ResourceLimits::default(),
                liquid: Asset::new(0, 4, "TST"),
            },
        );
        Self {
            now: genesis,
            block_interval: Duration::milliseconds(BLOCK_INTERVAL_MS),
            accounts,
            reserve,
            market: None,
            queue: VecDeque::new(),
            fees_collected: None,
        }
    }

    /// Leases not yet returned to the reserve
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Leases whose expiry has passed but that have not been processed
    pub fn due_leases(&self) -> usize {
        self.queue.iter().take_while(|l| l.expires <= self.now).count()
    }

    /// Total fees charged so far
    pub fn fees_collected(&self) -> Option<&Asset> {
        self.fees_collected.as_ref()
    }

    fn account(&self, name: &AccountName) -> Result<&SimAccount, LedgerError> {
        self.accounts.get(name).ok_or_else(|| LedgerError::UnknownAccount {
            account: name.to_string(),
        })
    }

    fn account_mut(&mut self, name: &AccountName) -> Result<&mut SimAccount, LedgerError> {
        self.accounts.get_mut(name).ok_or_else(|| LedgerError::UnknownAccount {
            account: name.to_string(),
        })
    }

    fn adjust_resource(
        &mut self,
        name: &AccountName,
        resource: Resource,
        delta: i64,
    ) -> Result<(), LedgerError> {
        let account = self.account_mut(name)?;
        let limit = match resource {
            Resource::Net => &mut account.limits.net,
            Resource::Cpu => &mut account.limits.cpu,
        };
        *limit = limit.checked_add(delta).ok_or_else(|| LedgerError::Internal {
            reason: format!("{} {} limit overflows adding {}", name, resource, delta),
        })?;
        Ok(())
    }

    /// Bring weights and adjusted utilization up to the current head time
    fn update_market(&mut self) -> Result<(), LedgerError> {
        let now = self.now;
        let mut market = match self.market.take() {
            Some(market) => market,
            None => return Ok(()),
        };
        let mut weight_deltas = Vec::with_capacity(2);
        for resource in Resource::ALL {
            let state = match resource {
                Resource::Net => &mut market.net,
                Resource::Cpu => &mut market.cpu,
            };
            state.weight_ratio = ratio_at(state, now);
            let weight = weight_for(state.assumed_stake_weight, state.weight_ratio);
            weight_deltas.push((resource, weight - state.weight));
            state.weight = weight;
            decay_utilization(state, now);
        }
        self.market = Some(market);
        let reserve = self.reserve.clone();
        for (resource, delta) in weight_deltas {
            if delta != 0 {
                self.adjust_resource(&reserve, resource, delta)?;
            }
        }
        Ok(())
    }

    fn market_mut(&mut self) -> Result<&mut MarketState, LedgerError> {
        self.market.as_mut().ok_or(LedgerError::MarketNotConfigured)
    }

    fn quote(market: &MarketState, request: &RentRequest, amounts: &[(Resource, i64); 2]) -> Quote {
        let mut shares = [0i64; 2];
        for (i, (resource, amount)) in amounts.iter().enumerate() {
            let frac = match resource {
                Resource::Net => request.net_frac,
                Resource::Cpu => request.cpu_frac,
            };
            if frac > 0 {
                shares[i] = resource_fee(market.resource(*resource), frac, *amount);
            }
        }
        let total = shares[0]
            .saturating_add(shares[1])
            .max(market.min_rent_fee.amount());
        Quote {
            total: market.min_rent_fee.with_amount(total),
            net: shares[0],
            cpu: shares[1],
        }
    }
}

struct Quote {
    total: Asset,
    net: i64,
    cpu: i64,
}

/// Price of moving `amount` (a `frac` share of the weight) into utilization
fn resource_fee(state: &ResourceState, frac: i64, amount: i64) -> i64 {
    let base = apply_frac(frac, state.min_price.amount());
    let spread = state.max_price.amount() - state.min_price.amount();
    if spread == 0 || state.weight <= 0 {
        return base;
    }
    let weight = state.weight as f64;
    let start = state.adjusted_utilization as f64 / weight;
    let end = (state.adjusted_utilization as f64 + amount as f64) / weight;
    let power = state.exponent + 1.0;
    let premium = spread as f64 * (end.powf(power) - start.powf(power)) / power;
    base.saturating_add(premium.ceil() as i64)
}

fn ratio_at(state: &ResourceState, now: DateTime<Utc>) -> i64 {
    if now >= state.target_timestamp || state.initial_timestamp >= state.target_timestamp {
        return state.target_weight_ratio;
    }
    if now <= state.initial_timestamp {
        return state.initial_weight_ratio;
    }
    let elapsed = i128::from((now - state.initial_timestamp).num_milliseconds());
    let span = i128::from((state.target_timestamp - state.initial_timestamp).num_milliseconds());
    let initial = i128::from(state.initial_weight_ratio);
    let target = i128::from(state.target_weight_ratio);
    let ratio = initial + (target - initial) * elapsed / span;
    i64::try_from(ratio).unwrap_or(state.target_weight_ratio)
}

/// Market weight implied by a ratio: `stake * 1.0 / ratio - stake`
fn weight_for(assumed_stake_weight: i64, weight_ratio: i64) -> i64 {
    if weight_ratio <= 0 {
        return 0;
    }
    let stake = i128::from(assumed_stake_weight);
    let weight = stake * i128::from(FRAC_SCALE) / i128::from(weight_ratio) - stake;
    i64::try_from(weight).unwrap_or(i64::MAX)
}

fn decay_utilization(state: &mut ResourceState, now: DateTime<Utc>) {
    if state.adjusted_utilization > state.utilization && now > state.utilization_timestamp {
        let elapsed = (now - state.utilization_timestamp).num_milliseconds() as f64 / 1000.0;
        let excess = (state.adjusted_utilization - state.utilization) as f64;
        let decayed = excess * (-elapsed / f64::from(state.decay_secs.max(1))).exp();
        state.adjusted_utilization = state.utilization + decayed as i64;
    }
    if state.adjusted_utilization < state.utilization {
        state.adjusted_utilization = state.utilization;
    }
    state.utilization_timestamp = now;
}

fn merge_resource(
    name: Resource,
    existing: Option<&ResourceState>,
    config: &ResourceConfig,
    now: DateTime<Utc>,
) -> Result<ResourceState, LedgerError> {
    fn pick<T: Clone>(
        name: Resource,
        field: &str,
        value: &Option<T>,
        current: Option<T>,
    ) -> Result<T, LedgerError> {
        value
            .clone()
            .or(current)
            .ok_or_else(|| LedgerError::InvalidConfig {
                reason: format!("{}.{} is required", name, field),
            })
    }

    let current_weight_ratio = pick(
        name,
        "current_weight_ratio",
        &config.current_weight_ratio,
        existing.map(|s| s.weight_ratio),
    )?;
    let target_weight_ratio = pick(
        name,
        "target_weight_ratio",
        &config.target_weight_ratio,
        existing.map(|s| s.target_weight_ratio),
    )?;
    let assumed_stake_weight = pick(
        name,
        "assumed_stake_weight",
        &config.assumed_stake_weight,
        existing.map(|s| s.assumed_stake_weight),
    )?;
    let target_timestamp = pick(
        name,
        "target_timestamp",
        &config.target_timestamp,
        existing.map(|s| s.target_timestamp),
    )?;
    let exponent = pick(name, "exponent", &config.exponent, existing.map(|s| s.exponent))?;
    let decay_secs = pick(name, "decay_secs", &config.decay_secs, existing.map(|s| s.decay_secs))?;
    let min_price = pick(
        name,
        "min_price",
        &config.min_price,
        existing.map(|s| s.min_price.clone()),
    )?;
    let max_price = pick(
        name,
        "max_price",
        &config.max_price,
        existing.map(|s| s.max_price.clone()),
    )?;

    let invalid = |reason: String| LedgerError::InvalidConfig {
        reason: format!("{}: {}", name, reason),
    };
    if current_weight_ratio <= 0 || current_weight_ratio > FRAC_SCALE {
        return Err(invalid("current_weight_ratio is out of range".to_string()));
    }
    if target_weight_ratio <= 0 || target_weight_ratio > current_weight_ratio {
        return Err(invalid("weight can't grow over time".to_string()));
    }
    if assumed_stake_weight < 1 {
        return Err(invalid("assumed_stake_weight must be at least 1".to_string()));
    }
    if target_weight_ratio != current_weight_ratio && target_timestamp <= now {
        return Err(invalid("target_timestamp must be in the future".to_string()));
    }
    if exponent < 1.0 {
        return Err(invalid("exponent must be >= 1".to_string()));
    }
    if decay_secs < 1 {
        return Err(invalid("decay_secs must be >= 1".to_string()));
    }
    if !min_price.is_compatible(&max_price)
        || min_price.amount() < 0
        || min_price.amount() > max_price.amount()
    {
        return Err(invalid(format!("invalid price range {} - {}", min_price, max_price)));
    }

    let utilization = existing.map(|s| s.utilization).unwrap_or(0);
    Ok(ResourceState {
        version: 0,
        weight: weight_for(assumed_stake_weight, current_weight_ratio),
        weight_ratio: current_weight_ratio,
        assumed_stake_weight,
        initial_weight_ratio: current_weight_ratio,
        target_weight_ratio,
        initial_timestamp: now,
        target_timestamp,
        exponent,
        decay_secs,
        fee: existing
            .and_then(|s| s.fee.clone())
            .or_else(|| Some(min_price.zero_like())),
        min_price,
        max_price,
        utilization,
        adjusted_utilization: existing.map(|s| s.adjusted_utilization).unwrap_or(0),
        utilization_timestamp: existing.map(|s| s.utilization_timestamp).unwrap_or(now),
    })
}

impl LedgerClock for SimLedger {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn advance_clock(&mut self, skip: Duration) -> Result<(), LedgerError> {
        if skip < Duration::zero() {
            return Err(LedgerError::Internal {
                reason: format!("cannot move the clock back by {}ms", -skip.num_milliseconds()),
            });
        }
        self.now = self.now + skip + self.block_interval;
        self.update_market()
    }
}

impl Ledger for SimLedger {
    fn configure_market(&mut self, config: &MarketConfig) -> Result<(), LedgerError> {
        self.update_market()?;
        let now = self.now;
        let existing = self.market.as_ref();

        let net = merge_resource(Resource::Net, existing.map(|m| &m.net), &config.net, now)?;
        let cpu = merge_resource(Resource::Cpu, existing.map(|m| &m.cpu), &config.cpu, now)?;
        let rent_days = config
            .rent_days
            .or(existing.map(|m| m.rent_days))
            .ok_or_else(|| LedgerError::InvalidConfig {
                reason: "rent_days is required".to_string(),
            })?;
        let min_rent_fee = config
            .min_rent_fee
            .clone()
            .or_else(|| existing.map(|m| m.min_rent_fee.clone()))
            .ok_or_else(|| LedgerError::InvalidConfig {
                reason: "min_rent_fee is required".to_string(),
            })?;
        if rent_days == 0 {
            return Err(LedgerError::InvalidConfig {
                reason: "rent_days must be > 0".to_string(),
            });
        }
        if min_rent_fee.amount() < 0 || !min_rent_fee.is_compatible(&net.min_price) {
            return Err(LedgerError::InvalidConfig {
                reason: format!("invalid min_rent_fee {}", min_rent_fee),
            });
        }

        let old_weights = existing.map(|m| (m.net.weight, m.cpu.weight)).unwrap_or((0, 0));
        let (net_delta, cpu_delta) = (net.weight - old_weights.0, cpu.weight - old_weights.1);

        let reserve = self.reserve.clone();
        let limits = self.account(&reserve)?.limits;
        if limits.net.checked_add(net_delta).is_none() || limits.cpu.checked_add(cpu_delta).is_none() {
            return Err(LedgerError::Internal {
                reason: format!("market weight overflows {} limits", reserve),
            });
        }
        self.market = Some(MarketState {
            version: 0,
            net,
            cpu,
            rent_days,
            min_rent_fee,
        });
        self.adjust_resource(&reserve, Resource::Net, net_delta)?;
        self.adjust_resource(&reserve, Resource::Cpu, cpu_delta)?;
        debug!(%now, "market configured");
        Ok(())
    }

    fn rent(&mut self, request: &RentRequest) -> Result<(), LedgerError> {
        if self.market.is_none() {
            return Err(LedgerError::MarketNotConfigured);
        }
        self.update_market()?;
        self.account(&request.payer)?;
        self.account(&request.receiver)?;
        let market = self.market.as_ref().ok_or(LedgerError::MarketNotConfigured)?;

        let malformed = |reason: &str| LedgerError::MalformedRequest {
            reason: reason.to_string(),
        };
        if request.days != market.rent_days {
            return Err(malformed("days doesn't match configuration"));
        }
        for frac in [request.net_frac, request.cpu_frac] {
            if !(0..=FRAC_SCALE).contains(&frac) {
                return Err(malformed("fraction is out of range"));
            }
        }
        if request.net_frac == 0 && request.cpu_frac == 0 {
            return Err(malformed("nothing to rent"));
        }
        if !request.max_payment.is_compatible(&market.min_rent_fee)
            || request.max_payment.amount() <= 0
        {
            return Err(malformed("max_payment doesn't match core symbol"));
        }

        let amounts = [
            (Resource::Net, apply_frac(request.net_frac, market.net.weight)),
            (Resource::Cpu, apply_frac(request.cpu_frac, market.cpu.weight)),
        ];
        let receiver_limits = self.account(&request.receiver)?.limits;
        for (resource, amount) in amounts {
            let state = market.resource(resource);
            let available = state.weight - state.utilization;
            if amount > available {
                return Err(LedgerError::InsufficientCapacity {
                    resource,
                    requested: amount,
                    available,
                });
            }
            let held = match resource {
                Resource::Net => receiver_limits.net,
                Resource::Cpu => receiver_limits.cpu,
            };
            if held.checked_add(amount).is_none()
                || state.adjusted_utilization.checked_add(amount).is_none()
            {
                return Err(LedgerError::Internal {
                    reason: format!("{} lease of {} overflows ledger bookkeeping", resource, amount),
                });
            }
        }
        let expires = Duration::try_days(i64::from(request.days))
            .and_then(|term| self.now.checked_add_signed(term))
            .ok_or_else(|| LedgerError::Internal {
                reason: format!("lease of {} days has no representable expiry", request.days),
            })?;

        let quote = Self::quote(market, request, &amounts);
        let fee = quote.total.clone();
        if fee.amount() > request.max_payment.amount() {
            return Err(LedgerError::PriceCapExceeded {
                fee: fee.to_string(),
                max_payment: request.max_payment.to_string(),
            });
        }
        let payer_balance = self.account(&request.payer)?.liquid.clone();
        let remaining = payer_balance
            .checked_sub(&fee)
            .filter(|r| r.amount() >= 0)
            .ok_or_else(|| LedgerError::InsufficientBalance {
                account: request.payer.to_string(),
                needed: fee.to_string(),
                available: payer_balance.to_string(),
            })?;

        // Validation done; apply
        self.account_mut(&request.payer)?.liquid = remaining;
        self.fees_collected = Some(match self.fees_collected.take() {
            Some(total) => total.with_amount(total.amount().saturating_add(fee.amount())),
            None => fee.clone(),
        });

        let reserve = self.reserve.clone();
        for (resource, amount) in amounts {
            self.adjust_resource(&reserve, resource, -amount)?;
            self.adjust_resource(&request.receiver, resource, amount)?;
        }

        let market = self.market_mut()?;
        for ((resource, amount), share) in amounts.into_iter().zip([quote.net, quote.cpu]) {
            let state = match resource {
                Resource::Net => &mut market.net,
                Resource::Cpu => &mut market.cpu,
            };
            state.utilization = state.utilization.saturating_add(amount);
            state.adjusted_utilization = state.adjusted_utilization.saturating_add(amount);
            state.fee = state
                .fee
                .take()
                .map(|f| f.with_amount(f.amount().saturating_add(share)));
        }

        let position = self.queue.partition_point(|l| l.expires <= expires);
        self.queue.insert(
            position,
            Lease {
                receiver: request.receiver.clone(),
                net: amounts[0].1,
                cpu: amounts[1].1,
                expires,
            },
        );
        debug!(payer = %request.payer, receiver = %request.receiver, %fee, "lease rented");
        Ok(())
    }

    fn execute_queue(&mut self, invoker: &AccountName, max: u32) -> Result<(), LedgerError> {
        if self.market.is_none() {
            return Err(LedgerError::MarketNotConfigured);
        }
        if max == 0 {
            return Err(LedgerError::MalformedRequest {
                reason: "max must be positive".to_string(),
            });
        }
        self.update_market()?;

        let reserve = self.reserve.clone();
        let mut processed = 0;
        while processed < max {
            match self.queue.front() {
                Some(lease) if lease.expires <= self.now => {}
                _ => break,
            }
            let lease = match self.queue.pop_front() {
                Some(lease) => lease,
                None => break,
            };
            for (resource, amount) in [(Resource::Net, lease.net), (Resource::Cpu, lease.cpu)] {
                self.adjust_resource(&lease.receiver, resource, -amount)?;
                self.adjust_resource(&reserve, resource, amount)?;
                let market = self.market_mut()?;
                let state = match resource {
                    Resource::Net => &mut market.net,
                    Resource::Cpu => &mut market.cpu,
                };
                state.utilization = (state.utilization - amount).max(0);
            }
            processed += 1;
        }
        debug!(%invoker, processed, remaining = self.queue.len(), "lease queue executed");
        Ok(())
    }

    fn market_state(&self) -> Result<MarketState, LedgerError> {
        self.market.clone().ok_or(LedgerError::MarketNotConfigured)
    }

    fn account_limits(&self, account: &AccountName) -> Result<ResourceLimits, LedgerError> {
        Ok(self.account(account)?.limits)
    }

    fn balance(&self, account: &AccountName) -> Result<Asset, LedgerError> {
        Ok(self.account(account)?.liquid.clone())
    }
}
