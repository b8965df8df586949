//! Generators for replay logs
//!
//! The model schedule rents from a single self-paying account: three large
//! leases ten days apart, a long idle gap and a queue run, then six months of
//! small daily leases each followed by a queue run once they have expired.

use chrono::{Duration, NaiveDateTime};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use crate::config::{MarketConfigFile, ResourceConfigFile};
use crate::event::{Event, Operation, QueueRequest, RentRequest};
use crate::types::{AccountName, Asset, FRAC_SCALE};

/// Account used by the model schedule as both payer and receiver
pub const MODEL_ACCOUNT: &str = "aaaaaaaaaaaa";

/// Price of the whole market per resource under [`model_config`]
const MODEL_PRICE: i64 = 10_000_000_000;

/// Market configuration the model schedule is written against: each resource's
/// weight equals its assumed stake weight and leases cost exactly `frac * price`
pub fn model_config() -> MarketConfigFile {
    let resource = ResourceConfigFile {
        current_weight_ratio: Some(FRAC_SCALE / 2),
        target_weight_ratio: Some(FRAC_SCALE / 2),
        exponent: Some(1.0),
        min_price: Some(Asset::new(MODEL_PRICE, 4, "TST")),
        max_price: Some(Asset::new(MODEL_PRICE, 4, "TST")),
        ..MarketConfigFile::defaults().net
    };
    MarketConfigFile {
        net: resource.clone(),
        cpu: resource,
        ..MarketConfigFile::defaults()
    }
}

struct ScheduleWriter {
    events: Vec<Event>,
    now: NaiveDateTime,
    account: AccountName,
}

impl ScheduleWriter {
    fn push(&mut self, operation: Operation) {
        self.events.push(Event {
            line: self.events.len() + 2,
            timestamp: self.now,
            operation,
        });
    }

    fn rent(&mut self, net_percent: i64, cpu_percent: i64, max_payment: Asset) {
        self.push(Operation::Rent(RentRequest {
            payer: self.account.clone(),
            receiver: self.account.clone(),
            days: 30,
            net_frac: FRAC_SCALE / 100 * net_percent,
            cpu_frac: FRAC_SCALE / 100 * cpu_percent,
            max_payment,
        }));
    }

    fn execute_queue(&mut self, max: u32) {
        self.push(Operation::ExecuteQueue(QueueRequest {
            payer: self.account.clone(),
            receiver: self.account.clone(),
            max,
        }));
    }

    fn wait(&mut self, duration: Duration) {
        self.now += duration;
    }
}

/// The model-test schedule starting at `start`, line numbers as written by
/// [`write_log`](crate::event::write_log)
pub fn model_schedule(start: NaiveDateTime) -> Vec<Event> {
    let mut writer = ScheduleWriter {
        events: Vec::new(),
        now: start,
        account: AccountName::from_canonical(MODEL_ACCOUNT),
    };

    for _ in 0..3 {
        writer.rent(10, 20, Asset::new(3_000_000_000, 4, "TST"));
        writer.wait(Duration::days(10));
    }
    writer.wait(Duration::days(60));
    writer.execute_queue(10);

    for _ in 0..6 {
        for _ in 1..15 {
            writer.rent(2, 2, Asset::new(400_000_000, 4, "TST"));
            writer.wait(Duration::days(1));
        }
        writer.wait(Duration::days(30));
        writer.execute_queue(100);
    }

    writer.events
}

/// Push each timestamp forward by up to `max_jitter_secs`, never reordering events
pub fn jittered(events: &[Event], seed: u64, max_jitter_secs: u32) -> Vec<Event> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut previous: Option<NaiveDateTime> = None;

    events
        .iter()
        .map(|event| {
            let jitter = Duration::seconds(i64::from(rng.gen_range(0..=max_jitter_secs)));
            let mut timestamp = event.timestamp + jitter;
            if let Some(previous) = previous {
                timestamp = timestamp.max(previous);
            }
            previous = Some(timestamp);
            Event {
                timestamp,
                ..event.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationKind;
    use chrono::NaiveDate;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_model_schedule_shape() {
        let events = model_schedule(start());
        assert_eq!(events.len(), 3 + 1 + 6 * (14 + 1));

        let queue_runs: Vec<_> = events
            .iter()
            .filter(|e| e.operation.kind() == OperationKind::ExecuteQueue)
            .collect();
        assert_eq!(queue_runs.len(), 7);
        assert_eq!(queue_runs[0].timestamp, start() + Duration::days(90));
        assert_eq!(events[4].timestamp, queue_runs[0].timestamp);
        assert_eq!(events[0].line, 2);
    }

    #[test]
    fn test_model_schedule_rents_are_affordable() {
        let total: i64 = model_schedule(start())
            .iter()
            .filter_map(|e| match &e.operation {
                Operation::Rent(r) => Some(r.max_payment.amount()),
                _ => None,
            })
            .sum();
        assert!(total < Asset::new(50_000_000_000, 4, "TST").amount());
    }

    #[test]
    fn test_jitter_is_seeded_and_ordered() {
        let events = model_schedule(start());
        let a = jittered(&events, 7, 3_600);
        let b = jittered(&events, 7, 3_600);
        assert_eq!(a, b);
        assert_ne!(a, jittered(&events, 8, 3_600));
        assert!(a.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(a
            .iter()
            .zip(&events)
            .all(|(j, e)| j.timestamp >= e.timestamp));
    }

    #[test]
    fn test_model_config_weight_matches_stake() {
        let config = model_config();
        assert_eq!(config.net.current_weight_ratio, Some(FRAC_SCALE / 2));
        assert_eq!(config.cpu.min_price, config.cpu.max_price);
        assert_eq!(config.rent_days, Some(30));
    }
}
