//! Event replay driver with builder pattern
//!
//! Rows are consumed strictly in log order. Unrecognized rows are skipped;
//! recognized rows are synchronized to simulated time and handed to the
//! invariant checker one at a time.

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};
use crate::checker::{CheckOutcome, InvariantChecker};
use crate::config::HarnessSettings;
use crate::error::{HarnessError, LedgerError, ParseError};
use crate::event::{AccountDirectory, LogRow};
use crate::telemetry::TelemetrySink;
use crate::time_sync::{TimeCursor, TimeSynchronizer};
use crate::traits::Ledger;
use crate::types::{PerformanceMetrics, StateHash};

/// Summary of one replay run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub rows_read: usize,
    /// Annotation rows with no recognized operation
    pub skipped: usize,
    /// Rows the ledger rejected
    pub aborted: usize,
    pub recorded: usize,
    /// Chain digest over every recorded row's after-state
    pub digest: StateHash,
    pub metrics: PerformanceMetrics,
}

/// What happened to a single row
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Skipped,
    Aborted(LedgerError),
    Recorded,
}

/// Drives a log through the time synchronizer and invariant checker
#[derive(Debug)]
pub struct ReplayDriver<Tz: TimeZone = Local> {
    synchronizer: TimeSynchronizer<Tz>,
    checker: InvariantChecker,
    directory: AccountDirectory,
}

impl<Tz: TimeZone> ReplayDriver<Tz> {
    pub fn new(
        synchronizer: TimeSynchronizer<Tz>,
        checker: InvariantChecker,
        directory: AccountDirectory,
    ) -> Self {
        Self {
            synchronizer,
            checker,
            directory,
        }
    }

    /// Replay one row against the ledger
    pub fn replay_row<L>(
        &mut self,
        ledger: &mut L,
        cursor: &mut TimeCursor,
        sink: &mut TelemetrySink,
        row: &LogRow,
    ) -> Result<RowOutcome, HarnessError>
    where
        L: Ledger + ?Sized,
    {
        let event = match row.to_event(&self.directory)? {
            Some(event) => event,
            None => {
                debug!(line = row.line, function = %row.function, "skipping unrecognized row");
                return Ok(RowOutcome::Skipped);
            }
        };

        self.synchronizer
            .sync(cursor, ledger, &event.timestamp, event.operation.kind())?;

        match self.checker.check(ledger, sink, event.line, &event.operation)? {
            CheckOutcome::Recorded(_) => Ok(RowOutcome::Recorded),
            CheckOutcome::Aborted { reason } => Ok(RowOutcome::Aborted(reason)),
        }
    }

    /// Replay every row until the source is exhausted
    pub fn run<L, I>(
        &mut self,
        ledger: &mut L,
        cursor: &mut TimeCursor,
        sink: &mut TelemetrySink,
        rows: I,
    ) -> Result<ReplayReport, HarnessError>
    where
        L: Ledger + ?Sized,
        I: IntoIterator<Item = Result<LogRow, ParseError>>,
    {
        let start_time = Instant::now();
        let (mut rows_read, mut skipped, mut aborted, mut recorded) = (0, 0, 0, 0);

        for row in rows {
            let row = row?;
            rows_read += 1;
            match self.replay_row(ledger, cursor, sink, &row)? {
                RowOutcome::Skipped => skipped += 1,
                RowOutcome::Aborted(_) => aborted += 1,
                RowOutcome::Recorded => recorded += 1,
            }
        }

        let duration_ms = start_time.elapsed().as_millis() as u64;
        let rows_per_second = if duration_ms > 0 {
            rows_read as f64 / (duration_ms as f64 / 1000.0)
        } else {
            0.0
        };

        let report = ReplayReport {
            rows_read,
            skipped,
            aborted,
            recorded,
            digest: self.checker.digest(),
            metrics: PerformanceMetrics {
                total_duration_ms: duration_ms,
                rows_per_second,
            },
        };
        info!(
            rows_read,
            skipped,
            aborted,
            recorded,
            digest = %report.digest,
            "replay finished"
        );
        Ok(report)
    }

    pub fn checker(&self) -> &InvariantChecker {
        &self.checker
    }

    pub fn directory(&self) -> &AccountDirectory {
        &self.directory
    }

    pub fn synchronizer(&self) -> &TimeSynchronizer<Tz> {
        &self.synchronizer
    }
}

/// Builder for constructing replay drivers with a fluent API
pub struct ReplayDriverBuilder<Tz: TimeZone = Local> {
    synchronizer: TimeSynchronizer<Tz>,
    checker: Option<InvariantChecker>,
    directory: AccountDirectory,
}

impl<Tz: TimeZone> ReplayDriverBuilder<Tz> {
    pub fn new(synchronizer: TimeSynchronizer<Tz>) -> Self {
        Self {
            synchronizer,
            checker: None,
            directory: AccountDirectory::default(),
        }
    }

    pub fn with_checker(mut self, checker: InvariantChecker) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Checker, alias table and guard band taken from harness settings
    pub fn with_settings(mut self, settings: &HarnessSettings) -> Self {
        self.checker = Some(InvariantChecker::from_settings(settings));
        self.directory = AccountDirectory::new(settings.aliases.clone());
        self.synchronizer = self
            .synchronizer
            .with_guard_band(chrono::Duration::milliseconds(settings.guard_band_ms));
        self
    }

    /// Build the replay driver
    pub fn build(self) -> Result<ReplayDriver<Tz>, String> {
        let checker = self.checker.ok_or("Invariant checker is required")?;
        Ok(ReplayDriver::new(self.synchronizer, checker, self.directory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarketConfig;
    use crate::sim_ledger::SimLedger;
    use crate::types::{AccountName, Asset, ResourceLimits, FRAC_SCALE};
    use chrono::{TimeZone, Utc};

    fn name(s: &str) -> AccountName {
        s.parse().unwrap()
    }

    fn ledger() -> SimLedger {
        let genesis = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let mut ledger = SimLedger::new(genesis, name("eosio.reserv"));
        for account in ["alice", "bob"] {
            ledger.create_account(
                name(account),
                ResourceLimits::default(),
                Asset::new(100_000_000_000, 4, "TST"),
            );
        }
        let config = MarketConfig::customized(genesis, |c| {
            for r in [&mut c.net, &mut c.cpu] {
                r.current_weight_ratio = Some(FRAC_SCALE / 2);
                r.target_weight_ratio = Some(FRAC_SCALE / 2);
            }
        });
        ledger.configure_market(&config).unwrap();
        ledger
    }

    fn driver() -> ReplayDriver<Utc> {
        ReplayDriverBuilder::new(TimeSynchronizer::new(Utc))
            .with_checker(InvariantChecker::new(name("eosio.reserv"), name("eosio")))
            .build()
            .unwrap()
    }

    fn rows(text: &str) -> Vec<Result<LogRow, ParseError>> {
        text.lines()
            .enumerate()
            .map(|(i, l)| Ok(LogRow::parse_line(i + 1, l)))
            .collect()
    }

    #[test]
    fn test_builder_requires_checker() {
        assert!(ReplayDriverBuilder::new(TimeSynchronizer::new(Utc)).build().is_err());
    }

    #[test]
    fn test_builder_takes_harness_settings() {
        let mut settings = HarnessSettings::default();
        settings.guard_band_ms = 2_000;
        settings.aliases.insert("Alice".to_string(), name("alice"));
        let mut driver = ReplayDriverBuilder::new(TimeSynchronizer::new(Utc))
            .with_settings(&settings)
            .build()
            .unwrap();
        assert_eq!(driver.synchronizer().guard_band(), chrono::Duration::seconds(2));

        let mut ledger = ledger();
        let mut cursor = TimeCursor::new();
        let mut sink = TelemetrySink::in_memory();
        let log = rows("01/02/2021 00:00:00,rent,Alice,bob,30,100000000000000,0,1000000.0000 TST,");

        let report = driver.run(&mut ledger, &mut cursor, &mut sink, log).unwrap();
        assert_eq!(report.recorded, 1);
        assert_eq!(sink.rows()[0].line, 1);
    }

    #[test]
    fn test_run_counts_row_outcomes() {
        let mut ledger = ledger();
        let mut cursor = TimeCursor::new();
        let mut sink = TelemetrySink::in_memory();
        let log = rows(
            "01/01/2021 00:00:00,note,alice,bob,,,,,\n\
             01/02/2021 00:00:00,rent,alice,bob,30,100000000000000,0,1000000.0000 TST,\n\
             01/03/2021 00:00:00,rent,alice,bob,30,100000000000000,0,0.0001 TST,\n\
             01/04/2021 00:00:00,execute-queue,alice,bob,,,,,10",
        );

        let report = driver().run(&mut ledger, &mut cursor, &mut sink, log).unwrap();

        assert_eq!(report.rows_read, 4);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.aborted, 1);
        assert_eq!(report.recorded, 2);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_parse_error_is_fatal() {
        let mut ledger = ledger();
        let mut cursor = TimeCursor::new();
        let mut sink = TelemetrySink::in_memory();
        let log = rows("01/02/2021 00:00:00,rent,alice,bob,thirty,1,0,1.0000 TST,");

        let err = driver().run(&mut ledger, &mut cursor, &mut sink, log).unwrap_err();
        assert!(matches!(err, HarnessError::Parse(_)));
        assert!(sink.is_empty());
    }
}
