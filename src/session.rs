//! Replay session lifecycle
//!
//! `open_session` configures the market and opens the telemetry output,
//! `run` replays rows, and `close_session` flushes. [`Session::replay`] runs
//! and closes in one call, closing the output even when the run fails.

use chrono::{Local, TimeZone};
use std::path::Path;
use tracing::info;
use crate::config::{HarnessSettings, MarketConfigFile};
use crate::error::{ConfigError, HarnessError, ParseError};
use crate::event::LogRow;
use crate::replay_driver::{ReplayDriver, ReplayDriverBuilder, ReplayReport};
use crate::telemetry::TelemetrySink;
use crate::time_sync::{TimeCursor, TimeSynchronizer};
use crate::traits::Ledger;

/// One replay of one log against one ledger
#[derive(Debug)]
pub struct Session<L: Ledger, Tz: TimeZone = Local> {
    ledger: L,
    driver: ReplayDriver<Tz>,
    cursor: TimeCursor,
    sink: TelemetrySink,
    settings: HarnessSettings,
}

impl<L: Ledger> Session<L, Local> {
    /// Open a session that reads log timestamps in the host timezone
    pub fn open_session(
        ledger: L,
        config: &MarketConfigFile,
        output: Option<&Path>,
    ) -> Result<Self, HarnessError> {
        Self::open_session_in(Local, ledger, config, output)
    }
}

impl<L: Ledger, Tz: TimeZone> Session<L, Tz> {
    /// Configure the market at the ledger's current time and open the output.
    ///
    /// Without an output path rows are kept in memory only.
    pub fn open_session_in(
        zone: Tz,
        mut ledger: L,
        config: &MarketConfigFile,
        output: Option<&Path>,
    ) -> Result<Self, HarnessError> {
        let start = ledger.now();
        ledger.configure_market(&config.resolve(start)?)?;

        let settings = config.harness.clone();
        let driver = ReplayDriverBuilder::new(TimeSynchronizer::new(zone))
            .with_settings(&settings)
            .build()
            .map_err(|reason| ConfigError::InvalidValue {
                field: "harness".to_string(),
                reason,
            })?;
        let sink = match output {
            Some(path) => TelemetrySink::open_session(path)?,
            None => TelemetrySink::in_memory(),
        };

        info!(
            %start,
            strictness = ?settings.strictness,
            reserve = %settings.reserve_account,
            "session opened"
        );
        Ok(Self {
            ledger,
            driver,
            cursor: TimeCursor::new(),
            sink,
            settings,
        })
    }

    /// Replay rows; the session stays open afterwards
    pub fn run<I>(&mut self, rows: I) -> Result<ReplayReport, HarnessError>
    where
        I: IntoIterator<Item = Result<LogRow, ParseError>>,
    {
        self.driver
            .run(&mut self.ledger, &mut self.cursor, &mut self.sink, rows)
    }

    /// Flush the telemetry output; returns the number of rows recorded
    pub fn close_session(&mut self) -> Result<usize, HarnessError> {
        let rows = self.sink.close_session()?;
        info!(rows, "session closed");
        Ok(rows)
    }

    /// Run to the end of `rows`, then close. The output is closed on every exit path;
    /// a replay error takes precedence over a close error.
    pub fn replay<I>(&mut self, rows: I) -> Result<ReplayReport, HarnessError>
    where
        I: IntoIterator<Item = Result<LogRow, ParseError>>,
    {
        let outcome = self.run(rows);
        let closed = self.close_session();
        let report = outcome?;
        closed?;
        Ok(report)
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    pub fn cursor(&self) -> &TimeCursor {
        &self.cursor
    }

    pub fn sink(&self) -> &TelemetrySink {
        &self.sink
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    pub fn into_ledger(self) -> L {
        self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_ledger::SimLedger;
    use crate::traits::LedgerClock;
    use chrono::{Duration, TimeZone, Utc};

    fn ledger() -> SimLedger {
        let genesis = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        SimLedger::new(genesis, "eosio.reserv".parse().unwrap())
    }

    #[test]
    fn test_open_configures_market() {
        let session =
            Session::open_session_in(Utc, ledger(), &MarketConfigFile::defaults(), None).unwrap();
        let market = session.ledger().market_state().unwrap();
        assert_eq!(market.rent_days, 30);
        assert_eq!(
            market.net.target_timestamp,
            session.ledger().now() + Duration::days(100)
        );
        assert!(!session.cursor().is_anchored());
    }

    #[test]
    fn test_invalid_market_config_is_fatal() {
        let mut config = MarketConfigFile::defaults();
        config.net.exponent = Some(0.5);
        let err = Session::open_session_in(Utc, ledger(), &config, None).unwrap_err();
        assert!(matches!(err, HarnessError::Ledger(_)));
    }

    #[test]
    fn test_replay_closes_output() {
        let mut session =
            Session::open_session_in(Utc, ledger(), &MarketConfigFile::defaults(), None).unwrap();
        let report = session.replay(Vec::new()).unwrap();
        assert_eq!(report.rows_read, 0);
        assert!(session.sink().is_closed());
        assert!(session.close_session().is_err());
    }
}
