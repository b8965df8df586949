//! Session lifecycle tests
//!
//! These tests verify:
//! - Config loading falls back to defaults when the file is missing
//! - Malformed config handling under both policies
//! - The telemetry file carries one header and one line per recorded row
//! - Output is flushed even when a replay fails part way

use bwlease::config::{ConfigLoader, ConfigSource, MalformedPolicy, MarketConfigFile};
use bwlease::event::{write_log, EventLog};
use bwlease::scenario;
use bwlease::telemetry::header;
use bwlease::{
    ConfigError, HarnessError, Ledger, LedgerClock, ResourceLimits, Session, SimLedger,
    Strictness, TelemetryError,
};
use chrono::{Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::fs;
use std::io::Write;
use tempfile::TempDir;

fn create_ledger() -> SimLedger {
    let genesis = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let mut ledger = SimLedger::new(genesis, "eosio.reserv".parse().unwrap());
    ledger.create_account(
        scenario::MODEL_ACCOUNT.parse().unwrap(),
        ResourceLimits::default(),
        "5000000.0000 TST".parse().unwrap(),
    );
    ledger
}

fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2021, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn write_model_log(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("model.csv");
    let mut file = fs::File::create(&path).unwrap();
    write_log(&mut file, &scenario::model_schedule(start())).unwrap();
    file.flush().unwrap();
    path
}

#[test]
fn test_missing_config_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let loaded = ConfigLoader::new()
        .load(dir.path().join("absent.json"))
        .unwrap();

    assert!(loaded.is_default());
    assert_eq!(loaded.file, MarketConfigFile::defaults());

    let session = Session::open_session_in(Utc, create_ledger(), &loaded.file, None).unwrap();
    let market = session.ledger().market_state().unwrap();
    assert_eq!(market.cpu.decay_secs, 86_400);
    assert_eq!(market.min_rent_fee.to_string(), "1.0000 TST");
}

#[test]
fn test_malformed_config_policies() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("market.json");
    fs::write(&path, "{ \"net\": { \"exponent\": \"two\" } ").unwrap();

    let err = ConfigLoader::new().load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Malformed { .. }));

    let loaded = ConfigLoader::with_policy(MalformedPolicy::UseDefaults)
        .load(&path)
        .unwrap();
    assert!(matches!(loaded.source, ConfigSource::Defaults { .. }));
    assert_eq!(loaded.file, MarketConfigFile::defaults());
}

#[test]
fn test_out_of_range_target_offset_never_reaches_the_ledger() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("market.json");
    fs::write(&path, r#"{ "net": { "target_timestamp": 9223372036854775807 } }"#).unwrap();

    assert!(matches!(
        ConfigLoader::new().load(&path),
        Err(ConfigError::InvalidValue { .. })
    ));
    let loaded = ConfigLoader::with_policy(MalformedPolicy::UseDefaults)
        .load(&path)
        .unwrap();
    assert!(loaded.is_default());

    let mut file = MarketConfigFile::defaults();
    file.cpu.target_timestamp = Some(i64::MAX);
    let err = Session::open_session_in(Utc, create_ledger(), &file, None).unwrap_err();
    assert!(matches!(err, HarnessError::Config(ConfigError::InvalidValue { .. })));
}

#[test]
fn test_config_file_round_trip_through_loader() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("market.json");
    let mut config = scenario::model_config();
    config.harness.strictness = Strictness::Strict;
    fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let loaded = ConfigLoader::new().load(&path).unwrap();
    assert_eq!(loaded.source, ConfigSource::File(path));
    assert_eq!(loaded.file, config);
}

#[test]
fn test_telemetry_file_lifecycle() {
    let dir = TempDir::new().unwrap();
    let events = write_model_log(&dir);
    let output = dir.path().join("telemetry.csv");

    let mut session =
        Session::open_session_in(Utc, create_ledger(), &scenario::model_config(), Some(&output))
            .unwrap();
    let header_only = fs::read_to_string(&output).unwrap();
    assert_eq!(header_only.lines().count(), 1);

    let report = session.replay(EventLog::open(&events).unwrap()).unwrap();
    assert_eq!(session.sink().len(), report.recorded);
    assert!(session.sink().rows().is_empty());
    assert!(matches!(
        session.close_session(),
        Err(HarnessError::Telemetry(TelemetryError::Closed))
    ));

    let written = fs::read_to_string(&output).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 1 + report.recorded);
    assert_eq!(lines[0], header().join(","));
    assert!(lines[1..].iter().all(|l| l.split(',').count() == header().len()));
    assert!(lines[1].ends_with(",rent"));
}

#[test]
fn test_output_is_flushed_when_replay_fails() {
    let dir = TempDir::new().unwrap();
    let events = dir.path().join("broken.csv");
    fs::write(
        &events,
        "datetime,function,payer,receiver,days,net_frac,cpu_frac,max_payment,queue_max\n\
         01/01/2021 00:00:00,rent,aaaaaaaaaaaa,aaaaaaaaaaaa,30,100000000000000,0,100000.0000 TST,\n\
         01/02/2021 00:00:00,rent,aaaaaaaaaaaa,aaaaaaaaaaaa,30,not-a-number,0,100000.0000 TST,\n",
    )
    .unwrap();
    let output = dir.path().join("telemetry.csv");

    let mut session =
        Session::open_session_in(Utc, create_ledger(), &scenario::model_config(), Some(&output))
            .unwrap();
    let err = session.replay(EventLog::open(&events).unwrap()).unwrap_err();

    assert!(matches!(err, HarnessError::Parse(_)));
    assert!(session.sink().is_closed());
    let written = fs::read_to_string(&output).unwrap();
    assert_eq!(written.lines().count(), 2);
}

#[test]
fn test_market_is_configured_at_session_start() {
    let mut ledger = create_ledger();
    ledger.advance_clock(Duration::days(5)).unwrap();
    let opened_at = ledger.now();

    let session =
        Session::open_session_in(Utc, ledger, &MarketConfigFile::defaults(), None).unwrap();
    let market = session.ledger().market_state().unwrap();

    assert_eq!(market.net.initial_timestamp, opened_at);
    assert_eq!(market.net.target_timestamp, opened_at + Duration::days(100));
}
