use bwlease::event::LogRow;
use bwlease::scenario::{self, MODEL_ACCOUNT};
use bwlease::{
    HarnessError, LedgerClock, OperationKind, ParseError, ResourceLimits, Session, SimLedger,
    SyncOutcome, TimeCursor, TimeError, TimeSynchronizer,
};
use chrono::{Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use proptest::prelude::*;

fn create_ledger() -> SimLedger {
    let genesis = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let mut ledger = SimLedger::new(genesis, "eosio.reserv".parse().unwrap());
    ledger.create_account("alice".parse().unwrap(), ResourceLimits::default(), "1.0000 TST".parse().unwrap());
    ledger
}

fn log_start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2021, 3, 1)
        .unwrap()
        .and_hms_opt(9, 30, 0)
        .unwrap()
}

// Helper to create arbitrary operation kinds
fn arbitrary_kind() -> impl Strategy<Value = OperationKind> {
    prop_oneof![Just(OperationKind::Rent), Just(OperationKind::ExecuteQueue)]
}

// Helper to create arbitrary steps between consecutive log timestamps, in seconds;
// negative steps model out-of-order rows
fn arbitrary_steps() -> impl Strategy<Value = Vec<(i64, OperationKind)>> {
    prop::collection::vec((-3_600i64..5 * 86_400, arbitrary_kind()), 1..40)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// The offset pinned by the first event never changes for the rest of the session.
    #[test]
    fn property_offset_is_set_once(steps in arbitrary_steps()) {
        let sync = TimeSynchronizer::new(Utc);
        let mut cursor = TimeCursor::new();
        let mut ledger = create_ledger();
        let mut timestamp = log_start();

        let first = sync.sync(&mut cursor, &mut ledger, &timestamp, OperationKind::Rent).unwrap();
        prop_assert_eq!(first, SyncOutcome::Anchored);
        let offset = cursor.offset();
        prop_assert!(offset.is_some());

        for (step, kind) in steps {
            timestamp += Duration::seconds(step);
            let outcome = sync.sync(&mut cursor, &mut ledger, &timestamp, kind).unwrap();
            prop_assert_ne!(outcome, SyncOutcome::Anchored);
            prop_assert_eq!(cursor.offset(), offset);
        }
    }

    /// Neither the simulated cursor nor the ledger clock ever moves backwards,
    /// and every rent after the first lands in a fresh block.
    #[test]
    fn property_time_is_monotonic(steps in arbitrary_steps()) {
        let sync = TimeSynchronizer::new(Utc);
        let mut cursor = TimeCursor::new();
        let mut ledger = create_ledger();
        let mut timestamp = log_start();

        sync.sync(&mut cursor, &mut ledger, &timestamp, OperationKind::Rent).unwrap();
        for (step, kind) in steps {
            let position = cursor.position();
            let now = ledger.now();
            timestamp += Duration::seconds(step);

            sync.sync(&mut cursor, &mut ledger, &timestamp, kind).unwrap();

            prop_assert!(cursor.position() >= position);
            prop_assert!(ledger.now() >= now);
            if kind == OperationKind::Rent {
                prop_assert!(ledger.now() > now);
            }
        }
    }

    /// Forward gaps larger than the guard band land the ledger clock exactly
    /// on the simulated target when the clock started on the cursor.
    #[test]
    fn property_forward_gap_lands_on_target(gaps in prop::collection::vec(1i64..30 * 86_400, 1..20)) {
        let sync = TimeSynchronizer::new(Utc);
        let mut cursor = TimeCursor::new();
        let mut ledger = create_ledger();
        let mut timestamp = log_start();

        sync.sync(&mut cursor, &mut ledger, &timestamp, OperationKind::ExecuteQueue).unwrap();
        for gap in gaps {
            timestamp += Duration::seconds(gap);
            let outcome = sync.sync(&mut cursor, &mut ledger, &timestamp, OperationKind::ExecuteQueue).unwrap();
            prop_assert!(
                matches!(outcome, SyncOutcome::Advanced { .. }),
                "one second gap must still skip: {:?}", outcome
            );
            prop_assert_eq!(Some(ledger.now()), cursor.position());
        }
    }
}

#[test]
fn test_log_and_ledger_time_share_offset() {
    let sync = TimeSynchronizer::new(Utc);
    let mut cursor = TimeCursor::new();
    let mut ledger = create_ledger();
    let genesis = ledger.now();

    sync.sync(&mut cursor, &mut ledger, &log_start(), OperationKind::Rent)
        .unwrap();
    sync.sync(
        &mut cursor,
        &mut ledger,
        &(log_start() + Duration::days(3)),
        OperationKind::Rent,
    )
    .unwrap();

    assert_eq!(ledger.now(), genesis + Duration::days(3));
    assert_eq!(
        cursor.offset(),
        Some(genesis - Utc.from_utc_datetime(&log_start()))
    );
}

/// US-Eastern rules for 2021 only: clocks go forward at 02:00 on March 14
/// and back at 02:00 on November 7
#[derive(Debug, Clone, Copy)]
struct Eastern2021;

fn standard() -> FixedOffset {
    FixedOffset::west_opt(5 * 3600).unwrap()
}

fn daylight() -> FixedOffset {
    FixedOffset::west_opt(4 * 3600).unwrap()
}

fn at(month: u32, day: u32, hour: u32, min: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2021, month, day)
        .unwrap()
        .and_hms_opt(hour, min, 0)
        .unwrap()
}

impl Eastern2021 {
    fn offset_at(utc: &NaiveDateTime) -> FixedOffset {
        if *utc >= at(3, 14, 7, 0) && *utc < at(11, 7, 6, 0) {
            daylight()
        } else {
            standard()
        }
    }
}

impl TimeZone for Eastern2021 {
    type Offset = FixedOffset;

    fn from_offset(_offset: &FixedOffset) -> Self {
        Eastern2021
    }

    fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
        self.offset_from_local_datetime(&local.and_hms_opt(12, 0, 0).unwrap())
    }

    fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
        let fits = |offset: FixedOffset| {
            let utc = *local - Duration::seconds(i64::from(offset.local_minus_utc()));
            Self::offset_at(&utc) == offset
        };
        match (fits(daylight()), fits(standard())) {
            (true, true) => LocalResult::Ambiguous(daylight(), standard()),
            (true, false) => LocalResult::Single(daylight()),
            (false, true) => LocalResult::Single(standard()),
            (false, false) => LocalResult::None,
        }
    }

    fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
        Self::offset_at(&utc.and_hms_opt(0, 0, 0).unwrap())
    }

    fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
        Self::offset_at(utc)
    }
}

#[test]
fn test_offset_follows_the_event_date() {
    let sync = TimeSynchronizer::new(Eastern2021);

    assert_eq!(sync.to_utc(&at(3, 13, 12, 0)).unwrap(), Utc.from_utc_datetime(&at(3, 13, 17, 0)));
    assert_eq!(sync.to_utc(&at(3, 14, 12, 0)).unwrap(), Utc.from_utc_datetime(&at(3, 14, 16, 0)));
}

#[test]
fn test_log_crossing_a_transition_advances_by_real_elapsed_time() {
    let sync = TimeSynchronizer::new(Eastern2021);
    let mut cursor = TimeCursor::new();
    let mut ledger = create_ledger();
    let genesis = ledger.now();

    sync.sync(&mut cursor, &mut ledger, &at(3, 13, 12, 0), OperationKind::ExecuteQueue)
        .unwrap();
    let outcome = sync
        .sync(&mut cursor, &mut ledger, &at(3, 14, 12, 0), OperationKind::ExecuteQueue)
        .unwrap();

    assert!(matches!(outcome, SyncOutcome::Advanced { .. }));
    assert_eq!(ledger.now(), genesis + Duration::hours(23));
}

#[test]
fn test_repeated_hour_resolves_to_earlier_instant() {
    let sync = TimeSynchronizer::new(Eastern2021);

    let resolved = sync.to_utc(&at(11, 7, 1, 30)).unwrap();
    assert_eq!(resolved, Utc.from_utc_datetime(&at(11, 7, 5, 30)));
}

#[test]
fn test_skipped_hour_is_rejected() {
    let sync = TimeSynchronizer::new(Eastern2021);
    let mut cursor = TimeCursor::new();
    let mut ledger = create_ledger();

    assert!(matches!(
        sync.to_utc(&at(3, 14, 2, 30)),
        Err(TimeError::NonexistentLocalTime { .. })
    ));
    let err = sync
        .sync(&mut cursor, &mut ledger, &at(3, 14, 2, 30), OperationKind::Rent)
        .unwrap_err();
    assert!(matches!(err, HarnessError::Time(TimeError::NonexistentLocalTime { .. })));
    assert!(!cursor.is_anchored());
}

#[test]
fn test_session_stops_on_skipped_local_time() {
    let mut ledger = create_ledger();
    ledger.create_account(
        MODEL_ACCOUNT.parse().unwrap(),
        ResourceLimits::default(),
        "5000000.0000 TST".parse().unwrap(),
    );
    let mut session =
        Session::open_session_in(Eastern2021, ledger, &scenario::model_config(), None).unwrap();
    let rent = |line: usize, when: &str| -> Result<LogRow, ParseError> {
        Ok(LogRow::parse_line(
            line,
            &format!(
                "{},rent,{acct},{acct},30,100000000000000,0,1000000.0000 TST,",
                when,
                acct = MODEL_ACCOUNT
            ),
        ))
    };

    let err = session
        .replay(vec![
            rent(2, "03/13/2021 12:00:00"),
            rent(3, "03/14/2021 02:30:00"),
        ])
        .unwrap_err();

    assert!(matches!(err, HarnessError::Time(TimeError::NonexistentLocalTime { .. })));
    assert_eq!(session.sink().len(), 1);
    assert!(session.sink().is_closed());
}
