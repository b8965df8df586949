//! Mapping replay-log wall-clock timestamps onto the ledger clock
//!
//! The ledger clock only moves when blocks are produced. The first event of a
//! session pins a fixed offset between log time and ledger time; every later
//! event targets `timestamp + offset`, and the synchronizer skips the ledger
//! forward so the operation lands in the block that follows that instant.

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use tracing::{debug, warn};
use crate::error::{HarnessError, TimeError};
use crate::traits::LedgerClock;
use crate::types::OperationKind;

/// Default distance kept between a skip and its target instant
pub const GUARD_BAND_MS: i64 = 500;

/// Session-wide simulated-time state
///
/// `offset` is set once, on the first synchronized event, and never changes
/// afterwards. `position` only moves forward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeCursor {
    offset: Option<Duration>,
    position: Option<DateTime<Utc>>,
}

impl TimeCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger time minus log time, once anchored
    pub fn offset(&self) -> Option<Duration> {
        self.offset
    }

    /// Current simulated instant
    pub fn position(&self) -> Option<DateTime<Utc>> {
        self.position
    }

    pub fn is_anchored(&self) -> bool {
        self.offset.is_some()
    }

    fn anchor(&mut self, offset: Duration, now: DateTime<Utc>) {
        debug_assert!(self.offset.is_none(), "time cursor anchored twice");
        self.offset = Some(offset);
        self.position = Some(now);
    }

    fn move_to(&mut self, target: DateTime<Utc>) {
        match self.position {
            Some(position) if target < position => {
                warn!(
                    %target,
                    %position,
                    "log timestamp moves backwards, holding simulated time"
                );
            }
            _ => self.position = Some(target),
        }
    }
}

/// What the synchronizer did to the ledger clock for one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// First event: offset pinned, no clock movement
    Anchored,
    /// Clock skipped by `skip`, then one block produced
    Advanced { skip: Duration },
    /// Target already reached; one empty block produced so a rent starts a fresh block
    ForcedBlock,
    /// Target already reached; operation shares the current block
    Coalesced,
}

/// Converts log timestamps to ledger clock advances
#[derive(Debug, Clone)]
pub struct TimeSynchronizer<Tz: TimeZone = Local> {
    zone: Tz,
    guard_band: Duration,
}

impl TimeSynchronizer<Local> {
    /// Interpret log timestamps in the host's local timezone
    pub fn local() -> Self {
        Self::new(Local)
    }
}

impl Default for TimeSynchronizer<Local> {
    fn default() -> Self {
        Self::local()
    }
}

impl<Tz: TimeZone> TimeSynchronizer<Tz> {
    pub fn new(zone: Tz) -> Self {
        Self {
            zone,
            guard_band: Duration::milliseconds(GUARD_BAND_MS),
        }
    }

    pub fn with_guard_band(mut self, guard_band: Duration) -> Self {
        self.guard_band = guard_band;
        self
    }

    pub fn guard_band(&self) -> Duration {
        self.guard_band
    }

    /// Convert a local wall-clock time to UTC using the offset in force on that date.
    ///
    /// Ambiguous times (the repeated hour when clocks go back) resolve to the
    /// earlier instant; times skipped by a forward transition are rejected.
    pub fn to_utc(&self, local: &NaiveDateTime) -> Result<DateTime<Utc>, TimeError> {
        self.zone
            .from_local_datetime(local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| TimeError::NonexistentLocalTime {
                local: local.to_string(),
            })
    }

    /// Bring the ledger clock up to the simulated instant of `timestamp`
    pub fn sync<C>(
        &self,
        cursor: &mut TimeCursor,
        clock: &mut C,
        timestamp: &NaiveDateTime,
        kind: OperationKind,
    ) -> Result<SyncOutcome, HarnessError>
    where
        C: LedgerClock + ?Sized,
    {
        let event_time = self.to_utc(timestamp)?;

        let (offset, position) = match (cursor.offset(), cursor.position()) {
            (Some(offset), Some(position)) => (offset, position),
            _ => {
                let now = clock.now();
                let offset = now - event_time;
                cursor.anchor(offset, now);
                debug!(%now, offset_secs = offset.num_seconds(), "anchored simulated time");
                return Ok(SyncOutcome::Anchored);
            }
        };

        let target = event_time + offset;
        let delta = target - position;

        let outcome = if delta > self.guard_band {
            let skip = delta - self.guard_band;
            clock.advance_clock(skip)?;
            SyncOutcome::Advanced { skip }
        } else if kind == OperationKind::Rent {
            clock.advance_clock(Duration::zero())?;
            SyncOutcome::ForcedBlock
        } else {
            SyncOutcome::Coalesced
        };

        debug!(
            %target,
            delta_ms = delta.num_milliseconds(),
            operation = %kind,
            ?outcome,
            "synchronized ledger clock"
        );
        cursor.move_to(target);
        Ok(outcome)
    }
}
