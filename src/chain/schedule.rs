// src/chain/schedule.rs

//! Cadence arithmetic: which reference times are due at a given instant.
//!
//! Reference times lie on a grid `epoch + offset + k * cadence` (UTC). A
//! reference time `r` is due once `now >= r + lead_time`. Pure and
//! deterministic; the scheduler feeds it `now`.

use chrono::{DateTime, Datelike, TimeDelta, Utc, Weekday};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    cadence: TimeDelta,
    lead_time: TimeDelta,
    offset: TimeDelta,
    catch_up: u32,
    weekdays: Vec<Weekday>,
    not_before: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Build a schedule. `cadence` must be positive.
    pub fn new(cadence: TimeDelta, lead_time: TimeDelta) -> Result<Self, String> {
        if cadence <= TimeDelta::zero() {
            return Err("cadence must be greater than zero".to_string());
        }
        if lead_time < TimeDelta::zero() {
            return Err("lead_time must not be negative".to_string());
        }
        Ok(Self {
            cadence,
            lead_time,
            offset: TimeDelta::zero(),
            catch_up: 0,
            weekdays: Vec::new(),
            not_before: None,
        })
    }

    pub fn with_offset(mut self, offset: TimeDelta) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_catch_up(mut self, catch_up: u32) -> Self {
        self.catch_up = catch_up;
        self
    }

    pub fn with_weekdays(mut self, weekdays: Vec<Weekday>) -> Self {
        self.weekdays = weekdays;
        self
    }

    pub fn with_not_before(mut self, not_before: Option<DateTime<Utc>>) -> Self {
        self.not_before = not_before;
        self
    }

    pub fn cadence(&self) -> TimeDelta {
        self.cadence
    }

    pub fn lead_time(&self) -> TimeDelta {
        self.lead_time
    }

    pub fn catch_up(&self) -> u32 {
        self.catch_up
    }

    pub fn weekdays(&self) -> &[Weekday] {
        &self.weekdays
    }

    /// How far back the scheduler may reach: the oldest window it would ever
    /// create is `lead_time + catch_up * cadence` plus one cadence old.
    /// `None` when that does not fit in a `TimeDelta`.
    pub fn lookback(&self) -> Option<TimeDelta> {
        let windows = i32::try_from(self.catch_up).ok()?.checked_add(1)?;
        self.cadence
            .checked_mul(windows)?
            .checked_add(&self.lead_time)
    }

    /// The most recent grid point that is due at `now`.
    pub fn latest_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let shifted = now
            .checked_sub_signed(self.lead_time)?
            .checked_sub_signed(self.offset)?;
        let step = self.cadence.num_milliseconds();
        let slot = shifted.timestamp_millis().div_euclid(step);
        let base = DateTime::<Utc>::from_timestamp_millis(slot.checked_mul(step)?)?;
        base.checked_add_signed(self.offset)
    }

    /// Due reference times at `now`, newest first.
    ///
    /// Considers the latest due window plus `catch_up` earlier ones, skips
    /// windows on excluded weekdays, and never returns anything before
    /// `not_before` or `earliest`.
    pub fn due_reference_times(
        &self,
        now: DateTime<Utc>,
        earliest: Option<DateTime<Utc>>,
    ) -> Vec<DateTime<Utc>> {
        let Some(latest) = self.latest_due(now) else {
            return Vec::new();
        };

        let floor = match (self.not_before, earliest) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let mut due = Vec::new();
        for i in 0..=self.catch_up {
            let Some(reference) = i32::try_from(i)
                .ok()
                .and_then(|i| self.cadence.checked_mul(i))
                .and_then(|back| latest.checked_sub_signed(back))
            else {
                break;
            };
            if floor.is_some_and(|f| reference < f) {
                break;
            }
            if !self.weekdays.is_empty() && !self.weekdays.contains(&reference.weekday()) {
                continue;
            }
            due.push(reference);
        }
        due
    }
}
