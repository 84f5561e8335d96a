//! Daily expiration ceiling shared by every tier of a chain.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};
use color_eyre::{eyre::eyre, Result};

use crate::error::CacheError;

/// Computes the latest expiration any tier may claim at a given instant.
///
/// The ceiling is the next occurrence of a wall-clock cutoff (e.g. 05:00) in a
/// fixed timezone: today's cutoff while it is still ahead, tomorrow's otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationPolicy {
  cutoff: NaiveTime,
  offset: FixedOffset,
}

impl ExpirationPolicy {
  pub fn new(hour: u32, minute: u32, offset: FixedOffset) -> Result<Self> {
    let cutoff = NaiveTime::from_hms_opt(hour, minute, 0)
      .ok_or_else(|| eyre!("Invalid expiration cutoff {:02}:{:02}", hour, minute))?;
    Ok(Self { cutoff, offset })
  }

  pub fn cutoff(&self) -> NaiveTime {
    self.cutoff
  }

  pub fn offset(&self) -> FixedOffset {
    self.offset
  }

  /// Next cutoff strictly after `now`.
  pub fn ceiling(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&self.offset).naive_local();
    let today = local.date().and_time(self.cutoff);
    let next = if local < today {
      today
    } else {
      today + Duration::days(1)
    };
    // FixedOffset has no gaps or folds, so shifting by the offset is exact.
    next.and_utc() - Duration::seconds(i64::from(self.offset.local_minus_utc()))
  }

  pub fn ceiling_now(&self) -> DateTime<Utc> {
    self.ceiling(Utc::now())
  }

  pub fn clamp(date: DateTime<Utc>, max: DateTime<Utc>) -> DateTime<Utc> {
    date.min(max)
  }

  /// Fail if `date` lies beyond the ceiling at `now`.
  pub fn assert_valid(&self, date: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    let ceiling = self.ceiling(now);
    if date > ceiling {
      return Err(
        CacheError::ExpirationBeyondCeiling {
          expiration: date,
          ceiling,
        }
        .into(),
      );
    }
    Ok(())
  }
}
