use crate::domain::error::DomainError;
use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Calendar arithmetic in the user's configured timezone.
///
/// Every "same day" decision in the engine goes through this type so that
/// validation, the denormalized `date` column and the stored offsets agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCalendar {
    tz: Tz,
}

impl Default for LocalCalendar {
    fn default() -> Self {
        Self { tz: Tz::UTC }
    }
}

impl LocalCalendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn parse(name: &str) -> Result<Self, DomainError> {
        let name = name.trim();
        name.parse::<Tz>()
            .map(Self::new)
            .map_err(|_| DomainError::invalid("timezone", format!("is not a known zone: {name}")))
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    pub fn start_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        let midnight = date.and_time(NaiveTime::MIN);
        match self.tz.from_local_datetime(&midnight) {
            LocalResult::Single(value) => value.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            // Midnight skipped by a DST jump; the day starts at the first valid hour.
            LocalResult::None => self
                .tz
                .from_local_datetime(&(midnight + Duration::hours(1)))
                .earliest()
                .map(|value| value.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&midnight)),
        }
    }

    /// Local midnight of `date` to local midnight of the following day.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let next = date.succ_opt().unwrap_or(date);
        (self.start_of_day(date), self.start_of_day(next))
    }

    /// Checks `end > start` and that both fall on one local day, returning that day.
    /// An end exactly at the next local midnight still belongs to the start's day.
    pub fn validate_interval(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<NaiveDate, DomainError> {
        if end <= start {
            return Err(DomainError::InvalidTimeRange);
        }
        let date = self.local_date(start);
        let (_, day_end) = self.day_bounds(date);
        if end > day_end {
            return Err(DomainError::CrossesMidnight);
        }
        Ok(date)
    }

    pub fn to_local_rfc3339(&self, instant: DateTime<Utc>) -> String {
        instant
            .with_timezone(&self.tz)
            .to_rfc3339_opts(SecondsFormat::Secs, false)
    }
}

pub fn minutes_between(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_minutes()
}

/// Inclusive range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DomainError> {
        if end < start {
            return Err(DomainError::invalid("date_range.end", "must not precede start"));
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn spanning(start: NaiveDate, days: u32) -> Self {
        let days = i64::from(days.max(1)) - 1;
        Self {
            start,
            end: start + Duration::days(days),
        }
    }

    /// Monday through Sunday around `date`.
    pub fn week_of(date: NaiveDate) -> Self {
        let start = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
        Self {
            start,
            end: start + Duration::days(6),
        }
    }

    pub fn month_of(date: NaiveDate) -> Self {
        let start = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date);
        let next_month = if date.month() == 12 {
            NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
        };
        let end = next_month.and_then(|first| first.pred_opt()).unwrap_or(date);
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn intersects<'a>(&self, dates: impl IntoIterator<Item = &'a NaiveDate>) -> bool {
        dates.into_iter().any(|date| self.contains(*date))
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start
            .iter_days()
            .take_while(move |candidate| *candidate <= self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    #[test]
    fn local_date_follows_configured_zone() {
        let tokyo = LocalCalendar::parse("Asia/Tokyo").expect("known zone");
        let instant = fixed_time("2024-03-10T16:30:00Z");
        assert_eq!(tokyo.local_date(instant), date("2024-03-11"));
        assert_eq!(LocalCalendar::default().local_date(instant), date("2024-03-10"));
    }

    #[test]
    fn parse_rejects_unknown_zone() {
        let error = LocalCalendar::parse("Mars/Olympus").expect_err("unknown zone");
        assert_eq!(error.field(), "timezone");
    }

    #[test]
    fn validate_interval_rejects_reverse_and_midnight_crossing() {
        let calendar = LocalCalendar::default();
        assert_eq!(
            calendar.validate_interval(
                fixed_time("2024-03-10T10:00:00Z"),
                fixed_time("2024-03-10T10:00:00Z")
            ),
            Err(DomainError::InvalidTimeRange)
        );
        assert_eq!(
            calendar.validate_interval(
                fixed_time("2024-03-10T23:00:00Z"),
                fixed_time("2024-03-11T00:30:00Z")
            ),
            Err(DomainError::CrossesMidnight)
        );
    }

    #[test]
    fn validate_interval_accepts_end_at_next_midnight() {
        let calendar = LocalCalendar::default();
        let day = calendar
            .validate_interval(
                fixed_time("2024-03-10T23:00:00Z"),
                fixed_time("2024-03-11T00:00:00Z"),
            )
            .expect("end at midnight is same day");
        assert_eq!(day, date("2024-03-10"));
    }

    #[test]
    fn midnight_check_uses_local_offset() {
        let new_york = LocalCalendar::parse("America/New_York").expect("known zone");
        // 22:00-23:30 local on 2024-03-09, which crosses midnight in UTC.
        let day = new_york
            .validate_interval(
                fixed_time("2024-03-10T03:00:00Z"),
                fixed_time("2024-03-10T04:30:00Z"),
            )
            .expect("same local day");
        assert_eq!(day, date("2024-03-09"));
        assert_eq!(
            new_york.to_local_rfc3339(fixed_time("2024-03-10T03:00:00Z")),
            "2024-03-09T22:00:00-05:00"
        );
    }

    #[test]
    fn week_and_month_ranges() {
        let week = DateRange::week_of(date("2024-03-13"));
        assert_eq!(week.start, date("2024-03-11"));
        assert_eq!(week.end, date("2024-03-17"));
        assert_eq!(week.days().count(), 7);

        let month = DateRange::month_of(date("2024-02-10"));
        assert_eq!(month.start, date("2024-02-01"));
        assert_eq!(month.end, date("2024-02-29"));

        let december = DateRange::month_of(date("2024-12-31"));
        assert_eq!(december.end, date("2024-12-31"));
    }

    #[test]
    fn range_rejects_reversed_bounds() {
        assert!(DateRange::new(date("2024-03-10"), date("2024-03-09")).is_err());
        assert!(DateRange::spanning(date("2024-03-10"), 3).contains(date("2024-03-12")));
    }
}
