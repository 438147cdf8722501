use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// When a recurring definition fires, evaluated on the recipient's local calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurrenceRule {
    Daily,
    Weekly(Weekday),
    /// Monday to Friday.
    Weekdays,
    /// Saturday and Sunday.
    Weekends,
    /// Day of month; months that are too short fire on their last day.
    Monthly(u32),
}

impl RecurrenceRule {
    /// Builds a rule from its stored form. `day` is 0=Mon..6=Sun for
    /// `weekly` and 1..=31 for `monthly`.
    pub fn parse(kind: &str, day: Option<i32>) -> Result<Self, String> {
        match (kind, day) {
            ("daily", _) => Ok(RecurrenceRule::Daily),
            ("weekdays", _) => Ok(RecurrenceRule::Weekdays),
            ("weekends", _) => Ok(RecurrenceRule::Weekends),
            ("weekly", Some(d)) if (0..7).contains(&d) => Ok(RecurrenceRule::Weekly(WEEK[d as usize])),
            ("weekly", other) => Err(format!("weekly rule needs a weekday 0..=6, got {:?}", other)),
            ("monthly", Some(d)) if (1..=31).contains(&d) => Ok(RecurrenceRule::Monthly(d as u32)),
            ("monthly", other) => Err(format!("monthly rule needs a day 1..=31, got {:?}", other)),
            (other, _) => Err(format!("unknown recurrence type '{}'", other)),
        }
    }

    pub fn matches(&self, date: NaiveDate) -> bool {
        match self {
            RecurrenceRule::Daily => true,
            RecurrenceRule::Weekly(day) => date.weekday() == *day,
            RecurrenceRule::Weekdays => date.weekday().num_days_from_monday() < 5,
            RecurrenceRule::Weekends => date.weekday().num_days_from_monday() >= 5,
            RecurrenceRule::Monthly(day) => date.day() == (*day).min(last_day_of_month(date)),
        }
    }
}

fn last_day_of_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// Resolves a local wall-clock time to UTC. A time skipped by a DST jump
/// moves forward an hour; a repeated time takes the earlier instant.
pub fn localize(date: NaiveDate, time: NaiveTime, tz: Tz) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Every occurrence in `(now, end]`, in order.
pub fn occurrences_between(
    rule: RecurrenceRule,
    local_time: NaiveTime,
    tz: Tz,
    now: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let first = now.with_timezone(&tz).date_naive();
    let last = end.with_timezone(&tz).date_naive();

    first
        .iter_days()
        .take_while(|date| *date <= last)
        .filter(|date| rule.matches(*date))
        .filter_map(|date| localize(date, local_time, tz))
        .filter(|due| *due > now && *due <= end)
        .collect()
}
