use chrono::{NaiveDateTime, NaiveTime, TimeDelta};

/// Next firing of a daily `start` time at or after `from`.
///
/// Today's start time if it has not passed yet, else tomorrow's. A start time
/// equal to `from` fires immediately.
pub fn next_daily_run(start: NaiveTime, from: NaiveDateTime) -> NaiveDateTime {
    let candidate = from.date().and_time(start);
    if candidate >= from {
        candidate
    } else {
        candidate + TimeDelta::days(1)
    }
}

/// Firing after a scheduled run that was due at `previous`.
///
/// Always a later day than `previous`, so a run that finishes within a minute
/// of its own start time is not fired twice. If the run overran a whole day
/// the next firing is computed from `now` instead.
pub fn following_daily_run(
    start: NaiveTime,
    previous: NaiveDateTime,
    now: NaiveDateTime,
) -> NaiveDateTime {
    let next_day = previous.date().and_time(start) + TimeDelta::days(1);
    if next_day > now {
        next_day
    } else {
        next_daily_run(start, now)
    }
}
