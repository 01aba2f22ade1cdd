use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{Local, NaiveDateTime, TimeDelta, Utc};

/// Wall-clock source for start times and cut-offs.
///
/// Times are naive: start and cut-off times in the configuration are plain
/// times of day, compared against whatever the clock reports.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// The host clock, in local time or UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    utc: bool,
}

impl SystemClock {
    pub fn new(utc: bool) -> Self {
        Self { utc }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        if self.utc {
            Utc::now().naive_utc()
        } else {
            Local::now().naive_local()
        }
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(at: NaiveDateTime) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn set(&self, at: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Replays a fixed sequence of readings, one per call to `now`, then keeps
/// returning the last one.
#[derive(Debug)]
pub struct ScriptedClock {
    readings: Mutex<VecDeque<NaiveDateTime>>,
    last: Mutex<NaiveDateTime>,
}

impl ScriptedClock {
    pub fn new(readings: impl IntoIterator<Item = NaiveDateTime>) -> Self {
        let readings: VecDeque<_> = readings.into_iter().collect();
        let last = readings.front().copied().unwrap_or_default();
        Self {
            readings: Mutex::new(readings),
            last: Mutex::new(last),
        }
    }
}

impl Clock for ScriptedClock {
    fn now(&self) -> NaiveDateTime {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(next) = self
            .readings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            *last = next;
        }
        *last
    }
}
