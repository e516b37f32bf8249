use std::time::{Duration, Instant as StdInstant};

use chrono::{DateTime, Utc};

#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use parking_lot::RwLock;

/// Milliseconds since the Unix epoch. All internal deadline arithmetic is done
/// on this representation; `NEVER` is the "no expiration" sentinel.
pub(crate) type Ticks = i64;

pub(crate) const NEVER: Ticks = i64::MAX;

pub(crate) const fn ticks_from_duration(d: Duration) -> Ticks {
    d.as_millis() as Ticks
}

pub(crate) fn ticks_from_datetime(t: DateTime<Utc>) -> Ticks {
    if t == DateTime::<Utc>::MAX_UTC {
        NEVER
    } else {
        t.timestamp_millis()
    }
}

#[cfg(test)]
pub(crate) fn datetime_from_ticks(ticks: Ticks) -> DateTime<Utc> {
    use chrono::TimeZone;

    if ticks == NEVER {
        DateTime::<Utc>::MAX_UTC
    } else {
        Utc.timestamp_millis_opt(ticks)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// The source of wall-clock time for a cache instance.
///
/// The standard clock anchors a UTC timestamp at creation and advances it with
/// a monotonic `std::time::Instant`, so deadlines are immune to wall-clock
/// steps. Tests swap in a mocked source they can advance by hand.
#[derive(Clone)]
pub(crate) struct Clock {
    ty: ClockType,
}

#[derive(Clone)]
enum ClockType {
    Standard {
        utc_origin: DateTime<Utc>,
        origin: StdInstant,
    },
    #[cfg(test)]
    Mocked { mock: Arc<Mock> },
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            ty: ClockType::Standard {
                utc_origin: Utc::now(),
                origin: StdInstant::now(),
            },
        }
    }
}

impl Clock {
    #[cfg(test)]
    pub(crate) fn mock() -> (Clock, Arc<Mock>) {
        let mock = Arc::new(Mock::default());
        let clock = Clock {
            ty: ClockType::Mocked {
                mock: Arc::clone(&mock),
            },
        };
        (clock, mock)
    }

    pub(crate) fn now_utc(&self) -> DateTime<Utc> {
        match &self.ty {
            ClockType::Standard { utc_origin, origin } => {
                *utc_origin
                    + chrono::Duration::from_std(origin.elapsed())
                        .unwrap_or_else(|_| chrono::Duration::zero())
            }
            #[cfg(test)]
            ClockType::Mocked { mock } => mock.now(),
        }
    }

    pub(crate) fn now_ticks(&self) -> Ticks {
        self.now_utc().timestamp_millis()
    }
}

#[cfg(test)]
pub(crate) struct Mock {
    now: RwLock<DateTime<Utc>>,
}

#[cfg(test)]
impl Default for Mock {
    fn default() -> Self {
        Self {
            now: RwLock::new(Utc::now()),
        }
    }
}

#[cfg(test)]
impl Mock {
    pub(crate) fn increment(&self, amount: Duration) {
        let mut now = self.now.write();
        *now = *now + chrono::Duration::from_std(amount).expect("duration out of range");
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}
