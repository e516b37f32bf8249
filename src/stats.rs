//! The statistics loop: a periodic timer that samples both memory monitors,
//! retunes its own pace to the pressure it sees, and reports how much of the
//! cache should be trimmed.

use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::builder::ResolvedConfig;
use crate::host;
use crate::memory::{CacheMemoryMonitor, PhysicalMemoryMonitor};
use crate::periodic::PeriodicCallback;

/// Flat per-entry footprint estimate for the cache's own size accounting.
const APPROX_BYTES_PER_ENTRY: u64 = 256;

/// Poll pace while above the high watermark.
const FAST_POLLING_INTERVAL: Duration = Duration::from_secs(5);

/// Poll pace immediately after pressure recedes.
const RECOVERY_POLLING_INTERVAL: Duration = Duration::from_secs(30);

/// What the last trim pass did.
#[derive(Clone, Debug)]
pub struct CacheTrimStats {
    pub utc_time: DateTime<Utc>,
    pub percent: usize,
    pub count_before: usize,
    pub trimmed: usize,
    pub duration: Duration,
}

pub(crate) struct MemoryCacheStatistics {
    physical: PhysicalMemoryMonitor,
    cache_monitor: CacheMemoryMonitor,
    timer: Mutex<Option<PeriodicCallback>>,
    default_interval: Duration,
    last_trim: Mutex<Option<CacheTrimStats>>,
    last_trim_instant: Mutex<StdInstant>,
}

impl MemoryCacheStatistics {
    pub(crate) fn new(config: &ResolvedConfig) -> Self {
        Self {
            physical: PhysicalMemoryMonitor::new(config.physical_memory_limit_percentage),
            cache_monitor: CacheMemoryMonitor::new(config.cache_memory_limit_bytes),
            timer: Mutex::new(None),
            default_interval: config.polling_interval,
            last_trim: Mutex::new(None),
            last_trim_instant: Mutex::new(StdInstant::now()),
        }
    }

    pub(crate) fn start(&self, tick: impl Fn() + Send + Sync + 'static) {
        *self.timer.lock() = Some(PeriodicCallback::new(Arc::new(tick), self.default_interval));
    }

    /// Stops the loop. The timer is dropped (and its worker joined) outside
    /// the lock, so an in-flight tick that needs the lock can finish first.
    pub(crate) fn dispose(&self) {
        let timer = self.timer.lock().take();
        drop(timer);
    }

    /// One tick: sample both monitors, report the size to the host hook,
    /// retune the poll pace, and return the percentage to trim (zero when
    /// pressure is acceptable).
    pub(crate) fn poll(&self, entry_count: usize, cache_id: Uuid) -> usize {
        self.physical.update();
        let size_bytes = entry_count as u64 * APPROX_BYTES_PER_ENTRY;
        self.cache_monitor.update(size_bytes);
        if let Some(manager) = host::memory_cache_manager() {
            manager.update_cache_size(size_bytes, cache_id);
        }

        self.adjust_polling_interval();

        let since_last_trim = self.last_trim_instant.lock().elapsed();
        self.physical
            .percent_to_trim(since_last_trim)
            .max(self.cache_monitor.percent_to_trim())
    }

    /// Shortens the pace under pressure, widens it once pressure recedes, and
    /// settles back to the configured default when idle.
    fn adjust_polling_interval(&self) {
        // try_lock: if the owner is mid-dispose we simply skip the retune.
        let Some(timer_guard) = self.timer.try_lock() else {
            return;
        };
        let Some(timer) = timer_guard.as_ref() else {
            return;
        };
        let above_high = self.physical.is_above_high() || self.cache_monitor.is_above_high();
        let below_low = self.physical.is_below_low() && self.cache_monitor.is_below_low();
        let current = timer.interval();
        let next = if above_high {
            FAST_POLLING_INTERVAL
        } else if current == FAST_POLLING_INTERVAL {
            RECOVERY_POLLING_INTERVAL
        } else if current == RECOVERY_POLLING_INTERVAL && below_low {
            self.default_interval
        } else {
            current
        };
        if next != current {
            timer.set_interval(next);
        }
    }

    pub(crate) fn record_trim(&self, stats: CacheTrimStats) {
        *self.last_trim_instant.lock() = StdInstant::now();
        *self.last_trim.lock() = Some(stats);
    }

    pub(crate) fn last_trim(&self) -> Option<CacheTrimStats> {
        self.last_trim.lock().clone()
    }
}
