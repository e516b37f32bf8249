//! Memory pressure monitors.
//!
//! Both monitors keep a short ring of recent pressure samples (integer
//! percentages) and expose "above the high watermark" as the trimming
//! trigger. The physical monitor samples the machine's memory load; the
//! cache monitor sizes the cache itself against a byte cap. When the
//! platform query is unavailable the physical monitor degrades to pressure
//! zero and trimming stays off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

const PRESSURE_SAMPLE_COUNT: usize = 6;

/// Trim percentages are clamped to this range.
const MIN_TRIM_PERCENT: usize = 10;
const MAX_TRIM_PERCENT: usize = 50;

/// Under sustained pressure, trimming should amortize to one full pass over
/// the cache in roughly this long.
const FULL_TRIM_TARGET: Duration = Duration::from_secs(5 * 60);

struct PressureSamples {
    hist: [i32; PRESSURE_SAMPLE_COUNT],
    next: usize,
    filled: usize,
    last: i32,
}

impl PressureSamples {
    fn new() -> Self {
        Self {
            hist: [0; PRESSURE_SAMPLE_COUNT],
            next: 0,
            filled: 0,
            last: 0,
        }
    }

    fn record(&mut self, pressure: i32) {
        self.hist[self.next] = pressure;
        self.next = (self.next + 1) % PRESSURE_SAMPLE_COUNT;
        self.filled = (self.filled + 1).min(PRESSURE_SAMPLE_COUNT);
        self.last = pressure;
    }

    fn average(&self) -> i32 {
        if self.filled == 0 {
            return 0;
        }
        self.hist[..self.filled].iter().sum::<i32>() / self.filled as i32
    }
}

/// Samples global memory load. The high watermark comes from a table keyed on
/// total RAM (machines with more memory can safely run closer to full), or
/// from an explicit override.
pub(crate) struct PhysicalMemoryMonitor {
    samples: Mutex<PressureSamples>,
    pressure_high: i32,
    pressure_low: i32,
    query_warned: AtomicBool,
}

impl PhysicalMemoryMonitor {
    pub(crate) fn new(limit_percentage: Option<u8>) -> Self {
        let pressure_high = match limit_percentage {
            Some(limit) => i32::from(limit),
            None => match platform::physical_memory_total() {
                Some(total) => {
                    const MIB: u64 = 1024 * 1024;
                    if total >= 4096 * MIB {
                        99
                    } else if total >= 2048 * MIB {
                        98
                    } else if total >= 1024 * MIB {
                        97
                    } else if total >= 768 * MIB {
                        96
                    } else {
                        95
                    }
                }
                None => 99,
            },
        };
        Self {
            samples: Mutex::new(PressureSamples::new()),
            pressure_high,
            pressure_low: (pressure_high - 9).max(1),
            query_warned: AtomicBool::new(false),
        }
    }

    pub(crate) fn update(&self) {
        let pressure = match platform::physical_memory_load() {
            Some(load) => load,
            None => {
                if !self.query_warned.swap(true, Ordering::AcqRel) {
                    log::warn!("physical memory query unavailable; pressure trimming disabled");
                }
                0
            }
        };
        self.samples.lock().record(pressure);
    }

    pub(crate) fn last_pressure(&self) -> i32 {
        self.samples.lock().last
    }

    pub(crate) fn is_above_high(&self) -> bool {
        self.last_pressure() >= self.pressure_high
    }

    pub(crate) fn is_below_low(&self) -> bool {
        self.samples.lock().average() <= self.pressure_low
    }

    /// Zero below the high watermark; otherwise a share sized so repeated
    /// trims cycle the whole cache in about five minutes.
    pub(crate) fn percent_to_trim(&self, since_last_trim: Duration) -> usize {
        if !self.is_above_high() {
            return 0;
        }
        let percent = (since_last_trim.as_secs() as usize * 100) / FULL_TRIM_TARGET.as_secs() as usize;
        percent.clamp(MIN_TRIM_PERCENT, MAX_TRIM_PERCENT)
    }
}

/// Sizes the cache itself against a byte cap: an explicit limit, or a default
/// derived from total RAM and pointer width. Without any usable cap the
/// monitor reports zero pressure.
pub(crate) struct CacheMemoryMonitor {
    samples: Mutex<PressureSamples>,
    limit_bytes: u64,
    pressure_high: i32,
    pressure_low: i32,
}

impl CacheMemoryMonitor {
    pub(crate) fn new(explicit_limit_bytes: Option<u64>) -> Self {
        let (limit_bytes, pressure_high, pressure_low) = match explicit_limit_bytes {
            Some(limit) => (limit, 100, 80),
            // The derived default is a backstop, not a goal, so the
            // watermarks sit where they essentially never trigger.
            None => (Self::default_limit_bytes(), 99, 97),
        };
        Self {
            samples: Mutex::new(PressureSamples::new()),
            limit_bytes,
            pressure_high,
            pressure_low,
        }
    }

    fn default_limit_bytes() -> u64 {
        let Some(total) = platform::physical_memory_total() else {
            return 0;
        };
        let three_fifths = total / 5 * 3;
        let ceiling: u64 = if cfg!(target_pointer_width = "64") {
            1 << 40
        } else {
            800 * 1024 * 1024
        };
        three_fifths.min(ceiling)
    }

    pub(crate) fn update(&self, size_bytes: u64) {
        let pressure = if self.limit_bytes == 0 {
            0
        } else {
            (size_bytes.saturating_mul(100) / self.limit_bytes).min(i32::MAX as u64) as i32
        };
        self.samples.lock().record(pressure);
    }

    pub(crate) fn last_pressure(&self) -> i32 {
        self.samples.lock().last
    }

    pub(crate) fn is_above_high(&self) -> bool {
        self.last_pressure() >= self.pressure_high
    }

    pub(crate) fn is_below_low(&self) -> bool {
        self.samples.lock().average() <= self.pressure_low
    }

    /// Trims enough to bring the cache back to the low watermark.
    pub(crate) fn percent_to_trim(&self) -> usize {
        let last = self.last_pressure();
        if last < self.pressure_high {
            return 0;
        }
        let percent = 100usize.saturating_sub((self.pressure_low as usize * 100) / last as usize);
        percent.clamp(MIN_TRIM_PERCENT, MAX_TRIM_PERCENT)
    }
}

mod platform {
    #[cfg(target_os = "linux")]
    mod imp {
        struct MemInfo {
            total_bytes: u64,
            available_bytes: u64,
        }

        fn read_meminfo() -> Option<MemInfo> {
            let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
            let mut total = None;
            let mut available = None;
            for line in contents.lines() {
                if let Some(rest) = line.strip_prefix("MemTotal:") {
                    total = parse_kib(rest);
                } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                    available = parse_kib(rest);
                }
                if total.is_some() && available.is_some() {
                    break;
                }
            }
            Some(MemInfo {
                total_bytes: total?,
                available_bytes: available?,
            })
        }

        fn parse_kib(field: &str) -> Option<u64> {
            let kib: u64 = field.trim().trim_end_matches("kB").trim().parse().ok()?;
            Some(kib * 1024)
        }

        pub(crate) fn physical_memory_total() -> Option<u64> {
            read_meminfo().map(|m| m.total_bytes)
        }

        pub(crate) fn physical_memory_load() -> Option<i32> {
            let info = read_meminfo()?;
            if info.total_bytes == 0 {
                return None;
            }
            let used = info.total_bytes.saturating_sub(info.available_bytes);
            Some((used * 100 / info.total_bytes) as i32)
        }
    }

    #[cfg(not(target_os = "linux"))]
    mod imp {
        pub(crate) fn physical_memory_total() -> Option<u64> {
            None
        }

        pub(crate) fn physical_memory_load() -> Option<i32> {
            None
        }
    }

    pub(crate) use imp::{physical_memory_load, physical_memory_total};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_ring_tracks_last_and_average() {
        let mut samples = PressureSamples::new();
        assert_eq!(samples.average(), 0);

        for p in [10, 20, 30] {
            samples.record(p);
        }
        assert_eq!(samples.last, 30);
        assert_eq!(samples.average(), 20);

        // Overflow the ring; the oldest samples fall out of the window.
        for p in [90, 90, 90, 90, 90, 90] {
            samples.record(p);
        }
        assert_eq!(samples.average(), 90);
    }

    #[test]
    fn cache_monitor_pressure_is_relative_to_the_cap() {
        let monitor = CacheMemoryMonitor::new(Some(1000));
        monitor.update(500);
        assert_eq!(monitor.last_pressure(), 50);
        assert!(!monitor.is_above_high());
        assert_eq!(monitor.percent_to_trim(), 0);

        monitor.update(1000);
        assert!(monitor.is_above_high());
        // At the cap with a low watermark of 80, a 20% trim gets back under.
        assert_eq!(monitor.percent_to_trim(), 20);

        monitor.update(4000);
        assert_eq!(monitor.percent_to_trim(), 50);
    }

    #[test]
    fn physical_trim_share_amortizes_a_full_pass() {
        let monitor = PhysicalMemoryMonitor::new(Some(1));
        // Force pressure above the 1% watermark regardless of platform.
        monitor.samples.lock().record(100);
        assert!(monitor.is_above_high());

        assert_eq!(monitor.percent_to_trim(Duration::from_secs(20)), 10);
        assert_eq!(monitor.percent_to_trim(Duration::from_secs(60)), 20);
        assert_eq!(monitor.percent_to_trim(Duration::from_secs(3600)), 50);
    }

    #[test]
    fn unlimited_cache_monitor_never_triggers() {
        let monitor = CacheMemoryMonitor {
            samples: Mutex::new(PressureSamples::new()),
            limit_bytes: 0,
            pressure_high: 99,
            pressure_low: 97,
        };
        monitor.update(u64::MAX);
        assert_eq!(monitor.last_pressure(), 0);
        assert!(!monitor.is_above_high());
    }
}
