use std::marker::PhantomData;
use std::time::Duration;

use crate::cache::MemoryCache;
use crate::error::ConfigError;

pub(crate) const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(20);

/// Builds a [`MemoryCache`][cache-struct] with various configuration knobs.
///
/// [cache-struct]: ./struct.MemoryCache.html
///
/// # Examples
///
/// ```rust
/// use cachette::MemoryCache;
///
/// use std::time::Duration;
///
/// let cache: cachette::MemoryCache<String> = MemoryCache::builder("responses")
///     // Trim when the cache's own footprint passes 64 MiB.
///     .cache_memory_limit_megabytes(64)
///     // Sample memory pressure every 10 seconds.
///     .polling_interval(Duration::from_secs(10))
///     .build();
///
/// cache.set("greeting", "hello".to_string(), Default::default());
/// ```
pub struct CacheBuilder<V> {
    name: String,
    shard_count: Option<usize>,
    cache_memory_limit_megabytes: Option<usize>,
    physical_memory_limit_percentage: Option<u8>,
    polling_interval: Duration,
    use_insert_block: bool,
    callbacks_on_dispose: bool,
    _marker: PhantomData<V>,
}

#[derive(Clone)]
pub(crate) struct ResolvedConfig {
    pub(crate) name: String,
    pub(crate) shard_count: usize,
    pub(crate) polling_interval: Duration,
    pub(crate) cache_memory_limit_bytes: Option<u64>,
    pub(crate) physical_memory_limit_percentage: Option<u8>,
    pub(crate) use_insert_block: bool,
    pub(crate) callbacks_on_dispose: bool,
}

impl<V> CacheBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shard_count: None,
            cache_memory_limit_megabytes: None,
            physical_memory_limit_percentage: None,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            use_insert_block: false,
            callbacks_on_dispose: false,
            _marker: PhantomData,
        }
    }

    /// Overrides the shard count. Defaults to the number of logical
    /// processors.
    pub fn shard_count(mut self, count: usize) -> Self {
        self.shard_count = Some(count);
        self
    }

    /// Caps the cache's own approximate footprint; pressure against this cap
    /// drives trimming. Without a cap, a backstop derived from total RAM and
    /// pointer width applies.
    pub fn cache_memory_limit_megabytes(mut self, megabytes: usize) -> Self {
        self.cache_memory_limit_megabytes = Some(megabytes);
        self
    }

    /// Overrides the machine-wide memory-load percentage above which the
    /// cache starts trimming.
    pub fn physical_memory_limit_percentage(mut self, percentage: u8) -> Self {
        self.physical_memory_limit_percentage = Some(percentage);
        self
    }

    /// How often the statistics loop samples memory pressure.
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Pauses admissions briefly while the expiration wheel splices out a
    /// large batch of expired entries.
    pub fn use_insert_block(mut self) -> Self {
        self.use_insert_block = true;
        self
    }

    /// Invoke removed callbacks with reason `Disposing` during cache
    /// teardown. Suppressed by default.
    pub fn callbacks_on_dispose(mut self) -> Self {
        self.callbacks_on_dispose = true;
        self
    }

    pub fn try_build(self) -> Result<MemoryCache<V>, ConfigError> {
        if let Some(percentage) = self.physical_memory_limit_percentage {
            if percentage == 0 || percentage > 100 {
                return Err(ConfigError::PhysicalMemoryLimitOutOfRange(percentage));
            }
        }
        if self.polling_interval.is_zero() {
            return Err(ConfigError::ZeroPollingInterval);
        }
        if self.shard_count == Some(0) {
            return Err(ConfigError::ZeroShardCount);
        }

        let config = ResolvedConfig {
            name: self.name,
            shard_count: self.shard_count.unwrap_or_else(|| num_cpus::get().max(1)),
            polling_interval: self.polling_interval,
            cache_memory_limit_bytes: self
                .cache_memory_limit_megabytes
                .map(|mb| mb as u64 * 1024 * 1024),
            physical_memory_limit_percentage: self.physical_memory_limit_percentage,
            use_insert_block: self.use_insert_block,
            callbacks_on_dispose: self.callbacks_on_dispose,
        };
        Ok(MemoryCache::with_config(
            config,
            crate::common::time::Clock::default(),
        ))
    }

    /// # Panics
    ///
    /// Panics when the configuration is invalid. See
    /// [`try_build`](Self::try_build) for the fallible variant.
    pub fn build(self) -> MemoryCache<V> {
        self.try_build()
            .unwrap_or_else(|e| panic!("invalid cache configuration: {}", e))
    }

    #[cfg(test)]
    pub(crate) fn build_with_clock(
        self,
        clock: crate::common::time::Clock,
    ) -> MemoryCache<V> {
        let mut this = self;
        // Tests drive the clock by hand; keep the background loop quiet
        // unless a test opted into a short interval on purpose.
        if this.polling_interval == DEFAULT_POLLING_INTERVAL {
            this.polling_interval = Duration::from_secs(3600);
        }
        let builder_clock = clock;
        let config = ResolvedConfig {
            name: this.name.clone(),
            shard_count: this.shard_count.unwrap_or(4),
            polling_interval: this.polling_interval,
            cache_memory_limit_bytes: this
                .cache_memory_limit_megabytes
                .map(|mb| mb as u64 * 1024 * 1024),
            physical_memory_limit_percentage: this.physical_memory_limit_percentage,
            use_insert_block: this.use_insert_block,
            callbacks_on_dispose: this.callbacks_on_dispose,
        };
        MemoryCache::with_config(config, builder_clock)
    }
}
