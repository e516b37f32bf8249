/// The error type for cache configuration rejected by
/// [`CacheBuilder::try_build`][try-build].
///
/// [try-build]: ./struct.CacheBuilder.html#method.try_build
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// `physical_memory_limit_percentage` must fall in `1..=100`.
    #[error("physical_memory_limit_percentage must be between 1 and 100, got {0}")]
    PhysicalMemoryLimitOutOfRange(u8),

    /// The statistics loop cannot poll on a zero interval.
    #[error("polling_interval must be non-zero")]
    ZeroPollingInterval,

    /// At least one shard is required.
    #[error("shard_count must be non-zero")]
    ZeroShardCount,
}
