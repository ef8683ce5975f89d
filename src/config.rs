use std::path::PathBuf;
use std::time::Duration;

use crate::model::PropertyDescriptor;

/// Share of available memory given to the engine page cache when no explicit
/// cache size is configured.
const DEFAULT_CACHE_MEMORY_PERCENT: u64 = 10;

/// Used when available memory cannot be determined.
const FALLBACK_CACHE_SIZE_BYTES: u64 = 64 * 1024 * 1024;

/// Configuration for the feature cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Path of the database file
    pub path: PathBuf,

    /// Engine page cache size in bytes (default: 10% of available memory)
    pub cache_size_bytes: Option<u64>,

    /// On-disk size ceiling in bytes; `<= 0` disables trimming (default: 0)
    pub size_limit_bytes: i64,

    /// Share the database file with other processes (default: false)
    pub auto_server: bool,

    /// Maximum pooled connections (default: 8)
    pub max_connections: u32,

    /// How long a caller may wait for a connection (default: 30s)
    pub connection_timeout: Duration,

    /// How long the engine retries on a locked file (default: 5s)
    pub busy_timeout: Duration,

    /// How often the trimmer checks the on-disk size (default: 60s)
    pub trim_interval: Duration,

    /// Pause between expiring victims and compacting them (default: 3s)
    pub trim_grace_period: Duration,

    /// Group-level interval properties, one table each
    pub interval_properties: Vec<PropertyDescriptor>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./featurecache.db"),
            cache_size_bytes: None,
            size_limit_bytes: 0,
            auto_server: false,
            max_connections: 8,
            connection_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            trim_interval: Duration::from_secs(60),
            trim_grace_period: Duration::from_secs(3),
            interval_properties: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Create a new config with the given database path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the engine page cache size
    pub fn cache_size_bytes(mut self, size: u64) -> Self {
        self.cache_size_bytes = Some(size);
        self
    }

    /// Set the on-disk size limit
    pub fn size_limit_bytes(mut self, limit: i64) -> Self {
        self.size_limit_bytes = limit;
        self
    }

    /// Enable shared access from other processes
    pub fn auto_server(mut self, enabled: bool) -> Self {
        self.auto_server = enabled;
        self
    }

    /// Set maximum pooled connections
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Set connection acquisition timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set engine busy timeout
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Set trim check interval
    pub fn trim_interval(mut self, interval: Duration) -> Self {
        self.trim_interval = interval;
        self
    }

    /// Set the pause between expiring and compacting
    pub fn trim_grace_period(mut self, grace: Duration) -> Self {
        self.trim_grace_period = grace;
        self
    }

    /// Register a group-level interval property
    pub fn interval_property(mut self, descriptor: PropertyDescriptor) -> Self {
        self.interval_properties.push(descriptor);
        self
    }

    /// Effective page cache size for the whole pool
    pub fn effective_cache_size_bytes(&self) -> u64 {
        self.cache_size_bytes.unwrap_or_else(default_cache_size_bytes)
    }

    /// Page cache size handed to each connection, in KiB
    pub(crate) fn cache_size_kib_per_connection(&self) -> i64 {
        let per_connection = self.effective_cache_size_bytes() / self.max_connections.max(1) as u64;
        (per_connection / 1024).max(1) as i64
    }
}

fn default_cache_size_bytes() -> u64 {
    match available_memory_bytes() {
        Some(available) => available / 100 * DEFAULT_CACHE_MEMORY_PERCENT,
        None => FALLBACK_CACHE_SIZE_BYTES,
    }
}

fn available_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kib| kib.parse::<u64>().ok())
        .map(|kib| kib * 1024)
}
