use std::env;

/// When WAL appends are forced down to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncMode {
    /// fsync on every append.
    Always,
    /// fsync when a commit record is appended, batching concurrent
    /// committers behind the append mutex.
    Group,
    /// leave fsync to the checkpoint timer. Commit durability is
    /// relaxed in this mode.
    Periodic,
}

impl FsyncMode {
    fn parse(value: &str) -> Option<FsyncMode> {
        match value {
            "always" => Some(FsyncMode::Always),
            "group" => Some(FsyncMode::Group),
            "periodic" => Some(FsyncMode::Periodic),
            _ => None,
        }
    }
}

/// Engine configuration. Every knob has a usable default; the
/// `GRANITE_*` environment variables override them at `Database` open
/// time.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub page_size: usize,
    pub buffer_pool_frames: usize,
    /// Fraction of the frame budget managed by LRU, the rest by LFU.
    pub buffer_pool_lru_ratio: f64,
    /// B+ tree fan-out: max entries per leaf, max keys per internal node.
    pub btree_order: usize,
    pub wal_segment_size: u64,
    pub wal_fsync_mode: FsyncMode,
    pub checkpoint_interval_ms: u64,
    pub deadlock_check_interval_ms: u64,
    pub lock_timeout_ms: u64,
    /// 0 means unbounded.
    pub statement_timeout_ms: u64,
    pub max_parallel_per_query: usize,
    pub histogram_bins: usize,
    pub plan_cache_size: usize,
    pub result_cache_size: usize,
    /// Relation count up to which the planner enumerates join orders
    /// exhaustively; greedy with lookahead beyond.
    pub join_enum_threshold: usize,
    /// Memory budget (bytes) for sort / hash operators before spilling.
    pub operator_memory_budget: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            page_size: 8192,
            buffer_pool_frames: 1024,
            buffer_pool_lru_ratio: 0.7,
            btree_order: 50,
            wal_segment_size: 16 * 1024 * 1024,
            wal_fsync_mode: FsyncMode::Group,
            checkpoint_interval_ms: 30_000,
            deadlock_check_interval_ms: 1_000,
            lock_timeout_ms: 10_000,
            statement_timeout_ms: 0,
            max_parallel_per_query: num_cpus::get().min(8),
            histogram_bins: 100,
            plan_cache_size: 256,
            result_cache_size: 128,
            join_enum_threshold: 12,
            operator_memory_budget: 16 * 1024 * 1024,
        }
    }
}

impl DbConfig {
    /// Defaults, then `GRANITE_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        read_usize("GRANITE_PAGE_SIZE", &mut config.page_size);
        read_usize("GRANITE_BUFFER_POOL_FRAMES", &mut config.buffer_pool_frames);
        read_f64(
            "GRANITE_BUFFER_POOL_LRU_RATIO",
            &mut config.buffer_pool_lru_ratio,
        );
        read_usize("GRANITE_BTREE_ORDER", &mut config.btree_order);
        read_u64("GRANITE_WAL_SEGMENT_SIZE", &mut config.wal_segment_size);
        if let Ok(v) = env::var("GRANITE_WAL_FSYNC_MODE") {
            if let Some(mode) = FsyncMode::parse(&v) {
                config.wal_fsync_mode = mode;
            }
        }
        read_u64(
            "GRANITE_CHECKPOINT_INTERVAL_MS",
            &mut config.checkpoint_interval_ms,
        );
        read_u64(
            "GRANITE_DEADLOCK_CHECK_INTERVAL_MS",
            &mut config.deadlock_check_interval_ms,
        );
        read_u64("GRANITE_LOCK_TIMEOUT_MS", &mut config.lock_timeout_ms);
        read_u64(
            "GRANITE_STATEMENT_TIMEOUT_MS",
            &mut config.statement_timeout_ms,
        );
        read_usize(
            "GRANITE_MAX_PARALLEL_PER_QUERY",
            &mut config.max_parallel_per_query,
        );
        read_usize("GRANITE_HISTOGRAM_BINS", &mut config.histogram_bins);
        read_usize("GRANITE_PLAN_CACHE_SIZE", &mut config.plan_cache_size);
        read_usize("GRANITE_RESULT_CACHE_SIZE", &mut config.result_cache_size);
        read_usize(
            "GRANITE_JOIN_ENUM_THRESHOLD",
            &mut config.join_enum_threshold,
        );
        read_usize(
            "GRANITE_OPERATOR_MEMORY_BUDGET",
            &mut config.operator_memory_budget,
        );

        config
    }
}

fn read_usize(key: &str, target: &mut usize) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse() {
            *target = parsed;
        }
    }
}

fn read_u64(key: &str, target: &mut u64) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse() {
            *target = parsed;
        }
    }
}

fn read_f64(key: &str, target: &mut f64) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.page_size, 8192);
        assert_eq!(config.btree_order, 50);
        assert_eq!(config.join_enum_threshold, 12);
        assert_eq!(config.wal_fsync_mode, FsyncMode::Group);
    }

    #[test]
    fn test_fsync_mode_parse() {
        assert_eq!(FsyncMode::parse("always"), Some(FsyncMode::Always));
        assert_eq!(FsyncMode::parse("bogus"), None);
    }
}
