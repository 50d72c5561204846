use std::path::PathBuf;

/// Configuration for the log archiver.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    /// Archive root directory.
    pub archive_dir: PathBuf,

    /// Directory holding the recovery log partitions.
    pub log_dir: PathBuf,

    /// Sorter workspace size in bytes (default: 100MB).
    pub workspace_size: usize,

    /// Archive block size in bytes. Must be a multiple of the log page size
    /// so record headers are never truncated (default and currently only
    /// supported value: 1MB).
    pub block_size: usize,

    /// Page numbers per index bucket (default: 128).
    pub bucket_size: u32,

    /// Continuous archiving: poll the durable end of the log instead of
    /// waiting for activations (default: true).
    pub eager: bool,

    /// Round activation windows down to a block boundary (default: true).
    pub read_whole_blocks: bool,

    /// Sleep when the log grows slower than one block per activation, in
    /// microseconds (default: 1s).
    pub slow_log_grace_period_us: u64,

    /// Erase any existing archive on startup (default: false).
    pub format: bool,
}

/// 1MB = 128 log pages.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Number of blocks in each of the read and write rings (total 8MB each).
pub const IO_BLOCK_COUNT: usize = 8;

/// Alignment for direct reads of run files.
pub const IO_ALIGN: usize = 512;

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("./archive"),
            log_dir: PathBuf::from("./log"),
            workspace_size: 100 * 1024 * 1024, // 100MB
            block_size: DEFAULT_BLOCK_SIZE,
            bucket_size: 128,
            eager: true,
            read_whole_blocks: true,
            slow_log_grace_period_us: 1_000_000,
            format: false,
        }
    }
}

/// Configuration for the B-link tree.
#[derive(Debug, Clone)]
pub struct BtreeConfig {
    /// How skewed consecutive insertions must be before a no-record split
    /// is considered (default: 5).
    pub skewed_insertion_threshold: i16,

    /// Fraction (percent) below which a foster child is considered sparse
    /// enough to merge back into its parent (default: 10).
    pub merge_threshold_pct: u8,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            skewed_insertion_threshold: 5,
            merge_threshold_pct: 10,
        }
    }
}
