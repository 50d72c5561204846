//! File and I/O management for the log archive.
//!
//! The directory owns every file the archiver touches: it enumerates
//! existing run files at startup (recovering the archive index from their
//! trailing index blocks), deletes crash leftovers, serves appends to the
//! open run of each level, renames a finished run to its LSN-ranged name,
//! and opens runs for scanning. Run files are named
//! `archive_<level>_<first>-<last>` with LSNs printed as `part.off`;
//! `current_run` and `current_merge` are the in-progress placeholders.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use itertools::Itertools as _;

use crate::config::{ArchiverConfig, IO_ALIGN};
use crate::error::{ErrorKind, Result};
use crate::flock::DirLock;
use crate::log::record::{LogRecord, HEADER_SIZE};
use crate::lsn::Lsn;
use crate::{bail, errdata, trace_err};

use super::index::ArchiveIndex;

const RUN_PREFIX: &str = "archive_";
const CURR_RUN_FILE: &str = "current_run";
const CURR_MERGE_FILE: &str = "current_merge";

/// Boundaries parsed from a run file name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunFileStats {
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
    pub level: u32,
}

pub struct ArchiveDirectory {
    archdir: PathBuf,
    log_dir: PathBuf,
    block_size: usize,
    start_lsn: Lsn,
    index: ArchiveIndex,
    state: Mutex<AppendState>,
    _lock: DirLock,
}

#[derive(Default)]
struct AppendState {
    /// Open placeholder file and append position, per level.
    open: HashMap<u32, (File, u64)>,
}

impl ArchiveDirectory {
    pub fn new(config: &ArchiverConfig) -> Result<Arc<Self>> {
        if !config.archive_dir.exists() {
            fs::create_dir_all(&config.archive_dir)?;
        }
        let lock = DirLock::lock(config.archive_dir.join("archive.lock"))?;

        let index = ArchiveIndex::new(config.block_size, config.bucket_size);
        let mut highest = Lsn::NULL;
        let mut run_files = Vec::new();
        for entry in fs::read_dir(&config.archive_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == CURR_RUN_FILE || name == CURR_MERGE_FILE {
                tracing::info!(file = %name, "deleting unfinished run from previous crash");
                fs::remove_file(entry.path())?;
                continue;
            }
            if name.ends_with(".lock") {
                continue;
            }
            match Self::parse_run_file_name(&name) {
                Some(stats) => {
                    if config.format {
                        fs::remove_file(entry.path())?;
                        continue;
                    }
                    run_files.push(stats);
                    if stats.last_lsn > highest {
                        highest = stats.last_lsn;
                    }
                }
                None => {
                    return Err(errdata!("unrecognized file in archive: {name}"));
                }
            }
        }

        let mut start_lsn = highest;
        if start_lsn.is_null() {
            // No archive yet: start from the first available log partition.
            start_lsn = Self::first_log_partition(&config.log_dir)
                .map(|part| Lsn::new(part, 0))
                .unwrap_or(Lsn::new(1, 0));
        }

        let directory = Arc::new(Self {
            archdir: config.archive_dir.clone(),
            log_dir: config.log_dir.clone(),
            block_size: config.block_size,
            start_lsn,
            index,
            state: Mutex::new(AppendState::default()),
            _lock: lock,
        });

        // Load index blocks of every surviving run, oldest first.
        let mut prev_end: Option<(u32, Lsn)> = None;
        for stats in run_files
            .iter()
            .sorted_by_key(|s| (s.level, s.first_lsn))
        {
            if let Some((level, end)) = prev_end {
                if level == stats.level && end != stats.first_lsn {
                    tracing::warn!(
                        level,
                        expected = %end,
                        found = %stats.first_lsn,
                        "gap between archived runs"
                    );
                }
            }
            prev_end = Some((stats.level, stats.last_lsn));
            let file = directory.open_for_scan(stats.first_lsn, stats.last_lsn, stats.level)?;
            directory
                .index
                .load_run_info(&file, stats.first_lsn, stats.last_lsn, stats.level)?;
        }
        directory.index.init();

        tracing::info!(
            dir = %directory.archdir.display(),
            start_lsn = %start_lsn,
            runs = run_files.len(),
            "archive directory opened"
        );
        Ok(directory)
    }

    /// Smallest partition number with a log file present.
    fn first_log_partition(log_dir: &Path) -> Option<u32> {
        let entries = fs::read_dir(log_dir).ok()?;
        entries
            .flatten()
            .filter_map(|e| {
                e.file_name()
                    .to_string_lossy()
                    .strip_prefix("log.")
                    .and_then(|n| n.parse::<u32>().ok())
            })
            .min()
    }

    /// Path of the log partition file for `partition`.
    pub fn log_partition_path(&self, partition: u32) -> PathBuf {
        self.log_dir.join(format!("log.{partition}"))
    }

    /// Durable end of the recovery log: the size of the highest-numbered
    /// partition file. Eager archiving polls this.
    pub fn durable_log_end(&self) -> Lsn {
        let Ok(entries) = fs::read_dir(&self.log_dir) else {
            return Lsn::NULL;
        };
        entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name();
                let part: u32 = name.to_string_lossy().strip_prefix("log.")?.parse().ok()?;
                let len = e.metadata().ok()?.len();
                Some(Lsn::new(part, len as u32))
            })
            .max()
            .unwrap_or(Lsn::NULL)
    }

    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    pub fn max_level(&self) -> u32 {
        self.index.max_level()
    }

    /// End LSN of the most recent finished run at level 1; where archiving
    /// resumes.
    pub fn last_lsn(&self) -> Lsn {
        self.index.last_lsn(1)
    }

    /// Parses `archive_<level>_<first>-<last>`; returns None when the name
    /// does not match the grammar.
    pub fn parse_run_file_name(name: &str) -> Option<RunFileStats> {
        let rest = name.strip_prefix(RUN_PREFIX)?;
        let (level, range) = rest.split_once('_')?;
        let (first, last) = range.split_once('-')?;
        Some(RunFileStats {
            level: level.parse().ok()?,
            first_lsn: first.parse().ok()?,
            last_lsn: last.parse().ok()?,
        })
    }

    fn run_path(&self, first: Lsn, last: Lsn, level: u32) -> PathBuf {
        self.archdir
            .join(format!("{RUN_PREFIX}{level}_{first}-{last}"))
    }

    fn placeholder_path(&self, level: u32) -> PathBuf {
        // Generation and merge write concurrently; they must not share a
        // placeholder file.
        if level <= 1 {
            self.archdir.join(CURR_RUN_FILE)
        } else {
            self.archdir.join(CURR_MERGE_FILE)
        }
    }

    fn open_new_run(&self, state: &mut AppendState, level: u32) -> Result<()> {
        let path = self.placeholder_path(level);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        state.open.insert(level, (file, 0));
        tracing::debug!(level, "opened new output run");
        Ok(())
    }

    /// Appends one block's payload to the open run at `level`, terminated
    /// by a skip record header. The next append overwrites the terminator,
    /// so only the final one survives in the file.
    pub fn append(&self, data: &[u8], level: u32) -> Result<()> {
        let mut state = self.state.lock()?;
        if !state.open.contains_key(&level) {
            self.open_new_run(&mut state, level)?;
        }
        let (file, pos) = state.open.get_mut(&level).expect("opened above");
        debug_assert!(data.len() + HEADER_SIZE <= self.block_size);
        let skip = LogRecord::skip(Lsn::NULL).encode();
        file.write_all_at(data, *pos)?;
        file.write_all_at(&skip, *pos + data.len() as u64)?;
        *pos += data.len() as u64;
        Ok(())
    }

    /// Closes the open run at `level`: serializes its index blocks after
    /// the data region, renames the placeholder to its final LSN-ranged
    /// name, and opens a fresh placeholder. Serialized under one mutex
    /// because both the writer thread and a flush request may land here.
    pub fn close_current_run(&self, run_end_lsn: Lsn, level: u32) -> Result<()> {
        let mut state = self.state.lock()?;
        if let Some((file, pos)) = state.open.remove(&level) {
            if pos == 0 && run_end_lsn.is_null() {
                // Nothing was appended; keep the empty placeholder around.
                state.open.insert(level, (file, pos));
                return Ok(());
            }
            let last_lsn = self.index.last_lsn(level);
            if last_lsn != run_end_lsn && pos > 0 {
                // Round past the trailing skip record up to the next block
                // boundary; index blocks start there.
                let mut index_offset = pos + HEADER_SIZE as u64;
                index_offset = index_offset.div_ceil(self.block_size as u64)
                    * self.block_size as u64;
                file.set_len(index_offset)?;
                self.index
                    .finish_run(last_lsn, run_end_lsn, &file, index_offset, level)?;

                let new_path = self.run_path(last_lsn, run_end_lsn, level);
                file.sync_all()?;
                drop(file);
                fs::rename(self.placeholder_path(level), &new_path)?;
                tracing::debug!(path = %new_path.display(), "closed output run");
            }
        }
        self.open_new_run(&mut state, level)
    }

    /// Opens a finished run for scanning.
    pub fn open_for_scan(&self, first: Lsn, last: Lsn, level: u32) -> Result<File> {
        let path = self.run_path(first, last, level);
        Ok(trace_err!(
            File::open(&path).map_err(crate::error::Error::from),
            "opening run {}",
            path.display()
        ))
    }

    /// Reads up to `read_size` bytes at `*offset` into `buf`, aligning the
    /// physical read down to [`IO_ALIGN`]. Advances `*offset`; an offset of
    /// zero after the call signals end of file.
    pub fn read_block(
        &self,
        file: &File,
        buf: &mut [u8],
        offset: &mut u64,
        read_size: usize,
    ) -> Result<usize> {
        let read_size = if read_size == 0 {
            self.block_size
        } else {
            read_size
        };
        let aligned_offset = (*offset / IO_ALIGN as u64) * IO_ALIGN as u64;
        let diff = (*offset - aligned_offset) as usize;
        debug_assert!(buf.len() >= read_size + IO_ALIGN);

        let want = read_size + diff;
        let mut got = 0usize;
        while got < want {
            let n = file.read_at(&mut buf[got..want], aligned_offset + got as u64)?;
            if n == 0 {
                break;
            }
            got += n;
        }
        if got == 0 {
            *offset = 0;
            return Ok(0);
        }
        if got <= diff {
            bail!(ErrorKind::ShortIo);
        }
        if diff > 0 {
            buf.copy_within(diff..got, 0);
        }
        *offset += read_size as u64;
        Ok(got - diff)
    }

    /// Names of finished runs, optionally restricted to one level.
    pub fn list_file_stats(&self, level: Option<u32>) -> Result<Vec<RunFileStats>> {
        let mut stats = Vec::new();
        for entry in fs::read_dir(&self.archdir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(parsed) = Self::parse_run_file_name(&name.to_string_lossy()) {
                if level.map(|l| l == parsed.level).unwrap_or(true) {
                    stats.push(parsed);
                }
            }
        }
        stats.sort_by_key(|s| (s.level, s.first_lsn));
        Ok(stats)
    }

    /// Removes every finished run file. The index is not touched; callers
    /// use this during teardown or reformat only.
    pub fn delete_all_runs(&self) -> Result<()> {
        for entry in fs::read_dir(&self.archdir)? {
            let entry = entry?;
            if Self::parse_run_file_name(&entry.file_name().to_string_lossy()).is_some() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ArchiverConfig {
        ArchiverConfig {
            archive_dir: dir.path().join("archive"),
            log_dir: dir.path().join("log"),
            block_size: 4096,
            bucket_size: 8,
            ..Default::default()
        }
    }

    #[test]
    fn parses_run_file_names() {
        let stats = ArchiveDirectory::parse_run_file_name("archive_1_1.0-1.1048576").unwrap();
        assert_eq!(stats.level, 1);
        assert_eq!(stats.first_lsn, Lsn::new(1, 0));
        assert_eq!(stats.last_lsn, Lsn::new(1, 1048576));
        assert!(ArchiveDirectory::parse_run_file_name("current_run").is_none());
        assert!(ArchiveDirectory::parse_run_file_name("archive_x_1.0-1.1").is_none());
        assert!(ArchiveDirectory::parse_run_file_name("archive_1_1.0").is_none());
    }

    #[test]
    fn crash_leftovers_are_deleted_on_startup() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        fs::create_dir_all(&config.archive_dir).unwrap();
        fs::write(config.archive_dir.join(CURR_RUN_FILE), b"partial").unwrap();
        fs::write(config.archive_dir.join(CURR_MERGE_FILE), b"partial").unwrap();

        let directory = ArchiveDirectory::new(&config).unwrap();
        // The constructor opens a fresh level-1 placeholder lazily, so
        // neither leftover survives.
        assert!(!config.archive_dir.join(CURR_MERGE_FILE).exists());
        assert_eq!(directory.start_lsn(), Lsn::new(1, 0));
    }

    #[test]
    fn append_close_rename_and_rediscover() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        {
            let directory = ArchiveDirectory::new(&config).unwrap();
            directory.index().append_new_entry(1);
            directory.index().add_block(&[(0, 0)], 1);
            let payload = vec![7u8; 1000];
            directory.append(&payload, 1).unwrap();
            directory.close_current_run(Lsn::new(1, 5000), 1).unwrap();

            let stats = directory.list_file_stats(Some(1)).unwrap();
            assert_eq!(stats.len(), 1);
            assert_eq!(stats[0].first_lsn, Lsn::new(1, 0));
            assert_eq!(stats[0].last_lsn, Lsn::new(1, 5000));
        }
        // A new directory instance picks the archive back up from the file
        // names and index blocks.
        let directory = ArchiveDirectory::new(&config).unwrap();
        assert_eq!(directory.start_lsn(), Lsn::new(1, 5000));
        assert_eq!(directory.last_lsn(), Lsn::new(1, 5000));
    }

    #[test]
    fn format_erases_existing_runs() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        {
            let directory = ArchiveDirectory::new(&config).unwrap();
            directory.index().append_new_entry(1);
            directory.index().add_block(&[(0, 0)], 1);
            directory.append(&[1u8; 100], 1).unwrap();
            directory.close_current_run(Lsn::new(1, 100), 1).unwrap();
        }
        config.format = true;
        let directory = ArchiveDirectory::new(&config).unwrap();
        assert!(directory.list_file_stats(None).unwrap().is_empty());
        assert_eq!(directory.start_lsn(), Lsn::new(1, 0));
    }

    #[test]
    fn read_block_handles_unaligned_offsets() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let directory = ArchiveDirectory::new(&config).unwrap();

        let path = dir.path().join("blob");
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();
        let file = File::open(&path).unwrap();

        let mut buf = vec![0u8; 4096 + IO_ALIGN];
        let mut offset = 1000u64; // not IO_ALIGN aligned
        let n = directory.read_block(&file, &mut buf, &mut offset, 2048).unwrap();
        assert_eq!(n, 2048);
        assert_eq!(offset, 1000 + 2048);
        assert_eq!(&buf[..2048], &data[1000..3048]);
    }
}
