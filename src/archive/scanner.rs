//! Scans over the log archive for restore and for background merging.
//!
//! A [`RunScanner`] reads one run from a probed byte offset, parsing
//! records out of fixed-size reads (records freely straddle read
//! boundaries). A [`RunMerger`] drives several scanners heap-wise and
//! yields their records in `(page, lsn)` order — exactly the order a
//! per-page redo pass wants. The [`MergerDaemon`] uses the same machinery
//! to consolidate adjacent runs of a level into one run a level higher.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::sync::Arc;

use crate::config::{IO_ALIGN, IO_BLOCK_COUNT};
use crate::error::Result;
use crate::log::record::{LogRecord, RecordType};
use crate::log::scanner::{LogScanner, Scanned};
use crate::lsn::{Lsn, PageNum};

use super::assembly::BlockAssembly;
use super::directory::ArchiveDirectory;
use super::index::ProbeResult;

pub struct RunScanner {
    directory: Arc<ArchiveDirectory>,
    run_begin: Lsn,
    run_end: Lsn,
    level: u32,
    first_pid: PageNum,
    /// Exclusive scan bound; 0 scans to the end of the run.
    last_pid: PageNum,
    offset: u64,
    bpos: usize,
    read_size: usize,
    /// Byte size of the data region; reads never cross into the trailing
    /// index blocks.
    data_limit: Option<u64>,
    file: Option<File>,
    buffer: Vec<u8>,
    scanner: LogScanner,
    done: bool,
}

impl RunScanner {
    pub fn new(
        directory: Arc<ArchiveDirectory>,
        run_begin: Lsn,
        run_end: Lsn,
        level: u32,
        first_pid: PageNum,
        last_pid: PageNum,
        offset: u64,
        read_size: usize,
    ) -> Self {
        let read_size = if read_size == 0 {
            directory.block_size()
        } else {
            read_size
        };
        Self {
            directory,
            run_begin,
            run_end,
            level,
            first_pid,
            last_pid,
            offset,
            // A position at the end of the buffer forces the first read.
            bpos: read_size,
            read_size,
            data_limit: None,
            file: None,
            buffer: vec![0u8; read_size + IO_ALIGN],
            scanner: LogScanner::new(read_size),
            done: false,
        }
    }

    pub fn from_probe(
        directory: Arc<ArchiveDirectory>,
        probe: &ProbeResult,
        read_size: usize,
    ) -> Self {
        Self::new(
            directory,
            probe.run_begin,
            probe.run_end,
            probe.level,
            probe.pid_begin,
            probe.pid_end,
            probe.offset,
            read_size,
        )
    }

    pub fn first_pid(&self) -> PageNum {
        self.first_pid
    }

    pub fn last_pid(&self) -> PageNum {
        self.last_pid
    }

    /// The next record of the run, or None once the scan leaves the page
    /// range, meets the terminating skip record, or exhausts the data
    /// region.
    pub fn next(&mut self) -> Result<Option<LogRecord>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let outcome = self.scanner.next_record(
                &self.buffer[..self.read_size],
                &mut self.bpos,
                None,
                None,
            )?;
            match outcome {
                Scanned::Record(record) => {
                    if record.rtype == RecordType::Skip
                        || (self.last_pid != 0 && record.page >= self.last_pid)
                    {
                        self.close();
                        return Ok(None);
                    }
                    return Ok(Some(record));
                }
                Scanned::NeedBlock => {
                    if !self.next_block()? {
                        self.close();
                        return Ok(None);
                    }
                }
                Scanned::Stopped => unreachable!("run scans carry no stop lsn"),
            }
        }
    }

    fn next_block(&mut self) -> Result<bool> {
        if self.file.is_none() {
            let file =
                self.directory
                    .open_for_scan(self.run_begin, self.run_end, self.level)?;
            let (_, data_blocks) = self.directory.index().block_counts(&file)?;
            self.data_limit = Some(data_blocks * self.directory.block_size() as u64);
            self.file = Some(file);
        }
        let limit = self.data_limit.expect("set above");
        if limit == 0 || self.offset >= limit {
            return Ok(false);
        }
        let file = self.file.as_ref().expect("opened above");
        let n = self
            .directory
            .read_block(file, &mut self.buffer, &mut self.offset, self.read_size)?;
        if self.offset == 0 || n == 0 {
            return Ok(false);
        }
        if n < self.read_size {
            // Stale tail from the previous read must not parse as records;
            // the skip terminator normally stops us first, but a truncated
            // final read deserves clean zeros.
            self.buffer[n..self.read_size].fill(0);
        }
        self.bpos = 0;
        Ok(true)
    }

    fn close(&mut self) {
        self.file = None;
        self.done = true;
    }
}

struct MergeEntry {
    page: PageNum,
    lsn: Lsn,
    record: LogRecord,
    scanner: usize,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        (self.page, self.lsn) == (other.page, other.lsn)
    }
}
impl Eq for MergeEntry {}
impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.page, self.lsn).cmp(&(other.page, other.lsn))
    }
}
impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way merge of run scanners in `(page, lsn)` order.
#[derive(Default)]
pub struct RunMerger {
    heap: BinaryHeap<Reverse<MergeEntry>>,
    scanners: Vec<RunScanner>,
}

impl RunMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heap_size(&self) -> usize {
        self.heap.len()
    }

    /// Registers a scanner, advancing it to its first record at or past
    /// `first_pid` (the probed bucket may begin slightly before the
    /// requested page range).
    pub fn add_input(&mut self, mut scanner: RunScanner) -> Result<()> {
        let index = self.scanners.len();
        let first_pid = scanner.first_pid();
        while let Some(record) = scanner.next()? {
            if record.page >= first_pid {
                self.heap.push(Reverse(MergeEntry {
                    page: record.page,
                    lsn: record.lsn,
                    record,
                    scanner: index,
                }));
                break;
            }
        }
        self.scanners.push(scanner);
        Ok(())
    }

    /// The next record across all inputs, in `(page, lsn)` order.
    pub fn next(&mut self) -> Result<Option<LogRecord>> {
        let Some(Reverse(top)) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(record) = self.scanners[top.scanner].next()? {
            self.heap.push(Reverse(MergeEntry {
                page: record.page,
                lsn: record.lsn,
                record,
                scanner: top.scanner,
            }));
        }
        Ok(Some(top.record))
    }
}

/// Consolidates adjacent runs of one level into a single run of the next.
pub struct MergerDaemon {
    directory: Arc<ArchiveDirectory>,
}

impl MergerDaemon {
    pub fn new(directory: Arc<ArchiveDirectory>) -> Self {
        Self { directory }
    }

    /// Merges up to `fanin` adjacent level-`level` runs, starting from the
    /// first LSN not yet covered by level `level + 1`. Returns the number
    /// of runs merged (zero when fewer than two candidates exist).
    pub fn run_sync(&self, level: u32, fanin: usize) -> Result<usize> {
        let stats = self.directory.list_file_stats(Some(level))?;
        if stats.is_empty() {
            return Ok(0);
        }
        let next_stats = self.directory.list_file_stats(Some(level + 1))?;
        let next_lsn = next_stats
            .last()
            .map(|s| s.last_lsn)
            .unwrap_or(stats[0].first_lsn);

        let candidates: Vec<_> = stats
            .iter()
            .filter(|s| s.last_lsn > next_lsn)
            .take(fanin)
            .collect();
        if candidates.len() < 2 {
            tracing::debug!(level, "not enough runs to merge");
            return Ok(0);
        }

        let mut merger = RunMerger::new();
        for stat in &candidates {
            tracing::debug!(
                level,
                first = %stat.first_lsn,
                last = %stat.last_lsn,
                "merging run"
            );
            merger.add_input(RunScanner::new(
                self.directory.clone(),
                stat.first_lsn,
                stat.last_lsn,
                level,
                0,
                0,
                0,
                0,
            ))?;
        }

        let mut assembly = BlockAssembly::new(self.directory.clone(), level + 1, IO_BLOCK_COUNT);
        // All output blocks belong to one run of the next level.
        let run = 0;
        if merger.heap_size() > 0 {
            if !assembly.start(run) {
                return Ok(0);
            }
            while let Some(record) = merger.next()? {
                let bytes = record.encode();
                if !assembly.add(&bytes) {
                    assembly.finish();
                    if !assembly.start(run) {
                        return Ok(0);
                    }
                    assert!(assembly.add(&bytes), "record exceeds block size");
                }
            }
            assembly.finish();
        }
        assembly.shutdown();
        tracing::info!(level, merged = candidates.len(), "level merge complete");
        Ok(candidates.len())
    }
}
