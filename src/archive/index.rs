//! In-memory index over the log archive, persisted as trailing index
//! blocks in each run file.
//!
//! Per level, the index keeps one [`RunInfo`] per run: its LSN boundaries
//! and one entry per page-id bucket pointing at the byte offset where the
//! bucket's records begin. A probe walks levels from the largest runs down,
//! binary-searching each run's entries. One mutex covers everything; run
//! registration is rare and probes are cheap.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ErrorKind, Result};
use crate::lsn::{Lsn, PageNum};
use crate::{bail, errdata};

/// Size of the header of an on-disk index block: entry count and block
/// number.
const INDEX_BLOCK_HEADER: usize = 8;
/// An entry is `{pid: u32, offset: u64}`.
const INDEX_ENTRY_SIZE: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockEntry {
    pub pid: PageNum,
    pub offset: u64,
}

#[derive(Clone, Debug, Default)]
struct RunInfo {
    first_lsn: Lsn,
    /// Equal to the next run's `first_lsn`. Kept redundantly so probes
    /// never have to look past the last finished run.
    last_lsn: Lsn,
    entries: Vec<BlockEntry>,
}

/// One probed run: where a scan of `[pid_begin, pid_end)` should start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeResult {
    pub run_begin: Lsn,
    pub run_end: Lsn,
    pub level: u32,
    pub pid_begin: PageNum,
    pub pid_end: PageNum,
    pub offset: u64,
    pub run_index: usize,
}

pub struct ArchiveIndex {
    block_size: usize,
    bucket_size: u32,
    state: Mutex<IndexState>,
}

#[derive(Default)]
struct IndexState {
    /// Run information per level; level 0 is reserved and stays empty.
    runs: Vec<Vec<RunInfo>>,
    /// Index of the last finished run per level. Runs are appended before
    /// they finish (generation is asynchronous), so the last vector slot is
    /// not necessarily finished.
    last_finished: Vec<isize>,
    max_level: usize,
}

impl IndexState {
    fn ensure_level(&mut self, level: usize) {
        if level >= self.runs.len() {
            self.runs.resize(level + 1, Vec::new());
            self.last_finished.resize(level + 1, -1);
        }
        if level > self.max_level {
            self.max_level = level;
        }
    }
}

impl ArchiveIndex {
    pub fn new(block_size: usize, bucket_size: u32) -> Self {
        assert!(bucket_size > 0);
        Self {
            block_size,
            bucket_size,
            state: Mutex::new(IndexState::default()),
        }
    }

    pub fn bucket_size(&self) -> u32 {
        self.bucket_size
    }

    pub fn max_level(&self) -> u32 {
        self.state.lock().unwrap().max_level as u32
    }

    fn entries_per_block(&self) -> usize {
        // Reserve one page-id slot per block like the on-disk format always
        // has, so the count survives format evolution.
        (self.block_size - INDEX_BLOCK_HEADER - 4) / INDEX_ENTRY_SIZE
    }

    /// Starts bookkeeping for a new (not yet finished) run at `level`.
    pub fn append_new_entry(&self, level: u32) {
        let mut state = self.state.lock().unwrap();
        state.ensure_level(level as usize);
        state.runs[level as usize].push(RunInfo::default());
    }

    /// Registers the bucket entries contributed by one finished data block
    /// of the currently open run at `level`.
    pub fn add_block(&self, buckets: &[(PageNum, u64)], level: u32) {
        if buckets.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.ensure_level(level as usize);
        let run = state.runs[level as usize]
            .last_mut()
            .expect("add_block without append_new_entry");
        for (pid, offset) in buckets {
            debug_assert!(
                run.entries.last().map(|e| e.offset <= *offset).unwrap_or(true),
                "bucket offsets must ascend"
            );
            run.entries.push(BlockEntry {
                pid: *pid,
                offset: *offset,
            });
        }
    }

    /// Marks the next unfinished run at `level` as finished with the given
    /// LSN boundaries, and appends its serialized index blocks to the run
    /// file starting at `offset` (the first block boundary after the data).
    pub fn finish_run(
        &self,
        first: Lsn,
        last: Lsn,
        file: &File,
        offset: u64,
        level: u32,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ensure_level(level as usize);
        debug_assert_eq!(offset as usize % self.block_size, 0);

        let level_ix = level as usize;
        let lf = state.last_finished[level_ix];
        if offset == 0 {
            // Empty run (e.g. from a truncation); nothing to persist.
            return Ok(());
        }
        let next = (lf + 1) as usize;
        if next >= state.runs[level_ix].len() {
            return Err(errdata!("finish_run without a registered run"));
        }
        if lf >= 0 {
            let prev = &state.runs[level_ix][lf as usize];
            debug_assert_eq!(prev.last_lsn, first, "runs must be contiguous");
        }
        state.runs[level_ix][next].first_lsn = first;
        state.runs[level_ix][next].last_lsn = last;
        state.last_finished[level_ix] = next as isize;

        self.serialize_run(&state.runs[level_ix][next], file, offset)
    }

    fn serialize_run(&self, run: &RunInfo, file: &File, mut offset: u64) -> Result<()> {
        let per_block = self.entries_per_block();
        let mut block = vec![0u8; self.block_size];
        let mut remaining = &run.entries[..];
        let mut block_number = 0u32;
        loop {
            let count = remaining.len().min(per_block);
            LittleEndian::write_u32(&mut block[0..4], count as u32);
            LittleEndian::write_u32(&mut block[4..8], block_number);
            let mut pos = INDEX_BLOCK_HEADER;
            for entry in &remaining[..count] {
                LittleEndian::write_u32(&mut block[pos..], entry.pid);
                LittleEndian::write_u64(&mut block[pos + 4..], entry.offset);
                pos += INDEX_ENTRY_SIZE;
            }
            block[pos..].fill(0);
            file.write_all_at(&block, offset)?;
            offset += self.block_size as u64;
            block_number += 1;
            remaining = &remaining[count..];
            if remaining.is_empty() {
                return Ok(());
            }
        }
    }

    /// Number of (index, data) blocks in a run file. The index block count
    /// is recovered from the last block's header: its block number plus
    /// one.
    pub fn block_counts(&self, file: &File) -> Result<(u64, u64)> {
        let fsize = file.metadata()?.len();
        if fsize == 0 {
            return Ok((0, 0));
        }
        if fsize as usize % self.block_size != 0 {
            return Err(errdata!("run file size {fsize} not block aligned"));
        }
        let mut header = [0u8; INDEX_BLOCK_HEADER];
        let read = file.read_at(&mut header, fsize - self.block_size as u64)?;
        if read < INDEX_BLOCK_HEADER {
            bail!(ErrorKind::ShortIo);
        }
        let index_blocks = LittleEndian::read_u32(&header[4..8]) as u64 + 1;
        let total = fsize / self.block_size as u64;
        if index_blocks > total {
            return Err(errdata!("index block count {index_blocks} exceeds file"));
        }
        Ok((index_blocks, total - index_blocks))
    }

    /// Loads a finished run's index back from its file. Used at startup.
    pub fn load_run_info(
        &self,
        file: &File,
        first: Lsn,
        last: Lsn,
        level: u32,
    ) -> Result<()> {
        let (index_blocks, data_blocks) = self.block_counts(file)?;
        let mut run = RunInfo {
            first_lsn: first,
            last_lsn: last,
            entries: Vec::new(),
        };
        let mut offset = data_blocks * self.block_size as u64;
        let mut block = vec![0u8; self.block_size];
        for _ in 0..index_blocks {
            let read = file.read_at(&mut block, offset)?;
            if read < self.block_size {
                bail!(ErrorKind::ShortIo);
            }
            let entries = LittleEndian::read_u32(&block[0..4]) as usize;
            let mut pos = INDEX_BLOCK_HEADER;
            for _ in 0..entries {
                run.entries.push(BlockEntry {
                    pid: LittleEndian::read_u32(&block[pos..]),
                    offset: LittleEndian::read_u64(&block[pos + 4..]),
                });
                pos += INDEX_ENTRY_SIZE;
            }
            offset += self.block_size as u64;
        }

        let mut state = self.state.lock().unwrap();
        state.ensure_level(level as usize);
        state.runs[level as usize].push(run);
        state.last_finished[level as usize] = state.runs[level as usize].len() as isize - 1;
        Ok(())
    }

    /// Sorts loaded runs by LSN. Called once after startup enumeration.
    pub fn init(&self) {
        let mut state = self.state.lock().unwrap();
        for level in state.runs.iter_mut() {
            level.sort_by_key(|run| run.first_lsn);
        }
    }

    /// End LSN of the last finished run at `level`; the point where the
    /// next run of that level must begin.
    pub fn last_lsn(&self, level: u32) -> Lsn {
        let state = self.state.lock().unwrap();
        self.last_lsn_locked(&state, level)
    }

    fn last_lsn_locked(&self, state: &IndexState, level: u32) -> Lsn {
        let level = level as usize;
        if level > state.max_level || level >= state.runs.len() {
            return Lsn::NULL;
        }
        let lf = state.last_finished[level];
        if lf < 0 {
            if level == 0 {
                return Lsn::new(1, 0);
            }
            return self.first_lsn_locked(state, level as u32 - 1);
        }
        state.runs[level][lf as usize].last_lsn
    }

    pub fn first_lsn(&self, level: u32) -> Lsn {
        let state = self.state.lock().unwrap();
        self.first_lsn_locked(&state, level)
    }

    fn first_lsn_locked(&self, state: &IndexState, level: u32) -> Lsn {
        if level <= 1 {
            return Lsn::new(1, 0);
        }
        let ix = level as usize;
        if ix >= state.runs.len() || state.last_finished[ix] < 0 {
            return self.first_lsn_locked(state, level - 1);
        }
        state.runs[ix][0].first_lsn
    }

    /// Collects, per level from the top down, the runs whose LSN range lies
    /// past `start_lsn`, each with the offset of the bucket covering
    /// `start_pid`. Lower levels pick up where the level above left off, so
    /// together the probes cover `[start_lsn, archive end)` exactly once.
    pub fn probe(
        &self,
        start_pid: PageNum,
        end_pid: PageNum,
        mut start_lsn: Lsn,
    ) -> Vec<ProbeResult> {
        let state = self.state.lock().unwrap();
        let mut probes = Vec::new();
        let mut level = state.max_level as u32;
        while level > 0 {
            let level_ix = level as usize;
            let lf = state.last_finished[level_ix];
            if lf >= 0 {
                let runs = &state.runs[level_ix];
                let mut index = Self::find_run(runs, lf, start_lsn);
                let mut last_end = None;
                while index as isize <= lf {
                    let run = &runs[index];
                    if !run.entries.is_empty() {
                        let offset = Self::probe_in_run(run, start_pid);
                        probes.push(ProbeResult {
                            run_begin: run.first_lsn,
                            run_end: run.last_lsn,
                            level,
                            pid_begin: start_pid,
                            pid_end: end_pid,
                            offset,
                            run_index: index,
                        });
                        last_end = Some(run.last_lsn);
                    }
                    index += 1;
                }
                // Continue coverage below this level's high-water mark.
                if let Some(end) = last_end {
                    start_lsn = end;
                }
            }
            level -= 1;
        }
        probes
    }

    /// First run at `level` whose range reaches past `lsn`. Linear scan
    /// from the most recent run backwards: probes overwhelmingly target
    /// the tail of the archive.
    fn find_run(runs: &[RunInfo], last_finished: isize, lsn: Lsn) -> usize {
        if lsn.is_null() {
            return 0;
        }
        let lf = last_finished as usize;
        if lsn >= runs[lf].last_lsn {
            return lf + 1;
        }
        let mut result = lf;
        while result > 0 && runs[result].first_lsn > lsn {
            result -= 1;
        }
        // Skip over empty runs (truncation leftovers).
        while result <= lf && runs[result].entries.is_empty() {
            result += 1;
        }
        result
    }

    /// Byte offset of the bucket covering `pid` in `run`.
    fn probe_in_run(run: &RunInfo, pid: PageNum) -> u64 {
        if pid == 0 {
            return 0;
        }
        let entry = Self::find_entry(&run.entries, pid);
        if entry == 0 && run.entries[0].pid >= pid {
            return 0;
        }
        run.entries[entry].offset
    }

    /// Renders the run table for debugging: every finished run per level
    /// with its LSN range and bucket entries (pid, offset, and the delta
    /// to the previous offset, i.e. the bucket's byte size).
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;
        let state = self.state.lock().unwrap();
        let mut out = String::new();
        for (level, runs) in state.runs.iter().enumerate() {
            for (i, run) in runs.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "level {level} run {i} [{}..{}) entries {}",
                    run.first_lsn,
                    run.last_lsn,
                    run.entries.len(),
                );
                let mut prev = 0u64;
                for (j, entry) in run.entries.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "  entry {j} pid {} offset {} delta {}",
                        entry.pid,
                        entry.offset,
                        entry.offset - prev,
                    );
                    prev = entry.offset;
                }
            }
        }
        out
    }

    /// Binary search for the greatest entry with `pid <=` the probe,
    /// stepping back over duplicate page ids so no record is skipped.
    fn find_entry(entries: &[BlockEntry], pid: PageNum) -> usize {
        debug_assert!(!entries.is_empty());
        let mut low = 0usize;
        let mut high = entries.len();
        while low < high {
            let mid = (low + high) / 2;
            if entries[mid].pid <= pid {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        let mut i = low.saturating_sub(1);
        while i > 0 && entries[i].pid == pid {
            i -= 1;
        }
        i
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    const BLOCK: usize = 4096;

    fn index() -> ArchiveIndex {
        ArchiveIndex::new(BLOCK, 8)
    }

    fn finish(ix: &ArchiveIndex, file: &File, first: Lsn, last: Lsn, offset: u64) {
        ix.finish_run(first, last, file, offset, 1).unwrap();
    }

    #[test]
    fn find_entry_returns_preceding_bucket() {
        let entries = vec![
            BlockEntry { pid: 0, offset: 0 },
            BlockEntry { pid: 8, offset: 100 },
            BlockEntry { pid: 16, offset: 200 },
        ];
        assert_eq!(ArchiveIndex::find_entry(&entries, 0), 0);
        assert_eq!(ArchiveIndex::find_entry(&entries, 7), 0);
        assert_eq!(ArchiveIndex::find_entry(&entries, 8), 1);
        assert_eq!(ArchiveIndex::find_entry(&entries, 12), 1);
        assert_eq!(ArchiveIndex::find_entry(&entries, 99), 2);
    }

    #[test]
    fn serialize_and_load_roundtrip() {
        let ix = index();
        ix.append_new_entry(1);
        let buckets: Vec<(PageNum, u64)> = (0..500).map(|i| (i * 8, i as u64 * 1000)).collect();
        ix.add_block(&buckets, 1);

        let file = tempfile().unwrap();
        // Pretend one data block of zeros precedes the index.
        file.set_len(BLOCK as u64).unwrap();
        finish(&ix, &file, Lsn::new(1, 0), Lsn::new(1, 90000), BLOCK as u64);

        let loaded = index();
        loaded
            .load_run_info(&file, Lsn::new(1, 0), Lsn::new(1, 90000), 1)
            .unwrap();
        let probes = loaded.probe(100, 200, Lsn::NULL);
        assert_eq!(probes.len(), 1);
        // Bucket for pid 100 starts at entry pid 96 -> offset 12 * 1000.
        assert_eq!(probes[0].offset, 12_000);
        assert_eq!(probes[0].run_begin, Lsn::new(1, 0));
        assert_eq!(probes[0].run_end, Lsn::new(1, 90000));
    }

    #[test]
    fn dump_lists_runs_and_bucket_deltas() {
        let ix = index();
        ix.append_new_entry(1);
        ix.add_block(&[(0, 0), (8, 1000), (16, 2500)], 1);
        let file = tempfile().unwrap();
        file.set_len(BLOCK as u64).unwrap();
        finish(&ix, &file, Lsn::new(1, 0), Lsn::new(1, 4000), BLOCK as u64);

        let dump = ix.dump();
        assert!(dump.contains("level 1 run 0 [1.0..1.4000) entries 3"));
        assert!(dump.contains("entry 1 pid 8 offset 1000 delta 1000"));
        assert!(dump.contains("entry 2 pid 16 offset 2500 delta 1500"));
    }

    #[test]
    fn multi_block_index_recovers_block_count() {
        let ix = index();
        ix.append_new_entry(1);
        // More entries than fit in one 4 KiB index block (340 per block).
        let buckets: Vec<(PageNum, u64)> = (0..1000).map(|i| (i * 8, i as u64)).collect();
        ix.add_block(&buckets, 1);
        let file = tempfile().unwrap();
        file.set_len(BLOCK as u64).unwrap();
        finish(&ix, &file, Lsn::new(1, 0), Lsn::new(1, 5000), BLOCK as u64);

        let (index_blocks, data_blocks) = ix.block_counts(&file).unwrap();
        assert_eq!(data_blocks, 1);
        assert!(index_blocks >= 3, "expected several index blocks");

        let loaded = index();
        loaded
            .load_run_info(&file, Lsn::new(1, 0), Lsn::new(1, 5000), 1)
            .unwrap();
        let probes = loaded.probe(7999, 8000, Lsn::NULL);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].offset, 999);
    }

    #[test]
    fn probe_covers_levels_without_overlap() {
        let ix = index();
        let file = tempfile().unwrap();
        file.set_len(BLOCK as u64).unwrap();

        // Two runs at level 2 covering (1,0)..(1,2000), then one at level 1
        // continuing to (1,3000).
        ix.append_new_entry(2);
        ix.add_block(&[(0, 0)], 2);
        ix.finish_run(Lsn::new(1, 0), Lsn::new(1, 1000), &file, BLOCK as u64, 2)
            .unwrap();
        ix.append_new_entry(2);
        ix.add_block(&[(0, 0)], 2);
        ix.finish_run(Lsn::new(1, 1000), Lsn::new(1, 2000), &file, BLOCK as u64, 2)
            .unwrap();
        ix.append_new_entry(1);
        ix.add_block(&[(0, 0)], 1);
        ix.finish_run(Lsn::new(1, 2000), Lsn::new(1, 3000), &file, BLOCK as u64, 1)
            .unwrap();

        let probes = ix.probe(0, 100, Lsn::NULL);
        assert_eq!(probes.len(), 3);
        assert_eq!(probes[0].level, 2);
        assert_eq!(probes[1].level, 2);
        assert_eq!(probes[2].level, 1);
        // Coverage is contiguous: each probe starts where the previous
        // ended.
        assert_eq!(probes[0].run_end, probes[1].run_begin);
        assert_eq!(probes[1].run_end, probes[2].run_begin);
    }

    #[test]
    fn probe_from_midpoint_skips_older_runs() {
        let ix = index();
        let file = tempfile().unwrap();
        file.set_len(BLOCK as u64).unwrap();
        for i in 0..4u32 {
            ix.append_new_entry(1);
            ix.add_block(&[(0, 0)], 1);
            ix.finish_run(
                Lsn::new(1, i * 1000),
                Lsn::new(1, (i + 1) * 1000),
                &file,
                BLOCK as u64,
                1,
            )
            .unwrap();
        }
        let probes = ix.probe(0, 100, Lsn::new(1, 2500));
        // Only the run containing 2500 and the one after it qualify.
        assert_eq!(probes.len(), 2);
        assert_eq!(probes[0].run_begin, Lsn::new(1, 2000));
        assert_eq!(probes[1].run_begin, Lsn::new(1, 3000));
    }
}
