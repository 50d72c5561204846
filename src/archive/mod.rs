//! The log archiver: turns the recovery log into sorted, indexed runs.
//!
//! Pipeline: reader thread → read ring → [`consumer::LogConsumer`] →
//! [`heap::ArchiverHeap`] (replacement) → [`assembly::BlockAssembly`]
//! (selection) → write ring → writer thread → [`directory::ArchiveDirectory`].
//! The archiver thread itself runs activation cycles: each activation names
//! an end LSN, and the cycle inserts every log record up to that LSN into
//! the sort heap. Selection drains the heap into blocks only when the heap
//! is full (or at shutdown/flush), which keeps runs as large as the sort
//! workspace allows and makes each run cover a fixed LSN range of the log.

pub mod assembly;
pub mod consumer;
pub mod control;
pub mod directory;
pub mod heap;
pub mod index;
pub mod reader;
pub mod ring;
pub mod scanner;
pub mod writer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{ArchiverConfig, IO_BLOCK_COUNT};
use crate::error::Result;
use crate::lsn::{AtomicLsn, Lsn};
use crate::errfatal;

use assembly::BlockAssembly;
use consumer::LogConsumer;
use control::ArchiverControl;
use directory::ArchiveDirectory;
use heap::ArchiverHeap;
use scanner::{MergerDaemon, RunMerger, RunScanner};

pub use index::ProbeResult;

/// Handle to a running archiver. Dropping it shuts the pipeline down
/// cleanly: the current activation finishes, the heap drains into a final
/// run, and all four background threads join.
pub struct LogArchiver {
    directory: Arc<ArchiveDirectory>,
    control: Arc<ArchiverControl>,
    shutdown: Arc<AtomicBool>,
    flush_req: Arc<AtomicLsn>,
    next_consumed: Arc<AtomicLsn>,
    eager: bool,
    handle: Option<JoinHandle<()>>,
}

impl LogArchiver {
    pub fn new(config: ArchiverConfig) -> Result<Self> {
        let directory = ArchiveDirectory::new(&config)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let control = Arc::new(ArchiverControl::new(shutdown.clone()));
        let flush_req = Arc::new(AtomicLsn::new(Lsn::NULL));
        let start_lsn = directory.start_lsn();
        let next_consumed = Arc::new(AtomicLsn::new(start_lsn));
        let eager = config.eager;

        let mut daemon = ArchiverDaemon {
            consumer: LogConsumer::new(
                directory.clone(),
                start_lsn,
                config.block_size,
                IO_BLOCK_COUNT,
            ),
            heap: ArchiverHeap::new(config.workspace_size),
            assembly: BlockAssembly::new(directory.clone(), 1, IO_BLOCK_COUNT),
            directory: directory.clone(),
            control: control.clone(),
            shutdown: shutdown.clone(),
            flush_req: flush_req.clone(),
            next_consumed: next_consumed.clone(),
            next_act_lsn: start_lsn,
            eager,
            read_whole_blocks: config.read_whole_blocks,
            block_size: config.block_size,
            grace_period: Duration::from_micros(config.slow_log_grace_period_us),
        };
        let handle = std::thread::Builder::new()
            .name("log-archiver".into())
            .spawn(move || {
                if let Err(e) = daemon.run() {
                    tracing::error!(error = %e, "log archiver failed");
                }
            })
            .expect("spawning archiver thread");

        Ok(Self {
            directory,
            control,
            shutdown,
            flush_req,
            next_consumed,
            eager,
            handle: Some(handle),
        })
    }

    pub fn directory(&self) -> &Arc<ArchiveDirectory> {
        &self.directory
    }

    /// LSN up to which the log has been consumed into the sort heap. Not
    /// necessarily persistent yet; see [`LogArchiver::request_flush_sync`].
    pub fn next_consumed_lsn(&self) -> Lsn {
        self.next_consumed.load()
    }

    /// Wakes the archiver to consume the log up to `lsn` (or the durable
    /// log end when None). A no-op in eager mode, which polls on its own.
    pub fn activate(&self, wait: bool, lsn: Option<Lsn>) {
        if self.eager {
            return;
        }
        let lsn = lsn.unwrap_or_else(|| self.directory.durable_log_end());
        self.control.activate(wait, lsn);
    }

    /// Requests that everything up to `lsn` be made persistent in the
    /// archive. Returns false when another flush request is in flight.
    pub fn request_flush_async(&self, lsn: Lsn) -> bool {
        if lsn.is_null() {
            return false;
        }
        if !self.flush_req.load().is_null() {
            return false;
        }
        self.flush_req.store(lsn);
        // Another requester may have raced us; whoever's value stuck wins.
        self.flush_req.load() == lsn
    }

    /// Blocks until the archive durably covers `lsn`.
    pub fn request_flush_sync(&self, lsn: Lsn) {
        tracing::debug!(lsn = %lsn, "requesting archive flush");
        if !self.eager {
            self.activate(true, Some(lsn));
        }
        while !self.request_flush_async(lsn) {
            std::thread::sleep(Duration::from_millis(1));
        }
        // Keep nudging the archiver: the request may have landed after it
        // finished the activation that was meant to carry it.
        while !self.flush_req.load().is_null() {
            if !self.eager {
                self.control.activate(true, lsn);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Synchronously archives the log up to `lsn`, including the run
    /// rename. Spins in 10 ms steps.
    pub fn archive_until_lsn(&self, lsn: Lsn) {
        assert!(lsn.off > 0, "archiver cannot target the start of a partition");
        while self.next_consumed.load() < lsn {
            self.activate(true, Some(lsn));
            std::thread::sleep(Duration::from_millis(10));
        }
        if self.directory.last_lsn() < lsn {
            self.request_flush_sync(lsn);
        }
    }

    /// Opens a merged scan over `[start_pid, end_pid)` from `start_lsn`.
    /// Returns None when no archived run intersects the range.
    pub fn open_scan(
        &self,
        start_pid: u32,
        end_pid: u32,
        start_lsn: Lsn,
    ) -> Result<Option<RunMerger>> {
        let probes = self.directory.index().probe(start_pid, end_pid, start_lsn);
        if probes.is_empty() {
            return Ok(None);
        }
        let mut merger = RunMerger::new();
        for probe in &probes {
            merger.add_input(RunScanner::from_probe(self.directory.clone(), probe, 0))?;
        }
        Ok(Some(merger))
    }

    /// Runs one synchronous level merge; see [`MergerDaemon`].
    pub fn merge_level(&self, level: u32, fanin: usize) -> Result<usize> {
        MergerDaemon::new(self.directory.clone()).run_sync(level, fanin)
    }

    /// Stops the pipeline. The current cycle is not interrupted: the heap
    /// drains into a final run before the threads exit.
    pub fn shutdown(&mut self) {
        tracing::info!("log archiver shutting down");
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LogArchiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the archiver thread.
struct ArchiverDaemon {
    consumer: LogConsumer,
    heap: ArchiverHeap,
    assembly: BlockAssembly,
    directory: Arc<ArchiveDirectory>,
    control: Arc<ArchiverControl>,
    shutdown: Arc<AtomicBool>,
    flush_req: Arc<AtomicLsn>,
    next_consumed: Arc<AtomicLsn>,
    next_act_lsn: Lsn,
    eager: bool,
    read_whole_blocks: bool,
    block_size: usize,
    grace_period: Duration,
}

impl ArchiverDaemon {
    fn run(&mut self) -> Result<()> {
        loop {
            if !self.wait_for_activation() {
                break;
            }
            let log_too_slow = self.is_log_too_slow();

            if self.process_flush_request()? {
                continue;
            }
            let Some(end_lsn) = self.activation_window(log_too_slow) else {
                self.control.work_done();
                continue;
            };

            tracing::debug!(from = %self.next_act_lsn, to = %end_lsn, "archiver activated");
            self.consumer
                .open(end_lsn, self.read_whole_blocks && !log_too_slow);
            self.replacement()?;

            // Selection is not invoked here: keeping the heap full between
            // cycles is what produces large runs. An activation up to X
            // only promises X is in the heap, not on disk.
            self.next_act_lsn = end_lsn.max(self.next_consumed.load());
            if !self.eager {
                self.control.work_done();
            }
        }

        // Drain the heap so the last run reaches disk.
        tracing::debug!("archiver exiting; final selection pass");
        while self.selection()? {}
        debug_assert_eq!(self.heap.size(), 0);
        self.consumer.shutdown();
        Ok(())
    }

    /// In eager mode, poll the durable log end; otherwise park on the
    /// activation condition. False means shutdown.
    fn wait_for_activation(&mut self) -> bool {
        if self.eager {
            loop {
                let new_end = self.directory.durable_log_end();
                if self.shutdown.load(Ordering::Acquire) {
                    return false;
                }
                if !self.flush_req.load().is_null() {
                    return true;
                }
                if new_end != self.control.end_lsn() && new_end.off != 0 {
                    // A durable end at offset zero means the partition file
                    // is not created yet; reading it would trip the reader.
                    self.control.advance_end_lsn(new_end);
                    return true;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        } else {
            if self.control.wait_for_activation().is_none() {
                return false;
            }
            !self.shutdown.load(Ordering::Acquire)
        }
    }

    /// With eager archiving, a window smaller than one block wastes I/O
    /// bandwidth. Sleep through the grace period; if the log still has not
    /// produced a block's worth (and has not halted), skip this activation.
    fn is_log_too_slow(&self) -> bool {
        if !self.eager {
            return false;
        }
        let small = |end: Lsn, next: Lsn, min: u32| {
            (end.part == next.part && end.off.saturating_sub(next.off) < min)
                || (end.part == next.part + 1 && end.off < min)
        };
        let min = self.block_size as u32;
        if !small(self.control.end_lsn(), self.next_act_lsn, min) {
            return false;
        }
        std::thread::sleep(self.grace_period);
        let halted = self.control.end_lsn() == self.directory.durable_log_end();
        if !small(self.control.end_lsn(), self.next_act_lsn, min) && !halted {
            return false;
        }
        tracing::debug!("log growing too slowly; small activation window");
        true
    }

    /// Handles a pending flush request. Returns true when the request was
    /// fully processed (heap drained, run closed); false lets the normal
    /// activation path run (possibly to consume up to the requested LSN
    /// first).
    fn process_flush_request(&mut self) -> Result<bool> {
        let req = self.flush_req.load();
        if req.is_null() {
            return Ok(false);
        }
        tracing::debug!(lsn = %req, "processing archive flush request");
        if self.consumer.next_lsn() < req {
            // Not in the heap yet: do another consumption round first.
            self.control.advance_end_lsn(req);
            return Ok(false);
        }
        while self.selection()? {}
        debug_assert_eq!(self.heap.size(), 0);
        self.assembly.wait_until_drained();
        self.directory.close_current_run(req, 1)?;
        self.assembly.reset_writer();
        self.flush_req.store(Lsn::NULL);
        tracing::debug!(lsn = %req, "archive flush complete");
        Ok(true)
    }

    /// The effective end LSN of this activation, or None when the window
    /// is empty (activation with `end == next_act_lsn` is a no-op).
    fn activation_window(&self, log_too_slow: bool) -> Option<Lsn> {
        let end_lsn = self.control.end_lsn();
        if self.flush_req.load() == end_lsn {
            return (end_lsn > self.next_act_lsn).then_some(end_lsn);
        }
        if log_too_slow && end_lsn == self.directory.durable_log_end() {
            // The log halted entirely; accept the small window rather than
            // keeping the tail unarchived forever.
            return (end_lsn > self.next_act_lsn).then_some(end_lsn);
        }
        if self.eager && self.read_whole_blocks && !log_too_slow {
            // Keep activation windows at block boundaries to better use
            // read bandwidth; the remainder rides in the next window.
            let rounded = Lsn::new(
                end_lsn.part,
                (end_lsn.off / self.block_size as u32) * self.block_size as u32,
            );
            if rounded <= self.next_act_lsn || rounded.off == 0 {
                return None;
            }
            return Some(rounded);
        }
        (!end_lsn.is_null() && end_lsn > self.next_act_lsn).then_some(end_lsn)
    }

    /// Replacement: feed every record of the activation window into the
    /// heap, invoking selection whenever the workspace refuses.
    fn replacement(&mut self) -> Result<()> {
        loop {
            match self.consumer.next()? {
                Some(record) => {
                    if !record.redo {
                        continue;
                    }
                    let duplicate = record.is_multi_page();
                    while !self.heap.push(&record, duplicate) {
                        if self.heap.size() == 0 {
                            return Err(errfatal!(
                                "log record of {} bytes exceeds the sort workspace",
                                record.len()
                            ));
                        }
                        self.selection()?;
                    }
                }
                None => {
                    // The consumer can overshoot the requested end when it
                    // crosses into a new partition.
                    let next = self.consumer.next_lsn();
                    self.control.advance_end_lsn(next);
                    self.next_consumed.store(next);
                    return Ok(());
                }
            }
        }
    }

    /// Selection: pop records of the heap's current minimum run into one
    /// output block. Returns false when the heap had nothing to give.
    fn selection(&mut self) -> Result<bool> {
        if self.heap.size() == 0 {
            return Ok(false);
        }
        let run = self.heap.top_run();
        if !self.assembly.start(run) {
            return Ok(false);
        }
        while self.heap.size() > 0 && self.heap.top_run() == run {
            if self.assembly.add(self.heap.top()) {
                self.heap.pop();
            } else {
                break;
            }
        }
        self.assembly.finish();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::{LogRecord, RecordType, HEADER_SIZE};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const BLOCK: usize = 1024 * 1024;

    fn config(dir: &TempDir) -> ArchiverConfig {
        ArchiverConfig {
            archive_dir: dir.path().join("archive"),
            log_dir: dir.path().join("log"),
            workspace_size: 1024 * 1024,
            block_size: BLOCK,
            bucket_size: 128,
            eager: false,
            ..Default::default()
        }
    }

    /// Appends `records` to partition 1 of the log (assigning contiguous
    /// LSNs from `start`), padding the file to a block multiple. Returns
    /// the LSN after the last record.
    fn extend_log(log_dir: &Path, start: Lsn, records: &[LogRecord]) -> Lsn {
        fs::create_dir_all(log_dir).unwrap();
        let path = log_dir.join(format!("log.{}", start.part));
        let mut bytes = if path.exists() {
            fs::read(&path).unwrap()
        } else {
            Vec::new()
        };
        bytes.truncate(start.off as usize);
        let mut lsn = start;
        for template in records {
            let mut record = template.clone();
            record.lsn = lsn;
            bytes.extend_from_slice(&record.encode());
            lsn = lsn.advance(record.len() as u32);
        }
        let end = lsn;
        bytes.resize(bytes.len().div_ceil(BLOCK) * BLOCK, 0);
        fs::write(&path, &bytes).unwrap();
        end
    }

    fn page_update(page: u32, payload: usize) -> LogRecord {
        LogRecord::new(RecordType::PageUpdate, page, Lsn::NULL, vec![0xEE; payload])
    }

    /// Scenario: a small synthetic log becomes exactly two sorted runs, and
    /// a probe-driven merge yields every record of one page in order.
    #[test]
    fn archives_small_log_into_two_runs() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let mut rng = StdRng::seed_from_u64(7);
        let records: Vec<LogRecord> = (0..10_000)
            .map(|_| page_update(rng.gen_range(0..10_000), 128 - HEADER_SIZE))
            .collect();
        let end = extend_log(&config.log_dir, Lsn::new(1, 0), &records);
        assert_eq!(end, Lsn::new(1, 1_280_000));

        let mut archiver = LogArchiver::new(config).unwrap();
        archiver.archive_until_lsn(end);

        let stats = archiver.directory().list_file_stats(Some(1)).unwrap();
        assert_eq!(stats.len(), 2, "workspace bounds each run");
        assert_eq!(stats[0].first_lsn, Lsn::new(1, 0));
        assert_eq!(stats[0].last_lsn, stats[1].first_lsn);
        assert_eq!(stats[1].last_lsn, end);

        // Every record of page 5000, across both runs, in LSN order.
        let expected: Vec<Lsn> = {
            let mut lsn = Lsn::new(1, 0);
            let mut out = Vec::new();
            for r in &records {
                if r.page == 5000 {
                    out.push(lsn);
                }
                lsn = lsn.advance(r.len() as u32);
            }
            out
        };
        let mut merger = archiver
            .open_scan(5000, 5001, Lsn::new(1, 0))
            .unwrap()
            .expect("runs intersect the probe");
        let mut got = Vec::new();
        while let Some(record) = merger.next().unwrap() {
            assert_eq!(record.page, 5000);
            got.push(record.lsn);
        }
        assert_eq!(got, expected);

        // A full-range scan replays all 10k records in (page, lsn) order.
        let mut merger = archiver
            .open_scan(0, u32::MAX, Lsn::new(1, 0))
            .unwrap()
            .unwrap();
        let mut count = 0;
        let mut prev = (0u32, Lsn::NULL);
        while let Some(record) = merger.next().unwrap() {
            let key = (record.page, record.lsn);
            assert!(prev <= key, "merge order violated: {prev:?} then {key:?}");
            prev = key;
            count += 1;
        }
        assert_eq!(count, 10_000);
        archiver.shutdown();
    }

    /// Scenario: a multi-page record is archived under both of its page
    /// ids, with the same LSN.
    #[test]
    fn multi_page_record_is_found_under_both_pages() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let mut records: Vec<LogRecord> = (0..100).map(|i| page_update(i * 7 % 300, 80)).collect();
        let mut multi = page_update(100, 80);
        multi.page2 = 200;
        records.push(multi);
        let end = extend_log(&config.log_dir, Lsn::new(1, 0), &records);
        let multi_lsn = Lsn::new(1, end.off - 128);

        let mut archiver = LogArchiver::new(config).unwrap();
        archiver.archive_until_lsn(end);

        let mut found_under_100 = None;
        let mut merger = archiver.open_scan(99, 101, Lsn::new(1, 0)).unwrap().unwrap();
        while let Some(record) = merger.next().unwrap() {
            if record.lsn == multi_lsn {
                found_under_100 = Some(record);
            }
        }
        let mut found_under_200 = None;
        let mut merger = archiver.open_scan(199, 201, Lsn::new(1, 0)).unwrap().unwrap();
        while let Some(record) = merger.next().unwrap() {
            if record.lsn == multi_lsn {
                found_under_200 = Some(record);
            }
        }
        let under_100 = found_under_100.expect("record under page 100");
        let under_200 = found_under_200.expect("record under page 200");
        assert_eq!(under_100.lsn, under_200.lsn);
        assert_eq!(under_100.page, 100);
        assert_eq!(under_200.page, 200);
        archiver.shutdown();
    }

    /// Scenario: four level-1 runs merge into a single level-2 run whose
    /// boundaries and record order equal the merge-sort of the inputs.
    #[test]
    fn merge_fanin_four_produces_one_level_two_run() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let mut rng = StdRng::seed_from_u64(11);

        let mut archiver: Option<LogArchiver> = None;
        let mut lsn = Lsn::new(1, 0);
        let mut total = 0usize;
        for _ in 0..4 {
            let chunk: Vec<LogRecord> = (0..2000)
                .map(|_| page_update(rng.gen_range(0..5_000), 128 - HEADER_SIZE))
                .collect();
            total += chunk.len();
            lsn = extend_log(&config.log_dir, lsn, &chunk);
            let archiver = archiver.get_or_insert_with(|| {
                LogArchiver::new(config.clone()).unwrap()
            });
            // Each synchronous flush closes one run.
            archiver.archive_until_lsn(lsn);
        }
        let mut archiver = archiver.unwrap();
        assert_eq!(
            archiver.directory().list_file_stats(Some(1)).unwrap().len(),
            4
        );

        assert_eq!(archiver.merge_level(1, 4).unwrap(), 4);

        let stats = archiver.directory().list_file_stats(Some(2)).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].first_lsn, Lsn::new(1, 0));
        assert_eq!(stats[0].last_lsn, lsn);

        // The merged run replays everything in (page, lsn) order.
        let mut scanner = RunScanner::new(
            archiver.directory().clone(),
            stats[0].first_lsn,
            stats[0].last_lsn,
            2,
            0,
            0,
            0,
            0,
        );
        let mut count = 0;
        let mut prev = (0u32, Lsn::NULL);
        while let Some(record) = scanner.next().unwrap() {
            let key = (record.page, record.lsn);
            assert!(prev <= key);
            prev = key;
            count += 1;
        }
        assert_eq!(count, total);

        // Probes now cover everything from the level-2 run alone.
        let probes = archiver
            .directory()
            .index()
            .probe(0, u32::MAX, Lsn::NULL);
        assert!(probes.iter().all(|p| p.level == 2));
        archiver.shutdown();
    }

    /// A flush request whose LSN is already consumed returns after a bare
    /// heap drain.
    #[test]
    fn flush_request_below_consumed_returns_quickly() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let records: Vec<LogRecord> = (0..100).map(|i| page_update(i, 80)).collect();
        let end = extend_log(&config.log_dir, Lsn::new(1, 0), &records);

        let mut archiver = LogArchiver::new(config).unwrap();
        archiver.archive_until_lsn(end);
        // Everything is already consumed and flushed; a second flush for an
        // older LSN must come back promptly.
        let early = Lsn::new(1, 128);
        archiver.request_flush_sync(early);
        assert!(archiver.directory().last_lsn() >= early);
        archiver.shutdown();
    }

    /// Shutdown mid-pipeline persists whatever was consumed: the final run
    /// is closed by the drain pass.
    #[test]
    fn shutdown_drains_heap_into_final_run() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let records: Vec<LogRecord> = (0..500).map(|i| page_update(i % 50, 80)).collect();
        let end = extend_log(&config.log_dir, Lsn::new(1, 0), &records);

        let mut archiver = LogArchiver::new(config).unwrap();
        archiver.activate(true, Some(end));
        // Wait for consumption without forcing a flush.
        while archiver.next_consumed_lsn() < end {
            std::thread::sleep(Duration::from_millis(5));
        }
        archiver.shutdown();

        let stats = archiver.directory().list_file_stats(Some(1)).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].first_lsn, Lsn::new(1, 0));
        assert_eq!(stats[0].last_lsn, end);
    }
}
