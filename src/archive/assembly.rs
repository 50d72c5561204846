//! Packs sorted log records into output blocks and indexes them.
//!
//! Selection feeds records one at a time; the assembly copies them into a
//! block-sized buffer behind a small in-memory header `{last_lsn, end,
//! run}` and publishes full blocks to the ring of its [`writer`] thread.
//! The header never reaches disk: the writer reads it to steer run files
//! and strips it before appending. For each block, the assembly also
//! collects one index entry per page-id bucket touched, handed to the
//! archive index when the block is finished.
//!
//! [`writer`]: super::writer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::log::record::{LogRecord, HEADER_SIZE};
use crate::lsn::{Lsn, PageNum, RunNumber};

use super::directory::ArchiveDirectory;
use super::ring::RingBuffer;
use super::writer::WriterThread;

/// In-memory block header: `{lsn: part u32 + off u32, end: u32, run: u32}`.
pub const BLOCK_HEADER_SIZE: usize = 16;

pub fn write_block_header(block: &mut [u8], lsn: Lsn, end: u32, run: RunNumber) {
    LittleEndian::write_u32(&mut block[0..4], lsn.part);
    LittleEndian::write_u32(&mut block[4..8], lsn.off);
    LittleEndian::write_u32(&mut block[8..12], end);
    LittleEndian::write_u32(&mut block[12..16], run);
}

pub fn block_lsn(block: &[u8]) -> Lsn {
    Lsn::new(
        LittleEndian::read_u32(&block[0..4]),
        LittleEndian::read_u32(&block[4..8]),
    )
}

pub fn block_end(block: &[u8]) -> usize {
    LittleEndian::read_u32(&block[8..12]) as usize
}

pub fn block_run(block: &[u8]) -> RunNumber {
    LittleEndian::read_u32(&block[12..16])
}

pub struct BlockAssembly {
    directory: Arc<ArchiveDirectory>,
    ring: Arc<RingBuffer>,
    writer: Option<JoinHandle<()>>,
    writer_reset: Arc<AtomicBool>,
    level: u32,
    block_size: usize,
    bucket_size: u32,

    dest: Option<Box<[u8]>>,
    pos: usize,
    /// Byte position within the run's data stream (headers excluded).
    fpos: u64,
    max_lsn_in_block: Lsn,
    max_lsn_length: u32,
    last_run: Option<RunNumber>,
    next_bucket: u32,
    buckets: Vec<(PageNum, u64)>,
}

impl BlockAssembly {
    /// Creates the assembly and forks its writer thread at the given
    /// archive level (1 for run generation, higher for merges).
    pub fn new(directory: Arc<ArchiveDirectory>, level: u32, block_count: usize) -> Self {
        let block_size = directory.block_size();
        let ring = Arc::new(RingBuffer::new(block_size, block_count));
        let writer_reset = Arc::new(AtomicBool::new(false));
        let writer =
            WriterThread::spawn(directory.clone(), ring.clone(), level, writer_reset.clone());
        let bucket_size = directory.index().bucket_size();
        Self {
            directory,
            ring,
            writer: Some(writer),
            writer_reset,
            level,
            block_size,
            bucket_size,
            dest: None,
            pos: 0,
            fpos: 0,
            max_lsn_in_block: Lsn::NULL,
            max_lsn_length: 0,
            last_run: None,
            next_bucket: 0,
            buckets: Vec::new(),
        }
    }

    /// Acquires an output block for `run`. Returns false only when the
    /// write pipeline has shut down.
    pub fn start(&mut self, run: RunNumber) -> bool {
        debug_assert!(self.dest.is_none());
        let Some(dest) = self.ring.producer_request() else {
            return false;
        };
        self.dest = Some(dest);
        self.pos = BLOCK_HEADER_SIZE;
        if self.last_run != Some(run) {
            self.directory.index().append_new_entry(self.level);
            self.next_bucket = 0;
            self.fpos = 0;
            self.last_run = Some(run);
        }
        self.buckets.clear();
        true
    }

    /// Adds one encoded record. Returns false when the block cannot hold
    /// it (room for the trailing skip record is always kept); the caller
    /// finishes this block and starts another.
    pub fn add(&mut self, bytes: &[u8]) -> bool {
        let dest = self.dest.as_mut().expect("add without start");
        let available = self.block_size - self.pos - HEADER_SIZE;
        if bytes.len() > available {
            return false;
        }

        let lsn = LogRecord::peek_lsn(bytes);
        if self.max_lsn_in_block < lsn {
            self.max_lsn_in_block = lsn;
            self.max_lsn_length = bytes.len() as u32;
        }

        let page = LogRecord::peek_page(bytes);
        if page / self.bucket_size >= self.next_bucket {
            let bucket_pid = (page / self.bucket_size) * self.bucket_size;
            self.buckets.push((bucket_pid, self.fpos));
            self.next_bucket = bucket_pid / self.bucket_size + 1;
        }

        dest[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        self.fpos += bytes.len() as u64;
        true
    }

    /// Seals the block and hands it to the writer. The header's LSN is the
    /// exclusive upper bound: the LSN immediately following the last record
    /// in the block, so that consecutive runs meet exactly.
    pub fn finish(&mut self) {
        let mut dest = self.dest.take().expect("finish without start");
        self.directory
            .index()
            .add_block(&self.buckets, self.level);
        let end_lsn = self.max_lsn_in_block.advance(self.max_lsn_length);
        write_block_header(
            &mut dest,
            end_lsn,
            self.pos as u32,
            self.last_run.expect("run set in start"),
        );
        self.max_lsn_in_block = Lsn::NULL;
        self.max_lsn_length = 0;
        self.ring.producer_release(dest);
    }

    /// True while blocks published to the writer have not reached disk.
    pub fn has_pending_blocks(&self) -> bool {
        !self.ring.is_empty()
    }

    /// Waits until the writer drained every published block.
    pub fn wait_until_drained(&self) {
        while self.has_pending_blocks() {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Forces the writer to treat the next block as the start of a fresh
    /// run. Used by flush processing right after it force-closed the
    /// current run file, so the writer does not try to close it again.
    pub fn reset_writer(&mut self) {
        self.writer_reset.store(true, Ordering::Release);
    }

    /// Drains and joins the writer. The final run is closed with whatever
    /// LSN the writer accumulated.
    pub fn shutdown(mut self) {
        debug_assert!(self.dest.is_none());
        self.ring.set_finished();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl Drop for BlockAssembly {
    fn drop(&mut self) {
        self.ring.set_finished();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}
