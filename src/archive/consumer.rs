//! Record-at-a-time interface over the recovery log.
//!
//! Wraps the reader thread and its ring buffer behind a synchronous
//! `next()` that parses records out of the delivered blocks, reassembles
//! records straddling block boundaries, skips non-redo noise, and rolls the
//! stream over to the next partition when it meets a skip record.

use std::sync::Arc;

use crate::error::Result;
use crate::log::record::{LogRecord, RecordType};
use crate::log::scanner::{LogScanner, Scanned};
use crate::lsn::Lsn;

use super::directory::ArchiveDirectory;
use super::reader::ReaderThread;
use super::ring::RingBuffer;

pub struct LogConsumer {
    ring: Arc<RingBuffer>,
    reader: ReaderThread,
    scanner: LogScanner,
    next_lsn: Lsn,
    end_lsn: Lsn,
    read_whole_blocks: bool,
    current_block: Option<Box<[u8]>>,
    pos: usize,
    block_size: usize,
}

impl LogConsumer {
    pub fn new(
        directory: Arc<ArchiveDirectory>,
        start_lsn: Lsn,
        block_size: usize,
        block_count: usize,
    ) -> Self {
        let ring = Arc::new(RingBuffer::new(block_size, block_count));
        let reader = ReaderThread::spawn(directory, ring.clone(), start_lsn);
        let mut scanner = LogScanner::new(block_size);
        scanner.ignore_non_redo();
        tracing::debug!(start_lsn = %start_lsn, "log consumer starting");
        Self {
            ring,
            reader,
            scanner,
            next_lsn: start_lsn,
            end_lsn: Lsn::NULL,
            read_whole_blocks: true,
            current_block: None,
            // Position within the block the first delivered bytes belong
            // to; the reader fills from the same in-block offset.
            pos: (start_lsn.off as usize) % block_size,
            block_size,
        }
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Begins (or extends) a consumption cycle up to `end_lsn`. The window
    /// must be non-empty; the reader always delivers at least one block.
    pub fn open(&mut self, end_lsn: Lsn, read_whole_blocks: bool) {
        self.end_lsn = end_lsn;
        self.read_whole_blocks = read_whole_blocks;
        self.reader.activate(end_lsn);
        // The block held from the previous cycle is stale: the reader
        // re-reads the remainder of it (the log may have grown within the
        // same block) and delivers a fresh copy.
        self.next_block();
    }

    pub fn shutdown(&mut self) {
        self.ring.set_finished();
        self.reader.shutdown();
    }

    fn next_block(&mut self) -> bool {
        if let Some(block) = self.current_block.take() {
            self.ring.consumer_release(block);
        }
        match self.ring.consumer_request() {
            Some(block) => {
                if self.pos >= self.block_size {
                    self.pos = 0;
                }
                self.current_block = Some(block);
                true
            }
            None => false,
        }
    }

    /// The next log record, or None when the cycle reached its end LSN (or
    /// the pipeline shut down).
    pub fn next(&mut self) -> Result<Option<LogRecord>> {
        loop {
            let Some(block) = self.current_block.as_ref() else {
                return Ok(None);
            };
            let outcome = self.scanner.next_record(
                block,
                &mut self.pos,
                Some(&mut self.next_lsn),
                Some(self.end_lsn),
            )?;
            match outcome {
                Scanned::Record(record) if record.rtype == RecordType::Skip => {
                    // End of partition: the stream continues at offset 0 of
                    // the next one, which the reader is already fetching.
                    self.next_lsn = Lsn::new(self.next_lsn.part + 1, 0);
                    self.pos = self.block_size;
                    self.scanner.reset();
                    tracing::trace!(next_lsn = %self.next_lsn, "skip record, advancing partition");
                    if !self.next_block() {
                        return Ok(None);
                    }
                }
                Scanned::Record(record) => return Ok(Some(record)),
                Scanned::Stopped => return Ok(None),
                Scanned::NeedBlock => {
                    if self.read_whole_blocks && self.stop_on_partial_record() {
                        // A record hangs over the activation window; wait
                        // for the next activation rather than fetching a
                        // block past the window.
                        return Ok(None);
                    }
                    if !self.next_block() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Whole-block mode must not fetch past the activation window to
    /// assemble a straddling record: stop when the record's remainder (or
    /// even its length field) lies beyond the end LSN.
    fn stop_on_partial_record(&self) -> bool {
        if self.end_lsn.part != self.next_lsn.part {
            return false;
        }
        if !self.scanner.has_partial_record() {
            // The block ended exactly on a record boundary; the next block
            // still lies within the window.
            return false;
        }
        let window = (self.end_lsn.off - self.next_lsn.off) as usize;
        match self.scanner.partial_record_len() {
            // Not even the length field was readable yet.
            None => true,
            Some(len) => window < len,
        }
    }
}

impl Drop for LogConsumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
