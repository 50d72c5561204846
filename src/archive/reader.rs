//! Asynchronous reader thread for the recovery log.
//!
//! Activation-driven like the archiver itself: each activation carries an
//! end LSN, and the thread reads block-aligned chunks from the log
//! partition files into the read ring until it reaches that LSN. Short
//! reads are fine (the log may still be growing); end-of-file rolls over to
//! the next partition. On shutdown the thread marks the ring finished so
//! the consumer drains and stops.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::Result;
use crate::lsn::Lsn;

use super::control::ArchiverControl;
use super::directory::ArchiveDirectory;
use super::ring::RingBuffer;

pub struct ReaderThread {
    control: Arc<ArchiverControl>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

struct ReaderState {
    directory: Arc<ArchiveDirectory>,
    ring: Arc<RingBuffer>,
    control: Arc<ArchiverControl>,
    shutdown: Arc<AtomicBool>,
    /// Byte position within the current partition.
    pos: u64,
    next_partition: u32,
    current: Option<File>,
}

impl ReaderThread {
    pub fn spawn(
        directory: Arc<ArchiveDirectory>,
        ring: Arc<RingBuffer>,
        start_lsn: Lsn,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let control = Arc::new(ArchiverControl::new(shutdown.clone()));
        let mut state = ReaderState {
            directory,
            ring: ring.clone(),
            control: control.clone(),
            shutdown: shutdown.clone(),
            pos: start_lsn.off as u64,
            next_partition: start_lsn.part,
            current: None,
        };
        let handle = std::thread::Builder::new()
            .name("log-reader".into())
            .spawn(move || {
                if let Err(e) = state.run() {
                    tracing::error!(error = %e, "log reader failed");
                    state.shutdown.store(true, Ordering::Release);
                }
                state.ring.set_finished();
            })
            .expect("spawning reader thread");
        Self {
            control,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn activate(&self, end_lsn: Lsn) {
        tracing::trace!(end_lsn = %end_lsn, "activating reader");
        self.control.activate(true, end_lsn);
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReaderThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ReaderState {
    fn run(&mut self) -> Result<()> {
        loop {
            let Some(end_lsn) = self.control.wait_for_activation() else {
                return Ok(());
            };
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }
            tracing::trace!(end_lsn = %end_lsn, "reader activated");

            loop {
                let end_lsn = self.control.end_lsn();
                let current_partition = if self.current.is_some() {
                    self.next_partition - 1
                } else {
                    self.next_partition
                };
                if end_lsn.part == current_partition && self.pos >= end_lsn.off as u64 {
                    // The requested range is fully read. The next
                    // activation resumes exactly at the end LSN, which may
                    // sit inside the block just delivered.
                    self.pos = end_lsn.off as u64;
                    break;
                }

                let Some(mut block) = self.ring.producer_request() else {
                    return Ok(());
                };

                if self.current.is_none() {
                    self.open_partition()?;
                }

                // Re-read only the part of the block past what the last
                // cycle already delivered.
                let block_size = block.len();
                let block_pos = (self.pos % block_size as u64) as usize;
                let file = self.current.as_ref().expect("opened above");
                let mut read = file.read_at(&mut block[block_pos..], self.pos)?;

                if read == 0 {
                    // End of partition: move on to the next one.
                    tracing::debug!(partition = self.next_partition - 1, "log partition exhausted");
                    self.open_partition()?;
                    self.pos = 0;
                    let file = self.current.as_ref().expect("opened above");
                    read = file.read_at(&mut block[..], 0)?;
                    if read == 0 {
                        self.ring.producer_cancel(block);
                        return Err(crate::errdata!(
                            "log partition {} is empty",
                            self.next_partition - 1
                        ));
                    }
                }

                self.pos += read as u64;
                self.ring.producer_release(block);
            }

            self.control.work_done();
        }
    }

    fn open_partition(&mut self) -> Result<()> {
        self.current = None;
        let path = self.directory.log_partition_path(self.next_partition);
        let file = File::open(&path)?;
        tracing::debug!(path = %path.display(), "opened log partition for read");
        self.current = Some(file);
        self.next_partition += 1;
        Ok(())
    }
}
