//! Asynchronous writer thread for archive run files.
//!
//! Consumes blocks published by block assembly and appends their payload to
//! the open run file of its level. The in-memory block header steers the
//! run lifecycle: a change of run number closes the current file (renaming
//! it to its final LSN range) and starts the next. The LSN recorded per
//! block is an upper bound over the run, and becomes the file name's end
//! boundary on close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::Result;
use crate::lsn::{Lsn, RunNumber};

use super::assembly::{block_end, block_lsn, block_run, BLOCK_HEADER_SIZE};
use super::directory::ArchiveDirectory;
use super::ring::RingBuffer;

pub(crate) struct WriterThread;

impl WriterThread {
    pub(crate) fn spawn(
        directory: Arc<ArchiveDirectory>,
        ring: Arc<RingBuffer>,
        level: u32,
        reset: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name(format!("archive-writer-{level}"))
            .spawn(move || {
                if let Err(e) = Self::run(&directory, &ring, level, &reset) {
                    tracing::error!(error = %e, level, "archive writer failed");
                }
            })
            .expect("spawning writer thread")
    }

    fn run(
        directory: &ArchiveDirectory,
        ring: &RingBuffer,
        level: u32,
        reset: &AtomicBool,
    ) -> Result<()> {
        let mut current_run: Option<RunNumber> = None;
        let mut max_lsn_in_run = Lsn::NULL;
        loop {
            if reset.swap(false, Ordering::AcqRel) {
                // The run was force-closed behind our back (flush request);
                // whatever comes next belongs to a new file.
                current_run = None;
                max_lsn_in_run = Lsn::NULL;
            }
            let Some(block) = ring.consumer_request() else {
                // Drained and finished: persist the final run boundary.
                directory.close_current_run(max_lsn_in_run, level)?;
                tracing::debug!(level, "archive writer exiting");
                return Ok(());
            };

            let run = block_run(&block);
            if current_run != Some(run) {
                if current_run.is_some() {
                    // The LSN bound of the previous run becomes the file
                    // name; the same value opens the next run, which is
                    // how gaps stay detectable.
                    directory.close_current_run(max_lsn_in_run, level)?;
                }
                current_run = Some(run);
                max_lsn_in_run = Lsn::NULL;
                tracing::debug!(run, level, "writer starting new run file");
            }

            let block_lsn = block_lsn(&block);
            if block_lsn > max_lsn_in_run {
                max_lsn_in_run = block_lsn;
            }

            let end = block_end(&block);
            directory.append(&block[BLOCK_HEADER_SIZE..end], level)?;
            ring.consumer_release(block);
        }
    }
}
