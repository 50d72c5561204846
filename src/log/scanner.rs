use crate::error::Result;
use crate::errdata;
use crate::lsn::Lsn;

use super::record::{LogRecord, RecordType, HEADER_SIZE, MAX_RECORD_SIZE};

/// Parses log records from a stream of fixed-size binary blocks.
///
/// The scanner performs no I/O. The caller feeds it one block at a time and
/// pulls records with [`LogScanner::next_record`]; the scanner controls block
/// boundaries, which can fall in the middle of a record. Partial records are
/// staged in an internal truncation buffer and completed from the next block.
pub struct LogScanner {
    block_size: usize,
    trunc_buf: Vec<u8>,
    trunc_copied: usize,
    trunc_missing: usize,
    /// Bit per [`RecordType`] discriminant.
    ignore: u64,
}

/// Outcome of a [`LogScanner::next_record`] call.
#[derive(Debug, PartialEq)]
pub enum Scanned {
    /// A complete record was parsed; `pos` advanced past it.
    Record(LogRecord),
    /// The current block is exhausted (or the remainder belongs to a record
    /// continued in the next block). Feed the next block and call again.
    NeedBlock,
    /// The stream reached `stop_lsn`.
    Stopped,
}

impl LogScanner {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            trunc_buf: vec![0u8; MAX_RECORD_SIZE],
            trunc_copied: 0,
            trunc_missing: 0,
            ignore: 0,
        }
    }

    pub fn set_ignore(&mut self, rtype: RecordType) {
        self.ignore |= 1 << (rtype as u8);
    }

    fn is_ignored(&self, rtype: RecordType) -> bool {
        self.ignore & (1 << (rtype as u8)) != 0
    }

    /// Installs the archiver's default ignore set: records that carry no
    /// page-level redo content.
    pub fn ignore_non_redo(&mut self) {
        use RecordType::*;
        for rtype in [
            Comment,
            Compensate,
            CheckpointBegin,
            CheckpointEnd,
            XctEnd,
            XctAbort,
            TickSec,
            TickMsec,
            PageRead,
            PageWrite,
            RestoreBegin,
            RestoreSegment,
            RestoreEnd,
        ] {
            self.set_ignore(rtype);
        }
    }

    /// True when a record prefix is staged awaiting its continuation.
    pub fn has_partial_record(&self) -> bool {
        self.trunc_missing > 0
    }

    /// Total length of the staged partial record, when enough of its header
    /// has arrived to know it.
    pub fn partial_record_len(&self) -> Option<usize> {
        if self.trunc_missing == 0 || self.trunc_copied < 4 {
            return None;
        }
        LogRecord::peek_len(&self.trunc_buf[..self.trunc_copied])
    }

    /// Discards any staged partial record. Called when the stream jumps to a
    /// new partition.
    pub fn reset(&mut self) {
        self.trunc_copied = 0;
        self.trunc_missing = 0;
    }

    /// Length of the next record if its header is visible at `pos`, or None
    /// when not even the length field fits in the block remainder.
    pub fn next_record_len(&self, src: &[u8], pos: usize) -> Option<usize> {
        LogRecord::peek_len(&src[pos..])
    }

    /// Fetches the next record from `src` at `*pos`.
    ///
    /// `next_lsn`, when given, is advanced past every record consumed and
    /// validated against each record header. `stop_lsn` halts the scan
    /// exactly at that LSN. Ignored record types are consumed and skipped
    /// internally.
    pub fn next_record(
        &mut self,
        src: &[u8],
        pos: &mut usize,
        mut next_lsn: Option<&mut Lsn>,
        stop_lsn: Option<Lsn>,
    ) -> Result<Scanned> {
        loop {
            if let (Some(next), Some(stop)) = (next_lsn.as_deref(), stop_lsn) {
                if *next == stop {
                    return Ok(Scanned::Stopped);
                }
            }

            let remaining = self.block_size - *pos;
            if remaining == 0 {
                return Ok(Scanned::NeedBlock);
            }

            let record = if self.trunc_missing > 0 {
                // Continue the staged record with bytes from this block.
                let take = self.trunc_missing.min(remaining);
                self.trunc_buf[self.trunc_copied..self.trunc_copied + take]
                    .copy_from_slice(&src[*pos..*pos + take]);
                self.trunc_copied += take;
                self.trunc_missing -= take;
                *pos += take;
                if self.trunc_missing == 0 && self.trunc_copied == HEADER_SIZE {
                    // The staged bytes only completed the header; the record
                    // may extend further.
                    let full = LogRecord::peek_len(&self.trunc_buf).expect("header staged");
                    if full < HEADER_SIZE || full > MAX_RECORD_SIZE {
                        return Err(errdata!("log record with invalid length {full}"));
                    }
                    self.trunc_missing = full - self.trunc_copied;
                    if self.trunc_missing > 0 {
                        continue;
                    }
                }
                if self.trunc_missing > 0 {
                    return Ok(Scanned::NeedBlock);
                }
                let record = LogRecord::decode(&self.trunc_buf[..self.trunc_copied])?;
                self.trunc_copied = 0;
                record
            } else {
                // The length field itself may be cut off by the block end.
                let len = LogRecord::peek_len(&src[*pos..self.block_size]);
                if let Some(len) = len {
                    if len < HEADER_SIZE || len > MAX_RECORD_SIZE {
                        return Err(errdata!("log record with invalid length {len} at {pos}"));
                    }
                }
                if len.is_none() || len.unwrap() > remaining {
                    // Stage the prefix and ask for the next block.
                    self.trunc_buf[..remaining]
                        .copy_from_slice(&src[*pos..self.block_size]);
                    self.trunc_copied = remaining;
                    self.trunc_missing = len.unwrap_or(HEADER_SIZE) - remaining;
                    *pos += remaining;
                    return Ok(Scanned::NeedBlock);
                }
                let len = len.unwrap();
                let slice = &src[*pos..*pos + len];
                if let Some(next) = next_lsn.as_deref() {
                    if !LogRecord::valid_header(slice, Some(*next)) {
                        return Err(errdata!(
                            "unexpected log record header at {pos}, expected lsn {next}"
                        ));
                    }
                }
                let record = LogRecord::decode(slice)?;
                *pos += len;
                record
            };

            if let Some(next) = next_lsn.as_deref_mut() {
                *next = next.advance(record.len() as u32);
            }

            if self.is_ignored(record.rtype) {
                continue;
            }

            return Ok(Scanned::Record(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 512;

    fn record(lsn: Lsn, page: u32, payload_len: usize) -> LogRecord {
        LogRecord::new(
            RecordType::PageUpdate,
            page,
            lsn,
            vec![0xAB; payload_len],
        )
    }

    /// Packs records into BLOCK-sized chunks, letting them straddle chunk
    /// boundaries like the recovery log does.
    fn blocks_of(records: &[LogRecord]) -> Vec<Vec<u8>> {
        let mut stream = Vec::new();
        for r in records {
            stream.extend_from_slice(&r.encode());
        }
        stream.resize(stream.len().div_ceil(BLOCK) * BLOCK, 0);
        stream.chunks(BLOCK).map(|c| c.to_vec()).collect()
    }

    fn scan_all(blocks: &[Vec<u8>], stop: Lsn) -> Vec<LogRecord> {
        let mut scanner = LogScanner::new(BLOCK);
        let mut next = Lsn::new(1, 0);
        let mut out = Vec::new();
        let mut pos = 0;
        let mut block = 0;
        loop {
            match scanner
                .next_record(&blocks[block], &mut pos, Some(&mut next), Some(stop))
                .unwrap()
            {
                Scanned::Record(r) => out.push(r),
                Scanned::NeedBlock => {
                    block += 1;
                    if block >= blocks.len() {
                        break;
                    }
                    pos = 0;
                }
                Scanned::Stopped => break,
            }
        }
        out
    }

    #[test]
    fn scans_contiguous_records() {
        let mut lsn = Lsn::new(1, 0);
        let mut records = Vec::new();
        for page in 0..4 {
            let r = record(lsn, page, 60);
            lsn = lsn.advance(r.len() as u32);
            records.push(r);
        }
        let blocks = blocks_of(&records);
        assert_eq!(scan_all(&blocks, lsn), records);
    }

    #[test]
    fn record_straddling_block_boundary_is_reassembled() {
        // First record leaves less than a full record of room in block 0.
        let r1 = record(Lsn::new(1, 0), 1, BLOCK - HEADER_SIZE - 80);
        let r2 = record(Lsn::new(1, r1.len() as u32), 2, 200);
        let stop = r2.lsn.advance(r2.len() as u32);
        let blocks = blocks_of(&[r1.clone(), r2.clone()]);
        assert!(r1.len() + r2.len() > BLOCK);
        assert_eq!(scan_all(&blocks, stop), vec![r1, r2]);
    }

    #[test]
    fn boundary_splitting_the_length_field() {
        // Leave exactly 2 bytes at the end of block 0 so not even the
        // length field fits.
        let r1 = record(Lsn::new(1, 0), 1, BLOCK - HEADER_SIZE - 2);
        let r2 = record(Lsn::new(1, r1.len() as u32), 2, 100);
        let stop = r2.lsn.advance(r2.len() as u32);
        let blocks = blocks_of(&[r1.clone(), r2.clone()]);
        assert_eq!(scan_all(&blocks, stop), vec![r1, r2]);
    }

    #[test]
    fn ignored_types_are_skipped() {
        let mut lsn = Lsn::new(1, 0);
        let keep = record(lsn, 1, 40);
        lsn = lsn.advance(keep.len() as u32);
        let mut tick = LogRecord::new(RecordType::TickSec, 0, lsn, Vec::new());
        tick.redo = false;
        lsn = lsn.advance(tick.len() as u32);
        let keep2 = record(lsn, 2, 40);
        lsn = lsn.advance(keep2.len() as u32);

        let blocks = blocks_of(&[keep.clone(), tick, keep2.clone()]);
        let mut scanner = LogScanner::new(BLOCK);
        scanner.ignore_non_redo();
        let mut next = Lsn::new(1, 0);
        let mut pos = 0;
        let mut got = Vec::new();
        while let Scanned::Record(r) = scanner
            .next_record(&blocks[0], &mut pos, Some(&mut next), Some(lsn))
            .unwrap()
        {
            got.push(r);
        }
        assert_eq!(got, vec![keep, keep2]);
    }

    #[test]
    fn stops_exactly_at_stop_lsn() {
        let r1 = record(Lsn::new(1, 0), 1, 40);
        let r2 = record(Lsn::new(1, r1.len() as u32), 2, 40);
        let stop = r2.lsn; // stop before r2
        let blocks = blocks_of(&[r1.clone(), r2]);
        assert_eq!(scan_all(&blocks, stop), vec![r1]);
    }

    #[test]
    fn lsn_mismatch_is_detected() {
        let r1 = record(Lsn::new(1, 999), 1, 40); // wrong lsn for stream pos 0
        let blocks = blocks_of(&[r1]);
        let mut scanner = LogScanner::new(BLOCK);
        let mut next = Lsn::new(1, 0);
        let mut pos = 0;
        assert!(scanner
            .next_record(&blocks[0], &mut pos, Some(&mut next), None)
            .is_err());
    }
}
