use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{ErrorKind, Result};
use crate::lsn::{Lsn, PageNum};
use crate::{bail, errdata};

/// Fixed size of the log record header. Every record, including the skip
/// record, carries a full header; the payload follows immediately.
pub const HEADER_SIZE: usize = 48;

/// A log record never spans more than three B-link pages.
pub const MAX_RECORD_SIZE: usize = 3 * crate::btree::page::PAGE_SIZE;

const FLAG_REDO: u8 = 0x1;
const FLAG_MULTI_PAGE: u8 = 0x2;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Log record type tags. The archiver only interprets the tag to decide
/// whether a record is ignored, duplicated, or terminates a partition; the
/// redo machinery behind each tag lives with its emitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// End-of-partition marker; also terminates every archive block.
    Skip = 0,
    Comment = 1,
    Compensate = 2,
    CheckpointBegin = 3,
    CheckpointEnd = 4,
    XctEnd = 5,
    XctAbort = 6,
    TickSec = 7,
    TickMsec = 8,
    PageRead = 9,
    PageWrite = 10,
    RestoreBegin = 11,
    RestoreSegment = 12,
    RestoreEnd = 13,
    /// Generic page mutation. Used by synthetic workloads and tests.
    PageUpdate = 14,
    /// Initial formatting of a freshly allocated page.
    PageFormat = 15,
    FosterSplit = 16,
    NorecordSplit = 17,
    FosterAdoptParent = 18,
    FosterAdoptChild = 19,
    FosterMerge = 20,
    FosterRebalance = 21,
    FosterDeadopt = 22,
    GrowTree = 23,
    GhostMark = 24,
    GhostReserve = 25,
    GhostReclaim = 26,
}

impl RecordType {
    pub fn from_u8(tag: u8) -> Result<Self> {
        use RecordType::*;
        Ok(match tag {
            0 => Skip,
            1 => Comment,
            2 => Compensate,
            3 => CheckpointBegin,
            4 => CheckpointEnd,
            5 => XctEnd,
            6 => XctAbort,
            7 => TickSec,
            8 => TickMsec,
            9 => PageRead,
            10 => PageWrite,
            11 => RestoreBegin,
            12 => RestoreSegment,
            13 => RestoreEnd,
            14 => PageUpdate,
            15 => PageFormat,
            16 => FosterSplit,
            17 => NorecordSplit,
            18 => FosterAdoptParent,
            19 => FosterAdoptChild,
            20 => FosterMerge,
            21 => FosterRebalance,
            22 => FosterDeadopt,
            23 => GrowTree,
            24 => GhostMark,
            25 => GhostReserve,
            26 => GhostReclaim,
            _ => return Err(errdata!("unknown log record type {tag}")),
        })
    }
}

/// A decoded log record. The wire form is [`HEADER_SIZE`] bytes of header
/// followed by the payload:
///
/// ```text
/// 0   len: u32          total length including header
/// 4   type: u8
/// 5   flags: u8         redo, multi-page
/// 6   reserved: u16
/// 8   page: u32         primary page number
/// 12  page2: u32        secondary page number, 0 unless multi-page
/// 16  lsn: u32 + u32    partition, offset
/// 24  page_prev_lsn
/// 32  page2_prev_lsn
/// 40  crc: u32          CRC-32 of the payload
/// 44  reserved: u32
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub rtype: RecordType,
    pub redo: bool,
    pub page: PageNum,
    pub page2: PageNum,
    pub lsn: Lsn,
    pub page_prev_lsn: Lsn,
    pub page2_prev_lsn: Lsn,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn new(rtype: RecordType, page: PageNum, lsn: Lsn, payload: Vec<u8>) -> Self {
        Self {
            rtype,
            redo: true,
            page,
            page2: 0,
            lsn,
            page_prev_lsn: Lsn::NULL,
            page2_prev_lsn: Lsn::NULL,
            payload,
        }
    }

    /// The end-of-partition marker. Header-only.
    pub fn skip(lsn: Lsn) -> Self {
        let mut record = Self::new(RecordType::Skip, 0, lsn, Vec::new());
        record.redo = false;
        record
    }

    pub fn len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn is_multi_page(&self) -> bool {
        self.page2 != 0
    }

    /// Swaps in the secondary page as primary. Used when duplicating a
    /// multi-page record so each page finds it under its own page number.
    pub fn swapped_pages(&self) -> Self {
        let mut dup = self.clone();
        dup.page = self.page2;
        dup.page_prev_lsn = self.page2_prev_lsn;
        dup
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.len()];
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= self.len());
        LittleEndian::write_u32(&mut buf[0..4], self.len() as u32);
        buf[4] = self.rtype as u8;
        let mut flags = 0u8;
        if self.redo {
            flags |= FLAG_REDO;
        }
        if self.page2 != 0 {
            flags |= FLAG_MULTI_PAGE;
        }
        buf[5] = flags;
        LittleEndian::write_u16(&mut buf[6..8], 0);
        LittleEndian::write_u32(&mut buf[8..12], self.page);
        LittleEndian::write_u32(&mut buf[12..16], self.page2);
        LittleEndian::write_u32(&mut buf[16..20], self.lsn.part);
        LittleEndian::write_u32(&mut buf[20..24], self.lsn.off);
        LittleEndian::write_u32(&mut buf[24..28], self.page_prev_lsn.part);
        LittleEndian::write_u32(&mut buf[28..32], self.page_prev_lsn.off);
        LittleEndian::write_u32(&mut buf[32..36], self.page2_prev_lsn.part);
        LittleEndian::write_u32(&mut buf[36..40], self.page2_prev_lsn.off);
        LittleEndian::write_u32(&mut buf[40..44], CRC32.checksum(&self.payload));
        LittleEndian::write_u32(&mut buf[44..48], 0);
        buf[HEADER_SIZE..self.len()].copy_from_slice(&self.payload);
    }

    /// Decodes one record from the front of `buf`, verifying the payload
    /// checksum.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            bail!(ErrorKind::ShortIo);
        }
        let len = LittleEndian::read_u32(&buf[0..4]) as usize;
        if len < HEADER_SIZE || len > MAX_RECORD_SIZE {
            return Err(errdata!("log record with invalid length {len}"));
        }
        if buf.len() < len {
            bail!(ErrorKind::ShortIo);
        }
        let rtype = RecordType::from_u8(buf[4])?;
        let flags = buf[5];
        let payload = buf[HEADER_SIZE..len].to_vec();
        let crc = LittleEndian::read_u32(&buf[40..44]);
        if crc != CRC32.checksum(&payload) {
            return Err(errdata!("log record checksum mismatch at type {rtype:?}"));
        }
        Ok(Self {
            rtype,
            redo: flags & FLAG_REDO != 0,
            page: LittleEndian::read_u32(&buf[8..12]),
            page2: LittleEndian::read_u32(&buf[12..16]),
            lsn: Lsn::new(
                LittleEndian::read_u32(&buf[16..20]),
                LittleEndian::read_u32(&buf[20..24]),
            ),
            page_prev_lsn: Lsn::new(
                LittleEndian::read_u32(&buf[24..28]),
                LittleEndian::read_u32(&buf[28..32]),
            ),
            page2_prev_lsn: Lsn::new(
                LittleEndian::read_u32(&buf[32..36]),
                LittleEndian::read_u32(&buf[36..40]),
            ),
            payload,
        })
    }

    /// Reads the length field without decoding. Returns None if fewer than
    /// four bytes are available.
    pub fn peek_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < 4 {
            return None;
        }
        Some(LittleEndian::read_u32(&buf[0..4]) as usize)
    }

    /// Reads the primary page number from an encoded record.
    pub fn peek_page(buf: &[u8]) -> PageNum {
        LittleEndian::read_u32(&buf[8..12])
    }

    /// Reads the LSN from an encoded record.
    pub fn peek_lsn(buf: &[u8]) -> Lsn {
        Lsn::new(
            LittleEndian::read_u32(&buf[16..20]),
            LittleEndian::read_u32(&buf[20..24]),
        )
    }

    /// Reads the type tag from an encoded record.
    pub fn peek_type(buf: &[u8]) -> Result<RecordType> {
        RecordType::from_u8(buf[4])
    }

    /// Cheap structural check of an encoded header: plausible length, known
    /// type, and, when given, the LSN the stream expects next.
    pub fn valid_header(buf: &[u8], expected: Option<Lsn>) -> bool {
        if buf.len() < HEADER_SIZE {
            return false;
        }
        let len = LittleEndian::read_u32(&buf[0..4]) as usize;
        if len < HEADER_SIZE || len > MAX_RECORD_SIZE {
            return false;
        }
        if RecordType::from_u8(buf[4]).is_err() {
            return false;
        }
        match expected {
            Some(lsn) if !lsn.is_null() => Self::peek_lsn(buf) == lsn,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogRecord {
        let mut record = LogRecord::new(
            RecordType::PageUpdate,
            42,
            Lsn::new(1, 4096),
            b"value bytes".to_vec(),
        );
        record.page_prev_lsn = Lsn::new(1, 1024);
        record
    }

    #[test]
    fn encode_decode_roundtrip() {
        let record = sample();
        let buf = record.encode();
        assert_eq!(buf.len(), record.len());
        assert_eq!(LogRecord::decode(&buf).unwrap(), record);
    }

    #[test]
    fn peek_matches_decode() {
        let record = sample();
        let buf = record.encode();
        assert_eq!(LogRecord::peek_len(&buf), Some(record.len()));
        assert_eq!(LogRecord::peek_page(&buf), 42);
        assert_eq!(LogRecord::peek_lsn(&buf), Lsn::new(1, 4096));
        assert_eq!(LogRecord::peek_type(&buf).unwrap(), RecordType::PageUpdate);
    }

    #[test]
    fn corrupt_payload_fails_checksum() {
        let record = sample();
        let mut buf = record.encode();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(LogRecord::decode(&buf).is_err());
    }

    #[test]
    fn multi_page_duplication_swaps_pages() {
        let mut record = sample();
        record.page2 = 77;
        record.page2_prev_lsn = Lsn::new(1, 512);
        assert!(record.is_multi_page());
        let dup = record.swapped_pages();
        assert_eq!(dup.page, 77);
        assert_eq!(dup.page_prev_lsn, Lsn::new(1, 512));
        assert_eq!(dup.lsn, record.lsn);
    }

    #[test]
    fn valid_header_checks_expected_lsn() {
        let record = sample();
        let buf = record.encode();
        assert!(LogRecord::valid_header(&buf, None));
        assert!(LogRecord::valid_header(&buf, Some(Lsn::new(1, 4096))));
        assert!(!LogRecord::valid_header(&buf, Some(Lsn::new(1, 4097))));
    }

    #[test]
    fn skip_record_is_header_only() {
        let skip = LogRecord::skip(Lsn::new(2, 0));
        assert_eq!(skip.len(), HEADER_SIZE);
        assert!(!skip.redo);
        let decoded = LogRecord::decode(&skip.encode()).unwrap();
        assert_eq!(decoded.rtype, RecordType::Skip);
    }
}
