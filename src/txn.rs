//! Facade over the transaction manager.
//!
//! The real transaction manager lives outside this crate; the tree reaches
//! it only to open and close system sub-transactions and to append log
//! records to the single LSN-assigning log tail. [`TxnManager`] is a
//! minimal in-process stand-in: it assigns LSNs, retains the records it was
//! handed (tests inspect them), and tracks system sub-transaction nesting
//! per thread.

use std::cell::Cell;
use std::sync::Mutex;

use crate::error::Result;
use crate::log::record::LogRecord;
use crate::lsn::Lsn;

thread_local! {
    static SYS_XCT_DEPTH: Cell<u32> = const { Cell::new(0) };
}

pub struct TxnManager {
    tail: Mutex<LogTail>,
}

struct LogTail {
    next_lsn: Lsn,
    records: Vec<LogRecord>,
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnManager {
    pub fn new() -> Self {
        Self {
            tail: Mutex::new(LogTail {
                next_lsn: Lsn::new(1, 0),
                records: Vec::new(),
            }),
        }
    }

    /// True while the calling thread is inside a system sub-transaction.
    pub fn is_sys_xct(&self) -> bool {
        SYS_XCT_DEPTH.with(|d| d.get()) > 0
    }

    /// Opens a nested top action. Structure modifications run inside one;
    /// it commits independently of any enclosing user transaction and is
    /// never undone.
    pub fn begin_sys_xct(&self) -> SysXct<'_> {
        SYS_XCT_DEPTH.with(|d| d.set(d.get() + 1));
        SysXct {
            txn: self,
            closed: false,
        }
    }

    /// Appends a record to the log tail, assigning its LSN. Returns the
    /// assigned LSN.
    pub fn log(&self, mut record: LogRecord) -> Result<Lsn> {
        let mut tail = self.tail.lock()?;
        let lsn = tail.next_lsn;
        record.lsn = lsn;
        tail.next_lsn = lsn.advance(record.len() as u32);
        tail.records.push(record);
        Ok(lsn)
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.tail.lock().unwrap().next_lsn
    }

    /// Snapshot of everything logged so far. Test hook.
    pub fn logged_records(&self) -> Vec<LogRecord> {
        self.tail.lock().unwrap().records.clone()
    }
}

/// Scope of a system sub-transaction. Close it with [`SysXct::end`]; an
/// early drop (error propagation path) counts as an abort.
pub struct SysXct<'a> {
    txn: &'a TxnManager,
    closed: bool,
}

impl SysXct<'_> {
    /// Commits when `rc` is Ok, aborts otherwise, and passes `rc` through.
    pub fn end<T>(mut self, rc: Result<T>) -> Result<T> {
        self.closed = true;
        SYS_XCT_DEPTH.with(|d| d.set(d.get() - 1));
        if rc.is_err() {
            tracing::debug!("system sub-transaction aborted");
        }
        rc
    }
}

impl Drop for SysXct<'_> {
    fn drop(&mut self) {
        if !self.closed {
            SYS_XCT_DEPTH.with(|d| d.set(d.get() - 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::RecordType;

    #[test]
    fn lsn_assignment_is_contiguous() {
        let txn = TxnManager::new();
        let a = txn
            .log(LogRecord::new(RecordType::PageUpdate, 1, Lsn::NULL, vec![0; 8]))
            .unwrap();
        let b = txn
            .log(LogRecord::new(RecordType::PageUpdate, 2, Lsn::NULL, vec![0; 8]))
            .unwrap();
        assert_eq!(a, Lsn::new(1, 0));
        assert_eq!(b, a.advance((crate::log::HEADER_SIZE + 8) as u32));
        assert_eq!(txn.logged_records().len(), 2);
    }

    #[test]
    fn sys_xct_nesting_is_tracked() {
        let txn = TxnManager::new();
        assert!(!txn.is_sys_xct());
        let outer = txn.begin_sys_xct();
        assert!(txn.is_sys_xct());
        {
            let inner = txn.begin_sys_xct();
            assert!(txn.is_sys_xct());
            inner.end(Ok(())).unwrap();
        }
        assert!(txn.is_sys_xct());
        outer.end(Ok(())).unwrap();
        assert!(!txn.is_sys_xct());
    }

    #[test]
    fn early_drop_closes_the_scope() {
        let txn = TxnManager::new();
        {
            let _sx = txn.begin_sys_xct();
            assert!(txn.is_sys_xct());
        }
        assert!(!txn.is_sys_xct());
    }
}
