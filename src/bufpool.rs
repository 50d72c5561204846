//! Latch and buffer facade for B-link tree pages.
//!
//! The real buffer manager is an external service; the tree only depends on
//! the narrow surface here: fix/unfix with a latch mode, conditional latch
//! upgrade, dirty marking, page allocation, and write-order dependencies.
//! [`BufferPool`] is an in-memory implementation of that surface, sufficient
//! for the index and for tests.
//!
//! Latches are short-duration reader-writer locks held for a single
//! operation. Deadlock freedom comes from the traversal protocol (latch
//! coupling, conditional acquisition), not from the latch itself.

use std::cell::UnsafeCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::btree::page::BtreePage;
use crate::error::{ErrorKind, Result};
use crate::lsn::{PageNum, StoreId};
use crate::{bail, errfatal};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct LatchState {
    readers: u32,
    writer: bool,
}

/// A reader-writer latch built on a mutex and condvar, supporting the
/// conditional (non-blocking) acquisition and upgrade the tree needs.
#[derive(Debug, Default)]
struct Latch {
    state: Mutex<LatchState>,
    released: Condvar,
}

impl Latch {
    fn acquire(&self, mode: LatchMode) {
        let mut state = self.state.lock().unwrap();
        match mode {
            LatchMode::Shared => {
                while state.writer {
                    state = self.released.wait(state).unwrap();
                }
                state.readers += 1;
            }
            LatchMode::Exclusive => {
                while state.writer || state.readers > 0 {
                    state = self.released.wait(state).unwrap();
                }
                state.writer = true;
            }
        }
    }

    fn try_acquire(&self, mode: LatchMode) -> bool {
        let mut state = self.state.lock().unwrap();
        match mode {
            LatchMode::Shared if !state.writer => {
                state.readers += 1;
                true
            }
            LatchMode::Exclusive if !state.writer && state.readers == 0 => {
                state.writer = true;
                true
            }
            _ => false,
        }
    }

    /// Atomically trades a shared hold for the exclusive one, but only when
    /// this thread is the sole reader. No blocking, no window for another
    /// writer.
    fn try_upgrade(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.readers >= 1 && !state.writer);
        if state.readers == 1 {
            state.readers = 0;
            state.writer = true;
            true
        } else {
            false
        }
    }

    fn release(&self, mode: LatchMode) {
        let mut state = self.state.lock().unwrap();
        match mode {
            LatchMode::Shared => state.readers -= 1,
            LatchMode::Exclusive => state.writer = false,
        }
        drop(state);
        self.released.notify_all();
    }
}

struct Frame {
    latch: Latch,
    dirty: AtomicBool,
    super_dirty: AtomicBool,
    data: UnsafeCell<BtreePage>,
}

// Access to `data` is serialized by `latch` through the FixedPage protocol.
unsafe impl Sync for Frame {}
unsafe impl Send for Frame {}

/// A page fixed in the pool with a latch held. The latch is released when
/// the guard drops (or explicitly via [`FixedPage::unfix`]).
pub struct FixedPage {
    frame: Arc<Frame>,
    page_num: PageNum,
    mode: LatchMode,
}

impl FixedPage {
    pub fn page_num(&self) -> PageNum {
        self.page_num
    }

    pub fn mode(&self) -> LatchMode {
        self.mode
    }

    pub fn page(&self) -> &BtreePage {
        // Safety: SH or EX latch held for the lifetime of self.
        unsafe { &*self.frame.data.get() }
    }

    pub fn page_mut(&mut self) -> &mut BtreePage {
        assert_eq!(self.mode, LatchMode::Exclusive, "mutating under SH latch");
        // Safety: EX latch held, so this is the only accessor.
        unsafe { &mut *self.frame.data.get() }
    }

    /// Conditionally upgrades SH to EX. On failure the SH latch stays held.
    pub fn upgrade_conditional(&mut self) -> bool {
        if self.mode == LatchMode::Exclusive {
            return true;
        }
        if self.frame.latch.try_upgrade() {
            self.mode = LatchMode::Exclusive;
            true
        } else {
            false
        }
    }

    pub fn set_dirty(&self) {
        self.frame.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.frame.dirty.load(Ordering::Acquire)
    }

    pub fn unfix(self) {
        drop(self)
    }
}

impl Drop for FixedPage {
    fn drop(&mut self) {
        self.frame.latch.release(self.mode);
    }
}

/// In-memory page pool implementing the buffer-manager surface the tree
/// consumes.
pub struct BufferPool {
    frames: Mutex<HashMap<PageNum, Arc<Frame>>>,
    next_page: AtomicU32,
    /// Write-order edges: `before -> {after}`; `before` must reach disk no
    /// later than any of its `after` pages.
    write_order: Mutex<HashMap<PageNum, HashSet<PageNum>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(HashMap::new()),
            next_page: AtomicU32::new(1),
            write_order: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a fresh zeroed page. The caller formats it under latch.
    pub fn alloc_page(&self, _store: StoreId) -> Result<PageNum> {
        let page_num = self.next_page.fetch_add(1, Ordering::SeqCst);
        let frame = Arc::new(Frame {
            latch: Latch::default(),
            dirty: AtomicBool::new(false),
            super_dirty: AtomicBool::new(false),
            data: UnsafeCell::new(BtreePage::new()),
        });
        self.frames.lock()?.insert(page_num, frame);
        Ok(page_num)
    }

    /// Removes a deallocated page from the pool. The page must not be fixed.
    pub fn dealloc_page(&self, page_num: PageNum) -> Result<()> {
        self.frames.lock()?.remove(&page_num);
        self.write_order.lock()?.remove(&page_num);
        Ok(())
    }

    fn frame(&self, page_num: PageNum) -> Result<Arc<Frame>> {
        match self.frames.lock()?.get(&page_num) {
            Some(frame) => Ok(frame.clone()),
            None => Err(errfatal!("fix of unallocated page {page_num}")),
        }
    }

    /// Fixes a page, blocking until the latch is granted.
    pub fn fix(&self, page_num: PageNum, mode: LatchMode) -> Result<FixedPage> {
        let frame = self.frame(page_num)?;
        frame.latch.acquire(mode);
        Ok(FixedPage {
            frame,
            page_num,
            mode,
        })
    }

    /// Fixes a page only if the latch is free right now. Fails with
    /// `LatchTimeout` otherwise; callers treat that as "skip the
    /// optimization".
    pub fn fix_conditional(&self, page_num: PageNum, mode: LatchMode) -> Result<FixedPage> {
        let frame = self.frame(page_num)?;
        if !frame.latch.try_acquire(mode) {
            bail!(ErrorKind::LatchTimeout);
        }
        Ok(FixedPage {
            frame,
            page_num,
            mode,
        })
    }

    /// Registers "write `before` to disk no later than `after`". Refuses
    /// and returns false when the edge would close a cycle; both pages are
    /// then flagged super-dirty so the (external) cleaner flushes them as
    /// one batch.
    pub fn register_write_order_dependency(&self, before: PageNum, after: PageNum) -> bool {
        let mut graph = self.write_order.lock().unwrap();
        if Self::reaches(&graph, after, before) {
            drop(graph);
            if let Ok(frame) = self.frame(before) {
                frame.super_dirty.store(true, Ordering::Release);
            }
            if let Ok(frame) = self.frame(after) {
                frame.super_dirty.store(true, Ordering::Release);
            }
            return false;
        }
        graph.entry(before).or_default().insert(after);
        true
    }

    /// True when a `before -> after` constraint is already registered
    /// (directly or transitively). Merge-foster must not proceed in that
    /// case.
    pub fn has_write_order_dependency(&self, before: PageNum, after: PageNum) -> bool {
        let graph = self.write_order.lock().unwrap();
        Self::reaches(&graph, before, after)
    }

    fn reaches(graph: &HashMap<PageNum, HashSet<PageNum>>, from: PageNum, to: PageNum) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(next) = graph.get(&node) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    pub fn is_super_dirty(&self, page_num: PageNum) -> bool {
        self.frame(page_num)
            .map(|f| f.super_dirty.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsn::VolumeId;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn store() -> StoreId {
        StoreId::new(VolumeId(1), 1)
    }

    #[test]
    fn alloc_fix_mutate_read_back() {
        let pool = BufferPool::new();
        let pid = pool.alloc_page(store()).unwrap();
        {
            let mut fixed = pool.fix(pid, LatchMode::Exclusive).unwrap();
            fixed
                .page_mut()
                .format(
                    crate::lsn::PageId::new(store(), pid),
                    pid,
                    1,
                    0,
                    0,
                    b"",
                    b"",
                    b"",
                );
            fixed.set_dirty();
        }
        let fixed = pool.fix(pid, LatchMode::Shared).unwrap();
        assert!(fixed.page().is_leaf());
        assert!(fixed.is_dirty());
    }

    #[test]
    fn shared_latches_coexist_exclusive_excludes() {
        let pool = Arc::new(BufferPool::new());
        let pid = pool.alloc_page(store()).unwrap();
        let a = pool.fix(pid, LatchMode::Shared).unwrap();
        let b = pool.fix(pid, LatchMode::Shared).unwrap();
        assert!(pool.fix_conditional(pid, LatchMode::Exclusive).is_err());
        drop(a);
        assert!(pool.fix_conditional(pid, LatchMode::Exclusive).is_err());
        drop(b);
        assert!(pool.fix_conditional(pid, LatchMode::Exclusive).is_ok());
    }

    #[test]
    fn conditional_upgrade_requires_sole_reader() {
        let pool = BufferPool::new();
        let pid = pool.alloc_page(store()).unwrap();
        let mut a = pool.fix(pid, LatchMode::Shared).unwrap();
        let b = pool.fix(pid, LatchMode::Shared).unwrap();
        assert!(!a.upgrade_conditional());
        assert_eq!(a.mode(), LatchMode::Shared);
        drop(b);
        assert!(a.upgrade_conditional());
        assert_eq!(a.mode(), LatchMode::Exclusive);
    }

    #[test]
    fn exclusive_blocks_until_released() {
        let pool = Arc::new(BufferPool::new());
        let pid = pool.alloc_page(store()).unwrap();
        let fixed = pool.fix(pid, LatchMode::Exclusive).unwrap();
        let entered = Arc::new(AtomicUsize::new(0));

        let pool2 = pool.clone();
        let entered2 = entered.clone();
        let handle = thread::spawn(move || {
            let _fixed = pool2.fix(pid, LatchMode::Exclusive).unwrap();
            entered2.store(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(entered.load(Ordering::SeqCst), 0);
        drop(fixed);
        handle.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_order_cycle_is_refused_and_marks_super_dirty() {
        let pool = BufferPool::new();
        let a = pool.alloc_page(store()).unwrap();
        let b = pool.alloc_page(store()).unwrap();
        let c = pool.alloc_page(store()).unwrap();
        assert!(pool.register_write_order_dependency(a, b));
        assert!(pool.register_write_order_dependency(b, c));
        // c -> a would close the cycle a -> b -> c.
        assert!(!pool.register_write_order_dependency(c, a));
        assert!(pool.is_super_dirty(c));
        assert!(pool.is_super_dirty(a));
        assert!(pool.has_write_order_dependency(a, c));
        assert!(!pool.has_write_order_dependency(c, a));
    }
}
