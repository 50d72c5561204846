//! Concurrent, recoverable foster B-link tree.
//!
//! Traversal is latch-coupled: shared latches from the root down, releasing
//! each parent once the child is held. A foster pointer whose range covers
//! the key is followed like a child edge. Mutating operations upgrade the
//! leaf latch conditionally; when that fails the traversal restarts from the
//! root taking exclusive latches.
//!
//! Structure modifications (split, adopt, grow, merge, rebalance, de-adopt)
//! run in system sub-transactions — see [`smo`].

pub mod hints;
pub mod page;
pub mod smo;
pub mod verify;

use std::sync::Arc;

use crate::bufpool::{BufferPool, FixedPage, LatchMode};
use crate::config::BtreeConfig;
use crate::error::{ErrorKind, Result};
use crate::log::record::{LogRecord, RecordType};
use crate::lsn::{PageNum, StoreId};
use crate::txn::TxnManager;
use crate::{bail, trace_err};

use hints::LatchHints;
use page::MAX_ENTRY_SIZE;

pub struct Btree {
    pool: Arc<BufferPool>,
    txn: Arc<TxnManager>,
    hints: LatchHints,
    config: BtreeConfig,
}

/// Outcome of an opportunistic adoption attempt during traversal.
pub(crate) enum Opportunistic {
    /// Nothing happened (or the parent latch was unavailable); traversal
    /// continues with the child latch returned.
    Continued(FixedPage),
    /// The parent was restructured; the traversal must restart from the
    /// root because the page it held may have been split.
    PushedUp,
}

impl Btree {
    pub fn new(pool: Arc<BufferPool>, txn: Arc<TxnManager>) -> Self {
        Self::with_config(pool, txn, BtreeConfig::default())
    }

    pub fn with_config(pool: Arc<BufferPool>, txn: Arc<TxnManager>, config: BtreeConfig) -> Self {
        Self {
            pool,
            txn,
            hints: LatchHints::new(),
            config,
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub(crate) fn txn(&self) -> &TxnManager {
        &self.txn
    }

    pub(crate) fn hints(&self) -> &LatchHints {
        &self.hints
    }

    pub(crate) fn config(&self) -> &BtreeConfig {
        &self.config
    }

    pub fn max_entry_size(&self) -> usize {
        MAX_ENTRY_SIZE
    }

    /// Creates an empty index in `store` and returns its root page, an
    /// empty leaf with infinite fences. The root page number never changes
    /// afterwards, even when the tree grows.
    pub fn create(&self, store: StoreId) -> Result<PageNum> {
        let sx = self.txn.begin_sys_xct();
        let rc = (|| {
            let root = self.pool.alloc_page(store)?;
            let mut fixed = self.pool.fix(root, LatchMode::Exclusive)?;
            fixed.page_mut().format(
                crate::lsn::PageId::new(store, root),
                root,
                1,
                0,
                0,
                b"",
                b"",
                b"",
            );
            let lsn = self
                .txn
                .log(LogRecord::new(RecordType::PageFormat, root, Default::default(), vec![]))?;
            fixed.page_mut().set_lsn(lsn);
            fixed.set_dirty();
            Ok(root)
        })();
        let root = sx.end(rc)?;
        if !self.is_empty(root)? {
            bail!(ErrorKind::IndexNotEmpty);
        }
        tracing::debug!(root, "created index");
        Ok(root)
    }

    pub fn is_empty(&self, root: PageNum) -> Result<bool> {
        Ok(self.scan(root)?.is_empty())
    }

    /// Point lookup. Ghosts are invisible.
    pub fn lookup(&self, root: PageNum, key: &[u8]) -> Result<Vec<u8>> {
        let leaf = self.traverse_to_leaf(root, key, false)?;
        let (slot, found) = leaf.page().search_leaf(key);
        if !found || leaf.page().is_ghost(slot) {
            bail!(ErrorKind::NotFound);
        }
        Ok(leaf.page().value(slot).to_vec())
    }

    /// Inserts a key/value pair. Re-uses a ghost of the same key if one is
    /// present. May split pages, adopt fosters, and grow the tree.
    pub fn insert(&self, root: PageNum, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() + value.len() > MAX_ENTRY_SIZE {
            bail!(ErrorKind::RecordTooLarge);
        }
        let mut leaf = self.traverse_to_leaf(root, key, true)?;
        loop {
            let (slot, found) = leaf.page().search_leaf(key);
            if found {
                if !leaf.page().is_ghost(slot) {
                    bail!(ErrorKind::Duplicate);
                }
                // Reclaim the ghost: clear the mark and install the value.
                let page = leaf.page_mut();
                page.unmark_ghost(slot);
                if !page.replace_value(slot, value) {
                    page.compact(false);
                    let (slot, _) = page.search_leaf(key);
                    if !page.replace_value(slot, value) {
                        // No room even defragmented; re-ghost and split.
                        page.mark_ghost(slot);
                        leaf = self.split_and_follow(leaf, key)?;
                        continue;
                    }
                }
                let lsn = self.txn.log(LogRecord::new(
                    RecordType::GhostReclaim,
                    leaf.page_num(),
                    Default::default(),
                    key.to_vec(),
                ))?;
                leaf.page_mut().set_lsn(lsn);
                leaf.set_dirty();
                return Ok(());
            }

            if leaf.page_mut().insert_leaf(slot, key, value, false) {
                let lsn = self.txn.log(LogRecord::new(
                    RecordType::GhostReserve,
                    leaf.page_num(),
                    Default::default(),
                    key.to_vec(),
                ))?;
                leaf.page_mut().set_lsn(lsn);
                leaf.set_dirty();
                return Ok(());
            }
            if leaf.page().nghosts() > 0 {
                leaf.page_mut().compact(true);
                continue;
            }
            leaf = self.split_and_follow(leaf, key)?;
        }
    }

    /// Replaces the value of an existing key.
    pub fn update(&self, root: PageNum, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() + value.len() > MAX_ENTRY_SIZE {
            bail!(ErrorKind::RecordTooLarge);
        }
        let mut leaf = self.traverse_to_leaf(root, key, true)?;
        loop {
            let (slot, found) = leaf.page().search_leaf(key);
            if !found || leaf.page().is_ghost(slot) {
                bail!(ErrorKind::NotFound);
            }
            if leaf.page_mut().replace_value(slot, value) {
                let lsn = self.txn.log(LogRecord::new(
                    RecordType::PageUpdate,
                    leaf.page_num(),
                    Default::default(),
                    key.to_vec(),
                ))?;
                leaf.page_mut().set_lsn(lsn);
                leaf.set_dirty();
                return Ok(());
            }
            if leaf.page().nghosts() > 0 {
                leaf.page_mut().compact(true);
                continue;
            }
            leaf = self.split_and_follow(leaf, key)?;
        }
    }

    /// In-place partial update of an existing value.
    pub fn overwrite(
        &self,
        root: PageNum,
        key: &[u8],
        data: &[u8],
        offset: usize,
    ) -> Result<()> {
        let mut leaf = self.traverse_to_leaf(root, key, true)?;
        let (slot, found) = leaf.page().search_leaf(key);
        if !found || leaf.page().is_ghost(slot) {
            bail!(ErrorKind::NotFound);
        }
        if offset + data.len() > leaf.page().value(slot).len() {
            bail!(ErrorKind::RecordTooLarge);
        }
        let lsn = self.txn.log(LogRecord::new(
            RecordType::PageUpdate,
            leaf.page_num(),
            Default::default(),
            key.to_vec(),
        ))?;
        leaf.page_mut().overwrite_value(slot, offset, data);
        leaf.page_mut().set_lsn(lsn);
        leaf.set_dirty();
        Ok(())
    }

    /// Removes a key by marking it ghost. The slot stays behind for
    /// key-range locking and is reclaimed by defragmentation.
    pub fn remove(&self, root: PageNum, key: &[u8]) -> Result<()> {
        let mut leaf = self.traverse_to_leaf(root, key, true)?;
        let (slot, found) = leaf.page().search_leaf(key);
        if !found || leaf.page().is_ghost(slot) {
            bail!(ErrorKind::NotFound);
        }
        let lsn = self.txn.log(LogRecord::new(
            RecordType::GhostMark,
            leaf.page_num(),
            Default::default(),
            key.to_vec(),
        ))?;
        leaf.page_mut().mark_ghost(slot);
        leaf.page_mut().set_lsn(lsn);
        leaf.set_dirty();
        Ok(())
    }

    // Logical undo variants. These skip key-range lock acquisition (the
    // enclosing transaction already owns the locks it needs to roll back).

    /// Undo of an insert: ghost the record.
    pub fn remove_as_undo(&self, root: PageNum, key: &[u8]) -> Result<()> {
        self.remove(root, key)
    }

    /// Undo of an update: restore the previous value.
    pub fn update_as_undo(&self, root: PageNum, key: &[u8], value: &[u8]) -> Result<()> {
        self.update(root, key, value)
    }

    /// Undo of an overwrite: restore the previous bytes.
    pub fn overwrite_as_undo(
        &self,
        root: PageNum,
        key: &[u8],
        data: &[u8],
        offset: usize,
    ) -> Result<()> {
        self.overwrite(root, key, data, offset)
    }

    /// Undo of a committed remove: clear the ghost mark, reviving the
    /// previous value.
    pub fn undo_ghost_mark(&self, root: PageNum, key: &[u8]) -> Result<()> {
        let mut leaf = self.traverse_to_leaf(root, key, true)?;
        let (slot, found) = leaf.page().search_leaf(key);
        if !found || !leaf.page().is_ghost(slot) {
            bail!(ErrorKind::NotFound);
        }
        let lsn = self.txn.log(LogRecord::new(
            RecordType::GhostReclaim,
            leaf.page_num(),
            Default::default(),
            key.to_vec(),
        ))?;
        leaf.page_mut().unmark_ghost(slot);
        leaf.page_mut().set_lsn(lsn);
        leaf.set_dirty();
        Ok(())
    }

    /// All live key/value pairs in key order. Latches couple down the tree;
    /// foster chains are walked after the children they extend.
    pub fn scan(&self, root: PageNum) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        self.scan_page(root, &mut out)?;
        Ok(out)
    }

    fn scan_page(&self, pid: PageNum, out: &mut Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let fixed = self.pool.fix(pid, LatchMode::Shared)?;
        let page = fixed.page();
        if page.is_leaf() {
            for slot in 0..page.nrecs() {
                if !page.is_ghost(slot) {
                    out.push((page.key(slot), page.value(slot).to_vec()));
                }
            }
        } else {
            self.scan_page(page.pid0(), out)?;
            for slot in 0..page.nrecs() {
                self.scan_page(page.child(slot), out)?;
            }
        }
        let foster = page.foster();
        fixed.unfix();
        if foster != 0 {
            self.scan_page(foster, out)?;
        }
        Ok(())
    }

    /// Root-to-leaf descent. With `exclusive_leaf`, the leaf comes back
    /// EX-latched: first via conditional upgrade, then, if that fails, via a
    /// retry that takes exclusive latches from the root.
    fn traverse_to_leaf(
        &self,
        root: PageNum,
        key: &[u8],
        exclusive_leaf: bool,
    ) -> Result<FixedPage> {
        loop {
            match self.try_traverse(root, key, exclusive_leaf, false)? {
                Some(leaf) => return Ok(leaf),
                None => {}
            }
            match self.try_traverse(root, key, exclusive_leaf, true)? {
                Some(leaf) => return Ok(leaf),
                None => {}
            }
        }
    }

    fn try_traverse(
        &self,
        root: PageNum,
        key: &[u8],
        exclusive_leaf: bool,
        all_exclusive: bool,
    ) -> Result<Option<FixedPage>> {
        let mode = if all_exclusive {
            LatchMode::Exclusive
        } else {
            LatchMode::Shared
        };
        let mut current = trace_err!(self.pool.fix(root, mode), "fixing root {root}");

        // A fostered root means the tree wants to grow a level. Do it now
        // if the exclusive latch is available; otherwise just traverse the
        // chain like any other.
        if current.page().foster() != 0
            && (mode == LatchMode::Exclusive || current.upgrade_conditional())
        {
            self.sx_grow_tree(&mut current)?;
        }

        loop {
            // Follow the foster chain sideways while the key lies beyond
            // this page's fences.
            if !current.page().fence_contains(key) {
                let foster = current.page().foster();
                if foster == 0 {
                    bail!(ErrorKind::KeyOutOfRange);
                }
                let next = self.pool.fix(foster, mode)?;
                current.unfix();
                current = next;
                continue;
            }

            if current.page().is_leaf() {
                if exclusive_leaf && mode == LatchMode::Shared && !current.upgrade_conditional() {
                    self.hints.increase_ex_need(current.page_num());
                    current.unfix();
                    return Ok(None);
                }
                return Ok(Some(current));
            }

            let child_pid = match current.page().search_node(key) {
                None => current.page().pid0(),
                Some(slot) => current.page().child(slot),
            };
            let child = self.pool.fix(child_pid, mode)?;

            // A foster pointer below is a chance to shorten the chain for
            // everyone. Only worth attempting from a shared traversal.
            if mode == LatchMode::Shared && child.page().foster() != 0 {
                match self.sx_opportunistic_adopt_foster(&mut current, child)? {
                    Opportunistic::Continued(child) => {
                        current.unfix();
                        current = child;
                    }
                    Opportunistic::PushedUp => {
                        current.unfix();
                        return Ok(None);
                    }
                }
            } else {
                current.unfix();
                current = child;
            }
        }
    }

    /// Splits a full leaf and re-positions onto whichever half covers
    /// `key`. The returned page is EX-latched.
    fn split_and_follow(&self, mut leaf: FixedPage, key: &[u8]) -> Result<FixedPage> {
        self.sx_split_foster(&mut leaf, key)?;
        while !leaf.page().fence_contains(key) {
            let foster = leaf.page().foster();
            if foster == 0 {
                bail!(ErrorKind::KeyOutOfRange);
            }
            let next = self.pool.fix(foster, LatchMode::Exclusive)?;
            leaf.unfix();
            leaf = next;
        }
        Ok(leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsn::VolumeId;

    fn tree() -> (Btree, PageNum) {
        let pool = Arc::new(BufferPool::new());
        let txn = Arc::new(TxnManager::new());
        let tree = Btree::new(pool, txn);
        let root = tree.create(StoreId::new(VolumeId(1), 1)).unwrap();
        (tree, root)
    }

    fn key(i: usize) -> Vec<u8> {
        format!("key{i:03}").into_bytes()
    }

    #[test]
    fn insert_lookup_roundtrip() {
        let (tree, root) = tree();
        tree.insert(root, b"alpha", b"1").unwrap();
        tree.insert(root, b"beta", b"2").unwrap();
        assert_eq!(tree.lookup(root, b"alpha").unwrap(), b"1");
        assert_eq!(tree.lookup(root, b"beta").unwrap(), b"2");
        assert_eq!(
            tree.lookup(root, b"gamma").unwrap_err().kind,
            ErrorKind::NotFound
        );
    }

    #[test]
    fn duplicate_insert_leaves_table_unchanged() {
        let (tree, root) = tree();
        tree.insert(root, b"k", b"v").unwrap();
        assert_eq!(
            tree.insert(root, b"k", b"other").unwrap_err().kind,
            ErrorKind::Duplicate
        );
        assert_eq!(tree.lookup(root, b"k").unwrap(), b"v");
        assert_eq!(tree.scan(root).unwrap().len(), 1);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let (tree, root) = tree();
        let value = vec![0u8; MAX_ENTRY_SIZE + 1];
        assert_eq!(
            tree.insert(root, b"k", &value).unwrap_err().kind,
            ErrorKind::RecordTooLarge
        );
    }

    #[test]
    fn update_and_overwrite() {
        let (tree, root) = tree();
        tree.insert(root, b"k", b"initial-value").unwrap();
        tree.update(root, b"k", b"updated-value!").unwrap();
        assert_eq!(tree.lookup(root, b"k").unwrap(), b"updated-value!");
        tree.overwrite(root, b"k", b"UP", 0).unwrap();
        assert_eq!(tree.lookup(root, b"k").unwrap(), b"UPdated-value!");
        assert_eq!(
            tree.update(root, b"missing", b"v").unwrap_err().kind,
            ErrorKind::NotFound
        );
        // Overwrite past the value end is refused.
        assert_eq!(
            tree.overwrite(root, b"k", b"xxxx", 12).unwrap_err().kind,
            ErrorKind::RecordTooLarge
        );
    }

    #[test]
    fn remove_ghosts_then_reinsert_reclaims() {
        let (tree, root) = tree();
        tree.insert(root, b"k", &[b'a'; 200]).unwrap();
        tree.remove(root, b"k").unwrap();
        assert_eq!(
            tree.lookup(root, b"k").unwrap_err().kind,
            ErrorKind::NotFound
        );
        assert_eq!(
            tree.remove(root, b"k").unwrap_err().kind,
            ErrorKind::NotFound
        );
        tree.insert(root, b"k", &[b'b'; 200]).unwrap();
        assert_eq!(tree.lookup(root, b"k").unwrap(), vec![b'b'; 200]);
    }

    #[test]
    fn undo_ghost_mark_revives_old_value() {
        let (tree, root) = tree();
        tree.insert(root, b"k", b"committed").unwrap();
        tree.remove(root, b"k").unwrap();
        tree.undo_ghost_mark(root, b"k").unwrap();
        assert_eq!(tree.lookup(root, b"k").unwrap(), b"committed");
    }

    #[test]
    fn grows_to_multiple_levels_and_stays_consistent() {
        let (tree, root) = tree();
        let value = vec![b'a'; 200];
        for i in 0..100 {
            tree.insert(root, &key(i), &value).unwrap();
        }
        for i in 0..100 {
            assert_eq!(tree.lookup(root, &key(i)).unwrap(), value, "key {i}");
        }
        let scanned = tree.scan(root).unwrap();
        assert_eq!(scanned.len(), 100);
        assert!(scanned.windows(2).all(|w| w[0].0 < w[1].0));
        // 100 × ~210 bytes across 8 KiB pages forces at least two levels.
        let fixed = tree.pool().fix(root, LatchMode::Shared).unwrap();
        assert!(fixed.page().is_node());
        assert!(tree.verify_tree(root, 16).unwrap());
    }

    #[test]
    fn scenario_ghost_remove_and_reinsert_after_growth() {
        let (tree, root) = tree();
        let value_a = vec![b'a'; 200];
        for i in 0..100 {
            tree.insert(root, &key(i), &value_a).unwrap();
        }
        tree.remove(root, &key(50)).unwrap();
        assert_eq!(
            tree.lookup(root, &key(50)).unwrap_err().kind,
            ErrorKind::NotFound
        );
        let value_b = vec![b'b'; 200];
        tree.insert(root, &key(50), &value_b).unwrap();
        assert_eq!(tree.lookup(root, &key(50)).unwrap(), value_b);
        assert!(tree.verify_tree(root, 16).unwrap());
    }

    #[test]
    fn random_order_inserts_hold_invariants() {
        let (tree, root) = tree();
        // A fixed pseudo-random permutation, avoiding pure append skew.
        let mut order: Vec<usize> = (0..200).collect();
        let mut state = 0x9e3779b9u64;
        for i in (1..order.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            order.swap(i, (state % (i as u64 + 1)) as usize);
        }
        for i in &order {
            tree.insert(root, &key(*i), format!("value{i}").as_bytes())
                .unwrap();
        }
        for i in 0..200 {
            assert_eq!(
                tree.lookup(root, &key(i)).unwrap(),
                format!("value{i}").into_bytes()
            );
        }
        assert!(tree.verify_tree(root, 16).unwrap());
    }
}
