//! On-disk layout of a B-link tree node.
//!
//! A node is a fixed 8 KiB page: a 32-byte generic page header, a 32-byte
//! tree header, and an item area managed as a slot directory. Slot heads
//! (4 bytes: body offset + poor man's normalized key) grow upward from the
//! start of the item area; 8-byte-aligned slot bodies grow downward from its
//! end. Slot 0 always holds the fence triple (low, high, chain-high); record
//! slots follow. A negative body offset marks a ghost.
//!
//! All stored keys omit the first `prefix_len` bytes, the common prefix of
//! the two fence keys. The fence-low key is stored in full and doubles as
//! the prefix source.
//!
//! This module is pure data manipulation. The caller holds the page latch.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::lsn::{Lsn, PageId, PageNum, StoreId, VolumeId};

pub const PAGE_SIZE: usize = 8192;

const GENERIC_HEADER_SIZE: usize = 32;
const TREE_HEADER_SIZE: usize = 32;
pub const HEADER_SIZE: usize = GENERIC_HEADER_SIZE + TREE_HEADER_SIZE;

/// Bytes available for slot heads and bodies.
pub const DATA_SIZE: usize = PAGE_SIZE - HEADER_SIZE;
const DATA_UNITS: usize = DATA_SIZE / 8;

/// Largest key + value combination accepted by the tree. Guarantees that a
/// page always has room for a handful of maximum-size entries next to its
/// fence slot.
pub const MAX_ENTRY_SIZE: usize = DATA_SIZE / 4 - 64;

// Generic header offsets.
const OFF_LSN: usize = 0;
const OFF_PAGE: usize = 8;
const OFF_STORE: usize = 12;
const OFF_VOL: usize = 16;

// Tree header offsets.
const OFF_ROOT: usize = 32;
const OFF_PID0: usize = 36;
const OFF_FOSTER: usize = 40;
const OFF_LEVEL: usize = 44;
const OFF_FENCE_LOW_LEN: usize = 46;
const OFF_FENCE_HIGH_LEN: usize = 48;
const OFF_CHAIN_HIGH_LEN: usize = 50;
const OFF_PREFIX_LEN: usize = 52;
const OFF_SKEWED: usize = 54;
const OFF_NITEMS: usize = 56;
const OFF_NGHOSTS: usize = 58;
const OFF_RECORD_HEAD: usize = 60;

/// A B-link tree page over a fixed byte buffer.
#[repr(C, align(8))]
pub struct BtreePage {
    bytes: [u8; PAGE_SIZE],
}

/// Slot index among the record slots of a page (slot 0, the fence slot, is
/// not counted).
pub type SlotIndex = usize;

impl Default for BtreePage {
    fn default() -> Self {
        Self::new()
    }
}

impl BtreePage {
    pub fn new() -> Self {
        Self {
            bytes: [0; PAGE_SIZE],
        }
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.bytes
    }

    pub fn copy_from(&mut self, other: &BtreePage) {
        self.bytes.copy_from_slice(&other.bytes);
    }

    // Generic header.

    pub fn lsn(&self) -> Lsn {
        Lsn::new(
            LittleEndian::read_u32(&self.bytes[OFF_LSN..]),
            LittleEndian::read_u32(&self.bytes[OFF_LSN + 4..]),
        )
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        LittleEndian::write_u32(&mut self.bytes[OFF_LSN..], lsn.part);
        LittleEndian::write_u32(&mut self.bytes[OFF_LSN + 4..], lsn.off);
    }

    pub fn pid(&self) -> PageId {
        PageId::new(
            StoreId::new(
                VolumeId(LittleEndian::read_u32(&self.bytes[OFF_VOL..])),
                LittleEndian::read_u32(&self.bytes[OFF_STORE..]),
            ),
            LittleEndian::read_u32(&self.bytes[OFF_PAGE..]),
        )
    }

    fn set_pid(&mut self, pid: PageId) {
        LittleEndian::write_u32(&mut self.bytes[OFF_PAGE..], pid.page);
        LittleEndian::write_u32(&mut self.bytes[OFF_STORE..], pid.store.store);
        LittleEndian::write_u32(&mut self.bytes[OFF_VOL..], pid.store.vol.0);
    }

    // Tree header.

    pub fn root(&self) -> PageNum {
        LittleEndian::read_u32(&self.bytes[OFF_ROOT..])
    }

    pub fn pid0(&self) -> PageNum {
        LittleEndian::read_u32(&self.bytes[OFF_PID0..])
    }

    pub fn set_pid0(&mut self, pid: PageNum) {
        LittleEndian::write_u32(&mut self.bytes[OFF_PID0..], pid);
    }

    pub fn foster(&self) -> PageNum {
        LittleEndian::read_u32(&self.bytes[OFF_FOSTER..])
    }

    pub fn set_foster(&mut self, pid: PageNum) {
        LittleEndian::write_u32(&mut self.bytes[OFF_FOSTER..], pid);
    }

    pub fn level(&self) -> u16 {
        LittleEndian::read_u16(&self.bytes[OFF_LEVEL..])
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 1
    }

    pub fn is_node(&self) -> bool {
        self.level() > 1
    }

    fn fence_low_len(&self) -> usize {
        LittleEndian::read_u16(&self.bytes[OFF_FENCE_LOW_LEN..]) as usize
    }

    fn fence_high_len(&self) -> usize {
        LittleEndian::read_u16(&self.bytes[OFF_FENCE_HIGH_LEN..]) as usize
    }

    fn chain_high_len(&self) -> usize {
        LittleEndian::read_u16(&self.bytes[OFF_CHAIN_HIGH_LEN..]) as usize
    }

    pub fn has_chain_high(&self) -> bool {
        self.chain_high_len() > 0
    }

    pub fn prefix_len(&self) -> usize {
        LittleEndian::read_u16(&self.bytes[OFF_PREFIX_LEN..]) as usize
    }

    pub fn skewed_insertions(&self) -> i16 {
        LittleEndian::read_i16(&self.bytes[OFF_SKEWED..])
    }

    fn set_skewed_insertions(&mut self, count: i16) {
        LittleEndian::write_i16(&mut self.bytes[OFF_SKEWED..], count);
    }

    fn nitems(&self) -> usize {
        LittleEndian::read_u16(&self.bytes[OFF_NITEMS..]) as usize
    }

    fn set_nitems(&mut self, n: usize) {
        LittleEndian::write_u16(&mut self.bytes[OFF_NITEMS..], n as u16);
    }

    pub fn nghosts(&self) -> usize {
        LittleEndian::read_u16(&self.bytes[OFF_NGHOSTS..]) as usize
    }

    fn set_nghosts(&mut self, n: usize) {
        LittleEndian::write_u16(&mut self.bytes[OFF_NGHOSTS..], n as u16);
    }

    fn record_head(&self) -> usize {
        LittleEndian::read_u16(&self.bytes[OFF_RECORD_HEAD..]) as usize
    }

    fn set_record_head(&mut self, units: usize) {
        LittleEndian::write_u16(&mut self.bytes[OFF_RECORD_HEAD..], units as u16);
    }

    /// Number of record slots (the fence slot is excluded).
    pub fn nrecs(&self) -> usize {
        self.nitems().saturating_sub(1)
    }

    // Slot directory plumbing. `item` indexes all slots including slot 0.

    fn head_offset(item: usize) -> usize {
        HEADER_SIZE + item * 4
    }

    fn slot_offset8(&self, item: usize) -> i16 {
        LittleEndian::read_i16(&self.bytes[Self::head_offset(item)..])
    }

    fn set_slot_offset8(&mut self, item: usize, offset8: i16) {
        LittleEndian::write_i16(&mut self.bytes[Self::head_offset(item)..], offset8);
    }

    fn poor_key(&self, item: usize) -> u16 {
        LittleEndian::read_u16(&self.bytes[Self::head_offset(item) + 2..])
    }

    fn set_poor_key(&mut self, item: usize, poor: u16) {
        LittleEndian::write_u16(&mut self.bytes[Self::head_offset(item) + 2..], poor);
    }

    fn body_start(&self, item: usize) -> usize {
        let offset8 = self.slot_offset8(item);
        let units = offset8.unsigned_abs() as usize;
        HEADER_SIZE + units * 8
    }

    fn slot_len(&self, item: usize) -> usize {
        let start = self.body_start(item);
        if item != 0 && self.is_node() {
            LittleEndian::read_u16(&self.bytes[start + 4..]) as usize
        } else {
            LittleEndian::read_u16(&self.bytes[start..]) as usize
        }
    }

    pub fn is_ghost(&self, slot: SlotIndex) -> bool {
        self.slot_offset8(slot + 1) < 0
    }

    /// Continuous free space between the last slot head and the lowest body.
    pub fn usable_space(&self) -> usize {
        self.record_head() * 8 - self.nitems() * 4
    }

    /// Space an item of `body_len` bytes will consume, head included.
    pub fn predict_item_space(body_len: usize) -> usize {
        body_len.div_ceil(8) * 8 + 4
    }

    // Formatting.

    /// Initializes the page with the given identity and fence triple,
    /// leaving it empty. `fence_high` is stored with the common prefix of
    /// the two fences stripped; `chain_high` is stored in full.
    #[allow(clippy::too_many_arguments)]
    pub fn format(
        &mut self,
        pid: PageId,
        root: PageNum,
        level: u16,
        pid0: PageNum,
        foster: PageNum,
        fence_low: &[u8],
        fence_high: &[u8],
        chain_high: &[u8],
    ) {
        self.bytes.fill(0);
        self.set_pid(pid);
        LittleEndian::write_u32(&mut self.bytes[OFF_ROOT..], root);
        LittleEndian::write_u32(&mut self.bytes[OFF_PID0..], pid0);
        LittleEndian::write_u32(&mut self.bytes[OFF_FOSTER..], foster);
        LittleEndian::write_u16(&mut self.bytes[OFF_LEVEL..], level);

        let prefix = common_prefix(fence_low, fence_high);
        LittleEndian::write_u16(&mut self.bytes[OFF_FENCE_LOW_LEN..], fence_low.len() as u16);
        LittleEndian::write_u16(&mut self.bytes[OFF_FENCE_HIGH_LEN..], fence_high.len() as u16);
        LittleEndian::write_u16(&mut self.bytes[OFF_CHAIN_HIGH_LEN..], chain_high.len() as u16);
        LittleEndian::write_u16(&mut self.bytes[OFF_PREFIX_LEN..], prefix as u16);

        self.set_record_head(DATA_UNITS);
        self.set_nitems(0);

        // Fence slot body: slot_len, low (in full), high without prefix,
        // chain-high (in full).
        let high_suffix = &fence_high[prefix..];
        let body_len = 2 + fence_low.len() + high_suffix.len() + chain_high.len();
        let mut body = Vec::with_capacity(body_len);
        body.extend_from_slice(&(body_len as u16).to_le_bytes());
        body.extend_from_slice(fence_low);
        body.extend_from_slice(high_suffix);
        body.extend_from_slice(chain_high);
        self.insert_item(0, false, 0, &body);
    }

    /// Rewrites the fence slot. When the common prefix of the new fences
    /// differs from the stored one, the page is rebuilt so that record keys
    /// are re-encoded under the new prefix. Fails (returns false) only when
    /// the page cannot hold the new triple even after compaction.
    pub fn replace_fences(
        &mut self,
        fence_low: &[u8],
        fence_high: &[u8],
        chain_high: &[u8],
    ) -> bool {
        let prefix = common_prefix(fence_low, fence_high);
        if prefix != self.prefix_len() {
            // Prefix change: re-encode every record under the new fences.
            let lsn = self.lsn();
            let mut scratch = BtreePage::new();
            scratch.copy_from(self);
            self.format(
                scratch.pid(),
                scratch.root(),
                scratch.level(),
                scratch.pid0(),
                scratch.foster(),
                fence_low,
                fence_high,
                chain_high,
            );
            self.steal_records(&scratch, 0, scratch.nrecs());
            self.set_lsn(lsn);
            return true;
        }

        let high_suffix = &fence_high[prefix..];
        let body_len = 2 + fence_low.len() + high_suffix.len() + chain_high.len();
        let mut body = Vec::with_capacity(body_len);
        body.extend_from_slice(&(body_len as u16).to_le_bytes());
        body.extend_from_slice(fence_low);
        body.extend_from_slice(high_suffix);
        body.extend_from_slice(chain_high);

        if !self.resize_item(0, body.len(), 0) {
            self.compact(false);
            if !self.resize_item(0, body.len(), 0) {
                return false;
            }
        }
        self.replace_item_data(0, 0, &body);
        LittleEndian::write_u16(&mut self.bytes[OFF_FENCE_LOW_LEN..], fence_low.len() as u16);
        LittleEndian::write_u16(&mut self.bytes[OFF_FENCE_HIGH_LEN..], fence_high.len() as u16);
        LittleEndian::write_u16(&mut self.bytes[OFF_CHAIN_HIGH_LEN..], chain_high.len() as u16);
        true
    }

    // Fence accessors.

    fn fence_body(&self) -> &[u8] {
        let start = self.body_start(0);
        &self.bytes[start + 2..start + self.slot_len(0)]
    }

    pub fn fence_low(&self) -> &[u8] {
        &self.fence_body()[..self.fence_low_len()]
    }

    pub fn fence_high(&self) -> Vec<u8> {
        let prefix = self.prefix_len();
        let suffix_len = self.fence_high_len() - prefix;
        let body = self.fence_body();
        let low_len = self.fence_low_len();
        let mut key = Vec::with_capacity(self.fence_high_len());
        key.extend_from_slice(&body[..prefix]);
        key.extend_from_slice(&body[low_len..low_len + suffix_len]);
        key
    }

    pub fn chain_high(&self) -> &[u8] {
        let low_len = self.fence_low_len();
        let high_suffix_len = self.fence_high_len() - self.prefix_len();
        let start = low_len + high_suffix_len;
        &self.fence_body()[start..start + self.chain_high_len()]
    }

    fn prefix(&self) -> &[u8] {
        &self.fence_low()[..self.prefix_len()]
    }

    /// True when `key` falls in `[fence_low, fence_high)`. An empty
    /// fence-low means negative infinity; an empty fence-high means
    /// positive infinity.
    pub fn fence_contains(&self, key: &[u8]) -> bool {
        if key < self.fence_low() {
            return false;
        }
        let high = self.fence_high();
        high.is_empty() || key < high.as_slice()
    }

    /// True when `key` falls under this page's foster chain, i.e. beyond
    /// fence-high but below chain-fence-high.
    pub fn chain_contains(&self, key: &[u8]) -> bool {
        if !self.has_chain_high() {
            return false;
        }
        key >= self.fence_high().as_slice() && key < self.chain_high()
    }

    // Low-level item operations. `item` 0 is the fence slot.

    /// Inserts a body at `item`, shifting later slot heads right. Returns
    /// false when the page is full (caller compacts or splits).
    pub fn insert_item(&mut self, item: usize, ghost: bool, poor: u16, body: &[u8]) -> bool {
        debug_assert!(item <= self.nitems());
        let units = body.len().div_ceil(8);
        if self.usable_space() < units * 8 + 4 {
            return false;
        }
        let new_head = self.record_head() - units;
        let start = HEADER_SIZE + new_head * 8;
        self.bytes[start..start + body.len()].copy_from_slice(body);

        // Shift heads [item..) up by one.
        let n = self.nitems();
        for i in (item..n).rev() {
            let off = self.slot_offset8(i);
            let poor_i = self.poor_key(i);
            self.set_slot_offset8(i + 1, off);
            self.set_poor_key(i + 1, poor_i);
        }
        let offset8 = if ghost {
            -(new_head as i16)
        } else {
            new_head as i16
        };
        self.set_slot_offset8(item, offset8);
        self.set_poor_key(item, poor);
        self.set_record_head(new_head);
        self.set_nitems(n + 1);
        if ghost {
            self.set_nghosts(self.nghosts() + 1);
        }
        true
    }

    /// Removes the slot head at `item`. The body bytes become dead space
    /// until the next compaction.
    pub fn delete_item(&mut self, item: usize) {
        let n = self.nitems();
        debug_assert!(item < n);
        if self.slot_offset8(item) < 0 {
            self.set_nghosts(self.nghosts() - 1);
        }
        // Reclaim contiguous space if this was the lowest body.
        let units = self.slot_len(item).div_ceil(8);
        let offset8 = self.slot_offset8(item).unsigned_abs() as usize;
        if offset8 == self.record_head() {
            self.set_record_head(offset8 + units);
        }
        for i in item..n - 1 {
            let off = self.slot_offset8(i + 1);
            let poor = self.poor_key(i + 1);
            self.set_slot_offset8(i, off);
            self.set_poor_key(i, poor);
        }
        self.set_nitems(n - 1);
    }

    /// Grows or shrinks the body of `item` to `new_len` bytes, keeping the
    /// first `keep` bytes. Returns false when the page is full.
    pub fn resize_item(&mut self, item: usize, new_len: usize, keep: usize) -> bool {
        let old_start = self.body_start(item);
        let old_len = self.slot_len(item);
        let old_units = old_len.div_ceil(8);
        let new_units = new_len.div_ceil(8);

        if new_units <= old_units {
            // Fits in place; just rewrite the stored length below.
        } else {
            if self.usable_space() < new_units * 8 {
                return false;
            }
            let new_head = self.record_head() - new_units;
            let new_start = HEADER_SIZE + new_head * 8;
            let (src, dst) = (old_start, new_start);
            self.bytes.copy_within(src..src + keep, dst);
            let ghost = self.slot_offset8(item) < 0;
            let offset8 = if ghost {
                -(new_head as i16)
            } else {
                new_head as i16
            };
            self.set_slot_offset8(item, offset8);
            self.set_record_head(new_head);
        }
        let start = self.body_start(item);
        if item != 0 && self.is_node() {
            LittleEndian::write_u16(&mut self.bytes[start + 4..], new_len as u16);
        } else {
            LittleEndian::write_u16(&mut self.bytes[start..], new_len as u16);
        }
        true
    }

    /// Overwrites body bytes of `item` starting at `at` (relative to the
    /// body start) with `data`, within the current body length.
    pub fn replace_item_data(&mut self, item: usize, at: usize, data: &[u8]) {
        let start = self.body_start(item);
        debug_assert!(at + data.len() <= self.slot_len(item));
        self.bytes[start + at..start + at + data.len()].copy_from_slice(data);
    }

    pub fn mark_ghost(&mut self, slot: SlotIndex) {
        let item = slot + 1;
        let offset8 = self.slot_offset8(item);
        debug_assert!(offset8 > 0);
        self.set_slot_offset8(item, -offset8);
        self.set_nghosts(self.nghosts() + 1);
    }

    pub fn unmark_ghost(&mut self, slot: SlotIndex) {
        let item = slot + 1;
        let offset8 = self.slot_offset8(item);
        debug_assert!(offset8 < 0);
        self.set_slot_offset8(item, -offset8);
        self.set_nghosts(self.nghosts() - 1);
    }

    /// Defragments the item area into contiguous free space. With
    /// `drop_ghosts`, ghost records are reclaimed rather than kept.
    pub fn compact(&mut self, drop_ghosts: bool) {
        let n = self.nitems();
        let mut bodies: Vec<(i16, u16, Vec<u8>)> = Vec::with_capacity(n);
        for item in 0..n {
            let ghost = self.slot_offset8(item) < 0;
            if drop_ghosts && ghost && item > 0 {
                continue;
            }
            let start = self.body_start(item);
            let len = self.slot_len(item);
            bodies.push((
                if ghost { -1 } else { 1 },
                self.poor_key(item),
                self.bytes[start..start + len].to_vec(),
            ));
        }
        let mut head = DATA_UNITS;
        self.set_nitems(0);
        self.set_nghosts(0);
        self.set_record_head(DATA_UNITS);
        for (i, (sign, poor, body)) in bodies.iter().enumerate() {
            let units = body.len().div_ceil(8);
            head -= units;
            let start = HEADER_SIZE + head * 8;
            self.bytes[start..start + body.len()].copy_from_slice(body);
            let offset8 = if *sign < 0 {
                self.set_nghosts(self.nghosts() + 1);
                -(head as i16)
            } else {
                head as i16
            };
            self.set_slot_offset8(i, offset8);
            self.set_poor_key(i, *poor);
            self.set_nitems(i + 1);
        }
        self.set_record_head(head);
    }

    // Record-level accessors. `slot` indexes records: item = slot + 1.

    /// Key suffix (prefix stripped) of a record slot.
    pub fn key_suffix(&self, slot: SlotIndex) -> &[u8] {
        let item = slot + 1;
        let start = self.body_start(item);
        if self.is_leaf() {
            let key_len = LittleEndian::read_u16(&self.bytes[start + 2..]) as usize;
            &self.bytes[start + 4..start + 4 + key_len]
        } else {
            let slot_len = self.slot_len(item);
            &self.bytes[start + 6..start + slot_len]
        }
    }

    /// Full key of a record slot, prefix restored.
    pub fn key(&self, slot: SlotIndex) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix_len() + self.key_suffix(slot).len());
        key.extend_from_slice(self.prefix());
        key.extend_from_slice(self.key_suffix(slot));
        key
    }

    /// Value bytes of a leaf record.
    pub fn value(&self, slot: SlotIndex) -> &[u8] {
        debug_assert!(self.is_leaf());
        let item = slot + 1;
        let start = self.body_start(item);
        let slot_len = self.slot_len(item);
        let key_len = LittleEndian::read_u16(&self.bytes[start + 2..]) as usize;
        &self.bytes[start + 4 + key_len..start + slot_len]
    }

    /// Child pointer of an interior record.
    pub fn child(&self, slot: SlotIndex) -> PageNum {
        debug_assert!(self.is_node());
        let start = self.body_start(slot + 1);
        LittleEndian::read_u32(&self.bytes[start..])
    }

    fn poor_of(suffix: &[u8]) -> u16 {
        let mut bytes = [0u8; 2];
        for (i, b) in suffix.iter().take(2).enumerate() {
            bytes[i] = *b;
        }
        BigEndian::read_u16(&bytes)
    }

    fn strip_prefix<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        let prefix = self.prefix_len();
        debug_assert!(key.len() >= prefix && &key[..prefix] == self.prefix());
        &key[prefix..]
    }

    /// Binary search among leaf records. Returns the slot the key occupies
    /// (found) or would be inserted at (not found). Ghosts participate.
    pub fn search_leaf(&self, key: &[u8]) -> (SlotIndex, bool) {
        debug_assert!(self.is_leaf());
        let suffix = self.strip_prefix(key);
        let poor = Self::poor_of(suffix);
        let mut low = 0usize;
        let mut high = self.nrecs();
        while low < high {
            let mid = (low + high) / 2;
            let mid_poor = self.poor_key(mid + 1);
            let ord = if mid_poor != poor {
                mid_poor.cmp(&poor)
            } else {
                self.key_suffix(mid).cmp(suffix)
            };
            match ord {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return (mid, true),
            }
        }
        (low, false)
    }

    /// Search among interior records: the slot whose separator is the
    /// greatest key ≤ `key`, or None when `key` precedes every separator
    /// (follow `pid0`).
    pub fn search_node(&self, key: &[u8]) -> Option<SlotIndex> {
        debug_assert!(self.is_node());
        let suffix = self.strip_prefix(key);
        let mut low = 0usize;
        let mut high = self.nrecs();
        while low < high {
            let mid = (low + high) / 2;
            if self.key_suffix(mid) <= suffix {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low.checked_sub(1)
    }

    // Record insertion.

    /// Inserts a leaf record at `slot`. Returns false when the page is full
    /// even after compaction would not help (caller splits).
    pub fn insert_leaf(&mut self, slot: SlotIndex, key: &[u8], value: &[u8], ghost: bool) -> bool {
        debug_assert!(self.is_leaf());
        let suffix = self.strip_prefix(key).to_vec();
        let body_len = 4 + suffix.len() + value.len();
        let mut body = Vec::with_capacity(body_len);
        body.extend_from_slice(&(body_len as u16).to_le_bytes());
        body.extend_from_slice(&(suffix.len() as u16).to_le_bytes());
        body.extend_from_slice(&suffix);
        body.extend_from_slice(value);
        if !self.insert_item(slot + 1, ghost, Self::poor_of(&suffix), &body) {
            return false;
        }
        self.note_insertion_skew(slot);
        true
    }

    /// Inserts an interior record (separator + child) at `slot`.
    pub fn insert_node(&mut self, slot: SlotIndex, key: &[u8], child: PageNum) -> bool {
        debug_assert!(self.is_node());
        let suffix = self.strip_prefix(key).to_vec();
        let body_len = 6 + suffix.len();
        let mut body = Vec::with_capacity(body_len);
        body.extend_from_slice(&child.to_le_bytes());
        body.extend_from_slice(&(body_len as u16).to_le_bytes());
        body.extend_from_slice(&suffix);
        if !self.insert_item(slot + 1, false, Self::poor_of(&suffix), &body) {
            return false;
        }
        self.note_insertion_skew(slot);
        true
    }

    /// Replaces the value of a leaf record. Returns false when the page
    /// cannot hold the grown record.
    pub fn replace_value(&mut self, slot: SlotIndex, value: &[u8]) -> bool {
        debug_assert!(self.is_leaf());
        let item = slot + 1;
        let key_len = self.key_suffix(slot).len();
        let new_len = 4 + key_len + value.len();
        if !self.resize_item(item, new_len, 4 + key_len) {
            return false;
        }
        self.replace_item_data(item, 4 + key_len, value);
        true
    }

    /// Overwrites part of a leaf value in place.
    pub fn overwrite_value(&mut self, slot: SlotIndex, at: usize, data: &[u8]) {
        debug_assert!(self.is_leaf());
        let key_len = self.key_suffix(slot).len();
        debug_assert!(at + data.len() <= self.value(slot).len());
        self.replace_item_data(slot + 1, 4 + key_len + at, data);
    }

    /// Tracks the skew of consecutive insertions. Inserts at the rightmost
    /// slot increment the counter, leftmost decrement, middle resets.
    /// The counter is never logged.
    fn note_insertion_skew(&mut self, slot: SlotIndex) {
        let counter = self.skewed_insertions();
        if slot + 1 == self.nrecs() {
            self.set_skewed_insertions(counter.saturating_add(1).max(1));
        } else if slot == 0 {
            self.set_skewed_insertions(counter.saturating_sub(1).min(-1));
        } else {
            self.set_skewed_insertions(0);
        }
    }

    /// True when the page is skewed right hard enough that a no-record
    /// split is preferable to moving half the records.
    pub fn is_insertion_extremely_skewed_right(&self) -> bool {
        self.skewed_insertions() >= 5
    }

    /// Space check for an insert without performing it.
    pub fn fits(&self, body_len: usize) -> bool {
        self.usable_space() >= Self::predict_item_space(body_len)
    }

    pub fn fits_leaf_entry(&self, key_len: usize, value_len: usize) -> bool {
        let suffix = key_len - self.prefix_len();
        self.fits(4 + suffix + value_len)
    }

    pub fn fits_node_entry(&self, key_len: usize) -> bool {
        let suffix = key_len - self.prefix_len();
        self.fits(6 + suffix)
    }

    /// Total bytes occupied by live (non-ghost) record bodies.
    pub fn used_body_bytes(&self) -> usize {
        (1..self.nitems())
            .filter(|item| self.slot_offset8(*item) > 0)
            .map(|item| self.slot_len(item).div_ceil(8) * 8 + 4)
            .sum()
    }

    /// Picks the fence key and slot for splitting this page.
    ///
    /// If insertions are extremely right-skewed and the trigger key lies at
    /// or beyond the last slot, returns `(trigger_key, nrecs)` — a
    /// no-record split: the new sibling starts empty and receives the
    /// skewed inserts. Otherwise returns the midpoint by body bytes.
    pub fn suggest_fence_for_split(&self, trigger_key: &[u8]) -> (Vec<u8>, SlotIndex) {
        let nrecs = self.nrecs();
        debug_assert!(nrecs > 0);
        if self.is_insertion_extremely_skewed_right() {
            let last = self.key(nrecs - 1);
            if trigger_key > last.as_slice() {
                return (trigger_key.to_vec(), nrecs);
            }
        }
        // Midpoint by accumulated body bytes. A page never fills with a
        // single record (entries are bounded well below half a page).
        debug_assert!(nrecs >= 2);
        let total: usize = (0..nrecs)
            .map(|slot| self.slot_len(slot + 1).div_ceil(8) * 8)
            .sum();
        let mut acc = 0usize;
        let mut split = nrecs / 2;
        for slot in 0..nrecs {
            acc += self.slot_len(slot + 1).div_ceil(8) * 8;
            if acc * 2 >= total {
                split = slot.max(0) + 1;
                break;
            }
        }
        if split >= nrecs {
            split = nrecs - 1;
        }
        if split == 0 {
            split = 1;
        }
        (self.key(split), split)
    }

    /// Copies record slots `[from, to)` of `source` into this page,
    /// appending after the existing records. Used while formatting a split
    /// sibling or refilling a merge target.
    pub fn steal_records(&mut self, source: &BtreePage, from: SlotIndex, to: SlotIndex) {
        debug_assert_eq!(self.level(), source.level());
        for slot in from..to {
            let ghost = source.is_ghost(slot);
            let key = source.key(slot);
            let at = self.nrecs();
            let ok = if self.is_leaf() {
                self.insert_leaf(at, &key, source.value(slot), ghost)
            } else {
                self.insert_node(at, &key, source.child(slot))
            };
            assert!(ok, "steal target cannot be full");
        }
        // Stealing is formatting, not user insertion.
        self.set_skewed_insertions(0);
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
