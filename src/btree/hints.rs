//! Approximate per-page counters that steer opportunistic maintenance.
//!
//! Two tables: how often a conditional latch upgrade failed on a page
//! (`ex_need`), and how many foster children a page is believed to have
//! (`foster_children`). Both are racy by design; traversals consult them to
//! decide whether an opportunistic adoption is worth attempting. They never
//! affect correctness.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::lsn::PageNum;

#[derive(Default)]
pub struct LatchHints {
    ex_need: SkipMap<PageNum, AtomicU32>,
    foster_children: SkipMap<PageNum, AtomicU32>,
}

impl LatchHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increase_ex_need(&self, pid: PageNum) {
        self.ex_need
            .get_or_insert_with(pid, || AtomicU32::new(0))
            .value()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear_ex_need(&self, pid: PageNum) {
        if let Some(entry) = self.ex_need.get(&pid) {
            entry.value().store(0, Ordering::Relaxed);
        }
    }

    pub fn ex_need(&self, pid: PageNum) -> u32 {
        self.ex_need
            .get(&pid)
            .map(|e| e.value().load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn increase_foster_children(&self, pid: PageNum) {
        self.foster_children
            .get_or_insert_with(pid, || AtomicU32::new(0))
            .value()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear_foster_children(&self, pid: PageNum) {
        if let Some(entry) = self.foster_children.get(&pid) {
            entry.value().store(0, Ordering::Relaxed);
        }
    }

    /// Believed number of foster children below this page. May be stale in
    /// either direction.
    pub fn expected_foster_children(&self, pid: PageNum) -> u32 {
        self.foster_children
            .get(&pid)
            .map(|e| e.value().load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_clear() {
        let hints = LatchHints::new();
        assert_eq!(hints.ex_need(7), 0);
        hints.increase_ex_need(7);
        hints.increase_ex_need(7);
        assert_eq!(hints.ex_need(7), 2);
        hints.clear_ex_need(7);
        assert_eq!(hints.ex_need(7), 0);

        hints.increase_foster_children(9);
        assert_eq!(hints.expected_foster_children(9), 1);
        hints.clear_foster_children(9);
        assert_eq!(hints.expected_foster_children(9), 0);
    }
}
