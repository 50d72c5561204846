//! Bounded ring of fixed-size blocks between pipeline threads.
//!
//! The reader produces blocks the consumer parses; block assembly produces
//! blocks the writer persists. Backpressure on both sides comes from the
//! fixed block count: a producer blocks while no free block exists, a
//! consumer blocks while no full block exists. The `finished` flag drains
//! the ring on shutdown: producers get None immediately, consumers keep
//! receiving blocks until the ring is empty and only then get None.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub struct RingBuffer {
    block_size: usize,
    state: Mutex<State>,
    changed: Condvar,
}

struct State {
    free: Vec<Box<[u8]>>,
    full: VecDeque<Box<[u8]>>,
    /// Blocks handed to a consumer and not yet released. Part of the
    /// emptiness condition: a popped block is still being worked on.
    in_flight: usize,
    finished: bool,
}

impl RingBuffer {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        let free = (0..block_count)
            .map(|_| vec![0u8; block_size].into_boxed_slice())
            .collect();
        Self {
            block_size,
            state: Mutex::new(State {
                free,
                full: VecDeque::new(),
                in_flight: 0,
                finished: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Takes a free block to fill, blocking while none is available.
    /// Returns None once the ring is finished.
    pub fn producer_request(&self) -> Option<Box<[u8]>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.finished {
                return None;
            }
            if let Some(block) = state.free.pop() {
                return Some(block);
            }
            state = self.changed.wait(state).unwrap();
        }
    }

    /// Returns a requested block unfilled (the producer hit an error).
    pub fn producer_cancel(&self, block: Box<[u8]>) {
        let mut state = self.state.lock().unwrap();
        state.free.push(block);
        drop(state);
        self.changed.notify_all();
    }

    /// Publishes a filled block to the consumer side.
    pub fn producer_release(&self, block: Box<[u8]>) {
        let mut state = self.state.lock().unwrap();
        state.full.push_back(block);
        drop(state);
        self.changed.notify_all();
    }

    /// Takes the oldest filled block, blocking while none is available.
    /// Returns None only when the ring is finished *and* drained, so no
    /// published block is ever lost to a shutdown.
    pub fn consumer_request(&self) -> Option<Box<[u8]>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(block) = state.full.pop_front() {
                state.in_flight += 1;
                return Some(block);
            }
            if state.finished {
                return None;
            }
            state = self.changed.wait(state).unwrap();
        }
    }

    /// Returns a drained block to the free pool.
    pub fn consumer_release(&self, block: Box<[u8]>) {
        let mut state = self.state.lock().unwrap();
        state.free.push(block);
        state.in_flight -= 1;
        drop(state);
        self.changed.notify_all();
    }

    pub fn set_finished(&self) {
        self.state.lock().unwrap().finished = true;
        self.changed.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }

    /// True when no filled block is waiting or being worked on.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.full.is_empty() && state.in_flight == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn blocks_flow_producer_to_consumer() {
        let ring = RingBuffer::new(16, 2);
        let mut block = ring.producer_request().unwrap();
        block[0] = 42;
        ring.producer_release(block);
        let block = ring.consumer_request().unwrap();
        assert_eq!(block[0], 42);
        ring.consumer_release(block);
    }

    #[test]
    fn producer_blocks_at_capacity_until_consumer_frees() {
        let ring = Arc::new(RingBuffer::new(8, 1));
        let a = ring.producer_request().unwrap();
        ring.producer_release(a);

        let ring2 = ring.clone();
        let handle = thread::spawn(move || {
            // Blocks until the main thread consumes.
            let block = ring2.producer_request();
            block.is_some()
        });

        let block = ring.consumer_request().unwrap();
        ring.consumer_release(block);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn finished_ring_drains_before_none() {
        let ring = RingBuffer::new(8, 2);
        let block = ring.producer_request().unwrap();
        ring.producer_release(block);
        ring.set_finished();

        assert!(ring.producer_request().is_none());
        // The published block survives the shutdown.
        assert!(ring.consumer_request().is_some());
        assert!(ring.consumer_request().is_none());
    }
}
