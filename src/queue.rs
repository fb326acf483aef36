//! Bounded transmit queue shared by a producer and one background consumer

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::core::{ArincWord, IntoArincWord};
use crate::error::{LinkError, Result};

/// Order in which queued words are taken for transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueOrder {
    /// Oldest word first; the delivery order the protocol requires
    #[default]
    Fifo,
    /// Newest word first
    ///
    /// Reproduces the reordering seen on the bench driver this link replaces.
    /// Not a valid delivery order; kept so the behavior can be compared
    /// against real hardware until it is confirmed or dropped.
    Lifo,
}

#[derive(Debug, Default)]
struct QueueState {
    words: VecDeque<ArincWord>,
    in_flight: bool,
    stopped: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.words.is_empty() && !self.in_flight
    }
}

/// Pending words awaiting transmission
///
/// `enqueue` never blocks; the consumer waits at most one poll interval in
/// [`TxQueue::pop_timeout`] before rechecking.
#[derive(Debug)]
pub struct TxQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    idle: Condvar,
    capacity: usize,
    order: QueueOrder,
}

impl TxQueue {
    /// Create an empty queue holding at most `capacity` words
    pub fn new(capacity: usize, order: QueueOrder) -> Self {
        TxQueue {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            idle: Condvar::new(),
            capacity,
            order,
        }
    }

    /// Append a word
    ///
    /// Fails with [`LinkError::Length`] for anything but 32 bits,
    /// [`LinkError::QueueFull`] when the bound is reached and
    /// [`LinkError::Stopped`] once the queue has been stopped.
    pub fn enqueue(&self, word: impl IntoArincWord) -> Result<()> {
        let word = word.into_arinc_word()?;
        let mut state = self.state.lock();

        if state.stopped {
            return Err(LinkError::Stopped);
        }
        if state.words.len() >= self.capacity {
            warn!(capacity = self.capacity, word = %word, "transmit queue full, word rejected");
            return Err(LinkError::QueueFull {
                capacity: self.capacity,
            });
        }

        state.words.push_back(word);
        self.ready.notify_one();
        Ok(())
    }

    /// Take the next word, waiting up to `timeout` for one to arrive
    ///
    /// Returns `None` on timeout or once the queue is stopped. A returned word
    /// counts as in flight until [`TxQueue::complete`] is called.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<ArincWord> {
        let mut state = self.state.lock();

        if state.words.is_empty() && !state.stopped {
            self.ready.wait_for(&mut state, timeout);
        }
        if state.stopped {
            return None;
        }

        let word = match self.order {
            QueueOrder::Fifo => state.words.pop_front(),
            QueueOrder::Lifo => state.words.pop_back(),
        }?;
        state.in_flight = true;
        Some(word)
    }

    /// Mark the word handed out by the last pop as finished
    pub fn complete(&self) {
        let mut state = self.state.lock();
        state.in_flight = false;
        if state.is_idle() {
            self.idle.notify_all();
        }
    }

    /// Stop handing out words; returns `true` on the first call only
    pub fn stop(&self) -> bool {
        let mut state = self.state.lock();
        let first = !state.stopped;
        state.stopped = true;
        self.ready.notify_all();
        self.idle.notify_all();
        first
    }

    /// Whether [`TxQueue::stop`] has been called
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Remove and return every word that was never started
    pub fn drain(&self) -> Vec<ArincWord> {
        let mut state = self.state.lock();
        let words = state.words.drain(..).collect();
        if state.is_idle() {
            self.idle.notify_all();
        }
        words
    }

    /// Wait until the queue is empty and no word is in flight
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        while !state.is_idle() {
            if state.stopped {
                return false;
            }
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return state.is_idle();
            }
        }
        true
    }

    /// Number of words waiting (excluding one in flight)
    pub fn len(&self) -> usize {
        self.state.lock().words.len()
    }

    /// Whether no word is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured bound
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured removal order
    pub fn order(&self) -> QueueOrder {
        self.order
    }
}
