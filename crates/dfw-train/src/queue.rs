use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Unbounded FIFO with task accounting.
///
/// Every `put` adds an unfinished task and every `task_done` retires one;
/// `join` blocks until none are left. `close` wakes consumers, whose `get`
/// then returns `None` once the queue is drained. When the consumer dies,
/// `mark_consumer_gone` makes `join` return instead of waiting forever.
pub struct JoinableQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
    finished: Condvar,
}

struct State<T> {
    items: VecDeque<T>,
    unfinished: usize,
    closed: bool,
    consumer_gone: bool,
}

impl<T> Default for JoinableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JoinableQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                unfinished: 0,
                closed: false,
                consumer_gone: false,
            }),
            available: Condvar::new(),
            finished: Condvar::new(),
        }
    }

    /// Enqueue `item`. Returns it back if the queue is closed.
    pub fn put(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        state.unfinished += 1;
        self.available.notify_one();
        Ok(())
    }

    /// Block for the next item; `None` once closed and drained.
    pub fn get(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    pub fn task_done(&self) {
        let mut state = self.state.lock();
        assert!(state.unfinished > 0, "task_done called more times than put");
        state.unfinished -= 1;
        if state.unfinished == 0 {
            self.finished.notify_all();
        }
    }

    /// Block until every submitted item has been acknowledged, or the
    /// consumer is gone.
    pub fn join(&self) {
        let mut state = self.state.lock();
        while state.unfinished > 0 && !state.consumer_gone {
            self.finished.wait(&mut state);
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn mark_consumer_gone(&self) {
        self.state.lock().consumer_gone = true;
        self.finished.notify_all();
    }

    pub fn consumer_gone(&self) -> bool {
        self.state.lock().consumer_gone
    }

    /// Marks the consumer gone when dropped, including while unwinding
    /// from a panic in the consumer loop.
    pub fn consumer_guard(&self) -> ConsumerGuard<'_, T> {
        ConsumerGuard { queue: self }
    }

    /// Items waiting to be taken.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items put but not yet acknowledged.
    pub fn unfinished(&self) -> usize {
        self.state.lock().unfinished
    }
}

pub struct ConsumerGuard<'a, T> {
    queue: &'a JoinableQueue<T>,
}

impl<T> Drop for ConsumerGuard<'_, T> {
    fn drop(&mut self) {
        self.queue.mark_consumer_gone();
    }
}
