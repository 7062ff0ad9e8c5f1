//! FIFO task queues with blocking pop, EOF close, and tail stealing.
//!
//! A queue moves through three states: open (pushes accepted, blocking pops
//! wait), draining (closed but tasks remain), closed (empty; pops return
//! EOF). `steal` takes from the tail to stay off the owner's pop end and
//! never observes EOF.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};

use tessel_common::{Result, SchedulerError};

use crate::locked;
use crate::task::Task;

/// Outcome of a blocking [`TaskQueue::pop`].
#[derive(Debug)]
pub enum Popped<T> {
    Task(Task<T>),
    Eof,
}

/// Outcome of a non-blocking [`TaskQueue::try_pop`].
#[derive(Debug)]
pub enum Polled<T> {
    Task(Task<T>),
    Empty,
    Eof,
}

struct QueueState<T> {
    tasks: VecDeque<Task<T>>,
    closed: bool,
}

/// Thread-safe FIFO of pending tasks terminated by an EOF sentinel.
pub struct TaskQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState { tasks: VecDeque::new(), closed: false }),
            available: Condvar::new(),
        }
    }

    /// Append a task. Fails once the queue has been closed.
    pub fn push(&self, task: Task<T>) -> Result<()> {
        let mut state = locked(&self.state);
        if state.closed {
            return Err(SchedulerError::QueueClosed.into());
        }
        state.tasks.push_back(task);
        self.available.notify_one();
        Ok(())
    }

    /// Blocking pop: waits until a task or EOF is available.
    pub fn pop(&self) -> Popped<T> {
        let mut state = locked(&self.state);
        loop {
            if let Some(task) = state.tasks.pop_front() {
                return Popped::Task(task);
            }
            if state.closed {
                return Popped::Eof;
            }
            state = self.available.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Polled<T> {
        let mut state = locked(&self.state);
        if let Some(task) = state.tasks.pop_front() {
            Polled::Task(task)
        } else if state.closed {
            Polled::Eof
        } else {
            Polled::Empty
        }
    }

    /// Non-blocking steal from the tail. Returns `None` when nothing is
    /// pending, whether or not the queue has been closed.
    pub fn steal(&self) -> Option<Task<T>> {
        locked(&self.state).tasks.pop_back()
    }

    /// Append the EOF sentinel and wake all waiters. Remaining tasks drain
    /// before blocked pops start returning EOF.
    pub fn close(&self) {
        locked(&self.state).closed = true;
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        locked(&self.state).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        locked(&self.state).closed
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
