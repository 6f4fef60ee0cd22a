//! Queued database tasks.
//!
//! Long-running maintenance work is split into bounded chunks: a task runs
//! once, and if it reports `NotDone` it is pushed to the back of the queue so
//! interactive operations interleave with it.

use std::collections::VecDeque;

use crate::backend::HistoryBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Done,
    NotDone,
}

pub trait BackendTask {
    fn run(&mut self, backend: &mut HistoryBackend) -> TaskStatus;
}

pub struct QueuedTask {
    pub task: Box<dyn BackendTask>,
    /// Checked right before each run; canceled tasks are dropped silently.
    pub is_canceled: Box<dyn Fn() -> bool>,
}

impl QueuedTask {
    pub fn new(task: Box<dyn BackendTask>) -> Self {
        QueuedTask {
            task,
            is_canceled: Box::new(|| false),
        }
    }

    pub fn cancelable(task: Box<dyn BackendTask>, is_canceled: Box<dyn Fn() -> bool>) -> Self {
        QueuedTask { task, is_canceled }
    }
}

/// FIFO queue of pending tasks. Owned by the engine; drained one task per
/// `run_next` call.
#[derive(Default)]
pub struct TaskQueue {
    tasks: VecDeque<QueuedTask>,
}

impl TaskQueue {
    pub fn push(&mut self, task: QueuedTask) {
        self.tasks.push_back(task);
    }

    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.tasks.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}
