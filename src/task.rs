//! Background tasks and one-shot completion events.
//!
//! A [`TaskHandle`] owns the thread it spawned and `join` hands back the
//! result. Callers that need to wait without joining share a [`Completion`].

use std::io;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

/// Manual-reset event that starts unsignaled and is signaled once.
#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.done.lock()
    }

    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

pub struct TaskHandle<T> {
    thread: JoinHandle<T>,
}

impl<T: Send + 'static> TaskHandle<T> {
    pub fn spawn<F>(name: &str, f: F) -> io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let thread = thread::Builder::new().name(name.to_string()).spawn(f)?;
        Ok(Self { thread })
    }

    /// Wait for the task and take its result. `Err` carries a panic payload.
    pub fn join(self) -> thread::Result<T> {
        self.thread.join()
    }
}

/// Tasks joined together, in spawn order.
pub struct TaskGroup<T> {
    tasks: Vec<TaskHandle<T>>,
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn spawn<F>(&mut self, name: &str, f: F) -> io::Result<()>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.tasks.push(TaskHandle::spawn(name, f)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn join_all(self) -> Vec<thread::Result<T>> {
        self.tasks.into_iter().map(TaskHandle::join).collect()
    }
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}
