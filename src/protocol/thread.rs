use std::{
    io,
    panic::{self, AssertUnwindSafe},
    thread,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads running blocking database operations.
///
/// Jobs are taken from a single FIFO queue, so they start in submission order.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<Sender<Job>>,
}

impl ThreadPool {
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = unbounded();

        for i in 0..size {
            workers.push(Worker::new(i, receiver.clone())?);
        }

        Ok(Self {
            workers,
            sender: Some(sender),
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        let sent = self.sender.as_ref().map(|sender| sender.send(job));
        if !matches!(sent, Some(Ok(()))) {
            warn!("worker pool is shut down, dropping job");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            // queued jobs hold the pool, so the last handle may go away on a worker
            if worker.thread.thread().id() == thread::current().id() {
                debug!("worker {} dropped the pool, detaching", worker.id);
                continue;
            }
            debug!("shutting down worker {}", worker.id);

            if worker.thread.join().is_err() {
                warn!("worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Receiver<Job>) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("sqlmux-worker-{id}"))
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        warn!("job on worker {id} panicked");
                    }
                }
                debug!("worker {id} disconnected");
            })?;

        Ok(Self { id, thread })
    }
}
