//! Streams and the per-session stream registry.
//!
//! A stream is a logical SQL connection multiplexed over a session. Each stream owns exactly one
//! backing [`Connection`] and a queue of pending jobs.
//!
//! # Ordering
//!
//! Jobs are queued on the stream in the order the session received their requests. At most one
//! job per stream is handed to the shared [`ThreadPool`] at a time; when it finishes, the stream
//! goes back to the end of the pool queue if more jobs are waiting. Operations on one stream
//! therefore apply in receipt order, and a worker never sits idle waiting for a stream: a stream
//! with a slow statement and a deep backlog occupies one worker, not the whole pool.
//!
//! # Lifecycle
//!
//! ```text
//!  open_stream ──► Opening ──connect ok──► Open ──close_stream──► Closed
//!                     │                                ▲
//!                     └──connect failed──► Failed ─────┘
//! ```
//!
//! The registry entry is removed as soon as `close_stream` is received, so the id can be reused
//! straight away; the release itself is queued behind the stream's earlier jobs.
use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, info, warn};

use super::{ThreadPool, error::ResponseError, thread::Job};
use crate::engine::{Connection, Engine, EngineError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Slot {
    Opening,
    Open(Box<dyn Connection>),
    Failed,
    Closed,
}

/// Externally visible lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Open,
    Failed,
    Closed,
}

struct StreamInner {
    id: u64,
    slot: Mutex<Slot>,
    /// Mirrors `slot` so the session thread can inspect a stream without waiting on a running
    /// statement.
    state: Mutex<StreamState>,
    jobs: Sender<Job>,
    queue: Receiver<Job>,
    /// Set while a pump for this stream sits in the pool queue or runs on a worker.
    scheduled: Mutex<bool>,
}

/// Handle to a stream; cheap to clone into worker jobs.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    fn new(id: u64) -> Self {
        let (jobs, queue) = unbounded();
        Self {
            inner: Arc::new(StreamInner {
                id,
                slot: Mutex::new(Slot::Opening),
                state: Mutex::new(StreamState::Opening),
                jobs,
                queue,
                scheduled: Mutex::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.inner.state)
    }

    /// Queue `job` behind every job submitted earlier to this stream.
    pub fn submit<F>(&self, pool: &Arc<ThreadPool>, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.jobs.send(Box::new(job)).is_err() {
            warn!("stream {} queue is gone, dropping job", self.id());
            return;
        }
        let mut scheduled = lock(&self.inner.scheduled);
        if !*scheduled {
            *scheduled = true;
            drop(scheduled);
            self.schedule(pool);
        }
    }

    fn schedule(&self, pool: &Arc<ThreadPool>) {
        let stream = self.clone();
        let next = Arc::clone(pool);
        pool.execute(move || stream.pump(&next));
    }

    /// Run the next queued job, then requeue the stream on the pool if more are waiting.
    fn pump(&self, pool: &Arc<ThreadPool>) {
        if let Ok(job) = self.inner.queue.try_recv() {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                warn!("job on stream {} panicked", self.id());
            }
        }

        let mut scheduled = lock(&self.inner.scheduled);
        if self.inner.queue.is_empty() {
            *scheduled = false;
            return;
        }
        drop(scheduled);
        self.schedule(pool);
    }

    fn set_slot(&self, slot: &mut Slot, next: Slot) -> Slot {
        *lock(&self.inner.state) = match next {
            Slot::Opening => StreamState::Opening,
            Slot::Open(_) => StreamState::Open,
            Slot::Failed => StreamState::Failed,
            Slot::Closed => StreamState::Closed,
        };
        std::mem::replace(slot, next)
    }

    /// Acquire the backing connection.
    pub fn connect(&self, engine: &dyn Engine) -> Result<(), ResponseError> {
        let connected = engine.connect();
        let mut slot = lock(&self.inner.slot);
        match connected {
            Ok(conn) => {
                self.set_slot(&mut slot, Slot::Open(conn));
                info!("stream {} opened", self.id());
                Ok(())
            }
            Err(source) => {
                self.set_slot(&mut slot, Slot::Failed);
                Err(ResponseError::ConnectionFailed {
                    stream_id: self.id(),
                    source,
                })
            }
        }
    }

    /// Run `f` against the connection.
    pub fn run<T, F>(&self, f: F) -> Result<T, ResponseError>
    where
        F: FnOnce(&mut dyn Connection) -> Result<T, EngineError>,
    {
        let mut slot = lock(&self.inner.slot);
        match &mut *slot {
            Slot::Open(conn) => f(conn.as_mut()).map_err(ResponseError::StatementExecution),
            Slot::Opening | Slot::Failed => Err(ResponseError::StreamNotOpen {
                stream_id: self.id(),
            }),
            Slot::Closed => Err(ResponseError::StreamNotFound {
                stream_id: self.id(),
            }),
        }
    }

    /// Release the backing connection.
    pub fn close(&self) -> Result<(), ResponseError> {
        let previous = self.set_slot(&mut lock(&self.inner.slot), Slot::Closed);
        let Slot::Open(conn) = previous else {
            debug!("stream {} closed without a connection", self.id());
            return Ok(());
        };
        conn.close()
            .map_err(|source| ResponseError::ResourceRelease {
                stream_id: self.id(),
                source,
            })?;
        info!("stream {} closed", self.id());
        Ok(())
    }
}

/// Live streams of one session, keyed by stream id.
#[derive(Default)]
pub struct StreamRegistry {
    streams: HashMap<u64, Stream>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new stream. Its first job must connect it.
    pub fn open_stream(&mut self, stream_id: u64) -> Result<Stream, ResponseError> {
        if self.streams.contains_key(&stream_id) {
            return Err(ResponseError::StreamExists { stream_id });
        }
        let stream = Stream::new(stream_id);
        self.streams.insert(stream_id, stream.clone());
        Ok(stream)
    }

    /// Unregister a stream, returning it for release. `None` if the id is not registered.
    pub fn close_stream(&mut self, stream_id: u64) -> Option<Stream> {
        self.streams.remove(&stream_id)
    }

    /// Look up a stream that can take statements.
    pub fn get_for_execute(&self, stream_id: u64) -> Result<Stream, ResponseError> {
        let stream = self
            .streams
            .get(&stream_id)
            .ok_or(ResponseError::StreamNotFound { stream_id })?;
        if stream.state() == StreamState::Failed {
            return Err(ResponseError::StreamNotOpen { stream_id });
        }
        Ok(stream.clone())
    }

    /// Unregister every stream, returning each for release.
    pub fn drain(&mut self) -> Vec<Stream> {
        self.streams.drain().map(|(_, stream)| stream).collect()
    }

    pub fn contains(&self, stream_id: u64) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
        time::Duration,
    };

    use crossbeam_channel::bounded;

    use crate::engine::{SqliteEngine, Statement};

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn jobs_run_one_at_a_time_in_submission_order() {
        let pool = Arc::new(ThreadPool::new(4).unwrap());
        let stream = Stream::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicBool::new(false));

        for i in 0..50 {
            let order = Arc::clone(&order);
            let busy = Arc::clone(&busy);
            stream.submit(&pool, move || {
                assert!(!busy.swap(true, Ordering::SeqCst), "jobs overlapped");
                order.lock().unwrap().push(i);
                thread::sleep(Duration::from_micros(200));
                busy.store(false, Ordering::SeqCst);
            });
        }
        let (tx, rx) = bounded(1);
        stream.submit(&pool, move || tx.send(()).unwrap());
        rx.recv_timeout(TIMEOUT).unwrap();

        assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn backlog_on_one_stream_leaves_workers_for_others() {
        let pool = Arc::new(ThreadPool::new(2).unwrap());
        let (busy, idle) = (Stream::new(1), Stream::new(2));
        let (signal_tx, signal_rx) = bounded(1);
        let (result_tx, result_rx) = bounded(1);

        busy.submit(&pool, move || {
            result_tx
                .send(signal_rx.recv_timeout(TIMEOUT).is_ok())
                .unwrap();
        });
        for _ in 0..8 {
            busy.submit(&pool, || {});
        }
        idle.submit(&pool, move || signal_tx.send(()).unwrap());

        assert!(result_rx.recv_timeout(TIMEOUT * 2).unwrap());
    }

    #[test]
    fn panicking_job_does_not_stall_the_stream() {
        let pool = Arc::new(ThreadPool::new(1).unwrap());
        let stream = Stream::new(1);
        stream.submit(&pool, || panic!("boom"));
        let (tx, rx) = bounded(1);
        stream.submit(&pool, move || tx.send(()).unwrap());
        rx.recv_timeout(TIMEOUT).unwrap();
    }

    #[test]
    fn registry_enforces_unique_ids() {
        let mut registry = StreamRegistry::new();
        let stream = registry.open_stream(1).unwrap();
        assert_eq!(stream.state(), StreamState::Opening);

        let err = registry.open_stream(1).err().unwrap();
        assert_eq!(err.code(), "STREAM_EXISTS");
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(1));

        assert!(registry.close_stream(1).is_some());
        assert!(registry.close_stream(1).is_none());
        assert!(registry.is_empty());
        assert!(registry.open_stream(1).is_ok());
    }

    #[test]
    fn execute_requires_a_registered_stream() {
        let registry = StreamRegistry::new();
        let err = registry.get_for_execute(5).err().unwrap();
        assert_eq!(err.code(), "STREAM_NOT_FOUND");
    }

    #[test]
    fn stream_lifecycle_against_sqlite() {
        let engine = SqliteEngine::memory();
        let mut registry = StreamRegistry::new();

        let stream = registry.open_stream(7).unwrap();
        let err = stream.run(|conn| Ok(conn.is_autocommit())).unwrap_err();
        assert_eq!(err.code(), "STREAM_NOT_OPEN");
        stream.connect(&engine).unwrap();
        assert_eq!(stream.state(), StreamState::Open);

        let stream = registry.get_for_execute(7).unwrap();
        let out = stream
            .run(|conn| conn.execute(&Statement::new("SELECT 1 AS one")))
            .unwrap();
        assert_eq!(out.columns[0].name, "one");

        let stream = registry.close_stream(7).unwrap();
        stream.close().unwrap();
        assert_eq!(stream.state(), StreamState::Closed);

        // a handle that outlived the close cannot reach the released connection
        let err = stream
            .run(|conn| conn.execute(&Statement::new("SELECT 1")))
            .unwrap_err();
        assert_eq!(err.code(), "STREAM_NOT_FOUND");
    }

    #[test]
    fn close_runs_after_earlier_jobs() {
        let pool = Arc::new(ThreadPool::new(4).unwrap());
        let mut registry = StreamRegistry::new();
        let stream = registry.open_stream(1).unwrap();
        stream.connect(&SqliteEngine::memory()).unwrap();

        let (tx, rx) = unbounded();
        let busy = registry.get_for_execute(1).unwrap();
        let job_tx = tx.clone();
        busy.submit(&pool, {
            let busy = busy.clone();
            move || {
                thread::sleep(Duration::from_millis(20));
                let out = busy.run(|conn| conn.execute(&Statement::new("SELECT 2")));
                job_tx.send(("execute", out.is_ok())).unwrap();
            }
        });
        let closing = registry.close_stream(1).unwrap();
        closing.submit(&pool, {
            let closing = closing.clone();
            move || tx.send(("close", closing.close().is_ok())).unwrap()
        });

        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ("execute", true));
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ("close", true));
        assert_eq!(busy.state(), StreamState::Closed);
    }
}
