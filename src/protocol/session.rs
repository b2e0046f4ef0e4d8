//! Protocol state machine for one client connection.
//!
//! A [`Session`] reads frames on its own thread, performs the hello handshake and hands every
//! request to the [`Dispatcher`]. Responses come back through an outbox channel drained by a
//! writer thread, so requests on different streams complete and answer in any order while each
//! response still carries the `request_id` it belongs to.
//!
//! # States
//!
//! - `AwaitingHello`: only a `hello` frame is accepted; anything else ends the session.
//! - `Open`: request frames are dispatched without waiting for earlier responses.
//! - `Closing`: entered on end of input or on a fatal protocol violation; every registered stream
//!   is released, waiting for its in-flight work.
//! - `Closed`: the writer has stopped and no stream holds a connection.
//!
//! After a protocol violation no further frames are written, not even responses to requests that
//! were already running.
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, error, info, trace, warn};

use super::{
    dispatch::Dispatcher,
    error::{ProtocolError, ResponseError},
    request::ClientMsg,
    response::{Response, ServerMsg},
    sqls::SqlStore,
    stream::{StreamRegistry, lock},
    transport::{FrameRead, FrameWrite, TransportError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHello,
    Open,
    Closing,
    Closed,
}

/// Request ids that have been received but not yet answered.
type PendingSet = Arc<Mutex<HashSet<u64>>>;

/// Queue of frames waiting for the writer thread.
#[derive(Clone)]
struct Outbox {
    tx: Sender<ServerMsg>,
    pending: PendingSet,
}

impl Outbox {
    fn send(&self, msg: ServerMsg) {
        if self.tx.send(msg).is_err() {
            debug!("writer is gone, dropping response");
        }
    }

    fn register(&self, request_id: u64) -> Result<Responder, ProtocolError> {
        if !lock(&self.pending).insert(request_id) {
            return Err(ProtocolError::DuplicateRequestId(request_id));
        }
        Ok(Responder {
            request_id,
            outbox: self.clone(),
        })
    }
}

/// The single answer owed to one request.
pub struct Responder {
    request_id: u64,
    outbox: Outbox,
}

impl Responder {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn send(self, result: Result<Response, ResponseError>) {
        lock(&self.outbox.pending).remove(&self.request_id);
        let msg = match result {
            Ok(response) => ServerMsg::ResponseOk {
                request_id: self.request_id,
                response,
            },
            Err(err) => {
                debug!("request {} failed: {err}", self.request_id);
                ServerMsg::ResponseError {
                    request_id: self.request_id,
                    error: err.to_body(),
                }
            }
        };
        self.outbox.send(msg);
    }
}

pub struct Session<R, W> {
    id: u64,
    reader: R,
    writer: W,
    dispatcher: Dispatcher,
    state: SessionState,
    registry: StreamRegistry,
    sqls: SqlStore,
}

impl<R: FrameRead, W: FrameWrite> Session<R, W> {
    pub fn new(id: u64, reader: R, writer: W, dispatcher: Dispatcher) -> Self {
        Self {
            id,
            reader,
            writer,
            dispatcher,
            state: SessionState::AwaitingHello,
            registry: StreamRegistry::new(),
            sqls: SqlStore::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Serve the connection until the peer goes away or violates the protocol. Returns only once
    /// every stream has been released.
    pub fn run(self) -> Result<(), ProtocolError> {
        let Session {
            id,
            mut reader,
            writer,
            dispatcher,
            mut state,
            mut registry,
            mut sqls,
        } = self;

        let (tx, rx) = unbounded();
        let discard = Arc::new(AtomicBool::new(false));
        let writer = {
            let discard = Arc::clone(&discard);
            thread::Builder::new()
                .name(format!("sqlmux-session-{id}-writer"))
                .spawn(move || write_loop(id, rx, writer, discard))
                .map_err(TransportError::from)?
        };
        let outbox = Outbox {
            tx,
            pending: PendingSet::default(),
        };

        let result = serve(
            id,
            &mut reader,
            &outbox,
            &dispatcher,
            &mut state,
            &mut registry,
            &mut sqls,
        );
        match &result {
            Ok(()) => info!("session {id} closed by peer"),
            Err(err) => {
                discard.store(true, Ordering::SeqCst);
                warn!("session {id} terminated: {err}");
            }
        }

        state = SessionState::Closing;
        debug!("session {id} is {state:?}");
        teardown(id, &mut registry, &dispatcher);
        lock(&outbox.pending).clear();
        drop(outbox);
        if writer.join().is_err() {
            error!("writer of session {id} panicked");
        }

        state = SessionState::Closed;
        debug!("session {id} is {state:?}");
        result
    }
}

fn serve<R: FrameRead>(
    id: u64,
    reader: &mut R,
    outbox: &Outbox,
    dispatcher: &Dispatcher,
    state: &mut SessionState,
    registry: &mut StreamRegistry,
    sqls: &mut SqlStore,
) -> Result<(), ProtocolError> {
    while let Some(frame) = reader.read_frame()? {
        trace!("session {id} received: {frame}");
        let msg: ClientMsg = serde_json::from_str(&frame)?;

        match (*state, msg) {
            (SessionState::AwaitingHello, ClientMsg::Hello { .. }) => {
                outbox.send(ServerMsg::HelloOk);
                *state = SessionState::Open;
                info!("session {id} completed handshake");
            }
            (SessionState::AwaitingHello, ClientMsg::Request { .. }) => {
                return Err(ProtocolError::HelloExpected);
            }
            (_, ClientMsg::Hello { .. }) => return Err(ProtocolError::RepeatedHello),
            (_, ClientMsg::Request {
                request_id,
                request,
            }) => {
                let responder = outbox.register(request_id)?;
                dispatcher.dispatch(registry, sqls, request, responder);
            }
        }
    }
    Ok(())
}

/// Release every stream still registered and wait until all of them are gone.
fn teardown(id: u64, registry: &mut StreamRegistry, dispatcher: &Dispatcher) {
    let streams = registry.drain();
    if streams.is_empty() {
        return;
    }

    debug!("session {id} releasing {} streams", streams.len());
    let (done_tx, done_rx) = bounded::<()>(streams.len());
    for stream in streams {
        dispatcher.release(stream, done_tx.clone());
    }
    drop(done_tx);
    // every sender is dropped once its stream is released
    while done_rx.recv().is_ok() {}
}

fn write_loop<W: FrameWrite>(
    id: u64,
    rx: Receiver<ServerMsg>,
    mut writer: W,
    discard: Arc<AtomicBool>,
) {
    while let Ok(msg) = rx.recv() {
        if discard.load(Ordering::SeqCst) {
            trace!("session {id} discarding {msg:?}");
            continue;
        }
        let frame = match serde_json::to_string(&msg) {
            Ok(frame) => frame,
            Err(err) => {
                error!("failed to encode response: {err}");
                continue;
            }
        };
        trace!("session {id} sending: {frame}");
        if let Err(err) = writer.write_frame(&frame) {
            warn!("session {id} failed to write response: {err}");
            break;
        }
    }
}
