use std::{
    collections::HashMap,
    io::{self, BufReader, BufWriter},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
};

use log::{debug, info, warn};
use thiserror::Error;

use super::{
    Dispatcher, ProtocolTransport, Session, ThreadPool,
    error::ProtocolError,
    stream::lock,
    transport::TransportError,
};
use crate::{config::ServerConfig, engine::Engine};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("Server IO Error: {0}")]
    Io(#[from] io::Error),
}

/// A session that is still being served.
struct LiveSession {
    stream: TcpStream,
    thread: thread::JoinHandle<()>,
}

/// Sessions still being served, keyed by session id. A session removes itself when it ends.
type LiveSessions = Arc<Mutex<HashMap<u64, LiveSession>>>;

/// Accepts TCP connections and runs one [`Session`] per connection on its own thread.
///
/// All sessions share the engine and one worker pool.
pub struct SessionServer {
    listener: TcpListener,
    config: ServerConfig,
    dispatcher: Dispatcher,
    shutdown: Arc<AtomicBool>,
    sessions: LiveSessions,
    next_session: AtomicU64,
}

impl SessionServer {
    pub fn bind(config: ServerConfig, engine: Arc<dyn Engine>) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind(config.listen_addr).map_err(|source| ServerError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let pool = ThreadPool::new(config.workers)?;
        debug!("started {} workers", pool.size());

        Ok(Self {
            listener,
            dispatcher: Dispatcher::new(engine, Arc::new(pool)),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            sessions: LiveSessions::default(),
            next_session: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> io::Result<ServerHandle> {
        let mut addr = self.local_addr()?;
        if addr.ip().is_unspecified() {
            addr.set_ip(match addr {
                SocketAddr::V4(_) => [127, 0, 0, 1].into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
            });
        }
        Ok(ServerHandle {
            flag: Arc::clone(&self.shutdown),
            sessions: Arc::clone(&self.sessions),
            addr,
        })
    }

    /// Accept connections until shut down, then hang up on every session and wait for them to
    /// release their streams.
    pub fn listen(self) -> Result<(), ServerError> {
        info!("listening at {}", self.local_addr()?);

        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    if let Err(e) = self.spawn_session(stream) {
                        warn!("failed to start session: {e}");
                    }
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        let live: Vec<(u64, LiveSession)> = lock(&self.sessions).drain().collect();
        info!("shutting down, closing {} sessions", live.len());
        for (id, session) in &live {
            if let Err(e) = session.stream.shutdown(Shutdown::Both) {
                debug!("session {id} already disconnected: {e}");
            }
        }
        for (id, session) in live {
            if session.thread.join().is_err() {
                warn!("session {id} thread panicked");
            }
        }
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream) -> io::Result<()> {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let hangup = stream.try_clone()?;

        let dispatcher = self.dispatcher.clone();
        let sessions = Arc::clone(&self.sessions);
        let max_frame_size = self.config.max_frame_size;
        // held until the entry is in place, so the session cannot remove itself before that
        let mut live = lock(&self.sessions);
        let thread = thread::Builder::new()
            .name(format!("sqlmux-session-{id}"))
            .spawn(move || {
                if let Err(e) = handle_connection(id, stream, dispatcher, max_frame_size) {
                    warn!("session {id} ended with error: {e}");
                }
                if lock(&sessions).remove(&id).is_some() {
                    debug!("session {id} removed");
                }
            })?;
        live.insert(
            id,
            LiveSession {
                stream: hangup,
                thread,
            },
        );
        Ok(())
    }
}

/// Controls a running [`SessionServer::listen`] from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    flag: Arc<AtomicBool>,
    sessions: LiveSessions,
    addr: SocketAddr,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        // wake the blocking accept
        if let Err(e) = TcpStream::connect(self.addr) {
            warn!("failed to wake listener: {e}");
        }
    }

    /// Number of sessions whose connection is still being served.
    pub fn live_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }
}

fn handle_connection(
    id: u64,
    stream: TcpStream,
    dispatcher: Dispatcher,
    max_frame_size: usize,
) -> Result<(), ProtocolError> {
    match stream.peer_addr() {
        Ok(peer) => info!("session {id} accepted from {peer}"),
        Err(_) => info!("session {id} accepted"),
    }
    let reader = stream.try_clone().map_err(TransportError::from)?;
    let writer = stream.try_clone().map_err(TransportError::from)?;
    let reader = ProtocolTransport::with_max_frame_size(BufReader::new(reader), max_frame_size);
    let writer = ProtocolTransport::new(BufWriter::new(writer));

    let result = Session::new(id, reader, writer, dispatcher).run();
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        debug!("session {id} socket already closed: {e}");
    }
    result
}
