//! Client-server session protocol.
//!
//! This module defines the multiplexed session protocol spoken between sqlmux clients and
//! servers: the frames exchanged over a connection, the per-connection state machine, the
//! streams multiplexed inside a session and the transport carrying the frames.
//!
//! # Overview
//!
//! A client opens a connection, sends `hello` and then pipelines `request` frames. Every request
//! names a stream by a client-chosen id; each stream owns one database connection. Requests on
//! the same stream are applied strictly in receipt order, requests on different streams run
//! concurrently on a shared worker pool. Responses may therefore arrive in any order and are
//! matched to their requests by `request_id`.
//!
//! Each stream keeps its own job queue, and at most one job per stream sits on the pool at any
//! time, so a long backlog on one stream never occupies more than one worker.
//!
//! Failures of a single request (unknown stream, bad argument, SQL error) are answered with a
//! `response_error` frame and leave the session usable. Violations of the framing itself
//! (malformed JSON, a request before `hello`) end the session.
//!
//! # Key Components
//!
//! - [`ClientMsg`] / [`ServerMsg`]: Top-level frames in each direction.
//! - [`Request`] / [`Response`]: Request bodies and their successful results.
//! - [`Session`]: State machine serving one connection.
//! - [`StreamRegistry`]: Streams of one session, keyed by client id.
//! - [`SqlStore`]: SQL texts stored by the client for reuse through `sql_id`.
//! - [`Program`]: A decoded batch with conditional steps.
//! - [`Dispatcher`]: Routes requests and offloads database work to the [`ThreadPool`].
//! - [`ProtocolTransport`]: Newline-delimited frames over a byte stream.
//! - [`SessionServer`]: TCP listener running one session per connection.
//!
//! # Wire Format
//!
//! Every frame is a single JSON object on its own line, tagged by a `type` field. Values inside
//! statements and rows use a tagged encoding (see [`Value`](crate::Value)): integers travel as
//! decimal strings so the full 64-bit range survives JSON, blobs as unpadded base64.
//!
//! # See Also
//!
//! - [`engine`](crate::engine): Connections that ultimately execute the statements.
mod batch;
mod dispatch;
mod error;
mod request;
mod response;
mod server;
mod session;
mod sqls;
mod stream;
mod thread;
mod transport;

pub use batch::{BatchBody, BatchCond, BatchResult, BatchStepBody, Program};
pub use dispatch::Dispatcher;
pub use error::{ProtocolError, ResponseError};
pub use request::{ClientMsg, Request, StmtBody};
pub use response::{
    Col, DescribeCol, DescribeParam, DescribeResult, ErrorBody, Response, ServerMsg, StmtResult,
};
pub use server::{ServerError, ServerHandle, SessionServer};
pub use session::{Responder, Session, SessionState};
pub use sqls::SqlStore;
pub use stream::{Stream, StreamRegistry, StreamState};
pub use thread::ThreadPool;
pub use transport::{
    DEFAULT_MAX_FRAME_SIZE, FrameRead, FrameWrite, ProtocolTransport, TransportError,
};
