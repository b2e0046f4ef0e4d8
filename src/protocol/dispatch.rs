use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crossbeam_channel::Sender;
use log::{debug, warn};
use serde_json::Value as Json;

use super::{
    ThreadPool,
    error::ResponseError,
    request::Request,
    response::{Response, StmtResult},
    session::Responder,
    sqls::SqlStore,
    stream::{Stream, StreamRegistry},
};
use crate::engine::Engine;

/// Routes requests to their handlers and queues database work on the target stream.
///
/// Registry and stored-SQL lookups happen on the calling (session) thread in receipt order;
/// everything that touches a connection runs on the pool, one job per stream at a time.
#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<dyn Engine>,
    pool: Arc<ThreadPool>,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn Engine>, pool: Arc<ThreadPool>) -> Self {
        Self { engine, pool }
    }

    pub fn dispatch(
        &self,
        registry: &mut StreamRegistry,
        sqls: &mut SqlStore,
        request: Json,
        responder: Responder,
    ) {
        let request = match Request::parse(request) {
            Ok(request) => request,
            Err(err) => return responder.send(Err(err)),
        };
        match request.stream_id() {
            Some(stream_id) => debug!("request {} on stream {stream_id}", responder.request_id()),
            None => debug!("request {}: {request:?}", responder.request_id()),
        }

        match request {
            Request::OpenStream { stream_id } => match registry.open_stream(stream_id) {
                Ok(stream) => {
                    let engine = Arc::clone(&self.engine);
                    self.offload(&stream, responder, move |stream| {
                        stream.connect(engine.as_ref())?;
                        Ok(Response::OpenStream {})
                    });
                }
                Err(err) => responder.send(Err(err)),
            },
            Request::CloseStream { stream_id } => match registry.close_stream(stream_id) {
                Some(stream) => self.offload(&stream, responder, |stream| {
                    stream.close()?;
                    Ok(Response::CloseStream {})
                }),
                None => responder.send(Ok(Response::CloseStream {})),
            },
            Request::Execute { stream_id, stmt } => {
                let prepared = registry
                    .get_for_execute(stream_id)
                    .and_then(|stream| Ok((stream, stmt.into_statement(sqls)?)));
                let (stream, stmt) = match prepared {
                    Ok(prepared) => prepared,
                    Err(err) => return responder.send(Err(err)),
                };
                self.offload(&stream, responder, move |stream| {
                    let output = stream.run(|conn| conn.execute(&stmt))?;
                    Ok(Response::Execute(StmtResult::from_output(
                        output,
                        stmt.want_rows,
                    )))
                });
            }
            Request::Batch { stream_id, batch } => {
                let prepared = registry
                    .get_for_execute(stream_id)
                    .and_then(|stream| Ok((stream, batch.into_program(sqls)?)));
                let (stream, program) = match prepared {
                    Ok(prepared) => prepared,
                    Err(err) => return responder.send(Err(err)),
                };
                self.offload(&stream, responder, move |stream| {
                    let result = stream.run(|conn| Ok(program.run(conn)))?;
                    Ok(Response::Batch(result))
                });
            }
            Request::Sequence {
                stream_id,
                sql,
                sql_id,
            } => {
                let prepared = registry
                    .get_for_execute(stream_id)
                    .and_then(|stream| Ok((stream, sqls.resolve(sql, sql_id)?)));
                let (stream, sql) = match prepared {
                    Ok(prepared) => prepared,
                    Err(err) => return responder.send(Err(err)),
                };
                self.offload(&stream, responder, move |stream| {
                    stream.run(|conn| conn.execute_batch(&sql))?;
                    Ok(Response::Sequence {})
                });
            }
            Request::Describe {
                stream_id,
                sql,
                sql_id,
            } => {
                let prepared = registry
                    .get_for_execute(stream_id)
                    .and_then(|stream| Ok((stream, sqls.resolve(sql, sql_id)?)));
                let (stream, sql) = match prepared {
                    Ok(prepared) => prepared,
                    Err(err) => return responder.send(Err(err)),
                };
                self.offload(&stream, responder, move |stream| {
                    let desc = stream.run(|conn| conn.describe(&sql))?;
                    Ok(Response::Describe(desc.into()))
                });
            }
            Request::GetAutocommit { stream_id } => match registry.get_for_execute(stream_id) {
                Ok(stream) => self.offload(&stream, responder, |stream| {
                    let is_autocommit = stream.run(|conn| Ok(conn.is_autocommit()))?;
                    Ok(Response::GetAutocommit { is_autocommit })
                }),
                Err(err) => responder.send(Err(err)),
            },
            Request::StoreSql { sql_id, sql } => {
                responder.send(sqls.store(sql_id, sql).map(|()| Response::StoreSql {}));
            }
            Request::CloseSql { sql_id } => {
                sqls.close(sql_id);
                responder.send(Ok(Response::CloseSql {}));
            }
        }
    }

    /// Release a stream during session teardown. `done` is dropped once the connection is gone.
    pub fn release(&self, stream: Stream, done: Sender<()>) {
        let job = stream.clone();
        stream.submit(&self.pool, move || {
            if let Err(err) = job.close() {
                warn!("{err}");
            }
            drop(done);
        });
    }

    /// Queue `job` on the stream and answer the request with its outcome.
    fn offload<F>(&self, stream: &Stream, responder: Responder, job: F)
    where
        F: FnOnce(&Stream) -> Result<Response, ResponseError> + Send + 'static,
    {
        let target = stream.clone();
        stream.submit(&self.pool, move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| job(&target)))
                .unwrap_or_else(|payload| Err(ResponseError::Internal(panic_message(&*payload))));
            responder.send(result);
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("engine panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("engine panicked: {msg}")
    } else {
        "engine panicked".to_string()
    }
}
