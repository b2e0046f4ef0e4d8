//! SQL engine collaborator.
//!
//! The session layer never parses or plans SQL itself. It talks to the engine through the narrow
//! [`Engine`] and [`Connection`] traits defined here: an engine hands out independent connections,
//! and a connection executes one [`Statement`] at a time, returning its full output.
//!
//! # Key Components
//!
//! - [`Engine`]: Factory for backing connections, one per stream.
//! - [`Connection`]: An exclusive, autocommit-mode connection owned by a single stream.
//! - [`SqliteEngine`]: The SQLite implementation used by the server binary.
//!
//! # See Also
//!
//! - [`protocol`](crate::protocol): Streams own the connections created here.
mod sqlite;

use thiserror::Error;

use crate::Value;

pub use sqlite::{SqliteConnection, SqliteEngine};

/// Errors reported by an engine or one of its connections.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not open a database connection: {0}")]
    Connect(String),

    #[error("{0}")]
    Statement(String),

    #[error("no parameter named '{0}' in statement")]
    UnknownParameter(String),

    #[error("could not close the database connection: {0}")]
    Close(String),
}

/// Arguments bound to a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    Positional(Vec<Value>),
    /// Names are stored without their `:`/`@`/`$` sigil.
    Named(Vec<(String, Value)>),
}

impl Default for Params {
    fn default() -> Self {
        Params::Positional(Vec::new())
    }
}

/// A single statement to run on a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Params,
    /// When false the cursor is still stepped to completion, but rows are not collected.
    pub want_rows: bool,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Params::default(),
            want_rows: true,
        }
    }
}

/// A declared output column of a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
}

/// Everything a statement produced once its cursor has been consumed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatementOutput {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
    /// Rows modified by the statement; negative when the engine cannot tell.
    pub affected_row_count: i64,
    pub last_insert_rowid: Option<i64>,
}

/// Shape of a prepared statement, without running it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Description {
    /// One entry per parameter slot, with its name (sigil included) when it has one.
    pub params: Vec<Option<String>>,
    pub columns: Vec<DeclaredColumn>,
    pub is_explain: bool,
    pub is_readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredColumn {
    pub name: String,
    pub decltype: Option<String>,
}

/// Factory for backing connections.
pub trait Engine: Send + Sync + 'static {
    /// Open a new connection in autocommit mode.
    fn connect(&self) -> Result<Box<dyn Connection>, EngineError>;
}

/// An exclusive connection to the engine.
pub trait Connection: Send {
    fn execute(&mut self, stmt: &Statement) -> Result<StatementOutput, EngineError>;

    /// Run a script of semicolon-separated statements, discarding any rows.
    fn execute_batch(&mut self, sql: &str) -> Result<(), EngineError>;

    /// Prepare `sql` and report its parameters and result columns.
    fn describe(&mut self, sql: &str) -> Result<Description, EngineError>;

    fn is_autocommit(&self) -> bool;

    fn close(self: Box<Self>) -> Result<(), EngineError>;
}
