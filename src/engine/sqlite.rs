use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use log::debug;
use rusqlite::{
    OpenFlags, ToSql,
    types::{ToSqlOutput, Value as SqlValue, ValueRef},
};

use super::{
    Column, Connection, DeclaredColumn, Description, Engine, EngineError, Params, Statement,
    StatementOutput,
};
use crate::Value;

const MEMORY: &str = ":memory:";
const PARAMETER_SIGILS: [char; 3] = [':', '@', '$'];

/// Engine handing out SQLite connections to a single database file.
#[derive(Debug, Clone)]
pub struct SqliteEngine {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteEngine {
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
        }
    }

    /// Every connection gets its own private in-memory database.
    pub fn memory() -> Self {
        Self::open(MEMORY, Duration::ZERO)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Engine for SqliteEngine {
    fn connect(&self) -> Result<Box<dyn Connection>, EngineError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        let conn = rusqlite::Connection::open_with_flags(&self.path, flags)
            .map_err(|e| EngineError::Connect(e.to_string()))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| EngineError::Connect(e.to_string()))?;
        debug!("opened sqlite connection to {:?}", self.path);
        Ok(Box::new(SqliteConnection { conn }))
    }
}

pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl From<rusqlite::Error> for EngineError {
    fn from(value: rusqlite::Error) -> Self {
        EngineError::Statement(value.to_string())
    }
}

impl Connection for SqliteConnection {
    fn execute(&mut self, stmt: &Statement) -> Result<StatementOutput, EngineError> {
        let mut prepared = self.conn.prepare(&stmt.sql)?;
        bind(&mut prepared, &stmt.params)?;

        let columns = prepared
            .column_names()
            .into_iter()
            .map(|name| Column {
                name: name.to_string(),
            })
            .collect::<Vec<_>>();
        let readonly = prepared.readonly();
        let total_before = self.conn.total_changes();

        let mut rows = Vec::new();
        let mut cursor = prepared.raw_query();
        while let Some(row) = cursor.next()? {
            if !stmt.want_rows {
                continue;
            }
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(from_sql(row.get_ref(i)?));
            }
            rows.push(values);
        }
        drop(cursor);
        drop(prepared);

        let (affected_row_count, last_insert_rowid) = if readonly {
            (-1, None)
        } else {
            // changes() keeps the count of the last INSERT/UPDATE/DELETE across DDL
            let changes = if self.conn.total_changes() == total_before {
                0
            } else {
                i64::try_from(self.conn.changes()).unwrap_or(i64::MAX)
            };
            (changes, Some(self.conn.last_insert_rowid()))
        };

        Ok(StatementOutput {
            columns,
            rows,
            affected_row_count,
            last_insert_rowid,
        })
    }

    fn execute_batch(&mut self, sql: &str) -> Result<(), EngineError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn describe(&mut self, sql: &str) -> Result<Description, EngineError> {
        let prepared = self.conn.prepare(sql)?;
        let params = (1..=prepared.parameter_count())
            .map(|i| prepared.parameter_name(i).map(str::to_string))
            .collect();
        let columns = prepared
            .columns()
            .into_iter()
            .map(|col| DeclaredColumn {
                name: col.name().to_string(),
                decltype: col.decl_type().map(str::to_string),
            })
            .collect();

        Ok(Description {
            params,
            columns,
            is_explain: prepared.is_explain() != 0,
            is_readonly: prepared.readonly(),
        })
    }

    fn is_autocommit(&self) -> bool {
        self.conn.is_autocommit()
    }

    fn close(self: Box<Self>) -> Result<(), EngineError> {
        self.conn
            .close()
            .map_err(|(_, e)| EngineError::Close(e.to_string()))
    }
}

fn bind(prepared: &mut rusqlite::Statement<'_>, params: &Params) -> Result<(), EngineError> {
    match params {
        Params::Positional(values) => {
            for (i, value) in values.iter().enumerate() {
                prepared.raw_bind_parameter(i + 1, value)?;
            }
        }
        Params::Named(values) => {
            for (name, value) in values {
                let mut index = None;
                for sigil in PARAMETER_SIGILS {
                    index = prepared.parameter_index(&format!("{sigil}{name}"))?;
                    if index.is_some() {
                        break;
                    }
                }
                let index = index.ok_or_else(|| EngineError::UnknownParameter(name.clone()))?;
                prepared.raw_bind_parameter(index, value)?;
            }
        }
    }
    Ok(())
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    fn stmt(sql: &str, params: Params) -> Statement {
        Statement {
            sql: sql.to_string(),
            params,
            want_rows: true,
        }
    }

    #[test]
    fn executes_ddl_dml_and_queries() {
        let mut conn = SqliteEngine::memory().connect().unwrap();
        conn.execute(&Statement::new("CREATE TABLE t(id INTEGER, v TEXT)"))
            .unwrap();

        let out = conn
            .execute(&stmt(
                "INSERT INTO t VALUES (?, ?), (?, ?)",
                Params::Positional(vec![
                    Value::Integer(1),
                    Value::Text("a".into()),
                    Value::Integer(2),
                    Value::Null,
                ]),
            ))
            .unwrap();
        assert_eq!(out.affected_row_count, 2);
        assert_eq!(out.last_insert_rowid, Some(2));
        assert!(out.columns.is_empty());

        let out = conn
            .execute(&Statement::new("SELECT id, v FROM t ORDER BY id"))
            .unwrap();
        assert_eq!(out.affected_row_count, -1);
        assert_eq!(out.last_insert_rowid, None);
        assert_eq!(
            out.columns,
            vec![
                Column { name: "id".into() },
                Column { name: "v".into() }
            ]
        );
        assert_eq!(
            out.rows,
            vec![
                vec![Value::Integer(1), Value::Text("a".into())],
                vec![Value::Integer(2), Value::Null],
            ]
        );
    }

    #[test]
    fn consumes_cursor_without_collecting_rows() {
        let mut conn = SqliteEngine::memory().connect().unwrap();
        conn.execute(&Statement::new("CREATE TABLE t(id INTEGER)"))
            .unwrap();
        let out = conn
            .execute(&Statement {
                sql: "INSERT INTO t VALUES (1), (2), (3) RETURNING id".into(),
                params: Params::default(),
                want_rows: false,
            })
            .unwrap();
        assert!(out.rows.is_empty());
        assert_eq!(out.columns, vec![Column { name: "id".into() }]);
        assert_eq!(out.affected_row_count, 3);
    }

    #[test]
    fn binds_named_parameters_with_any_sigil() {
        let mut conn = SqliteEngine::memory().connect().unwrap();
        let out = conn
            .execute(&stmt(
                "SELECT :a, @b, $c",
                Params::Named(vec![
                    ("a".into(), Value::Integer(1)),
                    ("b".into(), Value::Float(0.5)),
                    ("c".into(), Value::Blob(vec![7, 8])),
                ]),
            ))
            .unwrap();
        assert_eq!(
            out.rows,
            vec![vec![
                Value::Integer(1),
                Value::Float(0.5),
                Value::Blob(vec![7, 8])
            ]]
        );

        let err = conn
            .execute(&stmt(
                "SELECT :a",
                Params::Named(vec![("missing".into(), Value::Null)]),
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownParameter(name) if name == "missing"));
    }

    #[test]
    fn ddl_does_not_repeat_earlier_row_counts() {
        let mut conn = SqliteEngine::memory().connect().unwrap();
        conn.execute(&Statement::new("CREATE TABLE t(x)")).unwrap();
        let out = conn
            .execute(&Statement::new("INSERT INTO t VALUES (1), (2), (3)"))
            .unwrap();
        assert_eq!(out.affected_row_count, 3);

        let out = conn.execute(&Statement::new("CREATE TABLE u(y)")).unwrap();
        assert_eq!(out.affected_row_count, 0);

        let out = conn
            .execute(&Statement::new("UPDATE t SET x = x + 1 WHERE x > 1"))
            .unwrap();
        assert_eq!(out.affected_row_count, 2);
        let out = conn
            .execute(&Statement::new("DELETE FROM t WHERE x > 100"))
            .unwrap();
        assert_eq!(out.affected_row_count, 0);
    }

    #[test]
    fn describes_without_executing() {
        let mut conn = SqliteEngine::memory().connect().unwrap();
        conn.execute_batch("CREATE TABLE t(id INTEGER, v TEXT)")
            .unwrap();

        let desc = conn
            .describe("SELECT id, v || ? AS w FROM t WHERE id = :id")
            .unwrap();
        assert_eq!(desc.params, vec![None, Some(":id".to_string())]);
        assert_eq!(
            desc.columns,
            vec![
                DeclaredColumn {
                    name: "id".into(),
                    decltype: Some("INTEGER".into())
                },
                DeclaredColumn {
                    name: "w".into(),
                    decltype: None
                },
            ]
        );
        assert!(desc.is_readonly);
        assert!(!desc.is_explain);

        let desc = conn.describe("INSERT INTO t VALUES (1, 'a')").unwrap();
        assert!(!desc.is_readonly);
        assert!(desc.columns.is_empty());
        let out = conn.execute(&Statement::new("SELECT count(*) FROM t")).unwrap();
        assert_eq!(out.rows, vec![vec![Value::Integer(0)]]);

        assert!(conn.describe("EXPLAIN SELECT 1").unwrap().is_explain);
        assert!(conn.describe("SELEC 1").is_err());
    }

    #[test]
    fn reports_sql_errors() {
        let mut conn = SqliteEngine::memory().connect().unwrap();
        let err = conn.execute(&Statement::new("SELEC 1")).unwrap_err();
        assert!(matches!(err, EngineError::Statement(msg) if msg.contains("syntax error")));
    }

    #[test]
    fn batch_and_autocommit() {
        let mut conn = SqliteEngine::memory().connect().unwrap();
        assert!(conn.is_autocommit());
        conn.execute_batch("CREATE TABLE t(x); BEGIN; INSERT INTO t VALUES (1);")
            .unwrap();
        assert!(!conn.is_autocommit());
        conn.execute_batch("COMMIT").unwrap();
        assert!(conn.is_autocommit());
        conn.close().unwrap();
    }

    #[test]
    fn connections_share_a_database_file() {
        let temp = TempDir::new("sqlite").unwrap();
        let engine = SqliteEngine::open(temp.path().join("data.db"), Duration::from_secs(1));

        let mut first = engine.connect().unwrap();
        let mut second = engine.connect().unwrap();
        first
            .execute_batch("CREATE TABLE t(x); INSERT INTO t VALUES (42);")
            .unwrap();
        let out = second.execute(&Statement::new("SELECT x FROM t")).unwrap();
        assert_eq!(out.rows, vec![vec![Value::Integer(42)]]);
    }
}
