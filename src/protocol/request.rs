use serde::Deserialize;
use serde_json::Value as Json;

use crate::{
    Value,
    engine::{Params, Statement},
    value::{ValueError, json_kind},
};

use super::{batch::BatchBody, error::ResponseError, sqls::SqlStore};

const NAME_SIGILS: [char; 3] = [':', '@', '$'];

/// A frame sent by the client.
///
/// The request body is kept as raw JSON so that a malformed request is reported against its
/// `request_id` instead of tearing down the session.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    Hello {
        #[serde(default)]
        jwt: Option<String>,
    },
    Request {
        request_id: u64,
        request: Json,
    },
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    OpenStream {
        stream_id: u64,
    },
    CloseStream {
        stream_id: u64,
    },
    Execute {
        stream_id: u64,
        stmt: StmtBody,
    },
    Batch {
        stream_id: u64,
        batch: BatchBody,
    },
    Sequence {
        stream_id: u64,
        #[serde(default)]
        sql: Option<String>,
        #[serde(default)]
        sql_id: Option<u64>,
    },
    Describe {
        stream_id: u64,
        #[serde(default)]
        sql: Option<String>,
        #[serde(default)]
        sql_id: Option<u64>,
    },
    GetAutocommit {
        stream_id: u64,
    },
    StoreSql {
        sql_id: u64,
        sql: String,
    },
    CloseSql {
        sql_id: u64,
    },
}

impl Request {
    pub fn parse(json: Json) -> Result<Self, ResponseError> {
        serde_json::from_value(json).map_err(|e| ResponseError::InvalidRequest(e.to_string()))
    }

    /// The stream a request operates on; `None` for session-level requests.
    pub fn stream_id(&self) -> Option<u64> {
        match self {
            Request::OpenStream { stream_id }
            | Request::CloseStream { stream_id }
            | Request::Execute { stream_id, .. }
            | Request::Batch { stream_id, .. }
            | Request::Sequence { stream_id, .. }
            | Request::Describe { stream_id, .. }
            | Request::GetAutocommit { stream_id } => Some(*stream_id),
            Request::StoreSql { .. } | Request::CloseSql { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct StmtBody {
    /// Inline SQL text; exclusive with `sql_id`.
    #[serde(default)]
    pub sql: Option<String>,
    /// Id of a text stored with `store_sql`.
    #[serde(default)]
    pub sql_id: Option<u64>,
    /// Either an array of positional values or a map from sigil-prefixed names to values.
    #[serde(default)]
    pub args: Json,
    #[serde(default = "want_rows_default")]
    pub want_rows: bool,
}

fn want_rows_default() -> bool {
    true
}

impl StmtBody {
    /// Resolve the SQL text, decode the arguments and build the engine statement.
    pub fn into_statement(self, sqls: &SqlStore) -> Result<Statement, ResponseError> {
        let sql = sqls.resolve(self.sql, self.sql_id)?;
        let params = decode_params(&self.args)?;
        Ok(Statement {
            sql,
            params,
            want_rows: self.want_rows,
        })
    }
}

fn decode_params(args: &Json) -> Result<Params, ValueError> {
    match args {
        Json::Null => Ok(Params::default()),
        Json::Array(values) => values
            .iter()
            .map(decode_arg)
            .collect::<Result<Vec<_>, _>>()
            .map(Params::Positional),
        Json::Object(named) => {
            let mut params = Vec::with_capacity(named.len());
            for (name, value) in named {
                let Some(stripped) = name.strip_prefix(NAME_SIGILS) else {
                    return Err(ValueError::UnprefixedName(name.clone()));
                };
                params.push((stripped.to_string(), decode_arg(value)?));
            }
            Ok(Params::Named(params))
        }
        other => Err(ValueError::InvalidArguments(json_kind(other))),
    }
}

/// Arguments may be given as bare JSON scalars as well as tagged values.
fn decode_arg(json: &Json) -> Result<Value, ValueError> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Integer(i64::from(*b))),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Ok(Value::Integer(i)),
            None => n.as_f64().map(Value::Float).ok_or(ValueError::InvalidFloat),
        },
        Json::String(s) => Ok(Value::Text(s.clone())),
        Json::Object(_) => Value::decode(json),
        Json::Array(_) => Err(ValueError::NotAnObject("an array")),
    }
}
