use serde::{Serialize, Serializer};

use super::batch::BatchResult;
use crate::{
    Value,
    engine::{Description, StatementOutput},
};

/// A frame sent by the server.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    HelloOk,
    ResponseOk { request_id: u64, response: Response },
    ResponseError { request_id: u64, error: ErrorBody },
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Response {
    OpenStream {},
    CloseStream {},
    Execute(StmtResult),
    Batch(BatchResult),
    Sequence {},
    Describe(DescribeResult),
    GetAutocommit { is_autocommit: bool },
    StoreSql {},
    CloseSql {},
}

#[derive(Debug, Serialize, PartialEq)]
pub struct StmtResult {
    pub cols: Vec<Col>,
    pub rows: Vec<Vec<Value>>,
    pub affected_row_count: u64,
    #[serde(serialize_with = "option_i64_as_str")]
    pub last_insert_rowid: Option<i64>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Col {
    pub name: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DescribeResult {
    pub params: Vec<DescribeParam>,
    pub cols: Vec<DescribeCol>,
    pub is_explain: bool,
    pub is_readonly: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DescribeParam {
    pub name: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DescribeCol {
    pub name: String,
    pub decltype: Option<String>,
}

impl From<Description> for DescribeResult {
    fn from(desc: Description) -> Self {
        Self {
            params: desc
                .params
                .into_iter()
                .map(|name| DescribeParam { name })
                .collect(),
            cols: desc
                .columns
                .into_iter()
                .map(|col| DescribeCol {
                    name: col.name,
                    decltype: col.decltype,
                })
                .collect(),
            is_explain: desc.is_explain,
            is_readonly: desc.is_readonly,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub message: String,
    pub code: &'static str,
}

impl StmtResult {
    /// Shape engine output for the wire. Rows are dropped unless requested and a negative
    /// modified-row count is reported as zero.
    pub fn from_output(output: StatementOutput, want_rows: bool) -> Self {
        Self {
            cols: output
                .columns
                .into_iter()
                .map(|c| Col { name: c.name })
                .collect(),
            rows: if want_rows { output.rows } else { Vec::new() },
            affected_row_count: u64::try_from(output.affected_row_count).unwrap_or(0),
            last_insert_rowid: output.last_insert_rowid,
        }
    }
}

fn option_i64_as_str<S: Serializer>(value: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_str(&v.to_string()),
        None => serializer.serialize_none(),
    }
}
