use std::collections::HashMap;

use super::error::ResponseError;

/// SQL texts stored by the client with `store_sql`, referenced later by `sql_id`.
///
/// Stored texts belong to the session, not to a stream, and are resolved on the session thread
/// when a request is received.
#[derive(Debug, Default)]
pub struct SqlStore {
    sqls: HashMap<u64, String>,
}

impl SqlStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, sql_id: u64, sql: String) -> Result<(), ResponseError> {
        if self.sqls.contains_key(&sql_id) {
            return Err(ResponseError::SqlExists { sql_id });
        }
        self.sqls.insert(sql_id, sql);
        Ok(())
    }

    /// Forget a stored text. Unknown ids are ignored.
    pub fn close(&mut self, sql_id: u64) {
        self.sqls.remove(&sql_id);
    }

    /// Pick the SQL text of a request that carries either inline `sql` or a stored `sql_id`.
    pub fn resolve(&self, sql: Option<String>, sql_id: Option<u64>) -> Result<String, ResponseError> {
        match (sql, sql_id) {
            (Some(sql), None) => Ok(sql),
            (None, Some(sql_id)) => self
                .sqls
                .get(&sql_id)
                .cloned()
                .ok_or(ResponseError::SqlNotFound { sql_id }),
            (Some(_), Some(_)) => Err(ResponseError::InvalidRequest(
                "only one of 'sql' and 'sql_id' may be given".into(),
            )),
            (None, None) => Err(ResponseError::InvalidRequest(
                "one of 'sql' and 'sql_id' is required".into(),
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.sqls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sqls.is_empty()
    }
}
