//! Conditional batches.
//!
//! A batch is a list of statements run back to back on one stream. Each step may carry a
//! condition over the outcome of earlier steps (or the connection's autocommit state); a step
//! whose condition is false is skipped. A failing step does not abort the batch: its error is
//! recorded and later conditions can react to it, which is how clients express
//! `BEGIN ... COMMIT`/`ROLLBACK` in a single round trip.
use serde::{Deserialize, Serialize};

use super::{
    error::ResponseError,
    request::StmtBody,
    response::{ErrorBody, StmtResult},
    sqls::SqlStore,
};
use crate::engine::{Connection, Statement};

#[derive(Debug, Deserialize, PartialEq)]
pub struct BatchBody {
    pub steps: Vec<BatchStepBody>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct BatchStepBody {
    #[serde(default)]
    pub condition: Option<BatchCond>,
    pub stmt: StmtBody,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchCond {
    /// The step ran and succeeded.
    Ok { step: u32 },
    /// The step ran and failed.
    Error { step: u32 },
    Not { cond: Box<BatchCond> },
    And { conds: Vec<BatchCond> },
    Or { conds: Vec<BatchCond> },
    IsAutocommit {},
}

impl BatchCond {
    /// Conditions may only look at steps that come before `step`.
    fn check(&self, step: usize) -> Result<(), ResponseError> {
        match self {
            BatchCond::Ok { step: target } | BatchCond::Error { step: target } => {
                if (*target as usize) >= step {
                    return Err(ResponseError::InvalidRequest(format!(
                        "condition of step {step} refers to step {target}, which does not precede it"
                    )));
                }
                Ok(())
            }
            BatchCond::Not { cond } => cond.check(step),
            BatchCond::And { conds } | BatchCond::Or { conds } => {
                conds.iter().try_for_each(|cond| cond.check(step))
            }
            BatchCond::IsAutocommit {} => Ok(()),
        }
    }

    fn eval(&self, result: &BatchResult, conn: &dyn Connection) -> bool {
        match self {
            BatchCond::Ok { step } => {
                matches!(result.step_results.get(*step as usize), Some(Some(_)))
            }
            BatchCond::Error { step } => {
                matches!(result.step_errors.get(*step as usize), Some(Some(_)))
            }
            BatchCond::Not { cond } => !cond.eval(result, conn),
            BatchCond::And { conds } => conds.iter().all(|cond| cond.eval(result, conn)),
            BatchCond::Or { conds } => conds.iter().any(|cond| cond.eval(result, conn)),
            BatchCond::IsAutocommit {} => conn.is_autocommit(),
        }
    }
}

/// Outcome of every step, by position. A skipped step has neither a result nor an error.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct BatchResult {
    pub step_results: Vec<Option<StmtResult>>,
    pub step_errors: Vec<Option<ErrorBody>>,
}

/// A decoded batch, ready to run on a connection.
#[derive(Debug)]
pub struct Program {
    steps: Vec<(Option<BatchCond>, Statement)>,
}

impl BatchBody {
    pub fn into_program(self, sqls: &SqlStore) -> Result<Program, ResponseError> {
        let steps = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| {
                if let Some(cond) = &step.condition {
                    cond.check(i)?;
                }
                Ok((step.condition, step.stmt.into_statement(sqls)?))
            })
            .collect::<Result<_, ResponseError>>()?;
        Ok(Program { steps })
    }
}

impl Program {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn run(&self, conn: &mut dyn Connection) -> BatchResult {
        let mut result = BatchResult::default();
        for (condition, stmt) in &self.steps {
            let enabled = condition
                .as_ref()
                .is_none_or(|cond| cond.eval(&result, &*conn));
            let (output, error) = if !enabled {
                (None, None)
            } else {
                match conn.execute(stmt) {
                    Ok(output) => (Some(StmtResult::from_output(output, stmt.want_rows)), None),
                    Err(err) => (None, Some(ResponseError::StatementExecution(err).to_body())),
                }
            };
            result.step_results.push(output);
            result.step_errors.push(error);
        }
        result
    }
}
