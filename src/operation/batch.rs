//! Multi-stage batch
//!
//! Runs statements one after another on the same connection. Each stage is its own
//! simple-query exchange; the operation restarts itself with [`Next::Start`] between stages
//! so the connection never goes back to the pool mid-batch. A failed stage does not stop
//! the batch.

use super::query::{QueryResult, ResultReader};
use super::{Completion, Exchange, Next, Operation};
use crate::protocol::FrontendMessage;
use crate::{Error, Result};
use std::time::Duration;
use tokio::sync::oneshot;

/// Batch of statements executed in order
#[derive(Debug)]
pub struct Batch {
    stages: Vec<String>,
    current: usize,
    reader: ResultReader,
    results: Vec<QueryResult>,
    errors: Vec<Error>,
    completion: Completion<Vec<QueryResult>>,
    timeout: Option<Duration>,
}

impl Batch {
    /// Batch and the receiver for the per-stage results
    pub fn new<I, S>(stages: I) -> (Self, oneshot::Receiver<Result<Vec<QueryResult>>>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (completion, rx) = Completion::channel();
        (
            Self {
                stages: stages.into_iter().map(Into::into).collect(),
                current: 0,
                reader: ResultReader::new(false),
                results: Vec::new(),
                errors: Vec::new(),
                completion,
                timeout: None,
            },
            rx,
        )
    }

    /// Per-I/O deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn complete(&mut self) -> Next {
        let result = match Error::from_stages(std::mem::take(&mut self.errors)) {
            Some(err) => Err(err),
            None => Ok(std::mem::take(&mut self.results)),
        };
        self.completion.complete(result);
        Next::Finished
    }
}

impl Operation for Batch {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn on_start(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        let Some(sql) = self.stages.get(self.current) else {
            return Ok(self.complete());
        };
        tracing::debug!(stage = self.current, "batch stage");
        cx.write.write_message(&FrontendMessage::Query(sql.clone()))?;
        Ok(Next::Write)
    }

    fn on_read(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        if let Some(next) = self.reader.read(cx)? {
            return Ok(next);
        }
        match self.reader.finish() {
            Ok(result) => self.results.push(result),
            Err(err) => {
                tracing::debug!(stage = self.current, error = %err, "batch stage failed");
                self.errors.push(err);
            }
        }
        self.current += 1;
        if self.current < self.stages.len() {
            Ok(Next::Start)
        } else {
            Ok(self.complete())
        }
    }

    fn on_fail(&mut self, err: Error) {
        self.completion.complete(Err(err));
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::testing::*;

    fn run_stage(batch: &mut Batch, fx: &mut Fixture, reply: &[Vec<u8>]) -> Next {
        fx.read.clear();
        assert_eq!(batch.on_start(&mut fx.cx()).unwrap(), Next::Write);
        fx.sent();
        for bytes in reply {
            fx.feed(bytes);
        }
        batch.on_read(&mut fx.cx()).unwrap()
    }

    #[test]
    fn test_batch_runs_every_stage() {
        let mut fx = Fixture::new();
        let (mut batch, mut rx) = Batch::new(["BEGIN", "UPDATE t SET x = 1", "COMMIT"]);

        let ok = |tag: &str, status: u8| vec![command_complete(tag), ready(status)];
        assert_eq!(run_stage(&mut batch, &mut fx, &ok("BEGIN", b'T')), Next::Start);
        assert_eq!(run_stage(&mut batch, &mut fx, &ok("UPDATE 4", b'T')), Next::Start);
        assert_eq!(run_stage(&mut batch, &mut fx, &ok("COMMIT", b'I')), Next::Finished);

        let results = rx.try_recv().unwrap().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[1].rows_affected(), 4);
    }

    #[test]
    fn test_single_failed_stage_is_unwrapped() {
        let mut fx = Fixture::new();
        let (mut batch, mut rx) = Batch::new(["SELECT 1", "SELECT * FROM nope"]);

        run_stage(&mut batch, &mut fx, &[command_complete("SELECT 1"), ready(b'I')]);
        let next = run_stage(
            &mut batch,
            &mut fx,
            &[error_response("42P01", "missing"), ready(b'I')],
        );
        assert_eq!(next, Next::Finished);

        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.sqlstate(), Some("42P01"));
    }

    #[test]
    fn test_multiple_failed_stages_aggregate_in_order() {
        let mut fx = Fixture::new();
        let (mut batch, mut rx) = Batch::new(["bad one", "SELECT 1", "bad two"]);

        run_stage(&mut batch, &mut fx, &[error_response("42601", "first"), ready(b'I')]);
        run_stage(&mut batch, &mut fx, &[command_complete("SELECT 1"), ready(b'I')]);
        run_stage(&mut batch, &mut fx, &[error_response("42703", "second"), ready(b'I')]);

        match rx.try_recv().unwrap() {
            Err(Error::Aggregate(errors)) => {
                let codes: Vec<_> = errors.iter().map(|e| e.sqlstate()).collect();
                assert_eq!(codes, vec![Some("42601"), Some("42703")]);
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_batch_finishes_immediately() {
        let mut fx = Fixture::new();
        let (mut batch, mut rx) = Batch::new(Vec::<String>::new());
        assert_eq!(batch.on_start(&mut fx.cx()).unwrap(), Next::Finished);
        assert!(rx.try_recv().unwrap().unwrap().is_empty());
    }
}
