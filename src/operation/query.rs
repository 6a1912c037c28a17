//! Query operations
//!
//! [`SimpleQuery`] runs SQL text through the simple query protocol. [`PreparedQuery`]
//! uses the extended protocol: the statement is parsed and described once per connection
//! and cached by SQL text, later executions only Bind and Execute.

use super::pump::{Flow, Pump};
use super::{Completion, Exchange, Next, Operation, PreparedStatement};
use crate::protocol::types::Value;
use crate::protocol::{
    BackendMessage, Column, CommandComplete, FieldDescription, FixedValue, FrontendMessage,
    RowHandler, StreamChunk, Target,
};
use crate::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

/// One collected row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    values: Vec<Option<Bytes>>,
}

impl Row {
    /// Raw value of column `index`; `None` for NULL or out of range
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    /// Value of column `index` as UTF-8 text
    pub fn get_str(&self, index: usize) -> Result<Option<&str>> {
        self.get(index)
            .map(|raw| {
                std::str::from_utf8(raw)
                    .map_err(|e| Error::Protocol(format!("column {index} is not UTF-8: {e}")))
            })
            .transpose()
    }

    /// Whether column `index` is NULL
    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(None))
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Everything a query returned
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Columns of the last result set
    pub fields: Vec<FieldDescription>,
    /// Collected rows (empty when a custom row handler was used)
    pub rows: Vec<Row>,
    /// One status per executed statement
    pub commands: Vec<CommandComplete>,
}

impl QueryResult {
    /// Sum of the row counts of all completed commands
    pub fn rows_affected(&self) -> u64 {
        self.commands.iter().map(|c| c.rows).sum()
    }

    /// Index of the column called `name`
    pub fn column(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Row handler that keeps every value, reassembling streamed columns
#[derive(Debug, Default)]
struct RowCollector {
    current: Vec<Option<Bytes>>,
    partial: Vec<u8>,
    rows: Vec<Row>,
}

impl RowHandler for RowCollector {
    fn fixed(&mut self, _column: &Column<'_>, value: FixedValue<'_>) -> Result<()> {
        self.current.push(value.as_bytes().map(Bytes::copy_from_slice));
        Ok(())
    }

    fn streaming(&mut self, _column: &Column<'_>, chunk: &mut StreamChunk<'_>) -> Result<()> {
        chunk.stream(&mut self.partial)?;
        if chunk.is_last() {
            let value = std::mem::take(&mut self.partial);
            self.current.push(Some(Bytes::from(value)));
        }
        Ok(())
    }

    fn row_end(&mut self) -> Result<()> {
        self.rows.push(Row {
            values: std::mem::take(&mut self.current),
        });
        Ok(())
    }
}

enum Rows {
    Collect(RowCollector),
    Custom(Box<dyn RowHandler + Send>),
}

impl Rows {
    fn handler(&mut self) -> &mut dyn RowHandler {
        match self {
            Rows::Collect(collector) => collector,
            Rows::Custom(handler) => handler.as_mut(),
        }
    }

    fn take_rows(&mut self) -> Vec<Row> {
        match self {
            Rows::Collect(collector) => std::mem::take(&mut collector.rows),
            Rows::Custom(_) => Vec::new(),
        }
    }
}

impl fmt::Debug for Rows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rows::Collect(c) => write!(f, "Collect({} rows)", c.rows.len()),
            Rows::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Result-set reader shared by the query operations
#[derive(Debug)]
pub(crate) struct ResultReader {
    pump: Pump,
    rows: Rows,
    commands: Vec<CommandComplete>,
    extended: bool,
}

impl ResultReader {
    pub(crate) fn new(extended: bool) -> Self {
        Self {
            pump: Pump::new(),
            rows: Rows::Collect(RowCollector::default()),
            commands: Vec::new(),
            extended,
        }
    }

    fn with_handler(mut self, handler: Box<dyn RowHandler + Send>) -> Self {
        self.rows = Rows::Custom(handler);
        self
    }

    /// Pump until ReadyForQuery. `None` means the exchange is complete.
    pub(crate) fn read(&mut self, cx: &mut Exchange<'_>) -> Result<Option<Next>> {
        let extended = self.extended;
        let commands = &mut self.commands;
        let next = self.pump.pump(
            cx,
            self.rows.handler(),
            |msg, _cx| match msg {
                BackendMessage::RowDescription(_) | BackendMessage::EmptyQueryResponse => {
                    Ok(Flow::Continue)
                }
                BackendMessage::CommandComplete(complete) => {
                    tracing::debug!(tag = %complete.tag, "command complete");
                    commands.push(complete);
                    Ok(Flow::Continue)
                }
                BackendMessage::BindComplete
                | BackendMessage::CloseComplete
                | BackendMessage::NoData
                    if extended =>
                {
                    Ok(Flow::Continue)
                }
                BackendMessage::ReadyForQuery(_) => Ok(Flow::Stop),
                BackendMessage::CopyInResponse(_)
                | BackendMessage::CopyOutResponse(_)
                | BackendMessage::CopyBothResponse(_) => Err(Error::UnexpectedMessage(
                    "COPY is not supported by query operations".into(),
                )),
                other => Err(Error::UnexpectedMessage(format!(
                    "{} in query response",
                    other.name()
                ))),
            },
            |_, _| Ok(Next::Finished),
        )?;
        Ok(match next {
            Next::Finished => None,
            other => Some(other),
        })
    }

    /// Result of the exchange that just reached ReadyForQuery; resets for the next one
    pub(crate) fn finish(&mut self) -> Result<QueryResult> {
        let fields = self.pump.fields().to_vec();
        let rows = self.rows.take_rows();
        let commands = std::mem::take(&mut self.commands);
        let error = self.pump.take_error();
        self.pump.reset();
        match error {
            Some(err) => Err(err),
            None => Ok(QueryResult {
                fields,
                rows,
                commands,
            }),
        }
    }
}

/// Simple-protocol query
#[derive(Debug)]
pub struct SimpleQuery {
    sql: String,
    reader: ResultReader,
    completion: Completion<QueryResult>,
    timeout: Option<Duration>,
}

impl SimpleQuery {
    /// Query and the receiver for its result
    pub fn new(sql: impl Into<String>) -> (Self, oneshot::Receiver<Result<QueryResult>>) {
        let (completion, rx) = Completion::channel();
        (
            Self {
                sql: sql.into(),
                reader: ResultReader::new(false),
                completion,
                timeout: None,
            },
            rx,
        )
    }

    /// Hand rows to `handler` instead of collecting them
    pub fn with_rows(mut self, handler: impl RowHandler + Send + 'static) -> Self {
        self.reader = self.reader.with_handler(Box::new(handler));
        self
    }

    /// Per-I/O deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Operation for SimpleQuery {
    fn name(&self) -> &'static str {
        "simple_query"
    }

    fn on_start(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        cx.write.write_message(&FrontendMessage::Query(self.sql.clone()))?;
        Ok(Next::Write)
    }

    fn on_read(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        if let Some(next) = self.reader.read(cx)? {
            return Ok(next);
        }
        self.completion.complete(self.reader.finish());
        Ok(Next::Finished)
    }

    fn on_fail(&mut self, err: Error) {
        self.completion.complete(Err(err));
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[derive(Debug)]
enum Phase {
    /// Parse + Describe sent for a new statement
    Preparing {
        name: String,
        param_types: Vec<u32>,
        fields: Vec<FieldDescription>,
    },
    /// Bind + Execute sent
    Executing,
}

/// Extended-protocol query with cached statement preparation
#[derive(Debug)]
pub struct PreparedQuery {
    sql: String,
    params: Vec<Value>,
    phase: Phase,
    prepare: Pump,
    reader: ResultReader,
    completion: Completion<QueryResult>,
    timeout: Option<Duration>,
}

impl PreparedQuery {
    /// Query with positional parameters and the receiver for its result
    pub fn new(
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> (Self, oneshot::Receiver<Result<QueryResult>>) {
        let (completion, rx) = Completion::channel();
        (
            Self {
                sql: sql.into(),
                params,
                phase: Phase::Executing,
                prepare: Pump::new(),
                reader: ResultReader::new(true),
                completion,
                timeout: None,
            },
            rx,
        )
    }

    /// Hand rows to `handler` instead of collecting them
    pub fn with_rows(mut self, handler: impl RowHandler + Send + 'static) -> Self {
        self.reader = self.reader.with_handler(Box::new(handler));
        self
    }

    /// Per-I/O deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn bind(&mut self, statement: &PreparedStatement, cx: &mut Exchange<'_>) -> Result<()> {
        if statement.param_types.len() != self.params.len() {
            return Err(Error::Config(format!(
                "statement expects {} parameters, {} given",
                statement.param_types.len(),
                self.params.len()
            )));
        }
        let params = statement
            .param_types
            .iter()
            .zip(&self.params)
            .map(|(&oid, value)| cx.types.encode(oid, value, crate::protocol::Format::Text))
            .collect::<Result<Vec<_>>>()?;

        cx.write.write_message(&FrontendMessage::Bind {
            portal: String::new(),
            statement: statement.name.clone(),
            param_formats: Vec::new(),
            params,
            result_formats: Vec::new(),
        })?;
        cx.write.write_message(&FrontendMessage::Execute {
            portal: String::new(),
            max_rows: 0,
        })?;
        cx.write.write_message(&FrontendMessage::Sync)?;
        Ok(())
    }

    fn read_description(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        let Phase::Preparing {
            param_types,
            fields,
            ..
        } = &mut self.phase
        else {
            return Err(Error::InvalidState {
                expected: "preparing".into(),
                actual: "executing".into(),
            });
        };

        let next = self.prepare.pump(
            cx,
            &mut super::DiscardRows,
            |msg, _cx| match msg {
                BackendMessage::ParseComplete | BackendMessage::NoData => Ok(Flow::Continue),
                BackendMessage::ParameterDescription(types) => {
                    *param_types = types;
                    Ok(Flow::Continue)
                }
                BackendMessage::RowDescription(columns) => {
                    *fields = columns;
                    Ok(Flow::Continue)
                }
                BackendMessage::ReadyForQuery(_) => Ok(Flow::Stop),
                other => Err(Error::UnexpectedMessage(format!(
                    "{} while preparing a statement",
                    other.name()
                ))),
            },
            |_, _| Ok(Next::Finished),
        )?;
        if next != Next::Finished {
            return Ok(next);
        }

        if let Some(err) = self.prepare.take_error() {
            self.completion.complete(Err(err));
            return Ok(Next::Finished);
        }
        if let Phase::Preparing {
            name,
            param_types,
            fields,
        } = std::mem::replace(&mut self.phase, Phase::Executing)
        {
            tracing::debug!(statement = %name, params = param_types.len(), "statement prepared");
            cx.statements.insert(
                self.sql.clone(),
                PreparedStatement {
                    name,
                    param_types,
                    fields,
                },
            );
        }
        Ok(Next::Start)
    }
}

impl Operation for PreparedQuery {
    fn name(&self) -> &'static str {
        "prepared_query"
    }

    fn on_start(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        let Some(statement) = cx.statements.get(&self.sql).cloned() else {
            let name = cx.statements.next_name();
            cx.write.write_message(&FrontendMessage::Parse {
                name: name.clone(),
                query: self.sql.clone(),
                param_types: Vec::new(),
            })?;
            cx.write
                .write_message(&FrontendMessage::Describe(Target::Statement(name.clone())))?;
            cx.write.write_message(&FrontendMessage::Sync)?;
            self.phase = Phase::Preparing {
                name,
                param_types: Vec::new(),
                fields: Vec::new(),
            };
            return Ok(Next::Write);
        };

        self.phase = Phase::Executing;
        self.reader.pump.set_fields(statement.fields.clone());
        if let Err(err) = self.bind(&statement, cx) {
            // nothing was sent; the connection is still idle
            cx.write.clear();
            self.completion.complete(Err(err));
            return Ok(Next::Finished);
        }
        Ok(Next::Write)
    }

    fn on_read(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        if matches!(self.phase, Phase::Preparing { .. }) {
            return self.read_description(cx);
        }
        if let Some(next) = self.reader.read(cx)? {
            return Ok(next);
        }
        self.completion.complete(self.reader.finish());
        Ok(Next::Finished)
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
    use crate::protocol::constants::oid;

    fn parameter_description(oids: &[u32]) -> Vec<u8> {
        let mut body = (oids.len() as i16).to_be_bytes().to_vec();
        for oid in oids {
            body.extend_from_slice(&oid.to_be_bytes());
        }
        msg(b't', &body)
    }

    #[test]
    fn test_simple_query_collects_rows() {
        let mut fx = Fixture::new();
        let (mut query, mut rx) = SimpleQuery::new("SELECT a, b FROM t");
        assert_eq!(query.on_start(&mut fx.cx()).unwrap(), Next::Write);
        let sent = fx.sent();
        assert_eq!(sent[0], b'Q');
        assert_eq!(&sent[5..sent.len() - 1], b"SELECT a, b FROM t");

        fx.feed(&row_description(&[("a", oid::TEXT), ("b", oid::INT4)]));
        fx.feed(&data_row(&[Some(b"x"), Some(b"1")]));
        fx.feed(&data_row(&[None, Some(b"2")]));
        fx.feed(&command_complete("SELECT 2"));
        fx.feed(&ready(b'I'));
        assert_eq!(query.on_read(&mut fx.cx()).unwrap(), Next::Finished);

        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0].get_str(0).unwrap(), Some("x"));
        assert!(result.rows[1].is_null(0));
        assert_eq!(result.rows[1].get(1), Some(&b"2"[..]));
        assert_eq!(result.column("b"), Some(1));
        assert_eq!(result.rows_affected(), 2);
    }

    #[test]
    fn test_simple_query_reassembles_streamed_column() {
        let mut fx = Fixture::new();
        let (mut query, mut rx) = SimpleQuery::new("SELECT payload FROM blobs");
        query.on_start(&mut fx.cx()).unwrap();

        let payload = vec![7u8; 300];
        let row = data_row(&[Some(&payload)]);
        fx.feed(&row_description(&[("payload", oid::BYTEA)]));
        fx.feed(&row[..100]);
        let next = query.on_read(&mut fx.cx()).unwrap();
        assert!(matches!(next, Next::Read { .. }));

        fx.read.compact();
        fx.feed(&row[100..]);
        fx.feed(&command_complete("SELECT 1"));
        fx.feed(&ready(b'I'));
        assert_eq!(query.on_read(&mut fx.cx()).unwrap(), Next::Finished);

        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!(result.rows[0].get(0), Some(payload.as_slice()));
    }

    #[test]
    fn test_simple_query_surfaces_server_error_at_ready() {
        let mut fx = Fixture::new();
        let (mut query, mut rx) = SimpleQuery::new("SELECT * FROM missing");
        query.on_start(&mut fx.cx()).unwrap();

        fx.feed(&error_response("42P01", "relation \"missing\" does not exist"));
        assert!(matches!(query.on_read(&mut fx.cx()).unwrap(), Next::Read { .. }));
        assert!(rx.try_recv().is_err());

        fx.feed(&ready(b'I'));
        assert_eq!(query.on_read(&mut fx.cx()).unwrap(), Next::Finished);
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.sqlstate(), Some("42P01"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_simple_query_rejects_copy() {
        let mut fx = Fixture::new();
        let (mut query, _rx) = SimpleQuery::new("COPY t FROM STDIN");
        query.on_start(&mut fx.cx()).unwrap();
        fx.feed(&msg(b'G', &[0, 0, 0]));
        assert!(matches!(
            query.on_read(&mut fx.cx()),
            Err(Error::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn test_custom_row_handler_receives_rows() {
        use std::sync::{Arc, Mutex};

        #[derive(Clone, Default)]
        struct Sum(Arc<Mutex<i64>>);

        impl RowHandler for Sum {
            fn fixed(&mut self, _column: &Column<'_>, value: FixedValue<'_>) -> Result<()> {
                *self.0.lock().unwrap() += value.as_i64()?;
                Ok(())
            }
        }

        let sum = Sum::default();
        let mut fx = Fixture::new();
        let (query, mut rx) = SimpleQuery::new("SELECT n FROM t");
        let mut query = query.with_rows(sum.clone());
        query.on_start(&mut fx.cx()).unwrap();

        fx.feed(&row_description(&[("n", oid::INT8)]));
        fx.feed(&data_row(&[Some(b"40")]));
        fx.feed(&data_row(&[Some(b"2")]));
        fx.feed(&command_complete("SELECT 2"));
        fx.feed(&ready(b'I'));
        query.on_read(&mut fx.cx()).unwrap();

        let result = rx.try_recv().unwrap().unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(*sum.0.lock().unwrap(), 42);
    }

    #[test]
    fn test_prepared_query_prepares_then_executes() {
        let mut fx = Fixture::new();
        let sql = "SELECT name FROM users WHERE id = $1";
        let (mut query, mut rx) = PreparedQuery::new(sql, vec![Value::Int(7)]);

        assert_eq!(query.on_start(&mut fx.cx()).unwrap(), Next::Write);
        let sent = fx.sent();
        assert_eq!(sent[0], b'P');
        assert!(sent.contains(&b'D'));
        assert_eq!(&sent[sent.len() - 5..], &[b'S', 0, 0, 0, 4]);

        fx.feed(&msg(b'1', &[]));
        fx.feed(&parameter_description(&[oid::INT4]));
        fx.feed(&row_description(&[("name", oid::TEXT)]));
        fx.feed(&ready(b'I'));
        assert_eq!(query.on_read(&mut fx.cx()).unwrap(), Next::Start);
        assert_eq!(fx.statements.len(), 1);
        assert_eq!(fx.statements.get(sql).unwrap().param_types, vec![oid::INT4]);

        fx.read.clear();
        assert_eq!(query.on_start(&mut fx.cx()).unwrap(), Next::Write);
        let sent = fx.sent();
        assert_eq!(sent[0], b'B');
        // the parameter goes out as text
        assert!(sent.windows(5).any(|w| w == [0, 0, 0, 1, b'7']));

        fx.feed(&msg(b'2', &[]));
        fx.feed(&data_row(&[Some(b"ada")]));
        fx.feed(&command_complete("SELECT 1"));
        fx.feed(&ready(b'I'));
        assert_eq!(query.on_read(&mut fx.cx()).unwrap(), Next::Finished);

        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!(result.fields[0].name, "name");
        assert_eq!(result.rows[0].get_str(0).unwrap(), Some("ada"));
    }

    #[test]
    fn test_prepared_query_failed_parse_is_not_cached() {
        let mut fx = Fixture::new();
        let (mut query, mut rx) = PreparedQuery::new("SELEC 1", vec![]);
        query.on_start(&mut fx.cx()).unwrap();
        fx.sent();

        fx.feed(&error_response("42601", "syntax error at or near \"SELEC\""));
        fx.feed(&ready(b'I'));
        assert_eq!(query.on_read(&mut fx.cx()).unwrap(), Next::Finished);
        assert!(fx.statements.is_empty());
        assert_eq!(rx.try_recv().unwrap().unwrap_err().sqlstate(), Some("42601"));
    }

    #[test]
    fn test_prepared_query_parameter_count_mismatch() {
        let mut fx = Fixture::new();
        fx.statements.insert(
            "SELECT $1",
            PreparedStatement {
                name: "pgpump_s1".into(),
                param_types: vec![oid::INT4],
                fields: vec![],
            },
        );
        let (mut query, mut rx) = PreparedQuery::new("SELECT $1", vec![]);
        assert_eq!(query.on_start(&mut fx.cx()).unwrap(), Next::Finished);
        assert!(fx.write.is_empty());
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Config(_))));
    }
}
