//! Message pump
//!
//! The reusable read loop most operations run inside `on_read`: decode complete messages
//! from the read buffer until more bytes are needed or the operation is done.
//!
//! * out-of-band tags go to their registered handler and never reach the operation
//! * an ErrorResponse is captured and pumping continues; until ReadyForQuery every other
//!   message of the failed exchange is dropped
//! * DataRow bodies are decoded incrementally through a [`RowCursor`], so a row does not
//!   have to fit in the read buffer when its columns stream

use super::{Exchange, Next};
use crate::protocol::constants::tags;
use crate::protocol::decode::{decode_header, decode_message, Decoded};
use crate::protocol::{
    BackendMessage, Column, ErrorFields, FieldDescription, FixedValue, RowCursor, RowHandler,
    RowProgress,
};
use crate::{Error, Result};

/// Whether the pump should keep going after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Decode the next message
    Continue,
    /// Stop and ask the continuation what to do next
    Stop,
}

/// Row handler that drops every value
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardRows;

impl RowHandler for DiscardRows {
    fn fixed(&mut self, _column: &Column<'_>, _value: FixedValue<'_>) -> Result<()> {
        Ok(())
    }
}

/// Pump state that must survive between reads
#[derive(Debug, Default)]
pub struct Pump {
    pending_error: Option<ErrorFields>,
    row: Option<RowCursor>,
    fields: Vec<FieldDescription>,
}

impl Pump {
    /// Fresh pump
    pub fn new() -> Self {
        Self::default()
    }

    /// Columns of the last RowDescription
    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    /// Use known columns for rows that arrive without a RowDescription (Execute of a
    /// described statement)
    pub fn set_fields(&mut self, fields: Vec<FieldDescription>) {
        self.fields = fields;
    }

    /// Whether an ErrorResponse is waiting to be surfaced
    pub fn has_error(&self) -> bool {
        self.pending_error.is_some()
    }

    /// Take the captured ErrorResponse as an error
    pub fn take_error(&mut self) -> Option<Error> {
        self.pending_error.take().map(Error::Server)
    }

    /// Forget per-exchange state (for operations that restart with [`Next::Start`])
    pub fn reset(&mut self) {
        self.pending_error = None;
        self.row = None;
        self.fields.clear();
    }

    /// Decode messages until more bytes are needed or `on_message` stops.
    ///
    /// Returns `Next::Read` with the byte shortfall, or whatever `what_next` decides
    /// once `on_message` returned [`Flow::Stop`].
    pub fn pump<M, W>(
        &mut self,
        cx: &mut Exchange<'_>,
        rows: &mut dyn RowHandler,
        mut on_message: M,
        what_next: W,
    ) -> Result<Next>
    where
        M: FnMut(BackendMessage, &mut Exchange<'_>) -> Result<Flow>,
        W: FnOnce(&mut Self, &mut Exchange<'_>) -> Result<Next>,
    {
        loop {
            if let Some(needs) = self.continue_row(cx, rows)? {
                return Ok(Next::read_at_least(needs));
            }

            let header = match decode_header(cx.read.readable())? {
                Ok(header) => header,
                Err(needs) => return Ok(Next::read_at_least(needs)),
            };

            if header.tag == tags::DATA_ROW && self.pending_error.is_none() {
                cx.read.consume(crate::protocol::constants::HEADER_LEN);
                self.row = Some(RowCursor::new(header.body_len()));
                continue;
            }

            let (msg, consumed) = match decode_message(cx.read.readable())? {
                Decoded::Message(msg, consumed) => (msg, consumed),
                Decoded::Needs(needs) => return Ok(Next::read_at_least(needs)),
            };
            cx.read.consume(consumed);

            if let Some(handler) = cx.oob.get(header.tag) {
                handler(&msg, cx.session);
                continue;
            }

            match msg {
                BackendMessage::ErrorResponse(fields) => {
                    tracing::debug!(error = %fields, "error response captured");
                    cx.session.last_error = Some(fields.clone());
                    if self.pending_error.is_none() {
                        self.pending_error = Some(fields);
                    }
                    continue;
                }
                BackendMessage::ReadyForQuery(status) => {
                    cx.session.transaction_status = status;
                }
                BackendMessage::RowDescription(ref fields) => {
                    self.fields = fields.clone();
                }
                _ if self.pending_error.is_some() => continue,
                _ => {}
            }

            if on_message(msg, cx)? == Flow::Stop {
                return what_next(self, cx);
            }
        }
    }

    /// Drive the in-progress DataRow, if any. Returns the shortfall while it is incomplete.
    fn continue_row(
        &mut self,
        cx: &mut Exchange<'_>,
        rows: &mut dyn RowHandler,
    ) -> Result<Option<usize>> {
        let Some(cursor) = self.row.as_mut() else {
            return Ok(None);
        };
        let progress = cursor.advance(cx.read.readable(), &self.fields, cx.types, rows)?;
        match progress {
            RowProgress::Needs { consumed, needs } => {
                cx.read.consume(consumed);
                Ok(Some(needs))
            }
            RowProgress::Done { consumed } => {
                cx.read.consume(consumed);
                self.row = None;
                Ok(None)
            }
        }
    }
}
