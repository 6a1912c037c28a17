//! Incremental DataRow decoding
//!
//! A [`RowCursor`] walks one DataRow body as bytes arrive. Columns whose type is not
//! streamable are delivered once, fully buffered, as a [`FixedValue`]; streamable columns
//! are delivered chunk by chunk as a [`StreamChunk`] that the handler can drain into any
//! `std::io::Write` sink. The cursor never holds on to buffer memory between calls; it
//! only remembers how far it got.

use super::message::{FieldDescription, Format};
use super::types::{parse_text_array, Codec, TypeRegistry, Value};
use crate::{Error, Result};
use std::io;
use std::sync::Arc;

/// Column metadata handed to row callbacks
#[derive(Debug, Clone, Copy)]
pub struct Column<'a> {
    /// Zero-based column index
    pub index: usize,
    /// Description from the preceding RowDescription, if any
    pub description: Option<&'a FieldDescription>,
}

impl Column<'_> {
    /// Type OID, 0 when unknown
    pub fn type_oid(&self) -> u32 {
        self.description.map_or(0, |d| d.type_oid)
    }

    /// Column format, text when unknown
    pub fn format(&self) -> Format {
        self.description.map_or(Format::Text, |d| d.format())
    }

    /// Column name, empty when unknown
    pub fn name(&self) -> &str {
        self.description.map_or("", |d| d.name.as_str())
    }
}

/// Receives the columns of one row
pub trait RowHandler {
    /// A fully buffered value (or NULL)
    fn fixed(&mut self, column: &Column<'_>, value: FixedValue<'_>) -> Result<()>;

    /// A chunk of a streamed value. Bytes the handler does not take are discarded.
    fn streaming(&mut self, column: &Column<'_>, chunk: &mut StreamChunk<'_>) -> Result<()> {
        let _ = (column, chunk);
        Ok(())
    }

    /// Every column has been delivered
    fn row_end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A complete column value, positioned at its 4-byte length prefix.
///
/// Every accessor re-reads the prefix, so accessors can be called in any order.
#[derive(Debug, Clone, Copy)]
pub struct FixedValue<'a> {
    raw: &'a [u8],
    format: Format,
    codec: Option<&'a Arc<dyn Codec>>,
}

impl<'a> FixedValue<'a> {
    /// Wrap a length-prefixed value
    pub fn new(raw: &'a [u8], format: Format, codec: Option<&'a Arc<dyn Codec>>) -> Self {
        Self { raw, format, codec }
    }

    fn declared_len(&self) -> i32 {
        i32::from_be_bytes([self.raw[0], self.raw[1], self.raw[2], self.raw[3]])
    }

    /// Value bytes, `None` for NULL
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        let len = self.declared_len();
        if len < 0 {
            None
        } else {
            Some(&self.raw[4..4 + len as usize])
        }
    }

    /// Whether the value is NULL
    pub fn is_null(&self) -> bool {
        self.declared_len() < 0
    }

    /// Wire format of the value
    pub fn format(&self) -> Format {
        self.format
    }

    /// Value as UTF-8 text; NULL is `None`
    pub fn as_str(&self) -> Result<Option<&'a str>> {
        self.as_bytes()
            .map(|b| std::str::from_utf8(b).map_err(|e| Error::Protocol(format!("invalid UTF-8: {e}"))))
            .transpose()
    }

    /// Owned text; NULL is `None`
    pub fn as_string(&self) -> Result<Option<String>> {
        Ok(self.as_str()?.map(str::to_owned))
    }

    /// Boolean; NULL is `false`
    pub fn as_bool(&self) -> Result<bool> {
        match (self.as_bytes(), self.format) {
            (None, _) => Ok(false),
            (Some(b"t"), Format::Text) => Ok(true),
            (Some(b"f"), Format::Text) => Ok(false),
            (Some([b]), Format::Binary) => Ok(*b != 0),
            (Some(raw), _) => Err(Error::Protocol(format!(
                "invalid boolean {:?}",
                String::from_utf8_lossy(raw)
            ))),
        }
    }

    fn integer(&self) -> Result<i64> {
        let Some(raw) = self.as_bytes() else {
            return Ok(0);
        };
        match self.format {
            Format::Text => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| {
                    Error::Protocol(format!("invalid integer {:?}", String::from_utf8_lossy(raw)))
                }),
            Format::Binary => match raw.len() {
                2 => Ok(i64::from(i16::from_be_bytes([raw[0], raw[1]]))),
                4 => Ok(i64::from(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))),
                8 => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(raw);
                    Ok(i64::from_be_bytes(b))
                }
                n => Err(Error::Protocol(format!("invalid binary integer width {n}"))),
            },
        }
    }

    /// 32-bit integer; NULL is 0
    pub fn as_i32(&self) -> Result<i32> {
        let v = self.integer()?;
        i32::try_from(v).map_err(|_| Error::Protocol(format!("{v} out of range for i32")))
    }

    /// 64-bit integer; NULL is 0
    pub fn as_i64(&self) -> Result<i64> {
        self.integer()
    }

    /// Double; NULL is 0.0
    pub fn as_f64(&self) -> Result<f64> {
        let Some(raw) = self.as_bytes() else {
            return Ok(0.0);
        };
        match (self.format, raw.len()) {
            (Format::Binary, 4) => Ok(f64::from(f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))),
            (Format::Binary, 8) => {
                let mut b = [0u8; 8];
                b.copy_from_slice(raw);
                Ok(f64::from_be_bytes(b))
            }
            _ => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| {
                    Error::Protocol(format!("invalid float {:?}", String::from_utf8_lossy(raw)))
                }),
        }
    }

    /// Float; NULL is 0.0
    pub fn as_f32(&self) -> Result<f32> {
        self.as_f64().map(|v| v as f32)
    }

    /// One-dimensional text array; NULL is `None`
    pub fn as_array(&self) -> Result<Option<Vec<Option<String>>>> {
        self.as_str()?.map(parse_text_array).transpose()
    }

    /// Value decoded through the column's codec; unknown types decode as text
    pub fn as_object(&self) -> Result<Value> {
        let Some(raw) = self.as_bytes() else {
            return Ok(Value::Null);
        };
        match (self.codec, self.format) {
            (Some(codec), format) => codec.decode(raw, format),
            (None, Format::Text) => Ok(Value::Text(String::from_utf8_lossy(raw).into_owned())),
            (None, Format::Binary) => Ok(Value::Bytes(bytes::Bytes::copy_from_slice(raw))),
        }
    }
}

/// The currently buffered part of a streamed column value
#[derive(Debug)]
pub struct StreamChunk<'a> {
    data: &'a [u8],
    taken: usize,
    remaining: usize,
}

impl<'a> StreamChunk<'a> {
    /// Bytes of this chunk not yet taken
    pub fn bytes(&self) -> &'a [u8] {
        &self.data[self.taken..]
    }

    /// Bytes of the column still to come after this chunk
    pub fn remaining_after(&self) -> usize {
        self.remaining - self.data.len()
    }

    /// Whether this chunk ends the column
    pub fn is_last(&self) -> bool {
        self.remaining == self.data.len()
    }

    /// Transfer the untaken bytes of this chunk into `sink`
    pub fn stream<W: io::Write + ?Sized>(&mut self, sink: &mut W) -> Result<usize> {
        let bytes = self.bytes();
        sink.write_all(bytes)?;
        self.taken = self.data.len();
        Ok(bytes.len())
    }
}

/// A character sink decoding UTF-8 across chunk boundaries.
///
/// Implements `io::Write` so it can be handed to [`StreamChunk::stream`].
#[derive(Debug, Default)]
pub struct Utf8Sink<W> {
    out: W,
    partial: Vec<u8>,
}

impl<W: std::fmt::Write> Utf8Sink<W> {
    /// Wrap a character sink
    pub fn new(out: W) -> Self {
        Self {
            out,
            partial: Vec::new(),
        }
    }

    /// Finish decoding; fails if the input stopped mid-character
    pub fn finish(self) -> Result<W> {
        if !self.partial.is_empty() {
            return Err(Error::Protocol("stream ended inside a UTF-8 sequence".into()));
        }
        Ok(self.out)
    }
}

impl<W: std::fmt::Write> io::Write for Utf8Sink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.partial.extend_from_slice(buf);
        let valid = match std::str::from_utf8(&self.partial) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        };
        // valid_up_to guarantees this prefix is UTF-8
        let text = std::str::from_utf8(&self.partial[..valid])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.out
            .write_str(text)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "character sink refused input"))?;
        self.partial.drain(..valid);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    Incomplete,
    Fixed { len: usize },
    Streaming { remaining: usize },
}

/// Result of one cursor step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowProgress {
    /// More bytes are needed; `consumed` bytes of the input may be discarded
    Needs {
        /// Input bytes fully processed
        consumed: usize,
        /// Minimum further bytes required
        needs: usize,
    },
    /// The row is complete
    Done {
        /// Input bytes fully processed
        consumed: usize,
    },
}

/// Decode position within one DataRow body
#[derive(Debug, Clone)]
pub struct RowCursor {
    body_len: usize,
    consumed: usize,
    columns: usize,
    index: usize,
    state: State,
}

fn read_i32(data: &[u8]) -> i32 {
    i32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

impl RowCursor {
    /// Cursor for a DataRow body of `body_len` bytes (header already consumed)
    pub fn new(body_len: usize) -> Self {
        Self {
            body_len,
            consumed: 0,
            columns: 0,
            index: 0,
            state: State::NotStarted,
        }
    }

    /// Column count, once read
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Index of the column being decoded
    pub fn index(&self) -> usize {
        self.index
    }

    fn body_left(&self) -> usize {
        self.body_len - self.consumed
    }

    fn claim(&mut self, n: usize) -> Result<()> {
        if n > self.body_left() {
            return Err(Error::Protocol(format!(
                "DataRow column {} overruns the message body",
                self.index
            )));
        }
        self.consumed += n;
        Ok(())
    }

    /// Decode as much of the row as `data` allows.
    ///
    /// `data` starts where the previous call's `consumed` ended.
    pub fn advance(
        &mut self,
        data: &[u8],
        fields: &[FieldDescription],
        types: &TypeRegistry,
        handler: &mut dyn RowHandler,
    ) -> Result<RowProgress> {
        let mut pos = 0;
        loop {
            let avail = data.len() - pos;
            match self.state {
                State::NotStarted => {
                    if avail < 2 {
                        return Ok(RowProgress::Needs {
                            consumed: pos,
                            needs: 2 - avail,
                        });
                    }
                    let count = i16::from_be_bytes([data[pos], data[pos + 1]]);
                    self.columns = usize::try_from(count)
                        .map_err(|_| Error::Protocol(format!("negative column count {count}")))?;
                    self.claim(2)?;
                    pos += 2;
                    self.state = State::Incomplete;
                }
                State::Incomplete if self.index == self.columns => {
                    if self.body_left() != 0 {
                        return Err(Error::Protocol(format!(
                            "DataRow has {} trailing bytes",
                            self.body_left()
                        )));
                    }
                    handler.row_end()?;
                    return Ok(RowProgress::Done { consumed: pos });
                }
                State::Incomplete => {
                    if avail < 4 {
                        return Ok(RowProgress::Needs {
                            consumed: pos,
                            needs: 4 - avail,
                        });
                    }
                    let len = read_i32(&data[pos..]);
                    let oid = fields.get(self.index).map_or(0, |f| f.type_oid);
                    if len < -1 {
                        return Err(Error::Protocol(format!("invalid column length {len}")));
                    }
                    if len >= 0 && types.is_streaming(oid) {
                        let len = len as usize;
                        self.claim(4)?;
                        pos += 4;
                        if len > self.body_left() {
                            return Err(Error::Protocol(format!(
                                "DataRow column {} overruns the message body",
                                self.index
                            )));
                        }
                        if len == 0 {
                            // empty streamed value: one call with an empty final chunk
                            let column = self.column(fields);
                            let mut chunk = StreamChunk {
                                data: &[],
                                taken: 0,
                                remaining: 0,
                            };
                            handler.streaming(&column, &mut chunk)?;
                            self.index += 1;
                        } else {
                            self.state = State::Streaming { remaining: len };
                        }
                    } else {
                        self.state = State::Fixed {
                            len: 4 + len.max(0) as usize,
                        };
                    }
                }
                State::Fixed { len } => {
                    if len > self.body_left() {
                        return Err(Error::Protocol(format!(
                            "DataRow column {} overruns the message body",
                            self.index
                        )));
                    }
                    if avail < len {
                        return Ok(RowProgress::Needs {
                            consumed: pos,
                            needs: len - avail,
                        });
                    }
                    let column = self.column(fields);
                    let codec = types.get(column.type_oid());
                    let value = FixedValue::new(&data[pos..pos + len], column.format(), codec);
                    handler.fixed(&column, value)?;
                    self.claim(len)?;
                    pos += len;
                    self.index += 1;
                    self.state = State::Incomplete;
                }
                State::Streaming { remaining } => {
                    let n = remaining.min(avail);
                    if n == 0 {
                        return Ok(RowProgress::Needs {
                            consumed: pos,
                            needs: 1,
                        });
                    }
                    let column = self.column(fields);
                    let mut chunk = StreamChunk {
                        data: &data[pos..pos + n],
                        taken: 0,
                        remaining,
                    };
                    handler.streaming(&column, &mut chunk)?;
                    self.claim(n)?;
                    pos += n;
                    if n == remaining {
                        self.index += 1;
                        self.state = State::Incomplete;
                    } else {
                        self.state = State::Streaming {
                            remaining: remaining - n,
                        };
                    }
                }
            }
        }
    }

    fn column<'f>(&self, fields: &'f [FieldDescription]) -> Column<'f> {
        Column {
            index: self.index,
            description: fields.get(self.index),
        }
    }
}
