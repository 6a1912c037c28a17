//! Protocol message encoding
//!
//! [`Encoder`] owns the connection's write buffer. Messages are framed in place: the
//! 4-byte length is reserved when the message begins and patched when it ends. If the
//! body overflows the buffer, the partial message is discarded, the buffer climbs one
//! ladder rung and the body is rebuilt; callers never see the overflow.
//!
//! The streaming half of the encoder (deferred headers for bodies larger than one
//! buffer pass) lives in [`super::deferred`].

use super::buffer::{Buffer, Overflow};
use super::constants::{frontend_tags, CANCEL_REQUEST_CODE, PROTOCOL_VERSION, SSL_REQUEST_CODE};
use super::deferred::{OpenHeader, Pending};
use super::message::{Format, FrontendMessage};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Frontend message kind: decides the fixed header bytes written by `begin`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Bind
    Bind,
    /// CancelRequest (no tag, fixed code)
    CancelRequest,
    /// Close
    Close,
    /// CopyData
    CopyData,
    /// CopyDone
    CopyDone,
    /// CopyFail
    CopyFail,
    /// Describe
    Describe,
    /// Execute
    Execute,
    /// Flush
    Flush,
    /// FunctionCall
    FunctionCall,
    /// Parse
    Parse,
    /// Password / SASL responses
    Password,
    /// Query
    Query,
    /// SSLRequest (no tag, fixed code)
    SslRequest,
    /// StartupMessage (no tag, protocol version)
    Startup(i32),
    /// Sync
    Sync,
    /// Terminate
    Terminate,
}

impl MessageKind {
    /// Leading tag byte, if the kind has one
    pub fn tag(self) -> Option<u8> {
        match self {
            Self::Bind => Some(frontend_tags::BIND),
            Self::Close => Some(frontend_tags::CLOSE),
            Self::CopyData => Some(frontend_tags::COPY_DATA),
            Self::CopyDone => Some(frontend_tags::COPY_DONE),
            Self::CopyFail => Some(frontend_tags::COPY_FAIL),
            Self::Describe => Some(frontend_tags::DESCRIBE),
            Self::Execute => Some(frontend_tags::EXECUTE),
            Self::Flush => Some(frontend_tags::FLUSH),
            Self::FunctionCall => Some(frontend_tags::FUNCTION_CALL),
            Self::Parse => Some(frontend_tags::PARSE),
            Self::Password => Some(frontend_tags::PASSWORD),
            Self::Query => Some(frontend_tags::QUERY),
            Self::Sync => Some(frontend_tags::SYNC),
            Self::Terminate => Some(frontend_tags::TERMINATE),
            Self::CancelRequest | Self::SslRequest | Self::Startup(_) => None,
        }
    }

    /// Fixed word written right after the length, if any
    pub fn code(self) -> Option<i32> {
        match self {
            Self::CancelRequest => Some(CANCEL_REQUEST_CODE),
            Self::SslRequest => Some(SSL_REQUEST_CODE),
            Self::Startup(version) => Some(version),
            _ => None,
        }
    }
}

/// In-buffer view used while building one message body
pub struct Frame<'a> {
    buf: &'a mut Buffer,
}

type Step = std::result::Result<(), Overflow>;

impl Frame<'_> {
    /// Append one byte
    pub fn put_u8(&mut self, v: u8) -> Step {
        self.buf.try_put_u8(v)
    }

    /// Append a big-endian i16
    pub fn put_i16(&mut self, v: i16) -> Step {
        self.buf.try_put_i16(v)
    }

    /// Append a big-endian i32
    pub fn put_i32(&mut self, v: i32) -> Step {
        self.buf.try_put_i32(v)
    }

    /// Append a big-endian u32
    pub fn put_u32(&mut self, v: u32) -> Step {
        self.buf.try_put_slice(&v.to_be_bytes())
    }

    /// Append raw bytes
    pub fn put_slice(&mut self, src: &[u8]) -> Step {
        self.buf.try_put_slice(src)
    }

    /// Append a null-terminated string
    pub fn put_cstr(&mut self, s: &str) -> Step {
        self.buf.try_put_slice(s.as_bytes())?;
        self.buf.try_put_u8(0)
    }

    /// Append a count as i16
    pub fn put_count(&mut self, n: usize) -> Step {
        self.put_i16(i16::try_from(n).map_err(|_| Overflow)?)
    }

    /// Append format codes preceded by their count
    pub fn put_formats(&mut self, formats: &[Format]) -> Step {
        self.put_count(formats.len())?;
        for format in formats {
            self.put_i16(format.code())?;
        }
        Ok(())
    }

    /// Append a nested length-prefixed field. The field length excludes its own header.
    pub fn field(&mut self, body: impl FnOnce(&mut Self) -> Step) -> Step {
        let pos = self.buf.position();
        self.buf.try_put_i32(0)?;
        body(self)?;
        let len = self.buf.position() - pos - 4;
        self.buf
            .patch_i32(pos, i32::try_from(len).map_err(|_| Overflow)?);
        Ok(())
    }

    /// Append a nullable value: -1 for NULL, otherwise a length-prefixed field
    pub fn put_nullable(&mut self, value: Option<&[u8]>) -> Step {
        match value {
            None => self.put_i32(-1),
            Some(bytes) => self.field(|f| f.put_slice(bytes)),
        }
    }
}

fn try_frame<F>(buf: &mut Buffer, kind: MessageKind, body: &mut F) -> Step
where
    F: FnMut(&mut Frame<'_>) -> Step,
{
    if let Some(tag) = kind.tag() {
        buf.try_put_u8(tag)?;
    }
    let len_pos = buf.position();
    buf.try_put_i32(0)?;
    if let Some(code) = kind.code() {
        buf.try_put_i32(code)?;
    }
    body(&mut Frame { buf: &mut *buf })?;
    let len = buf.position() - len_pos;
    buf.patch_i32(len_pos, i32::try_from(len).map_err(|_| Overflow)?);
    Ok(())
}

/// Frame a message into `buf`, climbing the ladder until it fits.
fn frame_into<F>(buf: &mut Buffer, kind: MessageKind, mut body: F) -> Result<()>
where
    F: FnMut(&mut Frame<'_>) -> Step,
{
    loop {
        let start = buf.position();
        match try_frame(buf, kind, &mut body) {
            Ok(()) => return Ok(()),
            Err(Overflow) => {
                buf.truncate(start);
                buf.grow()?;
            }
        }
    }
}

/// Outbound message encoder owning the write buffer
#[derive(Debug)]
pub struct Encoder {
    pub(super) buf: Buffer,
    pub(super) pending: VecDeque<Pending>,
    pub(super) open: Vec<OpenHeader>,
    pub(super) next_header_id: u64,
}

impl Encoder {
    /// Create an encoder on the smallest rung holding `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Ok(Self {
            buf: Buffer::with_capacity(capacity, crate::metrics::labels::BUFFER_WRITE)?,
            pending: VecDeque::new(),
            open: Vec::new(),
            next_header_id: 0,
        })
    }

    /// Frame one message with an in-place length prefix.
    ///
    /// `body` may run more than once: it is replayed after each buffer grow.
    pub fn frame<F>(&mut self, kind: MessageKind, body: F) -> Result<()>
    where
        F: FnMut(&mut Frame<'_>) -> Step,
    {
        if !self.open.is_empty() {
            return Err(Error::InvalidState {
                expected: "no streamed message in progress".into(),
                actual: format!("{} open length headers", self.open.len()),
            });
        }
        if self.pending.is_empty() {
            return frame_into(&mut self.buf, kind, body);
        }
        // bytes are already queued behind the buffer; keep wire order by queueing too
        let mut scratch = Buffer::with_capacity(0, crate::metrics::labels::BUFFER_WRITE)?;
        frame_into(&mut scratch, kind, body)?;
        self.pending
            .push_back(Pending::Data(BytesMut::from(scratch.readable())));
        Ok(())
    }

    /// Encode a frontend message
    pub fn write_message(&mut self, msg: &FrontendMessage) -> Result<()> {
        match msg {
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => self.frame(MessageKind::Bind, |f| {
                f.put_cstr(portal)?;
                f.put_cstr(statement)?;
                f.put_formats(param_formats)?;
                f.put_count(params.len())?;
                for param in params {
                    f.put_nullable(param.as_deref())?;
                }
                f.put_formats(result_formats)
            }),
            FrontendMessage::CancelRequest {
                process_id,
                secret_key,
            } => self.frame(MessageKind::CancelRequest, |f| {
                f.put_i32(*process_id)?;
                f.put_i32(*secret_key)
            }),
            FrontendMessage::Close(target) => self.frame(MessageKind::Close, |f| {
                f.put_u8(target.kind())?;
                f.put_cstr(target.name())
            }),
            FrontendMessage::CopyData(data) => {
                self.frame(MessageKind::CopyData, |f| f.put_slice(data))
            }
            FrontendMessage::CopyDone => self.frame(MessageKind::CopyDone, |_| Ok(())),
            FrontendMessage::CopyFail(reason) => {
                self.frame(MessageKind::CopyFail, |f| f.put_cstr(reason))
            }
            FrontendMessage::Describe(target) => self.frame(MessageKind::Describe, |f| {
                f.put_u8(target.kind())?;
                f.put_cstr(target.name())
            }),
            FrontendMessage::Execute { portal, max_rows } => {
                self.frame(MessageKind::Execute, |f| {
                    f.put_cstr(portal)?;
                    f.put_i32(*max_rows)
                })
            }
            FrontendMessage::Flush => self.frame(MessageKind::Flush, |_| Ok(())),
            FrontendMessage::FunctionCall {
                function,
                arg_formats,
                args,
                result_format,
            } => self.frame(MessageKind::FunctionCall, |f| {
                f.put_u32(*function)?;
                f.put_formats(arg_formats)?;
                f.put_count(args.len())?;
                for arg in args {
                    f.put_nullable(arg.as_deref())?;
                }
                f.put_i16(result_format.code())
            }),
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => self.frame(MessageKind::Parse, |f| {
                f.put_cstr(name)?;
                f.put_cstr(query)?;
                f.put_count(param_types.len())?;
                for oid in param_types {
                    f.put_u32(*oid)?;
                }
                Ok(())
            }),
            FrontendMessage::Password(password) => {
                self.frame(MessageKind::Password, |f| f.put_cstr(password))
            }
            FrontendMessage::SaslInitialResponse { mechanism, data } => {
                self.frame(MessageKind::Password, |f| {
                    f.put_cstr(mechanism)?;
                    f.field(|f| f.put_slice(data))
                })
            }
            FrontendMessage::SaslResponse { data } => {
                self.frame(MessageKind::Password, |f| f.put_slice(data))
            }
            FrontendMessage::Query(query) => self.frame(MessageKind::Query, |f| f.put_cstr(query)),
            FrontendMessage::SslRequest => self.frame(MessageKind::SslRequest, |_| Ok(())),
            FrontendMessage::Startup { version, params } => {
                self.frame(MessageKind::Startup(*version), |f| {
                    for (key, value) in params {
                        f.put_cstr(key)?;
                        f.put_cstr(value)?;
                    }
                    f.put_u8(0)
                })
            }
            FrontendMessage::Sync => self.frame(MessageKind::Sync, |_| Ok(())),
            FrontendMessage::Terminate => self.frame(MessageKind::Terminate, |_| Ok(())),
        }
    }

    /// Bytes ready for transmission
    pub fn readable(&self) -> &[u8] {
        self.buf.readable()
    }

    /// Drop `n` transmitted bytes
    pub fn consume(&mut self, n: usize) {
        self.buf.consume(n);
    }

    /// Whether the buffer holds nothing to transmit
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current buffer capacity
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Drop buffered bytes, queued items and open headers
    pub fn clear(&mut self) {
        self.buf.clear();
        self.pending.clear();
        self.open.clear();
    }
}

/// Encode a single frontend message into a standalone byte string
pub fn encode_message(msg: &FrontendMessage) -> Result<Bytes> {
    let mut encoder = Encoder::with_capacity(0)?;
    encoder.write_message(msg)?;
    Ok(Bytes::copy_from_slice(encoder.readable()))
}

/// Startup message for the default protocol version
pub fn startup(params: Vec<(String, String)>) -> FrontendMessage {
    FrontendMessage::Startup {
        version: PROTOCOL_VERSION,
        params,
    }
}
