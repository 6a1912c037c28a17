//! Protocol message decoding
//!
//! The framer never consumes a partial message: it either reports how many more bytes
//! it needs or returns a fully constructed [`BackendMessage`] and the number of bytes it
//! spans (tag + length + body).

use super::constants::{auth, tags, HEADER_LEN};
use super::message::{
    AuthenticationMessage, BackendMessage, CommandComplete, CopyResponse, ErrorFields,
    FieldDescription, Format, Notification, TransactionStatus,
};
use crate::{Error, Result};
use bytes::Bytes;

/// Maximum message length (1 GB), matching PostgreSQL's own `PQ_LARGE_MESSAGE_LIMIT`.
///
/// Any message whose length field exceeds this value is rejected before allocation
/// to prevent denial-of-service via crafted length headers.
pub const MAX_MESSAGE_LENGTH: usize = 1_073_741_824;

/// Message header: tag byte and declared length (which counts itself, not the tag)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Tag byte
    pub tag: u8,
    /// Declared length
    pub len: usize,
}

impl Header {
    /// Body size
    pub fn body_len(&self) -> usize {
        self.len - 4
    }

    /// Whole message size on the wire
    pub fn frame_len(&self) -> usize {
        self.len + 1
    }
}

/// Outcome of one framing attempt
#[derive(Debug)]
pub enum Decoded {
    /// A complete message and the bytes it spans
    Message(BackendMessage, usize),
    /// At least this many more bytes are required
    Needs(usize),
}

/// Read the header, or report the header shortfall
pub fn decode_header(data: &[u8]) -> Result<std::result::Result<Header, usize>> {
    if data.len() < HEADER_LEN {
        return Ok(Err(HEADER_LEN - data.len()));
    }
    let tag = data[0];
    let len = i32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    if len < 4 {
        return Err(Error::Protocol(format!(
            "message '{}' declares length {len}",
            tag as char
        )));
    }
    let len = len as usize;
    if len > MAX_MESSAGE_LENGTH {
        return Err(Error::Protocol(format!(
            "message length {} exceeds maximum allowed {}",
            len, MAX_MESSAGE_LENGTH
        )));
    }
    Ok(Ok(Header { tag, len }))
}

/// Frame and decode one backend message from the front of `data`
pub fn decode_message(data: &[u8]) -> Result<Decoded> {
    let header = match decode_header(data)? {
        Ok(header) => header,
        Err(needs) => return Ok(Decoded::Needs(needs)),
    };
    if data.len() < header.frame_len() {
        return Ok(Decoded::Needs(header.frame_len() - data.len()));
    }
    let body = &data[HEADER_LEN..header.frame_len()];
    let msg = decode_body(header.tag, body)?;
    Ok(Decoded::Message(msg, header.frame_len()))
}

/// Construct a message from its tag and complete body
pub fn decode_body(tag: u8, body: &[u8]) -> Result<BackendMessage> {
    let mut r = Body::new(body);
    let msg = match tag {
        tags::AUTHENTICATION => decode_authentication(&mut r)?,
        tags::BACKEND_KEY_DATA => BackendMessage::BackendKeyData {
            process_id: r.i32()?,
            secret_key: r.i32()?,
        },
        tags::BIND_COMPLETE => BackendMessage::BindComplete,
        tags::CLOSE_COMPLETE => BackendMessage::CloseComplete,
        tags::COMMAND_COMPLETE => {
            BackendMessage::CommandComplete(CommandComplete::parse(&r.cstr()?))
        }
        tags::COPY_DATA => BackendMessage::CopyData(Bytes::copy_from_slice(r.rest())),
        tags::COPY_DONE => BackendMessage::CopyDone,
        tags::COPY_IN_RESPONSE => BackendMessage::CopyInResponse(decode_copy_response(&mut r)?),
        tags::COPY_OUT_RESPONSE => BackendMessage::CopyOutResponse(decode_copy_response(&mut r)?),
        tags::COPY_BOTH_RESPONSE => {
            BackendMessage::CopyBothResponse(decode_copy_response(&mut r)?)
        }
        tags::DATA_ROW => decode_data_row(&mut r)?,
        tags::EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
        tags::ERROR_RESPONSE => BackendMessage::ErrorResponse(decode_error_fields(&mut r)?),
        tags::FUNCTION_CALL_RESPONSE => BackendMessage::FunctionCallResponse(r.nullable()?),
        tags::NO_DATA => BackendMessage::NoData,
        tags::NOTICE_RESPONSE => BackendMessage::NoticeResponse(decode_error_fields(&mut r)?),
        tags::NOTIFICATION_RESPONSE => BackendMessage::NotificationResponse(Notification {
            process_id: r.i32()?,
            channel: r.cstr()?,
            payload: r.cstr()?,
        }),
        tags::PARAMETER_DESCRIPTION => {
            let count = r.count()?;
            let oids = (0..count)
                .map(|_| r.i32().map(|v| v as u32))
                .collect::<Result<Vec<_>>>()?;
            BackendMessage::ParameterDescription(oids)
        }
        tags::PARAMETER_STATUS => BackendMessage::ParameterStatus {
            name: r.cstr()?,
            value: r.cstr()?,
        },
        tags::PARSE_COMPLETE => BackendMessage::ParseComplete,
        tags::PORTAL_SUSPENDED => BackendMessage::PortalSuspended,
        tags::READY_FOR_QUERY => {
            let status = r.u8()?;
            let status = TransactionStatus::from_byte(status).ok_or_else(|| {
                Error::Protocol(format!("unknown transaction status '{}'", status as char))
            })?;
            BackendMessage::ReadyForQuery(status)
        }
        tags::ROW_DESCRIPTION => decode_row_description(&mut r)?,
        _ => {
            return Err(Error::UnexpectedMessage(format!(
                "unknown message tag: {}",
                tag
            )))
        }
    };
    Ok(msg)
}

/// Bounds-checked reader over one message body
struct Body<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Body<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.data.len() - self.offset < n {
            return Err(Error::Protocol(format!("truncated {what}")));
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    fn i16(&mut self) -> Result<i16> {
        let b = self.take(2, "int16")?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4, "int32")?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn count(&mut self) -> Result<usize> {
        let n = self.i16()?;
        usize::try_from(n).map_err(|_| Error::Protocol(format!("negative count {n}")))
    }

    fn cstr(&mut self) -> Result<String> {
        let rest = &self.data[self.offset..];
        let end = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            Error::Protocol("missing null terminator in string".into())
        })?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.offset += end + 1;
        Ok(s)
    }

    fn nullable(&mut self) -> Result<Option<Bytes>> {
        let len = self.i32()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(
            self.take(len as usize, "field data")?,
        )))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.offset..];
        self.offset = self.data.len();
        rest
    }

    fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }
}

fn decode_authentication(r: &mut Body<'_>) -> Result<BackendMessage> {
    let auth_type = r.i32()?;

    let auth_msg = match auth_type {
        auth::OK => AuthenticationMessage::Ok,
        auth::CLEARTEXT_PASSWORD => AuthenticationMessage::CleartextPassword,
        auth::MD5_PASSWORD => {
            let mut salt = [0u8; 4];
            salt.copy_from_slice(r.take(4, "salt data")?);
            AuthenticationMessage::Md5Password { salt }
        }
        auth::SASL => {
            // null-terminated mechanism names, ended by an empty one
            let mut mechanisms = Vec::new();
            while !r.is_empty() {
                let mechanism = r.cstr()?;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            AuthenticationMessage::Sasl { mechanisms }
        }
        auth::SASL_CONTINUE => AuthenticationMessage::SaslContinue {
            data: r.rest().to_vec(),
        },
        auth::SASL_FINAL => AuthenticationMessage::SaslFinal {
            data: r.rest().to_vec(),
        },
        _ => {
            return Err(Error::Authentication(format!(
                "unsupported auth type: {}",
                auth_type
            )))
        }
    };

    Ok(BackendMessage::Authentication(auth_msg))
}

fn decode_copy_response(r: &mut Body<'_>) -> Result<CopyResponse> {
    let format = Format::from_code(i16::from(r.u8()?));
    let count = r.count()?;
    let column_formats = (0..count)
        .map(|_| r.i16().map(Format::from_code))
        .collect::<Result<Vec<_>>>()?;
    Ok(CopyResponse {
        format,
        column_formats,
    })
}

fn decode_data_row(r: &mut Body<'_>) -> Result<BackendMessage> {
    let field_count = r.count()?;
    let mut fields = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        fields.push(r.nullable()?);
    }
    Ok(BackendMessage::DataRow(fields))
}

fn decode_error_fields(r: &mut Body<'_>) -> Result<ErrorFields> {
    let mut fields = ErrorFields::default();

    while !r.is_empty() {
        let field_type = r.u8()?;
        if field_type == 0 {
            break;
        }
        let value = r.cstr()?;

        match field_type {
            b'S' => fields.severity = Some(value),
            b'C' => fields.code = Some(value),
            b'M' => fields.message = Some(value),
            b'D' => fields.detail = Some(value),
            b'H' => fields.hint = Some(value),
            b'P' => fields.position = Some(value),
            b'W' => fields.context = Some(value),
            b's' => fields.schema = Some(value),
            b't' => fields.table = Some(value),
            b'c' => fields.column = Some(value),
            b'n' => fields.constraint = Some(value),
            _ => {} // Ignore unknown fields
        }
    }

    Ok(fields)
}

fn decode_row_description(r: &mut Body<'_>) -> Result<BackendMessage> {
    let field_count = r.count()?;
    let mut fields = Vec::with_capacity(field_count);

    for _ in 0..field_count {
        fields.push(FieldDescription {
            name: r.cstr()?,
            table_oid: r.i32()?,
            column_attr: r.i16()?,
            type_oid: r.i32()? as u32,
            type_size: r.i16()?,
            type_modifier: r.i32()?,
            format_code: r.i16()?,
        });
    }

    Ok(BackendMessage::RowDescription(fields))
}
