//! Postgres wire protocol
//!
//! Framing, message types and the buffers messages are built in and parsed from.

pub mod buffer;
pub mod constants;
pub mod decode;
mod deferred;
pub mod encode;
pub mod message;
pub mod row;
pub mod types;

pub use buffer::Buffer;
pub use decode::{decode_message, Decoded, Header};
pub use encode::{encode_message, Encoder, Frame, MessageKind};
pub use message::{
    AuthenticationMessage, BackendMessage, CommandComplete, ErrorFields, FieldDescription,
    Format, FrontendMessage, Notification, Target, TransactionStatus,
};
pub use row::{Column, FixedValue, RowCursor, RowHandler, RowProgress, StreamChunk, Utf8Sink};
pub use types::{Codec, TypeRegistry, Value};
