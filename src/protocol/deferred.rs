//! Streaming encoder with deferred length headers
//!
//! A streamed message is written piecewise: `begin_message`, any number of `put_*` and
//! nested `begin_field`/`end_field` pairs, then `end_message`. Every open header keeps a
//! running byte count; a put increments every open header at once, so nested fields
//! chain their bytes into the enclosing message.
//!
//! When the write buffer runs out of room the encoder does not grow it. Instead the open
//! in-buffer headers, and everything written after the first of them, move to a FIFO
//! queue where each length lives as an in-memory counter. Bytes written afterwards are
//! queued too. The buffer therefore never holds a header whose length is still unknown.
//!
//! [`Encoder::drain`] moves queued items back into the buffer once it has been
//! transmitted; a header item only moves once its message or field has ended.

use super::encode::{Encoder, MessageKind};
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Queued output waiting for buffer space
#[derive(Debug)]
pub(crate) enum Pending {
    /// Length header; `value` is set when the header closes
    Header { id: u64, value: Option<i32> },
    /// Literal bytes
    Data(BytesMut),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    InBuffer(usize),
    Deferred(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderKind {
    /// Message length: counts its own four bytes
    Message,
    /// Field length: excludes its own four bytes
    Field,
}

/// A length header still waiting for its final value
#[derive(Debug)]
pub(crate) struct OpenHeader {
    slot: Slot,
    count: usize,
    kind: HeaderKind,
}

impl Encoder {
    /// Start a streamed message. Messages do not nest.
    pub fn begin_message(&mut self, kind: MessageKind) -> Result<()> {
        if !self.open.is_empty() {
            return Err(Error::InvalidState {
                expected: "no streamed message in progress".into(),
                actual: format!("{} open length headers", self.open.len()),
            });
        }
        if let Some(tag) = kind.tag() {
            self.emit(&[tag]);
        }
        self.open_header(HeaderKind::Message);
        if let Some(code) = kind.code() {
            self.put_i32(code);
        }
        Ok(())
    }

    /// Start a nested length-prefixed field inside the current message
    pub fn begin_field(&mut self) -> Result<()> {
        if self.open.is_empty() {
            return Err(Error::InvalidState {
                expected: "streamed message in progress".into(),
                actual: "no open message".into(),
            });
        }
        self.account(4);
        self.open_header(HeaderKind::Field);
        Ok(())
    }

    /// Close the innermost field
    pub fn end_field(&mut self) -> Result<()> {
        self.close_header(HeaderKind::Field)
    }

    /// Close the current message
    pub fn end_message(&mut self) -> Result<()> {
        self.close_header(HeaderKind::Message)
    }

    /// Append raw bytes to the streamed message
    pub fn put_slice(&mut self, src: &[u8]) {
        self.account(src.len());
        self.emit(src);
    }

    /// Append one byte
    pub fn put_u8(&mut self, v: u8) {
        self.put_slice(&[v]);
    }

    /// Append a big-endian i16
    pub fn put_i16(&mut self, v: i16) {
        self.put_slice(&v.to_be_bytes());
    }

    /// Append a big-endian i32
    pub fn put_i32(&mut self, v: i32) {
        self.put_slice(&v.to_be_bytes());
    }

    /// Append a null-terminated string
    pub fn put_cstr(&mut self, s: &str) {
        self.put_slice(s.as_bytes());
        self.put_u8(0);
    }

    /// Move queued items into the buffer while space and finalized headers allow.
    /// Returns the number of bytes moved.
    pub fn drain(&mut self) -> usize {
        let mut moved = 0;
        while let Some(front) = self.pending.front_mut() {
            match front {
                Pending::Header { value: None, .. } => break,
                Pending::Header { value: Some(v), .. } => {
                    if self.buf.try_put_i32(*v).is_err() {
                        break;
                    }
                    moved += 4;
                    self.pending.pop_front();
                }
                Pending::Data(bytes) => {
                    let n = bytes.len().min(self.buf.remaining_mut());
                    if n == 0 && !bytes.is_empty() {
                        break;
                    }
                    // n fits by construction
                    let _ = self.buf.try_put_slice(&bytes[..n]);
                    bytes.advance(n);
                    moved += n;
                    if bytes.is_empty() {
                        self.pending.pop_front();
                    } else {
                        break;
                    }
                }
            }
        }
        moved
    }

    /// Whether every byte written so far is in the buffer and no header is open
    pub fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.open.is_empty()
    }

    /// Whether output is waiting in the queue
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Make sure the buffer holds only transmittable bytes: open in-buffer headers
    /// (and everything after them) move to the queue.
    pub fn prepare_flush(&mut self) {
        self.evict_open_headers();
    }

    fn open_header(&mut self, kind: HeaderKind) {
        let slot = if self.pending.is_empty() && self.buf.remaining_mut() >= 4 {
            let pos = self.buf.position();
            // four bytes fit: checked above
            let _ = self.buf.try_put_i32(0);
            Slot::InBuffer(pos)
        } else {
            // enclosing headers must not stay in the buffer once something is queued
            if self.pending.is_empty() {
                self.evict_open_headers();
            }
            let id = self.next_id();
            self.pending.push_back(Pending::Header { id, value: None });
            Slot::Deferred(id)
        };
        self.open.push(OpenHeader {
            slot,
            count: 0,
            kind,
        });
    }

    fn close_header(&mut self, kind: HeaderKind) -> Result<()> {
        let header = match self.open.last() {
            Some(h) if h.kind == kind => self.open.pop(),
            Some(h) => {
                return Err(Error::InvalidState {
                    expected: format!("{kind:?} header"),
                    actual: format!("{:?} header", h.kind),
                })
            }
            None => None,
        }
        .ok_or_else(|| Error::InvalidState {
            expected: format!("{kind:?} header"),
            actual: "no open header".into(),
        })?;

        let len = match kind {
            HeaderKind::Message => header.count + 4,
            HeaderKind::Field => header.count,
        };
        let value = i32::try_from(len).map_err(|_| Error::BufferLimit(len))?;

        match header.slot {
            Slot::InBuffer(pos) => self.buf.patch_i32(pos, value),
            Slot::Deferred(id) => {
                for item in self.pending.iter_mut() {
                    if let Pending::Header { id: queued, value: v } = item {
                        if *queued == id {
                            *v = Some(value);
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn account(&mut self, n: usize) {
        for header in &mut self.open {
            header.count += n;
        }
    }

    /// Physically place bytes, in buffer if possible, queued otherwise
    fn emit(&mut self, src: &[u8]) {
        let mut src = src;
        if self.pending.is_empty() {
            if self.buf.try_put_slice(src).is_ok() {
                return;
            }
            self.evict_open_headers();
            if self.pending.is_empty() {
                // nothing open: split across buffer and queue
                let n = self.buf.remaining_mut();
                let _ = self.buf.try_put_slice(&src[..n]);
                src = &src[n..];
            }
        }
        self.queue_data(src);
    }

    fn queue_data(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        if let Some(Pending::Data(last)) = self.pending.back_mut() {
            last.put_slice(src);
        } else {
            self.pending.push_back(Pending::Data(BytesMut::from(src)));
        }
    }

    fn evict_open_headers(&mut self) {
        let first = self.open.iter().find_map(|h| match h.slot {
            Slot::InBuffer(pos) => Some(pos),
            Slot::Deferred(_) => None,
        });
        let Some(first) = first else { return };

        let tail = self.buf.since(first).to_vec();
        self.buf.truncate(first);

        let mut evicted = std::collections::VecDeque::new();
        let mut cursor = 0;
        for i in 0..self.open.len() {
            let Slot::InBuffer(pos) = self.open[i].slot else {
                continue;
            };
            let at = pos - first;
            if at > cursor {
                evicted.push_back(Pending::Data(BytesMut::from(&tail[cursor..at])));
            }
            let id = self.next_id();
            evicted.push_back(Pending::Header { id, value: None });
            self.open[i].slot = Slot::Deferred(id);
            cursor = at + 4;
        }
        if cursor < tail.len() {
            evicted.push_back(Pending::Data(BytesMut::from(&tail[cursor..])));
        }

        // the queue was empty: in-buffer headers only exist while nothing is queued
        debug_assert!(self.pending.is_empty());
        evicted.append(&mut self.pending);
        self.pending = evicted;
        tracing::trace!(items = self.pending.len(), "open headers deferred");
    }

    fn next_id(&mut self) -> u64 {
        self.next_header_id += 1;
        self.next_header_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::buffer::MIN_CAPACITY;

    /// Transmit the buffer and drain until the encoder is finished
    fn transmit_all(encoder: &mut Encoder) -> Vec<u8> {
        let mut wire = Vec::new();
        loop {
            wire.extend_from_slice(encoder.readable());
            let n = encoder.readable().len();
            encoder.consume(n);
            if encoder.drain() == 0 && encoder.is_empty() {
                break;
            }
        }
        assert!(encoder.is_finished());
        wire
    }

    fn len_at(buf: &[u8], at: usize) -> usize {
        i32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as usize
    }

    #[test]
    fn test_small_message_patched_in_place() {
        let mut encoder = Encoder::with_capacity(0).unwrap();
        encoder.begin_message(MessageKind::Query).unwrap();
        encoder.put_cstr("SELECT 1;");
        encoder.end_message().unwrap();

        assert!(encoder.is_finished());
        assert_eq!(encoder.readable()[0], b'Q');
        assert_eq!(len_at(encoder.readable(), 1), 4 + 9 + 1);
    }

    #[test]
    fn test_payload_larger_than_buffer_defers_header() {
        for size in [MIN_CAPACITY - 6, MIN_CAPACITY, 3 * MIN_CAPACITY + 17] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 241) as u8).collect();
            let mut encoder = Encoder::with_capacity(0).unwrap();

            encoder.begin_message(MessageKind::CopyData).unwrap();
            encoder.put_slice(&payload);
            encoder.end_message().unwrap();

            assert_eq!(encoder.capacity(), MIN_CAPACITY, "streaming never grows");
            let wire = transmit_all(&mut encoder);
            assert_eq!(wire[0], b'd');
            assert_eq!(len_at(&wire, 1), size + 4, "size {size}");
            assert_eq!(&wire[5..], &payload[..]);
        }
    }

    #[test]
    fn test_header_deferred_when_buffer_already_full() {
        let mut encoder = Encoder::with_capacity(0).unwrap();
        encoder.put_slice(&[0xEE; MIN_CAPACITY - 2]);

        encoder.begin_message(MessageKind::CopyData).unwrap();
        assert!(encoder.has_pending());
        encoder.put_slice(b"hello");
        assert!(!encoder.is_finished());
        encoder.end_message().unwrap();

        let wire = transmit_all(&mut encoder);
        let msg = &wire[MIN_CAPACITY - 2..];
        assert_eq!(msg[0], b'd');
        assert_eq!(len_at(msg, 1), 9);
        assert_eq!(&msg[5..], b"hello");
    }

    #[test]
    fn test_drain_waits_for_open_header() {
        let mut encoder = Encoder::with_capacity(0).unwrap();
        encoder.begin_message(MessageKind::CopyData).unwrap();
        encoder.put_slice(&vec![1u8; MIN_CAPACITY * 2]);

        encoder.prepare_flush();
        let n = encoder.readable().len();
        assert_eq!(n, 1, "only the tag is transmittable");
        encoder.consume(n);
        assert_eq!(encoder.drain(), 0, "header still open");

        encoder.end_message().unwrap();
        assert!(encoder.drain() > 0);
    }

    #[test]
    fn test_nested_fields_chain_into_message_length() {
        let big = vec![7u8; MIN_CAPACITY + 100];
        let mut encoder = Encoder::with_capacity(0).unwrap();

        encoder.begin_message(MessageKind::Bind).unwrap();
        encoder.put_cstr("");
        encoder.put_cstr("stmt");
        encoder.put_i16(0);
        encoder.put_i16(2);
        encoder.begin_field().unwrap();
        encoder.put_slice(b"abc");
        encoder.end_field().unwrap();
        encoder.begin_field().unwrap();
        encoder.put_slice(&big);
        encoder.end_field().unwrap();
        encoder.put_i16(0);
        encoder.end_message().unwrap();

        let wire = transmit_all(&mut encoder);
        let direct = 1 + 5 + 2 + 2 + 2;
        let nested = (4 + 3) + (4 + big.len());
        assert_eq!(wire[0], b'B');
        assert_eq!(len_at(&wire, 1), 4 + direct + nested);
        assert_eq!(wire.len(), 1 + 4 + direct + nested);

        let first_field = 1 + 4 + 1 + 5 + 2 + 2;
        assert_eq!(len_at(&wire, first_field), 3);
        assert_eq!(&wire[first_field + 4..first_field + 7], b"abc");
        assert_eq!(len_at(&wire, first_field + 7), big.len());
    }

    #[test]
    fn test_field_header_deferred_inside_buffered_message() {
        let mut encoder = Encoder::with_capacity(0).unwrap();
        encoder.put_slice(&[0xEE; MIN_CAPACITY - 6]);

        // tag and message header fit, the field header does not
        encoder.begin_message(MessageKind::Bind).unwrap();
        encoder.begin_field().unwrap();
        encoder.put_slice(b"ab");

        encoder.prepare_flush();
        assert_eq!(encoder.readable().len(), MIN_CAPACITY - 5, "filler and tag only");
        let mut wire = encoder.readable().to_vec();
        let n = wire.len();
        encoder.consume(n);
        assert_eq!(encoder.drain(), 0, "headers still open");

        encoder.end_field().unwrap();
        encoder.end_message().unwrap();
        wire.extend(transmit_all(&mut encoder));

        let msg = &wire[MIN_CAPACITY - 6..];
        assert_eq!(msg[0], b'B');
        assert_eq!(len_at(msg, 1), 4 + 4 + 2);
        assert_eq!(len_at(msg, 5), 2);
        assert_eq!(&msg[9..], b"ab");
    }

    #[test]
    fn test_frame_after_streamed_message_keeps_order() {
        let mut encoder = Encoder::with_capacity(0).unwrap();
        encoder.begin_message(MessageKind::CopyData).unwrap();
        encoder.put_slice(&vec![3u8; MIN_CAPACITY]);
        encoder.end_message().unwrap();
        encoder
            .write_message(&crate::protocol::message::FrontendMessage::CopyDone)
            .unwrap();

        let wire = transmit_all(&mut encoder);
        assert_eq!(&wire[wire.len() - 5..], &[b'c', 0, 0, 0, 4]);
    }

    #[test]
    fn test_misnested_end_is_rejected() {
        let mut encoder = Encoder::with_capacity(0).unwrap();
        assert!(encoder.end_message().is_err());
        assert!(encoder.begin_field().is_err());
        encoder.begin_message(MessageKind::CopyData).unwrap();
        assert!(encoder.end_field().is_err());
        assert!(encoder.begin_message(MessageKind::CopyDone).is_err());
        assert!(encoder.frame(MessageKind::Sync, |_| Ok(())).is_err());
    }
}
