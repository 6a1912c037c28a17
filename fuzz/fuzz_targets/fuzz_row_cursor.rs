#![no_main]

use libfuzzer_sys::arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use pgpump::protocol::constants::oid;
use pgpump::protocol::{
    Column, FieldDescription, FixedValue, RowCursor, RowHandler, RowProgress, StreamChunk,
    TypeRegistry,
};

#[derive(Debug)]
struct RowInput {
    body: Vec<u8>,
    oids: Vec<bool>,
    reads: Vec<u8>,
}

impl<'a> Arbitrary<'a> for RowInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> libfuzzer_sys::arbitrary::Result<Self> {
        Ok(Self {
            body: u.arbitrary()?,
            oids: u.arbitrary()?,
            reads: u.arbitrary()?,
        })
    }
}

#[derive(Default)]
struct Collect {
    fixed: usize,
    streamed: usize,
}

impl RowHandler for Collect {
    fn fixed(&mut self, _column: &Column<'_>, value: FixedValue<'_>) -> pgpump::Result<()> {
        let _ = value.as_str();
        self.fixed += value.as_bytes().map_or(0, <[u8]>::len);
        Ok(())
    }

    fn streaming(&mut self, _column: &Column<'_>, chunk: &mut StreamChunk<'_>) -> pgpump::Result<()> {
        // take only half of each chunk; the cursor discards the rest
        let half = chunk.bytes().len() / 2;
        self.streamed += chunk.bytes()[..half].len();
        Ok(())
    }
}

fn field(type_oid: u32) -> FieldDescription {
    FieldDescription {
        name: String::new(),
        table_oid: 0,
        column_attr: 0,
        type_oid,
        type_size: -1,
        type_modifier: -1,
        format_code: 0,
    }
}

fuzz_target!(|input: RowInput| {
    let fields: Vec<_> = input
        .oids
        .iter()
        .map(|&streamed| field(if streamed { oid::BYTEA } else { oid::TEXT }))
        .collect();
    let types = TypeRegistry::new();
    let body = &input.body;

    // deliver the body in reads of arbitrary size, never beyond what the cursor asked for
    let mut cursor = RowCursor::new(body.len());
    let mut handler = Collect::default();
    let mut reads = input.reads.iter().map(|&n| n as usize + 1).chain(std::iter::repeat(64));
    let mut start = 0;
    let mut end = 0;
    loop {
        end = (end + reads.next().unwrap_or(64)).min(body.len());
        match cursor.advance(&body[start..end], &fields, &types, &mut handler) {
            Ok(RowProgress::Done { consumed }) => {
                assert!(start + consumed <= body.len());
                break;
            }
            Ok(RowProgress::Needs { consumed, needs }) => {
                assert!(needs > 0);
                start += consumed;
                if end == body.len() {
                    // truncated row: the caller would wait for bytes that never come
                    break;
                }
            }
            Err(_) => break,
        }
    }
});
