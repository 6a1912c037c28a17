//! Codec micro-benchmarks
//!
//! No server needed: everything runs against in-memory buffers.
//! - framing simple and extended-protocol messages
//! - streaming a payload larger than the write buffer through deferred headers
//! - decoding a batch of backend messages
//! - walking DataRows with fixed and streamed columns
//!
//! Run with: cargo bench --bench codec_benchmarks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pgpump::protocol::constants::oid;
use pgpump::protocol::{
    decode_message, Column, Decoded, Encoder, FieldDescription, FixedValue, FrontendMessage,
    MessageKind, RowCursor, RowHandler, RowProgress, StreamChunk, TypeRegistry,
};

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn data_row(values: &[&[u8]]) -> Vec<u8> {
    let mut body = (values.len() as i16).to_be_bytes().to_vec();
    for value in values {
        body.extend_from_slice(&(value.len() as i32).to_be_bytes());
        body.extend_from_slice(value);
    }
    body
}

fn field(name: &str, type_oid: u32) -> FieldDescription {
    FieldDescription {
        name: name.to_string(),
        table_oid: 0,
        column_attr: 0,
        type_oid,
        type_size: -1,
        type_modifier: -1,
        format_code: 0,
    }
}

struct Sink {
    bytes: usize,
}

impl RowHandler for Sink {
    fn fixed(&mut self, _column: &Column<'_>, value: FixedValue<'_>) -> pgpump::Result<()> {
        self.bytes += value.as_bytes().map_or(0, <[u8]>::len);
        Ok(())
    }

    fn streaming(&mut self, _column: &Column<'_>, chunk: &mut StreamChunk<'_>) -> pgpump::Result<()> {
        self.bytes += chunk.stream(&mut std::io::sink())?;
        Ok(())
    }
}

fn encode_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    let query = FrontendMessage::Query("SELECT id, name, payload FROM items WHERE id > 100".into());
    group.bench_function("query", |b| {
        let mut encoder = Encoder::with_capacity(8192).unwrap();
        b.iter(|| {
            encoder.write_message(black_box(&query)).unwrap();
            encoder.clear();
        })
    });

    let bind = FrontendMessage::Bind {
        portal: String::new(),
        statement: "pgpump_s1".into(),
        param_formats: Vec::new(),
        params: (0..16)
            .map(|i| Some(Bytes::from(format!("value-{i}"))))
            .collect(),
        result_formats: Vec::new(),
    };
    group.bench_function("bind_16_params", |b| {
        let mut encoder = Encoder::with_capacity(8192).unwrap();
        b.iter(|| {
            encoder.write_message(black_box(&bind)).unwrap();
            encoder.clear();
        })
    });

    for size in [64 * 1024, 1024 * 1024] {
        let payload = vec![0x42u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("deferred_copy_data", size),
            &payload,
            |b, payload| {
                let mut encoder = Encoder::with_capacity(8192).unwrap();
                b.iter(|| {
                    encoder.begin_message(MessageKind::CopyData).unwrap();
                    for chunk in payload.chunks(4096) {
                        encoder.put_slice(chunk);
                    }
                    encoder.end_message().unwrap();
                    // play the transport: drain until every byte has gone out
                    encoder.prepare_flush();
                    loop {
                        while !encoder.is_empty() {
                            let n = encoder.readable().len();
                            black_box(encoder.readable());
                            encoder.consume(n);
                        }
                        if encoder.drain() == 0 {
                            break;
                        }
                    }
                })
            },
        );
    }

    group.finish();
}

fn decode_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    let mut stream = Vec::new();
    stream.extend(frame(b'T', &{
        let mut body = 2i16.to_be_bytes().to_vec();
        for name in ["id", "name"] {
            body.extend_from_slice(name.as_bytes());
            body.push(0);
            body.extend_from_slice(&[0; 6]);
            body.extend_from_slice(&oid::TEXT.to_be_bytes());
            body.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0, 0]);
        }
        body
    }));
    for i in 0..1000 {
        let id = i.to_string();
        stream.extend(frame(b'D', &data_row(&[id.as_bytes(), b"widget"])));
    }
    stream.extend(frame(b'C', b"SELECT 1000\0"));
    stream.extend(frame(b'Z', b"I"));

    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("select_1000_rows", |b| {
        b.iter(|| {
            let mut pos = 0;
            let mut messages = 0;
            while pos < stream.len() {
                match decode_message(black_box(&stream[pos..])).unwrap() {
                    Decoded::Message(_, len) => {
                        pos += len;
                        messages += 1;
                    }
                    Decoded::Needs(_) => break,
                }
            }
            messages
        })
    });

    group.finish();
}

fn row_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_cursor");
    let types = TypeRegistry::new();
    let blob = vec![0xABu8; 256 * 1024];

    let cases = [
        ("fixed_text", field("payload", oid::TEXT)),
        ("streamed_bytea", field("payload", oid::BYTEA)),
    ];
    let body = data_row(&[b"42", &blob]);
    for (name, payload) in cases {
        let fields = vec![field("id", oid::INT4), payload];
        group.throughput(Throughput::Bytes(body.len() as u64));

        group.bench_function(BenchmarkId::new(name, "whole"), |b| {
            b.iter(|| {
                let mut sink = Sink { bytes: 0 };
                let mut cursor = RowCursor::new(body.len());
                let progress = cursor
                    .advance(black_box(&body), &fields, &types, &mut sink)
                    .unwrap();
                assert!(matches!(progress, RowProgress::Done { .. }));
                sink.bytes
            })
        });

        // 8K reads, as the driver delivers them from a default-sized buffer
        group.bench_function(BenchmarkId::new(name, "8k_reads"), |b| {
            b.iter(|| {
                let mut sink = Sink { bytes: 0 };
                let mut cursor = RowCursor::new(body.len());
                let mut start = 0;
                let mut end = 8192.min(body.len());
                loop {
                    match cursor.advance(&body[start..end], &fields, &types, &mut sink) {
                        Ok(RowProgress::Done { .. }) => break,
                        Ok(RowProgress::Needs { consumed, needs }) => {
                            start += consumed;
                            end = (end + needs.max(8192)).min(body.len());
                        }
                        Err(e) => panic!("row decode failed: {e}"),
                    }
                }
                sink.bytes
            })
        });
    }

    group.finish();
}

criterion_group!(benches, encode_benchmarks, decode_benchmarks, row_benchmarks);
criterion_main!(benches);
