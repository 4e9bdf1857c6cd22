use criterion::{black_box, criterion_group, criterion_main, Criterion};

use gz_infer::codec::{decode_request, decode_response, encode_request, encode_response};
use gz_infer::protocol::{BatchRequestV1, BatchResponseV1};
use gz_infer::{BatchShape, PredictionView};

const COUNT: usize = 64;
const CHANNEL_LEN: usize = 32;
const POLICY_LEN: usize = 10;
const ROLES: usize = 2;

fn make_request() -> BatchRequestV1 {
    BatchRequestV1 {
        batch_id: 123,
        feature_schema_id: 1,
        channel_len: CHANNEL_LEN as u32,
        count: COUNT as u32,
        channels: vec![0.5f32; COUNT * CHANNEL_LEN],
    }
}

fn make_response() -> BatchResponseV1 {
    BatchResponseV1 {
        batch_id: 123,
        count: COUNT as u32,
        role_count: ROLES as u32,
        policy_lens: vec![POLICY_LEN as u32],
        policies: vec![vec![0.1f32; COUNT * POLICY_LEN]],
        final_values: vec![0.5f32; COUNT * ROLES],
    }
}

fn bench_codec(c: &mut Criterion) {
    let req = make_request();
    let resp = make_response();

    c.bench_function("gz_infer_encode_request", |b| {
        b.iter(|| black_box(encode_request(black_box(&req))))
    });

    let req_bytes = encode_request(&req);
    c.bench_function("gz_infer_decode_request", |b| {
        b.iter(|| black_box(decode_request(black_box(&req_bytes)).unwrap()))
    });

    c.bench_function("gz_infer_encode_response", |b| {
        b.iter(|| black_box(encode_response(black_box(&resp))))
    });

    let resp_bytes = encode_response(&resp);
    c.bench_function("gz_infer_decode_response", |b| {
        b.iter(|| black_box(decode_response(black_box(&resp_bytes)).unwrap()))
    });

    let shape = BatchShape {
        channel_len: CHANNEL_LEN,
        role_count: ROLES,
        policy_lens: vec![POLICY_LEN],
    };
    c.bench_function("gz_infer_view_from_response", |b| {
        b.iter(|| {
            let view = PredictionView::from_response(black_box(&shape), black_box(&resp)).unwrap();
            black_box(view.count())
        })
    });
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
