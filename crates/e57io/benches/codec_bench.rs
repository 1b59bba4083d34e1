//! Benchmarks for the compressed vector codec.
//!
//! Run with: cargo bench --package e57io
//!
//! ## Benchmark Categories
//!
//! - **Bit packing**: raw pack/unpack throughput
//! - **End-to-End**: full write and read paths through the page layer

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use e57io::codec::{BitPacker, BitUnpacker};
use e57io::{
    CompressedVectorNode, ImageFile, IntegerNode, SourceDestBuffer, StructureNode, VectorNode,
};
use std::cell::RefCell;
use std::rc::Rc;
use tempfile::TempDir;

/// Generate point identifiers spanning the full declared range.
fn generate_ids(count: usize, max: i64) -> Vec<i64> {
    (0..count)
        .map(|i| ((i as u64).wrapping_mul(2_654_435_761) % (max as u64 + 1)) as i64)
        .collect()
}

fn bench_bit_pack(c: &mut Criterion) {
    let values = generate_ids(100_000, (1 << 20) - 1);

    let mut group = c.benchmark_group("bitstream");
    group.throughput(Throughput::Elements(values.len() as u64));
    group.bench_function("pack_100k_20bit", |b| {
        b.iter(|| {
            let mut packer = BitPacker::new();
            for &v in black_box(&values) {
                packer.push_bits(v as u64, 20);
            }
            black_box(packer.take_padded_bytes())
        })
    });

    let mut packer = BitPacker::new();
    for &v in &values {
        packer.push_bits(v as u64, 20);
    }
    let bytes = packer.take_padded_bytes();
    group.bench_function("unpack_100k_20bit", |b| {
        b.iter(|| {
            let mut unpacker = BitUnpacker::from_bytes(bytes.clone());
            let mut sum = 0u64;
            for _ in 0..values.len() {
                sum = sum.wrapping_add(unpacker.take_bits(20).unwrap());
            }
            black_box(sum)
        })
    });
    group.finish();
}

fn bench_write_read_path(c: &mut Criterion) {
    const COUNT: usize = 50_000;
    let values = generate_ids(COUNT, (1 << 20) - 1);

    let mut group = c.benchmark_group("engine");
    group.throughput(Throughput::Elements(COUNT as u64));

    group.bench_function("write_50k_20bit", |b| {
        b.iter(|| {
            let dir = TempDir::new().unwrap();
            let imf = ImageFile::create(dir.path().join("bench.e57")).unwrap();
            let proto = StructureNode::new(&imf).unwrap();
            proto
                .set("id", IntegerNode::new(&imf, 0, 0, (1 << 20) - 1).unwrap())
                .unwrap();
            let cv = CompressedVectorNode::new(&imf, proto, VectorNode::new(&imf, true).unwrap())
                .unwrap();
            imf.root().unwrap().set("points", cv.clone()).unwrap();

            let mut writer = cv
                .writer(&[SourceDestBuffer::i64(
                    "id",
                    Rc::new(RefCell::new(values.clone())),
                )])
                .unwrap();
            writer.write(COUNT).unwrap();
            writer.close().unwrap();
            imf.close().unwrap();
        })
    });

    let dir = TempDir::new().unwrap();
    let imf = ImageFile::create(dir.path().join("bench_read.e57")).unwrap();
    let proto = StructureNode::new(&imf).unwrap();
    proto
        .set("id", IntegerNode::new(&imf, 0, 0, (1 << 20) - 1).unwrap())
        .unwrap();
    let cv =
        CompressedVectorNode::new(&imf, proto, VectorNode::new(&imf, true).unwrap()).unwrap();
    imf.root().unwrap().set("points", cv.clone()).unwrap();
    let mut writer = cv
        .writer(&[SourceDestBuffer::i64(
            "id",
            Rc::new(RefCell::new(values.clone())),
        )])
        .unwrap();
    writer.write(COUNT).unwrap();
    writer.close().unwrap();

    group.bench_function("read_50k_20bit", |b| {
        let dest = Rc::new(RefCell::new(vec![0i64; COUNT]));
        b.iter(|| {
            let mut reader = cv
                .reader(&[SourceDestBuffer::i64("id", Rc::clone(&dest))])
                .unwrap();
            let n = reader.read().unwrap();
            reader.close().unwrap();
            black_box(n)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_bit_pack, bench_write_read_path);
criterion_main!(benches);
