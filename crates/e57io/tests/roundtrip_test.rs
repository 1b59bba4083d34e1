//! End-to-end write/read round-trips over the packet codec.

use e57io::codec::packet::{SectionHeader, SECTION_HEADER_SIZE};
use e57io::paging::PagedFile;
use e57io::{
    CompressedVectorNode, FloatNode, FloatPrecision, ImageFile, IntegerNode, ScaledIntegerNode,
    SourceDestBuffer, StructureNode, VectorNode,
};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use tempfile::TempDir;

fn scratch(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(name);
    (dir, path)
}

/// Builds a compressed vector with a single bounded integer field and
/// attaches it under `/points`.
fn single_int_cv(imf: &ImageFile, min: i64, max: i64) -> CompressedVectorNode {
    let proto = StructureNode::new(imf).unwrap();
    proto
        .set("id", IntegerNode::new(imf, min, min, max).unwrap())
        .unwrap();
    let cv =
        CompressedVectorNode::new(imf, proto, VectorNode::new(imf, true).unwrap()).unwrap();
    imf.root().unwrap().set("points", cv.clone()).unwrap();
    cv
}

#[test]
fn test_single_integer_field_1000_records() {
    let (_dir, path) = scratch("ints.e57");
    let imf = ImageFile::create(&path).unwrap();
    let cv = single_int_cv(&imf, 0, 1023);

    let values: Vec<i64> = (0..1000).collect();
    let source = Rc::new(RefCell::new(values.clone()));
    let mut writer = cv.writer(&[SourceDestBuffer::i64("id", source)]).unwrap();
    writer.write(1000).unwrap();
    writer.close().unwrap();

    assert_eq!(cv.record_count().unwrap(), 1000);
    let section_offset = cv.data_packet_offset().unwrap().unwrap();
    // Sections start on a page payload boundary.
    assert_eq!(section_offset % 1020, 0);

    let dest = Rc::new(RefCell::new(vec![0i64; 1000]));
    let mut reader = cv
        .reader(&[SourceDestBuffer::i64("id", Rc::clone(&dest))])
        .unwrap();
    assert_eq!(reader.read().unwrap(), 1000);
    assert_eq!(*dest.borrow(), values);
    assert_eq!(reader.read().unwrap(), 0);
    reader.close().unwrap();
    imf.close().unwrap();

    // 1000 ten-bit values bit-pack into exactly 1250 payload bytes:
    // one data packet of 6 + 2 + 1250 = 1258 bytes, padded to 1260,
    // plus a 32-byte section header and one 32-byte index packet.
    let mut paged = PagedFile::open(&path, 1024).unwrap();
    let mut header_bytes = [0u8; SECTION_HEADER_SIZE];
    paged
        .read_logical(section_offset, &mut header_bytes)
        .unwrap();
    let section = SectionHeader::from_bytes(&header_bytes).unwrap();
    assert_eq!(section.data_logical_offset, section_offset + 32);
    assert_eq!(section.index_logical_offset, section_offset + 32 + 1260);
    assert_eq!(section.section_logical_length, 32 + 1260 + 32);
}

#[test]
fn test_scaled_integer_delivered_as_f64() {
    let (_dir, path) = scratch("scaled.e57");
    let imf = ImageFile::create(&path).unwrap();

    let proto = StructureNode::new(&imf).unwrap();
    proto
        .set(
            "z",
            ScaledIntegerNode::new(&imf, 0, -1000, 1000, 0.001, 0.0).unwrap(),
        )
        .unwrap();
    let cv =
        CompressedVectorNode::new(&imf, proto, VectorNode::new(&imf, true).unwrap()).unwrap();
    imf.root().unwrap().set("points", cv.clone()).unwrap();

    let raw: Vec<i64> = (-1000..=1000).collect();
    let scaled: Vec<f64> = raw.iter().map(|&r| r as f64 * 0.001).collect();

    let source = Rc::new(RefCell::new(scaled.clone()));
    let mut writer = cv
        .writer(&[SourceDestBuffer::f64("z", source).with_scaling()])
        .unwrap();
    writer.write(raw.len()).unwrap();
    writer.close().unwrap();

    let dest = Rc::new(RefCell::new(vec![0f64; raw.len()]));
    let mut reader = cv
        .reader(&[SourceDestBuffer::f64("z", Rc::clone(&dest)).with_scaling()])
        .unwrap();
    assert_eq!(reader.read().unwrap(), raw.len());
    for (got, want) in dest.borrow().iter().zip(&scaled) {
        assert!((got - want).abs() < 1e-12, "got {got}, want {want}");
    }
    reader.close().unwrap();

    // Raw values survive exactly when delivered without scaling.
    let raw_dest = Rc::new(RefCell::new(vec![0i64; raw.len()]));
    let mut reader = cv
        .reader(&[SourceDestBuffer::i64("z", Rc::clone(&raw_dest))])
        .unwrap();
    assert_eq!(reader.read().unwrap(), raw.len());
    assert_eq!(*raw_dest.borrow(), raw);
    reader.close().unwrap();
    imf.close().unwrap();
}

#[test]
fn test_two_fields_10000_records_partial_reads() {
    let (_dir, path) = scratch("pair.e57");
    let imf = ImageFile::create(&path).unwrap();

    let proto = StructureNode::new(&imf).unwrap();
    proto
        .set("id", IntegerNode::new(&imf, 0, 0, 20_000_000).unwrap())
        .unwrap();
    proto
        .set(
            "x",
            FloatNode::new(&imf, 0.0, FloatPrecision::Single, -1000.0, 1000.0).unwrap(),
        )
        .unwrap();
    let cv =
        CompressedVectorNode::new(&imf, proto, VectorNode::new(&imf, true).unwrap()).unwrap();
    imf.root().unwrap().set("points", cv.clone()).unwrap();

    // Deterministic pseudo-random data.
    let ids: Vec<i32> = (0..10_000)
        .map(|i| ((i as u64).wrapping_mul(2_654_435_761) % 20_000_000) as i32)
        .collect();
    let xs: Vec<f32> = (0..10_000)
        .map(|i| ((i % 2000) as f32) / 2.0 - 500.0)
        .collect();

    let id_src = Rc::new(RefCell::new(ids.clone()));
    let x_src = Rc::new(RefCell::new(xs.clone()));
    let mut writer = cv
        .writer(&[
            SourceDestBuffer::i32("id", id_src),
            SourceDestBuffer::f32("x", x_src),
        ])
        .unwrap();
    writer.write(10_000).unwrap();
    writer.close().unwrap();
    assert_eq!(cv.record_count().unwrap(), 10_000);

    let id_dst = Rc::new(RefCell::new(vec![0i32; 5000]));
    let x_dst = Rc::new(RefCell::new(vec![0f32; 5000]));
    let mut reader = cv
        .reader(&[
            SourceDestBuffer::i32("id", Rc::clone(&id_dst)),
            SourceDestBuffer::f32("x", Rc::clone(&x_dst)),
        ])
        .unwrap();

    assert_eq!(reader.read().unwrap(), 5000);
    assert_eq!(*id_dst.borrow(), ids[..5000]);
    assert_eq!(*x_dst.borrow(), xs[..5000]);

    assert_eq!(reader.read().unwrap(), 5000);
    assert_eq!(*id_dst.borrow(), ids[5000..]);
    assert_eq!(*x_dst.borrow(), xs[5000..]);

    assert_eq!(reader.read().unwrap(), 0);
    assert_eq!(reader.read().unwrap(), 0);
    reader.close().unwrap();
    imf.close().unwrap();
}

#[test]
fn test_seek_matches_sequential_read() {
    let (_dir, path) = scratch("seek.e57");
    let imf = ImageFile::create(&path).unwrap();
    let cv = single_int_cv(&imf, 0, 4095);

    let values: Vec<i64> = (0..4000).map(|i| (i * 7) % 4096).collect();
    let source = Rc::new(RefCell::new(values.clone()));
    let mut writer = cv.writer(&[SourceDestBuffer::i64("id", source)]).unwrap();
    writer.write(4000).unwrap();
    writer.close().unwrap();

    let dest = Rc::new(RefCell::new(vec![0i64; 100]));
    let mut reader = cv
        .reader(&[SourceDestBuffer::i64("id", Rc::clone(&dest))])
        .unwrap();

    for start in [0u64, 1, 99, 1500, 3900, 3999] {
        reader.seek(start).unwrap();
        let n = reader.read().unwrap();
        let expected: Vec<i64> = values[start as usize..]
            .iter()
            .take(100)
            .copied()
            .collect();
        assert_eq!(n, expected.len(), "seek({start})");
        assert_eq!(dest.borrow()[..n], expected[..], "seek({start})");
    }

    // Seeking one past the end is allowed and reads nothing.
    reader.seek(4000).unwrap();
    assert_eq!(reader.read().unwrap(), 0);

    let err = reader.seek(4001).unwrap_err();
    assert_eq!(err.kind(), e57io::ErrorKind::BadAPIArgument);
    reader.close().unwrap();
    imf.close().unwrap();
}

#[test]
fn test_string_field_roundtrip() {
    let (_dir, path) = scratch("labels.e57");
    let imf = ImageFile::create(&path).unwrap();

    let proto = StructureNode::new(&imf).unwrap();
    proto
        .set("id", IntegerNode::new(&imf, 0, 0, 255).unwrap())
        .unwrap();
    proto
        .set("label", e57io::StringNode::new(&imf, "").unwrap())
        .unwrap();
    let cv =
        CompressedVectorNode::new(&imf, proto, VectorNode::new(&imf, true).unwrap()).unwrap();
    imf.root().unwrap().set("points", cv.clone()).unwrap();

    let ids: Vec<i64> = (0..50).collect();
    let labels: Vec<String> = (0..50).map(|i| format!("scan-{i:03}")).collect();

    let mut writer = cv
        .writer(&[
            SourceDestBuffer::i64("id", Rc::new(RefCell::new(ids.clone()))),
            SourceDestBuffer::ustring("label", Rc::new(RefCell::new(labels.clone()))),
        ])
        .unwrap();
    writer.write(50).unwrap();
    writer.close().unwrap();

    let id_dst = Rc::new(RefCell::new(vec![0i64; 50]));
    let label_dst = Rc::new(RefCell::new(vec![String::new(); 50]));
    let mut reader = cv
        .reader(&[
            SourceDestBuffer::i64("id", Rc::clone(&id_dst)),
            SourceDestBuffer::ustring("label", Rc::clone(&label_dst)),
        ])
        .unwrap();
    assert_eq!(reader.read().unwrap(), 50);
    assert_eq!(*id_dst.borrow(), ids);
    assert_eq!(*label_dst.borrow(), labels);

    // Seek lands correctly past variable-length string records.
    reader.seek(47).unwrap();
    assert_eq!(reader.read().unwrap(), 3);
    assert_eq!(label_dst.borrow()[0], "scan-047");
    reader.close().unwrap();
    imf.close().unwrap();
}

#[test]
fn test_multi_packet_stream() {
    let (_dir, path) = scratch("big.e57");
    let imf = ImageFile::create(&path).unwrap();
    // 64-bit records force multiple packets well before 100k records.
    let cv = single_int_cv(&imf, i64::MIN, i64::MAX);

    let values: Vec<i64> = (0..20_000)
        .map(|i| (i as i64).wrapping_mul(7_046_029_254_386_353_131i64))
        .collect();
    let mut writer = cv
        .writer(&[SourceDestBuffer::i64("id", Rc::new(RefCell::new(values.clone())))])
        .unwrap();
    writer.write(20_000).unwrap();
    writer.close().unwrap();

    let dest = Rc::new(RefCell::new(vec![0i64; 20_000]));
    let mut reader = cv
        .reader(&[SourceDestBuffer::i64("id", Rc::clone(&dest))])
        .unwrap();
    assert_eq!(reader.read().unwrap(), 20_000);
    assert_eq!(*dest.borrow(), values);
    reader.close().unwrap();
    imf.close().unwrap();
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_bounded_integers_roundtrip(
            values in proptest::collection::vec(-5000i64..=5000, 1..400),
            chunk in 1usize..64,
        ) {
            let (_dir, path) = scratch("prop.e57");
            let imf = ImageFile::create(&path).unwrap();
            let cv = single_int_cv(&imf, -5000, 5000);

            let mut writer = cv
                .writer(&[SourceDestBuffer::i64(
                    "id",
                    Rc::new(RefCell::new(values.clone())),
                )])
                .unwrap();
            writer.write(values.len()).unwrap();
            writer.close().unwrap();

            let dest = Rc::new(RefCell::new(vec![0i64; chunk]));
            let mut reader = cv
                .reader(&[SourceDestBuffer::i64("id", Rc::clone(&dest))])
                .unwrap();
            let mut collected = Vec::new();
            loop {
                let n = reader.read().unwrap();
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&dest.borrow()[..n]);
            }
            prop_assert_eq!(collected, values);
            reader.close().unwrap();
            imf.close().unwrap();
        }
    }
}
