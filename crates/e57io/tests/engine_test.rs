//! State machine, sickness, and binding-contract tests for the transfer
//! engines.

use e57io::{
    CompressedVectorNode, ErrorKind, FloatNode, FloatPrecision, ImageFile, IntegerNode,
    SourceDestBuffer, StructureNode, VectorNode,
};
use std::cell::RefCell;
use std::rc::Rc;
use tempfile::TempDir;

fn int_cv(imf: &ImageFile, name: &str, min: i64, max: i64) -> CompressedVectorNode {
    let proto = StructureNode::new(imf).unwrap();
    proto
        .set("id", IntegerNode::new(imf, min, min, max).unwrap())
        .unwrap();
    let cv =
        CompressedVectorNode::new(imf, proto, VectorNode::new(imf, true).unwrap()).unwrap();
    imf.root().unwrap().set(name, cv.clone()).unwrap();
    cv
}

fn i64_buf(path: &str, values: Vec<i64>) -> (SourceDestBuffer, Rc<RefCell<Vec<i64>>>) {
    let array = Rc::new(RefCell::new(values));
    (SourceDestBuffer::i64(path, Rc::clone(&array)), array)
}

#[test]
fn test_at_most_one_writer() {
    let dir = TempDir::new().unwrap();
    let imf = ImageFile::create(dir.path().join("writers.e57")).unwrap();
    let cv = int_cv(&imf, "points", 0, 100);
    let other = int_cv(&imf, "more_points", 0, 100);

    let (buf_a, _a) = i64_buf("id", vec![0; 8]);
    let (buf_b, _b) = i64_buf("id", vec![0; 8]);

    let mut first = cv.writer(&[buf_a]).unwrap();
    assert_eq!(imf.writer_count().unwrap(), 1);

    let err = other.writer(&[buf_b.clone()]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TooManyWriters);

    // A reader cannot coexist with the writer either.
    let err = cv.reader(&[buf_b.clone()]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TooManyReaders);

    first.write(8).unwrap();
    first.close().unwrap();
    assert_eq!(imf.writer_count().unwrap(), 0);

    // Closing the first writer frees the slot.
    let mut second = other.writer(&[buf_b]).unwrap();
    second.write(8).unwrap();
    second.close().unwrap();
    imf.close().unwrap();
}

#[test]
fn test_writer_blocked_by_open_readers() {
    let dir = TempDir::new().unwrap();
    let imf = ImageFile::create(dir.path().join("readers.e57")).unwrap();
    let cv = int_cv(&imf, "points", 0, 100);

    let (buf, _a) = i64_buf("id", vec![1, 2, 3]);
    let mut writer = cv.writer(&[buf]).unwrap();
    writer.write(3).unwrap();
    writer.close().unwrap();

    let (rbuf1, _b) = i64_buf("id", vec![0; 3]);
    let (rbuf2, _c) = i64_buf("id", vec![0; 3]);
    let mut r1 = cv.reader(&[rbuf1]).unwrap();
    let mut r2 = cv.reader(&[rbuf2.clone()]).unwrap();
    assert_eq!(imf.reader_count().unwrap(), 2);

    let (wbuf, _d) = i64_buf("id", vec![0; 3]);
    let err = cv.writer(&[wbuf]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TooManyWriters);

    r1.close().unwrap();
    r2.close().unwrap();
    assert_eq!(imf.reader_count().unwrap(), 0);
    imf.close().unwrap();
}

#[test]
fn test_close_is_idempotent_and_terminal() {
    let dir = TempDir::new().unwrap();
    let imf = ImageFile::create(dir.path().join("close.e57")).unwrap();
    let cv = int_cv(&imf, "points", 0, 100);

    let (buf, _a) = i64_buf("id", vec![5; 4]);
    let mut writer = cv.writer(&[buf.clone()]).unwrap();
    writer.write(4).unwrap();
    assert!(writer.is_open());
    writer.close().unwrap();
    writer.close().unwrap();
    assert!(!writer.is_open());

    let err = writer.write(1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriterNotOpen);

    let mut reader = cv.reader(&[buf]).unwrap();
    assert!(reader.is_open());
    reader.close().unwrap();
    reader.close().unwrap();
    assert!(!reader.is_open());

    let err = reader.read().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReaderNotOpen);
    let err = reader.seek(0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReaderNotOpen);

    // The node handle stays reachable from a closed reader.
    assert_eq!(reader.compressed_vector_node().record_count().unwrap(), 4);
    imf.close().unwrap();
}

#[test]
fn test_out_of_bounds_write_leaves_writer_usable() {
    let dir = TempDir::new().unwrap();
    let imf = ImageFile::create(dir.path().join("oob.e57")).unwrap();
    let cv = int_cv(&imf, "points", 0, 10);

    let (buf, array) = i64_buf("id", vec![11]);
    let mut writer = cv.writer(&[buf]).unwrap();

    let err = writer.write(1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueOutOfBounds);
    assert!(writer.is_open());

    // A subsequent in-bounds write succeeds and is the only record kept.
    array.borrow_mut()[0] = 5;
    writer.write(1).unwrap();
    writer.close().unwrap();
    assert_eq!(cv.record_count().unwrap(), 1);

    let (dest, dest_array) = i64_buf("id", vec![0; 4]);
    let mut reader = cv.reader(&[dest]).unwrap();
    assert_eq!(reader.read().unwrap(), 1);
    assert_eq!(dest_array.borrow()[0], 5);
    reader.close().unwrap();
    imf.close().unwrap();
}

#[test]
fn test_conversion_error_sickens_reader() {
    let dir = TempDir::new().unwrap();
    let imf = ImageFile::create(dir.path().join("sick.e57")).unwrap();
    // Values exceed the i16 range, so delivery into an i16 buffer fails.
    let cv = int_cv(&imf, "points", 0, 1_000_000);

    let (buf, _a) = i64_buf("id", vec![500_000; 2]);
    let mut writer = cv.writer(&[buf]).unwrap();
    writer.write(2).unwrap();
    writer.close().unwrap();

    let dest = Rc::new(RefCell::new(vec![0i16; 2]));
    let mut reader = cv
        .reader(&[SourceDestBuffer::i16("id", dest)])
        .unwrap();
    let err = reader.read().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueNotRepresentable);

    // The reader is sick: every operation except close repeats the error.
    let err = reader.read().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueNotRepresentable);
    let err = reader.seek(0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueNotRepresentable);
    reader.close().unwrap();

    // The container itself stays healthy.
    assert!(imf.is_open());
    let (ok_buf, ok_array) = i64_buf("id", vec![0; 2]);
    let mut reader = cv.reader(&[ok_buf]).unwrap();
    assert_eq!(reader.read().unwrap(), 2);
    assert_eq!(*ok_array.borrow(), vec![500_000, 500_000]);
    reader.close().unwrap();
    imf.close().unwrap();
}

#[test]
fn test_float_delivery_requires_conversion() {
    let dir = TempDir::new().unwrap();
    let imf = ImageFile::create(dir.path().join("conv.e57")).unwrap();

    let proto = StructureNode::new(&imf).unwrap();
    proto
        .set(
            "x",
            FloatNode::new(&imf, 0.0, FloatPrecision::Double, -100.0, 100.0).unwrap(),
        )
        .unwrap();
    let cv =
        CompressedVectorNode::new(&imf, proto, VectorNode::new(&imf, true).unwrap()).unwrap();
    imf.root().unwrap().set("points", cv.clone()).unwrap();

    let src = Rc::new(RefCell::new(vec![3.75f64, -2.25]));
    let mut writer = cv.writer(&[SourceDestBuffer::f64("x", src)]).unwrap();
    writer.write(2).unwrap();
    writer.close().unwrap();

    // f64 field into i32 buffer without do_conversion: refused, reader sick.
    let ints = Rc::new(RefCell::new(vec![0i32; 2]));
    let mut reader = cv
        .reader(&[SourceDestBuffer::i32("x", Rc::clone(&ints))])
        .unwrap();
    let err = reader.read().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConversionRequired);
    reader.close().unwrap();

    // With do_conversion the same transfer truncates toward zero.
    let mut reader = cv
        .reader(&[SourceDestBuffer::i32("x", Rc::clone(&ints)).with_conversion()])
        .unwrap();
    assert_eq!(reader.read().unwrap(), 2);
    assert_eq!(*ints.borrow(), vec![3, -2]);
    reader.close().unwrap();
    imf.close().unwrap();
}

#[test]
fn test_binding_contract() {
    let dir = TempDir::new().unwrap();
    let imf = ImageFile::create(dir.path().join("bind.e57")).unwrap();

    let proto = StructureNode::new(&imf).unwrap();
    proto
        .set("id", IntegerNode::new(&imf, 0, 0, 100).unwrap())
        .unwrap();
    proto
        .set(
            "x",
            FloatNode::new(&imf, 0.0, FloatPrecision::Double, -1.0, 1.0).unwrap(),
        )
        .unwrap();
    let cv =
        CompressedVectorNode::new(&imf, proto, VectorNode::new(&imf, true).unwrap()).unwrap();
    imf.root().unwrap().set("points", cv.clone()).unwrap();

    let ids = Rc::new(RefCell::new(vec![0i64; 4]));
    let xs = Rc::new(RefCell::new(vec![0f64; 4]));

    // Missing field.
    let err = cv
        .writer(&[SourceDestBuffer::i64("id", Rc::clone(&ids))])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathUndefined);

    // Duplicate path.
    let err = cv
        .writer(&[
            SourceDestBuffer::i64("id", Rc::clone(&ids)),
            SourceDestBuffer::i64("id", Rc::clone(&ids)),
        ])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BufferDuplicatePathName);

    // Unknown extra path.
    let err = cv
        .writer(&[
            SourceDestBuffer::i64("id", Rc::clone(&ids)),
            SourceDestBuffer::f64("x", Rc::clone(&xs)),
            SourceDestBuffer::f64("y", Rc::clone(&xs)),
        ])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BufferSizeMismatch);

    // Capacity mismatch.
    let short = Rc::new(RefCell::new(vec![0f64; 3]));
    let err = cv
        .writer(&[
            SourceDestBuffer::i64("id", Rc::clone(&ids)),
            SourceDestBuffer::f64("x", short),
        ])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BufferSizeMismatch);

    // String buffer on a numeric field.
    let labels = Rc::new(RefCell::new(vec![String::new(); 4]));
    let err = cv
        .writer(&[
            SourceDestBuffer::i64("id", Rc::clone(&ids)),
            SourceDestBuffer::ustring("x", labels),
        ])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExpectingNumeric);

    imf.close().unwrap();
}

#[test]
fn test_rebinding_rules() {
    let dir = TempDir::new().unwrap();
    let imf = ImageFile::create(dir.path().join("rebind.e57")).unwrap();
    let cv = int_cv(&imf, "points", 0, 1000);

    let values: Vec<i64> = (0..100).collect();
    let (buf, _src) = i64_buf("id", values.clone());
    let mut writer = cv.writer(&[buf]).unwrap();
    writer.write(100).unwrap();
    writer.close().unwrap();

    let (first, first_array) = i64_buf("id", vec![0; 30]);
    let mut reader = cv.reader(&[first]).unwrap();
    assert_eq!(reader.read().unwrap(), 30);
    assert_eq!(first_array.borrow()[..], values[..30]);

    // Rebinding may change the array and capacity.
    let (larger, larger_array) = i64_buf("id", vec![0; 70]);
    assert_eq!(reader.read_with(&[larger]).unwrap(), 70);
    assert_eq!(larger_array.borrow()[..], values[30..]);

    // Changing the element kind is not a rebinding.
    let floats = Rc::new(RefCell::new(vec![0f64; 70]));
    let err = reader
        .read_with(&[SourceDestBuffer::f64("id", floats)])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadAPIArgument);

    reader.close().unwrap();
    imf.close().unwrap();
}

#[test]
fn test_transfer_invariants() {
    let dir = TempDir::new().unwrap();
    let imf = ImageFile::create(dir.path().join("inv.e57")).unwrap();
    let cv = int_cv(&imf, "points", 0, 100);

    let (buf, _a) = i64_buf("id", vec![1; 16]);
    let mut writer = cv.writer(&[buf.clone()]).unwrap();
    writer.check_invariant().unwrap();
    imf.check_invariant(false).unwrap();
    writer.write(16).unwrap();
    writer.close().unwrap();
    writer.check_invariant().unwrap();

    let mut reader = cv.reader(&[buf]).unwrap();
    reader.check_invariant().unwrap();
    imf.check_invariant(true).unwrap();
    reader.close().unwrap();
    imf.close().unwrap();
}
