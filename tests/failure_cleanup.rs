//! Failed creations must not leave files or mappings behind.

use mmap_buffer::{BufferError, BufferOptions, Strategy, TypedBuffer};
use std::fs;
use tempfile::tempdir;

#[test]
fn missing_temp_dir_is_file_create_error() {
    let dir = tempdir().expect("tempdir");
    let missing = dir.path().join("gone");
    let opts = BufferOptions::new().name("ranks").temp_dir(&missing);

    let result: Result<TypedBuffer<u64>, _> = opts.create(Strategy::FileBackedMap, 128);
    assert!(matches!(result, Err(BufferError::FileCreate { .. })));
    assert!(!missing.exists());
    assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 0);
}

#[test]
fn oversized_file_backed_buffer_leaves_no_file() {
    let dir = tempdir().expect("tempdir");
    let opts = BufferOptions::new().name("huge").temp_dir(dir.path());

    // Far beyond any filesystem or address space: either sizing or mapping fails.
    let result: Result<TypedBuffer<u64>, _> = opts.create(Strategy::FileBackedMap, usize::MAX / 16);
    match result {
        Err(BufferError::FileCreate { .. } | BufferError::Map { .. }) => {}
        other => panic!("expected FileCreate or Map, got {other:?}"),
    }
    assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 0);
}

#[test]
fn successful_buffers_clean_up_on_drop() {
    let dir = tempdir().expect("tempdir");
    let opts = BufferOptions::new().temp_dir(dir.path());
    {
        let a: TypedBuffer<u32> = opts.create(Strategy::FileBackedMap, 10).expect("a");
        let b: TypedBuffer<u32> = opts.create(Strategy::FileBackedMap, 10).expect("b");
        assert_ne!(a.backing_path(), b.backing_path());
        assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 2);
    }
    assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 0);
}
