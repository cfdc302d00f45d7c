#![no_main]
use libfuzzer_sys::{fuzz_target, arbitrary::{Arbitrary, Unstructured}};
use pakfile::{ArchiveBuilder, InlineDigester};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Arbitrary)]
struct AddOp {
    path_idx: u8,
    preload: u8,
    multi_chunk: bool,
    data: Vec<u8>,
}

// Whatever is added must read back byte for byte, before and after reopening
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);

    let ops: Vec<AddOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };
    if ops.is_empty() {
        return;
    }

    let dir = std::env::temp_dir().join(format!("pak-fuzz-{}", std::process::id()));
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let base = dir.join("fuzz");

    let archive = match ArchiveBuilder::new()
        .path(&base)
        .max_chunk_size(256)
        .cache_lines(2)
        .digest_service(Arc::new(InlineDigester))
        .create()
    {
        Ok(archive) => archive,
        Err(_) => return,
    };

    let mut expected = HashMap::new();
    for op in ops.iter().take(16) {
        let path = format!("dir{}/file{}.bin", op.path_idx % 3, op.path_idx);
        if archive
            .add_file(&path, op.preload as usize, &op.data, op.multi_chunk, None)
            .is_ok()
        {
            expected.insert(path, op.data.clone());
        }
    }

    for (path, data) in &expected {
        assert_eq!(&archive.read_file(path).unwrap(), data);
    }

    archive.hash_everything().unwrap();
    archive.write().unwrap();
    drop(archive);

    let reopened = ArchiveBuilder::new()
        .path(&base)
        .digest_service(Arc::new(InlineDigester))
        .open()
        .unwrap();
    for (path, data) in &expected {
        assert_eq!(&reopened.read_file(path).unwrap(), data);
    }
    assert!(reopened.test_directory_hash());
    assert!(reopened.test_chunk_hash());
    drop(reopened);

    std::fs::remove_dir_all(&dir).ok();
});
