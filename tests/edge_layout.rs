//! Edge cases of slot layout: empty directories, zero-byte files, payload
//! padding and the end-of-archive trailer.

use partar::comm;
use partar::common::ArchiveOpts;
use partar::create;
use partar::extract;
use partar::flist::FileList;
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn do_create(inputs: &[PathBuf], archive: &Path, cwd: &Path, ranks: usize, opts: &ArchiveOpts) {
    let results = comm::spawn(ranks, |group| {
        let list = if group.rank() == 0 {
            FileList::walk(inputs).unwrap()
        } else {
            FileList::default()
        };
        create::create(&group, list, archive, cwd, opts)
    });
    for r in results {
        r.unwrap();
    }
}

fn do_extract(archive: &Path, dest: &Path, ranks: usize) {
    let results = comm::spawn(ranks, |group| {
        extract::extract(&group, archive, dest, &ArchiveOpts::default())
    });
    for r in results {
        r.unwrap();
    }
}

#[test]
fn empty_directory_archive() {
    let tmp = tempdir().unwrap();
    let cwd = tmp.path();
    let dir = cwd.join("d");
    fs::create_dir(&dir).unwrap();

    let archive = cwd.join("a.tar");
    do_create(&[dir], &archive, cwd, 1, &ArchiveOpts::default());

    // one header-only slot plus the two trailer blocks
    let bytes = fs::read(&archive).unwrap();
    assert_eq!(bytes.len() % 512, 0);
    assert!(bytes[bytes.len() - 1024..].iter().all(|&b| b == 0));

    // the index holds exactly one offset: zero, big-endian
    let idx = fs::read(partar::index::index_path(&archive)).unwrap();
    assert_eq!(idx, 0u64.to_be_bytes());

    // the single slot is the header alone
    let header_len = bytes.len() - 1024;
    assert!(header_len >= 1536);
    assert!(!bytes[..header_len].iter().all(|&b| b == 0));

    let out = tempdir().unwrap();
    do_extract(&archive, out.path(), 1);
    assert!(out.path().join("d").is_dir());
}

#[test]
fn zero_byte_file_has_no_payload() {
    let tmp = tempdir().unwrap();
    let cwd = tmp.path();
    let src = cwd.join("f");
    fs::write(&src, b"").unwrap();

    let archive = cwd.join("a.tar");
    do_create(&[src], &archive, cwd, 1, &ArchiveOpts::default());

    // slot == header: decoding sees a zero payload and the archive holds
    // exactly one entry
    let mut reader = tar::Archive::new(fs::File::open(&archive).unwrap());
    let mut count = 0;
    for entry in reader.entries().unwrap() {
        let entry = entry.unwrap();
        assert_eq!(entry.size(), 0);
        count += 1;
    }
    assert_eq!(count, 1);

    let out = tempdir().unwrap();
    do_extract(&archive, out.path(), 1);
    assert_eq!(fs::metadata(out.path().join("f")).unwrap().len(), 0);
}

#[test]
fn payload_padding_is_zeroed() {
    let tmp = tempdir().unwrap();
    let cwd = tmp.path();
    let src = cwd.join("f");
    let mut payload = vec![0u8; 513];
    rand::thread_rng().fill_bytes(&mut payload);
    // make sure the final payload byte is nonzero so the pad boundary is
    // observable
    payload[512] = 0xAB;
    fs::write(&src, &payload).unwrap();

    let archive = cwd.join("a.tar");
    do_create(&[src.clone()], &archive, cwd, 1, &ArchiveOpts::default());

    let bytes = fs::read(&archive).unwrap();
    // body = header + 1024 bytes of padded payload, then the trailer
    let body_len = bytes.len() - 1024;
    assert_eq!(body_len % 512, 0);
    let payload_end = body_len; // pad runs right up to the trailer
    assert_eq!(bytes[payload_end - 512], 0xAB);
    assert!(bytes[payload_end - 511..payload_end].iter().all(|&b| b == 0));

    let out = tempdir().unwrap();
    do_extract(&archive, out.path(), 1);
    assert_eq!(fs::read(out.path().join("f")).unwrap(), payload);
}

#[test]
fn trailer_is_written_once_at_archive_size() {
    let tmp = tempdir().unwrap();
    let cwd = tmp.path();
    let src = cwd.join("src");
    fs::create_dir_all(&src).unwrap();
    for i in 0..3 {
        fs::write(src.join(format!("f{}", i)), vec![i as u8 + 1; 512]).unwrap();
    }

    let archive = cwd.join("a.tar");
    do_create(&[src], &archive, cwd, 2, &ArchiveOpts::default());

    let bytes = fs::read(&archive).unwrap();
    // exactly the last two blocks are zero; the block before them is payload
    assert!(bytes[bytes.len() - 1024..].iter().all(|&b| b == 0));
    assert!(bytes[bytes.len() - 1536..bytes.len() - 1024].iter().any(|&b| b != 0));
}

#[test]
fn symlink_roundtrip_preserves_target() {
    let tmp = tempdir().unwrap();
    let cwd = tmp.path();
    let src = cwd.join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("target"), b"data").unwrap();
    std::os::unix::fs::symlink("target", src.join("s")).unwrap();

    let archive = cwd.join("a.tar");
    do_create(&[src], &archive, cwd, 1, &ArchiveOpts::default());

    let out = tempdir().unwrap();
    do_extract(&archive, out.path(), 1);
    let link = out.path().join("src/s");
    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("target"));
    // the link resolves inside the extracted tree
    assert_eq!(fs::read(&link).unwrap(), b"data");
}

#[test]
fn long_entry_names_roundtrip() {
    let tmp = tempdir().unwrap();
    let cwd = tmp.path();
    let mut deep = cwd.join("src");
    for _ in 0..12 {
        deep = deep.join("long-directory-name");
    }
    fs::create_dir_all(&deep).unwrap();
    let file = deep.join("leaf.bin");
    fs::write(&file, b"deep payload").unwrap();
    assert!(file.strip_prefix(cwd).unwrap().as_os_str().len() > 100);

    let archive = cwd.join("a.tar");
    do_create(&[cwd.join("src")], &archive, cwd, 2, &ArchiveOpts::default());

    let out = tempdir().unwrap();
    do_extract(&archive, out.path(), 2);
    let extracted = out.path().join(file.strip_prefix(cwd).unwrap());
    assert_eq!(fs::read(extracted).unwrap(), b"deep payload");
}
