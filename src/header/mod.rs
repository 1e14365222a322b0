//! Pax tar header codec.
//!
//! The encoder is a one-shot header serializer: it renders exactly the octets
//! of one entry's header (pax extended-header block, the pax records padded
//! to a block boundary, then the ustar block) into a caller-provided scratch
//! buffer and returns the count. It never emits payload padding or
//! end-of-archive blocks; those belong to the writer, which owns the slot
//! layout. Encoding is deterministic and depends only on the entry, so the
//! layout planner can size headers by probe-encoding locally.
//!
//! Decoding rides on `tar::Archive`; [`entry_meta`] lifts one decoded entry
//! into a file-list record, folding in the pax records the encoder emits.

use std::ffi::OsStr;
use std::io::Read;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{ArchiveError, Result};
use crate::flist::{Entry, EntryType};
use crate::fsx;

/// Tar block granularity.
pub const BLOCK_SIZE: u64 = 512;

/// Per-rank scratch buffer for header encoding. The entire header must fit;
/// entries with very long ACLs or xattrs can exhaust it.
pub const HEADER_BUF_SIZE: usize = 128 * 1024 * 1024;

/// ustar name/linkname field width.
const NAME_FIELD: usize = 100;
/// Largest value of a 8-byte octal field (uid, gid).
const OCTAL8_MAX: u64 = 0o7777777;
/// Largest value of a 12-byte octal field (size, mtime).
const OCTAL12_MAX: u64 = 0o77777777777;

fn pad512(n: usize) -> usize {
    (n + 511) & !511
}

/// Encode one entry header into `buf`, returning the number of bytes used.
///
/// `name` is the archive-relative entry name. With `preserve` set, extended
/// attributes are read directly from the source inode and carried as
/// `SCHILY.xattr.*` records.
pub fn encode(entry: &Entry, name: &Path, preserve: bool, buf: &mut [u8]) -> Result<usize> {
    let name_bytes = name.as_os_str().as_bytes();
    let link_bytes: Option<&[u8]> = entry.link_target.as_deref().map(|t| t.as_os_str().as_bytes());

    // pax records; times always travel in full precision
    let mut records: Vec<u8> = Vec::new();
    pax_push(&mut records, "atime", pax_time(entry.atime, entry.atime_nsec).as_bytes());
    pax_push(&mut records, "ctime", pax_time(entry.ctime, entry.ctime_nsec).as_bytes());
    pax_push(&mut records, "mtime", pax_time(entry.mtime, entry.mtime_nsec).as_bytes());
    if name_bytes.len() > NAME_FIELD {
        pax_push(&mut records, "path", name_bytes);
    }
    if let Some(lb) = link_bytes {
        if lb.len() > NAME_FIELD {
            pax_push(&mut records, "linkpath", lb);
        }
    }
    if entry.etype == EntryType::Regular && entry.size > OCTAL12_MAX {
        pax_push(&mut records, "size", entry.size.to_string().as_bytes());
    }
    if entry.uid > OCTAL8_MAX {
        pax_push(&mut records, "uid", entry.uid.to_string().as_bytes());
    }
    if entry.gid > OCTAL8_MAX {
        pax_push(&mut records, "gid", entry.gid.to_string().as_bytes());
    }
    if preserve {
        match fsx::read_xattrs(&entry.name) {
            Ok(xattrs) => {
                for (key, value) in xattrs {
                    pax_push(&mut records, &format!("SCHILY.xattr.{}", key), &value);
                }
            }
            Err(err) => warn!("reading xattrs from '{}': {}", entry.name.display(), err),
        }
    }

    let total = BLOCK_SIZE as usize + pad512(records.len()) + BLOCK_SIZE as usize;
    if total > buf.len() {
        return Err(ArchiveError::Layout { needed: total, cap: buf.len() });
    }

    let mut pos = 0;

    // extended header block and its record payload
    let mut xhdr = tar::Header::new_ustar();
    xhdr.set_entry_type(tar::EntryType::XHeader);
    set_name(&mut xhdr, &pax_header_name(name_bytes))?;
    xhdr.set_mode(0o644);
    xhdr.set_uid(0);
    xhdr.set_gid(0);
    xhdr.set_size(records.len() as u64);
    xhdr.set_mtime(clamp_time(entry.mtime));
    xhdr.set_cksum();
    buf[pos..pos + 512].copy_from_slice(&xhdr.as_bytes()[..]);
    pos += 512;
    buf[pos..pos + records.len()].copy_from_slice(&records);
    let padded = pad512(records.len());
    buf[pos + records.len()..pos + padded].fill(0);
    pos += padded;

    // ustar block
    let mut hdr = tar::Header::new_ustar();
    hdr.set_entry_type(match entry.etype {
        EntryType::Regular => tar::EntryType::Regular,
        EntryType::Directory => tar::EntryType::Directory,
        EntryType::Symlink => tar::EntryType::Symlink,
        EntryType::Other => {
            return Err(ArchiveError::Format(format!(
                "cannot encode special file '{}'",
                entry.name.display()
            )))
        }
    });
    set_name(&mut hdr, name_bytes)?;
    if let Some(lb) = link_bytes {
        let truncated = &lb[..lb.len().min(NAME_FIELD)];
        hdr.set_link_name(Path::new(OsStr::from_bytes(truncated)))
            .map_err(|e| ArchiveError::Format(format!("storing link target: {}", e)))?;
    }
    hdr.set_mode(entry.mode & 0o7777);
    hdr.set_uid(entry.uid.min(OCTAL8_MAX));
    hdr.set_gid(entry.gid.min(OCTAL8_MAX));
    let size = if entry.etype == EntryType::Regular { entry.size } else { 0 };
    hdr.set_size(size.min(OCTAL12_MAX));
    hdr.set_mtime(clamp_time(entry.mtime));
    let _ = hdr.set_username(&entry.uname);
    let _ = hdr.set_groupname(&entry.gname);
    hdr.set_cksum();
    buf[pos..pos + 512].copy_from_slice(&hdr.as_bytes()[..]);
    pos += 512;

    Ok(pos)
}

/// Write the entry name into the 100-byte ustar field, truncating when a pax
/// `path` record carries the full name.
fn set_name(hdr: &mut tar::Header, name_bytes: &[u8]) -> Result<()> {
    let truncated = &name_bytes[..name_bytes.len().min(NAME_FIELD)];
    hdr.set_path(Path::new(OsStr::from_bytes(truncated)))
        .map_err(|e| ArchiveError::Format(format!("storing entry name: {}", e)))
}

/// Conventional name of the extended-header pseudo entry.
fn pax_header_name(name_bytes: &[u8]) -> Vec<u8> {
    let base = name_bytes
        .rsplit(|&b| b == b'/')
        .find(|part| !part.is_empty())
        .unwrap_or(b"entry");
    let prefix = b"./PaxHeaders/";
    let avail = NAME_FIELD - prefix.len();
    let mut v = prefix.to_vec();
    v.extend_from_slice(&base[..base.len().min(avail)]);
    v
}

fn clamp_time(sec: i64) -> u64 {
    sec.max(0).min(OCTAL12_MAX as i64) as u64
}

/// Append one `len key=value\n` record; the length field counts itself.
fn pax_push(records: &mut Vec<u8>, key: &str, value: &[u8]) {
    let base = key.len() + value.len() + 3;
    let mut total = base + 1;
    loop {
        let digits = decimal_digits(total);
        if digits + base == total {
            break;
        }
        total = digits + base;
    }
    records.extend_from_slice(total.to_string().as_bytes());
    records.push(b' ');
    records.extend_from_slice(key.as_bytes());
    records.push(b'=');
    records.extend_from_slice(value);
    records.push(b'\n');
}

fn decimal_digits(mut n: usize) -> usize {
    let mut d = 1;
    while n >= 10 {
        n /= 10;
        d += 1;
    }
    d
}

fn pax_time(sec: i64, nsec: u32) -> String {
    if nsec == 0 {
        sec.to_string()
    } else {
        format!("{}.{:09}", sec, nsec)
    }
}

fn parse_pax_time(s: &str) -> (i64, u32) {
    match s.split_once('.') {
        Some((sec, frac)) => {
            let nanos: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
            (sec.parse().unwrap_or(0), nanos.parse().unwrap_or(0))
        }
        None => (s.parse().unwrap_or(0), 0),
    }
}

/// Lift one decoded archive entry into a file-list record.
///
/// The returned entry's `name` is the archive-relative name; callers resolve
/// it against their working directory.
pub fn entry_meta<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Entry> {
    let mut name: PathBuf = entry
        .path()
        .map_err(|e| ArchiveError::Format(format!("entry name: {}", e)))?
        .into_owned();
    let mut size = entry.size();
    let mut link_target: Option<PathBuf> = entry
        .link_name()
        .map_err(|e| ArchiveError::Format(format!("link target: {}", e)))?
        .map(|c| c.into_owned());

    let (mode, mut uid, mut gid, mtime, uname, gname, tar_type) = {
        let h = entry.header();
        (
            h.mode().map_err(|e| ArchiveError::Format(format!("mode field: {}", e)))?,
            h.uid().map_err(|e| ArchiveError::Format(format!("uid field: {}", e)))?,
            h.gid().map_err(|e| ArchiveError::Format(format!("gid field: {}", e)))?,
            h.mtime().map_err(|e| ArchiveError::Format(format!("mtime field: {}", e)))? as i64,
            h.username().ok().flatten().unwrap_or("").to_string(),
            h.groupname().ok().flatten().unwrap_or("").to_string(),
            h.entry_type(),
        )
    };

    let mut atime = (mtime, 0u32);
    let mut ctime = (mtime, 0u32);
    let mut mtime = (mtime, 0u32);
    let mut xattrs: Vec<(String, Vec<u8>)> = Vec::new();

    if let Some(exts) = entry
        .pax_extensions()
        .map_err(|e| ArchiveError::Format(format!("pax records: {}", e)))?
    {
        for ext in exts {
            let ext = ext.map_err(|e| ArchiveError::Format(format!("pax record: {}", e)))?;
            let key = match ext.key() {
                Ok(k) => k,
                Err(_) => continue,
            };
            match key {
                "atime" => {
                    if let Ok(v) = ext.value() {
                        atime = parse_pax_time(v);
                    }
                }
                "ctime" => {
                    if let Ok(v) = ext.value() {
                        ctime = parse_pax_time(v);
                    }
                }
                "mtime" => {
                    if let Ok(v) = ext.value() {
                        mtime = parse_pax_time(v);
                    }
                }
                "path" => name = PathBuf::from(std::ffi::OsString::from_vec(ext.value_bytes().to_vec())),
                "linkpath" => {
                    link_target =
                        Some(PathBuf::from(std::ffi::OsString::from_vec(ext.value_bytes().to_vec())))
                }
                "size" => {
                    if let Ok(v) = ext.value() {
                        size = v.parse().unwrap_or(size);
                    }
                }
                "uid" => {
                    if let Ok(v) = ext.value() {
                        uid = v.parse().unwrap_or(uid);
                    }
                }
                "gid" => {
                    if let Ok(v) = ext.value() {
                        gid = v.parse().unwrap_or(gid);
                    }
                }
                _ => {
                    if let Some(attr) = key.strip_prefix("SCHILY.xattr.") {
                        xattrs.push((attr.to_string(), ext.value_bytes().to_vec()));
                    }
                }
            }
        }
    }

    let mut etype = match tar_type {
        tar::EntryType::Directory => EntryType::Directory,
        tar::EntryType::Symlink => EntryType::Symlink,
        tar::EntryType::Regular | tar::EntryType::GNUSparse | tar::EntryType::Continuous => {
            EntryType::Regular
        }
        _ => EntryType::Other,
    };
    // pre-POSIX archives mark directories with a trailing slash only
    if etype == EntryType::Regular && name.as_os_str().as_bytes().ends_with(b"/") {
        etype = EntryType::Directory;
    }

    Ok(Entry {
        name,
        etype,
        size,
        mode,
        uid,
        gid,
        uname,
        gname,
        atime: atime.0,
        atime_nsec: atime.1,
        mtime: mtime.0,
        mtime_nsec: mtime.1,
        ctime: ctime.0,
        ctime_nsec: ctime.1,
        link_target,
        xattrs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(name: &str, etype: EntryType) -> Entry {
        Entry {
            name: PathBuf::from(name),
            etype,
            size: 0,
            mode: 0o100644,
            uid: 1000,
            gid: 100,
            uname: "user".to_string(),
            gname: "group".to_string(),
            atime: 1_600_000_001,
            atime_nsec: 0,
            mtime: 1_600_000_002,
            mtime_nsec: 123_456_789,
            ctime: 1_600_000_003,
            ctime_nsec: 7,
            link_target: None,
            xattrs: Vec::new(),
        }
    }

    fn decode_one(buf: &[u8]) -> Entry {
        let mut archive = tar::Archive::new(std::io::Cursor::new(buf.to_vec()));
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        entry_meta(&mut entry).unwrap()
    }

    #[test]
    fn pax_record_length_counts_itself() {
        let mut v = Vec::new();
        pax_push(&mut v, "mtime", b"1234.5");
        assert_eq!(v, b"16 mtime=1234.5\n");
        assert_eq!(v.len(), 16);
    }

    #[test]
    fn header_is_block_aligned_and_roundtrips() {
        let entry = sample_entry("/src/a.txt", EntryType::Regular);
        let mut buf = vec![0u8; 16 * 1024];
        let n = encode(&entry, Path::new("a.txt"), false, &mut buf).unwrap();
        assert_eq!(n % 512, 0);
        assert!(n >= 1536); // xheader + records + ustar

        let decoded = decode_one(&buf[..n]);
        assert_eq!(decoded.name, PathBuf::from("a.txt"));
        assert_eq!(decoded.etype, EntryType::Regular);
        assert_eq!(decoded.mode & 0o7777, 0o644);
        assert_eq!(decoded.uid, 1000);
        assert_eq!(decoded.mtime, 1_600_000_002);
        assert_eq!(decoded.mtime_nsec, 123_456_789);
        assert_eq!(decoded.atime, 1_600_000_001);
        assert_eq!(decoded.ctime, 1_600_000_003);
        assert_eq!(decoded.ctime_nsec, 7);
        assert_eq!(decoded.uname, "user");
    }

    #[test]
    fn long_names_travel_in_pax_records() {
        let rel: PathBuf = std::iter::repeat("component")
            .take(20)
            .collect::<Vec<_>>()
            .join("/")
            .into();
        assert!(rel.as_os_str().len() > 100);
        let entry = sample_entry("/src/deep", EntryType::Regular);
        let mut buf = vec![0u8; 16 * 1024];
        let n = encode(&entry, &rel, false, &mut buf).unwrap();
        let decoded = decode_one(&buf[..n]);
        assert_eq!(decoded.name, rel);
    }

    #[test]
    fn symlink_target_is_carried() {
        let mut entry = sample_entry("/src/link", EntryType::Symlink);
        entry.link_target = Some(PathBuf::from("../target/file"));
        let mut buf = vec![0u8; 16 * 1024];
        let n = encode(&entry, Path::new("link"), false, &mut buf).unwrap();
        let decoded = decode_one(&buf[..n]);
        assert_eq!(decoded.etype, EntryType::Symlink);
        assert_eq!(decoded.link_target, Some(PathBuf::from("../target/file")));
    }

    #[test]
    fn directory_entry_has_no_payload_size() {
        let entry = sample_entry("/src/d", EntryType::Directory);
        let mut buf = vec![0u8; 16 * 1024];
        let n = encode(&entry, Path::new("d"), false, &mut buf).unwrap();
        let decoded = decode_one(&buf[..n]);
        assert_eq!(decoded.etype, EntryType::Directory);
        assert_eq!(decoded.size, 0);
    }

    #[test]
    fn scratch_overflow_is_reported() {
        let entry = sample_entry("/src/a", EntryType::Regular);
        let mut buf = vec![0u8; 512];
        match encode(&entry, Path::new("a"), false, &mut buf) {
            Err(ArchiveError::Layout { needed, cap }) => {
                assert!(needed > cap);
                assert_eq!(cap, 512);
            }
            other => panic!("expected layout error, got {:?}", other.map(|_| ())),
        }
    }
}
