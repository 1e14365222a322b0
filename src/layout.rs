//! Layout planning: per-entry slot sizing and global offset assignment.
//!
//! Every rank probe-encodes the headers of its own shard to learn their
//! exact sizes, sums its slots, and one prefix sum later knows the absolute
//! byte range of every local entry. After planning, all writes are positioned
//! writes into disjoint ranges; no rank ever needs to ask another where to
//! put a byte.

use std::path::Path;

use log::error;

use crate::comm::Group;
use crate::error::{ArchiveError, Result};
use crate::flist::{relative_to, EntryType, FileList};
use crate::header;

/// Round a payload length up to the tar block boundary.
pub fn round_up_512(n: u64) -> u64 {
    (n + 511) & !511
}

/// The rank-local placement table plus the global scalars derived with it.
pub struct Layout {
    /// Exact header byte size per local entry.
    pub header_sizes: Vec<u64>,
    /// Header plus padded payload per local entry; zero for skipped entries.
    pub slot_sizes: Vec<u64>,
    /// Absolute archive offset of each local entry's header.
    pub offsets: Vec<u64>,
    /// Sum of all slot sizes across ranks (excludes the trailer blocks).
    pub archive_size: u64,
    /// Sum of padded regular-file payload bytes across ranks.
    pub total_bytes: u64,
    /// Global entry count.
    pub total_items: u64,
}

/// Compute the placement of every local entry.
///
/// A probe-encode failure on any rank aborts the plan everywhere; no partial
/// state is committed.
pub fn plan(
    group: &Group,
    list: &FileList,
    cwd: &Path,
    preserve: bool,
    scratch: &mut [u8],
) -> Result<Layout> {
    let n = list.entries.len();
    let mut header_sizes = vec![0u64; n];
    let mut slot_sizes = vec![0u64; n];
    let mut offsets = vec![0u64; n];

    let mut local_bytes = 0u64;
    let mut data_bytes = 0u64;
    let mut ok = true;
    let mut first_err: Option<ArchiveError> = None;

    for (i, entry) in list.entries.iter().enumerate() {
        let slot = if entry.etype == EntryType::Other {
            0
        } else {
            let probe = relative_to(cwd, &entry.name)
                .and_then(|rel| header::encode(entry, &rel, preserve, scratch));
            match probe {
                Ok(hs) => {
                    header_sizes[i] = hs as u64;
                    if entry.etype == EntryType::Regular {
                        let padded = round_up_512(entry.size);
                        data_bytes += padded;
                        hs as u64 + padded
                    } else {
                        hs as u64
                    }
                }
                Err(e) => {
                    error!("sizing entry '{}': {}", entry.name.display(), e);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                    ok = false;
                    0
                }
            }
        };
        slot_sizes[i] = slot;
        offsets[i] = local_bytes;
        local_bytes += slot;
    }

    if !group.all_true(ok) {
        return Err(first_err.unwrap_or(ArchiveError::Failed("layout planning failed")));
    }

    let base = group.exclusive_prefix_sum(local_bytes);
    let archive_size = group.allreduce_sum(local_bytes);
    for offset in &mut offsets {
        *offset += base;
    }
    let total_bytes = group.allreduce_sum(data_bytes);
    let total_items = group.allreduce_sum(n as u64);

    Ok(Layout { header_sizes, slot_sizes, offsets, archive_size, total_bytes, total_items })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm;
    use crate::flist::{Entry, EntryType, FileList};
    use std::path::PathBuf;

    fn entry(name: &str, etype: EntryType, size: u64) -> Entry {
        Entry {
            name: PathBuf::from(name),
            etype,
            size,
            mode: if etype == EntryType::Directory { 0o40755 } else { 0o100644 },
            uid: 1000,
            gid: 1000,
            uname: String::new(),
            gname: String::new(),
            atime: 1_700_000_000,
            atime_nsec: 0,
            mtime: 1_700_000_000,
            mtime_nsec: 0,
            ctime: 1_700_000_000,
            ctime_nsec: 0,
            link_target: if etype == EntryType::Symlink { Some(PathBuf::from("t")) } else { None },
            xattrs: Vec::new(),
        }
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up_512(0), 0);
        assert_eq!(round_up_512(1), 512);
        assert_eq!(round_up_512(512), 512);
        assert_eq!(round_up_512(513), 1024);
    }

    #[test]
    fn slots_are_disjoint_across_ranks() {
        let cwd = PathBuf::from("/src");
        let shards = vec![
            vec![entry("/src/a", EntryType::Directory, 0), entry("/src/a/f1", EntryType::Regular, 513)],
            vec![entry("/src/a/f2", EntryType::Regular, 0), entry("/src/a/s", EntryType::Symlink, 0)],
        ];
        let results = comm::spawn(2, |group| {
            let list = FileList { entries: shards[group.rank()].clone() };
            let mut scratch = vec![0u8; 64 * 1024];
            let layout = plan(&group, &list, &cwd, false, &mut scratch).unwrap();
            let ranges: Vec<(u64, u64)> = layout
                .offsets
                .iter()
                .zip(layout.slot_sizes.iter())
                .map(|(&o, &s)| (o, s))
                .collect();
            (ranges, layout.archive_size, layout.total_bytes, layout.total_items)
        });

        let (r0, size0, bytes0, items0) = results[0].clone();
        let (r1, size1, bytes1, items1) = results[1].clone();
        assert_eq!(size0, size1);
        assert_eq!(bytes0, 1024); // 513 padded; the empty file pads to zero
        assert_eq!(items0, 4);
        assert_eq!((bytes0, items0), (bytes1, items1));

        // contiguous, gap-free placement across both ranks
        let mut all = r0;
        all.extend(r1);
        let mut expected = 0;
        for (offset, slot) in &all {
            assert_eq!(*offset, expected);
            expected = offset + slot;
        }
        assert_eq!(expected, size0);

        // regular-file slots carry header plus padded payload
        let (_, f1_slot) = all[1];
        assert!(f1_slot >= 1024 + 1536);
    }

    #[test]
    fn dir_and_symlink_slots_are_header_only() {
        let cwd = PathBuf::from("/src");
        let results = comm::spawn(1, |group| {
            let list = FileList {
                entries: vec![
                    entry("/src/d", EntryType::Directory, 0),
                    entry("/src/s", EntryType::Symlink, 0),
                ],
            };
            let mut scratch = vec![0u8; 64 * 1024];
            let layout = plan(&group, &list, &cwd, false, &mut scratch).unwrap();
            (layout.header_sizes.clone(), layout.slot_sizes.clone())
        });
        let (headers, slots) = &results[0];
        assert_eq!(headers, slots);
    }
}
