//! File list: the ordered, rank-sharded sequence of archive entries.
//!
//! During creation the list is built by walking the source trees, sorted
//! lexicographically (so parent directories land in the archive before their
//! children) and resharded contiguously across ranks. During extraction it is
//! rebuilt from decoded archive headers. Either way, each rank holds only its
//! own shard; global quantities come from collectives.

use std::fs;
use std::path::{Component, Path, PathBuf};

use log::{debug, error, info};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::comm::Group;
use crate::error::{ArchiveError, Result};
use crate::fsx;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    Regular,
    Directory,
    Symlink,
    /// Sockets, fifos, devices. Never archived; skipped on extraction.
    Other,
}

/// One addressable item: a file, directory or symlink plus the stat-like
/// attributes a pax header carries.
#[derive(Clone, Debug)]
pub struct Entry {
    /// Absolute path: the source path when archiving, the target path when
    /// extracting.
    pub name: PathBuf,
    pub etype: EntryType,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub uname: String,
    pub gname: String,
    pub atime: i64,
    pub atime_nsec: u32,
    pub mtime: i64,
    pub mtime_nsec: u32,
    pub ctime: i64,
    pub ctime_nsec: u32,
    /// Link target, present only for symlinks.
    pub link_target: Option<PathBuf>,
    /// Extended attributes decoded from pax records (extraction side only;
    /// the encoder reads attributes straight from the source inode).
    pub xattrs: Vec<(String, Vec<u8>)>,
}

impl Entry {
    /// Build an entry from an on-disk item without following symlinks.
    pub fn from_path(path: &Path) -> Result<Entry> {
        let md = fs::symlink_metadata(path).map_err(|e| ArchiveError::io(e, path))?;
        let ft = md.file_type();
        let etype = if ft.is_dir() {
            EntryType::Directory
        } else if ft.is_file() {
            EntryType::Regular
        } else if ft.is_symlink() {
            EntryType::Symlink
        } else {
            EntryType::Other
        };
        let link_target = if etype == EntryType::Symlink {
            Some(fs::read_link(path).map_err(|e| ArchiveError::io(e, path))?)
        } else {
            None
        };
        use std::os::unix::fs::MetadataExt;
        Ok(Entry {
            name: path.to_path_buf(),
            etype,
            size: if etype == EntryType::Regular { md.size() } else { 0 },
            mode: md.mode(),
            uid: md.uid() as u64,
            gid: md.gid() as u64,
            uname: fsx::username(md.uid()),
            gname: fsx::groupname(md.gid()),
            atime: md.atime(),
            atime_nsec: md.atime_nsec() as u32,
            mtime: md.mtime(),
            mtime_nsec: md.mtime_nsec() as u32,
            ctime: md.ctime(),
            ctime_nsec: md.ctime_nsec() as u32,
            link_target,
            xattrs: Vec::new(),
        })
    }
}

/// A rank-local shard of the global entry sequence.
#[derive(Clone, Debug, Default)]
pub struct FileList {
    pub entries: Vec<Entry>,
}

impl FileList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Walk source trees into a list. Item types the archive cannot hold are
    /// skipped up front.
    pub fn walk(inputs: &[PathBuf]) -> Result<FileList> {
        let mut entries = Vec::new();
        for input in inputs {
            for item in WalkDir::new(input).follow_links(false) {
                let item = item.map_err(|e| {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| input.clone());
                    match e.into_io_error() {
                        Some(io) => ArchiveError::io(io, path),
                        None => ArchiveError::Format(format!("walk loop at '{}'", path.display())),
                    }
                })?;
                let entry = Entry::from_path(item.path())?;
                if entry.etype == EntryType::Other {
                    debug!("skipping unsupported item type: {}", item.path().display());
                    continue;
                }
                entries.push(entry);
            }
        }
        Ok(FileList { entries })
    }

    /// Collective sort by name followed by a contiguous reshard, so every
    /// rank ends up with a slice of the globally sorted order.
    pub fn sort_and_shard(group: &Group, local: FileList) -> FileList {
        let mut all: Vec<Entry> = group.all_gather(local.entries).into_iter().flatten().collect();
        all.sort_by(|a, b| a.name.as_os_str().cmp(b.name.as_os_str()));
        let (start, count) = partition(all.len() as u64, group.size() as u64, group.rank() as u64);
        let entries = all
            .into_iter()
            .skip(start as usize)
            .take(count as usize)
            .collect();
        FileList { entries }
    }

    /// Global entry count.
    pub fn global_size(&self, group: &Group) -> u64 {
        group.allreduce_sum(self.entries.len() as u64)
    }

    /// Global sum of regular-file payload bytes.
    pub fn sum_bytes(&self, group: &Group) -> u64 {
        let local: u64 = self
            .entries
            .iter()
            .filter(|e| e.etype == EntryType::Regular)
            .map(|e| e.size)
            .sum();
        group.allreduce_sum(local)
    }

    /// Log a one-line inventory of the global list on rank 0.
    pub fn log_summary(&self, group: &Group) {
        let mut counts = [0u64; 4];
        let mut bytes = 0u64;
        for e in &self.entries {
            match e.etype {
                EntryType::Regular => {
                    counts[0] += 1;
                    bytes += e.size;
                }
                EntryType::Directory => counts[1] += 1,
                EntryType::Symlink => counts[2] += 1,
                EntryType::Other => counts[3] += 1,
            }
        }
        let gathered = group.all_gather([counts[0], counts[1], counts[2], counts[3], bytes]);
        if group.rank() == 0 {
            let mut sums = [0u64; 5];
            for g in gathered {
                for (s, v) in sums.iter_mut().zip(g.iter()) {
                    *s += v;
                }
            }
            let (val, units) = crate::progress::format_bytes(sums[4] as f64);
            info!(
                "Items: {} (files {}, dirs {}, symlinks {}), {:.3} {} of data",
                sums[0] + sums[1] + sums[2] + sums[3],
                sums[0],
                sums[1],
                sums[2],
                val,
                units
            );
        }
    }

    /// Create every directory in the local shard, then synchronize, so no
    /// rank extracts a file before its parent directory exists anywhere.
    pub fn mkdirs(&self, group: &Group) -> Result<()> {
        let ok = self
            .entries
            .par_iter()
            .filter(|e| e.etype == EntryType::Directory)
            .map(|e| match fs::create_dir_all(&e.name) {
                Ok(()) => true,
                Err(err) => {
                    error!("creating directory '{}': {}", e.name.display(), err);
                    false
                }
            })
            .reduce(|| true, |a, b| a && b);
        group.barrier();
        if group.all_true(ok) {
            Ok(())
        } else {
            Err(ArchiveError::Failed("directory creation failed"))
        }
    }

    /// Re-apply mode bits and timestamps to local directory entries. Run
    /// after all ranks finish extracting: creating children bumps parent
    /// mtimes, and a restrictive mode applied earlier would lock ranks out.
    pub fn apply_dir_metadata(&self) -> bool {
        let mut ok = true;
        for e in &self.entries {
            if e.etype != EntryType::Directory {
                continue;
            }
            if let Err(err) = fsx::set_unix_permissions(&e.name, e.mode & 0o7777) {
                error!("setting mode on directory '{}': {}", e.name.display(), err);
                ok = false;
            }
            if let Err(err) = fsx::set_times(
                &e.name,
                (e.atime, e.atime_nsec),
                (e.mtime, e.mtime_nsec),
                true,
            ) {
                error!("setting times on directory '{}': {}", e.name.display(), err);
                ok = false;
            }
        }
        ok
    }
}

/// Contiguous partition of `total` entries over `ranks`: the first
/// `total % ranks` ranks take one extra entry. Returns (start, count).
pub fn partition(total: u64, ranks: u64, rank: u64) -> (u64, u64) {
    let per = total / ranks;
    let rem = total % ranks;
    if rank < rem {
        (rank * (per + 1), per + 1)
    } else {
        (rem * (per + 1) + (rank - rem) * per, per)
    }
}

/// Archive name for an item: its path relative to the working directory.
pub fn relative_to(cwd: &Path, item: &Path) -> Result<PathBuf> {
    let rel = item
        .strip_prefix(cwd)
        .map_err(|_| ArchiveError::StripPrefix { prefix: cwd.to_path_buf(), path: item.to_path_buf() })?;
    if rel.as_os_str().is_empty() {
        Ok(PathBuf::from("."))
    } else {
        Ok(rel.to_path_buf())
    }
}

/// Resolve an archive-relative name under the destination directory.
///
/// The name is reduced lexically; absolute names are treated as relative, and
/// any name whose `..` components would climb out of the destination is
/// refused rather than written outside the tree.
pub fn resolve_under(dest: &Path, name: &Path) -> Result<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for comp in name.components() {
        match comp {
            Component::Normal(c) => parts.push(c),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(ArchiveError::Format(format!(
                        "entry name '{}' escapes the destination directory",
                        name.display()
                    )));
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    let mut out = dest.to_path_buf();
    for p in parts {
        out.push(p);
    }
    Ok(out)
}
