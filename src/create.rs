//! Parallel archive writer.
//!
//! Every rank writes disjoint byte ranges of one archive file: headers land
//! at their planned offsets, payloads are sliced into chunks and copied by
//! the work pool, and rank 0 alone truncates, preallocates and finishes the
//! archive with the two zero trailer blocks. The only cross-rank
//! synchronization is the barrier after preallocation, the pool drain and
//! the trailer write; byte-disjoint slots make file locks unnecessary.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::comm::Group;
use crate::common::ArchiveOpts;
use crate::error::{ArchiveError, Result};
use crate::flist::{relative_to, EntryType, FileList};
use crate::fsx;
use crate::header;
use crate::index;
use crate::layout::{self, Layout};
use crate::pool;
use crate::progress::{self, ProgressKind, ProgressTracker, RankMetrics};

const ZERO_BLOCK: [u8; 512] = [0u8; 512];

/// One unit of payload copy work: a chunk of one source file bound for an
/// absolute archive offset.
#[derive(Clone, Debug)]
pub struct CopyTask {
    pub src: PathBuf,
    pub file_size: u64,
    pub chunk_index: u64,
    /// Absolute archive offset of the file's first payload byte.
    pub data_offset: u64,
}

/// Validate sources and destination before any work happens. This is the
/// only fatal precondition check; everything later degrades per entry.
pub fn check_destination(group: &Group, sources: &[PathBuf], dest: &Path) -> Result<()> {
    let valid = if group.rank() == 0 {
        let mut num_readable = 0;
        for src in sources {
            if fsx::readable(src) {
                num_readable += 1;
            } else {
                error!("Could not read '{}'", src.display());
            }
        }
        let mut valid = num_readable >= 1;
        if !valid {
            error!("At least one valid source must be specified");
        } else if std::fs::symlink_metadata(dest).is_ok() {
            warn!("Destination target exists, we will overwrite");
        } else {
            let parent = dest.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            if !fsx::writable(parent) {
                error!("Destination parent directory is not writable: '{}'", parent.display());
                valid = false;
            }
        }
        Some(valid)
    } else {
        None
    };
    if group.broadcast(valid, 0) {
        Ok(())
    } else {
        Err(ArchiveError::Failed("invalid source or destination paths"))
    }
}

/// Create `archive` (and its `.idx` sidecar) from the given file list.
///
/// The list may be sharded arbitrarily; it is sorted by name collectively so
/// parent directories precede their children, then resharded contiguously.
pub fn create(
    group: &Group,
    list: FileList,
    archive: &Path,
    cwd: &Path,
    opts: &ArchiveOpts,
) -> Result<()> {
    if opts.chunk_size == 0 {
        return Err(ArchiveError::Failed("chunk size must be nonzero"));
    }
    let started = Instant::now();
    if group.rank() == 0 {
        info!("Writing archive to {}", archive.display());
    }

    let list = FileList::sort_and_shard(group, list);
    list.log_summary(group);

    let mut scratch = vec![0u8; header::HEADER_BUF_SIZE];
    let layout = layout::plan(group, &list, cwd, opts.preserve, &mut scratch)?;

    index::write_index(group, archive, &layout.offsets)?;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o664)
        .open(archive);
    if !group.all_true(file.is_ok()) {
        return match file {
            Err(e) => Err(ArchiveError::io(e, archive)),
            Ok(_) => Err(ArchiveError::Failed("a rank could not open the archive")),
        };
    }
    let file = file.map_err(|e| ArchiveError::io(e, archive))?;

    let final_size = layout.archive_size + 2 * header::BLOCK_SIZE;
    let mut truncate_ok = true;
    if group.rank() == 0 {
        info!("Truncating archive");
        // truncate to zero first to drop any previous contents, then out to
        // the planned length so every positioned write lands in allocated
        // space
        match file.set_len(0).and_then(|()| file.set_len(final_size)) {
            Ok(()) => {
                if let Err(err) = fsx::preallocate(&file, final_size) {
                    debug!("preallocation not available for '{}': {}", archive.display(), err);
                }
            }
            Err(err) => {
                error!("truncating '{}': {}", archive.display(), err);
                truncate_ok = false;
            }
        }
    }
    if !group.all_true(truncate_ok) {
        return Err(ArchiveError::Failed("could not truncate and preallocate the archive"));
    }

    if group.rank() == 0 {
        info!("Writing entry headers");
    }
    let mut ok = write_headers(&list, &layout, &file, cwd, opts, &mut scratch);

    if group.rank() == 0 {
        info!("Copying file data");
    }
    let tracker = ProgressTracker::shared(group, ProgressKind::Pack);
    if group.rank() == 0 {
        tracker.set_totals(layout.total_bytes, layout.total_items);
    }
    group.barrier();
    let metrics = tracker.rank_metrics(group.rank());

    let mut iobuf = vec![0u8; opts.chunk_size as usize];
    pool::run(
        group,
        |queue| enqueue_copies(&list, &layout, opts, queue),
        |task: CopyTask, _queue| {
            if let Err(err) = copy_chunk(&task, &file, opts, &mut iobuf, &metrics) {
                error!(
                    "copying chunk {} of '{}': {}",
                    task.chunk_index,
                    task.src.display(),
                    err
                );
                ok = false;
            }
        },
        || tracker.maybe_emit(),
    );

    // rank 0 finishes the archive with two 512-byte zero blocks
    if group.rank() == 0 {
        if let Err(err) = file.write_all_at(&[ZERO_BLOCK, ZERO_BLOCK].concat(), layout.archive_size) {
            error!("writing archive trailer: {}", err);
            ok = false;
        }
    }
    drop(file);
    group.barrier();
    if group.rank() == 0 {
        tracker.emit_done();
    }

    let ok = group.all_true(ok);
    if group.rank() == 0 {
        let secs = started.elapsed().as_secs_f64();
        let (size_val, size_units) = progress::format_bytes(final_size as f64);
        let (rate_val, rate_units) =
            progress::format_bw(if secs > 0.0 { final_size as f64 / secs } else { 0.0 });
        info!("Seconds: {:.3}", secs);
        info!("Archive size: {:.3} {}", size_val, size_units);
        info!("Rate: {:.3} {} ({} bytes in {:.3} seconds)", rate_val, rate_units, final_size, secs);
    }
    if ok {
        Ok(())
    } else {
        Err(ArchiveError::Failed("archive create failed on one or more ranks"))
    }
}

/// Write this rank's headers at their planned offsets. Per-entry failures
/// are logged; the surviving entries are still written so the partial
/// archive remains inspectable.
fn write_headers(
    list: &FileList,
    layout: &Layout,
    file: &File,
    cwd: &Path,
    opts: &ArchiveOpts,
    scratch: &mut [u8],
) -> bool {
    let mut ok = true;
    for (i, entry) in list.entries.iter().enumerate() {
        if entry.etype == EntryType::Other {
            continue;
        }
        let encoded = relative_to(cwd, &entry.name)
            .and_then(|rel| header::encode(entry, &rel, opts.preserve, scratch));
        match encoded {
            Ok(n) => {
                debug_assert_eq!(n as u64, layout.header_sizes[i]);
                if let Err(err) = file.write_all_at(&scratch[..n], layout.offsets[i]) {
                    error!(
                        "writing header for '{}' at offset {}: {}",
                        entry.name.display(),
                        layout.offsets[i],
                        err
                    );
                    ok = false;
                }
            }
            Err(err) => {
                error!("encoding header for '{}': {}", entry.name.display(), err);
                ok = false;
            }
        }
    }
    ok
}

/// Emit `max(1, ceil(size / chunk_size))` copy items for every local
/// regular file.
fn enqueue_copies(
    list: &FileList,
    layout: &Layout,
    opts: &ArchiveOpts,
    queue: &pool::TaskQueue<CopyTask>,
) {
    for (i, entry) in list.entries.iter().enumerate() {
        if entry.etype != EntryType::Regular {
            continue;
        }
        let data_offset = layout.offsets[i] + layout.header_sizes[i];
        let num_chunks = entry.size / opts.chunk_size;
        for chunk_index in 0..num_chunks {
            queue.enqueue(CopyTask {
                src: entry.name.clone(),
                file_size: entry.size,
                chunk_index,
                data_offset,
            });
        }
        // trailing partial chunk, or the single item for an empty file
        if num_chunks * opts.chunk_size < entry.size || num_chunks == 0 {
            queue.enqueue(CopyTask {
                src: entry.name.clone(),
                file_size: entry.size,
                chunk_index: num_chunks,
                data_offset,
            });
        }
    }
}

/// Copy one chunk from the source file into its archive slot, and finish the
/// slot with zero padding when this is the file's last chunk.
fn copy_chunk(
    task: &CopyTask,
    archive: &File,
    opts: &ArchiveOpts,
    iobuf: &mut [u8],
    metrics: &RankMetrics,
) -> Result<()> {
    let src = File::open(&task.src).map_err(|e| ArchiveError::io(e, &task.src))?;

    let chunk_size = opts.chunk_size;
    let in_base = task.chunk_index * chunk_size;
    let out_base = task.data_offset + in_base;

    let mut total = 0u64;
    while total < chunk_size {
        let want = (chunk_size - total) as usize;
        let n = src
            .read_at(&mut iobuf[..want], in_base + total)
            .map_err(|e| ArchiveError::io(e, &task.src))?;
        if n == 0 {
            break;
        }
        archive
            .write_all_at(&iobuf[..n], out_base + total)
            .map_err(ArchiveError::from)?;
        total += n as u64;
        metrics.add_bytes(n as u64);
    }

    let num_chunks = task.file_size / chunk_size;
    let rem = task.file_size - num_chunks * chunk_size;
    let last_chunk = if task.file_size == 0 {
        0
    } else if rem > 0 {
        num_chunks
    } else {
        num_chunks - 1
    };
    if task.chunk_index == last_chunk {
        let pad = ((512 - task.file_size % 512) % 512) as usize;
        if pad > 0 {
            archive
                .write_all_at(&ZERO_BLOCK[..pad], task.data_offset + task.file_size)
                .map_err(ArchiveError::from)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm;
    use crate::flist::Entry;
    use std::sync::Mutex;

    fn regular(name: &str, size: u64) -> Entry {
        Entry {
            name: PathBuf::from(name),
            etype: EntryType::Regular,
            size,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            uname: String::new(),
            gname: String::new(),
            atime: 0,
            atime_nsec: 0,
            mtime: 0,
            mtime_nsec: 0,
            ctime: 0,
            ctime_nsec: 0,
            link_target: None,
            xattrs: Vec::new(),
        }
    }

    #[test]
    fn chunk_enumeration_matches_ceiling_rule() {
        // two 1 MiB files at 256 KiB chunks make eight items; a zero-byte
        // file still gets one
        let chunk = 256 * 1024;
        let opts = ArchiveOpts { chunk_size: chunk, ..Default::default() };
        let list = FileList {
            entries: vec![
                regular("/s/a", 1024 * 1024),
                regular("/s/b", 1024 * 1024),
                regular("/s/c", 0),
                regular("/s/d", chunk + 1),
            ],
        };
        let layout = Layout {
            header_sizes: vec![1536; 4],
            slot_sizes: vec![0; 4],
            offsets: vec![0, 10_000_000, 20_000_000, 30_000_000],
            archive_size: 0,
            total_bytes: 0,
            total_items: 4,
        };

        let seen = Mutex::new(Vec::new());
        let results = comm::spawn(1, |group| {
            pool::run(
                &group,
                |queue| enqueue_copies(&list, &layout, &opts, queue),
                |task: CopyTask, _q| seen.lock().unwrap().push((task.src.clone(), task.chunk_index)),
                || {},
            );
        });
        drop(results);

        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        let count = |p: &str| seen.iter().filter(|(src, _)| src == &PathBuf::from(p)).count();
        assert_eq!(count("/s/a"), 4);
        assert_eq!(count("/s/b"), 4);
        assert_eq!(count("/s/c"), 1);
        assert_eq!(count("/s/d"), 2);
        assert_eq!(seen.len(), 11);
    }

    #[test]
    fn work_item_ranges_are_disjoint() {
        let chunk = 1024u64;
        let opts = ArchiveOpts { chunk_size: chunk, ..Default::default() };
        let list = FileList {
            entries: vec![regular("/s/a", 3000), regular("/s/b", 2048)],
        };
        let layout = Layout {
            header_sizes: vec![1536, 1536],
            slot_sizes: vec![1536 + 3072, 1536 + 2048],
            offsets: vec![0, 1536 + 3072],
            archive_size: 1536 + 3072 + 1536 + 2048,
            total_bytes: 3072 + 2048,
            total_items: 2,
        };

        let ranges = Mutex::new(Vec::new());
        comm::spawn(1, |group| {
            pool::run(
                &group,
                |queue| enqueue_copies(&list, &layout, &opts, queue),
                |task: CopyTask, _q| {
                    let start = task.data_offset + task.chunk_index * chunk;
                    let len = (task.file_size - task.chunk_index * chunk).min(chunk);
                    ranges.lock().unwrap().push((start, start + len));
                },
                || {},
            );
        });

        let mut ranges = ranges.into_inner().unwrap();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlapping ranges {:?}", pair);
        }
    }
}
