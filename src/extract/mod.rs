//! Parallel archive extractor.
//!
//! Extraction is index-driven when it can be: the `.idx` sidecar (or, failing
//! that, a one-rank scan of the archive) yields the absolute offset of every
//! entry header, each rank takes a contiguous range of entries and seeks
//! straight to them with a private file descriptor. When no offsets are
//! obtainable at all (a compressed archive, say) every rank streams the whole
//! archive and keeps the entries whose index matches its round-robin stride.
//!
//! Directories are created everywhere before any file is written, and their
//! timestamps are reapplied after all ranks finish, since extracting children
//! bumps parent mtimes.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::comm::Group;
use crate::common::ArchiveOpts;
use crate::error::{ArchiveError, Result};
use crate::flist::{self, Entry, EntryType, FileList};
use crate::fsx;
use crate::header;
use crate::index;
use crate::layout::round_up_512;
use crate::progress::{self, ProgressKind, ProgressTracker, RankMetrics};

/// Extract `archive` into `dest`.
pub fn extract(group: &Group, archive: &Path, dest: &Path, opts: &ArchiveOpts) -> Result<()> {
    if opts.block_size == 0 {
        return Err(ArchiveError::Failed("block size must be nonzero"));
    }
    let started = Instant::now();
    if group.rank() == 0 {
        info!("Extracting {}", archive.display());
    }

    // offset acquisition: sidecar index, then a scan, then give up and stride
    let mut have_index = true;
    let mut have_offsets = true;
    let mut offsets: Vec<u64> = Vec::new();
    match index::read_index(group, archive) {
        Ok(offs) => offsets = offs,
        Err(ArchiveError::MissingIndex) => {
            have_index = false;
            match scan_offsets(group, archive) {
                Ok(offs) => offsets = offs,
                Err(err) => {
                    have_offsets = false;
                    if group.rank() == 0 {
                        warn!("{}; falling back to streaming extraction", err);
                    }
                }
            }
        }
        Err(err) => return Err(err),
    }

    let entries = offsets.len() as u64;
    let (entry_start, entry_count) =
        flist::partition(entries, group.size() as u64, group.rank() as u64);

    if group.rank() == 0 {
        info!("Extracting metadata");
    }
    let list = if have_offsets {
        build_flist_offsets(group, archive, dest, entry_start, entry_count, &offsets)?
    } else {
        build_flist_stride(group, archive, dest)?
    };

    let total_bytes = list.sum_bytes(group);
    let total_items = list.global_size(group);
    list.log_summary(group);

    let tracker = ProgressTracker::shared(group, ProgressKind::Extract);
    if group.rank() == 0 {
        tracker.set_totals(total_bytes, total_items);
    }
    group.barrier();
    let metrics = tracker.rank_metrics(group.rank());

    // all directories exist before any rank writes a file into one
    if group.rank() == 0 {
        info!("Creating directories");
    }
    list.mkdirs(group)?;

    if group.rank() == 0 {
        info!("Extracting items");
    }
    let mut buf = vec![0u8; opts.block_size as usize];
    let mut ok = if have_offsets {
        extract_entries_offsets(
            archive,
            dest,
            entry_start,
            entry_count,
            &offsets,
            opts,
            &metrics,
            &tracker,
            &mut buf,
        )
    } else {
        extract_entries_stride(group, archive, dest, opts, &metrics, &tracker, &mut buf)
    };
    if group.rank() == 0 {
        tracker.emit_done();
    }

    // children of every rank must exist before directory metadata is
    // reapplied
    group.barrier();
    if !list.apply_dir_metadata() {
        ok = false;
    }
    group.barrier();

    // keep the scan's work for the next extraction
    if have_offsets && !have_index {
        let shard = &offsets[entry_start as usize..(entry_start + entry_count) as usize];
        if let Err(err) = index::write_index(group, archive, shard) {
            if group.rank() == 0 {
                warn!("saving scanned index: {}", err);
            }
        }
    }

    let sums = group.allreduce_sum2([metrics.bytes(), metrics.items()]);
    let ok = group.all_true(ok);
    if group.rank() == 0 {
        let secs = started.elapsed().as_secs_f64();
        let (bytes_val, bytes_units) = progress::format_bytes(sums[0] as f64);
        let rate = if secs > 0.0 { sums[0] as f64 / secs } else { 0.0 };
        let (rate_val, rate_units) = progress::format_bw(rate);
        info!("Seconds: {:.3}", secs);
        info!("Items: {}", sums[1]);
        info!("Data: {:.3} {} ({} bytes)", bytes_val, bytes_units, sums[0]);
        info!("Rate: {:.3} {} ({} bytes in {:.3} seconds)", rate_val, rate_units, sums[0], secs);
    }
    if ok {
        Ok(())
    } else {
        Err(ArchiveError::Failed("extraction failed on one or more ranks"))
    }
}

/// Print the archive's entries without extracting anything.
pub fn list(archive: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|e| ArchiveError::io(e, archive))?;
    let mut ar = tar::Archive::new(BufReader::new(file));
    let entries = ar
        .entries()
        .map_err(|e| ArchiveError::Unsupported(format!("cannot read '{}': {}", archive.display(), e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ArchiveError::Format(format!("reading entry: {}", e)))?;
        let meta = header::entry_meta(&mut entry)?;
        let tchar = match meta.etype {
            EntryType::Regular => '-',
            EntryType::Directory => 'd',
            EntryType::Symlink => 'l',
            EntryType::Other => '?',
        };
        match &meta.link_target {
            Some(target) => println!(
                "{} {:>9} {:>11} {} -> {}",
                tchar,
                meta.size,
                meta.mtime,
                meta.name.display(),
                target.display()
            ),
            None => println!("{} {:>9} {:>11} {}", tchar, meta.size, meta.mtime, meta.name.display()),
        }
    }
    Ok(())
}

/// Rank 0 walks the archive's headers and broadcasts the offset of each
/// entry. Fails on anything that is not a plain uncompressed tar stream.
fn scan_offsets(group: &Group, archive: &Path) -> Result<Vec<u64>> {
    if group.rank() == 0 {
        info!("Indexing archive");
    }
    let scanned: Option<Result<Vec<u64>>> =
        if group.rank() == 0 { Some(scan_archive(archive)) } else { None };

    let ok = group.broadcast(
        scanned.as_ref().map(|r| r.is_ok()),
        0,
    );
    if !ok {
        return match scanned {
            Some(Err(err)) => Err(err),
            _ => Err(ArchiveError::Unsupported("archive cannot be indexed".to_string())),
        };
    }
    Ok(group.broadcast(scanned.map(|r| r.expect("checked on root")), 0))
}

fn scan_archive(archive: &Path) -> Result<Vec<u64>> {
    // file size only drives progress percentages; a failed stat just
    // disables them
    let filesize = match fs::metadata(archive) {
        Ok(md) => md.len(),
        Err(err) => {
            error!("Failed to stat archive '{}': {}", archive.display(), err);
            0
        }
    };

    let file = File::open(archive).map_err(|e| ArchiveError::io(e, archive))?;
    let mut ar = tar::Archive::new(BufReader::with_capacity(10240, file));
    let entries = ar
        .entries()
        .map_err(|e| ArchiveError::Unsupported(format!("cannot read '{}': {}", archive.display(), e)))?;

    let interval = progress::interval_from_env();
    let start = Instant::now();
    let mut last = start;
    let mut offsets: Vec<u64> = Vec::with_capacity(1024);
    let mut pos = 0u64;
    for entry in entries {
        let entry = entry.map_err(|e| {
            ArchiveError::Unsupported(format!("cannot index '{}': {}", archive.display(), e))
        })?;
        // this entry's slot began where the previous one's padded data ended
        offsets.push(pos);
        pos = round_up_512(entry.raw_file_position() + entry.size());

        if let Some(interval) = interval {
            let now = Instant::now();
            if filesize > 0 && now.duration_since(last) >= interval {
                let percent = pos as f64 * 100.0 / filesize as f64;
                let secs = now.duration_since(start).as_secs_f64();
                let secs_left = if percent > 0.0 { (100.0 - percent) * secs / percent } else { 0.0 };
                info!(
                    "Indexed {} items in {:.3} secs ({:.0}%) {:.0} secs left ...",
                    offsets.len(),
                    secs,
                    percent,
                    secs_left
                );
                last = now;
            }
        }
    }
    if let Some(interval) = interval {
        let secs = start.elapsed().as_secs_f64();
        if secs > interval.as_secs_f64() {
            info!("Indexed {} items in {:.3} secs (100%) done", offsets.len(), secs);
        }
    }
    Ok(offsets)
}

/// Decode this rank's contiguous range of entry headers into a file-list
/// shard, seeking straight to each header with a fresh single-entry reader.
fn build_flist_offsets(
    group: &Group,
    archive: &Path,
    dest: &Path,
    entry_start: u64,
    entry_count: u64,
    offsets: &[u64],
) -> Result<FileList> {
    let file = File::open(archive).map_err(|e| ArchiveError::io(e, archive));
    if !group.all_true(file.is_ok()) {
        return match file {
            Err(err) => Err(err),
            Ok(_) => Err(ArchiveError::Failed("a rank could not open the archive")),
        };
    }
    let mut file = file.expect("checked above");

    let mut ok = true;
    let mut entries = Vec::with_capacity(entry_count as usize);
    for k in 0..entry_count {
        let idx = (entry_start + k) as usize;
        match decode_meta_at(&mut file, offsets[idx], dest) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                error!("reading entry {} at offset {}: {}", idx, offsets[idx], err);
                ok = false;
                break;
            }
        }
    }

    if group.all_true(ok) {
        Ok(FileList { entries })
    } else {
        Err(ArchiveError::Failed("metadata extraction failed"))
    }
}

/// Without offsets every rank reads every header and keeps its stride.
fn build_flist_stride(group: &Group, archive: &Path, dest: &Path) -> Result<FileList> {
    let attempt = (|| -> Result<Vec<Entry>> {
        let file = File::open(archive).map_err(|e| ArchiveError::io(e, archive))?;
        let mut ar = tar::Archive::new(BufReader::new(file));
        let iter = ar.entries().map_err(|e| {
            ArchiveError::Unsupported(format!("cannot read '{}': {}", archive.display(), e))
        })?;
        let mut out = Vec::new();
        for (count, entry) in iter.enumerate() {
            let mut entry =
                entry.map_err(|e| ArchiveError::Format(format!("reading entry {}: {}", count, e)))?;
            if count % group.size() != group.rank() {
                continue;
            }
            let mut meta = header::entry_meta(&mut entry)?;
            meta.name = flist::resolve_under(dest, &meta.name)?;
            out.push(meta);
        }
        Ok(out)
    })();

    if let Err(err) = &attempt {
        error!("extracting metadata: {}", err);
    }
    match (group.all_true(attempt.is_ok()), attempt) {
        (true, Ok(entries)) => Ok(FileList { entries }),
        (_, Err(err)) => Err(err),
        (false, Ok(_)) => Err(ArchiveError::Failed("metadata extraction failed")),
    }
}

fn decode_meta_at(file: &mut File, offset: u64, dest: &Path) -> Result<Entry> {
    file.seek(SeekFrom::Start(offset)).map_err(ArchiveError::from)?;
    let mut ar = tar::Archive::new(&mut *file);
    let mut iter = ar
        .entries()
        .map_err(|e| ArchiveError::Format(format!("opening entry reader: {}", e)))?;
    let mut entry = match iter.next() {
        Some(Ok(entry)) => entry,
        Some(Err(e)) => return Err(ArchiveError::Format(format!("decoding header: {}", e))),
        None => return Err(ArchiveError::Format("unexpected end of archive".to_string())),
    };
    let mut meta = header::entry_meta(&mut entry)?;
    meta.name = flist::resolve_under(dest, &meta.name)?;
    Ok(meta)
}

#[allow(clippy::too_many_arguments)]
fn extract_entries_offsets(
    archive: &Path,
    dest: &Path,
    entry_start: u64,
    entry_count: u64,
    offsets: &[u64],
    opts: &ArchiveOpts,
    metrics: &RankMetrics,
    tracker: &ProgressTracker,
    buf: &mut [u8],
) -> bool {
    let mut file = match File::open(archive) {
        Ok(file) => file,
        Err(err) => {
            error!("Failed to open archive '{}': {}", archive.display(), err);
            return false;
        }
    };

    let mut ok = true;
    for k in 0..entry_count {
        let idx = (entry_start + k) as usize;
        if let Err(err) = extract_one_at(&mut file, offsets[idx], dest, opts, metrics, tracker, buf)
        {
            error!("extracting entry {} at offset {}: {}", idx, offsets[idx], err);
            ok = false;
        }
        metrics.add_items(1);
        tracker.maybe_emit();
    }
    ok
}

fn extract_one_at(
    file: &mut File,
    offset: u64,
    dest: &Path,
    opts: &ArchiveOpts,
    metrics: &RankMetrics,
    tracker: &ProgressTracker,
    buf: &mut [u8],
) -> Result<()> {
    file.seek(SeekFrom::Start(offset)).map_err(ArchiveError::from)?;
    // a fresh reader per entry: its state never outlives one header+payload
    let mut ar = tar::Archive::new(&mut *file);
    let mut iter = ar
        .entries()
        .map_err(|e| ArchiveError::Format(format!("opening entry reader: {}", e)))?;
    let mut entry = match iter.next() {
        Some(Ok(entry)) => entry,
        Some(Err(e)) => return Err(ArchiveError::Format(format!("decoding header: {}", e))),
        None => return Err(ArchiveError::Format("unexpected end of archive".to_string())),
    };
    let meta = header::entry_meta(&mut entry)?;
    let target = flist::resolve_under(dest, &meta.name)?;
    materialize(&mut entry, &meta, &target, opts, metrics, tracker, buf)
}

fn extract_entries_stride(
    group: &Group,
    archive: &Path,
    dest: &Path,
    opts: &ArchiveOpts,
    metrics: &RankMetrics,
    tracker: &ProgressTracker,
    buf: &mut [u8],
) -> bool {
    let file = match File::open(archive) {
        Ok(file) => file,
        Err(err) => {
            error!("Failed to open archive '{}': {}", archive.display(), err);
            return false;
        }
    };
    let mut ar = tar::Archive::new(BufReader::new(file));
    let entries = match ar.entries() {
        Ok(entries) => entries,
        Err(err) => {
            error!("cannot read '{}': {}", archive.display(), err);
            return false;
        }
    };

    let mut ok = true;
    for (count, entry) in entries.enumerate() {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                // the stream is unusable past a framing error
                error!("reading entry {}: {}", count, err);
                return false;
            }
        };
        if count % group.size() != group.rank() {
            continue;
        }
        let step = (|| -> Result<()> {
            let meta = header::entry_meta(&mut entry)?;
            let target = flist::resolve_under(dest, &meta.name)?;
            materialize(&mut entry, &meta, &target, opts, metrics, tracker, buf)
        })();
        if let Err(err) = step {
            error!("extracting entry {}: {}", count, err);
            ok = false;
        }
        metrics.add_items(1);
        tracker.maybe_emit();
    }
    ok
}

/// Create one decoded entry on disk and apply its attributes.
fn materialize<R: Read>(
    reader: &mut tar::Entry<'_, R>,
    meta: &Entry,
    target: &Path,
    opts: &ArchiveOpts,
    metrics: &RankMetrics,
    tracker: &ProgressTracker,
    buf: &mut [u8],
) -> Result<()> {
    match meta.etype {
        EntryType::Directory => {
            fs::create_dir_all(target).map_err(|e| ArchiveError::io(e, target))?;
        }
        EntryType::Regular => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| ArchiveError::io(e, parent))?;
            }
            // replace rather than rewrite, so a read-only leftover cannot
            // block extraction
            let _ = fs::remove_file(target);
            let mut out = File::create(target).map_err(|e| ArchiveError::io(e, target))?;
            loop {
                let n = reader.read(buf).map_err(ArchiveError::from)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).map_err(|e| ArchiveError::io(e, target))?;
                metrics.add_bytes(n as u64);
                tracker.maybe_emit();
            }
        }
        EntryType::Symlink => {
            let link = meta
                .link_target
                .as_ref()
                .ok_or_else(|| ArchiveError::Format(format!("symlink '{}' has no target", meta.name.display())))?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| ArchiveError::io(e, parent))?;
            }
            let _ = fs::remove_file(target);
            std::os::unix::fs::symlink(link, target).map_err(|e| ArchiveError::io(e, target))?;
        }
        EntryType::Other => {
            debug!("skipping unsupported entry type for '{}'", meta.name.display());
            return Ok(());
        }
    }

    // directory modes wait for the fix-up pass: a restrictive mode applied
    // now could lock out a rank still extracting children into it
    if meta.etype == EntryType::Regular {
        fsx::set_unix_permissions(target, meta.mode & 0o7777)
            .map_err(|e| ArchiveError::io(e, target))?;
    }
    // unprivileged extraction cannot restore foreign owners; that is routine
    if let Err(err) = fsx::lchown(target, meta.uid as u32, meta.gid as u32) {
        debug!("chown '{}': {}", target.display(), err);
    }
    if opts.preserve {
        for (name, value) in &meta.xattrs {
            if let Err(err) = fsx::set_xattr(target, name, value) {
                warn!("setting xattr '{}' on '{}': {}", name, target.display(), err);
            }
        }
    }
    match meta.etype {
        EntryType::Regular => {
            if let Err(err) = fsx::set_times(
                target,
                (meta.atime, meta.atime_nsec),
                (meta.mtime, meta.mtime_nsec),
                true,
            ) {
                warn!("setting times on '{}': {}", target.display(), err);
            }
        }
        EntryType::Symlink => {
            if let Err(err) = fsx::set_times(
                target,
                (meta.atime, meta.atime_nsec),
                (meta.mtime, meta.mtime_nsec),
                false,
            ) {
                warn!("setting times on '{}': {}", target.display(), err);
            }
        }
        // directory timestamps are reapplied after all ranks finish
        EntryType::Directory | EntryType::Other => {}
    }
    Ok(())
}
