//! Index sidecar store.
//!
//! `<archive>.idx` holds one big-endian u64 per entry: the absolute byte
//! offset of that entry's header in the archive, in archive order. Each rank
//! contributes its shard with a single positioned write; the whole file is
//! `8 * total_items` bytes. A missing or odd-sized sidecar is reported as
//! `MissingIndex` so extraction can fall back to scanning.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use log::{debug, error, info};

use crate::comm::Group;
use crate::error::{ArchiveError, Result};

/// Path of the sidecar next to the archive.
pub fn index_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".idx");
    PathBuf::from(name)
}

/// Write each rank's entry offsets into the sidecar.
///
/// Rank 0 recreates the file, a barrier releases the others to open it, and
/// every rank issues one `pwrite` at its prefix-count position.
pub fn write_index(group: &Group, archive: &Path, offsets: &[u64]) -> Result<()> {
    let name = index_path(archive);
    if group.rank() == 0 {
        debug!("Writing index to {}", name.display());
    }

    let count = offsets.len() as u64;
    let rank_offset = group.exclusive_prefix_sum(count);

    let file = if group.rank() == 0 {
        let _ = fs::remove_file(&name);
        let opened = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o660)
            .open(&name);
        group.barrier();
        opened
    } else {
        group.barrier();
        OpenOptions::new().write(true).open(&name)
    };

    let mut success = true;
    match file {
        Ok(file) => {
            let mut packed = Vec::with_capacity(offsets.len() * 8);
            for offset in offsets {
                packed.extend_from_slice(&offset.to_be_bytes());
            }
            if let Err(err) = file.write_all_at(&packed, rank_offset * 8) {
                error!("writing index '{}': {}", name.display(), err);
                success = false;
            }
        }
        Err(err) => {
            error!("opening index '{}': {}", name.display(), err);
            success = false;
        }
    }

    if group.all_true(success) {
        Ok(())
    } else {
        Err(ArchiveError::Failed("index write failed"))
    }
}

/// Load the sidecar and broadcast the offset array to every rank.
pub fn read_index(group: &Group, archive: &Path) -> Result<Vec<u64>> {
    let name = index_path(archive);

    let loaded: Option<Vec<u64>> = if group.rank() == 0 {
        load_offsets(&name)
    } else {
        None
    };

    let have = group.broadcast(
        if group.rank() == 0 { Some(loaded.is_some()) } else { None },
        0,
    );
    if !have {
        return Err(ArchiveError::MissingIndex);
    }

    let offsets = group.broadcast(loaded, 0);
    if group.rank() == 0 {
        info!("Read index {}", name.display());
    }
    Ok(offsets)
}

fn load_offsets(name: &Path) -> Option<Vec<u64>> {
    let md = fs::metadata(name).ok()?;
    if md.len() % 8 != 0 {
        return None;
    }
    let data = fs::read(name).ok()?;
    if data.len() as u64 != md.len() {
        return None;
    }
    let mut offsets = Vec::with_capacity(data.len() / 8);
    for chunk in data.chunks_exact(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        offsets.push(u64::from_be_bytes(raw));
    }
    Some(offsets)
}
