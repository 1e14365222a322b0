//! Filesystem shim used throughout partar.
//!
//! Collects the Unix-specific syscalls the archiver needs (permission bits,
//! ownership, nanosecond timestamps, extent preallocation, extended
//! attributes, uid/gid name lookups) behind safe helpers so the rest of the
//! codebase stays free of `unsafe` and raw `libc` plumbing.

use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Restore POSIX mode bits on an extracted item.
pub fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// Change ownership without following symlinks.
pub fn lchown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))
}

fn to_cstring(path: &Path) -> io::Result<CString> {
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

/// Set access and modification times with nanosecond precision.
///
/// With `follow_symlinks` false the timestamps land on the link itself.
pub fn set_times(
    path: &Path,
    atime: (i64, u32),
    mtime: (i64, u32),
    follow_symlinks: bool,
) -> io::Result<()> {
    let cpath = to_cstring(path)?;
    let times = [
        libc::timespec { tv_sec: atime.0 as libc::time_t, tv_nsec: atime.1 as libc::c_long },
        libc::timespec { tv_sec: mtime.0 as libc::time_t, tv_nsec: mtime.1 as libc::c_long },
    ];
    let flags = if follow_symlinks { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), flags) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Preallocate the full extent of the archive file.
#[cfg(target_os = "linux")]
pub fn preallocate(file: &File, len: u64) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn preallocate(_file: &File, _len: u64) -> io::Result<()> {
    Ok(())
}

/// True when the path is readable by this process.
pub fn readable(path: &Path) -> bool {
    access(path, libc::R_OK)
}

/// True when the path is writable by this process.
pub fn writable(path: &Path) -> bool {
    access(path, libc::W_OK)
}

fn access(path: &Path, mode: libc::c_int) -> bool {
    match to_cstring(path) {
        Ok(cpath) => unsafe { libc::access(cpath.as_ptr(), mode) == 0 },
        Err(_) => false,
    }
}

/// Read all extended attributes from an inode.
pub fn read_xattrs(path: &Path) -> io::Result<Vec<(String, Vec<u8>)>> {
    let mut attrs = Vec::new();
    for name in xattr::list(path)? {
        if let Some(value) = xattr::get(path, &name)? {
            attrs.push((name.to_string_lossy().into_owned(), value));
        }
    }
    Ok(attrs)
}

/// Set one extended attribute on an extracted item.
pub fn set_xattr(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
    xattr::set(path, name, value)
}

/// Look up the user name for a uid, empty when unknown.
pub fn username(uid: u32) -> String {
    let mut buf = vec![0 as libc::c_char; 4096];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
    if rc == 0 && !result.is_null() {
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        return name.to_string_lossy().into_owned();
    }
    String::new()
}

/// Look up the group name for a gid, empty when unknown.
pub fn groupname(gid: u32) -> String {
    let mut buf = vec![0 as libc::c_char; 4096];
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();
    let rc = unsafe { libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result) };
    if rc == 0 && !result.is_null() {
        let name = unsafe { CStr::from_ptr(grp.gr_name) };
        return name.to_string_lossy().into_owned();
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_user_resolves() {
        let uid = unsafe { libc::getuid() };
        // Name may legitimately be empty in a bare chroot, but the call must
        // not crash and root must resolve on any normal system.
        let _ = username(uid);
        assert_eq!(username(0), "root");
    }

    #[test]
    fn set_and_read_times() {
        let dir = std::env::temp_dir();
        let path = dir.join("partar_fsx_times_test");
        std::fs::write(&path, b"x").unwrap();
        set_times(&path, (1_000_000, 0), (2_000_000, 500), true).unwrap();
        use std::os::unix::fs::MetadataExt;
        let md = std::fs::metadata(&path).unwrap();
        assert_eq!(md.mtime(), 2_000_000);
        let _ = std::fs::remove_file(&path);
    }
}
