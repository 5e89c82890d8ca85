//! Cross-platform filesystem helpers.
//!
//! On Unix the original permission bits are captured into each entry header
//! and restored on extraction. On Windows the bits are not representable, so
//! capture returns `None` and restore is a no-op; call-sites stay identical
//! across OSes.

use std::fs::Metadata;
use std::io;
use std::path::Path;

#[cfg(unix)]
/// Permission bits of `meta`, masked to the tar-representable range.
pub fn maybe_unix_mode(meta: &Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub fn maybe_unix_mode(_meta: &Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
/// Set POSIX permission bits on Unix.
pub fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
/// No-op on Windows: POSIX permission bits are not preserved.
pub fn set_unix_permissions(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
