//! Local mirror of cooked files: synced writes, version stamp and reconciliation scans.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tempfile::NamedTempFile;
use tracing::{debug, error};
use walkdir::WalkDir;

use crate::error::{NetError, NetResult};
use crate::paths::{ensure_parent_exists, is_local_only, normalize_path, relative_to};
use crate::protocol::WRITE_CHUNK_SIZE;

/// Where the cooked/licensee versions of the local cache are persisted.
pub const VERSION_STAMP_PATH: &str = "Saved/Config/CookedVersion.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionStamp {
    pub cooked: i32,
    pub licensee: i32,
}

pub fn local_path(root: &Path, rel: &str) -> PathBuf {
    root.join(normalize_path(rel))
}

pub fn millis_to_filetime(ms: i64) -> FileTime {
    FileTime::from_unix_time(ms.div_euclid(1000), (ms.rem_euclid(1000) * 1_000_000) as u32)
}

pub fn filetime_to_millis(t: FileTime) -> i64 {
    t.unix_seconds() * 1000 + i64::from(t.nanoseconds() / 1_000_000)
}

/// Modification time in unix milliseconds.
pub fn local_millis(path: &Path) -> io::Result<i64> {
    let meta = fs::metadata(path)?;
    Ok(filetime_to_millis(FileTime::from_last_modification_time(&meta)))
}

pub fn clear_read_only(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    if !perms.readonly() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() | 0o200);
    }
    #[cfg(not(unix))]
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    fs::set_permissions(path, perms)
}

pub fn set_read_only(path: &Path, read_only: bool) -> io::Result<()> {
    if !read_only {
        return clear_read_only(path);
    }
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

/// Delete a file, clearing read-only first. Missing files are fine.
pub fn remove_file(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => {
            let _ = clear_read_only(path);
            fs::remove_file(path)?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Write server content for `rel` under `root` with the server's timestamp.
///
/// The payload goes to a temp file next to the destination and is renamed over
/// it, so readers never observe a partial file. A size or timestamp that does
/// not stick is a consistency failure and returns [`NetError::Fatal`].
pub fn write_synced_file(root: &Path, rel: &str, contents: &[u8], server_millis: i64) -> NetResult<()> {
    let dest = local_path(root, rel);
    remove_file(&dest)?;
    ensure_parent_exists(&dest)?;
    let parent = dest.parent().unwrap_or(root);

    let mut tmp = NamedTempFile::new_in(parent)?;
    for chunk in contents.chunks(WRITE_CHUNK_SIZE) {
        tmp.write_all(chunk)?;
    }
    tmp.flush()?;

    check_written_size(rel, tmp.as_file().metadata()?.len(), contents.len() as u64)?;
    tmp.persist(&dest).map_err(|e| NetError::Io(e.error))?;

    filetime::set_file_mtime(&dest, millis_to_filetime(server_millis))?;
    check_applied_mtime(rel, local_millis(&dest)?, server_millis)?;
    debug!(path = rel, bytes = contents.len(), "synced file written");
    Ok(())
}

/// Bytes on disk must equal the bytes received.
pub fn check_written_size(rel: &str, written: u64, expected: u64) -> NetResult<()> {
    if written == expected {
        return Ok(());
    }
    error!(path = rel, written, expected, "temp file truncated");
    Err(NetError::Fatal(format!(
        "{}: temp file has {} bytes, expected {}",
        rel, written, expected
    )))
}

/// The mtime read back must be exactly the server's.
pub fn check_applied_mtime(rel: &str, applied: i64, server_millis: i64) -> NetResult<()> {
    if applied == server_millis {
        return Ok(());
    }
    error!(path = rel, applied, server_millis, "timestamp did not apply");
    Err(NetError::Fatal(format!(
        "{}: timestamp {} did not apply (file has {})",
        rel, server_millis, applied
    )))
}

pub fn read_version_stamp(root: &Path) -> io::Result<Option<VersionStamp>> {
    let path = root.join(VERSION_STAMP_PATH);
    let mut f = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut raw = [0u8; 8];
    if f.read_exact(&mut raw).is_err() {
        // Short or garbled stamp counts as no stamp
        return Ok(None);
    }
    Ok(Some(VersionStamp {
        cooked: i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        licensee: i32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
    }))
}

pub fn write_version_stamp(root: &Path, stamp: VersionStamp) -> io::Result<()> {
    let path = root.join(VERSION_STAMP_PATH);
    ensure_parent_exists(&path)?;
    let mut raw = Vec::with_capacity(8);
    raw.extend_from_slice(&stamp.cooked.to_le_bytes());
    raw.extend_from_slice(&stamp.licensee.to_le_bytes());
    fs::write(path, raw)
}

/// Every mirrored file under `root` (local-only trees excluded) with its mtime.
pub fn scan_local_files(root: &Path) -> Vec<(String, i64)> {
    let mut out = Vec::new();
    if !root.exists() {
        return out;
    }
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_to(root, entry.path()) else {
            continue;
        };
        if is_local_only(&rel) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        out.push((rel, filetime_to_millis(FileTime::from_last_modification_time(&meta))));
    }
    out
}

/// Remove every mirrored file and the directories left empty. Local-only trees survive.
pub fn wipe(root: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for (rel, _) in scan_local_files(root) {
        if remove_file(&local_path(root, &rel))? {
            removed += 1;
        }
    }
    // Children before parents
    let mut dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    dirs.retain(|d| relative_to(root, d).is_some_and(|rel| !is_local_only(&rel)));
    for dir in dirs {
        // Non-empty (holds local-only content) is expected
        let _ = fs::remove_dir(&dir);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn synced_write_applies_content_and_timestamp() {
        let dir = TempDir::new().unwrap();
        let contents: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        write_synced_file(dir.path(), "Content/Maps/level.umap", &contents, 1_700_000_000_123).unwrap();

        let path = dir.path().join("Content/Maps/level.umap");
        assert_eq!(fs::read(&path).unwrap(), contents);
        assert_eq!(local_millis(&path).unwrap(), 1_700_000_000_123);
        // No temp files left behind
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn synced_write_replaces_read_only_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Config/BaseEngine.ini");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"stale").unwrap();
        set_read_only(&path, true).unwrap();

        write_synced_file(dir.path(), "Config/BaseEngine.ini", b"[Core]\n", 1_600_000_000_000).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"[Core]\n");
    }

    #[test]
    fn size_or_timestamp_drift_is_fatal() {
        assert!(check_written_size("Content/a.uasset", 10, 10).is_ok());
        let err = check_written_size("Content/a.uasset", 4096, 10_000).unwrap_err();
        assert!(matches!(err, NetError::Fatal(ref m) if m.contains("4096")));
        assert!(err.is_fatal());

        assert!(check_applied_mtime("Content/a.uasset", 1_700_000_000_123, 1_700_000_000_123).is_ok());
        // Filesystems with second granularity drop the millis
        let err = check_applied_mtime("Content/a.uasset", 1_700_000_000_000, 1_700_000_000_123).unwrap_err();
        assert!(matches!(err, NetError::Fatal(ref m) if m.contains("did not apply")));
    }

    #[test]
    fn version_stamp_is_two_le_i32() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_version_stamp(dir.path()).unwrap(), None);
        let stamp = VersionStamp { cooked: 100, licensee: 5 };
        write_version_stamp(dir.path(), stamp).unwrap();
        let raw = fs::read(dir.path().join(VERSION_STAMP_PATH)).unwrap();
        assert_eq!(raw, vec![100, 0, 0, 0, 5, 0, 0, 0]);
        assert_eq!(read_version_stamp(dir.path()).unwrap(), Some(stamp));
    }

    #[test]
    fn truncated_stamp_reads_as_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(VERSION_STAMP_PATH);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, [1, 2, 3]).unwrap();
        assert_eq!(read_version_stamp(dir.path()).unwrap(), None);
    }

    #[test]
    fn wipe_keeps_local_only_trees() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for rel in ["Content/a.uasset", "Content/Sub/b.uasset", "Saved/Logs/game.log"] {
            let p = root.join(rel);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, b"x").unwrap();
        }
        write_version_stamp(root, VersionStamp { cooked: 1, licensee: 1 }).unwrap();

        assert_eq!(wipe(root).unwrap(), 2);
        assert!(!root.join("Content").exists());
        assert!(root.join("Saved/Logs/game.log").exists());
        assert!(root.join(VERSION_STAMP_PATH).exists());
    }

    #[test]
    fn scan_skips_local_only() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Binaries")).unwrap();
        fs::write(root.join("Binaries/game"), b"elf").unwrap();
        fs::create_dir_all(root.join("Content")).unwrap();
        fs::write(root.join("Content/a.uasset"), b"x").unwrap();
        filetime::set_file_mtime(root.join("Content/a.uasset"), millis_to_filetime(5_000)).unwrap();

        let files = scan_local_files(root);
        assert_eq!(files, vec![("Content/a.uasset".to_string(), 5_000)]);
    }

    #[test]
    fn millis_conversion_handles_negative_times() {
        let t = millis_to_filetime(-1);
        assert_eq!(t.unix_seconds(), -1);
        assert_eq!(t.nanoseconds(), 999_000_000);
        assert_eq!(filetime_to_millis(t), -1);
    }
}
