//! Path handling shared by the client, the TOC and the server.
//!
//! Protocol paths are canonical relative strings: forward slashes, no empty or
//! `.` components, no leading or trailing slash. Every comparison happens on
//! this form.

use anyhow::{anyhow, bail, Result};
use std::path::{Component, Path, PathBuf};

/// Directories that only ever live on the client. Never fetched remotely.
const LOCAL_ONLY_COMPONENTS: &[&str] = &["binaries", "intermediate"];
const LOCAL_ONLY_SAVED: &[&str] = &["logs", "config", "sandboxes"];

/// Extensions the server may produce on demand even if its TOC does not list them yet.
const COOKABLE_EXTENSIONS: &[&str] = &[
    "uasset", "umap", "uexp", "ubulk", "uptnl", "ufont", "bnk", "mp4", "bk2",
];

/// Extensions that map to loadable package names.
const PACKAGE_EXTENSIONS: &[&str] = &["uasset", "umap"];

/// Companions a server sends along with a requested package.
pub const COMPANION_EXTENSIONS: &[&str] = &["uexp", "ubulk", "uptnl"];

/// Canonical relative form of `path`.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(p) if *p != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Parent directory of a normalized path ("" for top-level entries).
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

pub fn extension(path: &str) -> Option<String> {
    let name = file_name(path);
    let dot = name.rfind('.')?;
    if dot == 0 {
        return None;
    }
    Some(name[dot + 1..].to_ascii_lowercase())
}

/// Path with its extension replaced.
pub fn with_extension(path: &str, ext: &str) -> String {
    let name = file_name(path);
    let stem_len = match name.rfind('.') {
        Some(dot) if dot > 0 => path.len() - (name.len() - dot),
        _ => path.len(),
    };
    format!("{}.{}", &path[..stem_len], ext)
}

/// Build output, logs and local config never route through the network.
pub fn is_local_only(path: &str) -> bool {
    let normalized = normalize_path(path).to_ascii_lowercase();
    let parts: Vec<&str> = normalized.split('/').collect();
    for (i, part) in parts.iter().enumerate() {
        if LOCAL_ONLY_COMPONENTS.contains(part) {
            return true;
        }
        if *part == "saved" {
            if let Some(next) = parts.get(i + 1) {
                if LOCAL_ONLY_SAVED.contains(next) {
                    return true;
                }
            }
        }
    }
    false
}

/// A normalized path that climbs above its root.
pub fn escapes_root(path: &str) -> bool {
    path == ".." || path.starts_with("../")
}

pub fn is_cookable(path: &str) -> bool {
    extension(path).is_some_and(|ext| COOKABLE_EXTENSIONS.contains(&ext.as_str()))
}

/// Loadable package name for a content path, e.g.
/// `MyGame/Content/Maps/level.umap` -> `/Game/Maps/level`.
pub fn package_name(path: &str) -> Option<String> {
    let normalized = normalize_path(path);
    let ext = extension(&normalized)?;
    if !PACKAGE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    let stem = &normalized[..normalized.len() - ext.len() - 1];
    if let Some(rest) = stem.strip_prefix("Engine/Content/") {
        return Some(format!("/Engine/{}", rest));
    }
    if let Some(rest) = stem.strip_prefix("Content/") {
        return Some(format!("/Game/{}", rest));
    }
    stem.find("/Content/")
        .map(|i| format!("/Game/{}", &stem[i + "/Content/".len()..]))
}

/// Normalize a protocol path to be safely under a root directory.
/// Rejects absolute paths, parent components, NUL bytes, and anything that
/// resolves outside `root`.
pub fn normalize_under_root(root: &Path, p: &str) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in Path::new(&p.replace('\\', "/")).components() {
        match component {
            CurDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    bail!("path component contains colon");
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }

    let joined = root.join(&safe);

    // Resolve symlinks on whatever part of the path already exists
    let final_path = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| anyhow!("failed to canonicalize {:?}: {}", joined, e))?
    } else {
        match (joined.parent(), joined.file_name()) {
            (Some(parent), Some(name)) if parent.exists() => parent
                .canonicalize()
                .map_err(|e| anyhow!("failed to canonicalize parent {:?}: {}", parent, e))?
                .join(name),
            _ => joined,
        }
    };

    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    if !final_path.starts_with(&canonical_root) && !final_path.starts_with(root) {
        bail!("path {:?} escapes root {:?}", p, root);
    }

    Ok(final_path)
}

/// Protocol path of `abs` relative to `root`.
pub fn relative_to(root: &Path, abs: &Path) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?;
    let s = rel.to_string_lossy();
    Some(normalize_path(&s))
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
