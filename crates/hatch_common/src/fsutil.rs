//! Filesystem helpers
//!
//! Atomic file replacement, tree copies and tree digests. Persisted state
//! is only ever written through [`atomic_write`] so a reader never sees a
//! torn file.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{HatchError, IoContext, Result};

/// Write data to a file atomically using temp file + rename.
///
/// The temp file gets a unique name in the target's directory, so
/// concurrent writers never share an inode and the last rename wins whole.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).at(parent)?;

    let prefix = path
        .file_name()
        .map(|n| format!(".{}.", n.to_string_lossy()))
        .unwrap_or_else(|| ".".to_string());
    let mut temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent)
        .at(parent)?;
    temp.write_all(data).at(temp.path())?;
    temp.as_file().sync_all().at(temp.path())?;

    temp.persist(path).map_err(|e| HatchError::io(path, e.error))?;
    Ok(())
}

/// SHA256 of a single file, hex encoded
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).at(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer).at(path)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Per-file checksums of a tree, keyed by path relative to `root`.
///
/// Symlinks are recorded by target rather than followed.
pub fn tree_manifest(root: &Path) -> Result<BTreeMap<PathBuf, String>> {
    let mut manifest = BTreeMap::new();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| entry.path().to_path_buf());

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path()).at(entry.path())?;
            manifest.insert(rel, format!("symlink:{}", target.display()));
        } else if file_type.is_file() {
            manifest.insert(rel, sha256_file(entry.path())?);
        } else if file_type.is_dir() {
            manifest.insert(rel, "dir".to_string());
        }
    }

    Ok(manifest)
}

/// Single digest over a whole tree (paths and contents)
pub fn tree_digest(root: &Path) -> Result<String> {
    let manifest = tree_manifest(root)?;
    let mut hasher = Sha256::new();
    for (path, sum) in &manifest {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(sum.as_bytes());
        hasher.update([b'\n']);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recursively copy `src` into a new directory `dest`, preserving
/// permissions and symlinks.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(src, e))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).at(&target)?;
            let perms = entry.metadata().map_err(|e| walk_error(src, e))?.permissions();
            fs::set_permissions(&target, perms).at(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).at(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target).at(&target)?;
            #[cfg(not(unix))]
            fs::copy(entry.path(), &target).at(&target)?;
        } else {
            fs::copy(entry.path(), &target).at(&target)?;
        }
    }
    Ok(())
}

/// Remove a directory tree if it exists
pub fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HatchError::io(path, e)),
    }
}

/// Check whether a file has any execute bit set
pub fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Reject relative paths that climb out of their base directory
pub fn is_contained(rel: &Path) -> bool {
    !rel.is_absolute()
        && rel
            .components()
            .all(|c| !matches!(c, std::path::Component::ParentDir))
}

fn walk_error(root: &Path, e: walkdir::Error) -> HatchError {
    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
    let source = e
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop"));
    HatchError::io(path, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_whole_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("state.json");

        atomic_write(&path, b"first version, quite long").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        // No temp file left behind
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_concurrent_writers_never_tear_reads() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::thread;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("registry.state");
        atomic_write(&path, &vec![b'a'; 1 << 20]).unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = [b'a', b'b']
            .into_iter()
            .map(|byte| {
                let path = path.clone();
                thread::spawn(move || {
                    let payload = vec![byte; 1 << 20];
                    for _ in 0..40 {
                        atomic_write(&path, &payload).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let path = path.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut torn = 0;
                while !done.load(Ordering::Relaxed) {
                    let data = fs::read(&path).unwrap();
                    let uniform = data.len() == 1 << 20 && data.iter().all(|b| *b == data[0]);
                    if !uniform {
                        torn += 1;
                    }
                }
                torn
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
        assert_eq!(reader.join().unwrap(), 0);

        let leftovers = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_copy_tree_preserves_digest() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/tool"), b"#!/bin/sh\necho hi\n").unwrap();
        fs::write(src.join("README"), b"hello").unwrap();

        let dest = temp.path().join("dest");
        copy_tree(&src, &dest).unwrap();

        assert_eq!(tree_digest(&src).unwrap(), tree_digest(&dest).unwrap());
    }

    #[test]
    fn test_tree_digest_detects_changes() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a"), b"1").unwrap();
        let before = tree_digest(temp.path()).unwrap();
        fs::write(temp.path().join("a"), b"2").unwrap();
        assert_ne!(before, tree_digest(temp.path()).unwrap());
    }

    #[test]
    fn test_sha256_known_value() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_remove_tree_missing_is_ok() {
        let temp = TempDir::new().unwrap();
        remove_tree(&temp.path().join("nope")).unwrap();
    }

    #[test]
    fn test_is_contained() {
        assert!(is_contained(Path::new("hooks/init")));
        assert!(!is_contained(Path::new("../init")));
        assert!(!is_contained(Path::new("/bin/sh")));
    }
}
