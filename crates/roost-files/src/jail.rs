//! Path containment for a single workload root.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use walkdir::DirEntry;

use crate::error::{JailError, JailResult};
use crate::walk::{self, Visit, Visitor};

/// Upper bound on symlink hops while resolving a single path.
const MAX_SYMLINK_HOPS: usize = 40;

/// A directory that workload paths can never leave.
#[derive(Debug, Clone)]
pub struct Jail {
    root: PathBuf,
}

/// Collapse `.` and `..` without touching the filesystem.
fn lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl Jail {
    /// Create a jail rooted at `root`, which must exist.
    pub fn new(root: impl AsRef<Path>) -> JailResult<Self> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .map_err(|e| JailError::io("canonicalize root", root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` against the root, following symlinks to their final target.
    ///
    /// Relative paths, paths with a leading `/` and absolute paths that already
    /// carry the root prefix are all interpreted inside the jail. The result is
    /// rejected with [`JailError::PathEscape`] if it ends up outside the root at
    /// any point of the resolution, including through a link whose target does
    /// not exist yet.
    pub fn resolve_safe(&self, path: impl AsRef<Path>) -> JailResult<PathBuf> {
        let path = path.as_ref();
        if path.as_os_str().as_encoded_bytes().contains(&0) {
            return Err(JailError::InvalidPath(format!(
                "path {} contains a null byte",
                path.display()
            )));
        }

        let relative: PathBuf = path
            .strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
            .collect();

        let joined = self.contain(lexical(&self.root.join(relative)))?;
        self.follow_links(joined)
    }

    fn contain(&self, path: PathBuf) -> JailResult<PathBuf> {
        if path.starts_with(&self.root) {
            Ok(path)
        } else {
            warn!(
                "path {} resolves outside of jail {}",
                path.display(),
                self.root.display()
            );
            Err(JailError::escape(path))
        }
    }

    fn follow_links(&self, mut current: PathBuf) -> JailResult<PathBuf> {
        for _ in 0..MAX_SYMLINK_HOPS {
            // Split into the longest prefix that exists and the missing tail.
            let mut existing = current.as_path();
            let mut tail: Vec<OsString> = Vec::new();
            loop {
                match fs::symlink_metadata(existing) {
                    Ok(_) => break,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        let (Some(name), Some(parent)) = (existing.file_name(), existing.parent())
                        else {
                            break;
                        };
                        tail.push(name.to_os_string());
                        existing = parent;
                    }
                    Err(e) => return Err(JailError::io("resolve", existing, e)),
                }
            }

            let next = match existing.canonicalize() {
                Ok(real) => {
                    let resolved = tail.iter().rev().fold(real, |acc, name| acc.join(name));
                    return self.contain(resolved);
                }
                // `existing` is a dangling link; evaluate its target by hand.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    let target =
                        fs::read_link(existing).map_err(|e| JailError::io("readlink", existing, e))?;
                    let parent = existing
                        .parent()
                        .ok_or_else(|| JailError::escape(existing))?;
                    let parent = parent
                        .canonicalize()
                        .map_err(|e| JailError::io("resolve", parent, e))?;
                    let base = lexical(&parent.join(target));
                    let next = tail.iter().rev().fold(base, |acc, name| acc.join(name));
                    self.contain(next)?
                }
                Err(e) => return Err(JailError::io("resolve", existing, e)),
            };
            current = next;
        }

        Err(JailError::InvalidPath(format!(
            "too many levels of symbolic links in {}",
            current.display()
        )))
    }

    /// Total on-disk size of every non-directory entry below `path`.
    ///
    /// Symlinks that resolve outside the jail are skipped with their whole
    /// subtree rather than failing the call. Top-level subtrees are sized in
    /// parallel.
    pub async fn directory_size(&self, path: impl AsRef<Path>) -> JailResult<u64> {
        let dir = self.resolve_safe(path)?;
        let visitor = Arc::new(SizeVisitor {
            jail: self.clone(),
            total: AtomicU64::new(0),
        });
        walk::walk_parallel(dir, Arc::clone(&visitor)).await?;
        Ok(visitor.total.load(Ordering::Relaxed))
    }

    /// Recursively apply `uid:gid` ownership below `path`.
    ///
    /// Symlinks are never chowned nor descended, so a crafted link cannot
    /// redirect the ownership change to a file outside the jail.
    #[cfg(unix)]
    pub async fn chown(&self, path: impl AsRef<Path>, uid: u32, gid: u32) -> JailResult<()> {
        let target = self.resolve_safe(path)?;
        tokio::task::spawn_blocking(move || {
            set_owner(&target, uid, gid)?;

            let is_dir = fs::metadata(&target)
                .map(|m| m.is_dir())
                .map_err(|e| JailError::io("stat", &target, e))?;
            if !is_dir {
                return Ok(());
            }

            walk::walk(&target, &|entry: &DirEntry| {
                if entry.path_is_symlink() {
                    return Visit::SkipSubtree;
                }
                match set_owner(entry.path(), uid, gid) {
                    Ok(()) => Visit::Descend,
                    Err(err) => Visit::Fail(err),
                }
            })
        })
        .await
        .map_err(|e| JailError::io("chown", self.root(), io::Error::other(e)))?
    }
}

#[cfg(unix)]
fn set_owner(path: &Path, uid: u32, gid: u32) -> JailResult<()> {
    use nix::unistd::{Gid, Uid, chown};

    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|errno| {
        JailError::Ownership {
            path: path.to_path_buf(),
            source: io::Error::from(errno),
        }
    })
}

struct SizeVisitor {
    jail: Jail,
    total: AtomicU64,
}

impl Visitor for SizeVisitor {
    fn visit(&self, entry: &DirEntry) -> Visit {
        if entry.path_is_symlink()
            && let Err(err) = self.jail.resolve_safe(entry.path())
        {
            return if err.is_path_escape() {
                Visit::SkipSubtree
            } else {
                Visit::Fail(err)
            };
        }

        if !entry.file_type().is_dir() {
            match entry.metadata() {
                Ok(meta) => {
                    self.total.fetch_add(meta.len(), Ordering::Relaxed);
                }
                // Removed between listing and stat.
                Err(err) => debug!("skipping {}: {}", entry.path().display(), err),
            }
        }

        Visit::Descend
    }
}
