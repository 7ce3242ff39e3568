//! Directory walking with per-entry containment decisions.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use walkdir::{DirEntry, WalkDir};

use crate::error::{JailError, JailResult};

/// What a walk should do after visiting an entry.
#[derive(Debug)]
pub enum Visit {
    /// Keep going, descending into the entry if it is a directory.
    Descend,
    /// Do not descend into this entry. A no-op for non-directories.
    SkipSubtree,
    /// Abort the walk with this error.
    Fail(JailError),
}

/// Per-entry callback for a walk.
///
/// Walks never follow symlinks on their own; a visitor decides what a link means.
pub trait Visitor: Send + Sync {
    fn visit(&self, entry: &DirEntry) -> Visit;
}

impl<F> Visitor for F
where
    F: Fn(&DirEntry) -> Visit + Send + Sync,
{
    fn visit(&self, entry: &DirEntry) -> Visit {
        self(entry)
    }
}

fn walk_error(dir: &Path, err: walkdir::Error) -> JailError {
    let path = err
        .path()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| dir.to_path_buf());
    JailError::io("walk", path, io::Error::from(err))
}

/// Walk everything below `dir` (not `dir` itself), depth first.
pub fn walk(dir: &Path, visitor: &dyn Visitor) -> JailResult<()> {
    let mut entries = WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .into_iter();

    while let Some(entry) = entries.next() {
        let entry = entry.map_err(|err| walk_error(dir, err))?;
        match visitor.visit(&entry) {
            Visit::Descend => {}
            Visit::SkipSubtree => {
                if entry.file_type().is_dir() {
                    entries.skip_current_dir();
                }
            }
            Visit::Fail(err) => return Err(err),
        }
    }

    Ok(())
}

/// Visit the direct children of `dir` and return the directories the visitor
/// chose to descend into.
fn visit_children(dir: &Path, visitor: &dyn Visitor) -> JailResult<Vec<PathBuf>> {
    let mut subtrees = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = entry.map_err(|err| walk_error(dir, err))?;
        match visitor.visit(&entry) {
            Visit::Descend if entry.file_type().is_dir() => {
                subtrees.push(entry.into_path());
            }
            Visit::Descend | Visit::SkipSubtree => {}
            Visit::Fail(err) => return Err(err),
        }
    }
    Ok(subtrees)
}

fn join_error(dir: &Path, err: tokio::task::JoinError) -> JailError {
    JailError::io("walk", dir, io::Error::other(err))
}

/// Walk `dir` with each top-level subtree visited on its own blocking task.
///
/// The visitor is shared between tasks, so any state it accumulates must be
/// safe under concurrent updates.
pub async fn walk_parallel<V>(dir: PathBuf, visitor: Arc<V>) -> JailResult<()>
where
    V: Visitor + 'static,
{
    let subtrees = {
        let top = dir.clone();
        let visitor = Arc::clone(&visitor);
        tokio::task::spawn_blocking(move || visit_children(&top, visitor.as_ref()))
            .await
            .map_err(|e| join_error(&dir, e))??
    };

    let tasks = subtrees.into_iter().map(|subtree| {
        let visitor = Arc::clone(&visitor);
        async move {
            tokio::task::spawn_blocking({
                let subtree = subtree.clone();
                move || walk(&subtree, visitor.as_ref())
            })
            .await
            .map_err(|e| join_error(&subtree, e))?
        }
    });

    try_join_all(tasks).await?;
    Ok(())
}
