//! Delta enumeration of local media.
//!
//! A [`MediaIndex`] answers "what changed after T, oldest first". [`scan`] wraps it in a lazy,
//! forward-only iterator that re-checks each entry on disk as it is yielded, so files deleted
//! between indexing and reading are dropped. Folder selection and ledger dedup are left to the
//! caller.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::{Dispatch, debug, warn};
use walkdir::WalkDir;

use crate::storage::BoxFuture;
use crate::{Error, Result};

pub const MEDIA_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "heic", "heif"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedMedia {
    pub path: PathBuf,
    /// Seconds since epoch.
    pub modified_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    pub path: PathBuf,
    pub parent_folder: PathBuf,
    /// Seconds since epoch.
    pub modified_at: i64,
    pub size_bytes: u64,
}

impl CandidateFile {
    pub fn path_str(&self) -> Result<&str> {
        self.path.to_str().ok_or_else(|| Error::NonUtf8Path {
            path: self.path.clone(),
        })
    }

    pub fn parent_folder_str(&self) -> Option<&str> {
        self.parent_folder.to_str()
    }

    /// Leaf name of the parent folder: the registry key for this file.
    pub fn folder_name(&self) -> Option<&str> {
        self.parent_folder.file_name().and_then(|n| n.to_str())
    }

    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

pub type MediaIter = Box<dyn Iterator<Item = IndexedMedia> + Send>;

pub trait MediaIndex: Send + Sync {
    /// Entries modified strictly after `since_secs`, ordered by modification time ascending.
    fn modified_since(&self, since_secs: i64) -> BoxFuture<'_, Result<MediaIter>>;
}

/// Filesystem-backed index over a set of media roots. The walk runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct FsMediaIndex {
    roots: Vec<PathBuf>,
}

impl FsMediaIndex {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }
}

impl MediaIndex for FsMediaIndex {
    fn modified_since(&self, since_secs: i64) -> BoxFuture<'_, Result<MediaIter>> {
        let roots = self.roots.clone();
        // Keep the caller's subscriber so walk events land in the same run log.
        let dispatch = tracing::dispatcher::get_default(Dispatch::clone);
        Box::pin(async move {
            let found = tokio::task::spawn_blocking(move || {
                tracing::dispatcher::with_default(&dispatch, || walk_roots(&roots, since_secs))
            })
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            Ok(Box::new(found.into_iter()) as MediaIter)
        })
    }
}

fn walk_roots(roots: &[PathBuf], since_secs: i64) -> Vec<IndexedMedia> {
    let mut found = Vec::new();
    for root in roots {
        if !root.is_dir() {
            warn!(
                event = "scan.root_missing",
                root = %root.display(),
                "scan.root_missing"
            );
            continue;
        }
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(event = "scan.walk_error", error = %e, "scan.walk_error");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_media(entry.path()) {
                continue;
            }
            let Some(modified_at) = entry.metadata().ok().and_then(|m| mtime_secs(&m)) else {
                continue;
            };
            if modified_at > since_secs {
                found.push(IndexedMedia {
                    path: entry.into_path(),
                    modified_at,
                });
            }
        }
    }
    found.sort_by(|a, b| {
        a.modified_at
            .cmp(&b.modified_at)
            .then_with(|| a.path.cmp(&b.path))
    });
    debug!(
        event = "scan.indexed",
        since_secs,
        entries = found.len() as u64,
        "scan.indexed"
    );
    found
}

/// Lazy candidate sequence; see the module docs.
pub struct CandidateIter {
    inner: MediaIter,
}

impl Iterator for CandidateIter {
    type Item = CandidateFile;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let media = self.inner.next()?;
            let size_bytes = match std::fs::metadata(&media.path) {
                Ok(m) if m.is_file() && m.len() > 0 => m.len(),
                _ => {
                    debug!(
                        event = "scan.skip_missing_or_empty",
                        path = %media.path.display(),
                        "scan.skip_missing_or_empty"
                    );
                    continue;
                }
            };
            let parent_folder = media
                .path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            return Some(CandidateFile {
                path: media.path,
                parent_folder,
                modified_at: media.modified_at,
                size_bytes,
            });
        }
    }
}

pub async fn scan<I: MediaIndex + ?Sized>(index: &I, since_secs: i64) -> Result<CandidateIter> {
    Ok(CandidateIter {
        inner: index.modified_since(since_secs).await?,
    })
}

fn is_media(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| MEDIA_EXTENSIONS.iter().any(|m| e.eq_ignore_ascii_case(m)))
}

fn mtime_secs(metadata: &std::fs::Metadata) -> Option<i64> {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}
