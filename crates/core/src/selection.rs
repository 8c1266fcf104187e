use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Per-folder opt-in flags keyed by absolute folder path. Unknown folders are not selected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderSelection {
    flags: BTreeMap<PathBuf, bool>,
}

impl FolderSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, folder: impl Into<PathBuf>, selected: bool) {
        self.flags.insert(folder.into(), selected);
    }

    pub fn remove(&mut self, folder: &Path) -> bool {
        self.flags.remove(folder).is_some()
    }

    pub fn is_selected(&self, folder: &Path) -> bool {
        self.flags.get(folder).copied().unwrap_or(false)
    }

    pub fn selected(&self) -> impl Iterator<Item = &Path> {
        self.flags
            .iter()
            .filter(|(_, on)| **on)
            .map(|(p, _)| p.as_path())
    }

    pub fn flags(&self) -> impl Iterator<Item = (&Path, bool)> {
        self.flags.iter().map(|(p, on)| (p.as_path(), *on))
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

impl<P: Into<PathBuf>> FromIterator<(P, bool)> for FolderSelection {
    fn from_iter<I: IntoIterator<Item = (P, bool)>>(iter: I) -> Self {
        Self {
            flags: iter.into_iter().map(|(p, on)| (p.into(), on)).collect(),
        }
    }
}
