//! Ordered collection of items for one outgoing transfer.

use super::{FileItem, Item};
use crate::error::{Result, TransferError};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Items in transmission order plus their total content size.
#[derive(Debug, Default)]
pub struct Bundle {
    items: Vec<Box<dyn Item>>,
    total_size: u64,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bundle from local files and directories.
    pub fn from_paths<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut bundle = Self::new();
        for path in paths {
            bundle.add_path(path.as_ref())?;
        }
        Ok(bundle)
    }

    pub fn add<T: Item + 'static>(&mut self, item: T) {
        self.add_boxed(Box::new(item));
    }

    pub fn add_boxed(&mut self, item: Box<dyn Item>) {
        self.total_size += item.size();
        self.items.push(item);
    }

    /// Add a file, or a directory and everything under it.
    ///
    /// Names are relative to the parent of `path`, `/`-separated, so sending
    /// `~/photos` produces `photos`, `photos/a.jpg`, ...
    ///
    /// Symlinks inside a directory are followed. Dangling links and links
    /// that loop back to an ancestor are skipped with a warning.
    pub fn add_path(&mut self, path: &Path) -> Result<()> {
        let path = std::fs::canonicalize(path)?;
        let Some(base) = path.parent().map(Path::to_path_buf) else {
            return Err(TransferError::invalid_path(
                path,
                "a filesystem root has no name to send it under",
            ));
        };

        if !path.is_dir() {
            let name = relative_name(&base, &path);
            self.add(FileItem::from_path(&path, name)?);
            return Ok(());
        }

        let walker = ignore::WalkBuilder::new(&path)
            .hidden(false)
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .parents(false)
            .follow_links(true)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if is_skippable(&err) => {
                    warn!("Skipping {}", err);
                    continue;
                }
                Err(err) => return Err(io::Error::new(io::ErrorKind::Other, err).into()),
            };
            let entry_path: PathBuf = entry.path().to_path_buf();
            let name = relative_name(&base, &entry_path);
            self.add(FileItem::from_path(entry_path, name)?);
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Item> {
        self.items.iter().map(|item| item.as_ref())
    }

    pub(crate) fn into_items(self) -> Vec<Box<dyn Item>> {
        self.items
    }
}

/// Dangling symlinks and symlink loops.
fn is_skippable(err: &ignore::Error) -> bool {
    match err {
        ignore::Error::Loop { .. } => true,
        ignore::Error::WithPath { err, .. } | ignore::Error::WithDepth { err, .. } => {
            is_skippable(err)
        }
        _ => err
            .io_error()
            .is_some_and(|e| e.kind() == io::ErrorKind::NotFound),
    }
}

fn relative_name(base: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
