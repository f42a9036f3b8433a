//! File item: a regular file or directory on the local filesystem.

use super::{
    base_properties, property_bool, property_i64, property_str, property_u64, Item, OpenMode,
    Properties, PROP_NAME, PROP_SIZE,
};
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use serde_json::Value;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const FILE_TYPE: &str = "file";

const PROP_DIRECTORY: &str = "directory";
const PROP_READ_ONLY: &str = "read_only";
const PROP_EXECUTABLE: &str = "executable";
const PROP_LAST_MODIFIED: &str = "last_modified";

/// Validate that a relative item name is safe and doesn't escape the root.
/// Returns the full path if valid.
pub fn validate_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(TransferError::invalid_path(relative, "empty name"));
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() || relative.starts_with('/') || relative.starts_with('\\') {
        return Err(TransferError::invalid_path(relative, "absolute paths not allowed"));
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::invalid_path(relative, "path traversal not allowed"));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::invalid_path(relative, "prefixed paths not allowed"));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(root.join(rel_path))
}

fn with_path(err: io::Error, path: &Path) -> io::Error {
    io::Error::new(err.kind(), format!("{}: {}", path.display(), err))
}

/// Restore owner write permission on an existing regular file so a new copy
/// can replace one that arrived read-only earlier.
async fn make_writable(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.is_file() {
        return Ok(());
    }

    let mut perms = meta.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if perms.mode() & 0o200 != 0 {
            return Ok(());
        }
        perms.set_mode(perms.mode() | 0o200);
    }
    #[cfg(not(unix))]
    {
        if !perms.readonly() {
            return Ok(());
        }
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
    }
    fs::set_permissions(path, perms).await
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.is_file() && meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

#[derive(Debug)]
pub struct FileItem {
    name: String,
    path: PathBuf,
    size: u64,
    directory: bool,
    read_only: bool,
    executable: bool,
    /// Milliseconds since the Unix epoch.
    last_modified: Option<i64>,
    mode: Option<OpenMode>,
    closed: bool,
    file: Option<File>,
}

impl FileItem {
    /// Describe an existing local file or directory, to be sent as `name`.
    pub fn from_path(path: impl Into<PathBuf>, name: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let meta = std::fs::metadata(&path).map_err(|e| with_path(e, &path))?;
        let directory = meta.is_dir();
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);

        Ok(Self {
            name: name.into(),
            size: if directory { 0 } else { meta.len() },
            directory,
            read_only: meta.permissions().readonly(),
            executable: is_executable(&meta),
            last_modified,
            path,
            mode: None,
            closed: false,
            file: None,
        })
    }

    /// Build a receiving item from its header, rooted at `root`.
    pub fn from_properties(props: &Properties, root: &Path) -> Result<Self> {
        let name = property_str(props, PROP_NAME)?.to_string();
        let size = property_u64(props, PROP_SIZE)?;
        let directory = property_bool(props, PROP_DIRECTORY);
        if directory && size != 0 {
            return Err(TransferError::protocol(format!(
                "directory item {} declares {} content bytes",
                name, size
            )));
        }
        let path = validate_path(root, &name)?;

        Ok(Self {
            name,
            path,
            size,
            directory,
            read_only: property_bool(props, PROP_READ_ONLY),
            executable: property_bool(props, PROP_EXECUTABLE),
            last_modified: property_i64(props, PROP_LAST_MODIFIED),
            mode: None,
            closed: false,
            file: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_directory(&self) -> bool {
        self.directory
    }

    async fn apply_mtime(&self) -> Result<()> {
        if let Some(ms) = self.last_modified {
            let mtime = filetime::FileTime::from_unix_time(
                ms.div_euclid(1000),
                (ms.rem_euclid(1000) * 1_000_000) as u32,
            );
            let path = self.path.clone();
            tokio::task::spawn_blocking(move || filetime::set_file_mtime(&path, mtime))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                .map_err(|e| with_path(e, &self.path))?;
        }
        Ok(())
    }

    async fn apply_attributes(&self) -> Result<()> {
        // Creating children moves a directory's mtime, so it waits for
        // `finalize`. Directories also stay writable for those children.
        if self.directory {
            return Ok(());
        }
        self.apply_mtime().await?;

        let mut perms = fs::metadata(&self.path).await?.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut mode = perms.mode();
            if self.executable {
                mode |= 0o111;
            } else {
                mode &= !0o111;
            }
            if self.read_only {
                mode &= !0o222;
            }
            perms.set_mode(mode);
        }
        #[cfg(not(unix))]
        if self.read_only {
            perms.set_readonly(true);
        }
        fs::set_permissions(&self.path, perms)
            .await
            .map_err(|e| with_path(e, &self.path))?;

        Ok(())
    }
}

#[async_trait]
impl Item for FileItem {
    fn item_type(&self) -> &str {
        FILE_TYPE
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn properties(&self) -> Properties {
        let mut props = base_properties(FILE_TYPE, &self.name, self.size);
        props.insert(PROP_DIRECTORY.to_string(), Value::Bool(self.directory));
        props.insert(PROP_READ_ONLY.to_string(), Value::Bool(self.read_only));
        props.insert(PROP_EXECUTABLE.to_string(), Value::Bool(self.executable));
        if let Some(ms) = self.last_modified {
            props.insert(PROP_LAST_MODIFIED.to_string(), Value::String(ms.to_string()));
        }
        props
    }

    async fn open(&mut self, mode: OpenMode) -> Result<()> {
        if self.mode.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("item {} was already opened", self.name),
            )
            .into());
        }

        match mode {
            OpenMode::Read => {
                if self.directory {
                    if !fs::metadata(&self.path).await?.is_dir() {
                        return Err(with_path(io::ErrorKind::NotFound.into(), &self.path).into());
                    }
                } else {
                    let file = File::open(&self.path)
                        .await
                        .map_err(|e| with_path(e, &self.path))?;
                    self.file = Some(file);
                }
            }
            OpenMode::Write => {
                if self.directory {
                    fs::create_dir_all(&self.path)
                        .await
                        .map_err(|e| with_path(e, &self.path))?;
                } else {
                    if let Some(parent) = self.path.parent() {
                        fs::create_dir_all(parent)
                            .await
                            .map_err(|e| with_path(e, parent))?;
                    }
                    make_writable(&self.path)
                        .await
                        .map_err(|e| with_path(e, &self.path))?;
                    let file = OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(&self.path)
                        .await
                        .map_err(|e| with_path(e, &self.path))?;
                    self.file = Some(file);
                }
            }
        }

        self.mode = Some(mode);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match (self.mode, self.file.as_mut()) {
            (Some(OpenMode::Read), Some(file)) => Ok(file.read(buf).await?),
            _ => Ok(0),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        match (self.mode, self.file.as_mut()) {
            (Some(OpenMode::Write), Some(file)) => {
                file.write_all(data).await?;
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("item {} is not open for writing", self.name),
            )
            .into()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed || self.mode.is_none() {
            return Ok(());
        }
        self.closed = true;

        if let Some(mut file) = self.file.take() {
            if self.mode == Some(OpenMode::Write) {
                file.flush().await?;
                file.sync_all().await?;
            }
        }

        if self.mode == Some(OpenMode::Write) {
            self.apply_attributes().await?;
        }
        Ok(())
    }

    async fn abort(&mut self) {
        self.closed = true;
        self.file = None;
    }

    fn has_deferred_attributes(&self) -> bool {
        self.directory && self.mode == Some(OpenMode::Write) && self.last_modified.is_some()
    }

    async fn finalize(&mut self) -> Result<()> {
        if self.has_deferred_attributes() {
            self.apply_mtime().await?;
        }
        Ok(())
    }
}
