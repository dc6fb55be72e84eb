//! Local filesystem backend.
//!
//! Serves a directory tree.  Logical paths map directly onto paths below
//! the root; `..` segments are rejected.
//!
//! Whole-file writes follow crash-only design: write to a temp file in the
//! target directory, fsync, rename.  A dropped request drops the temp file,
//! so committed content is never replaced by a partial upload.  Partial
//! writes (offset > 0 or no truncate) go straight to the target.

use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use image::codecs::jpeg::JpegEncoder;
use tempfile::NamedTempFile;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::backend::{
    check_traversal, copy_exact, relative, Backend, BackendFuture, ByteStream, ImageServer,
    WritableBackend,
};
use crate::errors::GatewayError;
use crate::item::{dir_key, is_dir_path, Item};

/// JPEG quality for cached image renditions.
const IMAGE_QUALITY: u8 = 85;

/// Serves a directory on the local filesystem.
pub struct FileSystemBackend {
    /// Directory served as this backend's `/`.
    root: PathBuf,
    /// Directory for cached image renditions.
    cache_dir: PathBuf,
    /// Refuse all mutation when set.
    read_only: bool,
}

impl FileSystemBackend {
    /// Create a backend serving `root`, caching renditions under
    /// `cache_dir`.  The cache directory is created if missing; the root
    /// must already exist.
    pub fn new(root: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        let cache_dir = cache_dir.into();
        if !root.is_dir() {
            anyhow::bail!("Mount root is not a directory: {}", root.display());
        }
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            root,
            cache_dir,
            read_only: false,
        })
    }

    /// Expose the tree without the write capability.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Resolve a logical path to an absolute filesystem path.
    fn resolve(&self, path: &str) -> Result<PathBuf, GatewayError> {
        check_traversal(path)?;
        let rel = relative(path);
        if rel.is_empty() {
            Ok(self.root.clone())
        } else {
            Ok(self.root.join(rel))
        }
    }

    async fn write_replace(
        &self,
        target: PathBuf,
        source: ByteStream,
        length: u64,
        overwrite: bool,
    ) -> Result<(), GatewayError> {
        let parent = target
            .parent()
            .ok_or_else(|| GatewayError::BadRequest("Cannot write to backend root".to_string()))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        // Early exit only; the no-clobber rename below is what decides.
        if !overwrite && tokio::fs::try_exists(&target).await? {
            return Err(already_exists(&target));
        }

        let temp = tempfile::Builder::new()
            .prefix(".gemdrive-")
            .suffix(".tmp")
            .tempfile_in(&parent)?;
        let mut file = tokio::fs::File::from_std(temp.as_file().try_clone()?);
        copy_exact(source, &mut file, length).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::task::spawn_blocking(move || {
            let persisted = if overwrite {
                temp.persist(&target)
            } else {
                temp.persist_noclobber(&target)
            };
            persisted.map(|_| ()).map_err(|e| match e.error.kind() {
                std::io::ErrorKind::AlreadyExists => already_exists(&target),
                _ => GatewayError::from(e.error),
            })
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("Write task failed: {e}")))?
    }

    async fn write_in_place(
        &self,
        target: PathBuf,
        source: ByteStream,
        offset: u64,
        length: u64,
        overwrite: bool,
        truncate: bool,
    ) -> Result<(), GatewayError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true);
        } else {
            options.create_new(true);
        }
        let mut file = options
            .open(&target)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => already_exists(&target),
                _ => GatewayError::from(e),
            })?;

        file.seek(SeekFrom::Start(offset)).await?;
        copy_exact(source, &mut file, length).await?;
        if truncate {
            let end = offset.checked_add(length).ok_or_else(|| {
                GatewayError::BadRequest("Write past addressable size".to_string())
            })?;
            file.set_len(end).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

impl Backend for FileSystemBackend {
    fn list(&self, path: &str, depth: u32) -> BackendFuture<'_, Item> {
        let resolved = self.resolve(path);
        Box::pin(async move {
            let full = resolved?;
            tokio::task::spawn_blocking(move || describe(&full, depth).map(|(_, item)| item))
                .await
                .map_err(|e| GatewayError::Internal(format!("List task failed: {e}")))?
        })
    }

    fn read(&self, path: &str, offset: u64, length: u64) -> BackendFuture<'_, (Item, ByteStream)> {
        let resolved = self.resolve(path);
        let path = path.to_string();
        Box::pin(async move {
            let full = resolved?;
            let meta = tokio::fs::metadata(&full)
                .await
                .map_err(|e| not_found_or(e, &path))?;
            if meta.is_dir() {
                return Err(GatewayError::BadRequest(format!(
                    "Cannot read a directory directly: {path}"
                )));
            }

            let mut file = tokio::fs::File::open(&full).await?;
            if offset > 0 {
                file.seek(SeekFrom::Start(offset)).await?;
            }

            let stream: ByteStream = if length > 0 {
                Box::pin(tokio::io::AsyncReadExt::take(file, length))
            } else {
                Box::pin(file)
            };
            Ok((Item::file(meta.len()), stream))
        })
    }

    fn writable(&self) -> Option<&dyn WritableBackend> {
        if self.read_only {
            None
        } else {
            Some(self)
        }
    }

    fn image_server(&self) -> Option<&dyn ImageServer> {
        Some(self)
    }
}

impl WritableBackend for FileSystemBackend {
    fn write(
        &self,
        path: &str,
        source: ByteStream,
        offset: u64,
        length: u64,
        overwrite: bool,
        truncate: bool,
    ) -> BackendFuture<'_, ()> {
        let resolved = self.resolve(path);
        let path = path.to_string();
        Box::pin(async move {
            let target = resolved?;
            if is_dir_path(&path) || target.is_dir() {
                return Err(GatewayError::BadRequest(format!(
                    "Cannot write to a directory: {path}"
                )));
            }
            debug!(
                "write {} offset={} length={} overwrite={} truncate={}",
                path, offset, length, overwrite, truncate
            );

            if truncate && offset == 0 {
                self.write_replace(target, source, length, overwrite).await
            } else {
                self.write_in_place(target, source, offset, length, overwrite, truncate)
                    .await
            }
        })
    }

    fn make_dir(&self, path: &str, recursive: bool) -> BackendFuture<'_, ()> {
        let resolved = self.resolve(path);
        let path = path.to_string();
        Box::pin(async move {
            let full = resolved?;
            if recursive {
                tokio::fs::create_dir_all(&full).await?;
                return Ok(());
            }

            if tokio::fs::try_exists(&full).await? {
                return Err(already_exists(&full));
            }
            let parent_exists = match full.parent() {
                Some(parent) => tokio::fs::try_exists(parent).await?,
                None => false,
            };
            if !parent_exists {
                return Err(GatewayError::BadRequest(format!(
                    "Parent directory does not exist: {path}"
                )));
            }
            tokio::fs::create_dir(&full).await?;
            Ok(())
        })
    }

    fn delete(&self, path: &str, recursive: bool) -> BackendFuture<'_, ()> {
        let resolved = self.resolve(path);
        let path = path.to_string();
        Box::pin(async move {
            let full = resolved?;
            if relative(&path).is_empty() {
                return Err(GatewayError::BadRequest(
                    "Cannot delete backend root".to_string(),
                ));
            }

            let meta = tokio::fs::metadata(&full)
                .await
                .map_err(|e| not_found_or(e, &path))?;
            if !meta.is_dir() {
                tokio::fs::remove_file(&full).await?;
                return Ok(());
            }

            if recursive {
                tokio::fs::remove_dir_all(&full).await?;
                return Ok(());
            }

            let mut entries = tokio::fs::read_dir(&full).await?;
            if entries.next_entry().await?.is_some() {
                return Err(GatewayError::BadRequest(format!(
                    "Directory not empty: {path}"
                )));
            }
            tokio::fs::remove_dir(&full).await?;
            Ok(())
        })
    }
}

impl ImageServer for FileSystemBackend {
    fn get_image(&self, path: &str, max_dimension: u32) -> BackendFuture<'_, (Item, ByteStream)> {
        let resolved = self.resolve(path);
        let cache_path = self
            .cache_dir
            .join(max_dimension.to_string())
            .join(format!("{}.jpg", relative(path)));
        Box::pin(async move {
            let source = resolved?;
            if max_dimension == 0 {
                return Err(GatewayError::BadRequest(
                    "Image size must be positive".to_string(),
                ));
            }

            let rendition = cache_path.clone();
            tokio::task::spawn_blocking(move || render_cached(&source, &rendition, max_dimension))
                .await
                .map_err(|e| GatewayError::Internal(format!("Image task failed: {e}")))??;

            let file = tokio::fs::File::open(&cache_path).await?;
            let size = file.metadata().await?.len();
            let stream: ByteStream = Box::pin(file);
            Ok((Item::file(size), stream))
        })
    }
}

/// Describe a filesystem node, expanding directories to `depth` levels.
/// Returns whether the node is a directory alongside its item.
fn describe(path: &Path, depth: u32) -> Result<(bool, Item), GatewayError> {
    let meta = std::fs::metadata(path).map_err(|e| not_found_or(e, &path.display().to_string()))?;
    if !meta.is_dir() {
        return Ok((false, Item::file(meta.len())));
    }

    let mut item = Item::dir();
    if depth == 0 {
        return Ok((true, item));
    }

    for entry in std::fs::read_dir(path)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {}", path.display(), e);
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_temp_name(&name) {
            continue;
        }
        match describe(&entry.path(), depth - 1) {
            Ok((true, child)) => {
                item.children.insert(dir_key(&name), child);
            }
            Ok((false, child)) => {
                item.children.insert(name, child);
            }
            Err(e) => warn!("Skipping {}: {}", entry.path().display(), e),
        }
    }

    Ok((true, item))
}

/// Render `source` into a cached JPEG unless a fresh rendition exists.
fn render_cached(source: &Path, rendition: &Path, max_dimension: u32) -> Result<(), GatewayError> {
    let source_meta = std::fs::metadata(source)?;
    if source_meta.is_dir() {
        return Err(GatewayError::BadRequest(format!(
            "Not an image: {}",
            source.display()
        )));
    }

    if let Ok(cached) = std::fs::metadata(rendition) {
        let source_modified = source_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if cached.modified().map(|m| m >= source_modified).unwrap_or(false) {
            return Ok(());
        }
    }

    let img = image::open(source).map_err(|e| {
        GatewayError::Internal(format!("Failed to decode image {}: {e}", source.display()))
    })?;
    let scaled = if img.width() > max_dimension || img.height() > max_dimension {
        img.thumbnail(max_dimension, max_dimension)
    } else {
        img
    };
    let rgb = scaled.to_rgb8();

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, IMAGE_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| GatewayError::Internal(format!("Failed to encode image: {e}")))?;

    let parent = rendition
        .parent()
        .ok_or_else(|| GatewayError::Internal("Rendition path has no parent".to_string()))?;
    std::fs::create_dir_all(parent)?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(&encoded)?;
    temp.as_file().sync_all()?;
    temp.persist(rendition).map_err(|e| GatewayError::from(e.error))?;
    Ok(())
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with(".gemdrive-") && name.ends_with(".tmp")
}

fn already_exists(path: &Path) -> GatewayError {
    GatewayError::BadRequest(format!("Already exists: {}", path.display()))
}

fn not_found_or(err: std::io::Error, path: &str) -> GatewayError {
    if err.kind() == std::io::ErrorKind::NotFound {
        GatewayError::not_found(path)
    } else {
        GatewayError::from(err)
    }
}
