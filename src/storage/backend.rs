//! Abstract backend traits.
//!
//! Every backend implements [`Backend`] (list + read).  Mutation and image
//! rendering are optional capabilities a backend exposes through
//! [`Backend::writable`] and [`Backend::image_server`]; callers resolve the
//! capability once and then talk to the returned trait object.
//!
//! Methods return pinned boxed futures (manual `async_trait` desugaring) so
//! the traits stay object safe behind `Arc<dyn Backend>`.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::errors::GatewayError;
use crate::item::Item;

/// Readable byte source handed across the backend boundary.  Dropping it
/// releases the underlying handle.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Future returned by every backend operation.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, GatewayError>> + Send + 'a>>;

/// Base contract: metadata listing and byte reads.
pub trait Backend: Send + Sync + 'static {
    /// Metadata for `path`.  Directories get their children expanded to
    /// `depth` levels (0 = node only).
    fn list(&self, path: &str, depth: u32) -> BackendFuture<'_, Item>;

    /// Open `path` for reading starting at `offset`.  `length == 0` reads to
    /// end of file.  Fails with `BadRequest` for directories.
    fn read(&self, path: &str, offset: u64, length: u64) -> BackendFuture<'_, (Item, ByteStream)>;

    /// Write capability, if this backend supports mutation.
    fn writable(&self) -> Option<&dyn WritableBackend> {
        None
    }

    /// Image capability, if this backend can render scaled images.
    fn image_server(&self) -> Option<&dyn ImageServer> {
        None
    }
}

/// Mutation contract.
pub trait WritableBackend: Send + Sync {
    /// Write `length` bytes from `source` at `offset`.
    ///
    /// `overwrite == false` fails with `BadRequest` when the target exists.
    /// `truncate == true` drops any content past `offset + length`.
    fn write(
        &self,
        path: &str,
        source: ByteStream,
        offset: u64,
        length: u64,
        overwrite: bool,
        truncate: bool,
    ) -> BackendFuture<'_, ()>;

    /// Create a directory.  Without `recursive` the parent must exist.
    fn make_dir(&self, path: &str, recursive: bool) -> BackendFuture<'_, ()>;

    /// Delete a file or directory.  Without `recursive` a non-empty
    /// directory is left untouched and the call fails.
    fn delete(&self, path: &str, recursive: bool) -> BackendFuture<'_, ()>;
}

/// Scaled raster renditions.
pub trait ImageServer: Send + Sync {
    /// Render `path` so that neither side exceeds `max_dimension`.  The
    /// returned item describes the rendition, not the source.
    fn get_image(&self, path: &str, max_dimension: u32) -> BackendFuture<'_, (Item, ByteStream)>;
}

/// Reject paths that try to climb out of a backend root.
pub fn check_traversal(path: &str) -> Result<(), GatewayError> {
    if path.split('/').any(|segment| segment == "..") {
        return Err(GatewayError::BadRequest(format!(
            "Path traversal detected: {path}"
        )));
    }
    Ok(())
}

/// Path relative to a backend root, without leading or trailing `/`.
pub fn relative(path: &str) -> &str {
    path.trim_matches('/')
}

/// Copy exactly `length` bytes from `source` into `dest`.  A source that
/// ends early is a client error; nothing is padded.
pub async fn copy_exact<W>(source: ByteStream, dest: &mut W, length: u64) -> Result<(), GatewayError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut limited = source.take(length);
    let copied = tokio::io::copy(&mut limited, dest).await?;
    if copied < length {
        return Err(GatewayError::BadRequest(format!(
            "Expected {length} bytes, received {copied}"
        )));
    }
    Ok(())
}
