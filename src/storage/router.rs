//! Multi-backend router.
//!
//! Presents a set of independently owned backends as one namespace.  The
//! first path segment names the mount; the remainder is forwarded to that
//! mount's backend.  The router implements the same traits it aggregates,
//! so the protocol layer cannot tell it apart from a single backend.
//!
//! The mount table is filled before the router is shared and never
//! changes afterwards, so lookups take no lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::backend::{Backend, BackendFuture, ByteStream, ImageServer, WritableBackend};
use crate::errors::GatewayError;
use crate::item::{dir_key, Item};

/// Names that would shadow gateway routes.
pub const RESERVED_MOUNT_NAMES: &[&str] = &["gemdrive", "healthz", "metrics"];

/// Routes each request to the backend mounted under its first segment.
#[derive(Default)]
pub struct MultiBackend {
    mounts: BTreeMap<String, Arc<dyn Backend>>,
}

impl MultiBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` under `name`.  Collisions and invalid names are
    /// configuration errors.
    pub fn add_backend(&mut self, name: &str, backend: Arc<dyn Backend>) -> anyhow::Result<()> {
        validate_mount_name(name)?;
        if self.mounts.contains_key(name) {
            anyhow::bail!("Mount name already in use: {name}");
        }
        debug!("Mounted backend at /{}/", name);
        self.mounts.insert(name.to_string(), backend);
        Ok(())
    }

    /// Mounted names in sorted order.
    pub fn mount_names(&self) -> impl Iterator<Item = &str> {
        self.mounts.keys().map(String::as_str)
    }

    /// Resolve a logical path to the owning backend and the path inside it.
    fn resolve(&self, path: &str) -> Result<(Arc<dyn Backend>, String), GatewayError> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let (name, rest) = match trimmed.find('/') {
            Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
            None => (trimmed, "/"),
        };

        let backend = self
            .mounts
            .get(name)
            .ok_or_else(|| GatewayError::not_found(path))?;
        Ok((Arc::clone(backend), rest.to_string()))
    }

    async fn list_root(&self, depth: u32) -> Result<Item, GatewayError> {
        let mut root = Item::dir();
        if depth == 0 {
            return Ok(root);
        }

        for (name, backend) in &self.mounts {
            let child = if depth > 1 {
                match backend.list("/", depth - 1).await {
                    Ok(item) => item,
                    Err(e) => {
                        warn!("Listing mount {} failed: {}", name, e);
                        Item::dir()
                    }
                }
            } else {
                Item::dir()
            };
            root.children.insert(dir_key(name), child);
        }
        Ok(root)
    }
}

/// Mount names are single non-empty segments that do not shadow a route.
pub fn validate_mount_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        anyhow::bail!("Mount name must not be empty");
    }
    if name.contains('/') {
        anyhow::bail!("Mount name must not contain '/': {name}");
    }
    if name == "." || name == ".." {
        anyhow::bail!("Invalid mount name: {name}");
    }
    if RESERVED_MOUNT_NAMES.contains(&name) {
        anyhow::bail!("Mount name is reserved: {name}");
    }
    Ok(())
}

impl Backend for MultiBackend {
    fn list(&self, path: &str, depth: u32) -> BackendFuture<'_, Item> {
        if path.trim_matches('/').is_empty() {
            return Box::pin(self.list_root(depth));
        }
        let resolved = self.resolve(path);
        Box::pin(async move {
            let (backend, rest) = resolved?;
            backend.list(&rest, depth).await
        })
    }

    fn read(&self, path: &str, offset: u64, length: u64) -> BackendFuture<'_, (Item, ByteStream)> {
        if path.trim_matches('/').is_empty() {
            return Box::pin(async {
                Err(GatewayError::BadRequest(
                    "Cannot read a directory directly: /".to_string(),
                ))
            });
        }
        let resolved = self.resolve(path);
        Box::pin(async move {
            let (backend, rest) = resolved?;
            backend.read(&rest, offset, length).await
        })
    }

    fn writable(&self) -> Option<&dyn WritableBackend> {
        Some(self)
    }

    fn image_server(&self) -> Option<&dyn ImageServer> {
        Some(self)
    }
}

impl WritableBackend for MultiBackend {
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
        Box::pin(async move {
            let (backend, rest) = resolved?;
            let writer = backend
                .writable()
                .ok_or_else(GatewayError::write_unsupported)?;
            writer
                .write(&rest, source, offset, length, overwrite, truncate)
                .await
        })
    }

    fn make_dir(&self, path: &str, recursive: bool) -> BackendFuture<'_, ()> {
        let resolved = self.resolve(path);
        Box::pin(async move {
            let (backend, rest) = resolved?;
            let writer = backend
                .writable()
                .ok_or_else(GatewayError::write_unsupported)?;
            writer.make_dir(&rest, recursive).await
        })
    }

    fn delete(&self, path: &str, recursive: bool) -> BackendFuture<'_, ()> {
        let resolved = self.resolve(path);
        Box::pin(async move {
            let (backend, rest) = resolved?;
            let writer = backend
                .writable()
                .ok_or_else(GatewayError::write_unsupported)?;
            writer.delete(&rest, recursive).await
        })
    }
}

impl ImageServer for MultiBackend {
    fn get_image(&self, path: &str, max_dimension: u32) -> BackendFuture<'_, (Item, ByteStream)> {
        let resolved = self.resolve(path);
        Box::pin(async move {
            let (backend, rest) = resolved?;
            let images = backend
                .image_server()
                .ok_or_else(GatewayError::images_unsupported)?;
            images.get_image(&rest, max_dimension).await
        })
    }
}
