//! gemdrive library: a storage gateway that exposes several backends under
//! one HTTP namespace.
//!
//! The crate is layered the same way requests flow through it: the
//! [`server`] routes and remaps, [`handlers`] speak the protocol, [`auth`]
//! decides who may see what, and [`storage`] fans paths out to mounted
//! backends.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod item;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod tokens;

use crate::auth::Auth;
use crate::config::{Config, MountKind};
use crate::storage::backend::Backend;
use crate::storage::local::FileSystemBackend;
use crate::storage::memory::MemoryBackend;
use crate::storage::router::MultiBackend;
use crate::tokens::TokenStore;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The namespace root: normally a [`MultiBackend`].
    pub backend: Arc<dyn Backend>,
    /// Token checks and the authorization handshake.
    pub auth: Arc<Auth>,
}

/// Open every configured mount and the token store.
pub fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let backend = build_backend(&config)?;
    let names: Vec<&str> = backend.mount_names().collect();
    if names.is_empty() {
        tracing::warn!("No mounts configured; the namespace is empty");
    } else {
        info!("Serving mounts: {}", names.join(", "));
    }

    let tokens = Arc::new(TokenStore::open(&config.data_dir)?);
    info!("Token store opened in {}", config.data_dir.display());

    let auth = Auth::new(tokens)
        .with_anonymous(config.auth.anonymous.clone())
        .with_ttls(
            Duration::from_secs(config.auth.pending_ttl_secs),
            Duration::from_secs(config.auth.token_ttl_days.saturating_mul(86400)),
        );

    Ok(Arc::new(AppState {
        config,
        backend: Arc::new(backend),
        auth: Arc::new(auth),
    }))
}

/// Build the router from the mount table.  Each local mount caches its
/// image renditions under `cache_dir/<mount name>`.
pub fn build_backend(config: &Config) -> anyhow::Result<MultiBackend> {
    let mut router = MultiBackend::new();
    for mount in &config.storage.mounts {
        let name = mount
            .mount_name()
            .ok_or_else(|| anyhow::anyhow!("Mount needs a name or a path"))?;

        let backend: Arc<dyn Backend> = match mount.kind {
            MountKind::Local => {
                let root = mount
                    .path
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("Local mount {name} requires a path"))?;
                let mut fs = FileSystemBackend::new(root, config.storage.cache_dir.join(&name))?;
                if mount.read_only {
                    fs = fs.read_only();
                }
                info!(
                    "Mounted {} at /{}/ (read_only={})",
                    root.display(),
                    name,
                    mount.read_only
                );
                Arc::new(fs)
            }
            MountKind::Memory => {
                let mut memory = MemoryBackend::new();
                if mount.read_only {
                    memory = memory.read_only();
                }
                info!("Mounted in-memory backend at /{}/", name);
                Arc::new(memory)
            }
        };
        router.add_backend(&name, backend)?;
    }
    Ok(router)
}
