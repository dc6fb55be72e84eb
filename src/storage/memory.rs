//! In-memory backend.
//!
//! The whole tree lives in a `std::sync::RwLock<BTreeMap<..>>` keyed by the
//! path relative to the backend root (`"a/b.txt"`, `"a"`).  The root itself
//! is implicit.  Nothing survives a restart; used for scratch mounts and
//! tests.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::RwLock;

use bytes::Bytes;

use super::backend::{
    check_traversal, copy_exact, relative, Backend, BackendFuture, ByteStream, WritableBackend,
};
use crate::errors::GatewayError;
use crate::item::{dir_key, Item};

#[derive(Debug, Clone)]
enum Entry {
    File(Bytes),
    Dir,
}

/// Volatile backend holding files in memory.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Entry>>,
    read_only: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose the tree without the write capability.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Seed a file, creating parent directories.  Ignores `read_only`.
    pub fn insert_file(&self, path: &str, data: impl Into<Bytes>) -> Result<(), GatewayError> {
        check_traversal(path)?;
        let mut entries = self.write_lock()?;
        let key = relative(path).to_string();
        create_parents(&mut entries, &key);
        entries.insert(key, Entry::File(data.into()));
        Ok(())
    }

    fn read_lock(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Entry>>, GatewayError> {
        self.entries
            .read()
            .map_err(|_| GatewayError::Internal("Memory backend lock poisoned".to_string()))
    }

    fn write_lock(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Entry>>, GatewayError> {
        self.entries
            .write()
            .map_err(|_| GatewayError::Internal("Memory backend lock poisoned".to_string()))
    }

    fn describe(
        entries: &BTreeMap<String, Entry>,
        key: &str,
        depth: u32,
    ) -> Result<Item, GatewayError> {
        if !key.is_empty() {
            match entries.get(key) {
                Some(Entry::File(data)) => return Ok(Item::file(data.len() as u64)),
                Some(Entry::Dir) => {}
                None => return Err(GatewayError::not_found(&format!("/{key}"))),
            }
        }

        let mut item = Item::dir();
        if depth == 0 {
            return Ok(item);
        }

        for child in direct_children(entries, key) {
            let name = child.rsplit('/').next().unwrap_or(child);
            match entries.get(child) {
                Some(Entry::Dir) => {
                    let sub = Self::describe(entries, child, depth - 1)?;
                    item.children.insert(dir_key(name), sub);
                }
                Some(Entry::File(data)) => {
                    item.children
                        .insert(name.to_string(), Item::file(data.len() as u64));
                }
                None => {}
            }
        }
        Ok(item)
    }
}

impl Backend for MemoryBackend {
    fn list(&self, path: &str, depth: u32) -> BackendFuture<'_, Item> {
        let result = check_traversal(path).and_then(|_| {
            let entries = self.read_lock()?;
            Self::describe(&entries, relative(path), depth)
        });
        Box::pin(async move { result })
    }

    fn read(&self, path: &str, offset: u64, length: u64) -> BackendFuture<'_, (Item, ByteStream)> {
        let result = check_traversal(path).and_then(|_| {
            let entries = self.read_lock()?;
            let key = relative(path);
            match entries.get(key) {
                Some(Entry::File(data)) => Ok(data.clone()),
                Some(Entry::Dir) => Err(GatewayError::BadRequest(format!(
                    "Cannot read a directory directly: {path}"
                ))),
                None if key.is_empty() => Err(GatewayError::BadRequest(
                    "Cannot read a directory directly: /".to_string(),
                )),
                None => Err(GatewayError::not_found(path)),
            }
        });

        Box::pin(async move {
            let data = result?;
            let size = data.len() as u64;
            let start = offset.min(size) as usize;
            let end = if length == 0 {
                data.len()
            } else {
                offset.saturating_add(length).min(size) as usize
            };
            let stream: ByteStream = Box::pin(Cursor::new(data.slice(start..end)));
            Ok((Item::file(size), stream))
        })
    }

    fn writable(&self) -> Option<&dyn WritableBackend> {
        if self.read_only {
            None
        } else {
            Some(self)
        }
    }
}

impl WritableBackend for MemoryBackend {
    fn write(
        &self,
        path: &str,
        source: ByteStream,
        offset: u64,
        length: u64,
        overwrite: bool,
        truncate: bool,
    ) -> BackendFuture<'_, ()> {
        let path = path.to_string();
        Box::pin(async move {
            check_traversal(&path)?;
            let key = relative(&path).to_string();
            if key.is_empty() || path.ends_with('/') {
                return Err(GatewayError::BadRequest(format!(
                    "Cannot write to a directory: {path}"
                )));
            }

            // Body is fully buffered before the lock is taken.
            let mut incoming = Vec::with_capacity(length.min(1 << 20) as usize);
            copy_exact(source, &mut incoming, length).await?;

            let mut entries = self.write_lock()?;
            let existing = match entries.get(&key) {
                Some(Entry::Dir) => {
                    return Err(GatewayError::BadRequest(format!(
                        "Cannot write to a directory: {path}"
                    )))
                }
                Some(Entry::File(_)) if !overwrite => {
                    return Err(GatewayError::BadRequest(format!("Already exists: {path}")))
                }
                Some(Entry::File(data)) => data.to_vec(),
                None => Vec::new(),
            };

            // Writes may extend a file but never leave a hole past its end.
            let mut content = existing;
            let offset = usize::try_from(offset)
                .ok()
                .filter(|offset| *offset <= content.len())
                .ok_or_else(|| {
                    GatewayError::BadRequest(format!(
                        "Offset {offset} is past the end of {path} ({} bytes)",
                        content.len()
                    ))
                })?;
            let end = offset.checked_add(incoming.len()).ok_or_else(|| {
                GatewayError::BadRequest(format!("Write past addressable size: {path}"))
            })?;
            if content.len() < end {
                content.resize(end, 0);
            }
            content[offset..end].copy_from_slice(&incoming);
            if truncate {
                content.truncate(end);
            }

            create_parents(&mut entries, &key);
            entries.insert(key, Entry::File(Bytes::from(content)));
            Ok(())
        })
    }

    fn make_dir(&self, path: &str, recursive: bool) -> BackendFuture<'_, ()> {
        let result = check_traversal(path).and_then(|_| {
            let key = relative(path).to_string();
            let mut entries = self.write_lock()?;
            match entries.get(&key) {
                Some(Entry::Dir) if recursive => return Ok(()),
                Some(_) => {
                    return Err(GatewayError::BadRequest(format!("Already exists: {path}")))
                }
                None if key.is_empty() => {
                    return Err(GatewayError::BadRequest(format!("Already exists: {path}")))
                }
                None => {}
            }
            if !recursive {
                let parent = parent_key(&key);
                if !parent.is_empty() && !matches!(entries.get(parent), Some(Entry::Dir)) {
                    return Err(GatewayError::BadRequest(format!(
                        "Parent directory does not exist: {path}"
                    )));
                }
            }
            create_parents(&mut entries, &key);
            entries.insert(key, Entry::Dir);
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn delete(&self, path: &str, recursive: bool) -> BackendFuture<'_, ()> {
        let result = check_traversal(path).and_then(|_| {
            let key = relative(path).to_string();
            if key.is_empty() {
                return Err(GatewayError::BadRequest(
                    "Cannot delete backend root".to_string(),
                ));
            }
            let mut entries = self.write_lock()?;
            match entries.get(&key) {
                None => Err(GatewayError::not_found(path)),
                Some(Entry::File(_)) => {
                    entries.remove(&key);
                    Ok(())
                }
                Some(Entry::Dir) => {
                    let prefix = format!("{key}/");
                    let descendants: Vec<String> = entries
                        .range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .map(|(k, _)| k.clone())
                        .collect();
                    if !descendants.is_empty() && !recursive {
                        return Err(GatewayError::BadRequest(format!(
                            "Directory not empty: {path}"
                        )));
                    }
                    for k in descendants {
                        entries.remove(&k);
                    }
                    entries.remove(&key);
                    Ok(())
                }
            }
        });
        Box::pin(async move { result })
    }
}

fn parent_key(key: &str) -> &str {
    key.rfind('/').map(|idx| &key[..idx]).unwrap_or("")
}

fn create_parents(entries: &mut BTreeMap<String, Entry>, key: &str) {
    let mut parent = parent_key(key);
    while !parent.is_empty() {
        entries.entry(parent.to_string()).or_insert(Entry::Dir);
        parent = parent_key(parent);
    }
}

/// Keys of the immediate children of `key` (`""` for the root).
fn direct_children<'a>(entries: &'a BTreeMap<String, Entry>, key: &str) -> Vec<&'a String> {
    let prefix = if key.is_empty() {
        String::new()
    } else {
        format!("{key}/")
    };
    entries
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .map(|(k, _)| k)
        .filter(|k| !k[prefix.len()..].contains('/'))
        .collect()
}
