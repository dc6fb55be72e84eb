//! Storage backends.
//!
//! The [`backend::Backend`] trait abstracts over where bytes physically
//! live.  Implementations include a local directory tree and a volatile
//! in-memory tree; [`router::MultiBackend`] mounts several of them under
//! one namespace.

pub mod backend;
pub mod local;
pub mod memory;
pub mod router;
