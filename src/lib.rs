//! Recursive directory watcher core.
//!
//! `treewatch` turns low-level Linux filesystem notifications into a
//! deduplicated stream of create, update, delete and rename events, and can
//! diff a persisted tree snapshot against the live filesystem to recover
//! events that happened while no watcher was running.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **DirTree**: the in-memory mirror of a watched root, shared between
//!   subscriptions on the same root through a process-wide weak cache
//! - **EventList**: a coalescing list of pending events, at most one per
//!   path, squashing rapid transitions into what a consumer actually needs
//! - **InotifyBackend**: a dedicated thread translating raw kernel events
//!   (including move cookies, self-events and queue overflow) into tree and
//!   event-list mutations
//! - **Snapshot diff**: serialization of a tree to a text snapshot and a
//!   differ that reconciles it with the live tree, detecting offline renames
//!   by inode or file id
//!
//! # Example
//!
//! ```ignore
//! use std::collections::HashSet;
//! use std::sync::Arc;
//! use treewatch::{InotifyBackend, Watcher};
//!
//! let backend = InotifyBackend::start()?;
//! let watcher = Arc::new(Watcher::with_callback(
//!     "/path/to/project",
//!     HashSet::new(),
//!     |batch| {
//!         for event in batch {
//!             println!("{} {}", event.event_type(), event.path.display());
//!         }
//!     },
//! ));
//! backend.subscribe(&watcher)?;
//! ```

mod backend;
mod error;
mod event;
mod snapshot;
mod tree;
mod watcher;

pub use backend::{InotifyBackend, SnapshotChange};
pub use error::{Error, Result};
pub use event::{Event, EventList, EventType};
pub use tree::{DirEntry, DirTree, EntryKind};
pub use watcher::Watcher;
