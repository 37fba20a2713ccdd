//! Backend operations.
//!
//! The live half lives in [`inotify`]: a dedicated thread translating kernel
//! events into tree and event-list mutations. This module carries the scan
//! half shared with snapshot maintenance: filling a tree from the filesystem,
//! enumerating it into a watcher's event list, and persisting or diffing it.
//! All public operations serialize on the backend mutex, so a large initial
//! scan can hold off event processing briefly.

mod inotify;

pub use inotify::InotifyBackend;

use std::fs::{self, File, Metadata};
use std::io::{BufWriter, Write};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::snapshot;
use crate::tree::{DirEntry, DirTree, EntryKind};
use crate::watcher::Watcher;

/// How an externally observed change should be applied to a cached tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotChange {
	Create,
	Update,
	Delete,
}

impl InotifyBackend {
	/// Enumerate the watcher's tree, posting one create event per entry
	/// (excluding the root itself) to the watcher's event list.
	pub fn scan(&self, watcher: &Watcher) -> Result<()> {
		let _state = self.state();
		let tree = tree_for(watcher)?;
		for entry in tree.entries() {
			if entry.path.as_path() == watcher.dir() {
				continue;
			}
			watcher
				.events()
				.create(&entry.path, entry.kind, entry.ino, entry.file_id.as_deref());
		}
		Ok(())
	}

	/// Fill the watcher's tree if needed and serialize it to `snapshot_path`.
	pub fn write_snapshot(&self, watcher: &Watcher, snapshot_path: &Path) -> Result<()> {
		let _state = self.state();
		let tree = tree_for(watcher)?;
		let mut out = BufWriter::new(File::create(snapshot_path)?);
		snapshot::write_tree(&tree, &mut out)?;
		out.flush()?;
		debug!(
			snapshot = %snapshot_path.display(),
			entries = tree.len(),
			"wrote tree snapshot",
		);
		Ok(())
	}

	/// Apply one externally observed change to the watcher's cached tree.
	///
	/// A create or update whose kind disagrees with the cached entry replaces
	/// the entry wholesale.
	pub fn update_snapshot(&self, watcher: &Watcher, entry: &DirEntry, change: SnapshotChange) {
		let _state = self.state();
		let tree = DirTree::get_cached(watcher.dir(), true);
		match change {
			SnapshotChange::Create | SnapshotChange::Update => match tree.find(&entry.path) {
				None => {
					tree.add(
						entry.path.clone(),
						entry.ino,
						entry.mtime,
						entry.kind,
						entry.file_id.clone(),
					);
				}
				Some(existing) if existing.kind == entry.kind => {
					tree.update(&entry.path, entry.ino, entry.mtime, entry.file_id.as_deref());
				}
				Some(_) => {
					tree.remove(&entry.path);
					tree.add(
						entry.path.clone(),
						entry.ino,
						entry.mtime,
						entry.kind,
						entry.file_id.clone(),
					);
				}
			},
			SnapshotChange::Delete => tree.remove(&entry.path),
		}
	}

	/// Diff the current tree against the snapshot at `snapshot_path`,
	/// populating the watcher's event list with everything that changed in
	/// between.
	///
	/// A missing or unreadable snapshot leaves the list untouched; that is the
	/// normal first run.
	pub fn get_events_since(&self, watcher: &Watcher, snapshot_path: &Path) -> Result<()> {
		let _state = self.state();

		let mut file = match File::open(snapshot_path) {
			Ok(file) => file,
			Err(err) => {
				debug!(
					snapshot = %snapshot_path.display(),
					"no readable snapshot: {err}",
				);
				return Ok(());
			}
		};
		let snapshot = match snapshot::read_tree(watcher.dir(), true, &mut file) {
			Ok(tree) => tree,
			Err(err) => {
				debug!(
					snapshot = %snapshot_path.display(),
					"unable to read snapshot: {err}",
				);
				return Ok(());
			}
		};

		let current = tree_for(watcher)?;
		current.changes_since(&snapshot, watcher.events());
		Ok(())
	}
}

/// Obtain the shared tree for a watcher's root, scanning the filesystem the
/// first time it is seen.
fn tree_for(watcher: &Watcher) -> Result<Arc<DirTree>> {
	let tree = DirTree::get_cached(watcher.dir(), true);
	if !tree.is_complete() {
		read_tree(watcher, &tree)?;
		tree.set_complete();
	}
	Ok(tree)
}

/// Walk the watcher's root and record every reachable entry.
///
/// Symlinks are recorded as files and never followed. Entries that vanish or
/// deny access mid-walk are skipped rather than failing the whole scan.
fn read_tree(watcher: &Watcher, tree: &DirTree) -> Result<()> {
	let root = watcher.dir();
	let meta = fs::symlink_metadata(root).map_err(|source| Error::Watch {
		path: root.to_path_buf(),
		source,
	})?;
	tree.add(root, Some(meta.ino()), mtime_ns(&meta), EntryKind::Dir, None);

	let mut stack = vec![root.to_path_buf()];
	while let Some(current) = stack.pop() {
		let dirents = match fs::read_dir(&current) {
			Ok(dirents) => dirents,
			Err(source) if current == root => {
				return Err(Error::Watch {
					path: root.to_path_buf(),
					source,
				});
			}
			Err(err) => {
				warn!(dir = %current.display(), "skipping unreadable directory: {err}");
				continue;
			}
		};

		for dirent in dirents {
			let Ok(dirent) = dirent else { continue };
			let path = dirent.path();
			if watcher.is_ignored(&path) {
				continue;
			}
			let Ok(meta) = fs::symlink_metadata(&path) else {
				trace!(path = %path.display(), "entry vanished during scan");
				continue;
			};
			let kind = if meta.file_type().is_dir() {
				EntryKind::Dir
			} else {
				EntryKind::File
			};
			tree.add(path.clone(), Some(meta.ino()), mtime_ns(&meta), kind, None);
			if kind.is_dir() {
				stack.push(path);
			}
		}
	}
	Ok(())
}

/// Modification time as nanoseconds since the epoch; pre-epoch times clamp
/// to zero.
pub(crate) fn mtime_ns(meta: &Metadata) -> u64 {
	let secs = meta.mtime();
	if secs < 0 {
		return 0;
	}
	(secs as u64)
		.saturating_mul(1_000_000_000)
		.saturating_add(meta.mtime_nsec() as u64)
}
