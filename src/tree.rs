//! In-memory mirror of a watched directory tree.
//!
//! A [`DirTree`] maps absolute paths to their last observed metadata for one
//! watch root. Trees are shared: every subscription on the same root receives
//! the same tree through a process-wide cache, so the initial filesystem scan
//! is paid once. The cache holds weak handles and a tree evicts its own slot
//! when the last holder drops it.
//!
//! Path is the primary key because filesystem uniqueness is defined by path.
//! Inode and file id act as secondary identities and are consulted only by
//! [`DirTree::changes_since`], the snapshot differ that recovers events which
//! occurred while no watcher was running.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::trace;

use crate::event::EventList;

/// What kind of filesystem node an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
	File,
	Dir,
}

impl EntryKind {
	pub fn is_dir(self) -> bool {
		matches!(self, EntryKind::Dir)
	}
}

/// Metadata for a single filesystem node.
///
/// `ino` and `file_id` are `None` when the identity is unknown, for example
/// because a stat raced a deletion. `file_id` is a platform-provided stable
/// identifier that survives renames where available; Linux scans leave it
/// unset, but snapshots written elsewhere may carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
	pub path: PathBuf,
	pub ino: Option<u64>,
	/// Modification time in nanoseconds since the epoch.
	pub mtime: u64,
	pub kind: EntryKind,
	pub file_id: Option<String>,
}

#[derive(Debug, Default)]
struct TreeState {
	// Ordered so that a directory always precedes its descendants; the differ
	// relies on this to rekey a renamed directory's children before visiting
	// them.
	entries: BTreeMap<PathBuf, DirEntry>,
	is_complete: bool,
}

/// Mapping of path to [`DirEntry`] for one watch root.
#[derive(Debug)]
pub struct DirTree {
	root: PathBuf,
	recursive_remove: bool,
	state: Mutex<TreeState>,
}

static TREE_CACHE: Lazy<Mutex<HashMap<PathBuf, Weak<DirTree>>>> =
	Lazy::new(|| Mutex::new(HashMap::new()));

impl DirTree {
	pub fn new(root: impl Into<PathBuf>, recursive_remove: bool) -> Self {
		Self {
			root: root.into(),
			recursive_remove,
			state: Mutex::new(TreeState::default()),
		}
	}

	/// Return the shared tree for `root`, constructing an empty one if no live
	/// handle exists.
	///
	/// `recursive_remove` is captured only when the tree is first constructed;
	/// later lookups inherit whatever the first caller chose.
	pub fn get_cached(root: impl Into<PathBuf>, recursive_remove: bool) -> Arc<DirTree> {
		let root = root.into();
		let mut cache = TREE_CACHE.lock();

		if let Some(tree) = cache.get(&root).and_then(Weak::upgrade) {
			return tree;
		}

		trace!(root = %root.display(), "constructing fresh directory tree");
		let tree = Arc::new(DirTree::new(root.clone(), recursive_remove));
		cache.insert(root, Arc::downgrade(&tree));
		tree
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	/// True once a full filesystem scan has populated the entries.
	pub fn is_complete(&self) -> bool {
		self.state.lock().is_complete
	}

	pub fn set_complete(&self) {
		self.state.lock().is_complete = true;
	}

	/// Insert an entry if absent and return the entry now stored at `path`.
	///
	/// A colliding insert leaves the existing entry untouched.
	pub fn add(
		&self,
		path: impl Into<PathBuf>,
		ino: Option<u64>,
		mtime: u64,
		kind: EntryKind,
		file_id: Option<String>,
	) -> DirEntry {
		let path = path.into();
		let mut state = self.state.lock();
		state
			.entries
			.entry(path.clone())
			.or_insert_with(|| DirEntry {
				path,
				ino,
				mtime,
				kind,
				file_id,
			})
			.clone()
	}

	pub fn find(&self, path: &Path) -> Option<DirEntry> {
		self.state.lock().entries.get(path).cloned()
	}

	/// Refresh an existing entry's metadata.
	///
	/// `mtime` is always taken; `ino` and `file_id` only when known. The kind
	/// never changes through an update.
	pub fn update(
		&self,
		path: &Path,
		ino: Option<u64>,
		mtime: u64,
		file_id: Option<&str>,
	) -> Option<DirEntry> {
		let mut state = self.state.lock();
		let entry = state.entries.get_mut(path)?;
		entry.mtime = mtime;
		if let Some(ino) = ino {
			entry.ino = Some(ino);
		}
		if let Some(file_id) = file_id {
			entry.file_id = Some(file_id.to_owned());
		}
		Some(entry.clone())
	}

	/// Remove the entry at `path`, and every descendant entry when this tree
	/// removes recursively and the entry was a directory.
	pub fn remove(&self, path: &Path) {
		let mut state = self.state.lock();
		let was_dir = state
			.entries
			.get(path)
			.map_or(false, |entry| entry.kind.is_dir());

		if self.recursive_remove && was_dir {
			state.entries.retain(|key, _| !key.starts_with(path));
		} else {
			state.entries.remove(path);
		}
	}

	pub fn find_by_ino(&self, ino: u64) -> Option<DirEntry> {
		self.state
			.lock()
			.entries
			.values()
			.find(|entry| entry.ino == Some(ino))
			.cloned()
	}

	pub fn find_by_file_id(&self, file_id: &str) -> Option<DirEntry> {
		self.state
			.lock()
			.entries
			.values()
			.find(|entry| entry.file_id.as_deref() == Some(file_id))
			.cloned()
	}

	/// Snapshot of all entries, parents before their descendants.
	pub fn entries(&self) -> Vec<DirEntry> {
		self.state.lock().entries.values().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.state.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.state.lock().entries.is_empty()
	}

	/// Diff this tree (the current state) against a previously persisted
	/// `snapshot`, pushing the minimal reconciling event sequence into
	/// `events`.
	///
	/// Matching prefers `file_id` over `ino` so renames survive a remount.
	/// When a matched directory moved, the snapshot's descendant keys are
	/// rewritten under the new prefix in place; the remaining iterations and
	/// the deletion pass then see them at their post-rename paths and emit
	/// nothing for them. Hardlinked entries sharing an inode resolve to the
	/// first scan hit.
	///
	/// Both trees stay locked for the duration; `snapshot` must be a distinct
	/// tree object.
	pub fn changes_since(&self, snapshot: &DirTree, events: &EventList) {
		let state = self.state.lock();
		let mut snap_state = snapshot.state.lock();

		for entry in state.entries.values() {
			let found = match (&entry.file_id, entry.ino) {
				(Some(file_id), _) => snap_state
					.entries
					.values()
					.find(|snap| snap.file_id.as_deref() == Some(file_id.as_str()))
					.cloned(),
				(None, Some(ino)) => snap_state
					.entries
					.values()
					.find(|snap| snap.ino == Some(ino))
					.cloned(),
				(None, None) => None,
			};

			match found {
				Some(snap) if snap.kind != entry.kind => {
					// Same identity, different node type: the old node was
					// replaced wholesale.
					events.remove(&snap.path, snap.kind, snap.ino, snap.file_id.as_deref());
					events.create(&entry.path, entry.kind, entry.ino, entry.file_id.as_deref());
				}
				Some(snap) if snap.path != entry.path => {
					// The create gives the rename a source the consumer has
					// heard of; the two collapse into a single rename event.
					events.create(&snap.path, snap.kind, snap.ino, snap.file_id.as_deref());
					events.rename(
						&snap.path,
						&entry.path,
						entry.kind,
						entry.ino,
						entry.file_id.as_deref(),
					);

					if snap.kind.is_dir() {
						rekey_descendants(&mut snap_state.entries, &snap.path, &entry.path);
					}
				}
				Some(snap) => {
					if !entry.kind.is_dir() && snap.mtime != entry.mtime {
						events.update(&entry.path, entry.ino, entry.file_id.as_deref());
					}
				}
				None => match snap_state.entries.get(&entry.path) {
					None => {
						events.create(&entry.path, entry.kind, entry.ino, entry.file_id.as_deref());
					}
					Some(prev)
						if prev.mtime != entry.mtime
							&& !prev.kind.is_dir() && !entry.kind.is_dir() =>
					{
						events.update(&entry.path, entry.ino, entry.file_id.as_deref());
					}
					Some(_) => {}
				},
			}
		}

		for snap in snap_state.entries.values() {
			let survives = match (&snap.file_id, snap.ino) {
				(Some(file_id), _) => state
					.entries
					.values()
					.any(|entry| entry.file_id.as_deref() == Some(file_id.as_str())),
				(None, Some(ino)) => state.entries.values().any(|entry| entry.ino == Some(ino)),
				(None, None) => false,
			};
			if !survives {
				events.remove(&snap.path, snap.kind, snap.ino, snap.file_id.as_deref());
			}
		}
	}
}

/// Move every strict descendant of `old_prefix` to the same relative position
/// under `new_prefix`, keeping all other fields.
fn rekey_descendants(
	entries: &mut BTreeMap<PathBuf, DirEntry>,
	old_prefix: &Path,
	new_prefix: &Path,
) {
	let children: Vec<PathBuf> = entries
		.keys()
		.filter(|key| key.as_path() != old_prefix && key.starts_with(old_prefix))
		.cloned()
		.collect();

	for child in children {
		if let Some(mut entry) = entries.remove(&child) {
			if let Ok(rest) = child.strip_prefix(old_prefix) {
				entry.path = new_prefix.join(rest);
			}
			entries.insert(entry.path.clone(), entry);
		}
	}
}

impl Drop for DirTree {
	fn drop(&mut self) {
		// Evict our cache slot, but only if it has not already been replaced
		// by a fresh live tree for the same root.
		let mut cache = TREE_CACHE.lock();
		if let Some(slot) = cache.get(&self.root) {
			if slot.upgrade().is_none() {
				cache.remove(&self.root);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::EventType;

	fn file(tree: &DirTree, path: &str, ino: u64, mtime: u64) {
		tree.add(path, Some(ino), mtime, EntryKind::File, None);
	}

	fn dir(tree: &DirTree, path: &str, ino: u64) {
		tree.add(path, Some(ino), 0, EntryKind::Dir, None);
	}

	#[test]
	fn add_returns_existing_entry_on_collision() {
		let tree = DirTree::new("/r", false);
		file(&tree, "/r/a", 1, 100);
		let entry = tree.add("/r/a", Some(2), 200, EntryKind::File, None);
		assert_eq!(entry.ino, Some(1));
		assert_eq!(entry.mtime, 100);
	}

	#[test]
	fn update_keeps_unknown_identity_fields() {
		let tree = DirTree::new("/r", false);
		tree.add("/r/a", Some(1), 100, EntryKind::File, Some("fid".into()));

		let entry = tree.update(Path::new("/r/a"), None, 200, None).unwrap();
		assert_eq!(entry.mtime, 200);
		assert_eq!(entry.ino, Some(1));
		assert_eq!(entry.file_id.as_deref(), Some("fid"));

		let entry = tree.update(Path::new("/r/a"), Some(9), 300, None).unwrap();
		assert_eq!(entry.ino, Some(9));
	}

	#[test]
	fn recursive_remove_takes_descendants() {
		let tree = DirTree::new("/r", true);
		dir(&tree, "/r/d", 1);
		file(&tree, "/r/d/a", 2, 0);
		dir(&tree, "/r/d/sub", 3);
		file(&tree, "/r/d/sub/b", 4, 0);
		file(&tree, "/r/dx", 5, 0);

		tree.remove(Path::new("/r/d"));

		assert!(tree.find(Path::new("/r/d")).is_none());
		assert!(tree.find(Path::new("/r/d/a")).is_none());
		assert!(tree.find(Path::new("/r/d/sub/b")).is_none());
		// A sibling that merely shares the name prefix stays.
		assert!(tree.find(Path::new("/r/dx")).is_some());
	}

	#[test]
	fn non_recursive_remove_leaves_descendants() {
		let tree = DirTree::new("/r", false);
		dir(&tree, "/r/d", 1);
		file(&tree, "/r/d/a", 2, 0);

		tree.remove(Path::new("/r/d"));
		assert!(tree.find(Path::new("/r/d")).is_none());
		assert!(tree.find(Path::new("/r/d/a")).is_some());
	}

	#[test]
	fn cache_returns_same_tree_while_alive() {
		let a = DirTree::get_cached("/cache-shared", false);
		file(&a, "/cache-shared/x", 1, 0);

		let b = DirTree::get_cached("/cache-shared", false);
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(b.len(), 1);
	}

	#[test]
	fn cache_evicts_when_last_handle_drops() {
		let tree = DirTree::get_cached("/cache-evicted", false);
		file(&tree, "/cache-evicted/x", 1, 0);
		drop(tree);

		let fresh = DirTree::get_cached("/cache-evicted", false);
		assert!(fresh.is_empty());
		assert!(!fresh.is_complete());
	}

	#[test]
	fn diff_of_equal_trees_is_empty() {
		let current = DirTree::new("/r", false);
		let snapshot = DirTree::new("/r", false);
		for tree in [&current, &snapshot] {
			dir(tree, "/r", 1);
			file(tree, "/r/a", 2, 100);
			dir(tree, "/r/d", 3);
		}

		let events = EventList::new();
		current.changes_since(&snapshot, &events);
		assert_eq!(events.len(), 0);
	}

	#[test]
	fn diff_detects_rename_by_ino() {
		let current = DirTree::new("/r", false);
		file(&current, "/new", 42, 100);
		let snapshot = DirTree::new("/r", false);
		file(&snapshot, "/old", 42, 100);

		let events = EventList::new();
		current.changes_since(&snapshot, &events);

		let pending = events.get_events();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].path, Path::new("/new"));
		assert_eq!(pending[0].old_path.as_deref(), Some(Path::new("/old")));
		assert_eq!(pending[0].event_type(), EventType::Rename);
	}

	#[test]
	fn diff_prefers_file_id_over_ino() {
		let current = DirTree::new("/r", false);
		current.add("/new", Some(1), 100, EntryKind::File, Some("stable".into()));
		let snapshot = DirTree::new("/r", false);
		// Different inode (remount), same file id.
		snapshot.add("/old", Some(7), 100, EntryKind::File, Some("stable".into()));

		let events = EventList::new();
		current.changes_since(&snapshot, &events);

		let pending = events.get_events();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].old_path.as_deref(), Some(Path::new("/old")));
	}

	#[test]
	fn diff_directory_rename_moves_descendants_silently() {
		let current = DirTree::new("/", true);
		dir(&current, "/z", 1);
		file(&current, "/z/b", 2, 10);
		dir(&current, "/z/c", 3);
		file(&current, "/z/c/d", 4, 20);

		let snapshot = DirTree::new("/", true);
		dir(&snapshot, "/a", 1);
		file(&snapshot, "/a/b", 2, 10);
		dir(&snapshot, "/a/c", 3);
		file(&snapshot, "/a/c/d", 4, 20);

		let events = EventList::new();
		current.changes_since(&snapshot, &events);

		let pending = events.get_events();
		assert_eq!(pending.len(), 1, "descendants must move with the parent");
		assert_eq!(pending[0].path, Path::new("/z"));
		assert_eq!(pending[0].old_path.as_deref(), Some(Path::new("/a")));
		assert_eq!(pending[0].event_type(), EventType::Rename);
		assert!(pending[0].kind.is_dir());
	}

	#[test]
	fn diff_kind_change_is_remove_plus_create() {
		let current = DirTree::new("/r", false);
		dir(&current, "/p", 5);
		let snapshot = DirTree::new("/r", false);
		file(&snapshot, "/p", 5, 100);

		let events = EventList::new();
		current.changes_since(&snapshot, &events);

		// remove and create on the same path coalesce into one update.
		let pending = events.get_events();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].path, Path::new("/p"));
		assert_eq!(pending[0].event_type(), EventType::Update);
		assert!(pending[0].kind.is_dir());
	}

	#[test]
	fn diff_reports_new_modified_and_deleted_files() {
		let current = DirTree::new("/r", false);
		file(&current, "/r/new", 1, 10);
		file(&current, "/r/changed", 2, 99);
		let snapshot = DirTree::new("/r", false);
		file(&snapshot, "/r/changed", 2, 10);
		file(&snapshot, "/r/gone", 3, 10);

		let events = EventList::new();
		current.changes_since(&snapshot, &events);

		let pending = events.get_events();
		assert_eq!(pending.len(), 3);
		let by_path = |p: &str| {
			pending
				.iter()
				.find(|e| e.path == Path::new(p))
				.unwrap()
				.event_type()
		};
		assert_eq!(by_path("/r/new"), EventType::Create);
		assert_eq!(by_path("/r/changed"), EventType::Update);
		assert_eq!(by_path("/r/gone"), EventType::Delete);
	}

	#[test]
	fn diff_same_mtime_same_path_is_silent() {
		let current = DirTree::new("/r", false);
		file(&current, "/r/a", 1, 10);
		let snapshot = DirTree::new("/r", false);
		file(&snapshot, "/r/a", 1, 10);

		let events = EventList::new();
		current.changes_since(&snapshot, &events);
		assert!(events.is_empty());
	}

	#[test]
	fn diff_directory_mtime_change_is_silent() {
		let current = DirTree::new("/r", false);
		dir(&current, "/r/d", 1);
		let snapshot = DirTree::new("/r", false);
		snapshot.add("/r/d", Some(1), 555, EntryKind::Dir, None);

		let events = EventList::new();
		current.changes_since(&snapshot, &events);
		assert!(events.is_empty());
	}
}
