//! Coalesced event list.
//!
//! An [`EventList`] holds the semantic events a watcher has accumulated since
//! its consumer last drained it. It is not a log of what happened: rapidly
//! repeated filesystem transitions are squashed into the minimal final set a
//! consumer needs to learn. A file that is created and deleted between two
//! flushes produces no event at all; a file that is deleted and immediately
//! recreated produces a single update.
//!
//! The list keeps at most one event per path. Events appear in the order each
//! path was first observed; later observations mutate the existing event in
//! place without moving it.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::tree::EntryKind;

/// One pending semantic event for a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
	pub path: PathBuf,
	/// Set only when the entry arrived at `path` through a rename.
	pub old_path: Option<PathBuf>,
	pub ino: Option<u64>,
	pub file_id: Option<String>,
	pub kind: EntryKind,
	pub(crate) is_created: bool,
	pub(crate) is_deleted: bool,
}

impl Event {
	fn new(path: PathBuf, kind: EntryKind, ino: Option<u64>, file_id: Option<String>) -> Self {
		Self {
			path,
			old_path: None,
			ino,
			file_id,
			kind,
			is_created: false,
			is_deleted: false,
		}
	}

	fn is_renamed(&self) -> bool {
		!self.is_created && !self.is_deleted && self.old_path.is_some()
	}

	/// The final classification a consumer sees for this event.
	pub fn event_type(&self) -> EventType {
		if self.is_renamed() {
			EventType::Rename
		} else if self.is_created {
			EventType::Create
		} else if self.is_deleted {
			EventType::Delete
		} else {
			EventType::Update
		}
	}
}

/// Classification of a coalesced [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
	Create,
	Update,
	Delete,
	Rename,
}

impl EventType {
	pub fn as_str(self) -> &'static str {
		match self {
			EventType::Create => "create",
			EventType::Update => "update",
			EventType::Delete => "delete",
			EventType::Rename => "rename",
		}
	}
}

impl std::fmt::Display for EventType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Mutex-guarded ordered sequence of pending events, one per path.
#[derive(Debug, Default)]
pub struct EventList {
	events: Mutex<Vec<Event>>,
}

impl EventList {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record that `path` came into existence.
	///
	/// A delete observed earlier for the same path collapses with this into a
	/// single update, since the consumer never saw the gap.
	pub fn create(&self, path: &Path, kind: EntryKind, ino: Option<u64>, file_id: Option<&str>) {
		let mut events = self.events.lock();
		let idx = internal_update(&mut events, path, kind, ino, file_id);
		let event = &mut events[idx];
		if event.is_deleted {
			event.is_deleted = false;
		} else {
			event.is_created = true;
		}
	}

	/// Record a content or metadata change at `path`.
	pub fn update(&self, path: &Path, ino: Option<u64>, file_id: Option<&str>) {
		let mut events = self.events.lock();
		internal_update(&mut events, path, EntryKind::File, ino, file_id);
	}

	/// Record that `path` went away.
	///
	/// An event still flagged as created is erased outright: the entry's whole
	/// lifetime fell between two flushes and the consumer needs nothing.
	pub fn remove(&self, path: &Path, kind: EntryKind, ino: Option<u64>, file_id: Option<&str>) {
		let mut events = self.events.lock();
		let idx = internal_update(&mut events, path, kind, ino, file_id);
		if events[idx].is_created {
			events.remove(idx);
		} else {
			events[idx].is_deleted = true;
		}
	}

	/// Record that `old_path` moved to `path`.
	///
	/// Chained renames collapse: after `rename(a, b)` and `rename(b, c)` the
	/// list holds one event at `c` whose `old_path` is `a`.
	pub fn rename(
		&self,
		old_path: &Path,
		path: &Path,
		kind: EntryKind,
		ino: Option<u64>,
		file_id: Option<&str>,
	) {
		let mut events = self.events.lock();

		// Whatever sat at the destination is being overwritten; collapse it
		// the same way `remove` would.
		if let Some(idx) = position(&events, path) {
			if events[idx].is_created {
				events.remove(idx);
			} else {
				events[idx].is_deleted = true;
			}
		}

		match position(&events, old_path) {
			Some(idx) => {
				let old_event = events.remove(idx);
				let mut event = Event::new(
					path.to_path_buf(),
					kind,
					ino.or(old_event.ino),
					file_id.map(str::to_owned).or(old_event.file_id),
				);
				event.old_path =
					Some(old_event.old_path.unwrap_or_else(|| old_path.to_path_buf()));
				events.push(event);
			}
			None => {
				// The source was never observed, so the move cannot be
				// presented as a rename. Treat the destination like a create,
				// or an update when it overwrote a deleted entry.
				let idx = internal_update(&mut events, path, kind, ino, file_id);
				let event = &mut events[idx];
				if event.is_deleted {
					event.is_deleted = false;
				} else {
					event.is_created = true;
				}
			}
		}
	}

	pub fn len(&self) -> usize {
		self.events.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.events.lock().is_empty()
	}

	/// Clone the pending events without draining them.
	pub fn get_events(&self) -> Vec<Event> {
		self.events.lock().clone()
	}

	/// Drain the pending events, leaving the list empty.
	pub fn take(&self) -> Vec<Event> {
		std::mem::take(&mut *self.events.lock())
	}

	pub fn clear(&self) {
		self.events.lock().clear();
	}
}

fn position(events: &[Event], path: &Path) -> Option<usize> {
	events.iter().position(|event| event.path == path)
}

/// Find or insert the event for `path`, folding in any known identity.
///
/// `ino` and `file_id` only overwrite when the caller actually knows them;
/// the kind is taken from the latest observation unconditionally.
fn internal_update(
	events: &mut Vec<Event>,
	path: &Path,
	kind: EntryKind,
	ino: Option<u64>,
	file_id: Option<&str>,
) -> usize {
	match position(events, path) {
		Some(idx) => {
			let event = &mut events[idx];
			if let Some(ino) = ino {
				event.ino = Some(ino);
			}
			if let Some(file_id) = file_id {
				event.file_id = Some(file_id.to_owned());
			}
			event.kind = kind;
			idx
		}
		None => {
			events.push(Event::new(
				path.to_path_buf(),
				kind,
				ino,
				file_id.map(str::to_owned),
			));
			events.len() - 1
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn path(s: &str) -> &Path {
		Path::new(s)
	}

	#[test]
	fn rapid_create_then_remove_cancels_out() {
		let events = EventList::new();
		events.create(path("/a/b"), EntryKind::File, Some(7), None);
		events.remove(path("/a/b"), EntryKind::File, Some(7), None);
		assert_eq!(events.len(), 0);
	}

	#[test]
	fn remove_then_create_becomes_update() {
		let events = EventList::new();
		events.remove(path("/a/b"), EntryKind::File, Some(7), None);
		events.create(path("/a/b"), EntryKind::File, Some(7), None);

		let pending = events.get_events();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].event_type(), EventType::Update);
	}

	#[test]
	fn at_most_one_event_per_path() {
		let events = EventList::new();
		events.create(path("/x"), EntryKind::File, Some(1), None);
		events.update(path("/x"), Some(1), None);
		events.update(path("/x"), None, None);
		events.remove(path("/x"), EntryKind::File, Some(1), None);
		events.create(path("/x"), EntryKind::File, Some(2), None);

		let pending = events.get_events();
		assert_eq!(pending.iter().filter(|e| e.path == path("/x")).count(), 1);
	}

	#[test]
	fn chained_renames_collapse_to_one() {
		let events = EventList::new();
		events.update(path("/a"), Some(3), None);
		events.rename(path("/a"), path("/b"), EntryKind::File, None, None);
		events.rename(path("/b"), path("/c"), EntryKind::File, None, None);

		let pending = events.get_events();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].path, path("/c"));
		assert_eq!(pending[0].old_path.as_deref(), Some(path("/a")));
		assert_eq!(pending[0].event_type(), EventType::Rename);
		assert_eq!(pending[0].ino, Some(3));
	}

	#[test]
	fn rename_of_unseen_source_is_a_create() {
		let events = EventList::new();
		events.rename(path("/gone"), path("/fresh"), EntryKind::File, Some(5), None);

		let pending = events.get_events();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].path, path("/fresh"));
		assert_eq!(pending[0].event_type(), EventType::Create);
	}

	#[test]
	fn rename_onto_deleted_entry_is_an_update() {
		let events = EventList::new();
		events.remove(path("/target"), EntryKind::File, Some(9), None);
		events.rename(path("/gone"), path("/target"), EntryKind::File, None, None);

		let pending = events.get_events();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].event_type(), EventType::Update);
	}

	#[test]
	fn rename_overwriting_created_entry_drops_it() {
		let events = EventList::new();
		events.create(path("/target"), EntryKind::File, Some(1), None);
		events.update(path("/source"), Some(2), None);
		events.rename(path("/source"), path("/target"), EntryKind::File, Some(2), None);

		let pending = events.get_events();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].path, path("/target"));
		assert_eq!(pending[0].old_path.as_deref(), Some(path("/source")));
		assert_eq!(pending[0].ino, Some(2));
	}

	#[test]
	fn atomic_replace_yields_single_create() {
		// The sequence the kernel translator produces for `write tmp; mv tmp x`.
		let events = EventList::new();
		events.create(path("/tmp/x.tmp"), EntryKind::File, Some(10), None);
		events.remove(path("/tmp/x.tmp"), EntryKind::File, Some(10), None);
		events.create(path("/tmp/x"), EntryKind::File, Some(10), None);

		let pending = events.get_events();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].path, path("/tmp/x"));
		assert_eq!(pending[0].event_type(), EventType::Create);
	}

	#[test]
	fn update_does_not_disturb_created_flag() {
		let events = EventList::new();
		events.create(path("/new"), EntryKind::File, Some(4), None);
		events.update(path("/new"), Some(4), None);

		let pending = events.get_events();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].event_type(), EventType::Create);
	}

	#[test]
	fn take_drains_the_list() {
		let events = EventList::new();
		events.create(path("/a"), EntryKind::File, None, None);
		assert_eq!(events.take().len(), 1);
		assert!(events.is_empty());
	}

	#[test]
	fn identity_only_overwritten_when_known() {
		let events = EventList::new();
		events.create(path("/a"), EntryKind::File, Some(11), Some("id-1"));
		events.update(path("/a"), None, None);

		let pending = events.get_events();
		assert_eq!(pending[0].ino, Some(11));
		assert_eq!(pending[0].file_id.as_deref(), Some("id-1"));
	}
}
