//! A single user-facing subscription.
//!
//! A [`Watcher`] pairs a root directory with an ignore set and the
//! [`EventList`] the backend fills on its behalf. The backend never owns a
//! watcher; it holds weak references and calls [`Watcher::notify`] once per
//! drained batch. Consumers either install a callback to receive each batch
//! as it is ready, or block on [`Watcher::wait`] and drain the list
//! themselves.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::event::{Event, EventList};

type EventCallback = Box<dyn Fn(Vec<Event>) + Send + Sync>;

pub struct Watcher {
	dir: PathBuf,
	ignore: HashSet<PathBuf>,
	events: EventList,
	callback: Option<EventCallback>,
	notified: Mutex<bool>,
	cond: Condvar,
}

impl Watcher {
	pub fn new(dir: impl Into<PathBuf>, ignore: HashSet<PathBuf>) -> Self {
		Self {
			dir: dir.into(),
			ignore,
			events: EventList::new(),
			callback: None,
			notified: Mutex::new(false),
			cond: Condvar::new(),
		}
	}

	/// Like [`Watcher::new`], but each notified batch is drained into
	/// `callback`. The callback runs on the backend's event thread and must
	/// not call back into the backend.
	pub fn with_callback(
		dir: impl Into<PathBuf>,
		ignore: HashSet<PathBuf>,
		callback: impl Fn(Vec<Event>) + Send + Sync + 'static,
	) -> Self {
		Self {
			callback: Some(Box::new(callback)),
			..Self::new(dir, ignore)
		}
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn events(&self) -> &EventList {
		&self.events
	}

	pub fn is_ignored(&self, path: &Path) -> bool {
		self.ignore.contains(path)
	}

	/// Announce that a batch of events is ready.
	pub fn notify(&self) {
		{
			let mut notified = self.notified.lock();
			*notified = true;
			self.cond.notify_all();
		}
		if let Some(callback) = &self.callback {
			callback(self.events.take());
		}
	}

	/// Block until the next [`Watcher::notify`], or until `timeout` elapses.
	/// Returns whether a notification arrived.
	pub fn wait(&self, timeout: Duration) -> bool {
		let mut notified = self.notified.lock();
		if !*notified {
			self.cond.wait_for(&mut notified, timeout);
		}
		std::mem::take(&mut *notified)
	}
}

impl fmt::Debug for Watcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Watcher")
			.field("dir", &self.dir)
			.field("ignore", &self.ignore)
			.field("pending_events", &self.events.len())
			.finish()
	}
}
