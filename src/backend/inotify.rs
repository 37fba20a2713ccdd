//! Inotify event translation.
//!
//! The kernel reports directory changes one watch descriptor at a time, with
//! a few quirks this module absorbs: moves arrive as two independent events
//! paired only by a cookie (and either half may never arrive), events on a
//! watched directory itself come as self-events without the directory flag,
//! and watches survive a rename of the directory they point at. A pending
//! move table with a timeout pairs what can be paired; everything else decays
//! into the create and delete events already emitted, and the snapshot differ
//! recovers renames after the fact.
//!
//! One dedicated thread owns the inotify descriptor, polling it together with
//! a self-pipe that signals shutdown.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::backend::mtime_ns;
use crate::error::{Error, Result};
use crate::tree::{DirTree, EntryKind};
use crate::watcher::Watcher;

const EVENT_BUFFER_SIZE: usize = 8192;
const POLL_TIMEOUT_MS: u16 = 500;

/// How long an unmatched move-from may sit in the pending table. Matches the
/// Watchman precedent.
const PENDING_MOVE_TTL: Duration = Duration::from_secs(5);

fn watch_mask() -> WatchMask {
	WatchMask::ATTRIB
		| WatchMask::CREATE
		| WatchMask::DELETE
		| WatchMask::DELETE_SELF
		| WatchMask::MODIFY
		| WatchMask::MOVE_SELF
		| WatchMask::MOVED_FROM
		| WatchMask::MOVED_TO
		| WatchMask::DONT_FOLLOW
		| WatchMask::ONLYDIR
		| WatchMask::EXCL_UNLINK
}

/// First half of a move, waiting for the cookie-matched second half.
struct PendingMove {
	path: PathBuf,
	created_at: Instant,
}

/// One kernel watch bound to one directory inside one watcher's tree.
///
/// The path is behind its own lock because a directory rename rewrites the
/// recorded paths of every subscription underneath it.
struct InotifySubscription {
	tree: Arc<DirTree>,
	path: Mutex<PathBuf>,
	watcher: Weak<Watcher>,
}

pub(super) struct BackendState {
	watches: Watches,
	// A descriptor maps to several subscriptions when watchers with
	// overlapping roots share a directory; the kernel hands back the same
	// descriptor for all of them.
	subscriptions: HashMap<WatchDescriptor, Vec<Arc<InotifySubscription>>>,
	pending_moves: HashMap<u32, PendingMove>,
}

/// Recursive directory watcher backed by inotify.
///
/// Dropping the backend writes to the self-pipe and joins the event thread.
pub struct InotifyBackend {
	state: Arc<Mutex<BackendState>>,
	pipe_write: OwnedFd,
	thread: Option<JoinHandle<()>>,
}

impl InotifyBackend {
	/// Create the kernel resources and spawn the event loop thread.
	pub fn start() -> Result<Self> {
		let (pipe_read, pipe_write) = unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
			.map_err(|errno| Error::System {
				call: "pipe2",
				source: errno.into(),
			})?;
		let inotify = Inotify::init().map_err(|source| Error::System {
			call: "inotify_init1",
			source,
		})?;

		let state = Arc::new(Mutex::new(BackendState {
			watches: inotify.watches(),
			subscriptions: HashMap::new(),
			pending_moves: HashMap::new(),
		}));

		let loop_state = Arc::clone(&state);
		let thread = thread::Builder::new()
			.name("treewatch-inotify".into())
			.spawn(move || event_loop(inotify, pipe_read, loop_state))
			.map_err(|source| Error::System {
				call: "thread spawn",
				source,
			})?;

		debug!("inotify backend started");
		Ok(Self {
			state,
			pipe_write,
			thread: Some(thread),
		})
	}

	pub(super) fn state(&self) -> MutexGuard<'_, BackendState> {
		self.state.lock()
	}

	/// Begin live watching for `watcher`.
	///
	/// Builds (or reuses) the shared directory tree for the watcher's root
	/// and registers a kernel watch on every directory in it. The first
	/// registration failure aborts the subscribe; already registered watches
	/// stay in place until [`InotifyBackend::unsubscribe`].
	pub fn subscribe(&self, watcher: &Arc<Watcher>) -> Result<()> {
		let mut state = self.state();
		let tree = super::tree_for(watcher)?;

		for entry in tree.entries() {
			if entry.kind.is_dir() {
				watch_dir(&mut state, watcher, entry.path, &tree)?;
			}
		}
		debug!(dir = %watcher.dir().display(), "subscribed");
		Ok(())
	}

	/// Stop live watching for `watcher`.
	///
	/// Removes this watcher's subscription records and drops each kernel
	/// watch no other watcher still needs. Safe to call again after it
	/// succeeded; a second call finds nothing to remove.
	pub fn unsubscribe(&self, watcher: &Arc<Watcher>) {
		let mut state = self.state();
		let target = Arc::as_ptr(watcher);

		let mut orphaned = Vec::new();
		for (wd, subs) in state.subscriptions.iter_mut() {
			subs.retain(|sub| sub.watcher.as_ptr() != target);
			if subs.is_empty() {
				orphaned.push(wd.clone());
			}
		}

		for wd in orphaned {
			state.subscriptions.remove(&wd);
			if let Err(err) = state.watches.remove(wd) {
				// The kernel reaps watches on deleted directories by itself;
				// the descriptor may already be gone.
				debug!("inotify_rm_watch failed: {err}");
			}
		}
		debug!(dir = %watcher.dir().display(), "unsubscribed");
	}
}

impl Drop for InotifyBackend {
	fn drop(&mut self) {
		if let Err(errno) = unistd::write(&self.pipe_write, b"x") {
			error!("unable to signal event loop shutdown: {errno}");
		}
		if let Some(thread) = self.thread.take() {
			if thread.join().is_err() {
				error!("inotify event loop thread panicked");
			}
		}
	}
}

/// Register a kernel watch on `path` and record the subscription.
fn watch_dir(
	state: &mut BackendState,
	watcher: &Arc<Watcher>,
	path: PathBuf,
	tree: &Arc<DirTree>,
) -> Result<()> {
	let wd = state
		.watches
		.add(&path, watch_mask())
		.map_err(|source| Error::Watch {
			path: path.clone(),
			source,
		})?;
	trace!(path = %path.display(), "watching directory");

	let sub = Arc::new(InotifySubscription {
		tree: Arc::clone(tree),
		path: Mutex::new(path),
		watcher: Arc::downgrade(watcher),
	});
	state.subscriptions.entry(wd).or_default().push(sub);
	Ok(())
}

fn is_subscribed(state: &BackendState, watcher: &Arc<Watcher>, path: &Path) -> bool {
	let target = Arc::as_ptr(watcher);
	state
		.subscriptions
		.values()
		.flatten()
		.any(|sub| sub.watcher.as_ptr() == target && sub.path.lock().as_path() == path)
}

/// Watch a directory that appeared inside a live subscription, then pick up
/// anything already inside it.
///
/// A directory moved in from outside arrives with contents that never produce
/// events of their own, so the children are enumerated here: recorded in the
/// tree, reported as creates, and watched in turn. For a directory that was
/// just created empty this finds nothing and the per-child events do the
/// work.
fn watch_new_directory(
	state: &mut BackendState,
	watcher: &Arc<Watcher>,
	path: &Path,
	tree: &Arc<DirTree>,
) -> Result<()> {
	if !is_subscribed(state, watcher, path) {
		watch_dir(state, watcher, path.to_path_buf(), tree)?;
	}

	let Ok(dirents) = fs::read_dir(path) else {
		return Ok(());
	};
	for dirent in dirents.flatten() {
		let child = dirent.path();
		if watcher.is_ignored(&child) {
			continue;
		}
		let Ok(meta) = fs::symlink_metadata(&child) else {
			continue;
		};
		let kind = if meta.file_type().is_dir() {
			EntryKind::Dir
		} else {
			EntryKind::File
		};
		if tree.find(&child).is_none() {
			let entry = tree.add(child.clone(), Some(meta.ino()), mtime_ns(&meta), kind, None);
			watcher.events().create(&child, entry.kind, entry.ino, None);
		}
		if kind.is_dir() {
			watch_new_directory(state, watcher, &child, tree)?;
		}
	}
	Ok(())
}

fn event_loop(mut inotify: Inotify, pipe_read: OwnedFd, state: Arc<Mutex<BackendState>>) {
	let mut buffer = [0u8; EVENT_BUFFER_SIZE];

	loop {
		// Safety: the descriptor stays open for as long as `inotify` lives,
		// which spans this whole function.
		let inotify_fd = unsafe { BorrowedFd::borrow_raw(inotify.as_raw_fd()) };
		let mut fds = [
			PollFd::new(pipe_read.as_fd(), PollFlags::POLLIN),
			PollFd::new(inotify_fd, PollFlags::POLLIN),
		];

		match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
			Ok(_) => {}
			Err(Errno::EINTR) => continue,
			Err(errno) => {
				error!("poll failed: {errno}");
				break;
			}
		}

		let ready = |idx: usize| {
			fds[idx]
				.revents()
				.map_or(false, |revents| !revents.is_empty())
		};
		if ready(0) {
			break;
		}
		if ready(1) {
			handle_events(&mut inotify, &mut buffer, &state);
		}
	}

	debug!("inotify event loop stopped");
}

/// Drain every event the kernel has queued, then sweep stale pending moves
/// and notify each touched watcher once.
fn handle_events(inotify: &mut Inotify, buffer: &mut [u8], state: &Mutex<BackendState>) {
	let mut touched: Vec<Arc<Watcher>> = Vec::new();

	loop {
		let events = match inotify.read_events(buffer) {
			Ok(events) => events,
			Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
			Err(err) => {
				error!("error reading from inotify: {err}");
				break;
			}
		};

		let now = Instant::now();
		let mut drained_any = false;
		for event in events {
			drained_any = true;
			if event.mask.contains(EventMask::Q_OVERFLOW) {
				// Nothing useful can be reported here; recovery is a rescan
				// or a snapshot diff at a higher layer.
				warn!("inotify event queue overflowed");
				continue;
			}
			handle_event(state, &event, now, &mut touched);
		}
		if !drained_any {
			break;
		}
	}

	{
		let mut state = state.lock();
		state
			.pending_moves
			.retain(|_, pending| pending.created_at.elapsed() < PENDING_MOVE_TTL);
	}

	for watcher in touched {
		watcher.notify();
	}
}

fn handle_event(
	state_mutex: &Mutex<BackendState>,
	event: &inotify::Event<&OsStr>,
	now: Instant,
	touched: &mut Vec<Arc<Watcher>>,
) {
	let mut state = state_mutex.lock();

	let subs = match state.subscriptions.get(&event.wd) {
		Some(subs) => subs.clone(),
		None => return,
	};

	for sub in subs {
		if let Some(watcher) = handle_subscription(&mut state, event, now, &sub) {
			if !touched.iter().any(|known| Arc::ptr_eq(known, &watcher)) {
				touched.push(watcher);
			}
		}
	}
}

/// Apply one kernel event to one subscription. Returns the watcher to notify
/// when the event produced anything observable.
fn handle_subscription(
	state: &mut BackendState,
	event: &inotify::Event<&OsStr>,
	now: Instant,
	sub: &InotifySubscription,
) -> Option<Arc<Watcher>> {
	let watcher = sub.watcher.upgrade()?;

	let mut path = sub.path.lock().clone();
	if let Some(name) = event.name {
		path.push(name);
	}
	let kind = if event.mask.contains(EventMask::ISDIR) {
		EntryKind::Dir
	} else {
		EntryKind::File
	};

	if watcher.is_ignored(&path) {
		return None;
	}
	trace!(path = %path.display(), mask = ?event.mask, "kernel event");

	if event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
		// lstat, not stat: a symlink's target may be unwatchable and must not
		// be confused with the link itself.
		let meta = fs::symlink_metadata(&path).ok();
		let ino = meta.as_ref().map(MetadataExt::ino);
		let mtime = meta.as_ref().map(mtime_ns).unwrap_or(0);
		let kind = match &meta {
			Some(meta) if meta.file_type().is_dir() => EntryKind::Dir,
			Some(_) | None => kind,
		};

		let entry = sub.tree.add(path.clone(), ino, mtime, kind, None);

		if let Some(pending) = state.pending_moves.remove(&event.cookie) {
			if entry.kind.is_dir() {
				// The kernel keeps watch descriptors alive across a rename of
				// the directory they point at; the recorded paths must follow.
				for subs in state.subscriptions.values() {
					for other in subs {
						let mut sub_path = other.path.lock();
						if sub_path.as_path() == pending.path
							|| !sub_path.starts_with(&pending.path)
						{
							continue;
						}
						let rest = sub_path
							.strip_prefix(&pending.path)
							.ok()
							.map(Path::to_path_buf);
						if let Some(rest) = rest {
							*sub_path = path.join(rest);
						}
					}
				}
			}
		}

		// For a paired move the move-from half already recorded a delete at
		// the old path, so the pair surfaces as delete plus create; the
		// snapshot diff is what recovers true renames.
		watcher
			.events()
			.create(&path, entry.kind, entry.ino, entry.file_id.as_deref());

		if entry.kind.is_dir() {
			if let Err(err) = watch_new_directory(state, &watcher, &path, &sub.tree) {
				warn!(path = %path.display(), "unable to watch new directory: {err}");
				sub.tree.remove(&path);
				return None;
			}
		}
	} else if event.mask.intersects(EventMask::MODIFY | EventMask::ATTRIB) {
		let meta = fs::metadata(&path).ok();
		let ino = meta.as_ref().map(MetadataExt::ino);
		let mtime = meta.as_ref().map(mtime_ns).unwrap_or(0);

		watcher.events().update(&path, ino, None);
		sub.tree.update(&path, ino, mtime, None);
	} else if event.mask.intersects(
		EventMask::DELETE | EventMask::DELETE_SELF | EventMask::MOVED_FROM | EventMask::MOVE_SELF,
	) {
		let is_self_event = event
			.mask
			.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF);

		// A self-event below the root duplicates the event the parent watch
		// already delivered.
		if is_self_event && path.as_path() != watcher.dir() {
			return None;
		}

		if event.mask.contains(EventMask::MOVED_FROM) {
			state.pending_moves.insert(
				event.cookie,
				PendingMove {
					path: path.clone(),
					created_at: now,
				},
			);
		}

		// Self-events never carry the directory flag.
		if is_self_event || kind.is_dir() {
			state.subscriptions.retain(|_, subs| {
				subs.retain(|stale| stale.path.lock().as_path() != path);
				!subs.is_empty()
			});
		}

		let ino = sub.tree.find(&path).and_then(|entry| entry.ino);
		let kind = if is_self_event { EntryKind::Dir } else { kind };
		watcher.events().remove(&path, kind, ino, None);
		sub.tree.remove(&path);
	}

	Some(watcher)
}
