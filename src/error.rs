//! Error types for the watcher core.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for watcher operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while watching or snapshotting a directory tree
#[derive(Debug, Error)]
pub enum Error {
	/// A system call the backend cannot run without failed
	#[error("{call} failed: {source}")]
	System {
		call: &'static str,
		#[source]
		source: io::Error,
	},

	/// Registering a kernel watch on a directory failed
	#[error("unable to watch '{}': {source}", path.display())]
	Watch {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	/// IO error
	#[error("IO error: {0}")]
	Io(#[from] io::Error),
}
