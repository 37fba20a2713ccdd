//! Snapshot text format.
//!
//! A snapshot is a single UTF-8 stream: an entry count on its own line, then
//! one line per entry of the form
//!
//! ```text
//! <pathLen><path><mtime> <isDir> <ino> <fileId> \n
//! ```
//!
//! The path length is written in decimal and the path bytes follow with no
//! delimiter, so paths may contain spaces. `0` stands for an unknown inode and
//! an empty token for an unknown file id; the trailing space before the
//! newline is part of the format. Readers tolerate truncated entries by
//! leaving the missing trailing fields at their defaults, which keeps old
//! snapshots written before the identity fields existed readable.

use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::tree::{DirEntry, DirTree, EntryKind};

/// Serialize every entry of `tree` to `out`.
pub(crate) fn write_tree<W: Write>(tree: &DirTree, out: &mut W) -> io::Result<()> {
	let entries = tree.entries();
	writeln!(out, "{}", entries.len())?;
	for entry in &entries {
		write_entry(entry, out)?;
	}
	Ok(())
}

fn write_entry<W: Write>(entry: &DirEntry, out: &mut W) -> io::Result<()> {
	let path = entry.path.as_os_str().as_bytes();
	write!(out, "{}", path.len())?;
	out.write_all(path)?;
	// The trailing space is significant: it marks the file id field as
	// present even when the id itself is empty.
	write!(
		out,
		"{} {} {} {} \n",
		entry.mtime,
		entry.kind.is_dir() as u8,
		entry.ino.unwrap_or(0),
		entry.file_id.as_deref().unwrap_or(""),
	)
}

/// Parse a snapshot stream into a tree rooted at `root`.
///
/// The tree comes back marked complete. Entries that end early are dropped at
/// the point of truncation; fields missing from an otherwise readable entry
/// stay at their unknown defaults.
pub(crate) fn read_tree<R: Read>(
	root: impl Into<PathBuf>,
	recursive_remove: bool,
	reader: &mut R,
) -> io::Result<DirTree> {
	let mut buf = Vec::new();
	reader.read_to_end(&mut buf)?;

	let tree = DirTree::new(root, recursive_remove);
	let mut cursor = Cursor::new(&buf);
	let count = cursor.read_uint().unwrap_or(0);
	for _ in 0..count {
		let Some(entry) = read_entry(&mut cursor) else {
			break;
		};
		tree.add(entry.path.clone(), entry.ino, entry.mtime, entry.kind, entry.file_id);
	}
	tree.set_complete();
	Ok(tree)
}

fn read_entry(cursor: &mut Cursor<'_>) -> Option<DirEntry> {
	let len = cursor.read_uint()? as usize;
	let path = PathBuf::from(OsStr::from_bytes(cursor.read_bytes(len)?));

	// The mtime digits follow the path bytes with no separator; the known
	// path length is what makes that unambiguous.
	let mtime = cursor.read_uint().unwrap_or(0);
	let kind = if cursor.read_uint().unwrap_or(0) != 0 {
		EntryKind::Dir
	} else {
		EntryKind::File
	};

	let mut ino = None;
	let mut file_id = None;
	if cursor.more_on_line() {
		ino = cursor.read_uint().filter(|&ino| ino != 0);
	}
	if cursor.more_on_line() {
		file_id = cursor
			.read_token()
			.map(|token| String::from_utf8_lossy(token).into_owned())
			.filter(|token| !token.is_empty());
	}
	cursor.skip_line();

	Some(DirEntry {
		path,
		ino,
		mtime,
		kind,
		file_id,
	})
}

struct Cursor<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Cursor<'a> {
	fn new(buf: &'a [u8]) -> Self {
		Self { buf, pos: 0 }
	}

	fn peek(&self) -> Option<u8> {
		self.buf.get(self.pos).copied()
	}

	fn skip_whitespace(&mut self) {
		while matches!(self.peek(), Some(b' ') | Some(b'\n') | Some(b'\r') | Some(b'\t')) {
			self.pos += 1;
		}
	}

	fn read_uint(&mut self) -> Option<u64> {
		self.skip_whitespace();
		let start = self.pos;
		let mut value: u64 = 0;
		while let Some(byte @ b'0'..=b'9') = self.peek() {
			value = value.wrapping_mul(10).wrapping_add(u64::from(byte - b'0'));
			self.pos += 1;
		}
		(self.pos > start).then_some(value)
	}

	fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
		let bytes = self.buf.get(self.pos..self.pos + len)?;
		self.pos += len;
		Some(bytes)
	}

	fn read_token(&mut self) -> Option<&'a [u8]> {
		self.skip_whitespace();
		let start = self.pos;
		while matches!(self.peek(), Some(byte) if byte != b' ' && byte != b'\n') {
			self.pos += 1;
		}
		(self.pos > start).then(|| &self.buf[start..self.pos])
	}

	/// Skip spaces and report whether anything besides a newline remains on
	/// the current line. At end of input there is nothing more to read.
	fn more_on_line(&mut self) -> bool {
		while self.peek() == Some(b' ') {
			self.pos += 1;
		}
		!matches!(self.peek(), Some(b'\n') | None)
	}

	fn skip_line(&mut self) {
		while let Some(byte) = self.peek() {
			self.pos += 1;
			if byte == b'\n' {
				break;
			}
		}
	}
}
